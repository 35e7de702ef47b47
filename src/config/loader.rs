//! Configuration Loader
//!
//! Loads and validates configuration from TOML files. Every section except
//! `[chain]` may be omitted and falls back to defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy_primitives::{Address, U256};
use serde::Deserialize;
use thiserror::Error;

use crate::adapters::chain::{RetryPolicy, SettlePolicy};
use crate::adapters::price_oracle::{DEFAULT_NETWORK, DEFAULT_PRICE_API_URL};
use crate::domain::sizing::{DEFAULT_FRACTION_BPS, DEFAULT_MIN_BALANCE};
use crate::domain::{FixedPoolSizing, LiveBalanceSizing, SizingPolicy, TradeRules};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub chain: ChainSection,
    #[serde(default)]
    pub trading: TradingSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub persistence: PersistenceSection,
    #[serde(default)]
    pub reconcile: ReconcileSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub oracle: OracleSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Chain configuration section
#[derive(Debug, Clone, Deserialize)]
pub struct ChainSection {
    /// The protocol's base token every pair trades against
    pub base_token: Address,
}

/// How new positions are sized
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingKind {
    /// Fraction of the balance at the moment of entry
    #[default]
    LiveBalance,
    /// Fraction of the first balance seen this session
    FixedPool,
}

/// Trading rules section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradingSection {
    /// Take profit above entry, in percent
    pub take_profit_pct: u32,
    /// Stop loss below entry, in percent
    pub stop_loss_pct: u32,
    /// Maximum simultaneously open positions
    pub max_open_positions: usize,
    /// Share of the base balance committed per position, in basis points
    pub position_fraction_bps: u32,
    /// Minimum base balance (raw units, decimal string) required to trade
    #[serde(with = "crate::domain::agent::u256_decimal")]
    pub min_base_balance: U256,
    pub sizing: SizingKind,
}

impl Default for TradingSection {
    fn default() -> Self {
        let rules = TradeRules::default();
        Self {
            take_profit_pct: rules.take_profit_pct,
            stop_loss_pct: rules.stop_loss_pct,
            max_open_positions: crate::domain::position::DEFAULT_MAX_OPEN_POSITIONS,
            position_fraction_bps: DEFAULT_FRACTION_BPS,
            min_base_balance: U256::from(DEFAULT_MIN_BALANCE),
            sizing: SizingKind::default(),
        }
    }
}

impl TradingSection {
    pub fn rules(&self) -> TradeRules {
        TradeRules {
            take_profit_pct: self.take_profit_pct,
            stop_loss_pct: self.stop_loss_pct,
        }
    }

    pub fn sizing_policy(&self) -> Box<dyn SizingPolicy> {
        match self.sizing {
            SizingKind::LiveBalance => Box::new(LiveBalanceSizing {
                fraction_bps: self.position_fraction_bps,
                min_balance: self.min_base_balance,
            }),
            SizingKind::FixedPool => Box::new(FixedPoolSizing::new(
                self.position_fraction_bps,
                self.min_base_balance,
            )),
        }
    }
}

/// Remote query retry section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub metadata_attempts: u32,
    pub transaction_attempts: u32,
    /// First backoff delay, doubled after each failure
    pub initial_delay_ms: u64,
    /// Total fetches while waiting for non-zero token data
    pub settle_attempts: u32,
    pub settle_interval_ms: u64,
    /// Overall bound per remote call (0 = unbounded)
    pub deadline_secs: u64,
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            metadata_attempts: crate::adapters::chain::DEFAULT_METADATA_ATTEMPTS,
            transaction_attempts: crate::adapters::chain::DEFAULT_TRANSACTION_ATTEMPTS,
            initial_delay_ms: crate::adapters::chain::DEFAULT_INITIAL_DELAY_MS,
            settle_attempts: crate::adapters::chain::DEFAULT_SETTLE_ATTEMPTS,
            settle_interval_ms: crate::adapters::chain::DEFAULT_SETTLE_INTERVAL_MS,
            deadline_secs: 120,
            jitter: false,
        }
    }
}

impl RetrySection {
    fn deadline(&self) -> Option<Duration> {
        (self.deadline_secs > 0).then(|| Duration::from_secs(self.deadline_secs))
    }

    fn policy(&self, max_attempts: u32) -> RetryPolicy {
        RetryPolicy::metadata()
            .with_max_attempts(max_attempts)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_deadline(self.deadline())
            .with_jitter(self.jitter)
    }

    pub fn metadata_policy(&self) -> RetryPolicy {
        self.policy(self.metadata_attempts)
    }

    pub fn transaction_policy(&self) -> RetryPolicy {
        self.policy(self.transaction_attempts)
    }

    pub fn settle_policy(&self) -> SettlePolicy {
        SettlePolicy {
            attempts: self.settle_attempts,
            interval: Duration::from_millis(self.settle_interval_ms),
        }
    }
}

/// Persistence section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceSection {
    /// Directory holding the snapshot files (`~` is expanded)
    pub data_dir: String,
    pub autosave_interval_secs: u64,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            autosave_interval_secs: 600,
        }
    }
}

impl PersistenceSection {
    /// Get data directory with environment variable override
    /// Checks AGENT_DATA_DIR env var first, falls back to config value
    pub fn get_data_dir(&self) -> PathBuf {
        let raw = std::env::var("AGENT_DATA_DIR").unwrap_or_else(|_| self.data_dir.clone());
        PathBuf::from(shellexpand::tilde(&raw).to_string())
    }
}

/// Background reconciliation section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileSection {
    /// How often unresolved launches are retried
    pub unresolved_interval_secs: u64,
    /// Unresolved launches retried per pass
    pub unresolved_batch_size: usize,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self {
            unresolved_interval_secs: 300,
            unresolved_batch_size: 25,
        }
    }
}

/// Event loop section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Seconds a per-token worker waits for work before exiting
    pub worker_idle_secs: u64,
    /// How often idle workers are pruned and subscriptions checked
    pub housekeeping_interval_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            worker_idle_secs: crate::application::dispatch::DEFAULT_WORKER_IDLE_SECS,
            housekeeping_interval_secs: 30,
        }
    }
}

/// Base token price oracle section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OracleSection {
    pub enabled: bool,
    pub api_url: String,
    pub api_key: Option<String>,
    pub network: String,
}

impl Default for OracleSection {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: DEFAULT_PRICE_API_URL.to_string(),
            api_key: None,
            network: DEFAULT_NETWORK.to_string(),
        }
    }
}

impl OracleSection {
    /// Get API key with environment variable fallback
    /// Checks PRICE_API_KEY env var if config value is empty/None
    pub fn get_api_key(&self) -> Option<String> {
        if let Some(ref key) = self.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        std::env::var("PRICE_API_KEY").ok().filter(|k| !k.is_empty())
    }
}

/// Logging configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Failed to initialize logging: {0}")]
    LoggingError(String),
}

/// Load configuration from a TOML file.
///
/// A `.env` file next to the working directory is loaded first so
/// secrets can stay out of the TOML.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    dotenvy::dotenv().ok();
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate chain section
        if self.chain.base_token == Address::ZERO {
            return Err(ConfigError::ValidationError(
                "base_token cannot be the zero address".to_string(),
            ));
        }

        // Validate trading section
        if self.trading.take_profit_pct == 0 || self.trading.take_profit_pct > 1_000 {
            return Err(ConfigError::ValidationError(format!(
                "take_profit_pct must be 1-1000, got {}",
                self.trading.take_profit_pct
            )));
        }

        if self.trading.stop_loss_pct == 0 || self.trading.stop_loss_pct > 99 {
            return Err(ConfigError::ValidationError(format!(
                "stop_loss_pct must be 1-99, got {}",
                self.trading.stop_loss_pct
            )));
        }

        if self.trading.max_open_positions == 0 {
            return Err(ConfigError::ValidationError(
                "max_open_positions must be > 0".to_string(),
            ));
        }

        if self.trading.position_fraction_bps == 0 || self.trading.position_fraction_bps > 10_000 {
            return Err(ConfigError::ValidationError(format!(
                "position_fraction_bps must be 1-10000, got {}",
                self.trading.position_fraction_bps
            )));
        }

        // Validate retry section
        if self.retry.metadata_attempts == 0
            || self.retry.transaction_attempts == 0
            || self.retry.settle_attempts == 0
        {
            return Err(ConfigError::ValidationError(
                "retry attempts must be > 0".to_string(),
            ));
        }

        if self.retry.initial_delay_ms == 0 {
            return Err(ConfigError::ValidationError(
                "initial_delay_ms must be > 0".to_string(),
            ));
        }

        // Validate intervals
        if self.persistence.autosave_interval_secs == 0
            || self.reconcile.unresolved_interval_secs == 0
            || self.engine.housekeeping_interval_secs == 0
            || self.engine.worker_idle_secs == 0
        {
            return Err(ConfigError::ValidationError(
                "intervals must be > 0".to_string(),
            ));
        }

        if self.persistence.data_dir.is_empty() {
            return Err(ConfigError::ValidationError(
                "data_dir cannot be empty".to_string(),
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging level must be one of {:?}, got {}",
                LOG_LEVELS, self.logging.level
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL: &str = r#"
[chain]
base_token = "0x0b3e328455c4059eeb9e3f84b5543f74e24e7e1b"
"#;

    fn create_full_config() -> String {
        r#"
[chain]
base_token = "0x0b3e328455c4059eeb9e3f84b5543f74e24e7e1b"

[trading]
take_profit_pct = 30
stop_loss_pct = 25
max_open_positions = 2
position_fraction_bps = 1000
min_base_balance = "1000000000000000000"
sizing = "fixed_pool"

[retry]
metadata_attempts = 3
transaction_attempts = 6
initial_delay_ms = 500
settle_attempts = 5
settle_interval_ms = 250
deadline_secs = 0
jitter = true

[persistence]
data_dir = "/var/lib/agents"
autosave_interval_secs = 60

[reconcile]
unresolved_interval_secs = 120
unresolved_batch_size = 10

[engine]
worker_idle_secs = 30
housekeeping_interval_secs = 15

[oracle]
enabled = false
network = "base-sepolia"

[logging]
level = "debug"
"#
        .to_string()
    }

    #[test]
    fn test_load_minimal_config_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();

        assert_eq!(config.trading.take_profit_pct, 20);
        assert_eq!(config.trading.stop_loss_pct, 40);
        assert_eq!(config.trading.max_open_positions, 4);
        assert_eq!(config.trading.sizing, SizingKind::LiveBalance);
        assert_eq!(config.retry.metadata_attempts, 5);
        assert_eq!(config.retry.transaction_attempts, 10);
        assert_eq!(config.persistence.autosave_interval_secs, 600);
        assert_eq!(config.reconcile.unresolved_batch_size, 25);
        assert_eq!(config.logging.level, "info");
        assert!(config.oracle.enabled);
    }

    #[test]
    fn test_load_full_config() {
        let config = parse_config(&create_full_config()).unwrap();

        assert_eq!(config.trading.rules(), TradeRules { take_profit_pct: 30, stop_loss_pct: 25 });
        assert_eq!(config.trading.min_base_balance, U256::from(1_000_000_000_000_000_000u128));
        assert_eq!(config.trading.sizing_policy().name(), "fixed_pool");

        let policy = config.retry.transaction_policy();
        assert_eq!(policy.max_attempts, 6);
        assert_eq!(policy.initial_delay, Duration::from_millis(500));
        assert_eq!(policy.deadline, None);
        assert!(policy.jitter);
        assert_eq!(config.retry.settle_policy().attempts, 5);

        assert_eq!(config.engine.worker_idle_secs, 30);
        assert_eq!(config.oracle.network, "base-sepolia");
    }

    #[test]
    fn test_default_deadline_applies() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.retry.metadata_policy().deadline, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_config("/nonexistent/path/config.toml");
        assert!(matches!(result.unwrap_err(), ConfigError::IoError(_)));
    }

    #[test]
    fn test_missing_chain_section() {
        let result = parse_config("[trading]\ntake_profit_pct = 20\n");
        assert!(matches!(result.unwrap_err(), ConfigError::ParseError(_)));
    }

    #[test]
    fn test_zero_base_token_rejected() {
        let result = parse_config(
            "[chain]\nbase_token = \"0x0000000000000000000000000000000000000000\"\n",
        );
        assert!(matches!(result.unwrap_err(), ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_invalid_stop_loss() {
        let content = format!("{}\n[trading]\nstop_loss_pct = 100\n", MINIMAL);
        let err = parse_config(&content).unwrap_err();
        assert!(err.to_string().contains("stop_loss_pct"));
    }

    #[test]
    fn test_invalid_fraction() {
        let content = format!("{}\n[trading]\nposition_fraction_bps = 20000\n", MINIMAL);
        assert!(matches!(parse_config(&content), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_invalid_log_level() {
        let content = format!("{}\n[logging]\nlevel = \"loud\"\n", MINIMAL);
        assert!(matches!(parse_config(&content), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_data_dir_tilde_expansion() {
        let section = PersistenceSection {
            data_dir: "~/agents".to_string(),
            ..Default::default()
        };
        if std::env::var("AGENT_DATA_DIR").is_err() && std::env::var("HOME").is_ok() {
            let dir = section.get_data_dir();
            assert!(!dir.to_string_lossy().starts_with('~'));
            assert!(dir.ends_with("agents"));
        }
    }
}
