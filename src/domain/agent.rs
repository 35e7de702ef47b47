//! Agent Records
//!
//! Canonical representation of a tracked agent token and the strict
//! conversion from loosely typed chain data into it.

use std::fmt;
use std::str::FromStr;

use alloy_primitives::{Address, U256};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while normalizing raw token data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("Invalid address in field '{field}': {value}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("Invalid integer in field '{field}': {value}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// A liquidity pair against the protocol's base token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pair {
    /// Pair contract address
    pub address: Address,
    /// The non-base token of the pair
    pub token: Address,
}

impl Pair {
    pub fn new(address: Address, token: Address) -> Self {
        Self { address, token }
    }
}

/// A launch observed before its metrics could be fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnresolvedLaunch {
    pub pair: Address,
    pub token: Address,
}

/// Where a record lives in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// Still trading on the bonding curve
    Prototype,
    /// Migrated to open-market trading
    Sentient,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Prototype => write!(f, "prototype"),
            Classification::Sentient => write!(f, "sentient"),
        }
    }
}

/// On-chain market metrics, all in raw 256-bit units
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenMetrics {
    #[serde(with = "u256_decimal")]
    pub supply: U256,
    #[serde(with = "u256_decimal")]
    pub price: U256,
    #[serde(with = "u256_decimal")]
    pub market_cap: U256,
    #[serde(with = "u256_decimal")]
    pub liquidity: U256,
    #[serde(with = "u256_decimal")]
    pub volume: U256,
    #[serde(with = "u256_decimal")]
    pub volume_24h: U256,
    #[serde(with = "u256_decimal")]
    pub prev_price: U256,
    #[serde(with = "u256_decimal")]
    pub last_updated: U256,
}

/// Descriptive metadata published by the agent's creator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub name: Option<String>,
    pub ticker: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub twitter: Option<String>,
    pub telegram: Option<String>,
    pub youtube: Option<String>,
    pub website: Option<String>,
}

/// Snapshot of a tracked token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub creator: Address,
    pub token: Address,
    pub pair: Address,
    /// Token address on the external market, set once graduated
    pub agent_token: Option<Address>,
    pub metadata: AgentMetadata,
    pub metrics: TokenMetrics,
    pub trading: bool,
    pub trading_on_external_market: bool,
}

impl AgentRecord {
    pub fn classification(&self) -> Classification {
        if self.trading_on_external_market {
            Classification::Sentient
        } else {
            Classification::Prototype
        }
    }

    /// Price and market cap are both non-zero.
    ///
    /// Freshly created tokens read zero until the creating transaction
    /// has propagated to the node serving the query.
    pub fn is_settled(&self) -> bool {
        !self.metrics.price.is_zero() && !self.metrics.market_cap.is_zero()
    }

    /// Mark the record as migrated to the external market
    pub fn graduate(&mut self, agent_token: Address) {
        self.agent_token = Some(agent_token);
        self.trading_on_external_market = true;
    }

    pub fn display_name(&self) -> String {
        match (&self.metadata.name, &self.metadata.ticker) {
            (Some(name), Some(ticker)) => format!("{} (${})", name, ticker),
            (Some(name), None) => name.clone(),
            (None, Some(ticker)) => format!("${}", ticker),
            (None, None) => self.token.to_string(),
        }
    }
}

/// Token info exactly as the chain provider hands it over.
///
/// Addresses and integers are strings; integers may be decimal or `0x` hex.
/// Empty strings mean "absent".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawTokenInfo {
    pub creator: String,
    pub token: String,
    pub pair: String,
    pub agent_token: String,
    pub name: String,
    pub ticker: String,
    pub description: String,
    pub image: String,
    pub twitter: String,
    pub telegram: String,
    pub youtube: String,
    pub website: String,
    pub supply: String,
    pub price: String,
    pub market_cap: String,
    pub liquidity: String,
    pub volume: String,
    #[serde(alias = "volume24H")]
    pub volume_24h: String,
    pub prev_price: String,
    pub last_updated: String,
    pub trading: bool,
    #[serde(alias = "tradingOnUniswap")]
    pub trading_on_external_market: bool,
}

fn parse_address(field: &'static str, value: &str) -> Result<Address, IngestError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(IngestError::MissingField(field));
    }
    Address::from_str(trimmed).map_err(|_| IngestError::InvalidAddress {
        field,
        value: value.to_string(),
    })
}

fn parse_optional_address(field: &'static str, value: &str) -> Result<Option<Address>, IngestError> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    let address = parse_address(field, value)?;
    Ok((address != Address::ZERO).then_some(address))
}

/// Missing integers read as zero, malformed ones are rejected
fn parse_u256(field: &'static str, value: &str) -> Result<U256, IngestError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str(trimmed).map_err(|_| IngestError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl TryFrom<RawTokenInfo> for AgentRecord {
    type Error = IngestError;

    fn try_from(raw: RawTokenInfo) -> Result<Self, Self::Error> {
        let metrics = TokenMetrics {
            supply: parse_u256("supply", &raw.supply)?,
            price: parse_u256("price", &raw.price)?,
            market_cap: parse_u256("marketCap", &raw.market_cap)?,
            liquidity: parse_u256("liquidity", &raw.liquidity)?,
            volume: parse_u256("volume", &raw.volume)?,
            volume_24h: parse_u256("volume24h", &raw.volume_24h)?,
            prev_price: parse_u256("prevPrice", &raw.prev_price)?,
            last_updated: parse_u256("lastUpdated", &raw.last_updated)?,
        };

        Ok(AgentRecord {
            creator: parse_address("creator", &raw.creator)?,
            token: parse_address("token", &raw.token)?,
            pair: parse_address("pair", &raw.pair)?,
            agent_token: parse_optional_address("agentToken", &raw.agent_token)?,
            metadata: AgentMetadata {
                name: non_blank(raw.name),
                ticker: non_blank(raw.ticker),
                description: non_blank(raw.description),
                image: non_blank(raw.image),
                twitter: non_blank(raw.twitter),
                telegram: non_blank(raw.telegram),
                youtube: non_blank(raw.youtube),
                website: non_blank(raw.website),
            },
            metrics,
            trading: raw.trading,
            trading_on_external_market: raw.trading_on_external_market,
        })
    }
}

/// Convert raw integer units into a decimal amount (e.g. wei to ether).
///
/// Keeps at most 8 fractional digits. Returns `None` if the whole part
/// does not fit in a `Decimal`.
pub fn to_decimal_units(value: U256, decimals: u8) -> Option<Decimal> {
    let scale = U256::from(10u64).pow(U256::from(decimals));
    let whole = u128::try_from(value / scale).ok()?;
    let remainder = value % scale;

    let (frac_digits, frac_scale) = if decimals > 8 {
        let shrink = U256::from(10u64).pow(U256::from(decimals - 8));
        (remainder / shrink, 8u32)
    } else {
        (remainder, decimals as u32)
    };
    let frac = u64::try_from(frac_digits).ok()?;

    let whole = Decimal::from_u128(whole)?;
    Some(whole + Decimal::new(frac as i64, frac_scale))
}

/// Serialize `U256` as a decimal string so no precision is lost in JSON
pub mod u256_decimal {
    use std::str::FromStr;

    use alloy_primitives::U256;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;
        U256::from_str(&s).map_err(de::Error::custom)
    }
}
