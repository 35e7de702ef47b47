//! Remote Query Layer
//!
//! Every chain read goes through here: retried with backoff, bounded by a
//! deadline, and normalized into domain types. Token reads on the launch
//! path additionally wait for the record to settle.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::Address;
use tracing::{debug, warn};

use super::error::QueryError;
use super::retry::RetryPolicy;
use crate::domain::{AgentRecord, Pair};
use crate::ports::ChainDataProvider;

/// Default total fetches while waiting for a record to settle
pub const DEFAULT_SETTLE_ATTEMPTS: u32 = 10;
/// Default spacing between settle fetches
pub const DEFAULT_SETTLE_INTERVAL_MS: u64 = 1_000;

/// Fixed-interval polling for records that read zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlePolicy {
    /// Total fetches, including the first
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_SETTLE_ATTEMPTS,
            interval: Duration::from_millis(DEFAULT_SETTLE_INTERVAL_MS),
        }
    }
}

#[derive(Clone)]
pub struct RemoteQuery {
    provider: Arc<dyn ChainDataProvider>,
    base_token: Address,
    metadata_policy: RetryPolicy,
    transaction_policy: RetryPolicy,
    settle: SettlePolicy,
}

impl RemoteQuery {
    pub fn new(provider: Arc<dyn ChainDataProvider>, base_token: Address) -> Self {
        Self {
            provider,
            base_token,
            metadata_policy: RetryPolicy::metadata(),
            transaction_policy: RetryPolicy::transaction(),
            settle: SettlePolicy::default(),
        }
    }

    pub fn with_metadata_policy(mut self, policy: RetryPolicy) -> Self {
        self.metadata_policy = policy;
        self
    }

    pub fn with_transaction_policy(mut self, policy: RetryPolicy) -> Self {
        self.transaction_policy = policy;
        self
    }

    pub fn with_settle(mut self, settle: SettlePolicy) -> Self {
        self.settle = settle;
        self
    }

    pub fn base_token(&self) -> Address {
        self.base_token
    }

    pub fn provider(&self) -> &Arc<dyn ChainDataProvider> {
        &self.provider
    }

    /// Number of pairs the factory has created
    pub async fn pair_count(&self) -> Result<u64, QueryError> {
        self.metadata_policy
            .execute_with_retry("all_pairs_length", || self.provider.all_pairs_length())
            .await
    }

    pub async fn pair_at(&self, index: u64) -> Result<Address, QueryError> {
        self.metadata_policy
            .execute_with_retry("pair_at", || self.provider.pair_at(index))
            .await
    }

    /// Resolve which side of a pair is the agent token
    pub async fn resolve_pair_token(&self, pair: Address) -> Result<Pair, QueryError> {
        let (token_a, token_b) = self
            .metadata_policy
            .execute_with_retry("pair_tokens", || self.provider.pair_tokens(pair))
            .await?;

        let token = if token_a == self.base_token { token_b } else { token_a };
        Ok(Pair::new(pair, token))
    }

    /// Single retried read, zero metrics accepted as-is
    pub async fn fetch_token_snapshot(&self, token: Address) -> Result<AgentRecord, QueryError> {
        self.fetch_once(&self.metadata_policy, token).await
    }

    /// Fetch a token record that must carry non-zero price and market cap.
    ///
    /// Zero-valued reads are polled again at the settle interval until the
    /// settle budget is spent, then reported as [`QueryError::Unsettled`].
    /// The transaction deadline bounds the whole operation, settling included.
    pub async fn fetch_token_info(&self, token: Address) -> Result<AgentRecord, QueryError> {
        match self.transaction_policy.deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.settle_loop(token))
                .await
                .unwrap_or_else(|_| {
                    warn!("Token {} fetch exceeded deadline of {:?}", token, deadline);
                    Err(QueryError::DeadlineExceeded {
                        operation: "fetch_token_info".to_string(),
                        deadline,
                    })
                }),
            None => self.settle_loop(token).await,
        }
    }

    async fn settle_loop(&self, token: Address) -> Result<AgentRecord, QueryError> {
        let attempts = self.settle.attempts.max(1);

        for fetch in 1..=attempts {
            let record = self.fetch_once(&self.transaction_policy, token).await?;
            if record.is_settled() {
                if fetch > 1 {
                    debug!("Token {} settled after {} fetches", token, fetch);
                }
                return Ok(record);
            }
            if fetch < attempts {
                debug!("Token {} not settled ({}/{}), polling again", token, fetch, attempts);
                tokio::time::sleep(self.settle.interval).await;
            }
        }

        warn!("Token {} still reads zero after {} fetches", token, attempts);
        Err(QueryError::Unsettled { token, attempts })
    }

    async fn fetch_once(&self, policy: &RetryPolicy, token: Address) -> Result<AgentRecord, QueryError> {
        let raw = policy
            .execute_with_retry("token_info", || self.provider.token_info(token))
            .await?;
        Ok(AgentRecord::try_from(raw)?)
    }
}
