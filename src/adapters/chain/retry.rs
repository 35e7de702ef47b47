//! Retry Policy
//!
//! Exponential backoff with optional jitter and an overall deadline.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use super::error::QueryError;
use crate::ports::ProviderError;

/// Default attempts for metadata reads
pub const DEFAULT_METADATA_ATTEMPTS: u32 = 5;
/// Default attempts for reads that depend on a fresh transaction
pub const DEFAULT_TRANSACTION_ATTEMPTS: u32 = 10;
/// First backoff delay, doubled after every failed attempt
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;

/// Jitter adds up to this share of each delay (1/10 = 10%)
const JITTER_DIVISOR: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Bound on the whole call including backoff sleeps
    pub deadline: Option<Duration>,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::metadata()
    }
}

impl RetryPolicy {
    pub fn metadata() -> Self {
        Self {
            max_attempts: DEFAULT_METADATA_ATTEMPTS,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            deadline: None,
            jitter: false,
        }
    }

    pub fn transaction() -> Self {
        Self {
            max_attempts: DEFAULT_TRANSACTION_ATTEMPTS,
            ..Self::metadata()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to sleep after failed attempt number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.saturating_mul(2u32.saturating_pow(attempt));
        if !self.jitter {
            return base;
        }
        let max_extra = base.as_millis() as u64 / JITTER_DIVISOR;
        if max_extra == 0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=max_extra);
        base + Duration::from_millis(extra)
    }

    /// Run `operation` until it succeeds, fails non-retryably, runs out of
    /// attempts, or the deadline expires.
    pub async fn execute_with_retry<F, Fut, T>(&self, operation: &str, f: F) -> Result<T, QueryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.retry_loop(operation, f))
                .await
                .unwrap_or_else(|_| {
                    warn!("{} exceeded deadline of {:?}", operation, deadline);
                    Err(QueryError::DeadlineExceeded {
                        operation: operation.to_string(),
                        deadline,
                    })
                }),
            None => self.retry_loop(operation, f).await,
        }
    }

    async fn retry_loop<F, Fut, T>(&self, operation: &str, mut f: F) -> Result<T, QueryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = String::from("no attempts made");

        for attempt in 0..attempts {
            match f().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    // Only retry on retryable errors
                    if !e.is_retryable() {
                        return Err(QueryError::NonRetryable {
                            operation: operation.to_string(),
                            source: e,
                        });
                    }
                    last_error = e.to_string();

                    // Don't sleep after the last attempt
                    if attempt + 1 < attempts {
                        let delay = self.backoff(attempt);
                        warn!(
                            "{} attempt {}/{} failed: {} - retrying in {:?}",
                            operation,
                            attempt + 1,
                            attempts,
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(QueryError::Exhausted {
            operation: operation.to_string(),
            attempts,
            last_error,
        })
    }
}
