//! Chain Query Adapter
//!
//! Retry-driven access to the launch factory and token data:
//! - `retry`: exponential backoff, jitter and deadlines
//! - `query`: the remote query layer used by the registry and lifecycle
//! - `error`: error types surfaced once retries are spent

pub mod error;
pub mod query;
pub mod retry;

pub use error::QueryError;
pub use query::{RemoteQuery, SettlePolicy, DEFAULT_SETTLE_ATTEMPTS, DEFAULT_SETTLE_INTERVAL_MS};
pub use retry::{
    RetryPolicy, DEFAULT_INITIAL_DELAY_MS, DEFAULT_METADATA_ATTEMPTS, DEFAULT_TRANSACTION_ATTEMPTS,
};
