//! Remote Query Error Types

use std::time::Duration;

use alloy_primitives::Address;
use thiserror::Error;

use crate::domain::IngestError;
use crate::ports::ProviderError;

/// Errors surfaced by the remote query layer once retries are spent
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// All attempts failed with retryable errors
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// Provider returned an error that retrying cannot fix
    #[error("{operation} failed: {source}")]
    NonRetryable {
        operation: String,
        #[source]
        source: ProviderError,
    },

    /// Record kept reading zero price or market cap
    #[error("Token {token} still unsettled after {attempts} fetches")]
    Unsettled { token: Address, attempts: u32 },

    /// Overall deadline for the call expired
    #[error("{operation} exceeded deadline of {deadline:?}")]
    DeadlineExceeded { operation: String, deadline: Duration },

    /// Provider data failed schema validation
    #[error("Malformed token data: {0}")]
    Malformed(#[from] IngestError),
}
