use alloy_primitives::Address;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::domain::RawTokenInfo;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Rate limited by provider")]
    RateLimited,
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Provider connection closed")]
    Closed,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transport(_) | ProviderError::RateLimited | ProviderError::Rpc { .. }
        )
    }
}

/// Handle returned by [`ChainDataProvider::subscribe`], passed back to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// What a subscription listens for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    /// New (token, pair) creations on the factory
    Launches,
    /// Prototype to external-market migrations
    Graduations,
    /// Transfer/swap activity touching one token
    TokenActivity { token: Address, pair: Address },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEvent {
    Launched { token: Address, pair: Address },
    Graduated { old_token: Address, agent_token: Address },
    Activity { token: Address },
}

/// Read access to the launch factory and its tokens, plus event streams.
///
/// Events for a subscription are pushed into the sink handed to
/// [`ChainDataProvider::subscribe`] until the returned id is unsubscribed.
#[async_trait]
pub trait ChainDataProvider: Send + Sync {
    async fn all_pairs_length(&self) -> Result<u64, ProviderError>;

    async fn pair_at(&self, index: u64) -> Result<Address, ProviderError>;

    /// `(tokenA, tokenB)` of a pair contract
    async fn pair_tokens(&self, pair: Address) -> Result<(Address, Address), ProviderError>;

    async fn token_info(&self, token: Address) -> Result<RawTokenInfo, ProviderError>;

    async fn subscribe(
        &self,
        filter: EventFilter,
        sink: UnboundedSender<ChainEvent>,
    ) -> Result<SubscriptionId, ProviderError>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ProviderError>;
}
