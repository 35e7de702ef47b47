use alloy_primitives::{Address, U256};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Transaction rejected: {0}")]
    Rejected(String),
    #[error("Transaction reverted: {0}")]
    Reverted(String),
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),
    #[error("Executor unavailable: {0}")]
    Unavailable(String),
}

/// Submits swaps against the base token and reports balances.
///
/// Signing, nonces and gas are the executor's concern.
#[async_trait::async_trait]
pub trait TradeExecutor: Send + Sync {
    /// Spend `amount` of the base token buying `token`
    async fn buy(&self, token: Address, amount: U256) -> Result<(), ExecutionError>;

    /// Sell `amount` of `token` back into the base token
    async fn sell(&self, token: Address, amount: U256) -> Result<(), ExecutionError>;

    async fn balance(&self, token: Address) -> Result<U256, ExecutionError>;
}
