use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Price request failed: {0}")]
    Request(String),
    #[error("Unexpected price response: {0}")]
    InvalidResponse(String),
    #[error("No price available for {0}")]
    NoPrice(String),
}

/// Reference price for the protocol's base token
#[async_trait::async_trait]
pub trait PriceOracle: Send + Sync {
    /// Price of one whole base token in the quote currency
    async fn base_price(&self) -> Result<Decimal, OracleError>;
}
