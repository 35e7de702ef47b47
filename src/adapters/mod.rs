//! Adapters Layer - External System Implementations
//!
//! This module contains implementations of the port traits:
//! - Chain: retry-driven remote queries over a `ChainDataProvider`
//! - JSON store: file-backed registry snapshots
//! - Price oracle: HTTP price lookup for the base token

pub mod chain;
pub mod json_store;
pub mod price_oracle;

pub use chain::{QueryError, RemoteQuery, RetryPolicy, SettlePolicy};
pub use json_store::JsonSnapshotStore;
pub use price_oracle::HttpPriceOracle;
