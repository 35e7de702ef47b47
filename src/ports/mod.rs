//! Ports Layer - Trait definitions for external dependencies
//!
//! This module defines the interfaces (ports) that adapters must implement.
//! Following hexagonal architecture, these traits abstract:
//! - Chain reads and event subscriptions
//! - Trade execution (buys, sells, balances)
//! - Base token price lookup
//! - Snapshot persistence

pub mod chain;
pub mod execution;
pub mod mocks;
pub mod oracle;
pub mod persistence;

// Re-export main traits and types
pub use chain::{ChainDataProvider, ChainEvent, EventFilter, ProviderError, SubscriptionId};
pub use execution::{ExecutionError, TradeExecutor};
pub use oracle::{OracleError, PriceOracle};
pub use persistence::{PersistError, RegistrySnapshot, SnapshotStore};
