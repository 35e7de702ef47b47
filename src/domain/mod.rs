//! Domain Layer - Core types for the agent lifecycle engine
//!
//! Pure types and rules with no I/O. All external interactions happen
//! through the ports layer.
//!
//! - `agent`: Agent records, pairs, and the raw-data ingestion boundary
//! - `position`: Open positions, exit levels, and the bounded position book
//! - `sizing`: Position sizing policies

pub mod agent;
pub mod position;
pub mod sizing;

pub use agent::{
    to_decimal_units, AgentMetadata, AgentRecord, Classification, IngestError, Pair,
    RawTokenInfo, TokenMetrics, UnresolvedLaunch,
};
pub use position::{
    ExitReason, PositionBook, PositionError, PriceLevels, SlotReservation, TradePosition,
    TradeRules,
};
pub use sizing::{FixedPoolSizing, LiveBalanceSizing, SizingError, SizingPolicy};
