use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{AgentRecord, Pair, TradePosition};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Failed to read {resource}: {message}")]
    Read { resource: String, message: String },
    #[error("Corrupted {resource}: {message}")]
    Corrupted { resource: String, message: String },
    #[error("Failed to write {resource}: {message}")]
    Write { resource: String, message: String },
    #[error("Partial save, failed resources: {}", failed.join(", "))]
    Partial { failed: Vec<String> },
}

/// Full registry state as persisted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub pairs: Vec<Pair>,
    pub prototypes: Vec<AgentRecord>,
    pub sentients: Vec<AgentRecord>,
    /// First factory index catch-up has not walked, when known
    #[serde(default)]
    pub reconciled_index: Option<u64>,
}

impl RegistrySnapshot {
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty() && self.prototypes.is_empty() && self.sentients.is_empty()
    }
}

/// Durable storage for registry snapshots and open positions.
///
/// Every save writes a full snapshot; loading a resource that was never
/// written yields an empty one.
pub trait SnapshotStore: Send + Sync {
    fn load(&self) -> Result<RegistrySnapshot, PersistError>;

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), PersistError>;

    fn load_positions(&self) -> Result<Vec<TradePosition>, PersistError>;

    fn save_positions(&self, positions: &[TradePosition]) -> Result<(), PersistError>;
}
