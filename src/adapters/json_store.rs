//! JSON Snapshot Store
//!
//! Persists the registry as three independent full-snapshot files, a
//! catch-up cursor, and a file of open positions for crash recovery.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::domain::TradePosition;
use crate::ports::{PersistError, RegistrySnapshot, SnapshotStore};

pub const PAIRS_FILE: &str = "pairs.json";
pub const PROTOTYPES_FILE: &str = "prototypes.json";
pub const SENTIENTS_FILE: &str = "sentients.json";
pub const POSITIONS_FILE: &str = "positions.json";
pub const CURSOR_FILE: &str = "cursor.json";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReconcileCursor {
    reconciled_index: u64,
}

/// File-backed store. Clones share one write lock, so a save never
/// interleaves with another save of the same store.
#[derive(Debug, Clone)]
pub struct JsonSnapshotStore {
    data_dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl JsonSnapshotStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn path(&self, file: &str) -> PathBuf {
        self.data_dir.join(file)
    }

    /// Missing or blank file reads as an empty collection
    fn read_vec<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>, PersistError> {
        Ok(self.read_json::<Vec<T>>(file)?.unwrap_or_default())
    }

    fn read_json<T: DeserializeOwned>(&self, file: &str) -> Result<Option<T>, PersistError> {
        let path = self.path(file);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).map_err(|e| PersistError::Read {
            resource: file.to_string(),
            message: e.to_string(),
        })?;

        if content.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| PersistError::Corrupted {
                resource: file.to_string(),
                message: e.to_string(),
            })
    }

    /// Write to a fresh temp file in the data dir, then rename over the target
    fn write_json<T: Serialize + ?Sized>(&self, file: &str, items: &T) -> Result<(), PersistError> {
        let write_err = |e: &dyn std::fmt::Display| PersistError::Write {
            resource: file.to_string(),
            message: e.to_string(),
        };

        fs::create_dir_all(&self.data_dir).map_err(|e| write_err(&e))?;

        let content = serde_json::to_string_pretty(items).map_err(|e| write_err(&e))?;
        let mut tmp = NamedTempFile::new_in(&self.data_dir).map_err(|e| write_err(&e))?;
        tmp.write_all(content.as_bytes()).map_err(|e| write_err(&e))?;
        tmp.as_file().sync_all().map_err(|e| write_err(&e))?;

        // A failed persist drops the temp file
        tmp.persist(self.path(file)).map_err(|e| write_err(&e.error))?;
        Ok(())
    }
}

impl SnapshotStore for JsonSnapshotStore {
    fn load(&self) -> Result<RegistrySnapshot, PersistError> {
        let snapshot = RegistrySnapshot {
            pairs: self.read_vec(PAIRS_FILE)?,
            prototypes: self.read_vec(PROTOTYPES_FILE)?,
            sentients: self.read_vec(SENTIENTS_FILE)?,
            reconciled_index: self
                .read_json::<ReconcileCursor>(CURSOR_FILE)?
                .map(|cursor| cursor.reconciled_index),
        };

        tracing::info!(
            "Snapshot loaded from {}: {} pairs, {} prototypes, {} sentients",
            self.data_dir.display(),
            snapshot.pairs.len(),
            snapshot.prototypes.len(),
            snapshot.sentients.len()
        );

        Ok(snapshot)
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), PersistError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        // Attempt every file even if an earlier one fails
        let mut results = vec![
            (PAIRS_FILE, self.write_json(PAIRS_FILE, &snapshot.pairs)),
            (PROTOTYPES_FILE, self.write_json(PROTOTYPES_FILE, &snapshot.prototypes)),
            (SENTIENTS_FILE, self.write_json(SENTIENTS_FILE, &snapshot.sentients)),
        ];
        if let Some(reconciled_index) = snapshot.reconciled_index {
            let cursor = ReconcileCursor { reconciled_index };
            results.push((CURSOR_FILE, self.write_json(CURSOR_FILE, &cursor)));
        }

        let failed: Vec<String> = results
            .iter()
            .filter_map(|(file, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    tracing::error!("Failed to save {}: {}", file, e);
                    Some(file.to_string())
                }
            })
            .collect();

        if !failed.is_empty() {
            return Err(PersistError::Partial { failed });
        }

        tracing::debug!(
            "Snapshot saved: {} pairs, {} prototypes, {} sentients",
            snapshot.pairs.len(),
            snapshot.prototypes.len(),
            snapshot.sentients.len()
        );
        Ok(())
    }

    fn load_positions(&self) -> Result<Vec<TradePosition>, PersistError> {
        self.read_vec(POSITIONS_FILE)
    }

    fn save_positions(&self, positions: &[TradePosition]) -> Result<(), PersistError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.write_json(POSITIONS_FILE, positions)
    }
}
