//! Local snapshot persistence.
//!
//! ```text
//! ReplicatedText ──change──► SnapshotCache ──debounce──► SnapshotStore
//!        ▲                        │                      ├─ MemorySnapshotStore
//!        └──── storage-load ──────┘ (on first create)     ├─ FileSnapshotStore
//!                                                         └─ RocksSnapshotStore (feature "rocksdb")
//! ```
//!
//! A snapshot is the full encoded document state plus the time it was taken.
//! Persistence is best effort: failures are logged and never surface as
//! errors to editing code.

pub mod cache;
pub mod file;
#[cfg(feature = "rocksdb")]
pub mod rocks;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub use cache::{SnapshotCache, SnapshotConfig};
pub use file::FileSnapshotStore;
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksSnapshotStore, StoreConfig};

/// Persisted form of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Output of `ReplicatedText::encode_state`.
    pub update: Vec<u8>,
    /// Unix millis at capture.
    pub timestamp: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("corrupt snapshot for {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("database error: {0}")]
    Database(String),
}

/// Keyed snapshot storage.
pub trait SnapshotStore: Send + Sync {
    fn put(&self, key: &str, record: &SnapshotRecord) -> Result<(), StoreError>;
    /// `Ok(None)` when nothing was stored under `key`.
    fn get(&self, key: &str) -> Result<Option<SnapshotRecord>, StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Process-local store. Snapshots die with the process.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    records: RwLock<HashMap<String, SnapshotRecord>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn put(&self, key: &str, record: &SnapshotRecord) -> Result<(), StoreError> {
        self.records.write().insert(key.to_string(), record.clone());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<SnapshotRecord>, StoreError> {
        Ok(self.records.read().get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.records.write().remove(key);
        Ok(())
    }
}
