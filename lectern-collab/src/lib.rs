//! # lectern-collab: real-time document sync for Lectern
//!
//! Connects [`lectern_core`] documents to a relay hub and to editor widgets.
//!
//! ## Architecture
//!
//! ```text
//!  EditorSurface ◄──► EditorBinding ◄──► ReplicatedText ◄──► SnapshotCache ──► SnapshotStore
//!                          ▲                   ▲
//!                   PermissionGate ◄──── SyncEngine
//!                                              ▲  update / sync_request / sync_response
//!                                         RelayClient ◄──── JSON text frames ────► relay hub
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelope and document payloads
//! - [`relay`]: WebSocket (or in-process) relay client with per-kind subscribers
//! - [`engine`]: per-document sync state machine
//! - [`binding`]: editor surface adapter
//! - [`storage`]: snapshot stores and the debounced snapshot cache
//! - [`session`]: one participant's wiring for one document
//! - [`schedule`]: abort-on-drop timers

pub mod binding;
pub mod engine;
pub mod protocol;
pub mod relay;
pub mod schedule;
pub mod session;
pub mod storage;

pub use binding::{BufferSurface, EditorBinding, EditorSurface, TextEdit};
pub use engine::{EngineConfig, PublishMode, SyncEngine};
pub use protocol::{DocumentPayload, Envelope, MessageKind, ProtocolError};
pub use relay::{Link, RelayClient, RelayConfig, RelayError};
pub use schedule::ScheduledTask;
pub use session::{DocumentSession, SessionConfig};
pub use storage::{
    FileSnapshotStore, MemorySnapshotStore, SnapshotCache, SnapshotConfig, SnapshotRecord,
    SnapshotStore, StoreError,
};
#[cfg(feature = "rocksdb")]
pub use storage::{RocksSnapshotStore, StoreConfig};
