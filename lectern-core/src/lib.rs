//! # Lectern Core
//!
//! Replicated document primitives shared by every Lectern participant:
//!
//! - [`text::ReplicatedText`]: CRDT text sequence with origin-tagged observers
//! - [`registry::DocumentRegistry`]: single-flight map from document key to text
//! - [`permission`]: edit capability from role, key, identity and connection
//! - [`status`]: connection and sync status enums
//! - [`handlers`]: callback registries returning disposer tokens
//!
//! Nothing here depends on an async runtime; networking and timers live in
//! `lectern-collab`.

pub mod handlers;
pub mod permission;
pub mod registry;
pub mod status;
pub mod text;

pub use handlers::{HandlerRegistry, Subscription};
pub use permission::{
    can_edit, own_document_keys, personal_document_key, ParseRoleError, PermissionGate, Role,
    SessionContext, SHARED_DOCUMENT_KEY,
};
pub use registry::{DocumentLoader, DocumentRegistry};
pub use status::{ConnectionStatus, SyncStatus};
pub use text::{is_empty_update, Origin, ReplicatedText, TextChange, TextError, EMPTY_UPDATE};
