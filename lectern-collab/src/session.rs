//! One participant's view of one document.
//!
//! [`DocumentSession`] pulls the document out of the registry and wires it
//! to a [`SyncEngine`], a [`PermissionGate`] and an [`EditorBinding`]. It
//! owns all of them, so dropping the session tears the whole chain down.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;

use lectern_core::{
    ConnectionStatus, DocumentRegistry, PermissionGate, ReplicatedText, Role, SessionContext,
    SyncStatus,
};

use crate::binding::{EditorBinding, EditorSurface};
use crate::engine::{EngineConfig, SyncEngine};
use crate::relay::{RelayClient, RelayError};
use crate::schedule::ScheduledTask;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub engine: EngineConfig,
    /// How long to wait after connecting before seeding an empty document.
    pub seed_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            seed_delay: Duration::from_millis(1000),
        }
    }
}

impl SessionConfig {
    pub fn for_testing() -> Self {
        Self {
            engine: EngineConfig::for_testing(),
            seed_delay: Duration::from_millis(30),
        }
    }
}

pub struct DocumentSession {
    relay: RelayClient,
    text: Arc<ReplicatedText>,
    gate: Arc<PermissionGate>,
    engine: SyncEngine,
    binding: Arc<EditorBinding>,
    config: SessionConfig,
    seed: Mutex<Option<ScheduledTask>>,
}

impl DocumentSession {
    pub fn open(
        registry: &DocumentRegistry,
        relay: RelayClient,
        context: &SessionContext,
        document_key: &str,
        config: SessionConfig,
    ) -> Self {
        let text = registry.get_or_create(document_key);
        let gate = Arc::new(PermissionGate::new(context, document_key));
        let engine = SyncEngine::start(
            text.clone(),
            relay.clone(),
            gate.clone(),
            config.engine.clone(),
        );
        let binding = Arc::new(EditorBinding::new(text.clone(), gate.clone()));

        log::info!(
            "Opened {document_key} as {} ({})",
            context.participant_id,
            context.role
        );
        Self {
            relay,
            text,
            gate,
            engine,
            binding,
            config,
            seed: Mutex::new(None),
        }
    }

    pub fn document_key(&self) -> &str {
        self.text.key()
    }

    pub fn text(&self) -> &Arc<ReplicatedText> {
        &self.text
    }

    pub fn content(&self) -> String {
        self.text.content()
    }

    pub fn can_edit(&self) -> bool {
        self.gate.can_edit()
    }

    pub fn role(&self) -> Role {
        self.gate.role()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.engine.status()
    }

    pub fn watch_sync_status(&self) -> watch::Receiver<SyncStatus> {
        self.engine.watch_status()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.relay.status()
    }

    pub fn watch_connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.relay.watch_status()
    }

    pub fn has_resynced(&self) -> bool {
        self.engine.has_resynced()
    }

    /// Manual resync trigger.
    pub fn request_sync(&self) -> Result<(), RelayError> {
        self.engine.request_sync()
    }

    pub fn bind(&self, surface: Arc<dyn EditorSurface>) {
        self.binding.bind(surface);
    }

    pub fn release(&self) {
        self.binding.release();
    }

    /// Local keystroke. Returns `false` when the gate refuses it.
    pub fn insert(&self, position: u32, chunk: &str) -> bool {
        self.binding.insert(position, chunk)
    }

    pub fn delete(&self, position: u32, len: u32) -> bool {
        self.binding.delete(position, len)
    }

    /// Fill the document with `content` if it is still empty once peers had
    /// a chance to answer.
    ///
    /// Waits for a connection, then [`SessionConfig::seed_delay`], then seeds
    /// only when the document is empty and editable. A later call replaces
    /// an earlier one that has not fired yet.
    pub fn seed_initial_content(&self, content: &str) {
        if content.is_empty() {
            return;
        }
        let mut status = self.relay.watch_status();
        let binding: Weak<EditorBinding> = Arc::downgrade(&self.binding);
        let delay = self.config.seed_delay;
        let content = content.to_string();

        let task = ScheduledTask::spawn(async move {
            if status.wait_for(|s| s.is_connected()).await.is_err() {
                return;
            }
            tokio::time::sleep(delay).await;
            if let Some(binding) = binding.upgrade() {
                binding.seed_initial_content(&content);
            }
        });
        *self.seed.lock() = task;
    }

    /// Grant or revoke editing at runtime.
    pub fn set_role(&self, role: Role) {
        log::info!("{}: role changed to {role}", self.document_key());
        self.gate.set_role(role);
    }

    /// Release the surface, cancel timers and stop syncing. Idempotent.
    pub fn teardown(&self) {
        let seed = self.seed.lock().take();
        drop(seed);
        self.binding.release();
        self.engine.teardown();
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("document_key", &self.document_key())
            .field("sync_status", &self.sync_status())
            .field("can_edit", &self.can_edit())
            .finish_non_exhaustive()
    }
}
