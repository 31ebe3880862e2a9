//! Per-document sync state machine.
//!
//! ```text
//!            connect                settle delay        response / update
//! offline ───────────► syncing ──── sync_request ────────────► synced
//!    ▲                    │            │ retry window             │
//!    │                    │            └─ content still empty:    │
//!    │                    │               one more sync_request   │
//!    └──── disconnect ────┴───────────────────────────────────────┘
//!                      bad payload ──► conflict ──► next merge ──► synced
//! ```
//!
//! A relay `connecting` transition also returns to offline, so each new
//! link runs its own handshake even when it replaces a live one.
//!
//! The engine also forwards relay connection changes into the document's
//! [`PermissionGate`], so publish decisions and editor read-only state agree.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;

use lectern_core::{
    ConnectionStatus, Origin, PermissionGate, ReplicatedText, Subscription, SyncStatus, TextChange,
};

use crate::protocol::{DocumentPayload, Envelope, MessageKind};
use crate::relay::{RelayClient, RelayError};
use crate::schedule::ScheduledTask;

/// What a local mutation publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishMode {
    /// The whole document state. Tolerates peers that missed earlier updates.
    #[default]
    FullState,
    /// Only the operations of the mutation.
    Delta,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Wait after connecting before the first `sync_request`.
    pub settle_delay: Duration,
    /// Wait for content after a `sync_request` before retrying once.
    pub retry_window: Duration,
    pub publish_mode: PublishMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            retry_window: Duration::from_millis(1000),
            publish_mode: PublishMode::FullState,
        }
    }
}

impl EngineConfig {
    pub fn for_testing() -> Self {
        Self {
            settle_delay: Duration::from_millis(10),
            retry_window: Duration::from_millis(50),
            publish_mode: PublishMode::FullState,
        }
    }
}

#[derive(Default)]
struct EngineState {
    /// Initial request sent on this connection.
    requested: bool,
    /// The single bounded retry has been used on this connection.
    retried: bool,
    /// A `sync_response` has been merged on this connection.
    resynced: bool,
    settle: Option<ScheduledTask>,
    retry: Option<ScheduledTask>,
    torn_down: bool,
}

struct EngineShared {
    text: Arc<ReplicatedText>,
    relay: RelayClient,
    gate: Arc<PermissionGate>,
    config: EngineConfig,
    status_tx: watch::Sender<SyncStatus>,
    state: Mutex<EngineState>,
}

impl EngineShared {
    fn key(&self) -> &str {
        self.text.key()
    }

    fn self_id(&self) -> &str {
        self.relay.participant_id()
    }

    fn set_status(&self, status: SyncStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            log::info!("{}: {previous} -> {status}", self.key());
        }
    }

    fn on_connection(self: &Arc<Self>, status: ConnectionStatus) {
        self.gate.set_connection(status);
        match status {
            ConnectionStatus::Connected => {
                self.set_status(SyncStatus::Syncing);
                let weak = Arc::downgrade(self);
                let task = ScheduledTask::after(self.config.settle_delay, move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.send_initial_request();
                    }
                });
                let mut state = self.state.lock();
                if !state.torn_down {
                    state.settle = task;
                }
            }
            // A new link is being established; the handshake starts over.
            ConnectionStatus::Connecting
            | ConnectionStatus::Disconnected
            | ConnectionStatus::Error => {
                self.reset_handshake();
                self.set_status(SyncStatus::Offline);
            }
        }
    }

    fn reset_handshake(&self) {
        let cancelled = {
            let mut state = self.state.lock();
            state.requested = false;
            state.retried = false;
            state.resynced = false;
            (state.settle.take(), state.retry.take())
        };
        drop(cancelled);
    }

    fn send_initial_request(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.torn_down || state.requested {
                return;
            }
            state.requested = true;
        }
        log::info!("{}: requesting sync", self.key());
        if let Err(e) = self.send_sync_request(DocumentPayload::sync_request(self.key())) {
            log::debug!("{}: sync request not sent: {e}", self.key());
            self.state.lock().requested = false;
            return;
        }
        self.schedule_retry_window();
    }

    fn send_sync_request(&self, payload: DocumentPayload) -> Result<(), RelayError> {
        self.relay
            .publish_payload(MessageKind::SyncRequest, &payload)
    }

    fn schedule_retry_window(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let task = ScheduledTask::after(self.config.retry_window, move || {
            if let Some(shared) = weak.upgrade() {
                shared.on_retry_window();
            }
        });
        let mut state = self.state.lock();
        if !state.torn_down {
            state.retry = task;
        }
    }

    fn on_retry_window(self: &Arc<Self>) {
        let retry_now = {
            let mut state = self.state.lock();
            if state.torn_down {
                return;
            }
            let retry = !state.retried && self.text.is_empty();
            state.retried = true;
            retry
        };
        if retry_now {
            log::info!("{}: no content yet, retrying sync once", self.key());
            if self
                .send_sync_request(DocumentPayload::sync_request(self.key()))
                .is_ok()
            {
                self.schedule_retry_window();
                return;
            }
        }
        // Nobody answered: a lone participant's copy is authoritative.
        let syncing = *self.status_tx.borrow() == SyncStatus::Syncing;
        if syncing {
            self.set_status(SyncStatus::Synced);
        }
    }

    fn document_payload(&self, envelope: &Envelope) -> Option<DocumentPayload> {
        match envelope.payload::<DocumentPayload>() {
            Ok(payload) if payload.document_key == self.key() => Some(payload),
            Ok(_) => None,
            Err(e) => {
                log::warn!("{}: {e}", self.key());
                None
            }
        }
    }

    fn on_update(&self, envelope: &Envelope) {
        let Some(payload) = self.document_payload(envelope) else {
            return;
        };
        if payload.update.is_empty() {
            return;
        }
        log::debug!("{}: update from {}", self.key(), envelope.sender);
        self.merge(&payload.update, Origin::Remote);
    }

    fn on_sync_request(&self, envelope: &Envelope) {
        let Some(payload) = self.document_payload(envelope) else {
            return;
        };
        let requester = payload
            .requester
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| envelope.sender.clone());
        if requester.is_empty() || requester == self.self_id() {
            return;
        }

        let update = match payload.state_vector {
            Some(sv) => self.text.encode_delta_since(&sv).unwrap_or_else(|e| {
                log::warn!("{}: {e}; answering with full state", self.key());
                self.text.encode_state()
            }),
            None => self.text.encode_state(),
        };
        log::debug!("{}: answering sync request from {requester}", self.key());

        let reply = DocumentPayload::sync_response(self.key(), update, requester.clone());
        let sent = Envelope::wrap(MessageKind::SyncResponse.as_str(), &reply, self.self_id())
            .map_err(RelayError::from)
            .and_then(|env| self.relay.send_envelope(env.with_target(requester)));
        if let Err(e) = sent {
            log::debug!("{}: sync response not sent: {e}", self.key());
        }
    }

    fn on_sync_response(&self, envelope: &Envelope) {
        let Some(payload) = self.document_payload(envelope) else {
            return;
        };
        let addressed = match payload.requester.as_deref() {
            Some(requester) => requester == self.self_id(),
            None => envelope.target.as_deref() == Some(self.self_id()),
        };
        if !addressed {
            return;
        }

        if !payload.update.is_empty() && !self.merge(&payload.update, Origin::Sync) {
            return;
        }
        self.state.lock().resynced = true;
        log::info!("{}: resynced from {}", self.key(), envelope.sender);
        self.set_status(SyncStatus::Synced);
    }

    /// Returns whether the payload decoded.
    fn merge(&self, update: &[u8], origin: Origin) -> bool {
        match self.text.apply_update(update, origin) {
            Ok(_) => {
                self.set_status(SyncStatus::Synced);
                true
            }
            Err(e) => {
                log::warn!("{}: discarding {origin} payload: {e}", self.key());
                self.set_status(SyncStatus::Conflict);
                false
            }
        }
    }

    fn on_local_change(&self, change: &TextChange) {
        if !change.origin.is_republishable() {
            return;
        }
        if !self.relay.is_connected() || !self.gate.can_edit() {
            log::debug!("{}: not publishing {} change", self.key(), change.origin);
            return;
        }
        let update = match self.config.publish_mode {
            PublishMode::FullState => self.text.encode_state(),
            PublishMode::Delta => change.update.clone(),
        };
        match self.relay.publish(self.key(), update, MessageKind::Update) {
            Ok(()) => self.set_status(SyncStatus::Synced),
            Err(e) => log::debug!("{}: update not published: {e}", self.key()),
        }
    }
}

/// Drives replication of one document over a [`RelayClient`].
///
/// Dropping the engine unsubscribes every handler and cancels its timers.
pub struct SyncEngine {
    shared: Arc<EngineShared>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl SyncEngine {
    pub fn start(
        text: Arc<ReplicatedText>,
        relay: RelayClient,
        gate: Arc<PermissionGate>,
        config: EngineConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::Offline);
        let shared = Arc::new(EngineShared {
            text,
            relay,
            gate,
            config,
            status_tx,
            state: Mutex::new(EngineState::default()),
        });

        let relay = &shared.relay;
        let subscriptions = vec![
            relay.on_status(with_weak::<ConnectionStatus, _>(&shared, |s, status| s.on_connection(*status))),
            relay.subscribe(
                MessageKind::Update.as_str(),
                with_weak::<Envelope, _>(&shared, |s, env| s.on_update(env)),
            ),
            relay.subscribe(
                MessageKind::SyncRequest.as_str(),
                with_weak::<Envelope, _>(&shared, |s, env| s.on_sync_request(env)),
            ),
            relay.subscribe(
                MessageKind::SyncResponse.as_str(),
                with_weak::<Envelope, _>(&shared, |s, env| s.on_sync_response(env)),
            ),
            shared
                .text
                .observe(with_weak::<TextChange, _>(&shared, |s, change| {
                    s.on_local_change(change)
                })),
        ];

        shared.on_connection(shared.relay.status());
        Self {
            shared,
            subscriptions: Mutex::new(subscriptions),
        }
    }

    pub fn document_key(&self) -> &str {
        self.shared.key()
    }

    pub fn text(&self) -> &Arc<ReplicatedText> {
        &self.shared.text
    }

    pub fn status(&self) -> SyncStatus {
        *self.shared.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Whether a `sync_response` was merged since the last connect.
    pub fn has_resynced(&self) -> bool {
        self.shared.state.lock().resynced
    }

    /// Ask peers for anything this replica is missing.
    pub fn request_sync(&self) -> Result<(), RelayError> {
        let shared = &self.shared;
        let payload = if shared.text.is_empty() {
            DocumentPayload::sync_request(shared.key())
        } else {
            DocumentPayload::sync_request_since(shared.key(), shared.text.state_vector())
        };
        shared.send_sync_request(payload)?;
        shared.set_status(SyncStatus::Syncing);
        shared.state.lock().retried = true;
        shared.schedule_retry_window();
        Ok(())
    }

    /// Unsubscribe and cancel timers. Safe to call more than once.
    pub fn teardown(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        let timers = {
            let mut state = self.shared.state.lock();
            state.torn_down = true;
            (state.settle.take(), state.retry.take())
        };
        drop(timers);
        drop(subscriptions);
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn with_weak<T, F>(shared: &Arc<EngineShared>, f: F) -> impl Fn(&T) + Send + Sync + 'static
where
    T: 'static,
    F: Fn(&Arc<EngineShared>, &T) + Send + Sync + 'static,
{
    let weak: Weak<EngineShared> = Arc::downgrade(shared);
    move |value: &T| {
        if let Some(shared) = weak.upgrade() {
            f(&shared, value);
        }
    }
}
