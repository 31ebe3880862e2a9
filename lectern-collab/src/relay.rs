//! Relay client: pub/sub over a duplex channel to the relay hub.
//!
//! ```text
//!            publish/send                 ┌──────────────┐
//! engine ───────────────► outgoing tx ──► │ writer task  │ ──► WebSocket
//!                                         └──────────────┘
//!                                         ┌──────────────┐
//! subscribers ◄── dispatch(kind) ◄─────── │ reader task  │ ◄── WebSocket
//!                                         └──────────────┘
//! ```
//!
//! Subscriptions live on the client, not on the link, so they survive
//! reconnects. Publishing while the link is not open drops the envelope;
//! nothing is queued.
//!
//! Every connect/attach/close bumps a generation counter. Status changes
//! reported by a link that has since been replaced are ignored.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use lectern_core::{ConnectionStatus, HandlerRegistry, SessionContext, Subscription};

use crate::protocol::{DocumentPayload, Envelope, MessageKind, ProtocolError};
use crate::schedule::ScheduledTask;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The link is not open; the envelope was dropped.
    #[error("relay channel unavailable")]
    ChannelUnavailable,
    #[error("failed to connect: {0}")]
    Connect(String),
    /// A newer connect/attach/close happened while connecting.
    #[error("connection attempt superseded")]
    Superseded,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Hub location for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Base WebSocket URL, e.g. `ws://localhost:8081`.
    pub server_url: String,
    pub session_id: String,
}

impl RelayConfig {
    pub fn new(server_url: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            session_id: session_id.into(),
        }
    }

    /// `<server_url>/ws/classroom/<session_id>?zcode=..&role=..&name=..`
    pub fn session_url(&self, context: &SessionContext) -> Result<String, RelayError> {
        let base = self.server_url.trim_end_matches('/');
        let mut url = url::Url::parse(&format!("{base}/ws/classroom/{}", self.session_id))
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("zcode", &context.participant_id)
            .append_pair("role", context.role.wire_name())
            .append_pair("name", &context.display_name);
        Ok(url.into())
    }
}

/// One end of a duplex channel of JSON text frames.
#[derive(Debug)]
pub struct Link {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

impl Link {
    /// Two connected in-process ends.
    pub fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Link {
                outgoing: a_tx,
                incoming: b_rx,
            },
            Link {
                outgoing: b_tx,
                incoming: a_rx,
            },
        )
    }
}

struct ActiveLink {
    generation: u64,
    outgoing: mpsc::UnboundedSender<String>,
    /// Aborted when the link is replaced or closed.
    tasks: Vec<ScheduledTask>,
}

struct RelayInner {
    participant_id: String,
    status_tx: watch::Sender<ConnectionStatus>,
    status_listeners: HandlerRegistry<(), ConnectionStatus>,
    subscribers: HandlerRegistry<String, Envelope>,
    link: Mutex<Option<ActiveLink>>,
    generation: AtomicU64,
    frames_sent: AtomicU64,
}

impl RelayInner {
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_status(&self, generation: u64, status: ConnectionStatus) {
        if !self.is_current(generation) {
            return;
        }
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            log::info!("Relay {}: {previous} -> {status}", self.participant_id);
            self.status_listeners.dispatch(&(), &status);
        }
    }

    /// First close report for a generation wins; later ones are ignored.
    fn link_closed(&self, generation: u64, status: ConnectionStatus) {
        let closed = {
            let mut link = self.link.lock();
            match link.as_ref() {
                Some(active) if active.generation == generation => link.take(),
                _ => None,
            }
        };
        if closed.is_some() {
            self.set_status(generation, status);
        }
    }

    fn handle_frame(&self, frame: &str) {
        match Envelope::decode(frame) {
            Ok(envelope) => {
                log::trace!("Relay received {} from {}", envelope.kind, envelope.sender);
                self.subscribers.dispatch(&envelope.kind, &envelope);
            }
            Err(e) => log::warn!("Ignoring inbound frame: {e}"),
        }
    }
}

/// Cheap to clone; clones share one connection and one subscriber set.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<RelayInner>,
}

impl RelayClient {
    pub fn new(participant_id: impl Into<String>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(RelayInner {
                participant_id: participant_id.into(),
                status_tx,
                status_listeners: HandlerRegistry::new(),
                subscribers: HandlerRegistry::new(),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                frames_sent: AtomicU64::new(0),
            }),
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.inner.participant_id
    }

    /// Open a WebSocket to `url`, replacing any existing link.
    pub async fn connect(&self, url: &str) -> Result<(), RelayError> {
        let generation = self.replace_link();
        self.inner.set_status(generation, ConnectionStatus::Connecting);
        log::info!("Connecting to {url}");

        let ws = match tokio_tungstenite::connect_async(url).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                self.inner.set_status(generation, ConnectionStatus::Error);
                return Err(RelayError::Connect(e.to_string()));
            }
        };
        if !self.inner.is_current(generation) {
            return Err(RelayError::Superseded);
        }

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        // Ends when the outgoing sender is dropped, then closes the socket.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                    log::warn!("Relay write failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let weak = Arc::downgrade(&self.inner);
        let socket_reader = ScheduledTask::spawn(async move {
            while let Some(msg) = stream.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            log::warn!("Ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        log::warn!("Relay socket error: {e}");
                        if let Some(inner) = weak.upgrade() {
                            inner.link_closed(generation, ConnectionStatus::Error);
                        }
                        return;
                    }
                };
                if in_tx.send(frame).is_err() {
                    break;
                }
            }
        });

        let link = Link {
            outgoing: out_tx,
            incoming: in_rx,
        };
        self.install(generation, link, socket_reader.into_iter().collect())
    }

    /// Use an already-open duplex channel, replacing any existing link.
    ///
    /// Listeners see `connecting` before `connected`, also when a live link
    /// is swapped out.
    pub fn attach(&self, link: Link) {
        let generation = self.replace_link();
        self.inner.set_status(generation, ConnectionStatus::Connecting);
        // A fresh generation cannot be superseded before install runs.
        let _ = self.install(generation, link, Vec::new());
    }

    /// Close the current link, if any. Subscriptions are kept.
    pub fn close(&self) {
        let was = self.status();
        let generation = self.replace_link();
        if matches!(
            was,
            ConnectionStatus::Connected | ConnectionStatus::Connecting
        ) {
            self.inner
                .set_status(generation, ConnectionStatus::Disconnected);
        }
    }

    fn replace_link(&self) -> u64 {
        let generation = self.inner.next_generation();
        let old = self.inner.link.lock().take();
        drop(old);
        generation
    }

    fn install(
        &self,
        generation: u64,
        link: Link,
        mut tasks: Vec<ScheduledTask>,
    ) -> Result<(), RelayError> {
        let Link {
            outgoing,
            mut incoming,
        } = link;
        {
            let mut slot = self.inner.link.lock();
            if !self.inner.is_current(generation) {
                return Err(RelayError::Superseded);
            }
            *slot = Some(ActiveLink {
                generation,
                outgoing,
                tasks: Vec::new(),
            });
        }
        self.inner.set_status(generation, ConnectionStatus::Connected);

        let weak: Weak<RelayInner> = Arc::downgrade(&self.inner);
        let reader = ScheduledTask::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                match weak.upgrade() {
                    Some(inner) => inner.handle_frame(&frame),
                    None => return,
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.link_closed(generation, ConnectionStatus::Disconnected);
            }
        });
        tasks.extend(reader);

        let mut slot = self.inner.link.lock();
        match slot.as_mut() {
            Some(active) if active.generation == generation => {
                active.tasks = tasks;
                Ok(())
            }
            // Replaced during status dispatch; dropping the tasks aborts them.
            _ => Err(RelayError::Superseded),
        }
    }

    /// Publish a document envelope of `kind`.
    pub fn publish(
        &self,
        document_key: &str,
        update: Vec<u8>,
        kind: MessageKind,
    ) -> Result<(), RelayError> {
        self.publish_payload(kind, &DocumentPayload::update(document_key, update))
    }

    pub fn publish_payload(
        &self,
        kind: MessageKind,
        payload: &DocumentPayload,
    ) -> Result<(), RelayError> {
        let envelope = Envelope::wrap(kind.as_str(), payload, self.participant_id())?;
        self.send_envelope(envelope)
    }

    /// Send an arbitrary envelope, optionally addressed to one participant.
    pub fn send(
        &self,
        kind: &str,
        data: serde_json::Value,
        target: Option<&str>,
    ) -> Result<(), RelayError> {
        let mut envelope = Envelope::new(kind, data, self.participant_id());
        envelope.target = target.map(str::to_string);
        self.send_envelope(envelope)
    }

    /// Send a fully built envelope. Dropped unless the link is open.
    pub fn send_envelope(&self, envelope: Envelope) -> Result<(), RelayError> {
        if !self.is_connected() {
            log::debug!("Dropping {} while {}", envelope.kind, self.status());
            return Err(RelayError::ChannelUnavailable);
        }
        let frame = envelope.encode()?;
        let link = self.inner.link.lock();
        let active = link.as_ref().ok_or(RelayError::ChannelUnavailable)?;
        active
            .outgoing
            .send(frame)
            .map_err(|_| RelayError::ChannelUnavailable)?;
        self.inner.frames_sent.fetch_add(1, Ordering::Relaxed);
        log::trace!("Relay sent {}", envelope.kind);
        Ok(())
    }

    /// Register `f` for envelopes whose `type` equals `kind`.
    pub fn subscribe<F>(&self, kind: impl Into<String>, f: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner.subscribers.subscribe(kind.into(), f)
    }

    pub fn subscriber_count(&self, kind: &str) -> usize {
        self.inner.subscribers.count(&kind.to_string())
    }

    pub fn has_subscribers(&self, kind: &str) -> bool {
        self.inner.subscribers.contains_key(&kind.to_string())
    }

    /// Deliver an envelope to local subscribers as if it had arrived.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        self.inner.subscribers.dispatch(&envelope.kind, envelope)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Receiver for display consumers.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Synchronous listener invoked on every status change.
    pub fn on_status<F>(&self, f: F) -> Subscription
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.inner.status_listeners.subscribe((), f)
    }

    /// Frames handed to the link since creation.
    pub fn frames_sent(&self) -> u64 {
        self.inner.frames_sent.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("participant_id", &self.inner.participant_id)
            .field("status", &self.status())
            .finish()
    }
}
