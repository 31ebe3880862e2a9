//! Test relay hubs.
//!
//! Both hubs route like the production relay: a `sync_request` gets the
//! sender injected as `requester` and is broadcast, a `sync_response` goes
//! only to its requester, anything else goes to its `target` or to every
//! other participant.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use lectern_collab::{Envelope, Link, MessageKind, RelayClient, ScheduledTask};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

pub type Peers = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>>;

pub fn route(peers: &Peers, from: &str, frame: &str) {
    let Ok(mut envelope) = Envelope::decode(frame) else {
        return;
    };
    if envelope.sender.is_empty() {
        envelope.sender = from.to_string();
    }

    let mut target = envelope.target.clone();
    match envelope.message_kind() {
        Some(MessageKind::SyncRequest) => {
            if envelope.data.get("requester").map_or(true, |r| r.is_null()) {
                envelope.data["requester"] = json!(from);
            }
        }
        Some(MessageKind::SyncResponse) => {
            if let Some(requester) = envelope.data.get("requester").and_then(|r| r.as_str()) {
                target = Some(requester.to_string());
            }
        }
        _ => {}
    }

    let frame = envelope.encode().unwrap();
    let peers = peers.lock();
    match target {
        Some(target) => {
            if let Some(tx) = peers.get(&target) {
                let _ = tx.send(frame);
            }
        }
        None => {
            for (id, tx) in peers.iter() {
                if id != from {
                    let _ = tx.send(frame.clone());
                }
            }
        }
    }
}

/// In-process hub over [`Link`]s. Works under paused time.
#[derive(Clone, Default)]
pub struct LinkHub {
    peers: Peers,
    routers: Arc<Mutex<HashMap<String, ScheduledTask>>>,
}

impl LinkHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, relay: &RelayClient) {
        let id = relay.participant_id().to_string();
        let (ours, theirs) = Link::pair();
        let Link {
            outgoing,
            mut incoming,
        } = theirs;
        self.peers.lock().insert(id.clone(), outgoing);

        let peers = self.peers.clone();
        let from = id.clone();
        let router = ScheduledTask::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                route(&peers, &from, &frame);
            }
        })
        .unwrap();
        self.routers.lock().insert(id, router);
        relay.attach(ours);
    }

    /// Drop the participant's link as if the network went away.
    pub fn leave(&self, participant_id: &str) {
        self.peers.lock().remove(participant_id);
        let router = self.routers.lock().remove(participant_id);
        drop(router);
    }

    pub fn participants(&self) -> usize {
        self.peers.lock().len()
    }
}

fn participant_from(request: &Request) -> String {
    request
        .uri()
        .query()
        .and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == "zcode")
                .map(|(_, v)| v.into_owned())
        })
        .unwrap_or_default()
}

/// Real WebSocket hub on a free local port. Returns the `ws://` base URL.
pub async fn spawn_ws_hub() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let peers: Peers = Arc::default();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let peers = peers.clone();
            tokio::spawn(async move {
                let mut participant = String::new();
                let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                    participant = participant_from(request);
                    Ok(response)
                };
                let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };
                let (mut sink, mut stream) = ws.split();
                let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                let own = tx.clone();
                peers.lock().insert(participant.clone(), tx);

                tokio::spawn(async move {
                    while let Some(frame) = rx.recv().await {
                        if sink.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                });

                while let Some(Ok(msg)) = stream.next().await {
                    if let Message::Text(text) = msg {
                        route(&peers, &participant, text.as_str());
                    }
                }
                // A reconnect may already have registered a newer socket.
                let mut peers = peers.lock();
                if peers.get(&participant).is_some_and(|tx| tx.same_channel(&own)) {
                    peers.remove(&participant);
                }
            });
        }
    });

    // Give the listener a moment to start accepting.
    tokio::time::sleep(Duration::from_millis(20)).await;
    format!("ws://127.0.0.1:{port}")
}

/// Let spawned tasks drain, then move paused time forward.
pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Poll `check` under real time until it holds or `limit` passes.
pub async fn eventually<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
