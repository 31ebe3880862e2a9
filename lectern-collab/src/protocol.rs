//! JSON envelope protocol spoken with the relay hub.
//!
//! Wire format (one JSON text frame per envelope):
//! ```text
//! {
//!   "type":      "update" | "sync_request" | "sync_response" | <other>,
//!   "data":      { ... kind-specific ... },
//!   "sender":    "<participant id>",
//!   "target":    "<participant id>",      (optional)
//!   "timestamp": <unix millis>
//! }
//! ```
//!
//! Document traffic carries a [`DocumentPayload`] in `data`; the `update`
//! field is a JSON array of byte values holding a Yrs v1 update.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Message kinds used by document synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Incremental or full-state update from an editor.
    Update,
    /// Ask peers for their state of a document.
    SyncRequest,
    /// Answer to a `sync_request`, addressed to the requester.
    SyncResponse,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] = [
        MessageKind::Update,
        MessageKind::SyncRequest,
        MessageKind::SyncResponse,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Update => "update",
            MessageKind::SyncRequest => "sync_request",
            MessageKind::SyncResponse => "sync_response",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("failed to encode envelope: {0}")]
    Encode(String),
    #[error("failed to decode envelope: {0}")]
    Decode(String),
    #[error("malformed {kind} payload: {reason}")]
    Payload { kind: String, reason: String },
}

/// Top-level message exchanged through the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub timestamp: u64,
}

impl Envelope {
    /// Stamp a new envelope with the current time.
    pub fn new(kind: impl Into<String>, data: serde_json::Value, sender: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data,
            sender: sender.into(),
            target: None,
            timestamp: now_millis(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Build an envelope around a typed payload.
    pub fn wrap<T: Serialize>(
        kind: impl Into<String>,
        payload: &T,
        sender: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        let kind = kind.into();
        let data = serde_json::to_value(payload).map_err(|e| ProtocolError::Payload {
            kind: kind.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self::new(kind, data, sender))
    }

    pub fn message_kind(&self) -> Option<MessageKind> {
        MessageKind::parse(&self.kind)
    }

    /// Interpret `data` as `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        T::deserialize(&self.data).map_err(|e| ProtocolError::Payload {
            kind: self.kind.clone(),
            reason: e.to_string(),
        })
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// `data` of `update`, `sync_request` and `sync_response` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPayload {
    pub document_key: String,
    #[serde(default)]
    pub update: Vec<u8>,
    /// Participant that asked for a resync. Injected by the hub when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
    /// Requester's encoded state vector; lets the responder send a delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_vector: Option<Vec<u8>>,
}

impl DocumentPayload {
    pub fn update(document_key: impl Into<String>, update: Vec<u8>) -> Self {
        Self {
            document_key: document_key.into(),
            update,
            requester: None,
            state_vector: None,
        }
    }

    /// A request carrying only the document key.
    pub fn sync_request(document_key: impl Into<String>) -> Self {
        Self::update(document_key, Vec::new())
    }

    pub fn sync_request_since(document_key: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self {
            state_vector: Some(state_vector),
            ..Self::sync_request(document_key)
        }
    }

    pub fn sync_response(
        document_key: impl Into<String>,
        update: Vec<u8>,
        requester: impl Into<String>,
    ) -> Self {
        Self {
            requester: Some(requester.into()),
            ..Self::update(document_key, update)
        }
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
