//! Replicated text model backed by a Yrs document.
//!
//! Each [`ReplicatedText`] owns one `yrs::Doc` holding a single root text
//! named after the document key. Local edits and merged remote updates go
//! through the same path:
//!
//! ```text
//! insert/delete/reset/apply_update
//!        │  (txn lock held)
//!        ▼
//!   yrs TransactionMut ── encode_update_v1 ──► delta
//!        │  (txn committed, lock released)
//!        ▼
//!   observers(delta, origin)
//! ```
//!
//! Observers run after the transaction commits, so they are free to read
//! the document or trigger further mutations.
//!
//! Positions and lengths are counted in Unicode scalar values and clamp to
//! the current content.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use yrs::block::ClientID;
use yrs::encoding::read::{self, Read};
use yrs::updates::decoder::{Decode, Decoder, DecoderV1};
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, Transact, Update,
    WriteTxn, ID,
};

use crate::handlers::{HandlerRegistry, Subscription};

/// Encoding of an update that carries no operations.
pub const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// Source of a mutation. Governs whether the change is rebroadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    /// Typed by the local participant.
    Local,
    /// Merged from an `update` envelope.
    Remote,
    /// Merged from a `sync_response` envelope.
    Sync,
    /// Restored from the local snapshot cache.
    StorageLoad,
    /// Whole-content replacement.
    Reset,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Remote => "remote",
            Origin::Sync => "sync",
            Origin::StorageLoad => "storage-load",
            Origin::Reset => "reset",
        }
    }

    /// Whether a change with this origin may be published to peers.
    pub fn is_republishable(self) -> bool {
        !matches!(self, Origin::Remote | Origin::Sync | Origin::StorageLoad)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed mutation as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    /// Yrs v1 update containing exactly the operations of this mutation.
    pub update: Vec<u8>,
    pub origin: Origin,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TextError {
    #[error("malformed update: {0}")]
    MalformedUpdate(String),
    #[error("malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("update rejected: {0}")]
    Rejected(String),
}

/// Whether `update` encodes no operations at all.
pub fn is_empty_update(update: &[u8]) -> bool {
    update.is_empty() || update == EMPTY_UPDATE
}

/// CRDT text sequence for one document key.
pub struct ReplicatedText {
    key: String,
    doc: Doc,
    /// Serializes Yrs transactions; never held while observers run.
    txn_lock: RwLock<()>,
    observers: HandlerRegistry<(), TextChange>,
}

impl ReplicatedText {
    pub fn new(key: impl Into<String>) -> Self {
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Bytes,
            ..Options::default()
        });
        Self {
            key: key.into(),
            doc,
            txn_lock: RwLock::new(()),
            observers: HandlerRegistry::new(),
        }
    }

    /// Document key; also the name of the root text inside the Yrs doc.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Insert `chunk` at `position`, tagged [`Origin::Local`].
    ///
    /// Returns the produced delta, or `None` when nothing changed.
    pub fn insert(&self, position: u32, chunk: &str) -> Option<Vec<u8>> {
        self.insert_with(position, chunk, Origin::Local)
    }

    pub fn insert_with(&self, position: u32, chunk: &str, origin: Origin) -> Option<Vec<u8>> {
        if chunk.is_empty() {
            return None;
        }
        let update = {
            let _guard = self.txn_lock.write();
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(self.key.as_str());
            let current = text.get_string(&txn);
            let offset = byte_offset(&current, position);
            text.insert(&mut txn, offset, chunk);
            txn.encode_update_v1()
        };
        self.notify(update, origin)
    }

    /// Delete `len` characters starting at `position`, tagged [`Origin::Local`].
    pub fn delete(&self, position: u32, len: u32) -> Option<Vec<u8>> {
        self.delete_with(position, len, Origin::Local)
    }

    pub fn delete_with(&self, position: u32, len: u32, origin: Origin) -> Option<Vec<u8>> {
        if len == 0 {
            return None;
        }
        let update = {
            let _guard = self.txn_lock.write();
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(self.key.as_str());
            let current = text.get_string(&txn);
            let start = byte_offset(&current, position);
            let end = byte_offset(&current, position.saturating_add(len));
            if end <= start {
                return None;
            }
            text.remove_range(&mut txn, start, end - start);
            txn.encode_update_v1()
        };
        self.notify(update, origin)
    }

    /// Replace the whole content in one transaction tagged [`Origin::Reset`].
    pub fn reset(&self, content: &str) -> Option<Vec<u8>> {
        let update = {
            let _guard = self.txn_lock.write();
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(self.key.as_str());
            let current = text.get_string(&txn);
            if current == content {
                return None;
            }
            if !current.is_empty() {
                text.remove_range(&mut txn, 0, current.len() as u32);
            }
            if !content.is_empty() {
                text.insert(&mut txn, 0, content);
            }
            txn.encode_update_v1()
        };
        self.notify(update, Origin::Reset)
    }

    /// Merge an encoded update.
    ///
    /// The payload is fully decoded before the document is touched, so a
    /// malformed update never partially applies. Returns `Ok(false)` when the
    /// update was already incorporated.
    ///
    /// Strings inside the payload are checked for valid UTF-8. The stock yrs
    /// v1 decoder reinterprets them unchecked, which turns a corrupt frame
    /// into undefined behavior instead of an error.
    pub fn apply_update(&self, update: &[u8], origin: Origin) -> Result<bool, TextError> {
        let decoded = Update::decode(&mut CheckedDecoder::new(update))
            .map_err(|e| TextError::MalformedUpdate(e.to_string()))?;
        let delta = {
            let _guard = self.txn_lock.write();
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| TextError::Rejected(format!("{e:?}")))?;
            txn.encode_update_v1()
        };
        Ok(self.notify(delta, origin).is_some())
    }

    /// Full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let _guard = self.txn_lock.read();
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encoded state vector summarizing every incorporated operation.
    pub fn state_vector(&self) -> Vec<u8> {
        let _guard = self.txn_lock.read();
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Minimal update for a peer whose encoded state vector is `state_vector`.
    pub fn encode_delta_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, TextError> {
        let remote = StateVector::decode_v1(state_vector)
            .map_err(|e| TextError::MalformedStateVector(e.to_string()))?;
        let _guard = self.txn_lock.read();
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    pub fn content(&self) -> String {
        let _guard = self.txn_lock.read();
        let txn = self.doc.transact();
        txn.get_text(self.key.as_str())
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    /// Length in characters.
    pub fn len(&self) -> u32 {
        self.content().chars().count() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.content().is_empty()
    }

    /// Register an observer fired after every committed mutation.
    pub fn observe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&TextChange) + Send + Sync + 'static,
    {
        self.observers.subscribe((), f)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.count(&())
    }

    fn notify(&self, update: Vec<u8>, origin: Origin) -> Option<Vec<u8>> {
        if is_empty_update(&update) {
            return None;
        }
        log::trace!(
            "{}: {} byte change ({origin})",
            self.key,
            update.len()
        );
        let change = TextChange { update, origin };
        self.observers.dispatch(&(), &change);
        Some(change.update)
    }
}

impl fmt::Debug for ReplicatedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedText")
            .field("key", &self.key)
            .field("observers", &self.observer_count())
            .finish()
    }
}

/// Byte offset of the `chars`-th character, clamped to the end of `s`.
fn byte_offset(s: &str, chars: u32) -> u32 {
    s.char_indices()
        .nth(chars as usize)
        .map_or(s.len(), |(i, _)| i) as u32
}

/// V1 update decoder that rejects strings which are not valid UTF-8.
///
/// Integer fields delegate to [`DecoderV1`]. Every string read, including
/// those nested in `Any` values, goes through the checked `read_string`.
struct CheckedDecoder<'a> {
    inner: DecoderV1<'a>,
}

impl<'a> CheckedDecoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        CheckedDecoder {
            inner: DecoderV1::from(buf),
        }
    }
}

impl Read for CheckedDecoder<'_> {
    fn read_exact(&mut self, len: usize) -> Result<&[u8], read::Error> {
        self.inner.read_exact(len)
    }

    fn read_u8(&mut self) -> Result<u8, read::Error> {
        self.inner.read_u8()
    }

    fn read_string(&mut self) -> Result<&str, read::Error> {
        let buf = self.read_buf()?;
        std::str::from_utf8(buf).map_err(|e| read::Error::Custom(format!("invalid string: {e}")))
    }
}

impl Decoder for CheckedDecoder<'_> {
    fn reset_ds_cur_val(&mut self) {
        self.inner.reset_ds_cur_val()
    }

    fn read_ds_clock(&mut self) -> Result<u32, read::Error> {
        self.inner.read_ds_clock()
    }

    fn read_ds_len(&mut self) -> Result<u32, read::Error> {
        self.inner.read_ds_len()
    }

    fn read_left_id(&mut self) -> Result<ID, read::Error> {
        self.inner.read_left_id()
    }

    fn read_right_id(&mut self) -> Result<ID, read::Error> {
        self.inner.read_right_id()
    }

    fn read_client(&mut self) -> Result<ClientID, read::Error> {
        self.inner.read_client()
    }

    fn read_info(&mut self) -> Result<u8, read::Error> {
        self.inner.read_info()
    }

    fn read_parent_info(&mut self) -> Result<bool, read::Error> {
        self.inner.read_parent_info()
    }

    fn read_type_ref(&mut self) -> Result<u8, read::Error> {
        self.inner.read_type_ref()
    }

    fn read_len(&mut self) -> Result<u32, read::Error> {
        self.inner.read_len()
    }

    fn read_any(&mut self) -> Result<Any, read::Error> {
        Any::decode(self)
    }

    fn read_json(&mut self) -> Result<Any, read::Error> {
        let src = self.read_string()?;
        Any::from_json(src)
    }

    fn read_key(&mut self) -> Result<Arc<str>, read::Error> {
        Ok(self.read_string()?.into())
    }

    fn read_to_end(&mut self) -> Result<&[u8], read::Error> {
        self.inner.read_to_end()
    }
}
