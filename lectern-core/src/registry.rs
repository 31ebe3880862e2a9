//! Keyed registry of live documents.
//!
//! At most one [`ReplicatedText`] exists per document key for the lifetime
//! of the registry. Creation is single-flight: concurrent first requests for
//! the same key observe the same instance, and the loader hook runs once.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::text::ReplicatedText;

/// Hook invoked exactly once when a document is first created.
///
/// The snapshot cache uses this to restore persisted state before any other
/// caller sees the document.
pub trait DocumentLoader: Send + Sync {
    fn on_create(&self, doc: &Arc<ReplicatedText>);
}

#[derive(Default)]
pub struct DocumentRegistry {
    docs: RwLock<HashMap<String, Arc<ReplicatedText>>>,
    loader: Option<Arc<dyn DocumentLoader>>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loader(loader: Arc<dyn DocumentLoader>) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            loader: Some(loader),
        }
    }

    /// Return the document for `key`, creating it on first use.
    pub fn get_or_create(&self, key: &str) -> Arc<ReplicatedText> {
        if let Some(doc) = self.docs.read().get(key) {
            return doc.clone();
        }

        let mut docs = self.docs.write();
        // Another caller may have won the race between the two locks.
        if let Some(doc) = docs.get(key) {
            return doc.clone();
        }

        let doc = Arc::new(ReplicatedText::new(key));
        if let Some(loader) = &self.loader {
            loader.on_create(&doc);
        }
        docs.insert(key.to_string(), doc.clone());
        log::debug!("Created document {key}");
        doc
    }

    pub fn get(&self, key: &str) -> Option<Arc<ReplicatedText>> {
        self.docs.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.docs.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.docs.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Release every document. Callers holding an `Arc` keep theirs alive.
    pub fn teardown(&self) {
        let drained: Vec<_> = self.docs.write().drain().collect();
        log::debug!("Released {} documents", drained.len());
    }
}

impl std::fmt::Debug for DocumentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentRegistry")
            .field("keys", &self.keys())
            .field("loader", &self.loader.is_some())
            .finish()
    }
}
