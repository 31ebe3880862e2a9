//! Debounced snapshot persistence for live documents.
//!
//! The cache restores a document from its [`SnapshotStore`] when the
//! registry first creates it, then observes the document and writes a fresh
//! snapshot once changes stop arriving for [`SnapshotConfig::debounce`].
//! Changes tagged [`Origin::StorageLoad`] never schedule a save.

use lectern_core::{DocumentLoader, Origin, ReplicatedText, Subscription};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::{SnapshotRecord, SnapshotStore, StoreError};
use crate::protocol::now_millis;
use crate::schedule::ScheduledTask;

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Quiet period before a save (default: 1s)
    pub debounce: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
        }
    }
}

impl SnapshotConfig {
    pub fn for_testing() -> Self {
        Self {
            debounce: Duration::from_millis(20),
        }
    }
}

struct Tracked {
    doc: Weak<ReplicatedText>,
    _observer: Subscription,
    pending: Option<ScheduledTask>,
}

struct CacheInner {
    store: Arc<dyn SnapshotStore>,
    config: SnapshotConfig,
    tracked: Mutex<HashMap<String, Tracked>>,
}

impl CacheInner {
    fn schedule(self: &Arc<Self>, key: &str) {
        let weak = Arc::downgrade(self);
        let task_key = key.to_string();
        let task = ScheduledTask::after(self.config.debounce, move || {
            if let Some(inner) = weak.upgrade() {
                inner.save_now(&task_key);
            }
        });

        match task {
            Some(task) => {
                // Replacing the previous timer aborts it.
                let previous = self
                    .tracked
                    .lock()
                    .get_mut(key)
                    .and_then(|t| t.pending.replace(task));
                drop(previous);
            }
            None => {
                self.save_now(key);
            }
        }
    }

    /// Write the current state of `key`. Failures are logged.
    fn save_now(&self, key: &str) -> bool {
        let (doc, pending) = {
            let mut tracked = self.tracked.lock();
            match tracked.get_mut(key) {
                Some(t) => (t.doc.upgrade(), t.pending.take()),
                None => (None, None),
            }
        };
        // Dropping our own finished timer is harmless.
        drop(pending);

        let Some(doc) = doc else {
            return false;
        };
        match self.persist(&doc) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to save snapshot for {key}: {e}");
                false
            }
        }
    }

    fn persist(&self, doc: &ReplicatedText) -> Result<(), StoreError> {
        let record = SnapshotRecord {
            update: doc.encode_state(),
            timestamp: now_millis(),
        };
        self.store.put(doc.key(), &record)?;
        log::debug!(
            "Saved snapshot for {} ({} bytes)",
            doc.key(),
            record.update.len()
        );
        Ok(())
    }
}

/// Restores documents on creation and keeps their snapshots current.
///
/// Cloning yields a handle to the same cache.
#[derive(Clone)]
pub struct SnapshotCache {
    inner: Arc<CacheInner>,
}

impl SnapshotCache {
    pub fn new(store: Arc<dyn SnapshotStore>, config: SnapshotConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store,
                config,
                tracked: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.inner.store
    }

    /// Apply the stored snapshot for `doc`, if any.
    ///
    /// Returns whether a snapshot was restored. Missing or unreadable
    /// snapshots leave the document untouched.
    pub fn load(&self, doc: &ReplicatedText) -> bool {
        let key = doc.key();
        let record = match self.inner.store.get(key) {
            Ok(Some(record)) => record,
            Ok(None) => {
                log::debug!("No snapshot for {key}");
                return false;
            }
            Err(e) => {
                log::warn!("Ignoring unreadable snapshot for {key}: {e}");
                return false;
            }
        };

        match doc.apply_update(&record.update, Origin::StorageLoad) {
            Ok(_) => {
                log::info!(
                    "Restored {key} from snapshot taken at {}",
                    record.timestamp
                );
                true
            }
            Err(e) => {
                log::warn!("Ignoring corrupt snapshot for {key}: {e}");
                false
            }
        }
    }

    /// Start saving `doc` after local or remote changes.
    pub fn track(&self, doc: &Arc<ReplicatedText>) {
        let key = doc.key().to_string();
        let weak = Arc::downgrade(&self.inner);
        let observed_key = key.clone();
        let observer = doc.observe(move |change| {
            if change.origin == Origin::StorageLoad {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.schedule(&observed_key);
            }
        });

        self.inner.tracked.lock().insert(
            key,
            Tracked {
                doc: Arc::downgrade(doc),
                _observer: observer,
                pending: None,
            },
        );
    }

    pub fn is_tracked(&self, key: &str) -> bool {
        self.inner.tracked.lock().contains_key(key)
    }

    pub fn has_pending(&self, key: &str) -> bool {
        self.inner
            .tracked
            .lock()
            .get(key)
            .is_some_and(|t| t.pending.is_some())
    }

    /// Schedule a debounced save of `key`.
    pub fn save(&self, key: &str) {
        if self.is_tracked(key) {
            self.inner.schedule(key);
        }
    }

    /// Save `key` immediately, cancelling its pending timer.
    pub fn save_now(&self, key: &str) -> bool {
        self.inner.save_now(key)
    }

    /// Write a snapshot of `doc` synchronously, reporting the outcome.
    pub fn persist(&self, doc: &ReplicatedText) -> Result<(), StoreError> {
        self.inner.persist(doc)
    }

    /// Save every document with a pending timer. Returns how many were written.
    pub fn flush(&self) -> usize {
        let keys: Vec<String> = self
            .inner
            .tracked
            .lock()
            .iter()
            .filter(|(_, t)| t.pending.is_some())
            .map(|(k, _)| k.clone())
            .collect();
        keys.iter().filter(|key| self.inner.save_now(key)).count()
    }

    /// Stop tracking everything and cancel pending saves without writing.
    pub fn teardown(&self) {
        let tracked: Vec<Tracked> = self.inner.tracked.lock().drain().map(|(_, t)| t).collect();
        let dropped = tracked.iter().filter(|t| t.pending.is_some()).count();
        drop(tracked);
        if dropped > 0 {
            log::debug!("Snapshot cache torn down with {dropped} pending saves cancelled");
        }
    }
}

impl DocumentLoader for SnapshotCache {
    fn on_create(&self, doc: &Arc<ReplicatedText>) {
        self.load(doc);
        self.track(doc);
    }
}

impl std::fmt::Debug for SnapshotCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCache")
            .field("config", &self.inner.config)
            .field("tracked", &self.inner.tracked.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileSnapshotStore, MemorySnapshotStore};
    use lectern_core::DocumentRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingStore {
        inner: MemorySnapshotStore,
        puts: AtomicUsize,
    }

    impl SnapshotStore for CountingStore {
        fn put(&self, key: &str, record: &SnapshotRecord) -> Result<(), StoreError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.inner.put(key, record)
        }

        fn get(&self, key: &str) -> Result<Option<SnapshotRecord>, StoreError> {
            self.inner.get(key)
        }

        fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.inner.remove(key)
        }
    }

    struct FailingStore;

    impl SnapshotStore for FailingStore {
        fn put(&self, _key: &str, _record: &SnapshotRecord) -> Result<(), StoreError> {
            Err(StoreError::Database("disk full".into()))
        }

        fn get(&self, _key: &str) -> Result<Option<SnapshotRecord>, StoreError> {
            Err(StoreError::Database("disk gone".into()))
        }

        fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn cached_registry(store: Arc<dyn SnapshotStore>) -> (SnapshotCache, DocumentRegistry) {
        let cache = SnapshotCache::new(store, SnapshotConfig::for_testing());
        let registry = DocumentRegistry::with_loader(Arc::new(cache.clone()));
        (cache, registry)
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_roundtrip_across_registries() {
        let dir = tempfile::tempdir().unwrap();

        let original = {
            let store = Arc::new(FileSnapshotStore::open(dir.path()).unwrap());
            let (cache, registry) = cached_registry(store);
            let doc = registry.get_or_create("teacher-code");
            doc.insert(0, "print(1)\n");
            doc.insert(9, "print(2)");
            assert!(cache.has_pending("teacher-code"));

            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(!cache.has_pending("teacher-code"));
            doc.content()
        };

        let store = Arc::new(FileSnapshotStore::open(dir.path()).unwrap());
        let (_cache, registry) = cached_registry(store);
        let doc = registry.get_or_create("teacher-code");
        assert_eq!(doc.content(), original);
        assert_eq!(doc.content(), "print(1)\nprint(2)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_saves_are_debounced() {
        let store = Arc::new(CountingStore::default());
        let (_cache, registry) = cached_registry(store.clone());
        let doc = registry.get_or_create("k");

        for (i, ch) in "hello".chars().enumerate() {
            doc.insert(i as u32, &ch.to_string());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
        assert!(store.get("k").unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_load_is_not_saved_back() {
        let store = Arc::new(CountingStore::default());
        let seed = ReplicatedText::new("k");
        seed.insert(0, "persisted");
        store
            .inner
            .put(
                "k",
                &SnapshotRecord {
                    update: seed.encode_state(),
                    timestamp: 1,
                },
            )
            .unwrap();

        let (cache, registry) = cached_registry(store.clone());
        let doc = registry.get_or_create("k");
        assert_eq!(doc.content(), "persisted");
        assert!(!cache.has_pending("k"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_changes_are_saved() {
        let store = Arc::new(CountingStore::default());
        let (_cache, registry) = cached_registry(store.clone());
        let doc = registry.get_or_create("k");

        let peer = ReplicatedText::new("k");
        let update = peer.insert(0, "from afar").unwrap();
        doc.apply_update(&update, Origin::Remote).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open(dir.path()).unwrap();
        std::fs::write(store.path_for("k"), b"garbage").unwrap();

        let (_cache, registry) = cached_registry(Arc::new(store));
        let doc = registry.get_or_create("k");
        assert!(doc.is_empty());
    }

    #[test]
    fn test_corrupt_update_starts_empty() {
        let store = Arc::new(MemorySnapshotStore::new());
        store
            .put(
                "k",
                &SnapshotRecord {
                    update: vec![0xFF, 0xFF, 0xFF],
                    timestamp: 1,
                },
            )
            .unwrap();

        let (_cache, registry) = cached_registry(store);
        assert!(registry.get_or_create("k").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_cancels_pending_saves() {
        let store = Arc::new(CountingStore::default());
        let (cache, registry) = cached_registry(store.clone());
        let doc = registry.get_or_create("k");
        doc.insert(0, "unsaved");
        assert!(cache.has_pending("k"));

        cache.teardown();
        assert!(!cache.is_tracked("k"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);

        doc.insert(0, "after ");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_writes_pending() {
        let store = Arc::new(CountingStore::default());
        let (cache, registry) = cached_registry(store.clone());
        registry.get_or_create("a").insert(0, "a");
        registry.get_or_create("b").insert(0, "b");
        let _idle = registry.get_or_create("c");

        assert_eq!(cache.flush(), 2);
        assert_eq!(store.puts.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.puts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_store_is_not_fatal() {
        let (cache, registry) = cached_registry(Arc::new(FailingStore));
        let doc = registry.get_or_create("k");
        doc.insert(0, "still editable");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(doc.content(), "still editable");
        assert!(cache.persist(&doc).is_err());
        assert!(!cache.save_now("k"));
    }

    #[test]
    fn test_saves_immediately_without_runtime() {
        let store = Arc::new(CountingStore::default());
        let (_cache, registry) = cached_registry(store.clone());
        registry.get_or_create("k").insert(0, "x");
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_document_is_skipped() {
        let store = Arc::new(CountingStore::default());
        let cache = SnapshotCache::new(store.clone(), SnapshotConfig::for_testing());
        let doc = Arc::new(ReplicatedText::new("k"));
        cache.track(&doc);
        drop(doc);

        assert!(!cache.save_now("k"));
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);
    }
}
