use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use tracing::debug;

use canopy_types::NodeKey;

use crate::document::Document;
use crate::error::{StoreError, StoreResult};
use crate::traits::{BatchOperation, DocumentStore};

/// In-memory, HashMap-based document store.
///
/// Intended for tests and embedding. Documents are held behind a `RwLock`
/// and cloned on read. A single write lock makes `apply` trivially atomic.
///
/// The store can be armed to fail its next write via [`fail_next_write`],
/// which tests use to prove that a failed persist leaves no partial state.
///
/// [`fail_next_write`]: InMemoryDocumentStore::fail_next_write
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<NodeKey, Document>>,
    fault: Mutex<Option<String>>,
}

impl InMemoryDocumentStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            fault: Mutex::new(None),
        }
    }

    /// Number of documents currently stored.
    pub fn len(&self) -> usize {
        self.documents.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.documents.read().expect("lock poisoned").is_empty()
    }

    /// Remove all documents from the store.
    pub fn clear(&self) {
        self.documents.write().expect("lock poisoned").clear();
    }

    /// Return a sorted list of all keys in the store.
    pub fn all_keys(&self) -> Vec<NodeKey> {
        let map = self.documents.read().expect("lock poisoned");
        let mut keys: Vec<NodeKey> = map.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Arm the store to reject the next `put`, `remove`, or `apply` with
    /// [`StoreError::Unavailable`]. Reads are unaffected.
    pub fn fail_next_write(&self, reason: impl Into<String>) {
        *self.fault.lock().expect("fault lock poisoned") = Some(reason.into());
    }

    fn take_fault(&self) -> Option<String> {
        self.fault.lock().expect("fault lock poisoned").take()
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn get(&self, key: &NodeKey) -> StoreResult<Option<Document>> {
        let map = self.documents.read().expect("lock poisoned");
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &NodeKey, document: Document) -> StoreResult<()> {
        if let Some(reason) = self.take_fault() {
            return Err(StoreError::Unavailable(reason));
        }
        let mut map = self.documents.write().expect("lock poisoned");
        map.insert(key.clone(), document);
        Ok(())
    }

    fn remove(&self, key: &NodeKey) -> StoreResult<bool> {
        if let Some(reason) = self.take_fault() {
            return Err(StoreError::Unavailable(reason));
        }
        let mut map = self.documents.write().expect("lock poisoned");
        Ok(map.remove(key).is_some())
    }

    fn apply(&self, batch: Vec<BatchOperation>) -> StoreResult<()> {
        // Fail before touching the map, so a refused batch has no effect.
        if let Some(reason) = self.take_fault() {
            return Err(StoreError::Unavailable(reason));
        }
        let count = batch.len();
        let mut map = self.documents.write().expect("lock poisoned");
        for op in batch {
            match op {
                BatchOperation::Put { key, document } => {
                    map.insert(key, document);
                }
                BatchOperation::Remove { key } => {
                    map.remove(&key);
                }
            }
        }
        debug!(operations = count, "applied document batch");
        Ok(())
    }

    fn contains(&self, key: &NodeKey) -> StoreResult<bool> {
        let map = self.documents.read().expect("lock poisoned");
        Ok(map.contains_key(key))
    }
}

impl std::fmt::Debug for InMemoryDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDocumentStore")
            .field("document_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentValue;

    fn key(id: &str) -> NodeKey {
        NodeKey::new("ws", id).unwrap()
    }

    fn doc(marker: i64) -> Document {
        Document::new().with_field("marker", DocumentValue::Long(marker))
    }

    // -----------------------------------------------------------------------
    // Core CRUD
    // -----------------------------------------------------------------------

    #[test]
    fn put_and_get() {
        let store = InMemoryDocumentStore::new();
        store.put(&key("n1"), doc(1)).unwrap();
        let read = store.get(&key("n1")).unwrap().expect("should exist");
        assert_eq!(read, doc(1));
    }

    #[test]
    fn get_missing_returns_none() {
        let store = InMemoryDocumentStore::new();
        assert!(store.get(&key("missing")).unwrap().is_none());
    }

    #[test]
    fn put_overwrites_unconditionally() {
        let store = InMemoryDocumentStore::new();
        store.put(&key("n1"), doc(1)).unwrap();
        store.put(&key("n1"), doc(2)).unwrap();
        assert_eq!(store.get(&key("n1")).unwrap().unwrap(), doc(2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_present_and_missing() {
        let store = InMemoryDocumentStore::new();
        store.put(&key("n1"), doc(1)).unwrap();
        assert!(store.remove(&key("n1")).unwrap());
        assert!(!store.remove(&key("n1")).unwrap());
        assert!(store.get(&key("n1")).unwrap().is_none());
    }

    #[test]
    fn contains_tracks_presence() {
        let store = InMemoryDocumentStore::new();
        assert!(!store.contains(&key("n1")).unwrap());
        store.put(&key("n1"), doc(1)).unwrap();
        assert!(store.contains(&key("n1")).unwrap());
    }

    // -----------------------------------------------------------------------
    // Batch atomicity
    // -----------------------------------------------------------------------

    #[test]
    fn apply_puts_and_removes_in_order() {
        let store = InMemoryDocumentStore::new();
        store.put(&key("old"), doc(0)).unwrap();

        store
            .apply(vec![
                BatchOperation::Put {
                    key: key("a"),
                    document: doc(1),
                },
                BatchOperation::Put {
                    key: key("b"),
                    document: doc(2),
                },
                BatchOperation::Remove { key: key("old") },
            ])
            .unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.get(&key("old")).unwrap().is_none());
        assert_eq!(store.get(&key("b")).unwrap().unwrap(), doc(2));
    }

    #[test]
    fn later_put_in_batch_wins() {
        let store = InMemoryDocumentStore::new();
        store
            .apply(vec![
                BatchOperation::Put {
                    key: key("n1"),
                    document: doc(1),
                },
                BatchOperation::Put {
                    key: key("n1"),
                    document: doc(2),
                },
            ])
            .unwrap();
        assert_eq!(store.get(&key("n1")).unwrap().unwrap(), doc(2));
    }

    #[test]
    fn failed_apply_has_no_effect() {
        let store = InMemoryDocumentStore::new();
        store.put(&key("existing"), doc(0)).unwrap();
        store.fail_next_write("simulated outage");

        let err = store
            .apply(vec![
                BatchOperation::Put {
                    key: key("new"),
                    document: doc(1),
                },
                BatchOperation::Remove {
                    key: key("existing"),
                },
            ])
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        // Nothing changed.
        assert!(store.get(&key("new")).unwrap().is_none());
        assert!(store.get(&key("existing")).unwrap().is_some());
    }

    #[test]
    fn fault_is_consumed_by_one_write() {
        let store = InMemoryDocumentStore::new();
        store.fail_next_write("once");
        assert!(store.put(&key("n1"), doc(1)).is_err());
        assert!(store.put(&key("n1"), doc(1)).is_ok());
    }

    // -----------------------------------------------------------------------
    // Utility methods
    // -----------------------------------------------------------------------

    #[test]
    fn all_keys_is_sorted() {
        let store = InMemoryDocumentStore::new();
        store.put(&key("c"), doc(3)).unwrap();
        store.put(&key("a"), doc(1)).unwrap();
        store.put(&key("b"), doc(2)).unwrap();

        let keys = store.all_keys();
        assert_eq!(keys, vec![key("a"), key("b"), key("c")]);
    }

    #[test]
    fn clear_removes_all() {
        let store = InMemoryDocumentStore::new();
        store.put(&key("a"), doc(1)).unwrap();
        store.clear();
        assert!(store.is_empty());
    }

    // -----------------------------------------------------------------------
    // Concurrent read safety
    // -----------------------------------------------------------------------

    #[test]
    fn concurrent_reads_are_safe() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(InMemoryDocumentStore::new());
        store.put(&key("shared"), doc(7)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let read = store.get(&key("shared")).unwrap();
                    assert_eq!(read.unwrap(), doc(7));
                })
            })
            .collect();

        for h in handles {
            h.join().expect("thread should not panic");
        }
    }
}
