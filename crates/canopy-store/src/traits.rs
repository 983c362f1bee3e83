use canopy_types::NodeKey;

use crate::document::Document;
use crate::error::StoreResult;

/// One operation inside an atomic batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOperation {
    Put { key: NodeKey, document: Document },
    Remove { key: NodeKey },
}

impl BatchOperation {
    pub fn key(&self) -> &NodeKey {
        match self {
            Self::Put { key, .. } => key,
            Self::Remove { key } => key,
        }
    }
}

/// Pluggable durable key-to-document persistence.
///
/// All implementations must satisfy these invariants:
/// - `get` returns `Ok(None)` for unknown keys; absence is never an error.
/// - `put` overwrites unconditionally.
/// - `apply` is all-or-nothing: if it returns an error, no operation in the
///   batch has taken effect. This is the hook that lets a commit participate
///   in an ambient transaction.
/// - Reads are at least session-consistent: a `get` issued after a
///   successful `put`/`apply` on the same handle observes it.
pub trait DocumentStore: Send + Sync {
    /// Read the document stored under `key`, if any.
    fn get(&self, key: &NodeKey) -> StoreResult<Option<Document>>;

    /// Store `document` under `key`, replacing any existing document.
    fn put(&self, key: &NodeKey, document: Document) -> StoreResult<()>;

    /// Remove the document under `key`. Returns `true` if one existed.
    fn remove(&self, key: &NodeKey) -> StoreResult<bool>;

    /// Apply a group of puts and removes atomically, in order.
    fn apply(&self, batch: Vec<BatchOperation>) -> StoreResult<()>;

    /// Check for presence without materializing the document. Backends may
    /// override with a cheaper implementation.
    fn contains(&self, key: &NodeKey) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}
