use thiserror::Error;

use canopy_journal::JournalError;
use canopy_store::StoreError;
use canopy_types::{NodeKey, SessionId, TypeError};

use crate::validator::ConstraintViolation;

/// Errors produced by the caching layer.
///
/// No variant ever indicates a partially applied commit: merge, persist,
/// and journal append succeed or fail together, except the journal-append
/// reconciliation case which is not an error at all (see
/// [`WorkspaceCache::reconcile_journal`](crate::WorkspaceCache::reconcile_journal)).
#[derive(Debug, Error)]
pub enum CacheError {
    /// The operation requires a node that is absent from both the cache
    /// and the store (or removed in the session's own view).
    #[error("node not found: {key}")]
    NodeNotFound { key: NodeKey },

    #[error("node already exists: {key}")]
    AlreadyExists { key: NodeKey },

    /// The external validator rejected the pending delta. The session's
    /// working state is untouched; fix the delta and retry.
    #[error("{} constraint violation(s) rejected the pending changes", violations.len())]
    ConstraintViolation {
        violations: Vec<ConstraintViolation>,
    },

    /// Another session's commit changed or removed a key this session is
    /// committing. The session's working state is kept, but a refresh is
    /// required before the next save.
    #[error("stale state on {} key(s); refresh required", keys.len())]
    StaleState { keys: Vec<NodeKey> },

    #[error("node {key} is locked by session {owner}")]
    LockContention { key: NodeKey, owner: SessionId },

    #[error("session is logged out")]
    SessionClosed,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Key(#[from] TypeError),
}

pub type CacheResult<T> = Result<T, CacheError>;
