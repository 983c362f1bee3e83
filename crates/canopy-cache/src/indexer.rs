use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex};

use canopy_types::NodeKey;

/// Query-indexer contract.
///
/// Indexers are notified synchronously after each successful commit with
/// the changed key set, and can be asked for a full asynchronous re-index
/// whose completion is observed through an [`IndexingHandle`].
pub trait QueryIndexer: Send + Sync {
    /// Called once per committed transaction, after the commit is durable.
    fn changed(&self, workspace: &str, keys: &BTreeSet<NodeKey>);

    /// Start re-indexing the whole workspace. Implementations typically
    /// spawn the work and resolve the handle when done.
    fn reindex(&self, workspace: &str) -> IndexingHandle;
}

struct HandleState {
    result: Mutex<Option<Result<(), String>>>,
    done: Condvar,
}

/// Resolvable handle for an asynchronous re-index operation.
#[derive(Clone)]
pub struct IndexingHandle {
    state: Arc<HandleState>,
}

/// The producer side of an [`IndexingHandle`]; resolving it wakes every
/// waiter.
pub struct IndexingCompletion {
    state: Arc<HandleState>,
}

impl IndexingHandle {
    /// A handle/completion pair for an operation still in flight.
    pub fn pending() -> (Self, IndexingCompletion) {
        let state = Arc::new(HandleState {
            result: Mutex::new(None),
            done: Condvar::new(),
        });
        (
            Self {
                state: Arc::clone(&state),
            },
            IndexingCompletion { state },
        )
    }

    /// A handle that is already resolved.
    pub fn resolved(result: Result<(), String>) -> Self {
        let (handle, completion) = Self::pending();
        completion.resolve(result);
        handle
    }

    /// The result, if the operation has finished.
    pub fn try_result(&self) -> Option<Result<(), String>> {
        self.state.result.lock().expect("handle poisoned").clone()
    }

    /// Block until the operation finishes and return its result.
    pub fn wait(&self) -> Result<(), String> {
        let mut guard = self.state.result.lock().expect("handle poisoned");
        while guard.is_none() {
            guard = self.state.done.wait(guard).expect("handle poisoned");
        }
        guard.clone().expect("checked above")
    }
}

impl IndexingCompletion {
    pub fn resolve(self, result: Result<(), String>) {
        let mut guard = self.state.result.lock().expect("handle poisoned");
        *guard = Some(result);
        self.state.done.notify_all();
    }
}
