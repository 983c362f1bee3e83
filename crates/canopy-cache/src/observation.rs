use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use canopy_types::{ChangeEvent, NodeKey, SessionId};

/// Criteria narrowing which change events a listener receives. An empty
/// filter matches everything.
#[derive(Clone, Debug, Default)]
pub struct ListenerFilter {
    /// Only events at or under this absolute path.
    pub path_prefix: Option<String>,
    /// Only events at most this deep in the tree (root = 0).
    pub max_depth: Option<usize>,
    /// Only events affecting these specific keys.
    pub keys: Option<BTreeSet<NodeKey>>,
    /// Only events whose affected node carries this type name.
    pub node_type: Option<String>,
    /// Suppress events that originated from the listener's own session.
    pub skip_local: bool,
}

impl ListenerFilter {
    pub fn matches(&self, event: &ChangeEvent, own_session: Option<SessionId>) -> bool {
        if self.skip_local {
            if let Some(own) = own_session {
                if event.session == own {
                    return false;
                }
            }
        }
        if let Some(ref prefix) = self.path_prefix {
            if !event.is_under(prefix) {
                return false;
            }
        }
        if let Some(max_depth) = self.max_depth {
            if event.depth() > max_depth {
                return false;
            }
        }
        if let Some(ref keys) = self.keys {
            if !keys.contains(&event.key) {
                return false;
            }
        }
        if let Some(ref node_type) = self.node_type {
            if !event.node_types.contains(node_type) {
                return false;
            }
        }
        true
    }
}

/// One committed transaction's events, in the order they were produced.
#[derive(Clone, Debug)]
pub struct ChangeBatch {
    pub workspace: String,
    /// Sequence number of the journal record covering this commit.
    pub journal_seq: u64,
    /// Session whose save produced the batch.
    pub session: SessionId,
    pub events: Vec<ChangeEvent>,
}

/// Receives change batches after successful commits.
pub trait ChangeListener: Send + Sync {
    fn notify(&self, batch: &ChangeBatch);
}

/// Handle for removing a registered listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    filter: ListenerFilter,
    /// The listener's own session, consulted by `skip_local`.
    session: Option<SessionId>,
    listener: Arc<dyn ChangeListener>,
}

/// Fan-out of committed change events to registered listeners.
///
/// Delivery is synchronous and serialized: `publish` holds an internal
/// order lock, so listeners observe batches in strictly increasing
/// journal-sequence order even when the commits themselves ran in parallel
/// on disjoint key sets.
#[derive(Default)]
pub struct ChangeBus {
    listeners: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
    order: Mutex<()>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. `session` identifies the listener's own
    /// session for the filter's `skip_local` flag.
    pub fn register(
        &self,
        filter: ListenerFilter,
        session: Option<SessionId>,
        listener: Arc<dyn ChangeListener>,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .expect("listener table poisoned")
            .push(Registration {
                id,
                filter,
                session,
                listener,
            });
        id
    }

    /// Remove a listener. Returns `true` if it was registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().expect("listener table poisoned");
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() < before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().expect("listener table poisoned").len()
    }

    /// Deliver one commit's events to every matching listener. Each
    /// listener sees only the events its filter admits; listeners with no
    /// matching events are not called at all.
    pub fn publish(&self, batch: &ChangeBatch) {
        let _order = self.order.lock().expect("bus order lock poisoned");
        let listeners = self.listeners.read().expect("listener table poisoned");
        for registration in listeners.iter() {
            let events: Vec<ChangeEvent> = batch
                .events
                .iter()
                .filter(|e| registration.filter.matches(e, registration.session))
                .cloned()
                .collect();
            if events.is_empty() {
                continue;
            }
            let filtered = ChangeBatch {
                workspace: batch.workspace.clone(),
                journal_seq: batch.journal_seq,
                session: batch.session,
                events,
            };
            registration.listener.notify(&filtered);
        }
    }
}
