use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use tracing::{debug, info};

use canopy_types::{CachedNode, ChangeEvent, ChangeKind, NodeKey, PropertyValue, SessionId};

use crate::delta::{NodeChanges, NodeDelta};
use crate::error::{CacheError, CacheResult};
use crate::locks::{Lock, LockTable};
use crate::txn::{AmbientTransaction, TransactionParticipant};
use crate::validator::{ChangeSet, ChangeSetEntry, ChangeSetKind, ConstraintValidator};
use crate::workspace::{CommitReceipt, KeyChange, WorkspaceCache};

/// Where sessions announce their logout, so the owning registry can drop
/// its handle.
pub trait SessionRegistry: Send + Sync {
    fn deregister(&self, id: SessionId);
}

/// Result of a [`SessionCache::save`].
#[derive(Debug)]
pub enum SaveOutcome {
    /// There was nothing to commit.
    Nothing,
    /// The pending delta was merged, persisted, and journaled.
    Committed(CommitReceipt),
    /// The session is joined to an ambient transaction; the prepared
    /// changes commit (or vanish) with it.
    Deferred,
}

/// What a [`SessionCache::refresh`] found.
#[derive(Debug, Default)]
pub struct RefreshReport {
    /// Keys whose pending change could not be carried over the refreshed
    /// state and was dropped.
    pub conflicts: Vec<NodeKey>,
}

struct SessionState {
    deltas: BTreeMap<NodeKey, NodeDelta>,
    /// Committed snapshots this session has observed, pinned until the
    /// next refresh. A session reads a stable world: once it has seen a
    /// key, later commits by other sessions stay invisible to it.
    seen: BTreeMap<NodeKey, (Arc<CachedNode>, u64)>,
    /// Set when a save was rejected as stale; cleared by `refresh`.
    needs_refresh: bool,
    stale_keys: Vec<NodeKey>,
    closed: bool,
}

/// One session's isolated view of a workspace.
///
/// Reads overlay the session's pending delta on the committed snapshots
/// the session has observed; writes accumulate in the delta and stay
/// invisible to every other session until [`save`](Self::save). The
/// session is the unit of isolation, not a thread: a `SessionCache` is
/// `Send + Sync` and its operations may be called from any thread.
pub struct SessionCache {
    id: SessionId,
    workspace: Arc<WorkspaceCache>,
    locks: Arc<LockTable>,
    validator: Arc<dyn ConstraintValidator>,
    default_lease: Duration,
    registry: Mutex<Option<Arc<dyn SessionRegistry>>>,
    txn: Mutex<Option<Arc<dyn AmbientTransaction>>>,
    state: Arc<Mutex<SessionState>>,
}

impl SessionCache {
    pub fn new(
        workspace: Arc<WorkspaceCache>,
        locks: Arc<LockTable>,
        validator: Arc<dyn ConstraintValidator>,
        default_lease: Duration,
    ) -> Self {
        let id = SessionId::new();
        debug!(session = %id, workspace = workspace.name(), "session opened");
        Self {
            id,
            workspace,
            locks,
            validator,
            default_lease,
            registry: Mutex::new(None),
            txn: Mutex::new(None),
            state: Arc::new(Mutex::new(SessionState {
                deltas: BTreeMap::new(),
                seen: BTreeMap::new(),
                needs_refresh: false,
                stale_keys: Vec::new(),
                closed: false,
            })),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn workspace(&self) -> &Arc<WorkspaceCache> {
        &self.workspace
    }

    pub fn workspace_name(&self) -> &str {
        self.workspace.name()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("session state poisoned").closed
    }

    pub fn has_pending_changes(&self) -> bool {
        self.state
            .lock()
            .expect("session state poisoned")
            .deltas
            .values()
            .any(|d| !d.is_noop())
    }

    /// Attach the registry that should be told when this session logs out.
    pub fn set_registry(&self, registry: Arc<dyn SessionRegistry>) {
        *self.registry.lock().expect("registry slot poisoned") = Some(registry);
    }

    /// Join an ambient transaction. Until it completes, `save` prepares
    /// changes into the transaction instead of committing directly.
    pub fn join_transaction(&self, txn: Arc<dyn AmbientTransaction>) {
        *self.txn.lock().expect("txn slot poisoned") = Some(txn);
    }

    pub fn leave_transaction(&self) {
        *self.txn.lock().expect("txn slot poisoned") = None;
    }

    fn lock_state(&self) -> CacheResult<std::sync::MutexGuard<'_, SessionState>> {
        let state = self.state.lock().expect("session state poisoned");
        if state.closed {
            return Err(CacheError::SessionClosed);
        }
        Ok(state)
    }

    /// The committed snapshot of `key` as this session observes it: the
    /// pinned snapshot if the key was seen before, otherwise a fresh read
    /// that pins it.
    fn observe(
        &self,
        state: &mut SessionState,
        key: &NodeKey,
    ) -> CacheResult<Option<(Arc<CachedNode>, u64)>> {
        if let Some((node, version)) = state.seen.get(key) {
            return Ok(Some((Arc::clone(node), *version)));
        }
        let Some((node, version)) = self.workspace.get_with_version(key)? else {
            return Ok(None);
        };
        state
            .seen
            .insert(key.clone(), (Arc::clone(&node), version));
        Ok(Some((node, version)))
    }

    /// The node as this session sees it: pending delta first, observed
    /// committed state second. `Ok(None)` for unknown or session-removed
    /// keys.
    pub fn get_node(&self, key: &NodeKey) -> CacheResult<Option<CachedNode>> {
        let mut state = self.lock_state()?;
        self.effective_node(&mut state, key)
    }

    fn effective_node(
        &self,
        state: &mut SessionState,
        key: &NodeKey,
    ) -> CacheResult<Option<CachedNode>> {
        match state.deltas.get(key) {
            Some(NodeDelta::Added(node)) => Ok(Some(node.clone())),
            Some(NodeDelta::Modified(changes)) => Ok(Some(changes.apply())),
            Some(NodeDelta::Removed { .. }) | Some(NodeDelta::Unchanged) => Ok(None),
            None => Ok(self.observe(state, key)?.map(|(n, _)| (*n).clone())),
        }
    }

    /// The effective parent key, consulting the pending delta first.
    fn parent_key(
        &self,
        state: &mut SessionState,
        key: &NodeKey,
    ) -> CacheResult<Option<NodeKey>> {
        match state.deltas.get(key) {
            Some(NodeDelta::Added(node)) => Ok(node.parent().cloned()),
            Some(NodeDelta::Modified(changes)) => Ok(changes.base().parent().cloned()),
            _ => Ok(self
                .observe(state, key)?
                .and_then(|(n, _)| n.parent().cloned())),
        }
    }

    fn ancestor_chain(
        &self,
        state: &mut SessionState,
        key: &NodeKey,
    ) -> CacheResult<Vec<NodeKey>> {
        let mut chain = Vec::new();
        let mut current = key.clone();
        while let Some(parent) = self.parent_key(state, &current)? {
            chain.push(parent.clone());
            current = parent;
        }
        Ok(chain)
    }

    /// Absolute path of `key` in this session's effective view.
    fn effective_path(&self, state: &mut SessionState, key: &NodeKey) -> CacheResult<String> {
        let mut segments = Vec::new();
        let mut current = key.clone();
        while let Some(parent) = self.parent_key(state, &current)? {
            let name = self
                .effective_node(state, &parent)?
                .and_then(|p| {
                    p.children()
                        .iter()
                        .find(|c| c.key == current)
                        .map(|c| c.name.clone())
                })
                .unwrap_or_else(|| current.id().to_string());
            segments.push(name);
            current = parent;
        }
        if segments.is_empty() {
            return Ok("/".to_string());
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }

    /// Absolute path of `key` in committed state, ignoring the session's
    /// delta. Used for removal events, whose subject is already gone from
    /// the effective view.
    fn committed_path(&self, key: &NodeKey) -> CacheResult<String> {
        let mut segments = Vec::new();
        let mut current = key.clone();
        loop {
            let Some(node) = self.workspace.get(&current)? else {
                break;
            };
            let Some(parent) = node.parent().cloned() else {
                break;
            };
            let name = self
                .workspace
                .get(&parent)?
                .and_then(|p| {
                    p.children()
                        .iter()
                        .find(|c| c.key == current)
                        .map(|c| c.name.clone())
                })
                .unwrap_or_else(|| current.id().to_string());
            segments.push(name);
            current = parent;
        }
        if segments.is_empty() {
            return Ok("/".to_string());
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }

    /// Entry point for every edit: returns the key's delta, materializing
    /// a `Modified` over the observed committed snapshot on first touch.
    /// Session-removed keys read as absent.
    fn delta_for_edit<'a>(
        &self,
        state: &'a mut SessionState,
        key: &NodeKey,
    ) -> CacheResult<&'a mut NodeDelta> {
        if !state.deltas.contains_key(key) {
            let (node, version) = self
                .observe(state, key)?
                .ok_or_else(|| CacheError::NodeNotFound { key: key.clone() })?;
            state.deltas.insert(
                key.clone(),
                NodeDelta::Modified(NodeChanges::new(node, version)),
            );
        }
        let delta = state.deltas.get_mut(key).expect("presence ensured above");
        if matches!(delta, NodeDelta::Removed { .. } | NodeDelta::Unchanged) {
            return Err(CacheError::NodeNotFound { key: key.clone() });
        }
        Ok(delta)
    }

    /// Create a new child of `parent`. With `id = None` a time-ordered
    /// UUID id is generated; an explicit id must be unused. The child is
    /// pending until `save`.
    pub fn add_child(
        &self,
        parent: &NodeKey,
        name: &str,
        id: Option<&str>,
    ) -> CacheResult<NodeKey> {
        let mut state = self.lock_state()?;
        let workspace_id = self.workspace.name().to_string();
        let child_key = match id {
            Some(id) => NodeKey::new(workspace_id, id)?,
            None => NodeKey::generate(workspace_id)?,
        };

        // Keys are never reused: anything the session has touched under
        // this key, including an add-then-remove tombstone, blocks it.
        if state.deltas.contains_key(&child_key) || self.workspace.contains(&child_key)? {
            return Err(CacheError::AlreadyExists { key: child_key });
        }

        match self.delta_for_edit(&mut state, parent)? {
            NodeDelta::Added(node) => {
                *node = node.clone().with_child(name, child_key.clone());
            }
            NodeDelta::Modified(changes) => {
                changes.append_child(name, child_key.clone());
            }
            _ => unreachable!("delta_for_edit only yields Added or Modified"),
        }
        state.deltas.insert(
            child_key.clone(),
            NodeDelta::Added(CachedNode::new(child_key.clone(), parent.clone())),
        );
        Ok(child_key)
    }

    /// Remove a node and its whole effective subtree from this session's
    /// view. Nodes the session itself added collapse to tombstones;
    /// committed nodes become pending removals.
    pub fn remove_node(&self, key: &NodeKey) -> CacheResult<()> {
        let mut state = self.lock_state()?;
        let Some(node) = self.effective_node(&mut state, key)? else {
            return Err(CacheError::NodeNotFound { key: key.clone() });
        };
        if node.is_root() {
            return Err(CacheError::NodeNotFound { key: key.clone() });
        }
        let parent = node
            .parent()
            .cloned()
            .ok_or_else(|| CacheError::NodeNotFound { key: key.clone() })?;

        // Walk the effective subtree before mutating anything.
        let mut subtree = Vec::new();
        let mut stack = vec![key.clone()];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.effective_node(&mut state, &current)? {
                for child in node.children() {
                    stack.push(child.key.clone());
                }
            }
            subtree.push(current);
        }

        for current in subtree {
            let pending = match state.deltas.get(&current) {
                Some(NodeDelta::Added(_)) => NodeDelta::Unchanged,
                Some(NodeDelta::Modified(changes)) => NodeDelta::Removed {
                    base_version: changes.base_version(),
                },
                Some(NodeDelta::Removed { .. }) | Some(NodeDelta::Unchanged) => continue,
                None => {
                    let Some((_, version)) = self.observe(&mut state, &current)? else {
                        continue;
                    };
                    NodeDelta::Removed {
                        base_version: version,
                    }
                }
            };
            state.deltas.insert(current, pending);
        }

        match self.delta_for_edit(&mut state, &parent)? {
            NodeDelta::Added(node) => {
                *node = node.clone().without_child(key);
            }
            NodeDelta::Modified(changes) => {
                changes.remove_child(key);
            }
            _ => unreachable!("delta_for_edit only yields Added or Modified"),
        }
        Ok(())
    }

    pub fn set_property(
        &self,
        key: &NodeKey,
        name: impl Into<String>,
        value: PropertyValue,
    ) -> CacheResult<()> {
        let mut state = self.lock_state()?;
        match self.delta_for_edit(&mut state, key)? {
            NodeDelta::Added(node) => {
                *node = node.clone().with_property(name, value);
            }
            NodeDelta::Modified(changes) => {
                changes.set_property(name, value);
            }
            _ => unreachable!("delta_for_edit only yields Added or Modified"),
        }
        Ok(())
    }

    pub fn remove_property(&self, key: &NodeKey, name: &str) -> CacheResult<()> {
        let mut state = self.lock_state()?;
        match self.delta_for_edit(&mut state, key)? {
            NodeDelta::Added(node) => {
                *node = node.clone().without_property(name);
            }
            NodeDelta::Modified(changes) => {
                changes.remove_property(name);
            }
            _ => unreachable!("delta_for_edit only yields Added or Modified"),
        }
        Ok(())
    }

    pub fn add_type(&self, key: &NodeKey, name: impl Into<String>) -> CacheResult<()> {
        let mut state = self.lock_state()?;
        match self.delta_for_edit(&mut state, key)? {
            NodeDelta::Added(node) => {
                *node = node.clone().with_type(name);
            }
            NodeDelta::Modified(changes) => {
                changes.add_type(name);
            }
            _ => unreachable!("delta_for_edit only yields Added or Modified"),
        }
        Ok(())
    }

    pub fn remove_type(&self, key: &NodeKey, name: &str) -> CacheResult<()> {
        let mut state = self.lock_state()?;
        match self.delta_for_edit(&mut state, key)? {
            NodeDelta::Added(node) => {
                *node = node.clone().without_type(name);
            }
            NodeDelta::Modified(changes) => {
                changes.remove_type(name);
            }
            _ => unreachable!("delta_for_edit only yields Added or Modified"),
        }
        Ok(())
    }

    /// Take an exclusive lock on an effectively existing node, using the
    /// session's default lease.
    pub fn lock_node(&self, key: &NodeKey, deep: bool) -> CacheResult<Lock> {
        self.lock_node_for(key, deep, self.default_lease)
    }

    /// Take an exclusive lock with an explicit lease.
    pub fn lock_node_for(&self, key: &NodeKey, deep: bool, lease: Duration) -> CacheResult<Lock> {
        let mut state = self.lock_state()?;
        if self.effective_node(&mut state, key)?.is_none() {
            return Err(CacheError::NodeNotFound { key: key.clone() });
        }
        self.locks.try_acquire(key.clone(), self.id, deep, lease)
    }

    /// Release a lock this session holds. Returns `true` if released.
    pub fn unlock_node(&self, key: &NodeKey) -> CacheResult<bool> {
        self.lock_state()?;
        Ok(self.locks.release(key, self.id))
    }

    /// Renew the lease on every lock this session holds.
    pub fn extend_lock_leases(&self, lease: Duration) -> CacheResult<usize> {
        self.lock_state()?;
        Ok(self.locks.extend_leases(self.id, lease))
    }

    /// Commit the pending delta.
    ///
    /// The phases are: validate, check locks, then merge-persist-journal
    /// through the workspace. A failure in any phase leaves the pending
    /// delta exactly as it was; a stale-state rejection additionally marks
    /// the session as needing a refresh before the next attempt.
    pub fn save(&self) -> CacheResult<SaveOutcome> {
        let mut state = self.lock_state()?;
        if state.needs_refresh {
            return Err(CacheError::StaleState {
                keys: state.stale_keys.clone(),
            });
        }

        let pending: Vec<(NodeKey, NodeDelta)> = state
            .deltas
            .iter()
            .filter(|(_, delta)| !delta.is_noop())
            .map(|(key, delta)| (key.clone(), delta.clone()))
            .collect();
        if pending.is_empty() {
            return Ok(SaveOutcome::Nothing);
        }

        let change_set = ChangeSet {
            workspace: self.workspace.name().to_string(),
            session: self.id,
            entries: pending
                .iter()
                .map(|(key, delta)| match delta {
                    NodeDelta::Added(node) => ChangeSetEntry {
                        key: key.clone(),
                        kind: ChangeSetKind::Added,
                        node: Some(node.clone()),
                    },
                    NodeDelta::Modified(changes) => ChangeSetEntry {
                        key: key.clone(),
                        kind: ChangeSetKind::Modified,
                        node: Some(changes.apply()),
                    },
                    NodeDelta::Removed { .. } | NodeDelta::Unchanged => ChangeSetEntry {
                        key: key.clone(),
                        kind: ChangeSetKind::Removed,
                        node: None,
                    },
                })
                .collect(),
        };
        let violations = self.validator.validate(&change_set);
        if !violations.is_empty() {
            return Err(CacheError::ConstraintViolation { violations });
        }

        for (key, _) in &pending {
            let ancestors = self.ancestor_chain(&mut state, key)?;
            self.locks.check_can_modify(self.id, key, &ancestors)?;
        }

        let mut changes = Vec::with_capacity(pending.len());
        let mut events = Vec::new();
        for (key, delta) in &pending {
            match delta {
                NodeDelta::Added(node) => {
                    let path = self.effective_path(&mut state, key)?;
                    events.push(ChangeEvent {
                        kind: ChangeKind::NodeAdded,
                        key: key.clone(),
                        path: path.clone(),
                        property: None,
                        node_types: node.types().clone(),
                        session: self.id,
                    });
                    for name in node.properties().keys() {
                        events.push(ChangeEvent {
                            kind: ChangeKind::PropertyAdded,
                            key: key.clone(),
                            path: path.clone(),
                            property: Some(name.clone()),
                            node_types: node.types().clone(),
                            session: self.id,
                        });
                    }
                    changes.push((key.clone(), KeyChange::Add { node: node.clone() }));
                }
                NodeDelta::Modified(node_changes) => {
                    let effective = node_changes.apply();
                    let path = self.effective_path(&mut state, key)?;
                    for name in node_changes.set_properties().keys() {
                        let kind = if node_changes.base().property(name).is_some() {
                            ChangeKind::PropertyChanged
                        } else {
                            ChangeKind::PropertyAdded
                        };
                        events.push(ChangeEvent {
                            kind,
                            key: key.clone(),
                            path: path.clone(),
                            property: Some(name.clone()),
                            node_types: effective.types().clone(),
                            session: self.id,
                        });
                    }
                    for name in node_changes.removed_properties() {
                        events.push(ChangeEvent {
                            kind: ChangeKind::PropertyRemoved,
                            key: key.clone(),
                            path: path.clone(),
                            property: Some(name.clone()),
                            node_types: effective.types().clone(),
                            session: self.id,
                        });
                    }
                    changes.push((
                        key.clone(),
                        KeyChange::Replace {
                            node: effective,
                            base_version: node_changes.base_version(),
                        },
                    ));
                }
                NodeDelta::Removed { base_version } => {
                    let path = self.committed_path(key)?;
                    let node_types = state
                        .seen
                        .get(key)
                        .map(|(n, _)| n.types().clone())
                        .unwrap_or_default();
                    events.push(ChangeEvent {
                        kind: ChangeKind::NodeRemoved,
                        key: key.clone(),
                        path,
                        property: None,
                        node_types,
                        session: self.id,
                    });
                    changes.push((
                        key.clone(),
                        KeyChange::Remove {
                            base_version: *base_version,
                        },
                    ));
                }
                NodeDelta::Unchanged => {}
            }
        }

        let txn = self.txn.lock().expect("txn slot poisoned").clone();
        if let Some(txn) = txn {
            txn.participate(Box::new(SaveParticipant {
                workspace: Arc::clone(&self.workspace),
                session: self.id,
                state: Arc::clone(&self.state),
                prepared: Some((changes, events)),
            }));
            state
                .deltas
                .retain(|_, delta| matches!(delta, NodeDelta::Unchanged));
            debug!(session = %self.id, "save deferred to ambient transaction");
            return Ok(SaveOutcome::Deferred);
        }

        match self.workspace.commit(self.id, changes, events) {
            Ok(receipt) => {
                state
                    .deltas
                    .retain(|_, delta| matches!(delta, NodeDelta::Unchanged));
                // The session should see its own committed changes.
                for key in &receipt.changed {
                    state.seen.remove(key);
                }
                Ok(SaveOutcome::Committed(receipt))
            }
            Err(CacheError::StaleState { keys }) => {
                state.needs_refresh = true;
                state.stale_keys = keys.clone();
                Err(CacheError::StaleState { keys })
            }
            Err(e) => Err(e),
        }
    }

    /// Re-anchor the session on current committed state, dropping every
    /// pinned snapshot.
    ///
    /// With `keep_changes = false` every pending change is discarded. With
    /// `keep_changes = true` each pending change is rebased onto the
    /// current snapshot; changes that can no longer apply (the node was
    /// removed, or an added key now exists) are dropped and reported.
    pub fn refresh(&self, keep_changes: bool) -> CacheResult<RefreshReport> {
        let mut state = self.lock_state()?;
        state.needs_refresh = false;
        state.stale_keys.clear();
        state.seen.clear();

        if !keep_changes {
            state.deltas.clear();
            return Ok(RefreshReport::default());
        }

        let mut report = RefreshReport::default();
        let keys: Vec<NodeKey> = state.deltas.keys().cloned().collect();
        for key in keys {
            let delta = state.deltas.remove(&key).expect("key just listed");
            let carried = match delta {
                NodeDelta::Unchanged => Some(NodeDelta::Unchanged),
                NodeDelta::Added(node) => {
                    if self.workspace.contains(&key)? {
                        report.conflicts.push(key.clone());
                        None
                    } else {
                        Some(NodeDelta::Added(node))
                    }
                }
                NodeDelta::Modified(changes) => match self.observe(&mut state, &key)? {
                    Some((node, version)) => {
                        Some(NodeDelta::Modified(changes.rebase(node, version)))
                    }
                    None => {
                        report.conflicts.push(key.clone());
                        None
                    }
                },
                NodeDelta::Removed { .. } => match self.observe(&mut state, &key)? {
                    Some((_, version)) => Some(NodeDelta::Removed {
                        base_version: version,
                    }),
                    // Someone else already removed it; nothing left to do.
                    None => None,
                },
            };
            if let Some(delta) = carried {
                state.deltas.insert(key, delta);
            }
        }
        debug!(
            session = %self.id,
            conflicts = report.conflicts.len(),
            "session refreshed"
        );
        Ok(report)
    }

    /// Close the session: discard pending changes, release its locks, and
    /// deregister it. Waits for an in-flight `save` to finish first.
    /// Idempotent.
    pub fn logout(&self) {
        {
            let mut state = self.state.lock().expect("session state poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
            state.deltas.clear();
            state.seen.clear();
        }
        let released = self.locks.release_all_for(self.id);
        if let Some(registry) = self
            .registry
            .lock()
            .expect("registry slot poisoned")
            .take()
        {
            registry.deregister(self.id);
        }
        info!(session = %self.id, locks_released = released, "session logged out");
    }
}

/// Carries one session's prepared commit into an ambient transaction.
struct SaveParticipant {
    workspace: Arc<WorkspaceCache>,
    session: SessionId,
    state: Arc<Mutex<SessionState>>,
    prepared: Option<(Vec<(NodeKey, KeyChange)>, Vec<ChangeEvent>)>,
}

impl TransactionParticipant for SaveParticipant {
    fn on_commit(&mut self) -> CacheResult<()> {
        if let Some((changes, events)) = self.prepared.take() {
            let receipt = self.workspace.commit(self.session, changes, events)?;
            // The owning session should see its own committed changes,
            // exactly as after a direct save.
            let mut state = self.state.lock().expect("session state poisoned");
            for key in &receipt.changed {
                state.seen.remove(key);
            }
        }
        Ok(())
    }

    fn on_rollback(&mut self) {
        self.prepared = None;
    }
}
