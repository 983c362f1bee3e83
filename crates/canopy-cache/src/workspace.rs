use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use canopy_journal::ChangeJournal;
use canopy_store::{BatchOperation, DocumentStore, DocumentTranslator};
use canopy_types::{CachedNode, ChangeEvent, NodeKey, SessionId};

use crate::error::{CacheError, CacheResult};
use crate::indexer::QueryIndexer;
use crate::observation::{ChangeBatch, ChangeBus};

/// One key's part of a commit, as produced by a session's save.
#[derive(Clone, Debug)]
pub enum KeyChange {
    /// The key must not exist yet.
    Add { node: CachedNode },
    /// The key must still be at `base_version`.
    Replace { node: CachedNode, base_version: u64 },
    /// The key must still be at `base_version`; it is removed.
    Remove { base_version: u64 },
}

impl KeyChange {
    fn base_version(&self) -> Option<u64> {
        match self {
            Self::Add { .. } => None,
            Self::Replace { base_version, .. } | Self::Remove { base_version } => {
                Some(*base_version)
            }
        }
    }
}

/// What a successful commit produced.
#[derive(Clone, Debug)]
pub struct CommitReceipt {
    /// Journal sequence of the commit's record, or `None` if the append
    /// failed and the record is parked for reconciliation.
    pub journal_seq: Option<u64>,
    pub changed: BTreeSet<NodeKey>,
}

/// A committed snapshot plus the cache version it was installed at.
/// Versions come from one workspace-wide counter and are never reused,
/// so a version match proves the entry was not replaced or invalidated
/// in between.
#[derive(Clone)]
struct VersionedNode {
    node: Arc<CachedNode>,
    version: u64,
}

/// A journal record that could not be appended at commit time. The commit
/// itself is durable; only the record (and its event delivery) is pending.
struct PendingRecord {
    changed: BTreeSet<NodeKey>,
    events: Vec<ChangeEvent>,
    session: SessionId,
}

/// Shared cache of committed node state for one workspace.
///
/// Reads are read-through: a miss loads the document from the store,
/// decodes it, and installs the snapshot for subsequent readers. Writes go
/// exclusively through [`commit`](Self::commit), which merges a session's
/// changes, persists them atomically, journals them, and fans events out
/// to listeners and indexers.
///
/// Commits reserve exactly the keys they touch, so two commits over
/// disjoint key sets proceed in parallel; overlapping commits serialize on
/// the contested keys only.
pub struct WorkspaceCache {
    name: String,
    root_key: NodeKey,
    store: Arc<dyn DocumentStore>,
    translator: DocumentTranslator,
    journal: Arc<dyn ChangeJournal>,
    bus: Arc<ChangeBus>,
    indexers: RwLock<Vec<Arc<dyn QueryIndexer>>>,
    nodes: DashMap<NodeKey, VersionedNode>,
    /// Workspace-wide version source; see [`VersionedNode`].
    versions: AtomicU64,
    /// Keys currently being committed. Read-through misses must not
    /// install entries for these keys, and overlapping commits wait here.
    inflight: Mutex<HashSet<NodeKey>>,
    inflight_done: Condvar,
    /// Serializes journal append + event publication so listeners observe
    /// batches in journal order.
    publish_lock: Mutex<()>,
    backlog: Mutex<Vec<PendingRecord>>,
    /// Whether journal records carry the full event payload or keys only.
    payload_in_journal: bool,
}

impl std::fmt::Debug for WorkspaceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceCache")
            .field("name", &self.name)
            .field("root_key", &self.root_key)
            .finish_non_exhaustive()
    }
}

impl WorkspaceCache {
    /// Open the workspace cache over the given store and journal, creating
    /// and persisting the root node if the workspace is empty.
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn DocumentStore>,
        journal: Arc<dyn ChangeJournal>,
        payload_in_journal: bool,
    ) -> CacheResult<Self> {
        let name = name.into();
        let root_key = NodeKey::root_of(name.as_str())?;
        let cache = Self {
            name,
            root_key,
            store,
            translator: DocumentTranslator::new(),
            journal,
            bus: Arc::new(ChangeBus::new()),
            indexers: RwLock::new(Vec::new()),
            nodes: DashMap::new(),
            versions: AtomicU64::new(0),
            inflight: Mutex::new(HashSet::new()),
            inflight_done: Condvar::new(),
            publish_lock: Mutex::new(()),
            backlog: Mutex::new(Vec::new()),
            payload_in_journal,
        };
        cache.ensure_root()?;
        Ok(cache)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_key(&self) -> &NodeKey {
        &self.root_key
    }

    pub fn bus(&self) -> &Arc<ChangeBus> {
        &self.bus
    }

    pub fn add_indexer(&self, indexer: Arc<dyn QueryIndexer>) {
        self.indexers
            .write()
            .expect("indexer list poisoned")
            .push(indexer);
    }

    /// Number of entries currently held in memory.
    pub fn cached_len(&self) -> usize {
        self.nodes.len()
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn ensure_root(&self) -> CacheResult<()> {
        if self.store.get(&self.root_key)?.is_none() {
            let root = CachedNode::new_root(self.root_key.clone());
            self.store
                .put(&self.root_key, self.translator.encode(&root))?;
            info!(workspace = %self.name, "created workspace root");
        }
        Ok(())
    }

    /// Read one node's committed snapshot, loading from the store on a
    /// cache miss. Absence is `Ok(None)`.
    pub fn get(&self, key: &NodeKey) -> CacheResult<Option<Arc<CachedNode>>> {
        Ok(self.get_with_version(key)?.map(|(node, _)| node))
    }

    /// Like [`get`](Self::get), but also returns the cache version the
    /// snapshot was observed at, for later conflict checks.
    pub fn get_with_version(&self, key: &NodeKey) -> CacheResult<Option<(Arc<CachedNode>, u64)>> {
        if let Some(entry) = self.nodes.get(key) {
            return Ok(Some((Arc::clone(&entry.node), entry.version)));
        }
        let Some(document) = self.store.get(key)? else {
            return Ok(None);
        };
        let node = Arc::new(self.translator.decode(&document)?);

        // A key mid-commit must not be re-installed from a pre-commit
        // store read; serve the snapshot without caching it.
        let inflight = self.inflight.lock().expect("inflight set poisoned");
        if inflight.contains(key) {
            let version = self.next_version();
            return Ok(Some((node, version)));
        }
        // The document was read before the lock; a remove may have fully
        // committed in between. Installing the snapshot now would resurrect
        // the deleted node, so re-verify presence while no commit on this
        // key can start.
        if !self.store.contains(key)? {
            return Ok(None);
        }
        let entry = self
            .nodes
            .entry(key.clone())
            .or_insert_with(|| VersionedNode {
                node: Arc::clone(&node),
                version: self.next_version(),
            });
        Ok(Some((Arc::clone(&entry.node), entry.version)))
    }

    /// Install a snapshot for a key expected to be new. On collision the
    /// existing entry is returned unchanged and the caller must treat the
    /// key as already taken.
    pub fn put_if_absent(&self, key: NodeKey, node: Arc<CachedNode>) -> Arc<CachedNode> {
        let entry = self.nodes.entry(key).or_insert_with(|| VersionedNode {
            node,
            version: self.next_version(),
        });
        Arc::clone(&entry.node)
    }

    /// Whether the key exists in committed state (cache or store).
    pub fn contains(&self, key: &NodeKey) -> CacheResult<bool> {
        if self.nodes.contains_key(key) {
            return Ok(true);
        }
        Ok(self.store.contains(key)?)
    }

    /// Drop one key's in-memory entry. The next read goes to the store.
    pub fn invalidate(&self, key: &NodeKey) {
        self.nodes.remove(key);
    }

    /// Drop every in-memory entry.
    pub fn invalidate_all(&self) {
        self.nodes.clear();
        debug!(workspace = %self.name, "cache cleared");
    }

    /// Every key in the subtree rooted at `root`, including `root` itself,
    /// parents before children.
    pub fn collect_subtree_keys(&self, root: &NodeKey) -> CacheResult<Vec<NodeKey>> {
        let mut keys = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(key) = stack.pop() {
            if let Some(node) = self.get(&key)? {
                for child in node.children() {
                    stack.push(child.key.clone());
                }
            }
            keys.push(key);
        }
        Ok(keys)
    }

    fn reserve_keys(&self, keys: Vec<NodeKey>) -> CommitGuard<'_> {
        let mut inflight = self.inflight.lock().expect("inflight set poisoned");
        while keys.iter().any(|k| inflight.contains(k)) {
            inflight = self
                .inflight_done
                .wait(inflight)
                .expect("inflight set poisoned");
        }
        for key in &keys {
            inflight.insert(key.clone());
        }
        CommitGuard { cache: self, keys }
    }

    /// Current committed version of `key`, if any. `None` means the key is
    /// not cached; the caller falls back to a store presence check.
    fn cached_version(&self, key: &NodeKey) -> Option<u64> {
        self.nodes.get(key).map(|e| e.version)
    }

    /// Merge one session's changes into committed state.
    ///
    /// The sequence is: reserve the touched keys, verify every precondition
    /// against current state, persist the whole batch atomically, swap the
    /// in-memory entries, then journal and publish. A precondition failure
    /// returns [`CacheError::StaleState`] naming every conflicting key and
    /// leaves committed state untouched.
    pub fn commit(
        &self,
        session: SessionId,
        changes: Vec<(NodeKey, KeyChange)>,
        events: Vec<ChangeEvent>,
    ) -> CacheResult<CommitReceipt> {
        let keys: Vec<NodeKey> = changes.iter().map(|(k, _)| k.clone()).collect();
        let _guard = self.reserve_keys(keys);

        let mut stale = Vec::new();
        for (key, change) in &changes {
            match change.base_version() {
                None => {
                    // Add: the key must be absent everywhere.
                    if self.nodes.contains_key(key) || self.store.contains(key)? {
                        stale.push(key.clone());
                    }
                }
                Some(base_version) => match self.cached_version(key) {
                    Some(current) if current == base_version => {}
                    Some(_) => stale.push(key.clone()),
                    // Entry was invalidated or never cached; the observed
                    // version cannot be confirmed, so the change is stale
                    // if the key still exists, and doubly so if it is gone.
                    None => stale.push(key.clone()),
                },
            }
        }
        if !stale.is_empty() {
            debug!(
                workspace = %self.name,
                session = %session,
                conflicts = stale.len(),
                "commit rejected as stale"
            );
            return Err(CacheError::StaleState { keys: stale });
        }

        let batch: Vec<BatchOperation> = changes
            .iter()
            .map(|(key, change)| match change {
                KeyChange::Add { node } | KeyChange::Replace { node, .. } => BatchOperation::Put {
                    key: key.clone(),
                    document: self.translator.encode(node),
                },
                KeyChange::Remove { .. } => BatchOperation::Remove { key: key.clone() },
            })
            .collect();
        self.store.apply(batch)?;

        let mut changed = BTreeSet::new();
        for (key, change) in changes {
            match change {
                KeyChange::Add { node } | KeyChange::Replace { node, .. } => {
                    self.nodes.insert(
                        key.clone(),
                        VersionedNode {
                            node: Arc::new(node),
                            version: self.next_version(),
                        },
                    );
                }
                KeyChange::Remove { .. } => {
                    self.nodes.remove(&key);
                }
            }
            changed.insert(key);
        }

        let journal_seq = self.journal_and_publish(session, changed.clone(), events);
        self.notify_indexers(&changed);

        debug!(
            workspace = %self.name,
            session = %session,
            keys = changed.len(),
            seq = ?journal_seq,
            "commit applied"
        );
        Ok(CommitReceipt {
            journal_seq,
            changed,
        })
    }

    /// Append the commit's journal record and publish its events, as one
    /// ordered unit. The commit is already durable; if the append fails the
    /// record is parked and its events held back until reconciliation, so
    /// listeners never see an event the journal does not (yet) cover.
    fn journal_and_publish(
        &self,
        session: SessionId,
        changed: BTreeSet<NodeKey>,
        events: Vec<ChangeEvent>,
    ) -> Option<u64> {
        let _publish = self.publish_lock.lock().expect("publish lock poisoned");
        let payload = self.payload_in_journal.then(|| events.clone());
        match self.journal.append(changed.clone(), payload) {
            Ok(record) => {
                self.bus.publish(&ChangeBatch {
                    workspace: self.name.clone(),
                    journal_seq: record.seq,
                    session,
                    events,
                });
                Some(record.seq)
            }
            Err(e) => {
                warn!(
                    workspace = %self.name,
                    session = %session,
                    error = %e,
                    "journal append failed; record parked for reconciliation"
                );
                self.backlog.lock().expect("backlog poisoned").push(PendingRecord {
                    changed,
                    events,
                    session,
                });
                None
            }
        }
    }

    fn notify_indexers(&self, changed: &BTreeSet<NodeKey>) {
        let indexers = self.indexers.read().expect("indexer list poisoned");
        for indexer in indexers.iter() {
            indexer.changed(&self.name, changed);
        }
    }

    /// Number of commits whose journal record is still pending.
    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().expect("backlog poisoned").len()
    }

    /// Retry parked journal records, oldest first, delivering their held
    /// events on success. Stops at the first record that still fails,
    /// keeping it and everything behind it parked. Returns the number of
    /// records reconciled.
    pub fn reconcile_journal(&self) -> CacheResult<usize> {
        let _publish = self.publish_lock.lock().expect("publish lock poisoned");
        let mut backlog = self.backlog.lock().expect("backlog poisoned");
        let mut reconciled = 0;
        while !backlog.is_empty() {
            let pending = &backlog[0];
            let payload = self.payload_in_journal.then(|| pending.events.clone());
            match self.journal.append(pending.changed.clone(), payload) {
                Ok(record) => {
                    let pending = backlog.remove(0);
                    self.bus.publish(&ChangeBatch {
                        workspace: self.name.clone(),
                        journal_seq: record.seq,
                        session: pending.session,
                        events: pending.events,
                    });
                    reconciled += 1;
                }
                Err(e) => {
                    warn!(
                        workspace = %self.name,
                        remaining = backlog.len(),
                        error = %e,
                        "journal reconciliation still failing"
                    );
                    return Err(e.into());
                }
            }
        }
        if reconciled > 0 {
            info!(workspace = %self.name, reconciled, "journal backlog reconciled");
        }
        Ok(reconciled)
    }
}

/// Releases reserved commit keys on drop, success or failure alike.
struct CommitGuard<'a> {
    cache: &'a WorkspaceCache,
    keys: Vec<NodeKey>,
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        let mut inflight = self
            .cache
            .inflight
            .lock()
            .expect("inflight set poisoned");
        for key in &self.keys {
            inflight.remove(key);
        }
        self.cache.inflight_done.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::{ChangeListener, ListenerFilter};
    use canopy_journal::{memory::InMemoryJournal, IterationOrder, JournalError, JournalResult};
    use canopy_store::memory::InMemoryDocumentStore;
    use canopy_types::{ChangeKind, PropertyValue};
    use std::sync::atomic::AtomicBool;

    fn key(id: &str) -> NodeKey {
        NodeKey::new("ws", id).unwrap()
    }

    fn new_cache() -> (Arc<WorkspaceCache>, Arc<InMemoryDocumentStore>) {
        let store = Arc::new(InMemoryDocumentStore::new());
        let journal = Arc::new(InMemoryJournal::new());
        let cache = WorkspaceCache::new("ws", store.clone(), journal, true).unwrap();
        (Arc::new(cache), store)
    }

    fn event(kind: ChangeKind, key: NodeKey, path: &str, session: SessionId) -> ChangeEvent {
        ChangeEvent {
            kind,
            key,
            path: path.to_string(),
            property: None,
            node_types: BTreeSet::new(),
            session,
        }
    }

    fn add_node(
        cache: &WorkspaceCache,
        session: SessionId,
        id: &str,
        path: &str,
    ) -> CommitReceipt {
        let node = CachedNode::new(key(id), cache.root_key().clone())
            .with_property("title", id.into());
        cache
            .commit(
                session,
                vec![(key(id), KeyChange::Add { node })],
                vec![event(ChangeKind::NodeAdded, key(id), path, session)],
            )
            .unwrap()
    }

    #[derive(Default)]
    struct CountingListener {
        batches: Mutex<Vec<ChangeBatch>>,
    }

    impl ChangeListener for CountingListener {
        fn notify(&self, batch: &ChangeBatch) {
            self.batches.lock().unwrap().push(batch.clone());
        }
    }

    /// Journal wrapper whose next append can be made to fail.
    struct FlakyJournal {
        inner: InMemoryJournal,
        fail_next: AtomicBool,
    }

    impl FlakyJournal {
        fn new() -> Self {
            Self {
                inner: InMemoryJournal::new(),
                fail_next: AtomicBool::new(false),
            }
        }

        fn fail_next(&self) {
            self.fail_next.store(true, Ordering::SeqCst);
        }
    }

    impl ChangeJournal for FlakyJournal {
        fn append(
            &self,
            changed: BTreeSet<NodeKey>,
            payload: Option<Vec<ChangeEvent>>,
        ) -> JournalResult<canopy_journal::JournalRecord> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(JournalError::Io(std::io::Error::other("injected")));
            }
            self.inner.append(changed, payload)
        }

        fn records(&self, order: IterationOrder) -> JournalResult<canopy_journal::JournalIter> {
            self.inner.records(order)
        }

        fn last_sequence(&self) -> JournalResult<u64> {
            self.inner.last_sequence()
        }
    }

    #[test]
    fn root_is_created_and_readable() {
        let (cache, store) = new_cache();
        let root = cache.get(cache.root_key()).unwrap().unwrap();
        assert!(root.is_root());
        assert!(store.contains(cache.root_key()).unwrap());
    }

    #[test]
    fn put_if_absent_keeps_the_first_entry() {
        let (cache, _) = new_cache();
        let first = Arc::new(
            CachedNode::new(key("n1"), cache.root_key().clone()).with_property("v", 1i64.into()),
        );
        let second = Arc::new(
            CachedNode::new(key("n1"), cache.root_key().clone()).with_property("v", 2i64.into()),
        );

        assert_eq!(cache.put_if_absent(key("n1"), first.clone()), first);
        // Collision: the existing snapshot wins; the caller sees it.
        let survivor = cache.put_if_absent(key("n1"), second);
        assert_eq!(survivor.property("v"), Some(&PropertyValue::Long(1)));
    }

    #[test]
    fn reopening_keeps_existing_root() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let journal = Arc::new(InMemoryJournal::new());
        let first =
            WorkspaceCache::new("ws", store.clone(), journal.clone(), false).unwrap();
        let session = SessionId::new();
        add_node(&first, session, "n1", "/n1");
        drop(first);

        let second = WorkspaceCache::new("ws", store, journal, false).unwrap();
        assert!(second.get(&key("n1")).unwrap().is_some());
    }

    #[test]
    fn unknown_key_reads_as_none() {
        let (cache, _) = new_cache();
        assert!(cache.get(&key("missing")).unwrap().is_none());
    }

    #[test]
    fn read_through_installs_entry() {
        let (cache, _) = new_cache();
        assert_eq!(cache.cached_len(), 0);
        cache.get(cache.root_key()).unwrap().unwrap();
        assert_eq!(cache.cached_len(), 1);
    }

    #[test]
    fn commit_add_makes_node_visible_and_durable() {
        let (cache, store) = new_cache();
        let session = SessionId::new();
        let receipt = add_node(&cache, session, "n1", "/n1");

        assert_eq!(receipt.journal_seq, Some(1));
        assert_eq!(receipt.changed, BTreeSet::from([key("n1")]));

        let node = cache.get(&key("n1")).unwrap().unwrap();
        assert_eq!(node.property("title"), Some(&"n1".into()));
        assert!(store.contains(&key("n1")).unwrap());
    }

    #[test]
    fn add_of_existing_key_is_stale() {
        let (cache, _) = new_cache();
        let session = SessionId::new();
        add_node(&cache, session, "n1", "/n1");

        let duplicate = CachedNode::new(key("n1"), cache.root_key().clone());
        let err = cache
            .commit(
                session,
                vec![(key("n1"), KeyChange::Add { node: duplicate })],
                vec![],
            )
            .unwrap_err();
        assert!(matches!(err, CacheError::StaleState { keys } if keys == vec![key("n1")]));
    }

    #[test]
    fn replace_at_observed_version_succeeds() {
        let (cache, _) = new_cache();
        let session = SessionId::new();
        add_node(&cache, session, "n1", "/n1");

        let (node, version) = cache.get_with_version(&key("n1")).unwrap().unwrap();
        let updated = (*node).clone().with_property("title", "renamed".into());
        cache
            .commit(
                session,
                vec![(
                    key("n1"),
                    KeyChange::Replace {
                        node: updated,
                        base_version: version,
                    },
                )],
                vec![],
            )
            .unwrap();

        let node = cache.get(&key("n1")).unwrap().unwrap();
        assert_eq!(node.property("title"), Some(&"renamed".into()));
    }

    #[test]
    fn replace_at_outdated_version_is_stale_and_harmless() {
        let (cache, _) = new_cache();
        let s1 = SessionId::new();
        let s2 = SessionId::new();
        add_node(&cache, s1, "n1", "/n1");

        let (node, old_version) = cache.get_with_version(&key("n1")).unwrap().unwrap();

        // s2 commits first, moving the node forward.
        let theirs = (*node).clone().with_property("title", "theirs".into());
        cache
            .commit(
                s2,
                vec![(
                    key("n1"),
                    KeyChange::Replace {
                        node: theirs,
                        base_version: old_version,
                    },
                )],
                vec![],
            )
            .unwrap();

        // s1's commit against the old version is rejected, state intact.
        let mine = (*node).clone().with_property("title", "mine".into());
        let err = cache
            .commit(
                s1,
                vec![(
                    key("n1"),
                    KeyChange::Replace {
                        node: mine,
                        base_version: old_version,
                    },
                )],
                vec![],
            )
            .unwrap_err();
        assert!(matches!(err, CacheError::StaleState { .. }));
        let node = cache.get(&key("n1")).unwrap().unwrap();
        assert_eq!(node.property("title"), Some(&"theirs".into()));
    }

    #[test]
    fn remove_deletes_from_cache_and_store() {
        let (cache, store) = new_cache();
        let session = SessionId::new();
        add_node(&cache, session, "n1", "/n1");
        let (_, version) = cache.get_with_version(&key("n1")).unwrap().unwrap();

        cache
            .commit(
                session,
                vec![(
                    key("n1"),
                    KeyChange::Remove {
                        base_version: version,
                    },
                )],
                vec![event(ChangeKind::NodeRemoved, key("n1"), "/n1", session)],
            )
            .unwrap();

        assert!(cache.get(&key("n1")).unwrap().is_none());
        assert!(!store.contains(&key("n1")).unwrap());
    }

    /// Store wrapper that parks one armed read after fetching the document,
    /// so the test can run a commit while the reader holds a stale copy.
    struct GatedStore {
        inner: InMemoryDocumentStore,
        armed: AtomicBool,
        entered: std::sync::Barrier,
        resume: std::sync::Barrier,
    }

    impl GatedStore {
        fn new() -> Self {
            Self {
                inner: InMemoryDocumentStore::new(),
                armed: AtomicBool::new(false),
                entered: std::sync::Barrier::new(2),
                resume: std::sync::Barrier::new(2),
            }
        }
    }

    impl DocumentStore for GatedStore {
        fn get(&self, key: &NodeKey) -> canopy_store::StoreResult<Option<canopy_store::Document>> {
            let document = self.inner.get(key)?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.wait();
                self.resume.wait();
            }
            Ok(document)
        }

        fn put(
            &self,
            key: &NodeKey,
            document: canopy_store::Document,
        ) -> canopy_store::StoreResult<()> {
            self.inner.put(key, document)
        }

        fn remove(&self, key: &NodeKey) -> canopy_store::StoreResult<bool> {
            self.inner.remove(key)
        }

        fn apply(&self, batch: Vec<BatchOperation>) -> canopy_store::StoreResult<()> {
            self.inner.apply(batch)
        }

        fn contains(&self, key: &NodeKey) -> canopy_store::StoreResult<bool> {
            self.inner.contains(key)
        }
    }

    /// A cold read-through that fetched its document before a concurrent
    /// remove committed must not re-install the deleted node.
    #[test]
    fn read_through_does_not_resurrect_a_removed_node() {
        use std::thread;

        let store = Arc::new(GatedStore::new());
        let journal = Arc::new(InMemoryJournal::new());
        let cache =
            Arc::new(WorkspaceCache::new("ws", store.clone(), journal, true).unwrap());
        let session = SessionId::new();
        add_node(&cache, session, "n1", "/n1");
        cache.invalidate(&key("n1"));

        store.armed.store(true, Ordering::SeqCst);
        let reader = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.get(&key("n1")).unwrap())
        };
        // The reader has fetched the pre-remove document and is parked.
        store.entered.wait();

        let (_, version) = cache.get_with_version(&key("n1")).unwrap().unwrap();
        cache
            .commit(
                session,
                vec![(
                    key("n1"),
                    KeyChange::Remove {
                        base_version: version,
                    },
                )],
                vec![event(ChangeKind::NodeRemoved, key("n1"), "/n1", session)],
            )
            .unwrap();
        store.resume.wait();

        assert!(reader.join().unwrap().is_none());
        assert!(cache.get(&key("n1")).unwrap().is_none());
    }

    #[test]
    fn partially_stale_commit_applies_nothing() {
        let (cache, store) = new_cache();
        let session = SessionId::new();
        add_node(&cache, session, "n1", "/n1");
        let (node, version) = cache.get_with_version(&key("n1")).unwrap().unwrap();

        // One valid replace plus one conflicting add.
        let updated = (*node).clone().with_property("title", "renamed".into());
        let duplicate = CachedNode::new(key("n1"), cache.root_key().clone());
        let err = cache
            .commit(
                session,
                vec![
                    (
                        key("n1"),
                        KeyChange::Replace {
                            node: updated,
                            base_version: version,
                        },
                    ),
                    (key("n1"), KeyChange::Add { node: duplicate }),
                ],
                vec![],
            )
            .unwrap_err();
        assert!(matches!(err, CacheError::StaleState { .. }));

        let node = cache.get(&key("n1")).unwrap().unwrap();
        assert_eq!(node.property("title"), Some(&"n1".into()));
        assert!(store.contains(&key("n1")).unwrap());
    }

    #[test]
    fn invalidated_entry_rereads_the_store() {
        let (cache, store) = new_cache();
        let session = SessionId::new();
        add_node(&cache, session, "n1", "/n1");
        cache.get(&key("n1")).unwrap();

        // Mutate the store out of band, then invalidate.
        let translator = DocumentTranslator::new();
        let replaced = CachedNode::new(key("n1"), cache.root_key().clone())
            .with_property("title", "out-of-band".into());
        store.put(&key("n1"), translator.encode(&replaced)).unwrap();

        cache.invalidate(&key("n1"));
        let node = cache.get(&key("n1")).unwrap().unwrap();
        assert_eq!(node.property("title"), Some(&"out-of-band".into()));
    }

    #[test]
    fn version_after_invalidate_never_repeats() {
        let (cache, _) = new_cache();
        let session = SessionId::new();
        add_node(&cache, session, "n1", "/n1");
        let (_, v1) = cache.get_with_version(&key("n1")).unwrap().unwrap();
        cache.invalidate(&key("n1"));
        let (_, v2) = cache.get_with_version(&key("n1")).unwrap().unwrap();
        assert_ne!(v1, v2);
    }

    #[test]
    fn stale_after_invalidate() {
        let (cache, _) = new_cache();
        let session = SessionId::new();
        add_node(&cache, session, "n1", "/n1");
        let (node, version) = cache.get_with_version(&key("n1")).unwrap().unwrap();

        cache.invalidate(&key("n1"));

        let updated = (*node).clone().with_property("title", "late".into());
        let err = cache
            .commit(
                session,
                vec![(
                    key("n1"),
                    KeyChange::Replace {
                        node: updated,
                        base_version: version,
                    },
                )],
                vec![],
            )
            .unwrap_err();
        assert!(matches!(err, CacheError::StaleState { .. }));
    }

    #[test]
    fn events_reach_listeners_with_journal_seq() {
        let (cache, _) = new_cache();
        let listener = Arc::new(CountingListener::default());
        cache
            .bus()
            .register(ListenerFilter::default(), None, listener.clone());

        let session = SessionId::new();
        add_node(&cache, session, "n1", "/n1");
        add_node(&cache, session, "n2", "/n2");

        let batches = listener.batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].journal_seq, 1);
        assert_eq!(batches[1].journal_seq, 2);
        assert_eq!(batches[0].events[0].kind, ChangeKind::NodeAdded);
    }

    #[test]
    fn journal_payload_follows_configuration() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let journal = Arc::new(InMemoryJournal::new());
        let cache = WorkspaceCache::new("ws", store, journal.clone(), true).unwrap();
        let session = SessionId::new();
        add_node(&cache, session, "n1", "/n1");

        let record = journal
            .records(IterationOrder::Forward)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert!(record.payload.is_some());
        assert_eq!(record.changed, BTreeSet::from([key("n1")]));
    }

    #[test]
    fn failed_journal_append_parks_the_record() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let journal = Arc::new(FlakyJournal::new());
        let cache = WorkspaceCache::new("ws", store.clone(), journal.clone(), false).unwrap();
        let listener = Arc::new(CountingListener::default());
        cache
            .bus()
            .register(ListenerFilter::default(), None, listener.clone());

        journal.fail_next();
        let session = SessionId::new();
        let receipt = add_node(&cache, session, "n1", "/n1");

        // The commit itself succeeded and is durable.
        assert_eq!(receipt.journal_seq, None);
        assert!(store.contains(&key("n1")).unwrap());
        assert!(cache.get(&key("n1")).unwrap().is_some());
        assert_eq!(cache.backlog_len(), 1);
        // Events are held back until the record lands.
        assert!(listener.batches.lock().unwrap().is_empty());

        let reconciled = cache.reconcile_journal().unwrap();
        assert_eq!(reconciled, 1);
        assert_eq!(cache.backlog_len(), 0);
        assert_eq!(journal.last_sequence().unwrap(), 1);

        let batches = listener.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].journal_seq, 1);
    }

    #[test]
    fn reconcile_stops_at_first_failure() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let journal = Arc::new(FlakyJournal::new());
        let cache = WorkspaceCache::new("ws", store, journal.clone(), false).unwrap();
        let session = SessionId::new();

        journal.fail_next();
        add_node(&cache, session, "n1", "/n1");
        journal.fail_next();
        add_node(&cache, session, "n2", "/n2");
        assert_eq!(cache.backlog_len(), 2);

        journal.fail_next();
        assert!(cache.reconcile_journal().is_err());
        assert_eq!(cache.backlog_len(), 2);

        assert_eq!(cache.reconcile_journal().unwrap(), 2);
        assert_eq!(journal.last_sequence().unwrap(), 2);
    }

    #[test]
    fn store_failure_fails_the_commit_cleanly() {
        let (cache, store) = new_cache();
        let session = SessionId::new();
        store.fail_next_write("disk full");

        let node = CachedNode::new(key("n1"), cache.root_key().clone());
        let err = cache
            .commit(session, vec![(key("n1"), KeyChange::Add { node })], vec![])
            .unwrap_err();
        assert!(matches!(err, CacheError::Store(_)));
        assert!(cache.get(&key("n1")).unwrap().is_none());

        // The reserved keys were released; a retry goes through.
        add_node(&cache, session, "n1", "/n1");
    }

    #[test]
    fn subtree_keys_cover_descendants() {
        let (cache, _) = new_cache();
        let session = SessionId::new();

        let child = CachedNode::new(key("child"), cache.root_key().clone());
        let grandchild = CachedNode::new(key("grandchild"), key("child"));
        let child = child.with_child("grandchild", key("grandchild"));
        cache
            .commit(
                session,
                vec![
                    (key("child"), KeyChange::Add { node: child }),
                    (key("grandchild"), KeyChange::Add { node: grandchild }),
                ],
                vec![],
            )
            .unwrap();

        let keys = cache.collect_subtree_keys(&key("child")).unwrap();
        assert_eq!(keys, vec![key("child"), key("grandchild")]);
    }

    #[test]
    fn disjoint_commits_run_concurrently() {
        use std::thread;

        let (cache, _) = new_cache();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    let session = SessionId::new();
                    for j in 0..20 {
                        let id = format!("n{i}-{j}");
                        let node = CachedNode::new(key(&id), cache.root_key().clone())
                            .with_property("slot", PropertyValue::Long(j));
                        cache
                            .commit(
                                session,
                                vec![(key(&id), KeyChange::Add { node })],
                                vec![],
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // 160 adds, every one journaled exactly once.
        assert_eq!(cache.journal.last_sequence().unwrap(), 160);
        for i in 0..8 {
            for j in 0..20 {
                assert!(cache.get(&key(&format!("n{i}-{j}"))).unwrap().is_some());
            }
        }
    }

    #[test]
    fn overlapping_commits_serialize_one_winner() {
        use std::thread;

        let (cache, _) = new_cache();
        let setup = SessionId::new();
        add_node(&cache, setup, "contested", "/contested");
        let (node, version) = cache.get_with_version(&key("contested")).unwrap().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                let base = (*node).clone();
                thread::spawn(move || {
                    let session = SessionId::new();
                    let updated = base.with_property("winner", PropertyValue::Long(i));
                    cache
                        .commit(
                            session,
                            vec![(
                                key("contested"),
                                KeyChange::Replace {
                                    node: updated,
                                    base_version: version,
                                },
                            )],
                            vec![],
                        )
                        .is_ok()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }
}
