use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Duration;
use tracing::{debug, info, warn};

use canopy_cache::{
    ConstraintValidator, LockTable, PassThroughValidator, SessionCache, SessionRegistry,
    WorkspaceCache,
};
use canopy_journal::{memory::InMemoryJournal, ChangeJournal};
use canopy_store::{BatchOperation, DocumentStore};
use canopy_types::{NodeKey, SessionId};

use crate::error::{RepoError, RepoResult};

/// Produces the change journal backing a newly opened workspace.
pub type JournalFactory =
    Arc<dyn Fn(&str) -> RepoResult<Arc<dyn ChangeJournal>> + Send + Sync>;

/// Repository-level policy knobs.
#[derive(Clone, Debug)]
pub struct RepositoryConfig {
    /// Whether `get_workspace` creates a missing workspace instead of
    /// failing with [`RepoError::NoSuchWorkspace`].
    pub auto_create_workspaces: bool,
    /// Lease granted to newly acquired locks and applied by lease
    /// extension.
    pub default_lock_lease: Duration,
    /// Whether journal records carry the full event payload or keys only.
    pub journal_payloads: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            auto_create_workspaces: false,
            default_lock_lease: Duration::minutes(15),
            journal_payloads: false,
        }
    }
}

/// Active-session table. Registered with every session it hands out, so a
/// logout deregisters itself.
#[derive(Default)]
struct SessionTable {
    sessions: RwLock<HashMap<SessionId, String>>,
}

impl SessionTable {
    fn register(&self, id: SessionId, workspace: String) {
        self.sessions
            .write()
            .expect("session table poisoned")
            .insert(id, workspace);
    }

    fn contains(&self, id: &SessionId) -> bool {
        self.sessions
            .read()
            .expect("session table poisoned")
            .contains_key(id)
    }

    fn workspace_of(&self, id: &SessionId) -> Option<String> {
        self.sessions
            .read()
            .expect("session table poisoned")
            .get(id)
            .cloned()
    }

    fn len(&self) -> usize {
        self.sessions.read().expect("session table poisoned").len()
    }
}

impl SessionRegistry for SessionTable {
    fn deregister(&self, id: SessionId) {
        self.sessions
            .write()
            .expect("session table poisoned")
            .remove(&id);
    }
}

/// Top-level registry of workspaces, sessions, and the repository-wide
/// lock table.
///
/// All workspaces share one document store and one lock table; each
/// workspace gets its own change journal from the configured factory.
pub struct RepositoryCache {
    config: RepositoryConfig,
    store: Arc<dyn DocumentStore>,
    journal_factory: JournalFactory,
    validator: Arc<dyn ConstraintValidator>,
    workspaces: RwLock<HashMap<String, Arc<WorkspaceCache>>>,
    locks: Arc<LockTable>,
    sessions: Arc<SessionTable>,
}

impl RepositoryCache {
    /// Open a repository over `store` with in-memory journals and no
    /// constraint validation. Use the `with_*` builders to override.
    pub fn new(store: Arc<dyn DocumentStore>, config: RepositoryConfig) -> Self {
        Self {
            config,
            store,
            journal_factory: Arc::new(|_| Ok(Arc::new(InMemoryJournal::new()))),
            validator: Arc::new(PassThroughValidator),
            workspaces: RwLock::new(HashMap::new()),
            locks: Arc::new(LockTable::new()),
            sessions: Arc::new(SessionTable::default()),
        }
    }

    /// Replace the per-workspace journal factory, e.g. to place a
    /// `FileJournal` per workspace under a data directory.
    pub fn with_journal_factory(mut self, factory: JournalFactory) -> Self {
        self.journal_factory = factory;
        self
    }

    /// Replace the constraint validator applied to every session's save.
    pub fn with_validator(mut self, validator: Arc<dyn ConstraintValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    fn open_workspace(&self, name: &str) -> RepoResult<Arc<WorkspaceCache>> {
        let journal = (self.journal_factory)(name)?;
        let workspace = Arc::new(WorkspaceCache::new(
            name,
            Arc::clone(&self.store),
            journal,
            self.config.journal_payloads,
        )?);
        Ok(workspace)
    }

    fn register(&self, workspace: Arc<WorkspaceCache>) -> Arc<WorkspaceCache> {
        let mut workspaces = self.workspaces.write().expect("workspace table poisoned");
        // A racing open may have won; keep the registered one.
        workspaces
            .entry(workspace.name().to_string())
            .or_insert(workspace)
            .clone()
    }

    /// Look up a workspace, reopening it from the store if its root
    /// document exists, or creating it when the auto-create policy allows.
    pub fn get_workspace(&self, name: &str) -> RepoResult<Arc<WorkspaceCache>> {
        if let Some(workspace) = self
            .workspaces
            .read()
            .expect("workspace table poisoned")
            .get(name)
        {
            return Ok(Arc::clone(workspace));
        }

        let root_key = NodeKey::root_of(name)?;
        if self.store.contains(&root_key)? {
            debug!(workspace = name, "reopening persisted workspace");
            return Ok(self.register(self.open_workspace(name)?));
        }
        if self.config.auto_create_workspaces {
            info!(workspace = name, "auto-creating workspace");
            return Ok(self.register(self.open_workspace(name)?));
        }
        Err(RepoError::NoSuchWorkspace(name.to_string()))
    }

    /// Create a new workspace. Fails if the name is registered or its
    /// root document already exists in the store.
    pub fn create_workspace(&self, name: &str) -> RepoResult<Arc<WorkspaceCache>> {
        {
            let workspaces = self.workspaces.read().expect("workspace table poisoned");
            if workspaces.contains_key(name) {
                return Err(RepoError::WorkspaceAlreadyExists(name.to_string()));
            }
        }
        let root_key = NodeKey::root_of(name)?;
        if self.store.contains(&root_key)? {
            return Err(RepoError::WorkspaceAlreadyExists(name.to_string()));
        }
        info!(workspace = name, "creating workspace");
        Ok(self.register(self.open_workspace(name)?))
    }

    /// Deregister a workspace and remove its documents from the store.
    /// Returns the number of documents removed. Sessions still holding the
    /// workspace keep their handle but every read resolves to absence.
    pub fn destroy_workspace(&self, name: &str) -> RepoResult<usize> {
        let workspace = {
            let mut workspaces = self.workspaces.write().expect("workspace table poisoned");
            workspaces.remove(name)
        };
        let workspace = match workspace {
            Some(workspace) => workspace,
            None => {
                let root_key = NodeKey::root_of(name)?;
                if !self.store.contains(&root_key)? {
                    return Err(RepoError::NoSuchWorkspace(name.to_string()));
                }
                self.open_workspace(name)?
            }
        };

        let keys = workspace.collect_subtree_keys(workspace.root_key())?;
        let removed = keys.len();
        let batch = keys
            .into_iter()
            .map(|key| BatchOperation::Remove { key })
            .collect();
        self.store.apply(batch)?;
        workspace.invalidate_all();
        warn!(workspace = name, documents = removed, "workspace destroyed");
        Ok(removed)
    }

    /// Names of all currently registered workspaces.
    pub fn workspace_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .workspaces
            .read()
            .expect("workspace table poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Open a session on a workspace. The session is registered as active
    /// until it logs out.
    pub fn login(&self, workspace: &str) -> RepoResult<Arc<SessionCache>> {
        let workspace = self.get_workspace(workspace)?;
        let session = Arc::new(SessionCache::new(
            Arc::clone(&workspace),
            Arc::clone(&self.locks),
            Arc::clone(&self.validator),
            self.config.default_lock_lease,
        ));
        self.sessions
            .register(session.id(), workspace.name().to_string());
        session.set_registry(Arc::clone(&self.sessions) as Arc<dyn SessionRegistry>);
        Ok(session)
    }

    /// Number of logged-in, not-yet-logged-out sessions.
    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    /// The workspace a session is logged into.
    pub fn session_workspace(&self, id: SessionId) -> RepoResult<String> {
        self.sessions
            .workspace_of(&id)
            .ok_or(RepoError::NoSuchSession(id))
    }

    /// Release locks whose owning session is gone and whose lease has
    /// lapsed. Returns the released keys.
    pub fn clean_up_locks(&self) -> Vec<NodeKey> {
        let sessions = Arc::clone(&self.sessions);
        self.locks.clean_up(move |owner| sessions.contains(owner))
    }
}
