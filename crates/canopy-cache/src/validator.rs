use canopy_types::{CachedNode, NodeKey, SessionId};

/// One rule violation reported by the external validator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstraintViolation {
    pub key: NodeKey,
    pub message: String,
}

impl ConstraintViolation {
    pub fn new(key: NodeKey, message: impl Into<String>) -> Self {
        Self {
            key,
            message: message.into(),
        }
    }
}

/// How a change set entry affects its key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeSetKind {
    Added,
    Modified,
    Removed,
}

/// One pending change presented to the validator: the key, the kind of
/// change, and the effective post-change node state (`None` for removals).
#[derive(Clone, Debug)]
pub struct ChangeSetEntry {
    pub key: NodeKey,
    pub kind: ChangeSetKind,
    pub node: Option<CachedNode>,
}

/// The full pending delta of one session, as handed to the validator
/// before any shared state is touched.
#[derive(Clone, Debug)]
pub struct ChangeSet {
    pub workspace: String,
    pub session: SessionId,
    pub entries: Vec<ChangeSetEntry>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &NodeKey> {
        self.entries.iter().map(|e| &e.key)
    }
}

/// External constraint/schema validation contract.
///
/// Invoked synchronously during `save()` before the merge. Returning any
/// violation aborts the save and leaves the session's delta untouched so
/// the caller can fix and retry. The cache never interprets the rules;
/// node-type grammar and constraint semantics live behind this seam.
pub trait ConstraintValidator: Send + Sync {
    fn validate(&self, changes: &ChangeSet) -> Vec<ConstraintViolation>;
}

/// Validator that accepts everything. The default when no schema layer is
/// wired in.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassThroughValidator;

impl ConstraintValidator for PassThroughValidator {
    fn validate(&self, _changes: &ChangeSet) -> Vec<ConstraintViolation> {
        Vec::new()
    }
}
