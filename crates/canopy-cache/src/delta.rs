use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use canopy_types::{CachedNode, ChildReference, NodeKey, PropertyValue};

/// Session-local pending change for one node key.
///
/// Deltas compose: repeated edits to the same key collapse into the latest
/// effective state, and an edit sequence that cancels itself out collapses
/// back to `Unchanged` (the tombstone for a node added and removed within
/// the same session — its key stays reserved for the session's lifetime).
#[derive(Clone, Debug)]
pub enum NodeDelta {
    Unchanged,
    /// Node created by this session; does not exist in committed state.
    Added(CachedNode),
    /// Node exists in committed state; this session has pending edits.
    Modified(NodeChanges),
    /// Node exists in committed state; this session removes it.
    Removed { base_version: u64 },
}

impl NodeDelta {
    /// Returns `true` if committing this delta would change nothing.
    pub fn is_noop(&self) -> bool {
        match self {
            Self::Unchanged => true,
            Self::Added(_) | Self::Removed { .. } => false,
            Self::Modified(changes) => changes.is_noop(),
        }
    }
}

/// Pending edits against one committed node snapshot.
///
/// Holds the base snapshot (and the cache version it was observed at, for
/// conflict detection) plus the accumulated edits. [`apply`](Self::apply)
/// materializes the effective node without touching shared state.
#[derive(Clone, Debug)]
pub struct NodeChanges {
    base: Arc<CachedNode>,
    base_version: u64,
    set_properties: BTreeMap<String, PropertyValue>,
    removed_properties: BTreeSet<String>,
    appended_children: Vec<ChildReference>,
    removed_children: BTreeSet<NodeKey>,
    added_types: BTreeSet<String>,
    removed_types: BTreeSet<String>,
}

impl NodeChanges {
    pub fn new(base: Arc<CachedNode>, base_version: u64) -> Self {
        Self {
            base,
            base_version,
            set_properties: BTreeMap::new(),
            removed_properties: BTreeSet::new(),
            appended_children: Vec::new(),
            removed_children: BTreeSet::new(),
            added_types: BTreeSet::new(),
            removed_types: BTreeSet::new(),
        }
    }

    pub fn base(&self) -> &Arc<CachedNode> {
        &self.base
    }

    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    pub fn set_properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.set_properties
    }

    pub fn removed_properties(&self) -> &BTreeSet<String> {
        &self.removed_properties
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: PropertyValue) {
        let name = name.into();
        self.removed_properties.remove(&name);
        self.set_properties.insert(name, value);
    }

    pub fn remove_property(&mut self, name: &str) {
        self.set_properties.remove(name);
        if self.base.property(name).is_some() {
            self.removed_properties.insert(name.to_string());
        }
    }

    pub fn append_child(&mut self, name: impl Into<String>, key: NodeKey) {
        self.appended_children.push(ChildReference::new(name, key));
    }

    /// Remove a child reference. Returns `true` if the child had been
    /// appended within this same change set (i.e. it never existed in the
    /// committed base).
    pub fn remove_child(&mut self, key: &NodeKey) -> bool {
        if let Some(pos) = self.appended_children.iter().position(|c| &c.key == key) {
            self.appended_children.remove(pos);
            return true;
        }
        if self.base.has_child(key) {
            self.removed_children.insert(key.clone());
        }
        false
    }

    pub fn add_type(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.removed_types.remove(&name);
        if !self.base.has_type(&name) {
            self.added_types.insert(name);
        }
    }

    pub fn remove_type(&mut self, name: &str) {
        self.added_types.remove(name);
        if self.base.has_type(name) {
            self.removed_types.insert(name.to_string());
        }
    }

    pub fn is_noop(&self) -> bool {
        self.set_properties.is_empty()
            && self.removed_properties.is_empty()
            && self.appended_children.is_empty()
            && self.removed_children.is_empty()
            && self.added_types.is_empty()
            && self.removed_types.is_empty()
    }

    /// Re-anchor the same edits onto a newer committed snapshot. Used by
    /// `refresh(keep_changes = true)` after another session's commit moved
    /// the base forward.
    pub fn rebase(mut self, new_base: Arc<CachedNode>, new_version: u64) -> Self {
        // Drop property removals that no longer apply to the new base.
        self.removed_properties
            .retain(|name| new_base.property(name).is_some());
        self.removed_children
            .retain(|key| new_base.has_child(key));
        self.removed_types.retain(|name| new_base.has_type(name));
        self.added_types.retain(|name| !new_base.has_type(name));
        self.base = new_base;
        self.base_version = new_version;
        self
    }

    /// Materialize the effective node: the base snapshot with every pending
    /// edit applied, in a fresh value.
    pub fn apply(&self) -> CachedNode {
        let mut node = (*self.base).clone();
        for name in &self.removed_properties {
            node = node.without_property(name);
        }
        for (name, value) in &self.set_properties {
            node = node.with_property(name.clone(), value.clone());
        }
        for key in &self.removed_children {
            node = node.without_child(key);
        }
        for child in &self.appended_children {
            node = node.with_child(child.name.clone(), child.key.clone());
        }
        for name in &self.removed_types {
            node = node.without_type(name);
        }
        for name in &self.added_types {
            node = node.with_type(name.clone());
        }
        node
    }
}
