use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::key::NodeKey;
use crate::value::PropertyValue;

/// An ordered reference from a parent node to one of its children.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildReference {
    pub name: String,
    pub key: NodeKey,
}

impl ChildReference {
    pub fn new(name: impl Into<String>, key: NodeKey) -> Self {
        Self {
            name: name.into(),
            key,
        }
    }
}

/// Immutable snapshot of one node's committed state.
///
/// A `CachedNode` is never mutated in place. Every "mutator" (`with_*`,
/// `without_*`) returns a new value, and the shared cache swaps whole
/// entries atomically. This is what makes lock-free concurrent reads safe:
/// a reader holding an `Arc<CachedNode>` sees a consistent snapshot no
/// matter what commits happen afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedNode {
    key: NodeKey,
    /// Absent only for a workspace root.
    parent: Option<NodeKey>,
    /// Ordered child list. Order is significant and preserved.
    children: Vec<ChildReference>,
    properties: BTreeMap<String, PropertyValue>,
    /// Assigned node type names.
    types: BTreeSet<String>,
}

impl CachedNode {
    /// Create an empty node under the given parent.
    pub fn new(key: NodeKey, parent: NodeKey) -> Self {
        Self {
            key,
            parent: Some(parent),
            children: Vec::new(),
            properties: BTreeMap::new(),
            types: BTreeSet::new(),
        }
    }

    /// Create a workspace root node (no parent).
    pub fn new_root(key: NodeKey) -> Self {
        Self {
            key,
            parent: None,
            children: Vec::new(),
            properties: BTreeMap::new(),
            types: BTreeSet::new(),
        }
    }

    /// Rebuild a node from its decoded parts. Used by the document codec.
    pub fn from_parts(
        key: NodeKey,
        parent: Option<NodeKey>,
        children: Vec<ChildReference>,
        properties: BTreeMap<String, PropertyValue>,
        types: BTreeSet<String>,
    ) -> Self {
        Self {
            key,
            parent,
            children,
            properties,
            types,
        }
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn parent(&self) -> Option<&NodeKey> {
        self.parent.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn children(&self) -> &[ChildReference] {
        &self.children
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// First child with the given name, if any.
    pub fn child_named(&self, name: &str) -> Option<&ChildReference> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn has_child(&self, key: &NodeKey) -> bool {
        self.children.iter().any(|c| &c.key == key)
    }

    /// The name this node has within the given parent snapshot, if the
    /// parent actually lists it.
    pub fn name_in<'a>(&self, parent: &'a CachedNode) -> Option<&'a str> {
        parent
            .children
            .iter()
            .find(|c| c.key == self.key)
            .map(|c| c.name.as_str())
    }

    pub fn properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn types(&self) -> &BTreeSet<String> {
        &self.types
    }

    pub fn has_type(&self, name: &str) -> bool {
        self.types.contains(name)
    }

    pub fn with_property(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn without_property(mut self, name: &str) -> Self {
        self.properties.remove(name);
        self
    }

    /// Append a child reference. The caller is responsible for name
    /// uniqueness policy; the cache itself permits same-name siblings.
    pub fn with_child(mut self, name: impl Into<String>, key: NodeKey) -> Self {
        self.children.push(ChildReference::new(name, key));
        self
    }

    pub fn without_child(mut self, key: &NodeKey) -> Self {
        self.children.retain(|c| &c.key != key);
        self
    }

    pub fn with_type(mut self, name: impl Into<String>) -> Self {
        self.types.insert(name.into());
        self
    }

    pub fn without_type(mut self, name: &str) -> Self {
        self.types.remove(name);
        self
    }
}
