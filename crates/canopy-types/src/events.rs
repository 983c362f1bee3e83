use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::key::NodeKey;
use crate::session::SessionId;

/// What happened to a node in one committed change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    NodeAdded,
    NodeRemoved,
    PropertyAdded,
    PropertyChanged,
    PropertyRemoved,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NodeAdded => "node-added",
            Self::NodeRemoved => "node-removed",
            Self::PropertyAdded => "property-added",
            Self::PropertyChanged => "property-changed",
            Self::PropertyRemoved => "property-removed",
        };
        f.write_str(s)
    }
}

/// One change to one node, as observed by a successful commit.
///
/// Events are produced in commit order and carry enough context (path,
/// node types, originating session) for listeners to filter without
/// consulting the cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub key: NodeKey,
    /// Absolute path of the affected node at commit time, `/`-separated
    /// with a leading slash; the root's path is `/`.
    pub path: String,
    /// Property name, for the three property event kinds.
    pub property: Option<String>,
    /// Node type names assigned to the affected node at commit time.
    pub node_types: BTreeSet<String>,
    /// Session whose save produced this event.
    pub session: SessionId,
}

impl ChangeEvent {
    /// Subtree depth of the affected node: the root is depth 0, its
    /// children depth 1, and so on.
    pub fn depth(&self) -> usize {
        if self.path == "/" {
            0
        } else {
            self.path.matches('/').count()
        }
    }

    /// Returns `true` if the affected node lies at or under `prefix`.
    pub fn is_under(&self, prefix: &str) -> bool {
        if prefix == "/" || prefix.is_empty() {
            return true;
        }
        let prefix = prefix.trim_end_matches('/');
        self.path == prefix || self.path.starts_with(&format!("{prefix}/"))
    }
}
