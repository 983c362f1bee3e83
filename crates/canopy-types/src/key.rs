use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TypeError;

/// Separator between the workspace id and the local id in the canonical
/// string form. Neither segment may contain it.
pub const KEY_DELIMITER: char = ':';

/// Value-typed identity of a node within one workspace.
///
/// A `NodeKey` is a `(workspace, local id)` pair. Keys are value-equal,
/// totally ordered (workspace first, then local id, both lexicographic),
/// and immutable. The canonical string form `"{workspace}:{id}"`
/// round-trips exactly through [`fmt::Display`] and [`FromStr`].
///
/// Keys are never reused: a removed node's key stays valid as a tombstone
/// reference for any session still holding it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    workspace: String,
    id: String,
}

impl NodeKey {
    /// Create a key from a workspace id and an explicit local id.
    ///
    /// Fails if either segment is empty or contains the reserved `':'`
    /// delimiter.
    pub fn new(workspace: impl Into<String>, id: impl Into<String>) -> Result<Self, TypeError> {
        let workspace = workspace.into();
        let id = id.into();
        if workspace.is_empty() {
            return Err(TypeError::EmptyWorkspaceId);
        }
        if id.is_empty() {
            return Err(TypeError::EmptyNodeId);
        }
        if workspace.contains(KEY_DELIMITER) {
            return Err(TypeError::ReservedDelimiter(workspace));
        }
        if id.contains(KEY_DELIMITER) {
            return Err(TypeError::ReservedDelimiter(id));
        }
        Ok(Self { workspace, id })
    }

    /// Create a key with a freshly generated UUID v7 local id.
    ///
    /// UUID v7 ids are time-ordered, so keys generated by one session sort
    /// roughly in creation order.
    pub fn generate(workspace: impl Into<String>) -> Result<Self, TypeError> {
        Self::new(workspace, Uuid::now_v7().to_string())
    }

    /// The well-known key of a workspace's root node.
    pub fn root_of(workspace: impl Into<String>) -> Result<Self, TypeError> {
        Self::new(workspace, "root")
    }

    /// The workspace id segment.
    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    /// The local id segment.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns `true` if this key belongs to the given workspace.
    pub fn is_in_workspace(&self, workspace: &str) -> bool {
        self.workspace == workspace
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.workspace, KEY_DELIMITER, self.id)
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey({self})")
    }
}

impl FromStr for NodeKey {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (workspace, id) = s
            .split_once(KEY_DELIMITER)
            .ok_or_else(|| TypeError::MalformedKey(s.to_string()))?;
        Self::new(workspace, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_empty_workspace() {
        assert_eq!(NodeKey::new("", "n1"), Err(TypeError::EmptyWorkspaceId));
    }

    #[test]
    fn new_rejects_empty_id() {
        assert_eq!(NodeKey::new("ws", ""), Err(TypeError::EmptyNodeId));
    }

    #[test]
    fn new_rejects_reserved_delimiter() {
        assert!(matches!(
            NodeKey::new("ws:1", "n1"),
            Err(TypeError::ReservedDelimiter(_))
        ));
        assert!(matches!(
            NodeKey::new("ws", "a:b"),
            Err(TypeError::ReservedDelimiter(_))
        ));
    }

    #[test]
    fn canonical_string_round_trips() {
        let key = NodeKey::new("ws1", "node-42").unwrap();
        let s = key.to_string();
        assert_eq!(s, "ws1:node-42");
        let parsed: NodeKey = s.parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn parse_rejects_missing_delimiter() {
        let err = "no-delimiter-here".parse::<NodeKey>().unwrap_err();
        assert!(matches!(err, TypeError::MalformedKey(_)));
    }

    #[test]
    fn ordering_is_workspace_then_id() {
        let a = NodeKey::new("a", "z").unwrap();
        let b = NodeKey::new("b", "a").unwrap();
        let c = NodeKey::new("b", "b").unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn generated_keys_are_unique() {
        let k1 = NodeKey::generate("ws").unwrap();
        let k2 = NodeKey::generate("ws").unwrap();
        assert_ne!(k1, k2);
        assert_eq!(k1.workspace(), "ws");
    }

    #[test]
    fn generated_keys_are_time_ordered() {
        let k1 = NodeKey::generate("ws").unwrap();
        let k2 = NodeKey::generate("ws").unwrap();
        assert!(k1 < k2);
    }

    #[test]
    fn root_key_is_stable() {
        let r1 = NodeKey::root_of("ws").unwrap();
        let r2 = NodeKey::root_of("ws").unwrap();
        assert_eq!(r1, r2);
        assert_eq!(r1.id(), "root");
    }

    #[test]
    fn serde_round_trip() {
        let key = NodeKey::new("ws1", "n1").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        let parsed: NodeKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, key);
    }

    proptest::proptest! {
        #[test]
        fn display_parse_round_trip(
            ws in "[a-zA-Z0-9_-]{1,16}",
            id in "[a-zA-Z0-9_-]{1,32}",
        ) {
            let key = NodeKey::new(ws, id).unwrap();
            let parsed: NodeKey = key.to_string().parse().unwrap();
            proptest::prop_assert_eq!(parsed, key);
        }
    }
}
