use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::NodeKey;

/// A typed property value stored on a node.
///
/// The five supported types cover the repository's property model. Values
/// are immutable; changing a property replaces the whole value.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PropertyValue {
    String(String),
    Long(i64),
    Boolean(bool),
    Date(DateTime<Utc>),
    /// Reference to another node by key. References are not validated by
    /// the cache; dangling references are the schema validator's concern.
    Reference(NodeKey),
}

impl PropertyValue {
    /// Short type name, used in document encoding and diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Long(_) => "long",
            Self::Boolean(_) => "boolean",
            Self::Date(_) => "date",
            Self::Reference(_) => "reference",
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Date(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&NodeKey> {
        match self {
            Self::Reference(k) => Some(k),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Date(v)
    }
}

impl From<NodeKey> for PropertyValue {
    fn from(v: NodeKey) -> Self {
        Self::Reference(v)
    }
}
