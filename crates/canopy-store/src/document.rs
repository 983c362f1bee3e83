use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// One value inside a [`Document`]: a scalar, an ordered array, or a
/// key-unique nested map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentValue {
    String(String),
    Long(i64),
    Boolean(bool),
    Date(DateTime<Utc>),
    /// A node reference in canonical `workspace:id` string form.
    Reference(String),
    Array(Vec<DocumentValue>),
    Map(BTreeMap<String, DocumentValue>),
}

impl DocumentValue {
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

    pub fn as_array(&self) -> Option<&[DocumentValue]> {
        match self {
            Self::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, DocumentValue>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }
}

/// The raw nested storage format persisted by a document store.
///
/// Top-level fields are a key-unique map. Field order is canonical
/// (`BTreeMap`), which together with bincode's positional encoding makes
/// [`Document::to_bytes`] deterministic: equal documents always encode to
/// byte-identical output.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Document {
    fields: BTreeMap<String, DocumentValue>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field assignment. Re-setting a field replaces it.
    pub fn with_field(mut self, name: impl Into<String>, value: DocumentValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: DocumentValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&DocumentValue> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &BTreeMap<String, DocumentValue> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// A field that must be present; missing fields are a corruption error.
    pub fn require(&self, name: &str) -> StoreResult<&DocumentValue> {
        self.get(name)
            .ok_or_else(|| StoreError::Corrupt(format!("missing field '{name}'")))
    }

    /// Deterministic binary encoding of the whole document.
    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}
