use std::collections::{BTreeMap, BTreeSet};

use canopy_types::{CachedNode, ChildReference, NodeKey, PropertyValue};

use crate::document::{Document, DocumentValue};
use crate::error::{StoreError, StoreResult};

/// Schema version written into every encoded document. Decoding accepts
/// the current version and anything older; newer documents are rejected.
pub const SCHEMA_VERSION: i64 = 1;

const FIELD_SCHEMA: &str = "schema";
const FIELD_KEY: &str = "key";
const FIELD_PARENT: &str = "parent";
const FIELD_CHILDREN: &str = "children";
const FIELD_PROPERTIES: &str = "properties";
const FIELD_TYPES: &str = "types";
const FIELD_CHILD_NAME: &str = "name";
const FIELD_CHILD_KEY: &str = "key";

/// Deterministic codec between [`CachedNode`] snapshots and [`Document`]s.
///
/// `encode` and `decode` are mutual inverses. Because documents use
/// canonical field ordering, identical logical node state always encodes
/// to byte-identical documents, so callers may compare encodings without
/// re-decoding.
#[derive(Clone, Copy, Debug, Default)]
pub struct DocumentTranslator;

impl DocumentTranslator {
    pub fn new() -> Self {
        Self
    }

    pub fn encode(&self, node: &CachedNode) -> Document {
        let children: Vec<DocumentValue> = node
            .children()
            .iter()
            .map(|c| {
                let mut entry = BTreeMap::new();
                entry.insert(
                    FIELD_CHILD_NAME.to_string(),
                    DocumentValue::String(c.name.clone()),
                );
                entry.insert(
                    FIELD_CHILD_KEY.to_string(),
                    DocumentValue::Reference(c.key.to_string()),
                );
                DocumentValue::Map(entry)
            })
            .collect();

        let properties: BTreeMap<String, DocumentValue> = node
            .properties()
            .iter()
            .map(|(name, value)| (name.clone(), encode_property(value)))
            .collect();

        let types: Vec<DocumentValue> = node
            .types()
            .iter()
            .map(|t| DocumentValue::String(t.clone()))
            .collect();

        let mut doc = Document::new()
            .with_field(FIELD_SCHEMA, DocumentValue::Long(SCHEMA_VERSION))
            .with_field(FIELD_KEY, DocumentValue::Reference(node.key().to_string()))
            .with_field(FIELD_CHILDREN, DocumentValue::Array(children))
            .with_field(FIELD_PROPERTIES, DocumentValue::Map(properties))
            .with_field(FIELD_TYPES, DocumentValue::Array(types));
        if let Some(parent) = node.parent() {
            doc.set(FIELD_PARENT, DocumentValue::Reference(parent.to_string()));
        }
        doc
    }

    pub fn decode(&self, document: &Document) -> StoreResult<CachedNode> {
        let schema = document
            .require(FIELD_SCHEMA)?
            .as_long()
            .ok_or_else(|| StoreError::Corrupt("schema field is not a long".into()))?;
        if schema > SCHEMA_VERSION {
            return Err(StoreError::Schema {
                found: schema,
                current: SCHEMA_VERSION,
            });
        }

        let key = decode_key(document.require(FIELD_KEY)?)?;
        let parent = match document.get(FIELD_PARENT) {
            Some(value) => Some(decode_key(value)?),
            None => None,
        };

        let children = document
            .require(FIELD_CHILDREN)?
            .as_array()
            .ok_or_else(|| StoreError::Corrupt("children field is not an array".into()))?
            .iter()
            .map(decode_child)
            .collect::<StoreResult<Vec<_>>>()?;

        let properties = document
            .require(FIELD_PROPERTIES)?
            .as_map()
            .ok_or_else(|| StoreError::Corrupt("properties field is not a map".into()))?
            .iter()
            .map(|(name, value)| Ok((name.clone(), decode_property(value)?)))
            .collect::<StoreResult<BTreeMap<_, _>>>()?;

        let types = document
            .require(FIELD_TYPES)?
            .as_array()
            .ok_or_else(|| StoreError::Corrupt("types field is not an array".into()))?
            .iter()
            .map(|v| {
                v.as_string()
                    .map(str::to_string)
                    .ok_or_else(|| StoreError::Corrupt("type name is not a string".into()))
            })
            .collect::<StoreResult<BTreeSet<_>>>()?;

        Ok(CachedNode::from_parts(key, parent, children, properties, types))
    }
}

fn encode_property(value: &PropertyValue) -> DocumentValue {
    match value {
        PropertyValue::String(s) => DocumentValue::String(s.clone()),
        PropertyValue::Long(v) => DocumentValue::Long(*v),
        PropertyValue::Boolean(v) => DocumentValue::Boolean(*v),
        PropertyValue::Date(v) => DocumentValue::Date(*v),
        PropertyValue::Reference(k) => DocumentValue::Reference(k.to_string()),
    }
}

fn decode_property(value: &DocumentValue) -> StoreResult<PropertyValue> {
    match value {
        DocumentValue::String(s) => Ok(PropertyValue::String(s.clone())),
        DocumentValue::Long(v) => Ok(PropertyValue::Long(*v)),
        DocumentValue::Boolean(v) => Ok(PropertyValue::Boolean(*v)),
        DocumentValue::Date(v) => Ok(PropertyValue::Date(*v)),
        DocumentValue::Reference(s) => Ok(PropertyValue::Reference(s.parse::<NodeKey>()?)),
        DocumentValue::Array(_) | DocumentValue::Map(_) => Err(StoreError::Corrupt(
            "property value must be a scalar".into(),
        )),
    }
}

fn decode_key(value: &DocumentValue) -> StoreResult<NodeKey> {
    match value {
        DocumentValue::Reference(s) => Ok(s.parse::<NodeKey>()?),
        _ => Err(StoreError::Corrupt("expected a node reference".into())),
    }
}

fn decode_child(value: &DocumentValue) -> StoreResult<ChildReference> {
    let entry = value
        .as_map()
        .ok_or_else(|| StoreError::Corrupt("child entry is not a map".into()))?;
    let name = entry
        .get(FIELD_CHILD_NAME)
        .and_then(DocumentValue::as_string)
        .ok_or_else(|| StoreError::Corrupt("child entry missing name".into()))?;
    let key = decode_key(
        entry
            .get(FIELD_CHILD_KEY)
            .ok_or_else(|| StoreError::Corrupt("child entry missing key".into()))?,
    )?;
    Ok(ChildReference::new(name, key))
}
