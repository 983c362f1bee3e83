//! Document persistence for the Canopy content repository.
//!
//! Everything durable in Canopy is a [`Document`]: a nested structure of
//! scalars, ordered arrays, and key-unique maps. Documents are the only
//! form ever handed to a [`DocumentStore`] backend, and the
//! [`DocumentTranslator`] is the single codec between cached node snapshots
//! and documents.
//!
//! # Design Rules
//!
//! 1. Document encoding is deterministic: equal documents always produce
//!    byte-identical encodings, so callers may compare encodings directly.
//! 2. The store never interprets document contents — it is a pure
//!    key-to-document map.
//! 3. A batch applies atomically: either every operation takes effect or
//!    none does. This is what lets a commit participate in an ambient
//!    transaction without partial persists.
//! 4. Absence is not an error: `get` returns `Ok(None)` for unknown keys.

pub mod document;
pub mod error;
pub mod memory;
pub mod traits;
pub mod translator;

pub use document::{Document, DocumentValue};
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryDocumentStore;
pub use traits::{BatchOperation, DocumentStore};
pub use translator::{DocumentTranslator, SCHEMA_VERSION};
