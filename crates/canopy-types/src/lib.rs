//! Foundation types for the Canopy content repository.
//!
//! This crate provides the data model shared by every other Canopy crate.
//!
//! # Key Types
//!
//! - [`NodeKey`] — value-typed node identity `(workspace, local id)`
//! - [`PropertyValue`] — typed property values (string, long, boolean, date, reference)
//! - [`CachedNode`] — immutable snapshot of a node's committed state
//! - [`SessionId`] — UUID v7 identity of a logged-in session
//! - [`ChangeEvent`] / [`ChangeKind`] — per-node change notifications shared
//!   by the journal payload and the observation bus

pub mod error;
pub mod events;
pub mod key;
pub mod node;
pub mod session;
pub mod value;

pub use error::TypeError;
pub use events::{ChangeEvent, ChangeKind};
pub use key::NodeKey;
pub use node::{CachedNode, ChildReference};
pub use session::SessionId;
pub use value::PropertyValue;
