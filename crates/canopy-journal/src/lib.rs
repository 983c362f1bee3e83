//! Durable, append-only change journal for the Canopy content repository.
//!
//! Every successful commit appends exactly one [`JournalRecord`]: a strictly
//! increasing sequence number, a commit timestamp, the set of changed node
//! keys, and an optional full change payload. Records are immutable once
//! written and are consumed by indexers, replication, and observers.
//!
//! Two backends implement the [`ChangeJournal`] trait:
//!
//! - [`InMemoryJournal`] — for tests and embedding
//! - [`FileJournal`] — CRC-framed append-only file that survives process
//!   restart and tolerates a torn tail from a crash

pub mod error;
pub mod file;
pub mod memory;
pub mod records;
pub mod replay;
pub mod traits;

pub use error::{JournalError, JournalResult};
pub use file::{FileJournal, FileJournalConfig, SyncMode};
pub use memory::InMemoryJournal;
pub use records::JournalRecord;
pub use replay::{changed_keys_since, fold_changed_keys};
pub use traits::{ChangeJournal, IterationOrder, JournalIter};
