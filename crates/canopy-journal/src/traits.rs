use std::collections::BTreeSet;

use canopy_types::{ChangeEvent, NodeKey};

use crate::error::JournalResult;
use crate::records::JournalRecord;

/// Direction of journal iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterationOrder {
    /// Oldest record first.
    Forward,
    /// Most recent record first.
    Reverse,
}

/// A restartable, lazy pass over persisted records. Calling
/// [`ChangeJournal::records`] again yields a fresh, independent iterator.
pub type JournalIter = Box<dyn Iterator<Item = JournalResult<JournalRecord>> + Send>;

/// Durable, strictly ordered, append-only log of committed transactions.
///
/// Implementations must guarantee:
/// - `append` assigns the next sequence number atomically; two concurrent
///   appends never observe the same sequence.
/// - Once `append` returns, the record is part of every subsequent
///   iteration (for durable backends: also after process restart).
/// - Records are never modified or reordered after append.
pub trait ChangeJournal: Send + Sync {
    /// Append one record covering the given changed-key set. Called exactly
    /// once per successful commit.
    fn append(
        &self,
        changed: BTreeSet<NodeKey>,
        payload: Option<Vec<ChangeEvent>>,
    ) -> JournalResult<JournalRecord>;

    /// Iterate over all persisted records in the given order.
    fn records(&self, order: IterationOrder) -> JournalResult<JournalIter>;

    /// Sequence number of the most recent record, or 0 if empty.
    fn last_sequence(&self) -> JournalResult<u64>;
}
