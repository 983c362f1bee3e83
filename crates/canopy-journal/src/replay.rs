//! Replay helpers for journal consumers.
//!
//! Indexers and replicas catch up by folding journal records into the set
//! of keys that changed since their last observed sequence. The fold is
//! idempotent: replaying a record that was already folded yields the same
//! set, never duplicate work items.

use std::collections::BTreeSet;

use canopy_types::NodeKey;

use crate::error::JournalResult;
use crate::records::JournalRecord;
use crate::traits::{ChangeJournal, IterationOrder};

/// Fold records into one changed-key set. Duplicate records (or duplicate
/// keys across records) collapse; the result depends only on which records
/// were seen, not how often.
pub fn fold_changed_keys<I>(records: I) -> BTreeSet<NodeKey>
where
    I: IntoIterator<Item = JournalRecord>,
{
    let mut keys = BTreeSet::new();
    for record in records {
        keys.extend(record.changed);
    }
    keys
}

/// All keys changed by commits with a sequence strictly greater than
/// `after_seq`. Iterates most-recent-first and stops as soon as it crosses
/// the watermark, so catching up near the tail stays cheap.
pub fn changed_keys_since(
    journal: &dyn ChangeJournal,
    after_seq: u64,
) -> JournalResult<BTreeSet<NodeKey>> {
    let mut keys = BTreeSet::new();
    for record in journal.records(IterationOrder::Reverse)? {
        let record = record?;
        if record.seq <= after_seq {
            break;
        }
        keys.extend(record.changed);
    }
    Ok(keys)
}
