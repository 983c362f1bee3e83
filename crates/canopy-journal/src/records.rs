use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use canopy_types::{ChangeEvent, NodeKey};

/// Durable record of one committed transaction.
///
/// Sequence numbers are assigned by the journal, start at 1, strictly
/// increase, and correspond one-to-one with successful commits. Records
/// are immutable once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    /// Every key touched by the commit.
    pub changed: BTreeSet<NodeKey>,
    /// Full per-node change events, when the journal is configured to
    /// retain them; `None` means keys-only.
    pub payload: Option<Vec<ChangeEvent>>,
}

impl JournalRecord {
    pub fn changed_key_count(&self) -> usize {
        self.changed.len()
    }

    pub fn touches(&self, key: &NodeKey) -> bool {
        self.changed.contains(key)
    }
}
