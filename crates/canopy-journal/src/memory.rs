use std::collections::BTreeSet;
use std::sync::RwLock;

use chrono::Utc;

use canopy_types::{ChangeEvent, NodeKey};

use crate::error::JournalResult;
use crate::records::JournalRecord;
use crate::traits::{ChangeJournal, IterationOrder, JournalIter};

/// In-memory journal for tests and embedding.
///
/// Records live in a `Vec` behind a `RwLock`; the vector index is the
/// sequence number minus one, so monotonicity is structural.
pub struct InMemoryJournal {
    records: RwLock<Vec<JournalRecord>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().expect("lock poisoned").is_empty()
    }
}

impl Default for InMemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeJournal for InMemoryJournal {
    fn append(
        &self,
        changed: BTreeSet<NodeKey>,
        payload: Option<Vec<ChangeEvent>>,
    ) -> JournalResult<JournalRecord> {
        let mut records = self.records.write().expect("lock poisoned");
        let record = JournalRecord {
            seq: records.len() as u64 + 1,
            timestamp: Utc::now(),
            changed,
            payload,
        };
        records.push(record.clone());
        Ok(record)
    }

    fn records(&self, order: IterationOrder) -> JournalResult<JournalIter> {
        // Snapshot under the lock; iteration itself is lock-free and
        // unaffected by later appends (restartable by calling again).
        let snapshot = self.records.read().expect("lock poisoned").clone();
        let iter: JournalIter = match order {
            IterationOrder::Forward => Box::new(snapshot.into_iter().map(Ok)),
            IterationOrder::Reverse => Box::new(snapshot.into_iter().rev().map(Ok)),
        };
        Ok(iter)
    }

    fn last_sequence(&self) -> JournalResult<u64> {
        Ok(self.records.read().expect("lock poisoned").len() as u64)
    }
}

impl std::fmt::Debug for InMemoryJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryJournal")
            .field("record_count", &self.len())
            .finish()
    }
}
