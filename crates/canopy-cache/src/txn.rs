use std::sync::Mutex;

use tracing::debug;

use crate::error::CacheResult;

/// Deferred commit work registered with an ambient transaction.
///
/// A participant's effects must not be visible anywhere before `on_commit`
/// runs; `on_rollback` therefore has nothing to undo, only prepared state
/// to discard.
pub trait TransactionParticipant: Send {
    fn on_commit(&mut self) -> CacheResult<()>;
    fn on_rollback(&mut self);
}

/// The narrow contract the core has with whatever transaction mechanism a
/// deployment supplies. The core never assumes a concrete implementation;
/// it only registers participants and lets the owner drive the outcome.
pub trait AmbientTransaction: Send + Sync {
    fn participate(&self, participant: Box<dyn TransactionParticipant>);
}

/// Reference transaction for tests and embedded use.
///
/// Collects participants and applies them all on [`commit`](Self::commit)
/// or discards them all on [`rollback`](Self::rollback). If one
/// participant's commit fails, the remaining participants are rolled back
/// and the error is surfaced.
#[derive(Default)]
pub struct LocalTransaction {
    participants: Mutex<Vec<Box<dyn TransactionParticipant>>>,
}

impl LocalTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.lock().expect("txn lock poisoned").len()
    }

    /// Run every participant's commit phase, in registration order.
    pub fn commit(&self) -> CacheResult<()> {
        let mut participants: Vec<_> = self
            .participants
            .lock()
            .expect("txn lock poisoned")
            .drain(..)
            .collect();
        debug!(participants = participants.len(), "local transaction committing");
        let mut iter = participants.iter_mut();
        for participant in iter.by_ref() {
            if let Err(e) = participant.on_commit() {
                for remaining in iter {
                    remaining.on_rollback();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Discard every participant's prepared work.
    pub fn rollback(&self) {
        let mut participants: Vec<_> = self
            .participants
            .lock()
            .expect("txn lock poisoned")
            .drain(..)
            .collect();
        debug!(participants = participants.len(), "local transaction rolling back");
        for participant in &mut participants {
            participant.on_rollback();
        }
    }
}

impl AmbientTransaction for LocalTransaction {
    fn participate(&self, participant: Box<dyn TransactionParticipant>) {
        self.participants
            .lock()
            .expect("txn lock poisoned")
            .push(participant);
    }
}
