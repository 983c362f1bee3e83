//! Core caching layer of the Canopy content repository.
//!
//! This crate is the heart of Canopy. It provides:
//! - The session-local delta model (`Unchanged | Added | Modified | Removed`)
//! - [`WorkspaceCache`] — shared read-through/write-through cache of
//!   committed nodes for one workspace, with a fine-grained commit protocol
//! - [`SessionCache`] — per-session isolated overlay with copy-on-write
//!   deltas, save/refresh/logout
//! - Lease-based node locking ([`LockTable`])
//! - Change observation ([`ChangeBus`], [`ListenerFilter`])
//! - The ambient-transaction participation contract and a local reference
//!   implementation for tests
//! - The constraint-validator and query-indexer contracts
//!
//! # Consistency Rules
//!
//! 1. Committed nodes are immutable snapshots; the shared map swaps whole
//!    entries, never fields.
//! 2. A session's pending delta is invisible to every other session until
//!    its `save()` merge completes.
//! 3. Merge, persist, and journal append are one atomic unit; the only
//!    sanctioned divergence is a failed journal append after a durable
//!    persist, which is parked for reconciliation.
//! 4. Two sessions committing disjoint key sets never block each other.

pub mod delta;
pub mod error;
pub mod indexer;
pub mod locks;
pub mod observation;
pub mod session;
pub mod txn;
pub mod validator;
pub mod workspace;

pub use delta::{NodeChanges, NodeDelta};
pub use error::{CacheError, CacheResult};
pub use indexer::{IndexingCompletion, IndexingHandle, QueryIndexer};
pub use locks::{Lock, LockTable};
pub use observation::{ChangeBatch, ChangeBus, ChangeListener, ListenerFilter, ListenerId};
pub use session::{RefreshReport, SaveOutcome, SessionCache, SessionRegistry};
pub use txn::{AmbientTransaction, LocalTransaction, TransactionParticipant};
pub use validator::{
    ChangeSet, ChangeSetEntry, ChangeSetKind, ConstraintValidator, ConstraintViolation,
    PassThroughValidator,
};
pub use workspace::{CommitReceipt, KeyChange, WorkspaceCache};
