use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use canopy_types::{NodeKey, SessionId};

use crate::error::{CacheError, CacheResult};

/// A time-bounded exclusive claim on a node (or subtree) held by one
/// session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lock {
    pub key: NodeKey,
    pub owner: SessionId,
    /// Deep locks cover the whole subtree; shallow locks only the node.
    pub deep: bool,
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Repository-wide lock registry.
///
/// All acquire/release operations are compare-and-swap style under one
/// mutex, so two racing acquires for the same key can never both succeed.
/// Leases are wall-clock bounded; an expired lock is treated as absent by
/// every check, but the entry itself is only reaped by [`clean_up`].
///
/// [`clean_up`]: LockTable::clean_up
#[derive(Default)]
pub struct LockTable {
    locks: Mutex<HashMap<NodeKey, Lock>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().expect("lock table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().expect("lock table poisoned").is_empty()
    }

    /// Acquire (or re-acquire) a lock on `key` for `owner`. Fails with
    /// [`CacheError::LockContention`] if another session holds an
    /// unexpired lock on the same key. Re-acquiring by the same owner
    /// renews the lease.
    pub fn try_acquire(
        &self,
        key: NodeKey,
        owner: SessionId,
        deep: bool,
        lease: Duration,
    ) -> CacheResult<Lock> {
        let now = Utc::now();
        let mut locks = self.locks.lock().expect("lock table poisoned");
        if let Some(existing) = locks.get(&key) {
            if existing.owner != owner && !existing.is_expired_at(now) {
                return Err(CacheError::LockContention {
                    key,
                    owner: existing.owner,
                });
            }
        }
        let lock = Lock {
            key: key.clone(),
            owner,
            deep,
            expires_at: now + lease,
        };
        locks.insert(key, lock.clone());
        Ok(lock)
    }

    /// Release a lock, if held by `owner`. Returns `true` if released.
    pub fn release(&self, key: &NodeKey, owner: SessionId) -> bool {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        match locks.get(key) {
            Some(lock) if lock.owner == owner => {
                locks.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Release every lock held by `owner`. Returns the number released.
    pub fn release_all_for(&self, owner: SessionId) -> usize {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        let before = locks.len();
        locks.retain(|_, lock| lock.owner != owner);
        before - locks.len()
    }

    /// Renew the lease on every lock held by `owner`. Called periodically
    /// by a live session; missing one renewal does not invalidate the
    /// locks until the previous lease actually lapses.
    pub fn extend_leases(&self, owner: SessionId, lease: Duration) -> usize {
        let expires_at = Utc::now() + lease;
        let mut locks = self.locks.lock().expect("lock table poisoned");
        let mut extended = 0;
        for lock in locks.values_mut().filter(|l| l.owner == owner) {
            lock.expires_at = expires_at;
            extended += 1;
        }
        extended
    }

    /// Current lock on `key`, expired or not.
    pub fn holder(&self, key: &NodeKey) -> Option<Lock> {
        self.locks
            .lock()
            .expect("lock table poisoned")
            .get(key)
            .cloned()
    }

    /// Check whether `session` may structurally mutate `key`, given the
    /// node's ancestor chain (nearest parent first). A shallow lock on the
    /// node itself or a deep lock on any ancestor, held unexpired by
    /// another session, denies the mutation.
    pub fn check_can_modify(
        &self,
        session: SessionId,
        key: &NodeKey,
        ancestors: &[NodeKey],
    ) -> CacheResult<()> {
        let now = Utc::now();
        let locks = self.locks.lock().expect("lock table poisoned");
        if let Some(lock) = locks.get(key) {
            if lock.owner != session && !lock.is_expired_at(now) {
                return Err(CacheError::LockContention {
                    key: key.clone(),
                    owner: lock.owner,
                });
            }
        }
        for ancestor in ancestors {
            if let Some(lock) = locks.get(ancestor) {
                if lock.deep && lock.owner != session && !lock.is_expired_at(now) {
                    return Err(CacheError::LockContention {
                        key: key.clone(),
                        owner: lock.owner,
                    });
                }
            }
        }
        Ok(())
    }

    /// Reap locks whose owner is no longer active AND whose lease has
    /// expired. A lock is never force-released before its lease expires,
    /// even if its owner looks dead.
    pub fn clean_up(&self, is_active: impl Fn(&SessionId) -> bool) -> Vec<NodeKey> {
        let now = Utc::now();
        let mut locks = self.locks.lock().expect("lock table poisoned");
        let mut released = Vec::new();
        locks.retain(|key, lock| {
            let reap = !is_active(&lock.owner) && lock.is_expired_at(now);
            if reap {
                warn!(key = %key, owner = %lock.owner, "releasing expired lock of inactive session");
                released.push(key.clone());
            }
            !reap
        });
        released
    }
}
