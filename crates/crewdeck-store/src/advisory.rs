use std::cell::RefCell;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::db::Storage;
use crate::time::fmt_ts;
use crate::{Error, Result};

/// Lock namespaces. Values are part of the stored key, never reorder them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum LockNamespace {
    Agent = 1,
}

impl LockNamespace {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }
}

/// Hash an arbitrary string to a stable lock key.
pub fn lock_key_from_string(input: &str) -> i64 {
    let digest = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

// Locks already held by this thread. Blocking re-acquisition is a
// programming error; non-blocking re-acquisition reports "busy" without
// touching the store. Guards are !Send so entries are always removed on
// the thread that added them.
thread_local! {
    static HELD_LOCKS: RefCell<HashSet<(i64, i64)>> = RefCell::new(HashSet::new());
}

fn held_contains(ns: i64, key: i64) -> bool {
    HELD_LOCKS.with(|held| held.borrow().contains(&(ns, key)))
}

fn held_insert(ns: i64, key: i64) {
    HELD_LOCKS.with(|held| held.borrow_mut().insert((ns, key)));
}

fn held_remove(ns: i64, key: i64) {
    HELD_LOCKS.with(|held| held.borrow_mut().remove(&(ns, key)));
}

/// Cooperative cross-process lock manager keyed by `(namespace, key)`.
///
/// Each acquisition uses its own dedicated connection so lock traffic never
/// interacts with the transaction scope of the protected work. Holders that
/// die without releasing are reclaimed after `reclaim_after`.
#[derive(Debug, Clone)]
pub struct AdvisoryLockManager {
    storage: Storage,
    reclaim_after: Duration,
    poll_interval: Duration,
}

const DEFAULT_RECLAIM_AFTER: Duration = Duration::from_secs(60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

impl AdvisoryLockManager {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            reclaim_after: DEFAULT_RECLAIM_AFTER,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_reclaim_after(mut self, reclaim_after: Duration) -> Self {
        self.reclaim_after = reclaim_after;
        self
    }

    /// Block for up to `timeout` acquiring `(ns, key)`.
    ///
    /// Fails immediately with `ReentrantLock` when this thread already holds
    /// the key, and with `LockTimeout` when the deadline passes.
    pub fn lock(&self, ns: LockNamespace, key: i64, timeout: Duration) -> Result<LockGuard> {
        let ns = ns.as_i64();
        if held_contains(ns, key) {
            return Err(Error::ReentrantLock { namespace: ns, key });
        }

        let owner = new_owner_token();
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire_row(ns, key, &owner)? {
                held_insert(ns, key);
                return Ok(LockGuard {
                    storage: self.storage.clone(),
                    ns,
                    key,
                    owner,
                    _not_send: PhantomData,
                });
            }
            if Instant::now() >= deadline {
                return Err(Error::LockTimeout { namespace: ns, key });
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Non-blocking acquisition. Returns `None` when the lock is held
    /// anywhere (including by this thread), and on connection errors, which
    /// are logged: periodic callers skip the cycle and retry next pass.
    pub fn try_lock(&self, ns: LockNamespace, key: i64) -> Option<LockGuard> {
        let ns = ns.as_i64();
        if held_contains(ns, key) {
            return None;
        }

        let owner = new_owner_token();
        match self.try_acquire_row(ns, key, &owner) {
            Ok(true) => {
                held_insert(ns, key);
                Some(LockGuard {
                    storage: self.storage.clone(),
                    ns,
                    key,
                    owner,
                    _not_send: PhantomData,
                })
            }
            Ok(false) => None,
            Err(err) => {
                tracing::warn!(namespace = ns, key, %err, "try_lock failed, treating as busy");
                None
            }
        }
    }

    fn try_acquire_row(&self, ns: i64, key: i64, owner: &str) -> Result<bool> {
        let db = self.storage.connect()?;
        let conn = db.conn();
        let now = chrono::Utc::now();

        let inserted = conn.execute(
            "INSERT INTO advisory_locks (namespace, key, owner, acquired_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (namespace, key) DO NOTHING",
            rusqlite::params![ns, key, owner, fmt_ts(now)],
        )?;
        if inserted == 1 {
            return Ok(true);
        }

        // Holder row exists. Reclaim it only if its acquired_at is past the
        // reclaim window (a holder that died without dropping its guard).
        let stale_before = fmt_ts(now - chrono::Duration::from_std(self.reclaim_after).unwrap_or_default());
        let reclaimed = conn.execute(
            "UPDATE advisory_locks SET owner = ?3, acquired_at = ?4 \
             WHERE namespace = ?1 AND key = ?2 AND acquired_at < ?5",
            rusqlite::params![ns, key, owner, fmt_ts(now), stale_before],
        )?;
        Ok(reclaimed == 1)
    }
}

fn new_owner_token() -> String {
    format!("{}:{}", std::process::id(), uuid::Uuid::new_v4())
}

/// Scoped release: dropping the guard removes the lock row and the
/// thread-local held entry on every exit path, panics included.
#[derive(Debug)]
pub struct LockGuard {
    storage: Storage,
    ns: i64,
    key: i64,
    owner: String,
    _not_send: PhantomData<*const ()>,
}

impl LockGuard {
    pub fn namespace(&self) -> i64 {
        self.ns
    }

    pub fn key(&self) -> i64 {
        self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        held_remove(self.ns, self.key);
        match self.storage.connect() {
            Ok(db) => {
                let released = db.conn().execute(
                    "DELETE FROM advisory_locks \
                     WHERE namespace = ?1 AND key = ?2 AND owner = ?3",
                    rusqlite::params![self.ns, self.key, self.owner],
                );
                if let Err(err) = released {
                    tracing::warn!(namespace = self.ns, key = self.key, %err, "lock release failed");
                }
            }
            Err(err) => {
                tracing::warn!(namespace = self.ns, key = self.key, %err, "lock release failed");
            }
        }
    }
}
