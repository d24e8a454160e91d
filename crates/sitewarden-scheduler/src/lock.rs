//! Cross-process advisory lock around job selection.
//!
//! The lock is a row in `scheduler_locks`. Taking it is a single atomic
//! upsert that only succeeds when the row is absent, expired, or already
//! ours, so two runners sharing the database file can never both hold it.
//! Rows carry an expiry so a runner that dies while holding the lock only
//! blocks others for `ttl`.

use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use rusqlite::params;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    db::{self, ts, Db},
    error::Result,
};

/// Name of the lock serialising "pick next job" decisions.
pub const JOB_SELECTION_LOCK: &str = "tasks.selection";

/// Delay between acquisition attempts while the lock is held elsewhere.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

pub struct LockManager {
    db: Db,
    name: String,
    /// Random per-manager token; release only ever deletes our own row.
    owner: String,
    ttl: Duration,
    max_jitter: Duration,
}

impl LockManager {
    pub fn new(db: Db, name: impl Into<String>, ttl: Duration, max_jitter: Duration) -> Self {
        Self {
            db,
            name: name.into(),
            owner: Uuid::new_v4().to_string(),
            ttl,
            max_jitter,
        }
    }

    /// Lock for job selection with the given TTL and jitter.
    pub fn job_selection(db: Db, ttl: Duration, max_jitter: Duration) -> Self {
        Self::new(db, JOB_SELECTION_LOCK, ttl, max_jitter)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Sleep a random delay up to the configured jitter.
    ///
    /// Called once before a runner's first acquisition attempt so that
    /// runners started by the same cron tick do not all observe the lock as
    /// free at the same instant.
    pub async fn stagger(&self) {
        let jitter = self.jitter();
        if !jitter.is_zero() {
            debug!(
                lock = %self.name,
                jitter_ms = jitter.as_millis() as u64,
                "staggering first attempt"
            );
            tokio::time::sleep(jitter).await;
        }
    }

    /// Wait up to `timeout` for the lock. Returns `false` on timeout.
    pub async fn acquire(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire()? {
                debug!(lock = %self.name, owner = %self.owner, "lock acquired");
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(lock = %self.name, ?timeout, "timed out waiting for lock");
                return Ok(false);
            }
            tokio::time::sleep(RETRY_INTERVAL.min(deadline - now)).await;
        }
    }

    /// One atomic attempt; never waits.
    pub fn try_acquire(&self) -> Result<bool> {
        let now = Utc::now();
        let expires = now + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(30));
        let conn = db::lock(&self.db)?;
        let changed = conn.execute(
            "INSERT INTO scheduler_locks (name, owner, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                 owner = excluded.owner,
                 acquired_at = excluded.acquired_at,
                 expires_at = excluded.expires_at
             WHERE scheduler_locks.expires_at <= excluded.acquired_at
                OR scheduler_locks.owner = excluded.owner",
            params![self.name, self.owner, ts(now), ts(expires)],
        )?;
        Ok(changed == 1)
    }

    /// Release the lock if we hold it. Idempotent; a no-op when the
    /// acquisition failed or the lock already expired and was taken over.
    pub fn release(&self) -> Result<()> {
        let conn = db::lock(&self.db)?;
        let n = conn.execute(
            "DELETE FROM scheduler_locks WHERE name = ?1 AND owner = ?2",
            params![self.name, self.owner],
        )?;
        if n > 0 {
            debug!(lock = %self.name, "lock released");
        }
        Ok(())
    }

    /// Acquire and wrap the lock in a guard that releases it on drop.
    pub async fn lock(&self, timeout: Duration) -> Result<Option<LockGuard<'_>>> {
        if self.acquire(timeout).await? {
            Ok(Some(LockGuard { manager: self }))
        } else {
            Ok(None)
        }
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// Holds the lock until dropped.
pub struct LockGuard<'a> {
    manager: &'a LockManager,
}

impl LockGuard<'_> {
    /// Release now and surface any error instead of logging it on drop.
    pub fn unlock(self) -> Result<()> {
        let result = self.manager.release();
        std::mem::forget(self);
        result
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.manager.release() {
            warn!(lock = %self.manager.name, "failed to release lock: {e}");
        }
    }
}
