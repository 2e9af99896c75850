//! Overlap leases for tasks with `prevent_overlap`.
//!
//! A lease is keyed by event name and carries a TTL, so a crashed holder
//! cannot block the task forever. The SQLite backend shares leases between
//! every process that opens the same database.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::persistence::SchedulerDb;
use taskdeck_core::config::OverlapBackend;
use taskdeck_core::error::{Result, TaskdeckError};

/// Mutual exclusion between runs of the same event.
pub trait OverlapGuard: Send + Sync {
    /// Take `key` for `ttl`. `Ok(false)` means another holder has it.
    fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    fn release(&self, key: &str, owner: &str) -> Result<()>;

    /// Whether leases are visible to other processes.
    fn is_distributed(&self) -> bool;
}

/// A held lease, released on drop.
pub struct Lease {
    key: String,
    owner: String,
    guard: Arc<dyn OverlapGuard>,
}

impl Lease {
    /// Try to take `key`; `None` when it is already held.
    pub fn acquire(guard: &Arc<dyn OverlapGuard>, key: &str, ttl: Duration) -> Result<Option<Self>> {
        let owner = format!("{}:{}", process_identity(), uuid::Uuid::new_v4());
        if guard.try_acquire(key, &owner, ttl)? {
            Ok(Some(Self {
                key: key.to_string(),
                owner,
                guard: Arc::clone(guard),
            }))
        } else {
            Ok(None)
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Err(e) = self.guard.release(&self.key, &self.owner) {
            tracing::warn!("⚠️ Failed to release lease '{}': {e}", self.key);
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .finish()
    }
}

fn process_identity() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".into());
    format!("{host}:{}", std::process::id())
}

// ─── In-Memory ────────────────────────────────────────────────

/// Leases local to this process.
#[derive(Debug, Default)]
pub struct InMemoryLeases {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLeases {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OverlapGuard for InMemoryLeases {
    fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut held = self
            .held
            .lock()
            .map_err(|e| TaskdeckError::Infrastructure(format!("lease table poisoned: {e}")))?;
        let now = Instant::now();
        if let Some((_, expires)) = held.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        held.insert(key.to_string(), (owner.to_string(), now + ttl));
        Ok(true)
    }

    fn release(&self, key: &str, owner: &str) -> Result<()> {
        let mut held = self
            .held
            .lock()
            .map_err(|e| TaskdeckError::Infrastructure(format!("lease table poisoned: {e}")))?;
        if held.get(key).is_some_and(|(o, _)| o == owner) {
            held.remove(key);
        }
        Ok(())
    }

    fn is_distributed(&self) -> bool {
        false
    }
}

// ─── SQLite ───────────────────────────────────────────────────

/// Leases stored in the `task_leases` table.
pub struct SqliteLeases {
    db: Arc<SchedulerDb>,
}

impl SqliteLeases {
    pub fn new(db: Arc<SchedulerDb>) -> Self {
        Self { db }
    }

    /// Owner of `key` while its lease is unexpired.
    pub fn holder(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .db
            .lease_owner(key)?
            .filter(|(_, expires_at)| *expires_at > Utc::now())
            .map(|(owner, _)| owner))
    }
}

impl OverlapGuard for SqliteLeases {
    fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| TaskdeckError::validation(format!("lease TTL out of range: {e}")))?;
        let acquired = self.db.try_acquire_lease(key, owner, now, now + ttl)?;
        if !acquired {
            if let Some((holder, expires_at)) = self.db.lease_owner(key)? {
                tracing::debug!("🔒 Lease '{key}' held by {holder} until {expires_at}");
            }
        }
        Ok(acquired)
    }

    fn release(&self, key: &str, owner: &str) -> Result<()> {
        self.db.release_lease(key, owner).map(|_| ())
    }

    fn is_distributed(&self) -> bool {
        true
    }
}

/// Guard for the configured backend.
pub fn overlap_guard(backend: OverlapBackend, db: &Arc<SchedulerDb>) -> Arc<dyn OverlapGuard> {
    match backend {
        OverlapBackend::Memory => Arc::new(InMemoryLeases::new()),
        OverlapBackend::Database => Arc::new(SqliteLeases::new(Arc::clone(db))),
    }
}
