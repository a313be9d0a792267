//! Named, TTL-bounded leases stored next to the queue.
//!
//! A lease row is taken over only once it has expired, so two unexpired
//! holders of the same key can never coexist. Ownership is proven by a
//! random token; refresh and release are no-ops for a caller that lost it.

use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, warn};

use crate::storage::Pool;

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lease store error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("lease store unavailable: {0}")]
    Pool(#[from] r2d2::Error),
}

/// Lease key for an environment's queue partition.
pub fn env_processing_key(prefix: &str, environment_id: i64) -> String {
    format!("{prefix}_env_processing_{environment_id}")
}

/// Lease key guarding a single test run.
pub fn run_key(prefix: &str, run_id: i64) -> String {
    format!("{prefix}_run_{run_id}")
}

/// Lease key guarding a cron job.
pub fn job_key(prefix: &str, job_id: i64) -> String {
    format!("{prefix}_job_{job_id}")
}

/// A held lease. Dropping it does not release; see [`LeaseGuard`].
#[derive(Debug, Clone)]
pub struct Lease {
    pub key: String,
    token: String,
    ttl: Duration,
}

impl Lease {
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

#[derive(Clone)]
pub struct LeaseManager {
    pool: Pool,
}

impl LeaseManager {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Non-blocking acquire. `None` means someone else holds the key.
    pub fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, LeaseError> {
        let token = uuid::Uuid::new_v4().to_string();
        let now = now_ms();
        let expires = now.saturating_add(ttl_ms(ttl));

        let conn = self.pool.get()?;
        let changed = conn.execute(
            "INSERT INTO leases (lease_key, token, expires_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(lease_key) DO UPDATE
                 SET token = excluded.token, expires_at_ms = excluded.expires_at_ms
                 WHERE leases.expires_at_ms <= ?4",
            params![key, token, expires, now],
        )?;

        if changed == 0 {
            debug!(key, "lease held elsewhere");
            return Ok(None);
        }
        Ok(Some(Lease {
            key: key.to_string(),
            token,
            ttl,
        }))
    }

    /// Acquire, retrying until `wait` has elapsed. A zero `wait` behaves
    /// like [`acquire`](Self::acquire).
    pub async fn acquire_within(
        &self,
        key: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Option<Lease>, LeaseError> {
        let deadline = tokio::time::Instant::now() + wait;
        let step = Duration::from_millis(100);
        loop {
            if let Some(lease) = self.acquire(key, ttl)? {
                return Ok(Some(lease));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(step.min(deadline - now)).await;
        }
    }

    /// Extend the lease by its TTL from now. `false` when it was lost.
    pub fn refresh(&self, lease: &Lease) -> Result<bool, LeaseError> {
        let now = now_ms();
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE leases SET expires_at_ms = ?1
             WHERE lease_key = ?2 AND token = ?3 AND expires_at_ms > ?4",
            params![now.saturating_add(ttl_ms(lease.ttl)), lease.key, lease.token, now],
        )?;
        Ok(changed > 0)
    }

    /// Release if still ours. Releasing twice is harmless.
    pub fn release(&self, lease: &Lease) -> Result<(), LeaseError> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM leases WHERE lease_key = ?1 AND token = ?2",
            params![lease.key, lease.token],
        )?;
        Ok(())
    }

    /// Drop a key regardless of owner. Returns whether a row existed.
    pub fn force_release(&self, key: &str) -> Result<bool, LeaseError> {
        let conn = self.pool.get()?;
        let changed = conn.execute("DELETE FROM leases WHERE lease_key = ?1", params![key])?;
        Ok(changed > 0)
    }

    /// Whether an unexpired lease exists for the key.
    pub fn is_held(&self, key: &str) -> Result<bool, LeaseError> {
        let conn = self.pool.get()?;
        let expires: Option<i64> = conn
            .query_row(
                "SELECT expires_at_ms FROM leases WHERE lease_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(expires.is_some_and(|at| at > now_ms()))
    }

    /// Keys with an unexpired lease that start with `prefix`.
    pub fn held_keys(&self, prefix: &str) -> Result<Vec<String>, LeaseError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT lease_key FROM leases
             WHERE substr(lease_key, 1, length(?1)) = ?1 AND expires_at_ms > ?2
             ORDER BY lease_key",
        )?;
        let keys = stmt
            .query_map(params![prefix, now_ms()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }

    /// Wrap a lease so it is released when the guard goes out of scope.
    pub fn guard(&self, lease: Lease) -> LeaseGuard {
        LeaseGuard {
            manager: self.clone(),
            lease: Some(lease),
        }
    }
}

/// Releases its lease on drop, whatever path the holder takes out.
pub struct LeaseGuard {
    manager: LeaseManager,
    lease: Option<Lease>,
}

impl LeaseGuard {
    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    pub fn refresh(&self) -> Result<bool, LeaseError> {
        match &self.lease {
            Some(lease) => self.manager.refresh(lease),
            None => Ok(false),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            if let Err(e) = self.manager.release(&lease) {
                warn!(key = %lease.key, error = %e, "failed to release lease");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_pool;

    fn manager() -> (tempfile::TempDir, LeaseManager) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("lease.db"), 4).unwrap();
        (dir, LeaseManager::new(pool))
    }

    #[test]
    fn test_key_conventions() {
        assert_eq!(env_processing_key("test_runner", 3), "test_runner_env_processing_3");
        assert_eq!(run_key("test_runner", 42), "test_runner_run_42");
        assert_eq!(job_key("test_runner", 7), "test_runner_job_7");
    }

    #[test]
    fn test_second_acquire_is_refused() {
        let (_dir, leases) = manager();
        let held = leases.acquire("k", Duration::from_secs(60)).unwrap();
        assert!(held.is_some());
        assert!(leases.acquire("k", Duration::from_secs(60)).unwrap().is_none());
        assert!(leases.is_held("k").unwrap());
    }

    #[test]
    fn test_expired_lease_can_be_taken_over() {
        let (_dir, leases) = manager();
        let stale = leases.acquire("k", Duration::ZERO).unwrap().unwrap();
        let fresh = leases.acquire("k", Duration::from_secs(60)).unwrap().unwrap();

        // The old holder can neither refresh nor release the new lease.
        assert!(!leases.refresh(&stale).unwrap());
        leases.release(&stale).unwrap();
        assert!(leases.is_held("k").unwrap());

        leases.release(&fresh).unwrap();
        assert!(!leases.is_held("k").unwrap());
    }

    #[test]
    fn test_release_is_idempotent() {
        let (_dir, leases) = manager();
        let lease = leases.acquire("k", Duration::from_secs(60)).unwrap().unwrap();
        leases.release(&lease).unwrap();
        leases.release(&lease).unwrap();
        assert!(leases.acquire("k", Duration::from_secs(60)).unwrap().is_some());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let (_dir, leases) = manager();
        {
            let lease = leases.acquire("k", Duration::from_secs(60)).unwrap().unwrap();
            let guard = leases.guard(lease);
            assert!(guard.refresh().unwrap());
        }
        assert!(!leases.is_held("k").unwrap());
    }

    #[test]
    fn test_force_release_and_held_keys() {
        let (_dir, leases) = manager();
        leases.acquire("p_env_processing_1", Duration::from_secs(60)).unwrap().unwrap();
        leases.acquire("p_env_processing_2", Duration::from_secs(60)).unwrap().unwrap();
        leases.acquire("p_run_9", Duration::from_secs(60)).unwrap().unwrap();

        let held = leases.held_keys("p_env_processing_").unwrap();
        assert_eq!(held, vec!["p_env_processing_1", "p_env_processing_2"]);

        assert!(leases.force_release("p_env_processing_1").unwrap());
        assert!(!leases.force_release("p_env_processing_1").unwrap());
        assert!(!leases.is_held("p_env_processing_1").unwrap());
    }

    #[tokio::test]
    async fn test_acquire_within_waits_for_expiry() {
        let (_dir, leases) = manager();
        leases.acquire("k", Duration::from_millis(150)).unwrap().unwrap();

        let none = leases
            .acquire_within("k", Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap();
        assert!(none.is_none());

        let some = leases
            .acquire_within("k", Duration::from_secs(60), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(some.is_some());
    }
}
