//! Distributed lock manager.
//!
//! Exclusive leases on named keys with a mandatory TTL so that a holder
//! dying mid-critical-section never wedges the system. Acquisition is an
//! atomic "set if absent or expired" upsert; release and extend are
//! holder-verified single statements, so a caller whose lease already
//! expired and was re-acquired by someone else gets [`LockError::NotHeld`]
//! instead of silently releasing the new holder's lock.

use std::time::Duration;

use sqlx::{Pool, Sqlite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::db::CoordDatabase;

/// Lock operation errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The key is currently leased by another holder.
    #[error("lock not acquired")]
    NotAcquired,

    /// The caller no longer holds the lease (expired or taken over).
    #[error("lock not held")]
    NotHeld,

    /// The caller's cancellation token fired while waiting to retry.
    #[error("lock acquisition cancelled")]
    Cancelled,

    #[error("coordination store error: {0}")]
    Store(String),
}

impl From<sqlx::Error> for LockError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(e.to_string())
    }
}

/// Manager handing out exclusive leases backed by the coordination store.
#[derive(Clone)]
pub struct LockManager {
    pool: Pool<Sqlite>,
}

/// A held lease. Dropping it without calling [`Lock::release`] is safe: the
/// TTL reclaims the key.
pub struct Lock {
    pool: Pool<Sqlite>,
    key: String,
    holder: String,
}

impl LockManager {
    pub fn new(db: &CoordDatabase) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Try to acquire the lease on `key` once.
    ///
    /// Returns [`LockError::NotAcquired`] when another holder's lease is
    /// still live.
    pub async fn acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lock, LockError> {
        let now = unix_millis();
        let expires_at = now + ttl_millis(ttl);

        // Insert, or take over only when the stored lease has expired.
        let result = sqlx::query(
            r#"
            INSERT INTO coord_locks (key, holder, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE coord_locks.expires_at <= ?4
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LockError::NotAcquired);
        }

        Ok(Lock {
            pool: self.pool.clone(),
            key: key.to_string(),
            holder: holder.to_string(),
        })
    }

    /// Acquire with a bounded retry budget, honoring the caller's
    /// cancellation token between attempts.
    pub async fn try_acquire_with_retry(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
        max_retries: u32,
        retry_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<Lock, LockError> {
        for attempt in 0..max_retries {
            match self.acquire(key, holder, ttl).await {
                Ok(lock) => return Ok(lock),
                Err(LockError::NotAcquired) => {}
                Err(e) => return Err(e),
            }

            if attempt + 1 < max_retries {
                tokio::select! {
                    () = cancel.cancelled() => return Err(LockError::Cancelled),
                    () = tokio::time::sleep(retry_interval) => {}
                }
            }
        }

        debug!(key = %key, "lock retry budget exhausted");
        Err(LockError::NotAcquired)
    }
}

impl Lock {
    /// Release the lease. Holder-verified: deletes the row only when it
    /// still carries this holder's id, in one atomic statement.
    pub async fn release(&self) -> Result<(), LockError> {
        let result = sqlx::query("DELETE FROM coord_locks WHERE key = ?1 AND holder = ?2")
            .bind(&self.key)
            .bind(&self.holder)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LockError::NotHeld);
        }

        Ok(())
    }

    /// Extend the lease TTL. Holder-verified like [`Lock::release`]; an
    /// expired lease cannot be resurrected.
    pub async fn extend(&self, new_ttl: Duration) -> Result<(), LockError> {
        let now = unix_millis();
        let expires_at = now + ttl_millis(new_ttl);

        let result = sqlx::query(
            r#"
            UPDATE coord_locks
            SET expires_at = ?1
            WHERE key = ?2 AND holder = ?3 AND expires_at > ?4
            "#,
        )
        .bind(expires_at)
        .bind(&self.key)
        .bind(&self.holder)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LockError::NotHeld);
        }

        Ok(())
    }

    /// Whether this lease is currently live and owned by this holder.
    pub async fn is_held(&self) -> Result<bool, LockError> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT holder, expires_at FROM coord_locks WHERE key = ?1")
                .bind(&self.key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(match row {
            Some((holder, expires_at)) => holder == self.holder && expires_at > unix_millis(),
            None => false,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

#[allow(clippy::cast_possible_wrap)]
fn unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (CoordDatabase, LockManager) {
        let db = CoordDatabase::open_in_memory().await.unwrap();
        let manager = LockManager::new(&db);
        (db, manager)
    }

    /// Force a lease's expiry into the past without waiting out the TTL.
    async fn expire_lock(db: &CoordDatabase, key: &str) {
        sqlx::query("UPDATE coord_locks SET expires_at = expires_at - 600000 WHERE key = ?")
            .bind(key)
            .execute(db.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn acquire_is_mutually_exclusive() {
        let (_db, manager) = setup().await;

        let lock = manager
            .acquire("env:pong", "holder-1", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(lock.is_held().await.unwrap());

        let second = manager
            .acquire("env:pong", "holder-2", Duration::from_secs(5))
            .await;
        assert!(matches!(second, Err(LockError::NotAcquired)));
    }

    #[tokio::test]
    async fn release_frees_the_key() {
        let (_db, manager) = setup().await;

        let lock = manager
            .acquire("k", "h1", Duration::from_secs(5))
            .await
            .unwrap();
        lock.release().await.unwrap();

        assert!(manager.acquire("k", "h2", Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let (db, manager) = setup().await;

        let stale = manager
            .acquire("k", "h1", Duration::from_secs(5))
            .await
            .unwrap();
        expire_lock(&db, "k").await;

        let fresh = manager
            .acquire("k", "h2", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(fresh.is_held().await.unwrap());
        assert!(!stale.is_held().await.unwrap());
    }

    #[tokio::test]
    async fn release_after_takeover_is_not_held() {
        let (db, manager) = setup().await;

        let stale = manager
            .acquire("k", "h1", Duration::from_secs(5))
            .await
            .unwrap();
        expire_lock(&db, "k").await;
        let _fresh = manager
            .acquire("k", "h2", Duration::from_secs(5))
            .await
            .unwrap();

        // h1 must not be able to delete h2's lease.
        let result = stale.release().await;
        assert!(matches!(result, Err(LockError::NotHeld)));

        let row: (String,) = sqlx::query_as("SELECT holder FROM coord_locks WHERE key = 'k'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(row.0, "h2");
    }

    #[tokio::test]
    async fn extend_requires_live_ownership() {
        let (db, manager) = setup().await;

        let lock = manager
            .acquire("k", "h1", Duration::from_secs(5))
            .await
            .unwrap();
        lock.extend(Duration::from_secs(10)).await.unwrap();

        expire_lock(&db, "k").await;
        let result = lock.extend(Duration::from_secs(10)).await;
        assert!(matches!(result, Err(LockError::NotHeld)));
    }

    #[tokio::test]
    async fn retry_gives_up_after_budget() {
        let (_db, manager) = setup().await;
        let cancel = CancellationToken::new();

        let _held = manager
            .acquire("k", "h1", Duration::from_secs(30))
            .await
            .unwrap();

        let result = manager
            .try_acquire_with_retry(
                "k",
                "h2",
                Duration::from_secs(5),
                3,
                Duration::from_millis(10),
                &cancel,
            )
            .await;
        assert!(matches!(result, Err(LockError::NotAcquired)));
    }

    #[tokio::test]
    async fn retry_observes_cancellation() {
        let (_db, manager) = setup().await;
        let cancel = CancellationToken::new();

        let _held = manager
            .acquire("k", "h1", Duration::from_secs(30))
            .await
            .unwrap();

        cancel.cancel();
        let result = manager
            .try_acquire_with_retry(
                "k",
                "h2",
                Duration::from_secs(5),
                3,
                Duration::from_secs(60),
                &cancel,
            )
            .await;
        assert!(matches!(result, Err(LockError::Cancelled)));
    }
}
