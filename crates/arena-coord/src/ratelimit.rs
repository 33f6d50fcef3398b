//! Token-bucket rate limiting.
//!
//! Two interchangeable variants behind the [`RateLimiter`] trait: an
//! in-process bucket map for single-replica deployments and a shared variant
//! over the coordination store for fleets. Both implement the same state
//! transition: refill by elapsed time at `limit / window` tokens per second,
//! cap at `limit`, and consume one token only when at least one is present.
//!
//! [`FailOpenLimiter`] wraps either variant with the platform policy that a
//! coordination-store failure admits the request: availability outranks
//! strictness.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sqlx::{Pool, Sqlite};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use arena_core::db::unix_timestamp;

use crate::db::CoordDatabase;

/// Rate limit decision metadata returned by `allow_with_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limit: i64,
    pub remaining: i64,
    /// Unix second at which a depleted bucket is fully refilled.
    pub reset_at: i64,
}

/// Rate limiter errors.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("coordination store error: {0}")]
    Store(String),
}

impl From<sqlx::Error> for RateLimitError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(e.to_string())
    }
}

/// Token-bucket admission contract shared by both variants.
pub trait RateLimiter: Send + Sync {
    /// Admit or refuse one request for `key`.
    fn allow(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
    ) -> impl Future<Output = Result<bool, RateLimitError>> + Send;

    /// Admit or refuse, also returning bucket metadata.
    fn allow_with_info(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
    ) -> impl Future<Output = Result<(bool, RateLimitInfo), RateLimitError>> + Send;

    /// Forget the bucket for `key`.
    fn reset(&self, key: &str) -> impl Future<Output = Result<(), RateLimitError>> + Send;
}

/// Refill `tokens` for the elapsed interval, capped at `limit`.
fn refill(tokens: f64, last_update: i64, now: i64, limit: i64, window_secs: f64) -> f64 {
    let elapsed = (now - last_update).max(0) as f64;
    let rate = limit as f64 / window_secs;
    (tokens + elapsed * rate).min(limit as f64)
}

fn window_secs(window: Duration) -> f64 {
    window.as_secs_f64().max(0.001)
}

// =============================================================================
// In-process variant
// =============================================================================

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_update: i64,
    /// Last-seen capacity, kept so the sweeper can tell a full bucket.
    limit: i64,
}

/// In-process token-bucket map. Bucket mutation holds only that bucket's own
/// lock; the outer map lock is held just long enough to find or insert the
/// entry.
#[derive(Clone)]
pub struct MemoryRateLimiter {
    buckets: Arc<RwLock<HashMap<String, Arc<Mutex<Bucket>>>>>,
    sweep_interval: Duration,
}

impl MemoryRateLimiter {
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            sweep_interval,
        }
    }

    async fn bucket(&self, key: &str, limit: i64, now: i64) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self.buckets.read().await.get(key) {
            return Arc::clone(bucket);
        }

        let mut buckets = self.buckets.write().await;
        // Double-check after acquiring the write lock.
        if let Some(bucket) = buckets.get(key) {
            return Arc::clone(bucket);
        }

        let bucket = Arc::new(Mutex::new(Bucket {
            tokens: limit as f64,
            last_update: now,
            limit,
        }));
        buckets.insert(key.to_string(), Arc::clone(&bucket));
        bucket
    }

    async fn take(&self, key: &str, limit: i64, window: Duration, now: i64) -> (bool, RateLimitInfo) {
        let secs = window_secs(window);
        let bucket = self.bucket(key, limit, now).await;
        let mut b = bucket.lock().await;

        let reset_at = b.last_update + window.as_secs() as i64;
        let refilled = refill(b.tokens, b.last_update, now, limit, secs);
        let allowed = refilled >= 1.0;

        b.tokens = if allowed { refilled - 1.0 } else { refilled };
        b.last_update = now;
        b.limit = limit;

        let info = RateLimitInfo {
            limit,
            remaining: b.tokens.floor() as i64,
            reset_at,
        };
        (allowed, info)
    }

    /// Delete buckets that are full and untouched for longer than the sweep
    /// interval. Returns the number removed.
    pub async fn sweep(&self) -> usize {
        let now = unix_timestamp();
        let idle_cutoff = self.sweep_interval.as_secs() as i64;
        let mut buckets = self.buckets.write().await;
        let mut stale = Vec::new();

        for (key, bucket) in buckets.iter() {
            let b = bucket.lock().await;
            if b.tokens >= b.limit as f64 && now - b.last_update > idle_cutoff {
                stale.push(key.clone());
            }
        }
        for key in &stale {
            buckets.remove(key);
        }

        if !stale.is_empty() {
            debug!(removed = stale.len(), "swept idle rate-limit buckets");
        }
        stale.len()
    }

    /// Spawn the periodic sweep task; it stops when the shutdown signal
    /// changes.
    pub fn spawn_sweeper(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(limiter.sweep_interval);
            timer.tick().await; // Skip first immediate tick
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        limiter.sweep().await;
                    }
                    _ = shutdown.changed() => return,
                }
            }
        })
    }

    /// Number of live buckets (for diagnostics and tests).
    pub async fn bucket_count(&self) -> usize {
        self.buckets.read().await.len()
    }
}

impl RateLimiter for MemoryRateLimiter {
    async fn allow(&self, key: &str, limit: i64, window: Duration) -> Result<bool, RateLimitError> {
        Ok(self.take(key, limit, window, unix_timestamp()).await.0)
    }

    async fn allow_with_info(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
    ) -> Result<(bool, RateLimitInfo), RateLimitError> {
        Ok(self.take(key, limit, window, unix_timestamp()).await)
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        self.buckets.write().await.remove(key);
        Ok(())
    }
}

// =============================================================================
// Shared variant
// =============================================================================

/// Shared token-bucket limiter over the coordination store.
///
/// The refill-and-consume transition runs inside one transaction per
/// decision; SQLite serializes writers, so two replicas can never both grant
/// the last token. Rows expire `2 * window` after their last touch so idle
/// keys are reclaimable.
#[derive(Clone)]
pub struct SharedRateLimiter {
    pool: Pool<Sqlite>,
}

const KEY_PREFIX: &str = "ratelimit:";

impl SharedRateLimiter {
    pub fn new(db: &CoordDatabase) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    async fn take(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
        now: i64,
    ) -> Result<(bool, RateLimitInfo), RateLimitError> {
        let secs = window_secs(window);
        let store_key = format!("{KEY_PREFIX}{key}");
        let expires_at = now + 2 * window.as_secs() as i64;

        let mut tx = self.pool.begin().await?;

        let row: Option<(f64, i64)> = sqlx::query_as(
            "SELECT tokens, last_update FROM rate_buckets WHERE key = ?1 AND expires_at > ?2",
        )
        .bind(&store_key)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let (tokens, last_update) = row.unwrap_or((limit as f64, now));
        let refilled = refill(tokens, last_update, now, limit, secs);
        let allowed = refilled >= 1.0;
        let new_tokens = if allowed { refilled - 1.0 } else { refilled };

        sqlx::query(
            r#"
            INSERT INTO rate_buckets (key, tokens, last_update, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                tokens = excluded.tokens,
                last_update = excluded.last_update,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&store_key)
        .bind(new_tokens)
        .bind(now)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let info = RateLimitInfo {
            limit,
            remaining: new_tokens.floor() as i64,
            reset_at: last_update + window.as_secs() as i64,
        };
        Ok((allowed, info))
    }

    /// Delete expired bucket rows. Returns the number removed.
    pub async fn sweep_expired(&self) -> Result<u64, RateLimitError> {
        let result = sqlx::query("DELETE FROM rate_buckets WHERE expires_at <= ?1")
            .bind(unix_timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

impl RateLimiter for SharedRateLimiter {
    async fn allow(&self, key: &str, limit: i64, window: Duration) -> Result<bool, RateLimitError> {
        Ok(self.take(key, limit, window, unix_timestamp()).await?.0)
    }

    async fn allow_with_info(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
    ) -> Result<(bool, RateLimitInfo), RateLimitError> {
        self.take(key, limit, window, unix_timestamp()).await
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        sqlx::query("DELETE FROM rate_buckets WHERE key = ?1")
            .bind(format!("{KEY_PREFIX}{key}"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// =============================================================================
// Fail-open wrapper and preset policies
// =============================================================================

/// Wraps a limiter with the fail-open policy: when the store errors, the
/// request is admitted and the error logged at warn level.
#[derive(Clone)]
pub struct FailOpenLimiter<L: RateLimiter> {
    inner: L,
}

impl<L: RateLimiter> FailOpenLimiter<L> {
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub async fn allow(&self, key: &str, policy: &RateLimitPolicy) -> bool {
        match self.inner.allow(key, policy.limit, policy.window).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(key = %key, error = %e, "rate limiter unavailable, admitting request");
                true
            }
        }
    }

    pub async fn allow_with_info(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> (bool, Option<RateLimitInfo>) {
        match self
            .inner
            .allow_with_info(key, policy.limit, policy.window)
            .await
        {
            Ok((allowed, info)) => (allowed, Some(info)),
            Err(e) => {
                warn!(key = %key, error = %e, "rate limiter unavailable, admitting request");
                (true, None)
            }
        }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }
}

/// What a rate-limit key is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScope {
    /// User id when authenticated, source address otherwise.
    UserOrAddress,
    /// Always the source address.
    AddressOnly,
}

/// A named admission policy.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub limit: i64,
    pub window: Duration,
    pub scope: KeyScope,
}

/// Submission creation: 5 requests per minute.
pub const SUBMISSION_CREATE: RateLimitPolicy = RateLimitPolicy {
    limit: 5,
    window: Duration::from_secs(60),
    scope: KeyScope::UserOrAddress,
};

/// Match creation: 10 requests per minute.
pub const MATCH_CREATE: RateLimitPolicy = RateLimitPolicy {
    limit: 10,
    window: Duration::from_secs(60),
    scope: KeyScope::UserOrAddress,
};

/// General API: burst of 100 refilling at 10 tokens per second.
pub const GENERAL_API: RateLimitPolicy = RateLimitPolicy {
    limit: 100,
    window: Duration::from_secs(10),
    scope: KeyScope::UserOrAddress,
};

/// Replay download: 20 requests per minute.
pub const REPLAY_DOWNLOAD: RateLimitPolicy = RateLimitPolicy {
    limit: 20,
    window: Duration::from_secs(60),
    scope: KeyScope::UserOrAddress,
};

/// Authentication attempts: 5 per minute, keyed by source address only.
pub const AUTH: RateLimitPolicy = RateLimitPolicy {
    limit: 5,
    window: Duration::from_secs(60),
    scope: KeyScope::AddressOnly,
};

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Refill math
    // =========================================================================

    #[test]
    fn refill_caps_at_limit() {
        assert_eq!(refill(3.0, 0, 1_000_000, 10, 60.0), 10.0);
    }

    #[test]
    fn refill_rate_is_limit_over_window() {
        // 10 tokens / 60s window -> 1 token every 6 seconds.
        let tokens = refill(0.0, 100, 106, 10, 60.0);
        assert!((tokens - 1.0).abs() < 1e-9);
    }

    #[test]
    fn refill_ignores_clock_regression() {
        assert_eq!(refill(2.0, 200, 100, 10, 60.0), 2.0);
    }

    // =========================================================================
    // In-process variant
    // =========================================================================

    #[tokio::test]
    async fn memory_burst_admits_exactly_limit() {
        let limiter = MemoryRateLimiter::new(Duration::from_secs(600));

        for _ in 0..5 {
            assert!(limiter.allow("u1", 5, Duration::from_secs(60)).await.unwrap());
        }
        assert!(!limiter.allow("u1", 5, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn memory_keys_are_independent() {
        let limiter = MemoryRateLimiter::new(Duration::from_secs(600));

        assert!(limiter.allow("u1", 1, Duration::from_secs(60)).await.unwrap());
        assert!(!limiter.allow("u1", 1, Duration::from_secs(60)).await.unwrap());
        assert!(limiter.allow("u2", 1, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn memory_info_reports_remaining() {
        let limiter = MemoryRateLimiter::new(Duration::from_secs(600));

        let (allowed, info) = limiter
            .allow_with_info("u1", 5, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(allowed);
        assert_eq!(info.limit, 5);
        assert_eq!(info.remaining, 4);
    }

    #[tokio::test]
    async fn memory_reset_restores_full_bucket() {
        let limiter = MemoryRateLimiter::new(Duration::from_secs(600));

        assert!(limiter.allow("u1", 1, Duration::from_secs(60)).await.unwrap());
        assert!(!limiter.allow("u1", 1, Duration::from_secs(60)).await.unwrap());

        limiter.reset("u1").await.unwrap();
        assert!(limiter.allow("u1", 1, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn memory_sweep_keeps_active_buckets() {
        let limiter = MemoryRateLimiter::new(Duration::from_secs(600));

        // Depleted bucket: not full, must survive the sweep.
        limiter.allow("busy", 1, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(limiter.sweep().await, 0);
        assert_eq!(limiter.bucket_count().await, 1);
    }

    // =========================================================================
    // Shared variant
    // =========================================================================

    async fn shared() -> (CoordDatabase, SharedRateLimiter) {
        let db = CoordDatabase::open_in_memory().await.unwrap();
        let limiter = SharedRateLimiter::new(&db);
        (db, limiter)
    }

    #[tokio::test]
    async fn shared_burst_admits_exactly_limit() {
        let (_db, limiter) = shared().await;

        for _ in 0..5 {
            assert!(limiter.allow("u1", 5, Duration::from_secs(60)).await.unwrap());
        }
        assert!(!limiter.allow("u1", 5, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn shared_refills_with_elapsed_time() {
        let (db, limiter) = shared().await;

        assert!(limiter.allow("u1", 1, Duration::from_secs(60)).await.unwrap());
        assert!(!limiter.allow("u1", 1, Duration::from_secs(60)).await.unwrap());

        // Simulate a full window elapsing.
        sqlx::query("UPDATE rate_buckets SET last_update = last_update - 60")
            .execute(db.pool())
            .await
            .unwrap();

        assert!(limiter.allow("u1", 1, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn shared_rows_carry_double_window_expiry() {
        let (db, limiter) = shared().await;

        limiter.allow("u1", 5, Duration::from_secs(60)).await.unwrap();

        let (expires_at, last_update): (i64, i64) = sqlx::query_as(
            "SELECT expires_at, last_update FROM rate_buckets WHERE key = 'ratelimit:u1'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(expires_at, last_update + 120);
    }

    #[tokio::test]
    async fn shared_sweep_reclaims_expired_rows() {
        let (db, limiter) = shared().await;

        limiter.allow("idle", 5, Duration::from_secs(60)).await.unwrap();
        sqlx::query("UPDATE rate_buckets SET expires_at = 1")
            .execute(db.pool())
            .await
            .unwrap();

        assert_eq!(limiter.sweep_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn shared_reset_deletes_bucket() {
        let (_db, limiter) = shared().await;

        assert!(limiter.allow("u1", 1, Duration::from_secs(60)).await.unwrap());
        assert!(!limiter.allow("u1", 1, Duration::from_secs(60)).await.unwrap());

        limiter.reset("u1").await.unwrap();
        assert!(limiter.allow("u1", 1, Duration::from_secs(60)).await.unwrap());
    }

    // =========================================================================
    // Fail-open wrapper
    // =========================================================================

    /// Limiter whose store is always down.
    struct BrokenLimiter;

    impl RateLimiter for BrokenLimiter {
        async fn allow(&self, _: &str, _: i64, _: Duration) -> Result<bool, RateLimitError> {
            Err(RateLimitError::Store("connection refused".into()))
        }

        async fn allow_with_info(
            &self,
            _: &str,
            _: i64,
            _: Duration,
        ) -> Result<(bool, RateLimitInfo), RateLimitError> {
            Err(RateLimitError::Store("connection refused".into()))
        }

        async fn reset(&self, _: &str) -> Result<(), RateLimitError> {
            Err(RateLimitError::Store("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn fail_open_admits_on_store_error() {
        let limiter = FailOpenLimiter::new(BrokenLimiter);
        assert!(limiter.allow("u1", &SUBMISSION_CREATE).await);

        let (allowed, info) = limiter.allow_with_info("u1", &AUTH).await;
        assert!(allowed);
        assert!(info.is_none());
    }

    #[tokio::test]
    async fn fail_open_still_enforces_when_healthy() {
        let limiter = FailOpenLimiter::new(MemoryRateLimiter::new(Duration::from_secs(600)));
        let policy = RateLimitPolicy {
            limit: 2,
            window: Duration::from_secs(60),
            scope: KeyScope::UserOrAddress,
        };

        assert!(limiter.allow("u1", &policy).await);
        assert!(limiter.allow("u1", &policy).await);
        assert!(!limiter.allow("u1", &policy).await);
    }

    #[test]
    fn general_api_policy_refills_ten_per_second() {
        let per_sec = GENERAL_API.limit as f64 / GENERAL_API.window.as_secs_f64();
        assert!((per_sec - 10.0).abs() < 1e-9);
        assert_eq!(AUTH.scope, KeyScope::AddressOnly);
    }
}
