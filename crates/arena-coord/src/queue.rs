//! Durable priority queue with in-flight tracking and dead-letter semantics.
//!
//! Each named queue is three tables in the coordination store: the
//! priority-ordered main queue, the in-flight map of dequeued-but-incomplete
//! items, and the append-only dead-letter list. Every item is in exactly one
//! of the three at any moment; the transitions run in transactions so a
//! crash between steps cannot leak an item.
//!
//! Higher priority numbers are dequeued first; ties break by insertion
//! order. Failed items demote themselves: each retry lowers priority by a
//! fixed decrement until the retry budget moves the item to the dead-letter
//! list.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use sqlx::{Pool, Sqlite};
use tracing::debug;

use arena_core::db::unix_timestamp;

use crate::db::CoordDatabase;

/// Priority penalty applied on each retry.
const RETRY_PRIORITY_DECREMENT: i64 = 10;

/// Queue operation errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is empty")]
    Empty,

    #[error("queue is full")]
    Full,

    #[error("coordination store error: {0}")]
    Store(String),

    #[error("payload serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(e.to_string())
    }
}

/// A generic durable task.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: String,
    pub payload: HashMap<String, Value>,
    pub priority: i64,
    pub retries: i64,
    pub max_retries: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl QueueItem {
    pub fn new(id: impl Into<String>, payload: HashMap<String, Value>, priority: i64) -> Self {
        Self {
            id: id.into(),
            payload,
            priority,
            retries: 0,
            max_retries: 3,
            created_at: 0,
            updated_at: 0,
        }
    }
}

/// A dead-lettered item with the reason it was abandoned.
#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub item_id: String,
    pub payload: HashMap<String, Value>,
    pub reason: String,
    pub final_retries: i64,
    pub moved_at: i64,
}

/// Aggregate queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub size: i64,
    pub processing: i64,
    pub dlq: i64,
}

/// Handle on one named durable queue.
#[derive(Clone)]
pub struct DurableQueue {
    pool: Pool<Sqlite>,
    name: String,
    /// Hard size cap on the main queue; 0 means unbounded.
    max_size: i64,
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    item_id: String,
    payload: String,
    priority: i64,
    retries: i64,
    max_retries: i64,
    created_at: i64,
    updated_at: i64,
}

impl ItemRow {
    fn into_item(self) -> Result<QueueItem, QueueError> {
        let payload: HashMap<String, Value> = serde_json::from_str(&self.payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        Ok(QueueItem {
            id: self.item_id,
            payload,
            priority: self.priority,
            retries: self.retries,
            max_retries: self.max_retries,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl DurableQueue {
    pub fn new(db: &CoordDatabase, name: impl Into<String>, max_size: i64) -> Self {
        Self {
            pool: db.pool().clone(),
            name: name.into(),
            max_size,
        }
    }

    /// Append an item to the main queue. Returns [`QueueError::Full`] when a
    /// size cap is configured and reached.
    pub async fn enqueue(&self, mut item: QueueItem) -> Result<(), QueueError> {
        let now = unix_timestamp();
        if item.created_at == 0 {
            item.created_at = now;
        }
        item.updated_at = now;

        let payload = serde_json::to_string(&item.payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        let mut tx = self.pool.begin().await?;

        if self.max_size > 0 {
            let (size,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM queue_items WHERE queue = ?1")
                    .bind(&self.name)
                    .fetch_one(&mut *tx)
                    .await?;
            if size >= self.max_size {
                return Err(QueueError::Full);
            }
        }

        sqlx::query(
            r#"
            INSERT INTO queue_items
                (queue, item_id, payload, priority, retries, max_retries, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&self.name)
        .bind(&item.id)
        .bind(&payload)
        .bind(item.priority)
        .bind(item.retries)
        .bind(item.max_retries)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Pop the highest-priority item and record it in-flight, atomically.
    pub async fn dequeue(&self) -> Result<QueueItem, QueueError> {
        let now = unix_timestamp();
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64, ItemRow)> = sqlx::query_as::<
            _,
            (i64, String, String, i64, i64, i64, i64, i64),
        >(
            r#"
            SELECT seq, item_id, payload, priority, retries, max_retries, created_at, updated_at
            FROM queue_items
            WHERE queue = ?1
            ORDER BY priority DESC, seq ASC
            LIMIT 1
            "#,
        )
        .bind(&self.name)
        .fetch_optional(&mut *tx)
        .await?
        .map(
            |(seq, item_id, payload, priority, retries, max_retries, created_at, updated_at)| {
                (
                    seq,
                    ItemRow {
                        item_id,
                        payload,
                        priority,
                        retries,
                        max_retries,
                        created_at,
                        updated_at,
                    },
                )
            },
        );

        let Some((seq, row)) = row else {
            return Err(QueueError::Empty);
        };

        sqlx::query("DELETE FROM queue_items WHERE seq = ?1")
            .bind(seq)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO queue_processing
                (queue, item_id, payload, priority, retries, max_retries,
                 created_at, updated_at, acquired_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&self.name)
        .bind(&row.item_id)
        .bind(&row.payload)
        .bind(row.priority)
        .bind(row.retries)
        .bind(row.max_retries)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        row.into_item()
    }

    /// Mark an in-flight item done and forget it.
    pub async fn complete(&self, item_id: &str) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM queue_processing WHERE queue = ?1 AND item_id = ?2")
            .bind(&self.name)
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Retry a failed in-flight item.
    ///
    /// Increments the retry count; once it reaches `max_retries` the item
    /// moves to the dead-letter list, otherwise it re-enters the main queue
    /// with its priority demoted.
    pub async fn retry(&self, mut item: QueueItem) -> Result<(), QueueError> {
        let now = unix_timestamp();
        item.retries += 1;
        item.updated_at = now;

        if item.retries >= item.max_retries {
            return self.move_to_dlq(item, "max retries exceeded").await;
        }

        item.priority -= RETRY_PRIORITY_DECREMENT;

        let payload = serde_json::to_string(&item.payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        // One transaction: the item must never exist in both tables, nor
        // vanish from both. The size cap is not checked here; a full queue
        // must not be able to drop an in-flight item.
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM queue_processing WHERE queue = ?1 AND item_id = ?2")
            .bind(&self.name)
            .bind(&item.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO queue_items
                (queue, item_id, payload, priority, retries, max_retries, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&self.name)
        .bind(&item.id)
        .bind(&payload)
        .bind(item.priority)
        .bind(item.retries)
        .bind(item.max_retries)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Move an in-flight item to the dead-letter list with a reason.
    pub async fn move_to_dlq(&self, item: QueueItem, reason: &str) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&item.payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO queue_dlq (queue, item_id, payload, reason, final_retries, moved_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&self.name)
        .bind(&item.id)
        .bind(&payload)
        .bind(reason)
        .bind(item.retries)
        .bind(unix_timestamp())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM queue_processing WHERE queue = ?1 AND item_id = ?2")
            .bind(&self.name)
            .bind(&item.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(queue = %self.name, item_id = %item.id, reason = %reason, "item dead-lettered");
        Ok(())
    }

    /// Retry every in-flight item acquired longer than `max_age` ago.
    /// Returns how many were recovered.
    pub async fn recover_stale(&self, max_age: Duration) -> Result<usize, QueueError> {
        let cutoff = unix_timestamp() - max_age.as_secs() as i64;

        let rows: Vec<ItemRow> = sqlx::query_as(
            r#"
            SELECT item_id, payload, priority, retries, max_retries, created_at, updated_at
            FROM queue_processing
            WHERE queue = ?1 AND acquired_at < ?2
            "#,
        )
        .bind(&self.name)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut recovered = 0;
        for row in rows {
            let item = row.into_item()?;
            self.retry(item).await?;
            recovered += 1;
        }

        if recovered > 0 {
            debug!(queue = %self.name, recovered, "recovered stale in-flight items");
        }
        Ok(recovered)
    }

    pub async fn size(&self) -> Result<i64, QueueError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_items WHERE queue = ?1")
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn processing_count(&self) -> Result<i64, QueueError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_processing WHERE queue = ?1")
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn dlq_size(&self) -> Result<i64, QueueError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_dlq WHERE queue = ?1")
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Inspect the newest `n` dead-lettered items without removing them.
    pub async fn peek_dlq(&self, n: i64) -> Result<Vec<DlqEntry>, QueueError> {
        let rows: Vec<(String, String, String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT item_id, payload, reason, final_retries, moved_at
            FROM queue_dlq
            WHERE queue = ?1
            ORDER BY seq DESC
            LIMIT ?2
            "#,
        )
        .bind(&self.name)
        .bind(n)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(item_id, payload, reason, final_retries, moved_at)| {
                let payload = serde_json::from_str(&payload)
                    .map_err(|e| QueueError::Serialization(e.to_string()))?;
                Ok(DlqEntry {
                    item_id,
                    payload,
                    reason,
                    final_retries,
                    moved_at,
                })
            })
            .collect()
    }

    pub async fn clear_dlq(&self) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM queue_dlq WHERE queue = ?1")
            .bind(&self.name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(QueueStats {
            size: self.size().await?,
            processing: self.processing_count().await?,
            dlq: self.dlq_size().await?,
        })
    }
}
