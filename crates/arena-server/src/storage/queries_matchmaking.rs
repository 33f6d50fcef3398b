//! Matchmaking queue queries.
//!
//! Eligibility, opponent search, and queue bookkeeping take `now` and the
//! policy knobs (cooldown, daily limit) explicitly so passes are
//! deterministic under test.

use super::db::{Database, DatabaseError};
use super::models::MatchmakingQueueEntry;

impl Database {
    /// Upsert a queue row for (agent, environment).
    ///
    /// Re-enqueues overwrite the rating snapshot and priority, refresh the
    /// enqueue time, and resurrect `matched`/`expired` rows to `waiting`.
    pub async fn enqueue_agent(
        &self,
        id: &str,
        agent_id: &str,
        environment_id: &str,
        elo_rating: i64,
        priority: i64,
        now: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO matchmaking_queue
                (id, agent_id, environment_id, elo_rating, priority, queued_at, status)
            VALUES (?, ?, ?, ?, ?, ?, 'waiting')
            ON CONFLICT(agent_id, environment_id) DO UPDATE SET
                elo_rating = excluded.elo_rating,
                priority = excluded.priority,
                queued_at = excluded.queued_at,
                status = 'waiting',
                matched_at = NULL
            "#,
        )
        .bind(id)
        .bind(agent_id)
        .bind(environment_id)
        .bind(elo_rating)
        .bind(priority)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Eligible waiting rows for one environment.
    ///
    /// Filters: row is `waiting`; the agent has no live match; the agent's
    /// last match is older than the cooldown; and the daily quota has room
    /// (or its reset boundary has passed). Ordered by priority then age.
    pub async fn get_waiting_agents(
        &self,
        environment_id: &str,
        now: i64,
        cooldown_secs: i64,
        daily_limit: i64,
    ) -> Result<Vec<MatchmakingQueueEntry>, DatabaseError> {
        let entries = sqlx::query_as::<_, MatchmakingQueueEntry>(
            r#"
            SELECT mq.id, mq.agent_id, mq.environment_id, mq.elo_rating, mq.priority,
                   mq.queued_at, mq.status, mq.matched_at
            FROM matchmaking_queue mq
            LEFT JOIN agent_match_stats ams ON mq.agent_id = ams.agent_id
            WHERE mq.environment_id = ?1
              AND mq.status = 'waiting'
              AND NOT EXISTS (
                SELECT 1 FROM matches m
                WHERE m.status IN ('pending', 'running')
                  AND (m.agent1_id = mq.agent_id OR m.agent2_id = mq.agent_id)
              )
              AND (ams.last_match_at IS NULL OR ams.last_match_at < ?2 - ?3)
              AND (
                ams.agent_id IS NULL OR
                ams.daily_reset_at <= ?2 OR
                ams.matches_today < ?4
              )
            ORDER BY mq.priority DESC, mq.queued_at ASC
            "#,
        )
        .bind(environment_id)
        .bind(now)
        .bind(cooldown_secs)
        .bind(daily_limit)
        .fetch_all(self.pool())
        .await?;

        Ok(entries)
    }

    /// Closest-rated waiting opponent within `elo_range`, excluding the
    /// given agents. Ties break by priority, then by enqueue age.
    pub async fn find_opponent(
        &self,
        environment_id: &str,
        exclude_agent_ids: &[String],
        elo_rating: i64,
        elo_range: i64,
    ) -> Result<Option<MatchmakingQueueEntry>, DatabaseError> {
        // The exclusion list varies per call; build the placeholder list to
        // match.
        let placeholders = std::iter::repeat("?")
            .take(exclude_agent_ids.len())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            SELECT id, agent_id, environment_id, elo_rating, priority, queued_at, status, matched_at
            FROM matchmaking_queue
            WHERE environment_id = ?
              AND status = 'waiting'
              AND elo_rating BETWEEN ? AND ?
              AND agent_id NOT IN ({placeholders})
            ORDER BY ABS(elo_rating - ?) ASC, priority DESC, queued_at ASC
            LIMIT 1
            "#
        );

        let mut query = sqlx::query_as::<_, MatchmakingQueueEntry>(&sql)
            .bind(environment_id)
            .bind(elo_rating - elo_range)
            .bind(elo_rating + elo_range);
        for agent_id in exclude_agent_ids {
            query = query.bind(agent_id);
        }
        let entry = query.bind(elo_rating).fetch_optional(self.pool()).await?;

        Ok(entry)
    }

    /// Mark a set of queue rows matched, in one statement.
    pub async fn mark_matched(&self, queue_ids: &[String], now: i64) -> Result<(), DatabaseError> {
        if queue_ids.is_empty() {
            return Ok(());
        }

        let placeholders = std::iter::repeat("?")
            .take(queue_ids.len())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE matchmaking_queue SET status = 'matched', matched_at = ? WHERE id IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql).bind(now);
        for id in queue_ids {
            query = query.bind(id);
        }
        query.execute(self.pool()).await?;

        Ok(())
    }

    /// Append a matchmaking audit row.
    pub async fn record_matchmaking_history(
        &self,
        agent1_id: &str,
        agent2_id: &str,
        environment_id: &str,
        match_id: Option<&str>,
        elo_difference: i64,
        now: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO matchmaking_history
                (agent1_id, agent2_id, environment_id, match_id, elo_difference, matched_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(agent1_id)
        .bind(agent2_id)
        .bind(environment_id)
        .bind(match_id)
        .bind(elo_difference)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Expire waiting rows older than `max_age_secs`. Returns the count.
    pub async fn expire_stale_queue_entries(
        &self,
        max_age_secs: i64,
        now: i64,
    ) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE matchmaking_queue SET status = 'expired' WHERE status = 'waiting' AND queued_at < ?",
        )
        .bind(now - max_age_secs)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Remove an agent's queue row for an environment (owner request).
    pub async fn remove_from_queue(
        &self,
        agent_id: &str,
        environment_id: &str,
    ) -> Result<bool, DatabaseError> {
        let result =
            sqlx::query("DELETE FROM matchmaking_queue WHERE agent_id = ? AND environment_id = ?")
                .bind(agent_id)
                .bind(environment_id)
                .execute(self.pool())
                .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Look up the queue row for (agent, environment).
    pub async fn find_queue_entry(
        &self,
        agent_id: &str,
        environment_id: &str,
    ) -> Result<Option<MatchmakingQueueEntry>, DatabaseError> {
        let entry = sqlx::query_as::<_, MatchmakingQueueEntry>(
            "SELECT * FROM matchmaking_queue WHERE agent_id = ? AND environment_id = ?",
        )
        .bind(agent_id)
        .bind(environment_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(entry)
    }
}
