//! Agent match-stats queries (per-agent cooldown and daily quota bookkeeping).
//!
//! All methods take `now` explicitly: callers pass `unix_timestamp()` in
//! production and fixed instants in boundary tests.

use arena_core::time::next_midnight;

use super::db::{Database, DatabaseError};
use super::models::AgentMatchStats;

impl Database {
    /// Fetch the stats row for an agent, creating a zeroed one if missing.
    pub async fn get_or_create_match_stats(
        &self,
        agent_id: &str,
        now: i64,
    ) -> Result<AgentMatchStats, DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO agent_match_stats (agent_id, daily_reset_at, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(agent_id) DO NOTHING
            "#,
        )
        .bind(agent_id)
        .bind(next_midnight(now))
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        sqlx::query_as::<_, AgentMatchStats>("SELECT * FROM agent_match_stats WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("AgentMatchStats {agent_id}")))
    }

    /// Record one played match for the agent.
    ///
    /// The daily counter reset is a CASE expression inside the single
    /// UPDATE, so the reset is atomic with the increment: an increment past
    /// the reset boundary lands at `matches_today = 1` with the boundary
    /// advanced to the next midnight.
    pub async fn increment_match_stats(
        &self,
        agent_id: &str,
        now: i64,
    ) -> Result<(), DatabaseError> {
        let next_reset = next_midnight(now);

        let result = sqlx::query(
            r#"
            UPDATE agent_match_stats
            SET last_match_at = ?2,
                matches_today = CASE WHEN daily_reset_at <= ?2 THEN 1 ELSE matches_today + 1 END,
                daily_reset_at = CASE WHEN daily_reset_at <= ?2 THEN ?3 ELSE daily_reset_at END,
                total_matches = total_matches + 1,
                updated_at = ?2
            WHERE agent_id = ?1
            "#,
        )
        .bind(agent_id)
        .bind(now)
        .bind(next_reset)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            sqlx::query(
                r#"
                INSERT INTO agent_match_stats
                    (agent_id, last_match_at, matches_today, daily_reset_at, total_matches,
                     created_at, updated_at)
                VALUES (?, ?, 1, ?, 1, ?, ?)
                "#,
            )
            .bind(agent_id)
            .bind(now)
            .bind(next_reset)
            .bind(now)
            .bind(now)
            .execute(self.pool())
            .await?;
        }

        Ok(())
    }

    /// Whether the agent may play another match right now. Returns the
    /// human-readable block reason when it may not.
    pub async fn can_match(
        &self,
        agent_id: &str,
        now: i64,
        cooldown_secs: i64,
        daily_limit: i64,
    ) -> Result<(bool, Option<String>), DatabaseError> {
        let stats = self.get_or_create_match_stats(agent_id, now).await?;

        if stats.daily_reset_at > now && stats.matches_today >= daily_limit {
            return Ok((
                false,
                Some(format!(
                    "Daily match limit reached ({}/{daily_limit})",
                    stats.matches_today
                )),
            ));
        }

        if let Some(last_match_at) = stats.last_match_at {
            let since = now - last_match_at;
            if since < cooldown_secs {
                return Ok((
                    false,
                    Some(format!(
                        "Match cooldown active. Wait {} more seconds",
                        cooldown_secs - since
                    )),
                ));
            }
        }

        Ok((true, None))
    }
}
