//! Match queries, including the single-transaction result application.

use arena_core::db::unix_timestamp;
use arena_core::time::next_midnight;

use super::db::{Database, DatabaseError};
use super::models::Match;

/// Everything the completed-match transaction writes.
#[derive(Debug, Clone)]
pub struct CompletedMatch {
    pub match_id: String,
    pub environment_id: String,
    pub agent1_id: String,
    pub agent2_id: String,
    pub winner_id: Option<String>,
    pub agent1_score: f64,
    pub agent2_score: f64,
    pub agent1_elo_change: i64,
    pub agent2_elo_change: i64,
    pub replay_url: Option<String>,
    pub replay_html_url: Option<String>,
    pub now: i64,
}

impl Database {
    /// Create a match row in `pending` state.
    pub async fn create_match(
        &self,
        id: &str,
        environment_id: &str,
        agent1_id: &str,
        agent2_id: &str,
    ) -> Result<Match, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r#"
            INSERT INTO matches (id, environment_id, agent1_id, agent2_id, status, started_at, created_at)
            VALUES (?, ?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(id)
        .bind(environment_id)
        .bind(agent1_id)
        .bind(agent2_id)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_match(id).await
    }

    /// Get a match by ID.
    pub async fn get_match(&self, id: &str) -> Result<Match, DatabaseError> {
        sqlx::query_as::<_, Match>("SELECT * FROM matches WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Match {id}")))
    }

    /// Matches an agent took part in, newest first.
    pub async fn list_matches_for_agent(
        &self,
        agent_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Match>, DatabaseError> {
        let matches = sqlx::query_as::<_, Match>(
            r#"
            SELECT * FROM matches
            WHERE agent1_id = ? OR agent2_id = ?
            ORDER BY created_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(agent_id)
        .bind(agent_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;

        Ok(matches)
    }

    /// Whether the agent currently appears in a pending or running match.
    pub async fn agent_has_live_match(&self, agent_id: &str) -> Result<bool, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM matches
            WHERE status IN ('pending', 'running')
              AND (agent1_id = ? OR agent2_id = ?)
            "#,
        )
        .bind(agent_id)
        .bind(agent_id)
        .fetch_one(self.pool())
        .await?;

        Ok(count > 0)
    }

    /// Mark a match failed with the executor's error message. No rating or
    /// stats mutation happens on this path.
    pub async fn fail_match(&self, id: &str, error_message: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE matches SET status = 'failed', error_message = ?, completed_at = ? WHERE id = ?",
        )
        .bind(error_message)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Apply a successful match result as one write-unit.
    ///
    /// In a single transaction: complete the match row, update both agents
    /// (rating clamped at floor 0, win/loss/draw counter, total matches),
    /// bump both stats rows with the atomic daily-reset increment, and
    /// re-enqueue both agents with their post-match rating snapshot. Any
    /// step failing rolls the whole unit back.
    pub async fn apply_match_result(&self, result: &CompletedMatch) -> Result<(), DatabaseError> {
        let now = result.now;
        let next_reset = next_midnight(now);
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            UPDATE matches
            SET status = 'completed',
                winner_id = ?,
                agent1_score = ?,
                agent2_score = ?,
                agent1_elo_change = ?,
                agent2_elo_change = ?,
                replay_url = ?,
                replay_html_url = ?,
                completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(result.winner_id.as_deref())
        .bind(result.agent1_score)
        .bind(result.agent2_score)
        .bind(result.agent1_elo_change)
        .bind(result.agent2_elo_change)
        .bind(result.replay_url.as_deref())
        .bind(result.replay_html_url.as_deref())
        .bind(now)
        .bind(&result.match_id)
        .execute(&mut *tx)
        .await?;

        for (agent_id, elo_change) in [
            (&result.agent1_id, result.agent1_elo_change),
            (&result.agent2_id, result.agent2_elo_change),
        ] {
            let won = result.winner_id.as_deref() == Some(agent_id.as_str());
            let lost = result.winner_id.is_some() && !won;
            let draw = result.winner_id.is_none();

            sqlx::query(
                r#"
                UPDATE agents
                SET elo = MAX(0, elo + ?),
                    wins = wins + ?,
                    losses = losses + ?,
                    draws = draws + ?,
                    total_matches = total_matches + 1,
                    updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(elo_change)
            .bind(i64::from(won))
            .bind(i64::from(lost))
            .bind(i64::from(draw))
            .bind(now)
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;

            let updated = sqlx::query(
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
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                sqlx::query(
                    r#"
                    INSERT INTO agent_match_stats
                        (agent_id, last_match_at, matches_today, daily_reset_at, total_matches,
                         created_at, updated_at)
                    VALUES (?, ?, 1, ?, ?, ?, ?)
                    "#,
                )
                .bind(agent_id)
                .bind(now)
                .bind(next_reset)
                .bind(1)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }

            sqlx::query(
                r#"
                INSERT INTO matchmaking_queue
                    (id, agent_id, environment_id, elo_rating, priority, queued_at, status)
                VALUES (?1, ?2, ?3, (SELECT elo FROM agents WHERE id = ?2), 5, ?4, 'waiting')
                ON CONFLICT(agent_id, environment_id) DO UPDATE SET
                    elo_rating = excluded.elo_rating,
                    priority = excluded.priority,
                    queued_at = excluded.queued_at,
                    status = 'waiting',
                    matched_at = NULL
                "#,
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(agent_id)
            .bind(&result.environment_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_705_320_000;

    async fn setup() -> Database {
        let db = Database::open_in_memory().await.unwrap();
        db.create_user("u1", "alice", "alice@example.com", "hash")
            .await
            .unwrap();
        db.create_agent("a1", "u1", "one", None, "pong").await.unwrap();
        db.create_agent("a2", "u1", "two", None, "pong").await.unwrap();
        db
    }

    fn completed(winner: Option<&str>) -> CompletedMatch {
        CompletedMatch {
            match_id: "m1".into(),
            environment_id: "pong".into(),
            agent1_id: "a1".into(),
            agent2_id: "a2".into(),
            winner_id: winner.map(Into::into),
            agent1_score: 21.0,
            agent2_score: 15.0,
            agent1_elo_change: 16,
            agent2_elo_change: -16,
            replay_url: Some("https://replays/m1.json".into()),
            replay_html_url: None,
            now: NOW,
        }
    }

    #[tokio::test]
    async fn pending_match_has_no_result_fields() {
        let db = setup().await;
        let m = db.create_match("m1", "pong", "a1", "a2").await.unwrap();

        assert_eq!(m.status, "pending");
        assert!(m.winner_id.is_none());
        assert!(m.agent1_score.is_none());
        assert!(m.agent1_elo_change.is_none());
        assert!(m.replay_url.is_none());
        assert!(m.completed_at.is_none());
    }

    #[tokio::test]
    async fn live_match_detection() {
        let db = setup().await;
        db.create_match("m1", "pong", "a1", "a2").await.unwrap();

        assert!(db.agent_has_live_match("a1").await.unwrap());
        assert!(db.agent_has_live_match("a2").await.unwrap());

        db.fail_match("m1", "executor down").await.unwrap();
        assert!(!db.agent_has_live_match("a1").await.unwrap());
    }

    #[tokio::test]
    async fn apply_result_updates_everything_atomically() {
        let db = setup().await;
        db.create_match("m1", "pong", "a1", "a2").await.unwrap();

        db.apply_match_result(&completed(Some("a1"))).await.unwrap();

        let m = db.get_match("m1").await.unwrap();
        assert_eq!(m.status, "completed");
        assert_eq!(m.winner_id.as_deref(), Some("a1"));
        assert_eq!(m.agent1_elo_change, Some(16));
        assert_eq!(m.completed_at, Some(NOW));

        let a1 = db.get_agent("a1").await.unwrap();
        let a2 = db.get_agent("a2").await.unwrap();
        assert_eq!(a1.elo, 1216);
        assert_eq!(a1.wins, 1);
        assert_eq!(a1.total_matches, 1);
        assert_eq!(a2.elo, 1184);
        assert_eq!(a2.losses, 1);

        let stats = db.get_or_create_match_stats("a1", NOW).await.unwrap();
        assert_eq!(stats.matches_today, 1);
        assert_eq!(stats.last_match_at, Some(NOW));

        // Both agents are back in the queue with fresh rating snapshots.
        let q1 = db.find_queue_entry("a1", "pong").await.unwrap().unwrap();
        let q2 = db.find_queue_entry("a2", "pong").await.unwrap().unwrap();
        assert_eq!(q1.status, "waiting");
        assert_eq!(q1.elo_rating, 1216);
        assert_eq!(q2.elo_rating, 1184);
    }

    #[tokio::test]
    async fn draw_updates_draw_counters() {
        let db = setup().await;
        db.create_match("m1", "pong", "a1", "a2").await.unwrap();

        let mut result = completed(None);
        result.agent1_elo_change = 0;
        result.agent2_elo_change = 0;
        db.apply_match_result(&result).await.unwrap();

        let a1 = db.get_agent("a1").await.unwrap();
        assert_eq!(a1.draws, 1);
        assert_eq!(a1.wins, 0);
        assert_eq!(a1.losses, 0);
        assert_eq!(a1.elo, 1200);
    }

    #[tokio::test]
    async fn rating_is_clamped_at_zero() {
        let db = setup().await;
        db.create_match("m1", "pong", "a1", "a2").await.unwrap();
        sqlx::query("UPDATE agents SET elo = 5 WHERE id = 'a2'")
            .execute(db.pool())
            .await
            .unwrap();

        db.apply_match_result(&completed(Some("a1"))).await.unwrap();

        let a2 = db.get_agent("a2").await.unwrap();
        assert_eq!(a2.elo, 0);
    }

    #[tokio::test]
    async fn failed_match_mutates_nothing_else() {
        let db = setup().await;
        db.create_match("m1", "pong", "a1", "a2").await.unwrap();

        db.fail_match("m1", "executor timeout").await.unwrap();

        let m = db.get_match("m1").await.unwrap();
        assert_eq!(m.status, "failed");
        assert_eq!(m.error_message.as_deref(), Some("executor timeout"));

        let a1 = db.get_agent("a1").await.unwrap();
        assert_eq!(a1.elo, 1200);
        assert_eq!(a1.total_matches, 0);
        assert!(db.find_queue_entry("a1", "pong").await.unwrap().is_none());
    }
}
