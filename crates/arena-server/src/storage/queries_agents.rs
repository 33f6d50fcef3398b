//! Agent queries.

use arena_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::Agent;

impl Database {
    /// Create a new agent with the default rating.
    pub async fn create_agent(
        &self,
        id: &str,
        user_id: &str,
        name: &str,
        description: Option<&str>,
        environment_id: &str,
    ) -> Result<Agent, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r#"
            INSERT INTO agents (id, user_id, name, description, environment_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(name)
        .bind(description)
        .bind(environment_id)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_agent(id).await
    }

    /// Get an agent by ID.
    pub async fn get_agent(&self, id: &str) -> Result<Agent, DatabaseError> {
        self.find_agent(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Agent {id}")))
    }

    /// Look up an agent by ID.
    pub async fn find_agent(&self, id: &str) -> Result<Option<Agent>, DatabaseError> {
        let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        Ok(agent)
    }

    /// List agents owned by a user.
    pub async fn list_agents_for_user(&self, user_id: &str) -> Result<Vec<Agent>, DatabaseError> {
        let agents = sqlx::query_as::<_, Agent>(
            "SELECT * FROM agents WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;

        Ok(agents)
    }

    /// Leaderboard: top agents in an environment by rating.
    pub async fn top_agents_by_rating(
        &self,
        environment_id: &str,
        limit: i64,
    ) -> Result<Vec<Agent>, DatabaseError> {
        let agents = sqlx::query_as::<_, Agent>(
            r#"
            SELECT * FROM agents
            WHERE environment_id = ?
            ORDER BY elo DESC, created_at DESC
            LIMIT ?
            "#,
        )
        .bind(environment_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(agents)
    }

    /// Environments that currently have agents registered.
    pub async fn active_environments(&self) -> Result<Vec<String>, DatabaseError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT environment_id FROM agents ORDER BY environment_id")
                .fetch_all(self.pool())
                .await?;

        Ok(rows.into_iter().map(|(env,)| env).collect())
    }

    /// Delete an agent (owner request).
    pub async fn delete_agent(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
