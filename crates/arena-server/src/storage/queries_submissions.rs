//! Submission queries.

use arena_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{Submission, SubmissionStatus};

impl Database {
    /// Create a submission with the next version number for the agent.
    ///
    /// Version assignment and insert run in one transaction so concurrent
    /// submissions for the same agent cannot collide on a version.
    pub async fn create_submission(
        &self,
        id: &str,
        agent_id: &str,
        code_url: &str,
    ) -> Result<Submission, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        let environment_id: Option<(String,)> =
            sqlx::query_as("SELECT environment_id FROM agents WHERE id = ?")
                .bind(agent_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((environment_id,)) = environment_id else {
            return Err(DatabaseError::NotFound(format!("Agent {agent_id}")));
        };

        let (next_version,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM submissions WHERE agent_id = ?",
        )
        .bind(agent_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO submissions
                (id, agent_id, environment_id, version, status, code_url, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'pending', ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(agent_id)
        .bind(&environment_id)
        .bind(next_version)
        .bind(code_url)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.get_submission(id).await
    }

    /// Get a submission by ID.
    pub async fn get_submission(&self, id: &str) -> Result<Submission, DatabaseError> {
        self.find_submission(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Submission {id}")))
    }

    /// Look up a submission by ID.
    pub async fn find_submission(&self, id: &str) -> Result<Option<Submission>, DatabaseError> {
        let submission = sqlx::query_as::<_, Submission>("SELECT * FROM submissions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        Ok(submission)
    }

    /// All submissions for an agent, newest version first.
    pub async fn list_submissions_for_agent(
        &self,
        agent_id: &str,
    ) -> Result<Vec<Submission>, DatabaseError> {
        let submissions = sqlx::query_as::<_, Submission>(
            "SELECT * FROM submissions WHERE agent_id = ? ORDER BY version DESC",
        )
        .bind(agent_id)
        .fetch_all(self.pool())
        .await?;

        Ok(submissions)
    }

    /// All submissions currently in the given status.
    pub async fn find_submissions_by_status(
        &self,
        status: SubmissionStatus,
    ) -> Result<Vec<Submission>, DatabaseError> {
        let submissions = sqlx::query_as::<_, Submission>(
            "SELECT * FROM submissions WHERE status = ? ORDER BY created_at ASC",
        )
        .bind(status.as_str())
        .fetch_all(self.pool())
        .await?;

        Ok(submissions)
    }

    /// The agent's currently active submission, if any.
    pub async fn get_active_submission(
        &self,
        agent_id: &str,
    ) -> Result<Option<Submission>, DatabaseError> {
        let submission = sqlx::query_as::<_, Submission>(
            "SELECT * FROM submissions WHERE agent_id = ? AND is_active = 1 LIMIT 1",
        )
        .bind(agent_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(submission)
    }

    /// Update submission status together with build log and error message.
    pub async fn update_submission_status(
        &self,
        id: &str,
        status: SubmissionStatus,
        build_log: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            UPDATE submissions
            SET status = ?, build_log = ?, error_message = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(build_log)
        .bind(error_message)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Record the dispatched build job handle, target image, and pod name.
    pub async fn update_submission_build_info(
        &self,
        id: &str,
        build_job_name: Option<&str>,
        docker_image_url: Option<&str>,
        build_pod_name: Option<&str>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            UPDATE submissions
            SET build_job_name = COALESCE(?, build_job_name),
                docker_image_url = COALESCE(?, docker_image_url),
                build_pod_name = COALESCE(?, build_pod_name),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(build_job_name)
        .bind(docker_image_url)
        .bind(build_pod_name)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Stamp a rebuild attempt.
    pub async fn update_submission_retry(
        &self,
        id: &str,
        retry_count: i64,
        last_retry_at: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE submissions SET retry_count = ?, last_retry_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(retry_count)
        .bind(last_retry_at)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Make a submission the agent's active one.
    ///
    /// One transaction: deactivate the previous active submission, activate
    /// the new one, and update the agent's pointer. At most one submission
    /// per agent ever has `is_active = 1`.
    pub async fn set_active_submission(
        &self,
        submission_id: &str,
        agent_id: &str,
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "UPDATE submissions SET is_active = 0, updated_at = ? WHERE agent_id = ? AND is_active = 1",
        )
        .bind(now)
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE submissions SET is_active = 1, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(submission_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE agents SET active_submission_id = ?, updated_at = ? WHERE id = ?")
            .bind(submission_id)
            .bind(now)
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Count submissions created by the agent since the given day boundary.
    pub async fn count_submissions_since(
        &self,
        agent_id: &str,
        since: i64,
    ) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM submissions WHERE agent_id = ? AND created_at >= ?",
        )
        .bind(agent_id)
        .bind(since)
        .fetch_one(self.pool())
        .await?;

        Ok(count)
    }
}
