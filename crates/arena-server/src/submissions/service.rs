//! Submission intake, rebuild, and activation.
//!
//! Intake validates ownership, the per-agent daily quota, and the uploaded
//! blob before creating a `pending` row with the next version number. Build
//! dispatch is kicked off asynchronously so callers see `pending`
//! immediately; the build monitor drives everything after that.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use arena_core::db::unix_timestamp;
use arena_core::error::{Result, ServiceError};
use arena_core::time::day_start;

use crate::build::BuildDispatcher;
use crate::orchestrator::Orchestrator;
use crate::storage::{Database, Submission, SubmissionStatus};

use super::scanner;

/// Maximum rebuild attempts per submission.
const MAX_RETRY_COUNT: i64 = 3;

/// Submission service.
pub struct SubmissionService<O: Orchestrator> {
    db: Database,
    dispatcher: Arc<BuildDispatcher<O>>,
    storage_dir: PathBuf,
    daily_quota: i64,
}

impl<O: Orchestrator> SubmissionService<O> {
    pub fn new(
        db: Database,
        dispatcher: Arc<BuildDispatcher<O>>,
        storage_dir: impl Into<PathBuf>,
        daily_quota: i64,
    ) -> Self {
        Self {
            db,
            dispatcher,
            storage_dir: storage_dir.into(),
            daily_quota,
        }
    }

    /// Create a submission from an uploaded blob.
    pub async fn create_from_upload(
        &self,
        agent_id: &str,
        user_id: &str,
        file_name: &str,
        contents: &[u8],
    ) -> Result<Submission> {
        self.check_owner_and_quota(agent_id, user_id).await?;

        if !scanner::allowed_extension(file_name) {
            return Err(ServiceError::InvalidFile(
                "only .py and .zip uploads are accepted".to_string(),
            ));
        }
        scanner::scan_source(contents).map_err(ServiceError::InvalidFile)?;

        let code_url = self.save_blob(agent_id, file_name, contents).await?;

        let submission_id = uuid::Uuid::new_v4().to_string();
        let submission = self
            .db
            .create_submission(&submission_id, agent_id, &code_url)
            .await?;

        info!(
            submission_id = %submission.id,
            agent_id = %agent_id,
            version = submission.version,
            "submission created from upload"
        );

        self.spawn_dispatch(submission.clone());
        Ok(submission)
    }

    /// Create a submission from a source URL (e.g. a git repository).
    pub async fn create_from_url(
        &self,
        agent_id: &str,
        user_id: &str,
        code_url: &str,
    ) -> Result<Submission> {
        self.check_owner_and_quota(agent_id, user_id).await?;

        if code_url.is_empty() {
            return Err(ServiceError::InvalidInput("code_url is empty".to_string()));
        }

        let submission_id = uuid::Uuid::new_v4().to_string();
        let submission = self
            .db
            .create_submission(&submission_id, agent_id, code_url)
            .await?;

        info!(
            submission_id = %submission.id,
            agent_id = %agent_id,
            version = submission.version,
            code_url = %code_url,
            "submission created from url"
        );

        self.spawn_dispatch(submission.clone());
        Ok(submission)
    }

    /// Rebuild a failed submission, bounded by the retry budget.
    pub async fn rebuild(&self, submission_id: &str, user_id: &str) -> Result<Submission> {
        let submission = self
            .db
            .find_submission(submission_id)
            .await?
            .ok_or(ServiceError::SubmissionNotFound)?;

        let agent = self
            .db
            .find_agent(&submission.agent_id)
            .await?
            .ok_or(ServiceError::NotFound("agent"))?;
        if agent.user_id != user_id {
            return Err(ServiceError::Unauthorized);
        }

        if submission.retry_count >= MAX_RETRY_COUNT {
            return Err(ServiceError::MaxRetriesExceeded);
        }

        let retry_count = submission.retry_count + 1;
        self.db
            .update_submission_retry(submission_id, retry_count, unix_timestamp())
            .await?;
        self.db
            .update_submission_status(submission_id, SubmissionStatus::Pending, None, None)
            .await?;

        let submission = self.db.get_submission(submission_id).await?;

        info!(
            submission_id = %submission_id,
            retry_count,
            "submission rebuild initiated"
        );

        self.spawn_dispatch(submission.clone());
        Ok(submission)
    }

    /// Owner-initiated activation of a previously built submission.
    pub async fn set_active(&self, submission_id: &str, user_id: &str) -> Result<()> {
        let submission = self
            .db
            .find_submission(submission_id)
            .await?
            .ok_or(ServiceError::SubmissionNotFound)?;

        let agent = self
            .db
            .find_agent(&submission.agent_id)
            .await?
            .ok_or(ServiceError::NotFound("agent"))?;
        if agent.user_id != user_id {
            return Err(ServiceError::Unauthorized);
        }

        self.db
            .set_active_submission(submission_id, &submission.agent_id)
            .await?;
        Ok(())
    }

    /// Get a submission by id.
    pub async fn get(&self, id: &str) -> Result<Submission> {
        self.db
            .find_submission(id)
            .await?
            .ok_or(ServiceError::SubmissionNotFound)
    }

    /// All submissions of an agent, newest version first.
    pub async fn list_for_agent(&self, agent_id: &str) -> Result<Vec<Submission>> {
        Ok(self.db.list_submissions_for_agent(agent_id).await?)
    }

    async fn check_owner_and_quota(&self, agent_id: &str, user_id: &str) -> Result<()> {
        let agent = self
            .db
            .find_agent(agent_id)
            .await?
            .ok_or(ServiceError::NotFound("agent"))?;
        if agent.user_id != user_id {
            return Err(ServiceError::Unauthorized);
        }

        let today = self
            .db
            .count_submissions_since(agent_id, day_start(unix_timestamp()))
            .await?;
        if today >= self.daily_quota {
            return Err(ServiceError::DailyQuotaExceeded);
        }

        Ok(())
    }

    async fn save_blob(&self, agent_id: &str, file_name: &str, contents: &[u8]) -> Result<String> {
        let dir = self.storage_dir.join(agent_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        let unique_name = format!("{}-{file_name}", uuid::Uuid::new_v4());
        let path = dir.join(&unique_name);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        Ok(path.display().to_string())
    }

    /// Kick off build dispatch in the background; the caller sees the
    /// submission as `pending` immediately.
    fn spawn_dispatch(&self, submission: Submission) {
        let db = self.db.clone();
        let dispatcher = Arc::clone(&self.dispatcher);

        tokio::spawn(async move {
            if let Err(e) = db
                .update_submission_status(&submission.id, SubmissionStatus::Building, None, None)
                .await
            {
                error!(submission_id = %submission.id, error = %e, "failed to mark submission building");
                return;
            }

            if let Err(e) = dispatcher.dispatch_build(&submission).await {
                error!(submission_id = %submission.id, error = %e, "build dispatch failed");
                let message = e.to_string();
                if let Err(e) = db
                    .update_submission_status(
                        &submission.id,
                        SubmissionStatus::BuildFailed,
                        None,
                        Some(&message),
                    )
                    .await
                {
                    error!(submission_id = %submission.id, error = %e, "failed to mark submission build_failed");
                }
            }
        });
    }
}
