//! Match coordinator.
//!
//! Dispatches a paired set of agents to the external match executor and
//! applies the outcome: rating deltas from the provisional-K ELO engine
//! (computed from pre-match ratings and match counts), win/loss/draw
//! counters, per-agent quota stats, and re-enqueueing — all as one
//! write-unit. Executor failures fail the match row and mutate nothing
//! else.

use std::sync::Arc;

use tracing::{error, info, warn};

use arena_core::db::unix_timestamp;
use arena_core::error::{Result, ServiceError};
use arena_coord::bus::MatchmakingBus;

use crate::executor::{
    AgentSource, ExecuteMatchRequest, ExecuteMatchResponse, ExecuteStatus, ExecutorClient,
};
use crate::notifier::{HubHandle, MatchStatusPayload};
use crate::storage::{Agent, CompletedMatch, Database, Match, Submission, SubmissionStatus};

use super::elo;

/// Match coordinator over an executor client.
pub struct MatchService<E: ExecutorClient> {
    db: Database,
    executor: Arc<E>,
    bus: MatchmakingBus,
    hub: HubHandle,
}

impl<E: ExecutorClient> MatchService<E> {
    pub fn new(db: Database, executor: Arc<E>, bus: MatchmakingBus, hub: HubHandle) -> Self {
        Self {
            db,
            executor,
            bus,
            hub,
        }
    }

    /// Create a match between two agents and run it to completion.
    ///
    /// Preconditions: distinct agents, same environment, each with a usable
    /// active submission. A submission still `building` means the agent
    /// should not have been eligible; it surfaces as `AgentNotReady` to
    /// guard the race between the build monitor and the matchmaker.
    pub async fn create_and_execute(&self, agent1_id: &str, agent2_id: &str) -> Result<Match> {
        if agent1_id == agent2_id {
            return Err(ServiceError::SameAgent);
        }

        let agent1 = self
            .db
            .find_agent(agent1_id)
            .await?
            .ok_or(ServiceError::NotFound("agent"))?;
        let agent2 = self
            .db
            .find_agent(agent2_id)
            .await?
            .ok_or(ServiceError::NotFound("agent"))?;

        if agent1.environment_id != agent2.environment_id {
            return Err(ServiceError::DifferentEnvironment);
        }

        let source1 = self.resolve_agent_source(&agent1).await?;
        let source2 = self.resolve_agent_source(&agent2).await?;

        let match_id = uuid::Uuid::new_v4().to_string();
        let match_row = self
            .db
            .create_match(&match_id, &agent1.environment_id, agent1_id, agent2_id)
            .await?;

        info!(
            match_id = %match_id,
            agent1 = %agent1.name,
            agent2 = %agent2.name,
            environment_id = %agent1.environment_id,
            "match created"
        );

        let request = ExecuteMatchRequest {
            match_id: match_id.clone(),
            environment_id: agent1.environment_id.clone(),
            agent1: AgentSource {
                id: agent1.id.clone(),
                name: agent1.name.clone(),
                code_url: source1,
            },
            agent2: AgentSource {
                id: agent2.id.clone(),
                name: agent2.name.clone(),
                code_url: source2,
            },
        };

        match self.executor.execute_match(request).await {
            Ok(response) if response.status == ExecuteStatus::Success => {
                self.process_result(&match_row, &agent1, &agent2, &response)
                    .await?;
                Ok(self.db.get_match(&match_id).await?)
            }
            Ok(response) => {
                let message = response
                    .error
                    .unwrap_or_else(|| format!("executor reported {:?}", response.status));
                warn!(match_id = %match_id, message = %message, "match did not succeed");

                self.db.fail_match(&match_id, &message).await?;
                self.notify_failed(&agent1, &agent2, &match_id).await;
                Ok(self.db.get_match(&match_id).await?)
            }
            Err(e) => {
                error!(match_id = %match_id, error = %e, "match execution failed");

                self.db.fail_match(&match_id, &e.to_string()).await?;
                self.notify_failed(&agent1, &agent2, &match_id).await;
                Err(ServiceError::Executor(e.to_string()))
            }
        }
    }

    /// Get a match by id.
    pub async fn get(&self, id: &str) -> Result<Match> {
        self.db
            .get_match(id)
            .await
            .map_err(|_| ServiceError::MatchNotFound)
    }

    /// Matches an agent took part in, paginated.
    pub async fn list_for_agent(&self, agent_id: &str, page: i64, page_size: i64) -> Result<Vec<Match>> {
        let page = page.max(1);
        let page_size = if (1..=100).contains(&page_size) { page_size } else { 20 };
        let offset = (page - 1) * page_size;

        Ok(self.db.list_matches_for_agent(agent_id, page_size, offset).await?)
    }

    /// Resolve the executor source for an agent's active submission:
    /// the built image when the submission is active, otherwise the code
    /// path as a bounded compatibility fallback.
    async fn resolve_agent_source(&self, agent: &Agent) -> Result<String> {
        let submission_id = agent
            .active_submission_id
            .as_deref()
            .ok_or_else(|| ServiceError::AgentNotReady(agent.name.clone()))?;

        let submission = self
            .db
            .find_submission(submission_id)
            .await?
            .ok_or(ServiceError::SubmissionNotFound)?;

        if submission.status == SubmissionStatus::Building.as_str() {
            return Err(ServiceError::AgentNotReady(agent.name.clone()));
        }

        if submission.status == SubmissionStatus::Active.as_str() {
            if let Some(image) = submission
                .docker_image_url
                .as_deref()
                .filter(|url| !url.is_empty())
            {
                return Ok(image.to_string());
            }
        }

        resolve_code_path(&submission)
            .ok_or_else(|| ServiceError::AgentNotReady(agent.name.clone()))
    }

    async fn process_result(
        &self,
        match_row: &Match,
        agent1: &Agent,
        agent2: &Agent,
        response: &ExecuteMatchResponse,
    ) -> Result<()> {
        let winner_id = response.winner_id.clone();
        let outcome = match winner_id.as_deref() {
            None => elo::DRAW,
            Some(id) if id == agent1.id => elo::WIN,
            Some(_) => elo::LOSS,
        };

        // Pre-match ratings and match counts: the K-factor must reflect
        // seniority at the time the match was played.
        let (_, _, delta1, delta2) = elo::calculate_with_match_counts(
            agent1.elo,
            agent2.elo,
            agent1.total_matches,
            agent2.total_matches,
            outcome,
        );

        let completed = CompletedMatch {
            match_id: match_row.id.clone(),
            environment_id: match_row.environment_id.clone(),
            agent1_id: agent1.id.clone(),
            agent2_id: agent2.id.clone(),
            winner_id: winner_id.clone(),
            agent1_score: response.agent1_score,
            agent2_score: response.agent2_score,
            agent1_elo_change: delta1,
            agent2_elo_change: delta2,
            replay_url: response.replay_url.clone(),
            replay_html_url: response.replay_html_url.clone(),
            now: unix_timestamp(),
        };
        self.db.apply_match_result(&completed).await?;

        // Both agents are back in the queue (written in the same
        // transaction); let the matchmaking drivers know.
        self.bus
            .notify_agent_enqueued(&match_row.environment_id, &agent1.id);
        self.bus
            .notify_agent_enqueued(&match_row.environment_id, &agent2.id);

        for agent in [agent1, agent2] {
            self.hub
                .send_match_status(
                    &agent.user_id,
                    MatchStatusPayload {
                        match_id: match_row.id.clone(),
                        status: "completed".to_string(),
                        winner_id: winner_id.clone(),
                        agent1_score: Some(response.agent1_score),
                        agent2_score: Some(response.agent2_score),
                    },
                )
                .await;
        }

        info!(
            match_id = %match_row.id,
            winner_id = ?winner_id,
            agent1_delta = delta1,
            agent2_delta = delta2,
            "match result processed"
        );
        Ok(())
    }

    async fn notify_failed(&self, agent1: &Agent, agent2: &Agent, match_id: &str) {
        for agent in [agent1, agent2] {
            self.hub
                .send_match_status(
                    &agent.user_id,
                    MatchStatusPayload {
                        match_id: match_id.to_string(),
                        status: "failed".to_string(),
                        winner_id: None,
                        agent1_score: None,
                        agent2_score: None,
                    },
                )
                .await;
        }
    }
}

/// Map a `/storage/...` code path onto the local storage root; other paths
/// and URLs pass through unchanged.
fn resolve_code_path(submission: &Submission) -> Option<String> {
    let code_url = submission.code_url.as_str();
    if code_url.is_empty() {
        return None;
    }

    if let Some(relative) = code_url.strip_prefix("/storage/") {
        let cwd = std::env::current_dir().ok()?;
        return Some(cwd.join("storage").join(relative).display().to_string());
    }

    Some(code_url.to_string())
}
