//! Match-executor service client.
//!
//! The executor runs the actual games. The control plane hands it a match id
//! plus both agents' resolved sources and waits for the outcome as one
//! unit-of-work with a 5-minute deadline.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Deadline for one match execution round-trip.
pub const EXECUTE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Executor client errors.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("executor returned error ({status}): {message}")]
    Api { status: u16, message: String },
}

/// One agent's resolved source as the executor sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSource {
    pub id: String,
    pub name: String,
    /// Built image reference or code path, whichever was resolved.
    pub code_url: String,
}

/// Match execution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteMatchRequest {
    pub match_id: String,
    pub environment_id: String,
    pub agent1: AgentSource,
    pub agent2: AgentSource,
}

/// Executor-reported outcome status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecuteStatus {
    Success,
    Timeout,
    Error,
    Cancelled,
}

/// Match execution response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteMatchResponse {
    pub match_id: String,
    pub status: ExecuteStatus,
    #[serde(default)]
    pub winner_id: Option<String>,
    #[serde(default)]
    pub agent1_score: f64,
    #[serde(default)]
    pub agent2_score: f64,
    #[serde(default)]
    pub replay_url: Option<String>,
    #[serde(default)]
    pub replay_html_url: Option<String>,
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default)]
    pub error: Option<String>,
}

/// Capability the match coordinator needs from the executor.
pub trait ExecutorClient: Send + Sync + 'static {
    fn execute_match(
        &self,
        request: ExecuteMatchRequest,
    ) -> impl Future<Output = Result<ExecuteMatchResponse, ExecutorError>> + Send;

    fn health_check(&self) -> impl Future<Output = Result<(), ExecutorError>> + Send;
}

/// HTTP executor client.
#[derive(Debug, Clone)]
pub struct HttpExecutorClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpExecutorClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ExecutorError> {
        let http = reqwest::Client::builder()
            .timeout(EXECUTE_TIMEOUT)
            .build()?;

        let base_url: String = base_url.into();
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl ExecutorClient for HttpExecutorClient {
    async fn execute_match(
        &self,
        request: ExecuteMatchRequest,
    ) -> Result<ExecuteMatchResponse, ExecutorError> {
        let url = format!("{}/execute", self.base_url);

        info!(
            match_id = %request.match_id,
            environment_id = %request.environment_id,
            "dispatching match to executor"
        );

        let resp = self.http.post(&url).json(&request).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ExecutorError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let result: ExecuteMatchResponse = resp.json().await?;

        info!(
            match_id = %result.match_id,
            status = ?result.status,
            duration_ms = result.duration_ms,
            "match execution finished"
        );

        Ok(result)
    }

    async fn health_check(&self) -> Result<(), ExecutorError> {
        let url = format!("{}/health", self.base_url);

        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ExecutorError::Api {
                status: status.as_u16(),
                message: "executor is not healthy".into(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape_is_camel_case() {
        let request = ExecuteMatchRequest {
            match_id: "m1".into(),
            environment_id: "pong".into(),
            agent1: AgentSource {
                id: "a1".into(),
                name: "one".into(),
                code_url: "registry/a1:s1-v1".into(),
            },
            agent2: AgentSource {
                id: "a2".into(),
                name: "two".into(),
                code_url: "/storage/a2.py".into(),
            },
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["matchId"], "m1");
        assert_eq!(json["environmentId"], "pong");
        assert_eq!(json["agent1"]["codeUrl"], "registry/a1:s1-v1");
    }

    #[test]
    fn response_parses_with_optional_fields_absent() {
        let raw = r#"{"matchId":"m1","status":"success","winnerId":"a1","agent1Score":21,"agent2Score":15,"durationMs":4230}"#;
        let resp: ExecuteMatchResponse = serde_json::from_str(raw).unwrap();

        assert_eq!(resp.status, ExecuteStatus::Success);
        assert_eq!(resp.winner_id.as_deref(), Some("a1"));
        assert!(resp.replay_url.is_none());
        assert!(resp.error.is_none());
    }

    #[test]
    fn response_parses_all_statuses() {
        for (raw, expected) in [
            ("success", ExecuteStatus::Success),
            ("timeout", ExecuteStatus::Timeout),
            ("error", ExecuteStatus::Error),
            ("cancelled", ExecuteStatus::Cancelled),
        ] {
            let json = format!(r#"{{"matchId":"m","status":"{raw}"}}"#);
            let resp: ExecuteMatchResponse = serde_json::from_str(&json).unwrap();
            assert_eq!(resp.status, expected);
        }
    }
}
