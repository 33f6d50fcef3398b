//! Orchestrator contract for isolated build jobs.
//!
//! The control plane treats the container orchestrator as an external
//! collaborator: it creates labelled batch jobs, watches their lifecycle
//! events, and fetches pod logs. [`Orchestrator`] is the narrow capability
//! the build pipeline needs; production wiring uses the HTTP client in
//! [`http`], tests use in-memory fakes.

mod http;

pub use http::HttpOrchestrator;

use std::collections::HashMap;
use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Label value identifying this platform's jobs.
pub const APP_LABEL: &str = "rl-arena";
/// Label value identifying agent build jobs.
pub const BUILD_TYPE_LABEL: &str = "agent-build";
/// Label carrying the owning submission id.
pub const SUBMISSION_ID_LABEL: &str = "submission-id";
/// Selector the build monitor watches with.
pub const BUILD_LABEL_SELECTOR: &str = "app=rl-arena,type=agent-build";

/// Orchestrator client errors.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("orchestrator API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// One container in a job's pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A batch job to be created in the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub namespace: String,
    pub labels: HashMap<String, String>,
    pub pod_labels: HashMap<String, String>,
    /// Orchestrator-level restarts before the job counts as failed.
    pub backoff_limit: u32,
    /// Seconds after completion before the orchestrator garbage-collects
    /// the job.
    pub ttl_seconds_after_finished: u32,
    pub init_containers: Vec<ContainerSpec>,
    pub containers: Vec<ContainerSpec>,
}

/// Completion counters of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    #[serde(default)]
    pub active: i32,
    #[serde(default)]
    pub succeeded: i32,
    #[serde(default)]
    pub failed: i32,
}

/// The slice of a job an event carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub status: JobStatus,
}

/// Watch event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobEventType {
    Added,
    Modified,
    Deleted,
}

/// One job lifecycle event from the watch stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub event_type: JobEventType,
    #[serde(rename = "object")]
    pub job: JobSnapshot,
}

/// Capability record the build pipeline needs from the orchestrator.
pub trait Orchestrator: Send + Sync + 'static {
    /// Create a batch job.
    fn create_job(
        &self,
        spec: &JobSpec,
    ) -> impl Future<Output = Result<(), OrchestratorError>> + Send;

    /// Current completion counters of a job.
    fn job_status(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<JobStatus, OrchestratorError>> + Send;

    /// Subscribe to job lifecycle events matching `label_selector`.
    ///
    /// The returned channel closes when the underlying stream drops; the
    /// caller is expected to reconnect with backoff.
    fn watch_jobs(
        &self,
        label_selector: &str,
    ) -> impl Future<Output = Result<mpsc::Receiver<JobEvent>, OrchestratorError>> + Send;

    /// Name of the first pod created for a job, if one exists yet.
    fn first_pod_name(
        &self,
        job_name: &str,
    ) -> impl Future<Output = Result<Option<String>, OrchestratorError>> + Send;

    /// Fetch a pod's log output.
    fn pod_logs(
        &self,
        pod_name: &str,
    ) -> impl Future<Output = Result<String, OrchestratorError>> + Send;
}
