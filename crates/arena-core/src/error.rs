//! Error types for RL-Arena services.
//!
//! `ServiceError` is the categorized error set the REST collaborators
//! distinguish on. Infrastructure errors (storage, coordination store,
//! executor transport) are wrapped so callers can still branch on kind.

use thiserror::Error;

/// Result type alias using the arena `ServiceError`.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Categorized errors surfaced by the control-plane services.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Generic resource lookup miss.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Caller does not own the resource.
    #[error("unauthorized")]
    Unauthorized,

    /// Request payload failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Environment id is unknown or does not match.
    #[error("invalid environment")]
    InvalidEnvironment,

    /// Username or email already registered.
    #[error("user already exists")]
    UserExists,

    /// Login credentials did not match.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Agent has no usable active submission.
    #[error("agent {0} does not have a ready submission")]
    AgentNotReady(String),

    /// An agent cannot be matched against itself.
    #[error("cannot match agent against itself")]
    SameAgent,

    /// Matched agents must share an environment.
    #[error("agents must be in the same environment")]
    DifferentEnvironment,

    #[error("match not found")]
    MatchNotFound,

    #[error("submission not found")]
    SubmissionNotFound,

    /// Uploaded blob rejected (extension or static scan).
    #[error("invalid file: {0}")]
    InvalidFile(String),

    /// Per-agent daily submission or match quota hit.
    #[error("daily quota exceeded")]
    DailyQuotaExceeded,

    /// Rebuild attempted past the retry budget.
    #[error("maximum retry count exceeded")]
    MaxRetriesExceeded,

    /// Admission refused by a rate limiter.
    #[error("rate limited")]
    RateLimited,

    /// Row-store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Coordination-store failure (locks, queues, buckets).
    #[error("coordination error: {0}")]
    Coordination(String),

    /// Match executor transport or protocol failure.
    #[error("executor error: {0}")]
    Executor(String),

    /// Orchestrator (build job) transport or protocol failure.
    #[error("orchestrator error: {0}")]
    Orchestrator(String),
}

impl From<crate::db::DatabaseError> for ServiceError {
    fn from(e: crate::db::DatabaseError) -> Self {
        match e {
            crate::db::DatabaseError::NotFound(what) => {
                // Preserve lookup misses so handlers can map them to 404s.
                tracing::debug!(what = %what, "storage lookup miss");
                Self::Storage(format!("not found: {what}"))
            }
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
