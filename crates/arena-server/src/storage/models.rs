//! Database models for the arena control plane.

use serde::{Deserialize, Serialize};

/// Registered platform user.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A competing agent, owned by a user and bound to one environment.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Agent {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub environment_id: String,
    pub elo: i64,
    pub wins: i64,
    pub losses: i64,
    pub draws: i64,
    pub total_matches: i64,
    pub active_submission_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A versioned submission attempt for an agent.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Submission {
    pub id: String,
    pub agent_id: String,
    pub environment_id: String,
    pub version: i64,
    pub status: String,
    pub code_url: String,
    pub docker_image_url: Option<String>,
    pub build_job_name: Option<String>,
    pub build_pod_name: Option<String>,
    pub build_log: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub last_retry_at: Option<i64>,
    pub is_active: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Submission {
    pub fn active(&self) -> bool {
        self.is_active != 0
    }
}

/// A contest between two agents in the same environment.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Match {
    pub id: String,
    pub environment_id: String,
    pub agent1_id: String,
    pub agent2_id: String,
    pub status: String,
    pub winner_id: Option<String>,
    pub agent1_score: Option<f64>,
    pub agent2_score: Option<f64>,
    pub agent1_elo_change: Option<i64>,
    pub agent2_elo_change: Option<i64>,
    pub is_public: i64,
    pub replay_url: Option<String>,
    pub replay_html_url: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub created_at: i64,
}

/// One matchmaking queue row per (agent, environment).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MatchmakingQueueEntry {
    pub id: String,
    pub agent_id: String,
    pub environment_id: String,
    pub elo_rating: i64,
    pub priority: i64,
    pub queued_at: i64,
    pub status: String,
    pub matched_at: Option<i64>,
}

/// Per-agent match rate-limit bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AgentMatchStats {
    pub agent_id: String,
    pub last_match_at: Option<i64>,
    pub matches_today: i64,
    pub daily_reset_at: i64,
    pub total_matches: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Append-only matchmaking audit record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MatchmakingHistory {
    pub id: i64,
    pub agent1_id: String,
    pub agent2_id: String,
    pub environment_id: String,
    pub match_id: Option<String>,
    pub elo_difference: i64,
    pub matched_at: i64,
}

/// Submission lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    Pending,
    Building,
    Active,
    Inactive,
    BuildFailed,
}

impl SubmissionStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::BuildFailed => "build_failed",
        }
    }
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Match lifecycle states; transitions are forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl MatchStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Matchmaking queue row states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Waiting,
    Matched,
    Expired,
}

impl QueueStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Matched => "matched",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
