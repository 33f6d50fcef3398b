//! Configuration for the RL-Arena control plane.
//!
//! Resolution order: built-in defaults, then environment variables. The
//! binary's clap arguments override individual fields on top of this.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Complete control-plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaConfig {
    /// HTTP listen port for the (external) REST surface.
    pub port: u16,
    /// Deployment environment label ("development", "production", ...).
    pub env: String,
    /// Row-store database URL or file path. Mandatory at startup.
    pub database_url: String,
    /// Coordination-store database URL or file path. Optional: when unset,
    /// the in-process lock/limiter variants are used.
    pub coord_url: Option<String>,
    /// Signing secret handed to the authentication collaborator.
    pub auth_secret: String,
    /// Issued-token lifetime for the authentication collaborator.
    pub auth_token_lifetime: Duration,
    /// Cross-origin allow-list for the REST surface.
    pub cors_allowed_origins: Vec<String>,
    /// Interval between periodic matchmaking triggers.
    pub matchmaking_interval: Duration,
    /// Match-executor service endpoint.
    pub executor_url: String,
    /// Orchestrator API endpoint for build jobs.
    pub orchestrator_url: String,
    /// Per-agent daily submission quota.
    pub daily_submission_quota: i64,
    /// Per-agent daily match quota.
    pub daily_match_limit: i64,
    /// Per-agent cooldown between matches.
    pub match_cooldown: Duration,
    /// Orchestrator namespace build jobs are created in.
    pub orchestrator_namespace: String,
    /// Image registry host builds are pushed to.
    pub registry_url: String,
    /// Registry push-credentials secret name mounted into builder jobs.
    pub registry_secret: String,
    /// Local single-node cluster development mode.
    pub local_cluster: bool,
    /// Directory uploaded submission blobs are saved under.
    pub storage_dir: String,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            env: "development".to_string(),
            database_url: String::new(),
            coord_url: None,
            auth_secret: "change-me".to_string(),
            auth_token_lifetime: Duration::from_secs(24 * 60 * 60),
            cors_allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(),
            ],
            matchmaking_interval: Duration::from_secs(30),
            executor_url: "http://localhost:8081".to_string(),
            orchestrator_url: "http://localhost:8001".to_string(),
            daily_submission_quota: 5,
            daily_match_limit: 100,
            match_cooldown: Duration::from_secs(5 * 60),
            orchestrator_namespace: "rl-arena".to_string(),
            registry_url: "registry.local".to_string(),
            registry_secret: "registry-push-secret".to_string(),
            local_cluster: false,
            storage_dir: "storage/submissions".to_string(),
        }
    }
}

impl ArenaConfig {
    /// Load configuration from the environment on top of built-in defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_parse("ARENA_PORT") {
            cfg.port = v;
        }
        if let Ok(v) = std::env::var("ARENA_ENV") {
            cfg.env = v;
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            cfg.database_url = v;
        }
        if let Ok(v) = std::env::var("COORD_URL") {
            if !v.is_empty() {
                cfg.coord_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("AUTH_SECRET") {
            cfg.auth_secret = v;
        }
        if let Some(v) = env_parse("AUTH_TOKEN_LIFETIME_SECS") {
            cfg.auth_token_lifetime = Duration::from_secs(v);
        }
        if let Ok(v) = std::env::var("CORS_ALLOWED_ORIGINS") {
            cfg.cors_allowed_origins = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(v) = env_parse("MATCHMAKING_INTERVAL_SECS") {
            cfg.matchmaking_interval = Duration::from_secs(v);
        }
        if let Ok(v) = std::env::var("EXECUTOR_URL") {
            cfg.executor_url = v;
        }
        if let Ok(v) = std::env::var("ORCHESTRATOR_URL") {
            cfg.orchestrator_url = v;
        }
        if let Some(v) = env_parse("DAILY_SUBMISSION_QUOTA") {
            cfg.daily_submission_quota = v;
        }
        if let Some(v) = env_parse("DAILY_MATCH_LIMIT") {
            cfg.daily_match_limit = v;
        }
        if let Some(v) = env_parse("MATCH_COOLDOWN_SECS") {
            cfg.match_cooldown = Duration::from_secs(v);
        }
        if let Ok(v) = std::env::var("ORCHESTRATOR_NAMESPACE") {
            cfg.orchestrator_namespace = v;
        }
        if let Ok(v) = std::env::var("REGISTRY_URL") {
            cfg.registry_url = v;
        }
        if let Ok(v) = std::env::var("REGISTRY_SECRET") {
            cfg.registry_secret = v;
        }
        if let Ok(v) = std::env::var("LOCAL_CLUSTER") {
            cfg.local_cluster = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("STORAGE_DIR") {
            cfg.storage_dir = v;
        }

        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_platform_policy() {
        let cfg = ArenaConfig::default();
        assert_eq!(cfg.daily_submission_quota, 5);
        assert_eq!(cfg.daily_match_limit, 100);
        assert_eq!(cfg.match_cooldown, Duration::from_secs(300));
        assert_eq!(cfg.matchmaking_interval, Duration::from_secs(30));
    }

    #[test]
    fn default_database_url_is_empty() {
        // Startup treats an empty URL as fatal; the default must not mask it.
        assert!(ArenaConfig::default().database_url.is_empty());
        assert!(ArenaConfig::default().coord_url.is_none());
    }
}
