//! Skill-based matchmaking.

mod service;

pub use service::{Enqueuer, MatchmakingConfig, MatchmakingEngine};
