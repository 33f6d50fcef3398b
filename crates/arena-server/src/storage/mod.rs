//! Storage layer for the arena control plane.
//!
//! `Database` wraps the SQLite pool; typed query methods are grouped per
//! entity in the `queries_*` modules. Multi-statement writes (submission
//! activation, match completion) run inside explicit transactions here so
//! services never see partially applied state.

mod db;
mod models;
mod queries_agents;
mod queries_matches;
mod queries_matchmaking;
mod queries_stats;
mod queries_submissions;
mod queries_users;

pub use db::{Database, DatabaseError};
pub use models::*;
pub use queries_matches::CompletedMatch;
