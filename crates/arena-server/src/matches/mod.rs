//! Match coordination: execution dispatch, result application, ratings.

pub mod elo;
mod service;

pub use service::MatchService;
