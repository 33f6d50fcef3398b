//! Submission build pipeline: job dispatch and completion monitoring.

mod dispatcher;
mod monitor;

pub use dispatcher::{BuildConfig, BuildDispatcher};
pub use monitor::BuildMonitor;
