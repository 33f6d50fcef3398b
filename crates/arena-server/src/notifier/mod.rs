//! Realtime notifier.
//!
//! [`hub`] owns the mapping from user id to the single live client and fans
//! out build/match status messages; [`pumps`] runs the per-connection read
//! and write loops over any byte transport carrying newline-delimited JSON
//! frames.

mod hub;
mod pumps;

pub use hub::{BuildStatusPayload, Frame, Hub, HubHandle, MatchStatusPayload};
pub use pumps::{serve_connection, ConnectionConfig};
