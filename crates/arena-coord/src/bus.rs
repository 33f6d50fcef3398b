//! Matchmaking event bus.
//!
//! Fan-out channel carrying `agent_enqueued` and `matching_requested`
//! events between the enqueue paths and the matching drivers. Events are
//! advisory: the per-environment lease is what serializes matching passes,
//! so a dropped or duplicated event costs latency, never correctness.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use arena_core::db::unix_timestamp;

/// Channel name, kept from the coordination-store key namespace.
pub const EVENT_CHANNEL: &str = "matchmaking:events";

/// Matchmaking event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentEnqueued,
    MatchingRequested,
}

/// One matchmaking event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchmakingEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub environment_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub timestamp: i64,
}

/// Publish/subscribe bus for matchmaking events.
#[derive(Clone)]
pub struct MatchmakingBus {
    tx: broadcast::Sender<MatchmakingEvent>,
}

impl MatchmakingBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to every current subscriber. Returns the number of
    /// subscribers that will observe it; zero subscribers is not an error.
    pub fn publish(&self, mut event: MatchmakingEvent) -> usize {
        if event.timestamp == 0 {
            event.timestamp = unix_timestamp();
        }

        debug!(
            event_type = ?event.event_type,
            environment_id = %event.environment_id,
            channel = EVENT_CHANNEL,
            "publishing matchmaking event"
        );
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MatchmakingEvent> {
        self.tx.subscribe()
    }

    /// Announce that an agent entered the queue for an environment.
    pub fn notify_agent_enqueued(&self, environment_id: &str, agent_id: &str) -> usize {
        self.publish(MatchmakingEvent {
            event_type: EventType::AgentEnqueued,
            environment_id: environment_id.to_string(),
            agent_id: Some(agent_id.to_string()),
            timestamp: 0,
        })
    }

    /// Request a matching pass on an environment (periodic trigger).
    pub fn notify_matching_requested(&self, environment_id: &str) -> usize {
        self.publish(MatchmakingEvent {
            event_type: EventType::MatchingRequested,
            environment_id: environment_id.to_string(),
            agent_id: None,
            timestamp: 0,
        })
    }
}

impl Default for MatchmakingBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = MatchmakingBus::new(16);
        let mut rx = bus.subscribe();

        bus.notify_agent_enqueued("pong", "agent-1");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::AgentEnqueued);
        assert_eq!(event.environment_id, "pong");
        assert_eq!(event.agent_id.as_deref(), Some("agent-1"));
        assert!(event.timestamp > 0);
    }

    #[tokio::test]
    async fn every_subscriber_sees_the_event() {
        let bus = MatchmakingBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.notify_matching_requested("pong"), 2);

        assert_eq!(rx1.recv().await.unwrap().event_type, EventType::MatchingRequested);
        assert_eq!(rx2.recv().await.unwrap().event_type, EventType::MatchingRequested);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = MatchmakingBus::new(16);
        assert_eq!(bus.notify_matching_requested("pong"), 0);
    }

    #[test]
    fn event_wire_shape_is_stable() {
        let event = MatchmakingEvent {
            event_type: EventType::AgentEnqueued,
            environment_id: "pong".into(),
            agent_id: Some("a1".into()),
            timestamp: 1_700_000_000,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "agent_enqueued");
        assert_eq!(json["environment_id"], "pong");
        assert_eq!(json["agent_id"], "a1");

        let trigger = MatchmakingEvent {
            event_type: EventType::MatchingRequested,
            environment_id: "pong".into(),
            agent_id: None,
            timestamp: 1_700_000_000,
        };
        let json = serde_json::to_value(&trigger).unwrap();
        assert_eq!(json["type"], "matching_requested");
        assert!(json.get("agent_id").is_none());
    }
}
