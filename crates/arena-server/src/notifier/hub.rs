//! Notifier hub: user-addressed and broadcast fan-out to live clients.
//!
//! All hub state lives inside a single owning loop task; registration,
//! unregistration, and sends arrive as commands on one channel, so message
//! delivery for a user is serialized and FIFO. Each client has a bounded
//! outbound buffer: a re-register closes and replaces the previous client,
//! and a client whose buffer is full is unregistered rather than allowed to
//! block everyone else.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

/// One wire frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub payload: Value,
}

/// Canonical build-status payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatusPayload {
    pub submission_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_url: String,
}

/// Canonical match-status payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStatusPayload {
    pub match_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent1_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent2_score: Option<f64>,
}

struct Client {
    client_id: String,
    tx: mpsc::Sender<Frame>,
}

enum HubCommand {
    Register {
        user_id: String,
        client_id: String,
        tx: mpsc::Sender<Frame>,
    },
    Unregister {
        user_id: String,
        client_id: String,
    },
    Send {
        /// `None` broadcasts to every client.
        target: Option<String>,
        frame: Frame,
    },
    ClientCount {
        reply: oneshot::Sender<usize>,
    },
}

/// The notifier hub. Construct with [`Hub::spawn`].
pub struct Hub;

/// Cloneable handle posting commands to the hub loop.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
    buffer: usize,
}

impl Hub {
    /// Spawn the hub loop. `buffer` bounds each client's outbound queue.
    pub fn spawn(
        buffer: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> (HubHandle, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<HubCommand>(256);

        let handle = tokio::spawn(async move {
            let mut clients: HashMap<String, Client> = HashMap::new();

            loop {
                let command = tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(command) => command,
                        None => return,
                    },
                    _ = shutdown.changed() => {
                        info!(clients = clients.len(), "notifier hub shutting down");
                        return;
                    }
                };

                match command {
                    HubCommand::Register {
                        user_id,
                        client_id,
                        tx,
                    } => {
                        // Dropping the old sender closes the old client's
                        // buffer, which ends its write pump.
                        if clients
                            .insert(user_id.clone(), Client { client_id, tx })
                            .is_some()
                        {
                            info!(user_id = %user_id, "replaced existing notifier connection");
                        } else {
                            info!(user_id = %user_id, total = clients.len(), "notifier client registered");
                        }
                    }
                    HubCommand::Unregister { user_id, client_id } => {
                        // Only the current client may unregister itself; a
                        // replaced connection's late unregister is a no-op.
                        if clients.get(&user_id).is_some_and(|c| c.client_id == client_id) {
                            clients.remove(&user_id);
                            info!(user_id = %user_id, total = clients.len(), "notifier client unregistered");
                        }
                    }
                    HubCommand::Send { target, frame } => match target {
                        Some(user_id) => {
                            if let Some(client) = clients.get(&user_id) {
                                if client.tx.try_send(frame).is_err() {
                                    warn!(user_id = %user_id, "client buffer full, unregistering slow consumer");
                                    clients.remove(&user_id);
                                }
                            }
                            // No client for the user: drop the message.
                        }
                        None => {
                            let mut slow = Vec::new();
                            for (user_id, client) in &clients {
                                if client.tx.try_send(frame.clone()).is_err() {
                                    warn!(user_id = %user_id, "client buffer full, unregistering slow consumer");
                                    slow.push(user_id.clone());
                                }
                            }
                            for user_id in slow {
                                clients.remove(&user_id);
                            }
                        }
                    },
                    HubCommand::ClientCount { reply } => {
                        let _ = reply.send(clients.len());
                    }
                }
            }
        });

        (HubHandle { tx, buffer }, handle)
    }
}

impl HubHandle {
    /// Register a client for a user, replacing any existing one. Returns
    /// the client id and the outbound frame buffer to drain.
    pub async fn register(&self, user_id: &str) -> (String, mpsc::Receiver<Frame>) {
        let client_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.buffer);

        let _ = self
            .tx
            .send(HubCommand::Register {
                user_id: user_id.to_string(),
                client_id: client_id.clone(),
                tx,
            })
            .await;

        (client_id, rx)
    }

    /// Unregister a client; a no-op when the client was already replaced.
    pub async fn unregister(&self, user_id: &str, client_id: &str) {
        let _ = self
            .tx
            .send(HubCommand::Unregister {
                user_id: user_id.to_string(),
                client_id: client_id.to_string(),
            })
            .await;
    }

    /// Send a typed message to one user, at most once, dropped when the
    /// user has no live client.
    pub async fn send_to_user(&self, user_id: &str, frame_type: &str, payload: Value) {
        let _ = self
            .tx
            .send(HubCommand::Send {
                target: Some(user_id.to_string()),
                frame: Frame {
                    frame_type: frame_type.to_string(),
                    payload,
                },
            })
            .await;
    }

    /// Fan a typed message out to every live client.
    pub async fn broadcast(&self, frame_type: &str, payload: Value) {
        let _ = self
            .tx
            .send(HubCommand::Send {
                target: None,
                frame: Frame {
                    frame_type: frame_type.to_string(),
                    payload,
                },
            })
            .await;
    }

    /// Build-status notification to the owning user.
    pub async fn send_build_status(&self, user_id: &str, payload: BuildStatusPayload) {
        let payload = serde_json::to_value(payload).unwrap_or(Value::Null);
        self.send_to_user(user_id, "build_status", payload).await;
    }

    /// Match-status notification to the owning user.
    pub async fn send_match_status(&self, user_id: &str, payload: MatchStatusPayload) {
        let payload = serde_json::to_value(payload).unwrap_or(Value::Null);
        self.send_to_user(user_id, "match_status", payload).await;
    }

    /// Number of live clients (diagnostics and tests).
    pub async fn client_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(HubCommand::ClientCount { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
