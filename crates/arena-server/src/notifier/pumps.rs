//! Per-connection read and write pumps.
//!
//! The wire is newline-delimited JSON frames over any `AsyncRead`/
//! `AsyncWrite` transport (the socket upgrade itself lives in the API
//! layer). The write pump drains the client's outbound buffer under a
//! per-write deadline and emits periodic heartbeats; the read pump enforces
//! a liveness deadline refreshed by any inbound traffic.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use super::hub::{Frame, HubHandle};

/// Connection timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    /// Deadline for one outbound write.
    pub write_deadline: Duration,
    /// Interval between outbound heartbeats.
    pub heartbeat_interval: Duration,
    /// Inbound silence tolerated before the connection is considered dead.
    pub liveness_deadline: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            write_deadline: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(54),
            liveness_deadline: Duration::from_secs(60),
        }
    }
}

/// Drain `outbound` into `writer` until the buffer closes or a write
/// fails/times out.
pub async fn write_pump<W: AsyncWrite + Unpin>(
    mut outbound: mpsc::Receiver<Frame>,
    mut writer: W,
    config: ConnectionConfig,
) {
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.tick().await; // Skip first immediate tick

    loop {
        tokio::select! {
            maybe = outbound.recv() => {
                let Some(frame) = maybe else {
                    // Hub closed the buffer (unregister or replacement).
                    return;
                };
                if write_frame(&mut writer, &frame, config.write_deadline).await.is_err() {
                    return;
                }
            }
            _ = heartbeat.tick() => {
                let ping = Frame {
                    frame_type: "ping".to_string(),
                    payload: serde_json::Value::Null,
                };
                if write_frame(&mut writer, &ping, config.write_deadline).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
    deadline: Duration,
) -> Result<(), ()> {
    let mut line = match serde_json::to_vec(frame) {
        Ok(line) => line,
        Err(e) => {
            debug!(error = %e, "dropping unserializable frame");
            return Ok(());
        }
    };
    line.push(b'\n');

    match timeout(deadline, writer.write_all(&line)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "notifier write failed");
            Err(())
        }
        Err(_) => {
            debug!("notifier write deadline exceeded");
            Err(())
        }
    }
}

/// Consume inbound lines until the peer goes silent past the liveness
/// deadline or the transport closes. Inbound content is ignored; traffic
/// only proves the peer is alive.
pub async fn read_pump<R: AsyncRead + Unpin>(reader: R, config: ConnectionConfig) {
    let mut lines = BufReader::new(reader).lines();

    loop {
        match timeout(config.liveness_deadline, lines.next_line()).await {
            Ok(Ok(Some(_line))) => {}
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                debug!(error = %e, "notifier read failed");
                return;
            }
            Err(_) => {
                debug!("notifier liveness deadline exceeded");
                return;
            }
        }
    }
}

/// Register a client for `user_id` and run both pumps until either side
/// ends, then unregister.
pub async fn serve_connection<R, W>(
    hub: &HubHandle,
    user_id: &str,
    reader: R,
    writer: W,
    config: ConnectionConfig,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (client_id, outbound) = hub.register(user_id).await;

    let write_task = tokio::spawn(write_pump(outbound, writer, config));
    read_pump(reader, config).await;

    hub.unregister(user_id, &client_id).await;
    // Unregistering drops the hub's sender; the write pump drains and ends.
    let _ = write_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::hub::Hub;
    use tokio::io::AsyncReadExt;
    use tokio::sync::watch;

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            write_deadline: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(50),
            liveness_deadline: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn write_pump_emits_frames_as_json_lines() {
        let (tx, rx) = mpsc::channel(8);
        let (client, mut server) = tokio::io::duplex(4096);

        tx.send(Frame {
            frame_type: "build_status".into(),
            payload: serde_json::json!({"submissionId": "s1"}),
        })
        .await
        .unwrap();
        drop(tx);

        write_pump(rx, client, ConnectionConfig::default()).await;

        let mut out = String::new();
        server.read_to_string(&mut out).await.unwrap();
        let line = out.lines().next().unwrap();
        let frame: Frame = serde_json::from_str(line).unwrap();
        assert_eq!(frame.frame_type, "build_status");
    }

    #[tokio::test]
    async fn write_pump_sends_heartbeats() {
        let (_tx, rx) = mpsc::channel::<Frame>(8);
        let (client, mut server) = tokio::io::duplex(4096);

        let pump = tokio::spawn(write_pump(rx, client, fast_config()));

        let mut buf = vec![0u8; 256];
        let n = server.read(&mut buf).await.unwrap();
        let line = String::from_utf8_lossy(&buf[..n]);
        assert!(line.contains("\"ping\""));

        pump.abort();
    }

    #[tokio::test]
    async fn read_pump_ends_on_silence() {
        let (_client, server) = tokio::io::duplex(64);

        let started = tokio::time::Instant::now();
        read_pump(server, fast_config()).await;
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn serve_connection_delivers_and_unregisters() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (hub, _task) = Hub::spawn(8, shutdown_rx);

        let (mut peer_write, server_read) = tokio::io::duplex(4096);
        let (server_write, mut peer_read) = tokio::io::duplex(4096);

        let hub_clone = hub.clone();
        let conn = tokio::spawn(async move {
            serve_connection(&hub_clone, "u1", server_read, server_write, fast_config()).await;
        });

        // Let the connection register, then push a message through the hub.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.client_count().await, 1);
        hub.send_to_user("u1", "match_status", serde_json::json!({"matchId": "m1"}))
            .await;

        let mut buf = vec![0u8; 512];
        let n = peer_read.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).contains("match_status"));

        // Peer disconnects; the connection unregisters itself.
        drop(peer_write);
        conn.await.unwrap();
        assert_eq!(hub.client_count().await, 0);
    }
}
