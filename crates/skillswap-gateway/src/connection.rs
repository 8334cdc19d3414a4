use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{info, warn};
use uuid::Uuid;

use skillswap_types::events::{GatewayCommand, NotificationEvent};
use skillswap_types::models::{ConnectionId, UserInfo};

use crate::registry::{ConnectionRegistry, OUTBOUND_QUEUE_CAPACITY};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const MAX_MISSED_PONGS: u8 = 2;

/// Unregisters the connection and stops its tasks when dropped, so cleanup
/// (and the offline broadcast for a user's last connection) also happens on
/// network drops, heartbeat timeouts and cancelled handlers.
struct ConnectionGuard {
    registry: ConnectionRegistry,
    connection_id: ConnectionId,
    tasks: Vec<AbortHandle>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.registry.unregister(self.connection_id);
    }
}

/// Serve a WebSocket whose identity was already verified at the HTTP upgrade.
///
/// Order matters: the presence feed is subscribed before the snapshot is
/// taken so no transition falls between the two, and the connection is
/// registered (possibly broadcasting `UserOnline`) only after the client has
/// its backfill.
pub async fn handle_connection(socket: WebSocket, registry: ConnectionRegistry, identity: UserInfo) {
    let (mut sender, receiver) = socket.split();
    let user_id = identity.user_id;
    let connection_id = Uuid::new_v4();

    info!("{} ({}) connected to gateway", identity.display_name, user_id);

    let ready = NotificationEvent::Ready {
        user: identity.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    let presence = registry.presence().clone();
    let feed = presence.subscribe(user_id);
    let snapshot = NotificationEvent::PresenceSnapshot {
        users: presence.snapshot_for(user_id),
    };
    if send_event(&mut sender, &snapshot).await.is_err() {
        return;
    }

    let (tx, user_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    registry.register(user_id, connection_id, identity.clone(), tx);
    let mut guard = ConnectionGuard {
        registry: registry.clone(),
        connection_id,
        tasks: Vec::new(),
    };

    let pong_received = Arc::new(AtomicBool::new(true));

    let mut send_task = tokio::spawn(run_send_loop(sender, feed, user_rx, pong_received.clone()));
    let mut recv_task = tokio::spawn(run_recv_loop(
        receiver,
        registry,
        connection_id,
        identity.clone(),
        pong_received,
    ));
    guard.tasks.push(send_task.abort_handle());
    guard.tasks.push(recv_task.abort_handle());

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    drop(guard);
    info!("{} ({}) disconnected from gateway", identity.display_name, user_id);
}

/// Forward presence broadcasts and targeted events to the client, with heartbeat.
async fn run_send_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut feed: crate::presence::PresenceFeed,
    mut user_rx: mpsc::Receiver<NotificationEvent>,
    pong_received: Arc<AtomicBool>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            event = feed.recv() => {
                let Some(event) = event else { break };
                if send_event(&mut sender, &event).await.is_err() {
                    break;
                }
            }
            event = user_rx.recv() => {
                // Queue closed: unregistered or registry shut down
                let Some(event) = event else { break };
                if send_event(&mut sender, &event).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if pong_received.swap(false, Ordering::Acquire) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= MAX_MISSED_PONGS {
                        warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                        break;
                    }
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sender.close().await;
}

/// Read commands from the client until it closes or the stream errors.
async fn run_recv_loop(
    mut receiver: SplitStream<WebSocket>,
    registry: ConnectionRegistry,
    connection_id: ConnectionId,
    identity: UserInfo,
    pong_received: Arc<AtomicBool>,
) {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                Ok(GatewayCommand::Heartbeat) => {
                    registry.heartbeat(connection_id);
                }
                Err(e) => {
                    warn!(
                        "{} ({}) bad command: {} -- raw: {}",
                        identity.display_name,
                        identity.user_id,
                        e,
                        text.chars().take(200).collect::<String>()
                    );
                }
            },
            Message::Pong(_) => {
                pong_received.store(true, Ordering::Release);
                registry.heartbeat(connection_id);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &NotificationEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to serialize {}: {}", event.name(), e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}
