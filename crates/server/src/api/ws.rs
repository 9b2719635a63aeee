//! WebSocket support for live scheduler status.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use terrapipe_core::{SchedulerStatus, UiObserver};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_LAG_EVENTS, WS_MESSAGES_SENT};
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// WebSocket message sent to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Every scheduler status that changed during one processing pass.
    StatusBatch { statuses: Vec<SchedulerStatus> },
    /// Server heartbeat (sent periodically to keep connection alive).
    Heartbeat { timestamp: i64 },
}

impl WsMessage {
    fn kind(&self) -> &'static str {
        match self {
            WsMessage::StatusBatch { .. } => "status_batch",
            WsMessage::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Fans orchestrator status batches out to connected clients.
#[derive(Debug, Clone)]
pub struct WsBroadcaster {
    sender: broadcast::Sender<WsMessage>,
}

impl WsBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn broadcast(&self, msg: WsMessage) {
        // No receivers is fine.
        let _ = self.sender.send(msg);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsMessage> {
        self.sender.subscribe()
    }
}

impl Default for WsBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

impl UiObserver for WsBroadcaster {
    fn on_status_changed(&self, statuses: &[SchedulerStatus]) {
        self.broadcast(WsMessage::StatusBatch {
            statuses: statuses.to_vec(),
        });
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle a single WebSocket connection.
///
/// The client first receives a batch with every live scheduler, then each
/// batch the orchestrator publishes.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let mut rx = state.ws_broadcaster().subscribe();
    let snapshot = WsMessage::StatusBatch {
        statuses: state.orchestrator().get_scheduler_statuses(),
    };

    WS_CONNECTIONS_TOTAL.inc();
    WS_CONNECTIONS_ACTIVE.inc();
    info!("WebSocket client connected");

    let send_task = tokio::spawn(async move {
        if !send(&mut sender, &snapshot).await {
            return;
        }
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;

        loop {
            let msg = tokio::select! {
                result = rx.recv() => match result {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket client lagged, skipped {} messages", n);
                        WS_LAG_EVENTS.inc();
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                },
                _ = heartbeat.tick() => WsMessage::Heartbeat {
                    timestamp: chrono::Utc::now().timestamp(),
                },
            };
            if !send(&mut sender, &msg).await {
                break;
            }
        }
    });

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Close(_)) => {
                debug!("WebSocket client requested close");
                break;
            }
            Ok(Message::Text(text)) => {
                debug!("Received text message: {}", text);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket receive error: {}", e);
                break;
            }
        }
    }

    send_task.abort();
    WS_CONNECTIONS_ACTIVE.dec();
    info!("WebSocket client disconnected");
}

/// Returns false once the client is gone.
async fn send<S>(sender: &mut S, msg: &WsMessage) -> bool
where
    S: SinkExt<Message> + Unpin,
{
    WS_MESSAGES_SENT.with_label_values(&[msg.kind()]).inc();
    match serde_json::to_string(msg) {
        Ok(json) => {
            if sender.send(Message::Text(json.into())).await.is_err() {
                debug!("WebSocket send failed, client disconnected");
                return false;
            }
            true
        }
        Err(e) => {
            error!("Failed to serialize WsMessage: {}", e);
            true
        }
    }
}
