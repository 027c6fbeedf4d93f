//! Websocket adapter between axum sockets and the notification hub.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use chatlog_notify::{ConnectionMeta, Hub};
use chatlog_scheduler::Scheduler;
use futures::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::state::AppState;

/// Room that receives periodic `stats_update` broadcasts.
pub const QUEUE_STATS_ROOM: &str = "queue_stats";

// ── WebSocket Handler ───────────────────────────────────────────

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let meta = connection_meta(Some(addr), &headers);
    ws.on_upgrade(move |socket| handle_ws(socket, state, meta))
}

fn connection_meta(addr: Option<SocketAddr>, headers: &HeaderMap) -> ConnectionMeta {
    ConnectionMeta {
        peer_addr: addr.map(|a| a.to_string()),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>, meta: ConnectionMeta) {
    let (conn, mut outbound) = match state.hub.connect(meta).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!("Rejecting websocket: {}", e);
            return;
        }
    };
    let (mut sender, mut receiver) = socket.split();

    // Hub events to the socket; ends when the hub drops this connection.
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            if sender.send(Message::Text(event.to_json().into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // Client frames to hub calls.
    let hub = state.hub.clone();
    let reader = conn.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if hub.handle_client_text(&reader, text.as_str()).is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    debug!(conn = %conn, "Websocket closed");
    let _ = state.hub.disconnect(&conn);
}

// ── Stats Ticker ────────────────────────────────────────────────

/// Broadcast queue stats to [`QUEUE_STATS_ROOM`] every `every` until either
/// side stops.
pub fn spawn_stats_ticker(scheduler: Scheduler, hub: Hub, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let Ok(stats) = scheduler.get_queue_stats().await else {
                break;
            };
            let data = match serde_json::to_value(&stats) {
                Ok(data) => data,
                Err(e) => {
                    warn!("Failed to encode queue stats: {}", e);
                    continue;
                }
            };
            if hub.broadcast_to_room(QUEUE_STATS_ROOM, "stats_update", data).is_err() {
                break;
            }
        }
    })
}
