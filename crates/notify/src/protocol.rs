//! Websocket wire protocol.
//!
//! Every frame in either direction is a JSON text frame shaped
//! `{"type": "<event>", "data": {...}}`.

use chatlog_core::{TaskId, TaskResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::connection::ConnectionId;
use crate::error::HubError;

// ── Client → server ─────────────────────────────────────────────

/// A parsed client frame.
///
/// Missing `task_id` / `room` fields parse as empty strings; the hub answers
/// those with an `error` event rather than rejecting the frame here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    SubscribeTask { task_id: TaskId },
    UnsubscribeTask { task_id: TaskId },
    JoinRoom { room: String },
    LeaveRoom { room: String },
    Heartbeat,
    GetStats,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, HubError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| HubError::InvalidMessage(e.to_string()))?;
        let field = |name: &str| {
            envelope
                .data
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        match envelope.kind.as_str() {
            "subscribe_task" => Ok(Self::SubscribeTask { task_id: field("task_id") }),
            "unsubscribe_task" => Ok(Self::UnsubscribeTask { task_id: field("task_id") }),
            "join_room" => Ok(Self::JoinRoom { room: field("room") }),
            "leave_room" => Ok(Self::LeaveRoom { room: field("room") }),
            "heartbeat" => Ok(Self::Heartbeat),
            "get_stats" => Ok(Self::GetStats),
            other => Err(HubError::InvalidMessage(format!("unknown message type '{other}'"))),
        }
    }
}

// ── Server → client ─────────────────────────────────────────────

/// Body of a `notification` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ConnectionConfirmed {
        session_id: ConnectionId,
        server_time: DateTime<Utc>,
        message: String,
    },
    TaskStatusUpdate {
        task_id: TaskId,
        status: Box<TaskResult>,
        timestamp: DateTime<Utc>,
    },
    Notification(NotificationPayload),
    StatsUpdate(Value),
    TaskSubscribed { task_id: TaskId },
    TaskUnsubscribed { task_id: TaskId },
    RoomJoined { room: String },
    RoomLeft { room: String },
    HeartbeatAck {
        timestamp: DateTime<Utc>,
        session_id: ConnectionId,
    },
    Error { message: String },
    ServerShutdown {
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// Arbitrary event broadcast to a room.
    Room { event: String, data: Value },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }

    pub fn task_status(result: TaskResult) -> Self {
        Self::TaskStatusUpdate {
            task_id: result.task_id.clone(),
            status: Box::new(result),
            timestamp: Utc::now(),
        }
    }

    /// Event name carried in the `type` field.
    pub fn name(&self) -> &str {
        match self {
            Self::ConnectionConfirmed { .. } => "connection_confirmed",
            Self::TaskStatusUpdate { .. } => "task_status_update",
            Self::Notification(_) => "notification",
            Self::StatsUpdate(_) => "stats_update",
            Self::TaskSubscribed { .. } => "task_subscribed",
            Self::TaskUnsubscribed { .. } => "task_unsubscribed",
            Self::RoomJoined { .. } => "room_joined",
            Self::RoomLeft { .. } => "room_left",
            Self::HeartbeatAck { .. } => "heartbeat_ack",
            Self::Error { .. } => "error",
            Self::ServerShutdown { .. } => "server_shutdown",
            Self::Room { event, .. } => event.as_str(),
        }
    }

    /// Body carried in the `data` field.
    pub fn data(&self) -> Value {
        match self {
            Self::ConnectionConfirmed {
                session_id,
                server_time,
                message,
            } => json!({
                "session_id": session_id,
                "server_time": server_time,
                "message": message,
            }),
            Self::TaskStatusUpdate {
                task_id,
                status,
                timestamp,
            } => json!({
                "task_id": task_id,
                "status": status,
                "timestamp": timestamp,
            }),
            Self::Notification(payload) => serde_json::to_value(payload).unwrap_or_default(),
            Self::StatsUpdate(stats) => stats.clone(),
            Self::TaskSubscribed { task_id } => json!({
                "task_id": task_id,
                "message": format!("Subscribed to task {task_id}"),
            }),
            Self::TaskUnsubscribed { task_id } => json!({
                "task_id": task_id,
                "message": format!("Unsubscribed from task {task_id}"),
            }),
            Self::RoomJoined { room } => json!({
                "room": room,
                "message": format!("Joined room {room}"),
            }),
            Self::RoomLeft { room } => json!({
                "room": room,
                "message": format!("Left room {room}"),
            }),
            Self::HeartbeatAck {
                timestamp,
                session_id,
            } => json!({ "timestamp": timestamp, "session_id": session_id }),
            Self::Error { message } => json!({ "message": message }),
            Self::ServerShutdown { message, timestamp } => {
                json!({ "message": message, "timestamp": timestamp })
            }
            Self::Room { data, .. } => data.clone(),
        }
    }

    /// Serialize into the `{"type", "data"}` envelope.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&WsMessage {
            msg_type: self.name(),
            data: self.data(),
        })
        .unwrap_or_default()
    }
}

#[derive(Serialize)]
struct WsMessage<'a> {
    #[serde(rename = "type")]
    msg_type: &'a str,
    data: Value,
}
