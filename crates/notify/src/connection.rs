use std::collections::HashSet;
use std::time::Duration;

use chatlog_core::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

use crate::protocol::ServerEvent;

/// Opaque connection identifier (v4 UUID string).
pub type ConnectionId = String;

/// Transport details recorded at connect time, for stats only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMeta {
    pub peer_addr: Option<String>,
    pub user_agent: Option<String>,
}

/// Outcome of pushing one event to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Sent,
    /// Outbound queue full; this event was dropped for this connection.
    Dropped,
    /// Receiver gone; the connection should be removed.
    Closed,
}

/// One observer as seen by the hub.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) meta: ConnectionMeta,
    pub(crate) connected_at: DateTime<Utc>,
    pub(crate) last_heartbeat: Instant,
    pub(crate) tasks: HashSet<TaskId>,
    pub(crate) rooms: HashSet<String>,
    outbound: mpsc::Sender<ServerEvent>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        meta: ConnectionMeta,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Self {
        Self {
            id,
            meta,
            connected_at: Utc::now(),
            last_heartbeat: Instant::now(),
            tasks: HashSet::new(),
            rooms: HashSet::new(),
            outbound,
        }
    }

    /// Non-blocking push onto the outbound queue.
    pub(crate) fn push(&self, event: ServerEvent) -> Delivery {
        match self.outbound.try_send(event) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    pub(crate) fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat) > threshold
    }

    pub(crate) fn summary(&self) -> ClientSummary {
        ClientSummary {
            session_id: format!("{}...", self.id.chars().take(8).collect::<String>()),
            connected_at: self.connected_at,
            peer_addr: self.meta.peer_addr.clone(),
            user_agent: self.meta.user_agent.clone(),
            subscribed_tasks_count: self.tasks.len(),
            subscribed_rooms_count: self.rooms.len(),
        }
    }
}

/// Per-connection entry in [`HubStats`](crate::HubStats). The id is truncated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSummary {
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
    pub peer_addr: Option<String>,
    pub user_agent: Option<String>,
    pub subscribed_tasks_count: usize,
    pub subscribed_rooms_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(buffer: usize) -> (Connection, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        let meta = ConnectionMeta {
            peer_addr: Some("10.0.0.7:51234".into()),
            user_agent: None,
        };
        (Connection::new("0123456789abcdef".into(), meta, tx), rx)
    }

    #[tokio::test]
    async fn push_reports_full_and_closed() {
        let (conn, rx) = connection(1);
        assert_eq!(conn.push(ServerEvent::error("one")), Delivery::Sent);
        assert_eq!(conn.push(ServerEvent::error("two")), Delivery::Dropped);
        drop(rx);
        assert_eq!(conn.push(ServerEvent::error("three")), Delivery::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn staleness_uses_heartbeat_age() {
        let (mut conn, _rx) = connection(4);
        let threshold = Duration::from_secs(60);
        assert!(!conn.is_stale(Instant::now(), threshold));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(conn.is_stale(Instant::now(), threshold));

        conn.last_heartbeat = Instant::now();
        assert!(!conn.is_stale(Instant::now(), threshold));
    }

    #[tokio::test]
    async fn summary_truncates_id() {
        let (mut conn, _rx) = connection(4);
        conn.tasks.insert("t1".into());
        let summary = conn.summary();
        assert_eq!(summary.session_id, "01234567...");
        assert_eq!(summary.peer_addr.as_deref(), Some("10.0.0.7:51234"));
        assert_eq!(summary.subscribed_tasks_count, 1);
        assert_eq!(summary.subscribed_rooms_count, 0);
    }
}
