use std::sync::Arc;

use chatlog_core::{HubConfig, StatusSource, TaskEvent, TaskId, TaskResult};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::{Connection, ConnectionId, ConnectionMeta};
use crate::error::HubError;
use crate::protocol::{ClientMessage, NotificationPayload, ServerEvent};
use crate::registry::{HubStats, Registry};

enum HubCommand {
    Connect {
        meta: ConnectionMeta,
        reply: oneshot::Sender<(ConnectionId, mpsc::Receiver<ServerEvent>)>,
    },
    Disconnect(ConnectionId),
    Client {
        conn: ConnectionId,
        message: ClientMessage,
    },
    /// A client frame that failed to parse.
    Malformed {
        conn: ConnectionId,
        reason: String,
    },
    Room {
        room: String,
        event: String,
        data: Value,
    },
    Notify {
        conn: ConnectionId,
        payload: NotificationPayload,
    },
    TaskUpdate(Box<TaskEvent>),
    Stats(oneshot::Sender<HubStats>),
    Shutdown(oneshot::Sender<()>),
}

/// A finished initial-status lookup for a new subscription.
struct Snapshot {
    conn: ConnectionId,
    task_id: TaskId,
    status: Option<TaskResult>,
}

/// Handle to the notification hub.
///
/// Routes task status updates to the connections subscribed to them and
/// named events to room members. Cheap to clone; all subscription state
/// lives in the hub's coordinating flow.
#[derive(Clone)]
pub struct Hub {
    config: HubConfig,
    commands: mpsc::UnboundedSender<HubCommand>,
}

impl Hub {
    /// Spawn the hub. `source` answers the initial status lookup made when
    /// a connection subscribes to a task.
    pub fn start(config: HubConfig, source: Arc<dyn StatusSource>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let flow = HubFlow {
            config: config.clone(),
            commands: rx,
            registry: Registry::new(),
            source,
            lookups: FuturesUnordered::new(),
        };
        tokio::spawn(flow.run());
        info!(
            stale_threshold_secs = config.stale_threshold_secs,
            outbound_buffer = config.outbound_buffer,
            "Notification hub started"
        );
        Self { config, commands }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Register a new connection. The returned receiver yields every event
    /// addressed to it, starting with `connection_confirmed`.
    pub async fn connect(
        &self,
        meta: ConnectionMeta,
    ) -> Result<(ConnectionId, mpsc::Receiver<ServerEvent>), HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Connect { meta, reply })?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    pub fn disconnect(&self, conn: &str) -> Result<(), HubError> {
        self.send(HubCommand::Disconnect(conn.to_string()))
    }

    pub fn subscribe_task(&self, conn: &str, task_id: &str) -> Result<(), HubError> {
        self.handle_client_message(
            conn,
            ClientMessage::SubscribeTask {
                task_id: task_id.to_string(),
            },
        )
    }

    pub fn unsubscribe_task(&self, conn: &str, task_id: &str) -> Result<(), HubError> {
        self.handle_client_message(
            conn,
            ClientMessage::UnsubscribeTask {
                task_id: task_id.to_string(),
            },
        )
    }

    pub fn join_room(&self, conn: &str, room: &str) -> Result<(), HubError> {
        self.handle_client_message(conn, ClientMessage::JoinRoom { room: room.to_string() })
    }

    pub fn leave_room(&self, conn: &str, room: &str) -> Result<(), HubError> {
        self.handle_client_message(conn, ClientMessage::LeaveRoom { room: room.to_string() })
    }

    pub fn heartbeat(&self, conn: &str) -> Result<(), HubError> {
        self.handle_client_message(conn, ClientMessage::Heartbeat)
    }

    pub fn handle_client_message(
        &self,
        conn: &str,
        message: ClientMessage,
    ) -> Result<(), HubError> {
        self.send(HubCommand::Client {
            conn: conn.to_string(),
            message,
        })
    }

    /// Parse a raw client frame and apply it. A malformed frame is answered
    /// with an `error` event to that connection; the connection stays open.
    pub fn handle_client_text(&self, conn: &str, text: &str) -> Result<(), HubError> {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle_client_message(conn, message),
            Err(err) => self.send(HubCommand::Malformed {
                conn: conn.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    /// Push a named event to every member of `room`.
    pub fn broadcast_to_room(&self, room: &str, event: &str, data: Value) -> Result<(), HubError> {
        self.send(HubCommand::Room {
            room: room.to_string(),
            event: event.to_string(),
            data,
        })
    }

    /// Push a `notification` event to a single connection.
    pub fn send_notification(
        &self,
        conn: &str,
        kind: &str,
        title: &str,
        message: &str,
        data: Option<Value>,
    ) -> Result<(), HubError> {
        let payload = NotificationPayload {
            kind: kind.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            data: data.unwrap_or_else(|| Value::Object(Default::default())),
            timestamp: Utc::now(),
        };
        self.send(HubCommand::Notify {
            conn: conn.to_string(),
            payload,
        })
    }

    /// Forward a task transition to the task's subscribers.
    pub fn notify_task_update(&self, event: TaskEvent) -> Result<(), HubError> {
        self.send(HubCommand::TaskUpdate(Box::new(event)))
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats(reply))?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    /// Forward every event from a lossless scheduler feed into the hub until
    /// either side goes away.
    pub fn spawn_status_bridge(
        &self,
        mut events: mpsc::UnboundedReceiver<TaskEvent>,
    ) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if hub.notify_task_update(event).is_err() {
                    break;
                }
            }
            debug!("Status bridge stopped");
        })
    }

    /// Send `server_shutdown` to every connection and drop them all.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(HubCommand::Shutdown(reply)).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands.send(command).map_err(|_| HubError::Stopped)
    }
}

struct HubFlow {
    config: HubConfig,
    commands: mpsc::UnboundedReceiver<HubCommand>,
    registry: Registry,
    source: Arc<dyn StatusSource>,
    lookups: FuturesUnordered<BoxFuture<'static, Snapshot>>,
}

impl HubFlow {
    async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_ack = None;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(HubCommand::Shutdown(reply)) => {
                        shutdown_ack = Some(reply);
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some(snapshot) = self.lookups.next(), if !self.lookups.is_empty() => {
                    self.deliver_snapshot(snapshot);
                }
                _ = sweep.tick() => {
                    let stale = self
                        .registry
                        .sweep_stale(Instant::now(), self.config.stale_threshold());
                    if !stale.is_empty() {
                        info!("Removed {} stale connection(s)", stale.len());
                    }
                }
            }
        }

        let event = ServerEvent::ServerShutdown {
            message: "Server is shutting down".to_string(),
            timestamp: Utc::now(),
        };
        let notified = self.registry.drain_with(&event);
        self.commands.close();
        info!("Notification hub shut down ({} connection(s) notified)", notified);
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Connect { meta, reply } => {
                let (conn, rx) = self.connect(meta);
                if reply.send((conn.clone(), rx)).is_err() {
                    self.registry.remove(&conn);
                }
            }
            HubCommand::Disconnect(conn) => {
                if self.registry.remove(&conn).is_some() {
                    info!(conn = %conn, "Client disconnected");
                }
            }
            HubCommand::Client { conn, message } => {
                self.registry.record_received();
                self.apply(conn, message);
            }
            HubCommand::Malformed { conn, reason } => {
                self.registry.record_received();
                debug!(conn = %conn, reason = %reason, "Malformed client message");
                self.registry.deliver(&conn, ServerEvent::error(reason));
            }
            HubCommand::Room { room, event, data } => {
                let sent = self.registry.fan_out_room(&room, &ServerEvent::Room { event, data });
                debug!(room = %room, sent, "Room broadcast");
            }
            HubCommand::Notify { conn, payload } => {
                self.registry.deliver(&conn, ServerEvent::Notification(payload));
            }
            HubCommand::TaskUpdate(event) => {
                let TaskEvent {
                    task_id, status, result, ..
                } = *event;
                let sent = self
                    .registry
                    .fan_out_task(&task_id, &ServerEvent::task_status(result));
                if sent > 0 {
                    debug!(task_id = %task_id, status = %status, sent, "Task update pushed");
                }
            }
            HubCommand::Stats(reply) => {
                let _ = reply.send(self.registry.stats());
            }
            // Handled by the loop.
            HubCommand::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn connect(&mut self, meta: ConnectionMeta) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let conn = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        info!(
            conn = %conn,
            peer = meta.peer_addr.as_deref().unwrap_or("unknown"),
            "Client connected"
        );
        self.registry.insert(Connection::new(conn.clone(), meta, tx));
        self.registry.deliver(
            &conn,
            ServerEvent::ConnectionConfirmed {
                session_id: conn.clone(),
                server_time: Utc::now(),
                message: "Connected to Chatlog notification server".to_string(),
            },
        );
        (conn, rx)
    }

    fn apply(&mut self, conn: ConnectionId, message: ClientMessage) {
        if !self.registry.contains(&conn) {
            debug!(conn = %conn, "Message for unknown connection ignored");
            return;
        }

        match message {
            ClientMessage::SubscribeTask { task_id } => {
                if task_id.is_empty() {
                    self.registry.deliver(&conn, ServerEvent::error("Task ID is required"));
                    return;
                }
                self.registry.subscribe_task(&conn, &task_id);
                self.registry.deliver(
                    &conn,
                    ServerEvent::TaskSubscribed {
                        task_id: task_id.clone(),
                    },
                );
                self.lookup(conn, task_id);
            }
            ClientMessage::UnsubscribeTask { task_id } => {
                if task_id.is_empty() {
                    return;
                }
                self.registry.unsubscribe_task(&conn, &task_id);
                self.registry.deliver(&conn, ServerEvent::TaskUnsubscribed { task_id });
            }
            ClientMessage::JoinRoom { room } => {
                if room.is_empty() {
                    self.registry.deliver(&conn, ServerEvent::error("Room name is required"));
                    return;
                }
                self.registry.join_room(&conn, &room);
                self.registry.deliver(&conn, ServerEvent::RoomJoined { room });
            }
            ClientMessage::LeaveRoom { room } => {
                if room.is_empty() {
                    return;
                }
                self.registry.leave_room(&conn, &room);
                self.registry.deliver(&conn, ServerEvent::RoomLeft { room });
            }
            ClientMessage::Heartbeat => {
                self.registry.touch(&conn, Instant::now());
                self.registry.deliver(
                    &conn,
                    ServerEvent::HeartbeatAck {
                        timestamp: Utc::now(),
                        session_id: conn.clone(),
                    },
                );
            }
            ClientMessage::GetStats => {
                let stats = serde_json::to_value(self.registry.stats()).unwrap_or_default();
                self.registry.deliver(&conn, ServerEvent::StatsUpdate(stats));
            }
        }
    }

    /// Look up the task's current status without blocking the hub.
    fn lookup(&mut self, conn: ConnectionId, task_id: TaskId) {
        let source = Arc::clone(&self.source);
        self.lookups.push(
            async move {
                let status = source.task_status(&task_id).await;
                Snapshot { conn, task_id, status }
            }
            .boxed(),
        );
    }

    fn deliver_snapshot(&mut self, snapshot: Snapshot) {
        let Snapshot { conn, task_id, status } = snapshot;
        if !self.registry.take_snapshot_slot(&conn, &task_id) {
            return;
        }
        match status {
            Some(result) => {
                self.registry.deliver(&conn, ServerEvent::task_status(result));
            }
            None => debug!(conn = %conn, task_id = %task_id, "No status yet for subscribed task"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Fixed status table standing in for the scheduler.
    #[derive(Default)]
    struct FixedSource(HashMap<String, TaskResult>);

    #[async_trait]
    impl StatusSource for FixedSource {
        async fn task_status(&self, task_id: &str) -> Option<TaskResult> {
            self.0.get(task_id).cloned()
        }
    }

    fn hub_with(results: &[TaskResult]) -> Hub {
        let table = results.iter().map(|r| (r.task_id.clone(), r.clone())).collect();
        Hub::start(HubConfig::default(), Arc::new(FixedSource(table)))
    }

    async fn next(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("connection closed")
    }

    #[tokio::test]
    async fn connect_confirms_with_session_id() {
        let hub = hub_with(&[]);
        let (conn, mut rx) = hub.connect(ConnectionMeta::default()).await.unwrap();

        match next(&mut rx).await {
            ServerEvent::ConnectionConfirmed { session_id, .. } => assert_eq!(session_id, conn),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(hub.stats().await.unwrap().current_connections, 1);
    }

    #[tokio::test]
    async fn subscribe_acks_then_pushes_current_status() {
        let hub = hub_with(&[TaskResult::pending("t1", "demo")]);
        let (conn, mut rx) = hub.connect(ConnectionMeta::default()).await.unwrap();
        next(&mut rx).await;

        hub.subscribe_task(&conn, "t1").unwrap();
        assert_eq!(next(&mut rx).await, ServerEvent::TaskSubscribed { task_id: "t1".into() });
        match next(&mut rx).await {
            ServerEvent::TaskStatusUpdate { task_id, status, .. } => {
                assert_eq!(task_id, "t1");
                assert_eq!(status.task_type, "demo");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_ids_and_garbage_produce_errors() {
        let hub = hub_with(&[]);
        let (conn, mut rx) = hub.connect(ConnectionMeta::default()).await.unwrap();
        next(&mut rx).await;

        hub.subscribe_task(&conn, "").unwrap();
        assert_eq!(next(&mut rx).await, ServerEvent::error("Task ID is required"));
        hub.join_room(&conn, "").unwrap();
        assert_eq!(next(&mut rx).await, ServerEvent::error("Room name is required"));
        hub.handle_client_text(&conn, "{not json").unwrap();
        assert!(matches!(next(&mut rx).await, ServerEvent::Error { .. }));

        // Still connected.
        hub.heartbeat(&conn).unwrap();
        assert!(matches!(next(&mut rx).await, ServerEvent::HeartbeatAck { .. }));
        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.messages_received, 4);
        assert_eq!(stats.current_connections, 1);
    }

    #[tokio::test]
    async fn rooms_and_notifications() {
        let hub = hub_with(&[]);
        let (a, mut rx_a) = hub.connect(ConnectionMeta::default()).await.unwrap();
        let (_b, mut rx_b) = hub.connect(ConnectionMeta::default()).await.unwrap();
        next(&mut rx_a).await;
        next(&mut rx_b).await;

        hub.handle_client_text(&a, r#"{"type":"join_room","data":{"room":"queue_stats"}}"#)
            .unwrap();
        assert_eq!(next(&mut rx_a).await, ServerEvent::RoomJoined { room: "queue_stats".into() });

        hub.broadcast_to_room("queue_stats", "stats_update", serde_json::json!({"queue_size": 1}))
            .unwrap();
        assert_eq!(next(&mut rx_a).await.name(), "stats_update");

        hub.send_notification(&a, "info", "Heads up", "Import finished", None).unwrap();
        match next(&mut rx_a).await {
            ServerEvent::Notification(payload) => {
                assert_eq!(payload.title, "Heads up");
                assert_eq!(payload.data, serde_json::json!({}));
            }
            other => panic!("unexpected {:?}", other),
        }

        hub.handle_client_text(&a, r#"{"type":"get_stats"}"#).unwrap();
        match next(&mut rx_a).await {
            ServerEvent::StatsUpdate(stats) => {
                assert_eq!(stats["current_connections"], 2);
                assert_eq!(stats["active_rooms"], 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_notifies_and_closes() {
        let hub = hub_with(&[]);
        let (_conn, mut rx) = hub.connect(ConnectionMeta::default()).await.unwrap();
        next(&mut rx).await;

        hub.shutdown().await;
        assert!(matches!(next(&mut rx).await, ServerEvent::ServerShutdown { .. }));
        assert!(rx.recv().await.is_none());
        assert_eq!(hub.stats().await.unwrap_err(), HubError::Stopped);
    }
}
