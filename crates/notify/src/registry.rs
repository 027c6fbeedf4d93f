use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chatlog_core::TaskId;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::{ClientSummary, Connection, ConnectionId, Delivery};
use crate::protocol::ServerEvent;

/// Snapshot returned by `Hub::stats` and sent as `stats_update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HubStats {
    pub total_connections: u64,
    pub current_connections: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    /// Task ids with at least one subscriber.
    pub active_task_subscriptions: usize,
    pub active_rooms: usize,
    pub connected_clients: Vec<ClientSummary>,
}

/// Connection and subscription maps. Owned by the hub's coordinating flow.
///
/// `task_subscribers` and `rooms` mirror the per-connection sets; empty
/// entries are removed, so their sizes count live subscriptions only.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    task_subscribers: HashMap<TaskId, HashSet<ConnectionId>>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
    /// Subscriptions still owed their initial status snapshot.
    awaiting_snapshot: HashSet<(ConnectionId, TaskId)>,
    total_connections: u64,
    messages_sent: u64,
    messages_received: u64,
    messages_dropped: u64,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, connection: Connection) {
        self.total_connections += 1;
        self.connections.insert(connection.id.clone(), connection);
    }

    pub(crate) fn contains(&self, conn: &str) -> bool {
        self.connections.contains_key(conn)
    }

    /// Drop a connection and every subscription it holds.
    pub(crate) fn remove(&mut self, conn: &str) -> Option<Connection> {
        let connection = self.connections.remove(conn)?;
        for task_id in &connection.tasks {
            detach(&mut self.task_subscribers, task_id, conn);
        }
        for room in &connection.rooms {
            detach(&mut self.rooms, room, conn);
        }
        self.awaiting_snapshot.retain(|(c, _)| c != conn);
        Some(connection)
    }

    pub(crate) fn record_received(&mut self) {
        self.messages_received += 1;
    }

    pub(crate) fn subscribe_task(&mut self, conn: &str, task_id: &str) -> bool {
        let Some(connection) = self.connections.get_mut(conn) else {
            return false;
        };
        connection.tasks.insert(task_id.to_string());
        self.task_subscribers
            .entry(task_id.to_string())
            .or_default()
            .insert(conn.to_string());
        self.awaiting_snapshot.insert((conn.to_string(), task_id.to_string()));
        true
    }

    pub(crate) fn unsubscribe_task(&mut self, conn: &str, task_id: &str) -> bool {
        let Some(connection) = self.connections.get_mut(conn) else {
            return false;
        };
        connection.tasks.remove(task_id);
        detach(&mut self.task_subscribers, task_id, conn);
        self.awaiting_snapshot
            .remove(&(conn.to_string(), task_id.to_string()));
        true
    }

    pub(crate) fn join_room(&mut self, conn: &str, room: &str) -> bool {
        let Some(connection) = self.connections.get_mut(conn) else {
            return false;
        };
        connection.rooms.insert(room.to_string());
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(conn.to_string());
        true
    }

    pub(crate) fn leave_room(&mut self, conn: &str, room: &str) -> bool {
        let Some(connection) = self.connections.get_mut(conn) else {
            return false;
        };
        connection.rooms.remove(room);
        detach(&mut self.rooms, room, conn);
        true
    }

    pub(crate) fn touch(&mut self, conn: &str, now: Instant) -> bool {
        match self.connections.get_mut(conn) {
            Some(connection) => {
                connection.last_heartbeat = now;
                true
            }
            None => false,
        }
    }

    /// Take the pending initial snapshot for `(conn, task_id)`, if still owed.
    pub(crate) fn take_snapshot_slot(&mut self, conn: &str, task_id: &str) -> bool {
        self.awaiting_snapshot
            .remove(&(conn.to_string(), task_id.to_string()))
    }

    /// Push one event to one connection. A closed receiver drops the connection.
    pub(crate) fn deliver(&mut self, conn: &str, event: ServerEvent) -> Delivery {
        let Some(connection) = self.connections.get(conn) else {
            return Delivery::Closed;
        };
        let delivery = connection.push(event);
        self.account(conn, delivery);
        if delivery == Delivery::Closed {
            self.remove(conn);
        }
        delivery
    }

    /// Push `event` to every subscriber of `task_id`. Returns the number of
    /// successful deliveries.
    pub(crate) fn fan_out_task(&mut self, task_id: &str, event: &ServerEvent) -> usize {
        let targets: Vec<ConnectionId> = match self.task_subscribers.get(task_id) {
            Some(set) => set.iter().cloned().collect(),
            None => return 0,
        };
        for conn in &targets {
            // A live update supersedes the initial snapshot.
            self.awaiting_snapshot.remove(&(conn.clone(), task_id.to_string()));
        }
        self.fan_out(&targets, event)
    }

    /// Push `event` to every member of `room`.
    pub(crate) fn fan_out_room(&mut self, room: &str, event: &ServerEvent) -> usize {
        let targets: Vec<ConnectionId> = match self.rooms.get(room) {
            Some(set) => set.iter().cloned().collect(),
            None => return 0,
        };
        self.fan_out(&targets, event)
    }

    /// Push `event` to every connection, then forget them all.
    pub(crate) fn drain_with(&mut self, event: &ServerEvent) -> usize {
        let targets: Vec<ConnectionId> = self.connections.keys().cloned().collect();
        let sent = self.fan_out(&targets, event);
        self.connections.clear();
        self.task_subscribers.clear();
        self.rooms.clear();
        self.awaiting_snapshot.clear();
        sent
    }

    /// Remove connections whose heartbeat is older than `threshold`.
    pub(crate) fn sweep_stale(&mut self, now: Instant, threshold: Duration) -> Vec<ConnectionId> {
        let stale: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.is_stale(now, threshold))
            .map(|c| c.id.clone())
            .collect();
        for conn in &stale {
            info!(conn = %conn, "Cleaning up stale connection");
            self.remove(conn);
        }
        stale
    }

    pub(crate) fn stats(&self) -> HubStats {
        HubStats {
            total_connections: self.total_connections,
            current_connections: self.connections.len(),
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            messages_dropped: self.messages_dropped,
            active_task_subscriptions: self.task_subscribers.len(),
            active_rooms: self.rooms.len(),
            connected_clients: self.connections.values().map(Connection::summary).collect(),
        }
    }

    fn fan_out(&mut self, targets: &[ConnectionId], event: &ServerEvent) -> usize {
        let mut sent = 0;
        let mut closed = Vec::new();
        for conn in targets {
            let Some(connection) = self.connections.get(conn) else {
                continue;
            };
            let delivery = connection.push(event.clone());
            self.account(conn, delivery);
            match delivery {
                Delivery::Sent => sent += 1,
                Delivery::Dropped => {}
                Delivery::Closed => closed.push(conn.clone()),
            }
        }
        for conn in closed {
            self.remove(&conn);
        }
        sent
    }

    fn account(&mut self, conn: &str, delivery: Delivery) {
        match delivery {
            Delivery::Sent => self.messages_sent += 1,
            Delivery::Dropped => {
                self.messages_dropped += 1;
                warn!(conn = %conn, "Outbound queue full, dropping message");
            }
            Delivery::Closed => debug!(conn = %conn, "Outbound queue closed, removing connection"),
        }
    }
}

fn detach(map: &mut HashMap<String, HashSet<ConnectionId>>, key: &str, conn: &str) {
    if let Some(set) = map.get_mut(key) {
        set.remove(conn);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionMeta;
    use chatlog_core::TaskResult;
    use tokio::sync::mpsc;

    fn add(registry: &mut Registry, id: &str, buffer: usize) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(buffer);
        registry.insert(Connection::new(id.into(), ConnectionMeta::default(), tx));
        rx
    }

    fn update(task_id: &str) -> ServerEvent {
        ServerEvent::task_status(TaskResult::pending(task_id, "demo"))
    }

    #[tokio::test]
    async fn task_fan_out_reaches_only_subscribers() {
        let mut reg = Registry::new();
        let mut a = add(&mut reg, "a", 8);
        let mut b = add(&mut reg, "b", 8);
        reg.subscribe_task("a", "x");
        reg.subscribe_task("b", "y");

        assert_eq!(reg.fan_out_task("x", &update("x")), 1);
        assert_eq!(reg.fan_out_task("nobody", &update("nobody")), 0);

        assert!(matches!(
            a.try_recv(),
            Ok(ServerEvent::TaskStatusUpdate { task_id, .. }) if task_id == "x"
        ));
        assert!(b.try_recv().is_err());
        assert_eq!(reg.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking_others() {
        let mut reg = Registry::new();
        let _slow = add(&mut reg, "slow", 1);
        let mut fast = add(&mut reg, "fast", 8);
        reg.subscribe_task("slow", "x");
        reg.subscribe_task("fast", "x");

        reg.fan_out_task("x", &update("x"));
        reg.fan_out_task("x", &update("x"));

        let stats = reg.stats();
        assert_eq!(stats.messages_sent, 3);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.current_connections, 2);
        assert!(fast.try_recv().is_ok());
        assert!(fast.try_recv().is_ok());
    }

    #[tokio::test]
    async fn closed_receiver_removes_connection() {
        let mut reg = Registry::new();
        let gone = add(&mut reg, "gone", 8);
        let _live = add(&mut reg, "live", 8);
        reg.join_room("gone", "lobby");
        reg.join_room("live", "lobby");
        drop(gone);

        let event = ServerEvent::Room {
            event: "hello".into(),
            data: serde_json::Value::Null,
        };
        assert_eq!(reg.fan_out_room("lobby", &event), 1);
        assert!(!reg.contains("gone"));
        assert_eq!(reg.stats().active_rooms, 1);
    }

    #[tokio::test]
    async fn remove_clears_every_index() {
        let mut reg = Registry::new();
        let _rx = add(&mut reg, "a", 8);
        reg.subscribe_task("a", "x");
        reg.subscribe_task("a", "y");
        reg.join_room("a", "lobby");
        assert_eq!(reg.stats().active_task_subscriptions, 2);

        assert!(reg.remove("a").is_some());
        let stats = reg.stats();
        assert_eq!(stats.current_connections, 0);
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.active_task_subscriptions, 0);
        assert_eq!(stats.active_rooms, 0);
        assert!(!reg.take_snapshot_slot("a", "x"));
    }

    #[tokio::test]
    async fn live_update_supersedes_snapshot() {
        let mut reg = Registry::new();
        let _rx = add(&mut reg, "a", 8);
        reg.subscribe_task("a", "x");
        reg.subscribe_task("a", "y");

        reg.fan_out_task("x", &update("x"));
        assert!(!reg.take_snapshot_slot("a", "x"));
        assert!(reg.take_snapshot_slot("a", "y"));
        assert!(!reg.take_snapshot_slot("a", "y"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_stale() {
        let mut reg = Registry::new();
        let _a = add(&mut reg, "a", 8);
        let _b = add(&mut reg, "b", 8);
        reg.subscribe_task("a", "x");

        tokio::time::advance(Duration::from_secs(45)).await;
        reg.touch("b", Instant::now());
        tokio::time::advance(Duration::from_secs(20)).await;

        let removed = reg.sweep_stale(Instant::now(), Duration::from_secs(60));
        assert_eq!(removed, vec!["a".to_string()]);
        assert!(reg.contains("b"));
        assert_eq!(reg.fan_out_task("x", &update("x")), 0);
    }
}
