//! Hub behaviour against a live scheduler and against a stubbed status source.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatlog_core::{HubConfig, SchedulerConfig, StatusSource, TaskEvent, TaskResult, TaskStatus};
use chatlog_notify::{ConnectionMeta, Hub, ServerEvent};
use chatlog_scheduler::{Scheduler, SubmitOptions, Work};
use serde_json::Value;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(3);

async fn next(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("connection closed")
}

fn short_job() -> Work {
    Work::async_fn(|_| async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(Value::from("done"))
    })
}

#[tokio::test]
async fn subscriber_gets_one_push_per_transition_of_its_task_only() {
    let scheduler = Scheduler::start(SchedulerConfig {
        max_workers: 2,
        ..SchedulerConfig::default()
    })
    .unwrap();
    let hub = Hub::start(HubConfig::default(), Arc::new(scheduler.clone()));
    let bridge = hub.spawn_status_bridge(scheduler.watch());

    let (conn, mut rx) = hub.connect(ConnectionMeta::default()).await.unwrap();
    assert!(matches!(next(&mut rx).await, ServerEvent::ConnectionConfirmed { .. }));

    let x = scheduler
        .submit("x", short_job(), SubmitOptions::default().delay(Duration::from_millis(200)))
        .unwrap();
    let _y = scheduler.submit("y", short_job(), SubmitOptions::default()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    hub.subscribe_task(&conn, &x).unwrap();
    assert_eq!(next(&mut rx).await, ServerEvent::TaskSubscribed { task_id: x.clone() });

    let mut statuses = Vec::new();
    while statuses.last() != Some(&TaskStatus::Completed) {
        match next(&mut rx).await {
            ServerEvent::TaskStatusUpdate { task_id, status, .. } => {
                assert_eq!(task_id, x, "update for a task this connection never subscribed to");
                statuses.push(status.status);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(
        statuses,
        vec![TaskStatus::Pending, TaskStatus::Running, TaskStatus::Completed]
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "no pushes expected after the terminal status");

    let stats = hub.stats().await.unwrap();
    assert_eq!(stats.current_connections, 1);
    assert_eq!(stats.active_task_subscriptions, 1);

    hub.shutdown().await;
    scheduler.shutdown().await;
    bridge.abort();
}

#[tokio::test]
async fn burst_larger_than_event_buffer_still_reaches_subscribers() {
    let scheduler = Scheduler::start(SchedulerConfig {
        max_workers: 16,
        event_buffer: 8,
        ..SchedulerConfig::default()
    })
    .unwrap();
    let hub = Hub::start(
        HubConfig {
            outbound_buffer: 10_000,
            ..HubConfig::default()
        },
        Arc::new(scheduler.clone()),
    );
    let bridge = hub.spawn_status_bridge(scheduler.watch());

    let (conn, mut rx) = hub.connect(ConnectionMeta::default()).await.unwrap();
    next(&mut rx).await;

    let burst = 200;
    let delay = SubmitOptions::default().delay(Duration::from_millis(300));
    let mut ids = HashSet::new();
    for _ in 0..burst {
        let noop = Work::async_fn(|_| async { Ok(Value::Null) });
        let id = scheduler.submit("noop", noop, delay.clone()).unwrap();
        hub.subscribe_task(&conn, &id).unwrap();
        ids.insert(id);
    }

    let mut completed = HashSet::new();
    while completed.len() < burst {
        if let ServerEvent::TaskStatusUpdate { task_id, status, .. } = next(&mut rx).await {
            if status.status == TaskStatus::Completed {
                assert!(completed.insert(task_id), "duplicate completion push");
            }
        }
    }
    assert_eq!(completed, ids);
    assert_eq!(hub.stats().await.unwrap().messages_dropped, 0);

    hub.shutdown().await;
    scheduler.shutdown().await;
    bridge.abort();
}

/// Status source that knows no tasks.
struct NoTasks;

#[async_trait]
impl StatusSource for NoTasks {
    async fn task_status(&self, _task_id: &str) -> Option<TaskResult> {
        None
    }
}

#[tokio::test(start_paused = true)]
async fn stale_subscriber_is_removed_and_not_delivered_to() {
    let hub = Hub::start(
        HubConfig {
            stale_threshold_secs: 60,
            sweep_interval_secs: 2,
            ..HubConfig::default()
        },
        Arc::new(NoTasks),
    );

    let (a, mut rx_a) = hub.connect(ConnectionMeta::default()).await.unwrap();
    let (b, mut rx_b) = hub.connect(ConnectionMeta::default()).await.unwrap();
    next(&mut rx_a).await;
    next(&mut rx_b).await;
    hub.subscribe_task(&a, "x").unwrap();
    hub.subscribe_task(&b, "x").unwrap();
    next(&mut rx_a).await;
    next(&mut rx_b).await;

    // Only B keeps heartbeating.
    for _ in 0..13 {
        tokio::time::sleep(Duration::from_secs(5)).await;
        hub.heartbeat(&b).unwrap();
        assert!(matches!(next(&mut rx_b).await, ServerEvent::HeartbeatAck { .. }));
    }

    // A's queue was dropped by the sweep.
    assert!(rx_a.recv().await.is_none());

    hub.notify_task_update(TaskEvent::new(TaskResult::pending("x", "demo"))).unwrap();
    match next(&mut rx_b).await {
        ServerEvent::TaskStatusUpdate { task_id, .. } => assert_eq!(task_id, "x"),
        other => panic!("unexpected event {:?}", other),
    }

    let stats = hub.stats().await.unwrap();
    assert_eq!(stats.current_connections, 1);
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.messages_dropped, 0);
    hub.shutdown().await;
}
