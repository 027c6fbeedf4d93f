use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chatlog_core::{SchedulerConfig, StatusSource, TaskEvent, TaskId, TaskResult};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::pool::WorkerPool;
use crate::task::{new_task_id, TaskDescriptor, TaskError, Work};
use crate::types::{QueueStats, SubmitOptions};

use super::execution::Coordinator;
use super::messages::Command;

/// Handle to a running task scheduler.
///
/// Cheap to clone; every clone talks to the same coordinating flow, which
/// owns the queue, the result store, and the running set. All state
/// changes are serialized through that flow.
#[derive(Clone)]
pub struct Scheduler {
    pub(super) config: SchedulerConfig,
    pub(super) commands: mpsc::UnboundedSender<Command>,
    /// Tasks queued or waiting out a retry backoff. Shared with the flow so
    /// `submit` can enforce capacity without a round trip.
    pub(super) queued: Arc<AtomicUsize>,
    pub(super) events: broadcast::Sender<TaskEvent>,
}

impl Scheduler {
    /// Build the worker pool and spawn the coordinating flow.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: SchedulerConfig) -> Result<Self, TaskError> {
        let workers = config.resolved_max_workers();
        let pool = WorkerPool::new(workers)?;
        let (commands, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let queued = Arc::new(AtomicUsize::new(0));

        let coordinator = Coordinator::new(
            config.clone(),
            rx,
            Arc::clone(&queued),
            pool,
            events.clone(),
        );
        tokio::spawn(coordinator.run());

        info!(
            max_workers = workers,
            max_queue_size = config.max_queue_size,
            "Task scheduler started"
        );

        Ok(Self {
            config,
            commands,
            queued,
            events,
        })
    }

    /// Enqueue a task and return its id.
    ///
    /// Fails with [`TaskError::QueueFull`] when the pending queue is at
    /// capacity; nothing is enqueued in that case.
    pub fn submit(
        &self,
        task_type: &str,
        work: Work,
        options: SubmitOptions,
    ) -> Result<TaskId, TaskError> {
        let capacity = self.config.max_queue_size;
        if self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .is_err()
        {
            warn!(task_type, capacity, "Task queue is full, rejecting submission");
            return Err(TaskError::QueueFull { capacity });
        }

        let task_id = new_task_id(task_type);
        let descriptor = TaskDescriptor::new(task_id.clone(), task_type, work, options);
        debug!(
            task_id = %task_id,
            priority = ?descriptor.priority,
            max_retries = descriptor.max_retries,
            "Submitting task"
        );

        if self.commands.send(Command::Submit(Box::new(descriptor))).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(TaskError::Stopped);
        }
        Ok(task_id)
    }

    /// Cancel a task that has not started yet.
    ///
    /// Returns `Ok(false)` when the task already left the pending state.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, TaskError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel {
            task_id: task_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| TaskError::Stopped)?
    }

    /// Snapshot of the task's current result.
    pub async fn get_status(&self, task_id: &str) -> Result<TaskResult, TaskError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status {
            task_id: task_id.to_string(),
            reply,
        })?;
        rx.await
            .map_err(|_| TaskError::Stopped)?
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats, TaskError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply })?;
        rx.await.map_err(|_| TaskError::Stopped)
    }

    /// Receive a [`TaskEvent`] for status transitions from now on.
    ///
    /// Bounded by `event_buffer`; a slow receiver sees `Lagged` and misses
    /// events. Use [`Scheduler::watch`] when every transition matters.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Receive every status transition from now on, without loss.
    ///
    /// The queue is unbounded so the coordinating flow never waits on it.
    /// The receiver closes when the scheduler shuts down.
    pub fn watch(&self) -> mpsc::UnboundedReceiver<TaskEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        // A stopped scheduler drops `tx`, which closes `rx` straight away.
        let _ = self.commands.send(Command::Watch(tx));
        rx
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Stop the coordinating flow. Queued tasks are dropped; any attempt
    /// still running is abandoned. Idempotent.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, command: Command) -> Result<(), TaskError> {
        self.commands.send(command).map_err(|_| TaskError::Stopped)
    }
}

#[async_trait]
impl StatusSource for Scheduler {
    async fn task_status(&self, task_id: &str) -> Option<TaskResult> {
        self.get_status(task_id).await.ok()
    }
}
