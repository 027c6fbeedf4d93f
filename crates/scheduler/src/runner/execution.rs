use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chatlog_core::{SchedulerConfig, TaskEvent, TaskId, TaskResult, TaskStatus};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::metrics::TaskTotals;
use crate::pool::WorkerPool;
use crate::retry::RetryPolicy;
use crate::store::ResultStore;
use crate::task::{TaskDescriptor, TaskError, Work};
use crate::types::{QueueStats, TaskArgs};

use super::messages::Command;
use super::scheduling::PendingQueue;

/// Result of one attempt, tagged with its task.
pub(super) struct AttemptOutcome {
    task_id: TaskId,
    result: Result<Value, TaskError>,
}

/// The single flow that owns all scheduler state.
///
/// Status transitions, retries, cancellation, and cleanup all happen here,
/// so no two of them can interleave for the same task.
pub(super) struct Coordinator {
    config: SchedulerConfig,
    max_workers: usize,
    retry: RetryPolicy,
    commands: mpsc::UnboundedReceiver<Command>,
    queue: PendingQueue,
    queued: Arc<AtomicUsize>,
    running: HashMap<TaskId, TaskDescriptor>,
    attempts: FuturesUnordered<BoxFuture<'static, AttemptOutcome>>,
    store: ResultStore,
    totals: TaskTotals,
    pool: WorkerPool,
    events: broadcast::Sender<TaskEvent>,
    watchers: Vec<mpsc::UnboundedSender<TaskEvent>>,
}

impl Coordinator {
    pub(super) fn new(
        config: SchedulerConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        queued: Arc<AtomicUsize>,
        pool: WorkerPool,
        events: broadcast::Sender<TaskEvent>,
    ) -> Self {
        Self {
            max_workers: config.resolved_max_workers(),
            retry: RetryPolicy::from_config(&config),
            store: ResultStore::new(config.max_results),
            config,
            commands,
            queue: PendingQueue::new(),
            queued,
            running: HashMap::new(),
            attempts: FuturesUnordered::new(),
            totals: TaskTotals::default(),
            pool,
            events,
            watchers: Vec::new(),
        }
    }

    /// Main loop. Returns once shut down or once every handle is dropped.
    pub(super) async fn run(mut self) {
        let mut cleanup = tokio::time::interval(self.config.cleanup_interval());
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_ack: Option<oneshot::Sender<()>> = None;

        loop {
            self.dispatch_ready();
            let wakeup = self.next_wakeup();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        shutdown_ack = Some(reply);
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(outcome) = self.attempts.next(), if !self.attempts.is_empty() => {
                    self.finish_attempt(outcome);
                }
                _ = wait_until(wakeup) => {}
                _ = cleanup.tick() => self.cleanup(),
            }
        }

        info!(
            "Task scheduler stopped ({} queued dropped, {} running abandoned)",
            self.queue.len(),
            self.running.len()
        );
        self.commands.close();
        self.queued.store(0, Ordering::Release);
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit(descriptor) => self.enqueue(*descriptor),
            Command::Cancel { task_id, reply } => {
                let _ = reply.send(self.cancel(&task_id));
            }
            Command::Status { task_id, reply } => {
                let _ = reply.send(self.store.get(&task_id).cloned());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Watch(sink) => self.watchers.push(sink),
            // Handled by the loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn enqueue(&mut self, descriptor: TaskDescriptor) {
        let result = TaskResult::pending(&descriptor.id, &descriptor.task_type);
        self.store.insert(result.clone());
        self.publish(result);
        self.totals.submitted += 1;
        info!(
            "Task {} submitted (type: {}, priority: {:?})",
            descriptor.id, descriptor.task_type, descriptor.priority
        );
        self.queue.push(descriptor);
    }

    /// Start as many eligible tasks as there are free workers.
    fn dispatch_ready(&mut self) {
        while self.running.len() < self.max_workers {
            let Some(descriptor) = self.queue.pop_eligible(Instant::now()) else {
                break;
            };
            self.queued.fetch_sub(1, Ordering::AcqRel);
            self.start_attempt(descriptor);
        }
    }

    /// Next instant at which a queued task becomes eligible, if a worker is
    /// free to take it.
    fn next_wakeup(&self) -> Option<Instant> {
        if self.running.len() >= self.max_workers {
            return None;
        }
        self.queue.next_eligible_at()
    }

    fn start_attempt(&mut self, descriptor: TaskDescriptor) {
        let task_id = descriptor.id.clone();
        self.transition(&task_id, |r| r.mark_running(Utc::now()));
        debug!(task_id = %task_id, blocking = descriptor.work.is_blocking(), "Task running");

        let attempt = run_attempt(
            self.pool.clone(),
            descriptor.work.clone(),
            descriptor.args.clone(),
            descriptor.timeout,
        );
        let tag = task_id.clone();
        self.attempts.push(
            async move {
                AttemptOutcome {
                    task_id: tag,
                    result: attempt.await,
                }
            }
            .boxed(),
        );
        self.running.insert(task_id, descriptor);
    }

    fn finish_attempt(&mut self, outcome: AttemptOutcome) {
        let Some(mut descriptor) = self.running.remove(&outcome.task_id) else {
            return;
        };
        let task_id = outcome.task_id;

        match outcome.result {
            Ok(value) => {
                let done = self.transition(&task_id, |r| r.mark_completed(value, Utc::now()));
                let execution_time = done.and_then(|r| r.execution_time);
                self.totals.record_completion(execution_time);
                info!(
                    "Task {} completed in {:.3}s",
                    task_id,
                    execution_time.unwrap_or_default()
                );
            }
            Err(err) => {
                let attempt = self.store.get(&task_id).map(|r| r.retry_count).unwrap_or(0);
                let (retry, delay) = self.retry.should_retry(attempt, descriptor.max_retries);
                let message = err.to_string();

                if retry {
                    self.transition(&task_id, |r| r.mark_retrying(err.kind(), message, Utc::now()));
                    warn!(
                        "Task {} failed: {}. Retrying in {:?} (attempt {}/{})",
                        task_id,
                        err,
                        delay,
                        attempt + 1,
                        descriptor.max_retries
                    );
                    descriptor.defer(delay);
                    self.queued.fetch_add(1, Ordering::AcqRel);
                    self.queue.push(descriptor);
                    self.totals.retried += 1;
                } else {
                    self.transition(&task_id, |r| r.mark_failed(err.kind(), message, Utc::now()));
                    error!("Task {} failed after {} retries: {}", task_id, attempt, err);
                    self.totals.failed += 1;
                }
            }
        }
    }

    fn cancel(&mut self, task_id: &str) -> Result<bool, TaskError> {
        let status = self
            .store
            .get(task_id)
            .map(|r| r.status)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;

        if status != TaskStatus::Pending || !self.queue.remove(task_id) {
            warn!("Cannot cancel task {} with status {}", task_id, status);
            return Ok(false);
        }

        self.queued.fetch_sub(1, Ordering::AcqRel);
        self.transition(task_id, |r| r.mark_cancelled(Utc::now()));
        self.totals.cancelled += 1;
        info!("Task {} cancelled", task_id);
        Ok(true)
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            queue_size: self.queue.len(),
            running_tasks: self.running.len(),
            total_results: self.store.len(),
            max_workers: self.max_workers,
            max_queue_size: self.config.max_queue_size,
            totals: self.totals.clone(),
            avg_execution_time: self.totals.avg_execution_time(),
        }
    }

    fn cleanup(&mut self) {
        let removed = self
            .store
            .sweep_expired(Utc::now(), self.config.result_retention());
        if removed > 0 {
            info!("Cleaned up {} old task results", removed);
        }
    }

    /// Apply a transition to the stored result and publish the new snapshot.
    fn transition(
        &mut self,
        task_id: &str,
        apply: impl FnOnce(&mut TaskResult),
    ) -> Option<TaskResult> {
        let result = self.store.get_mut(task_id)?;
        apply(result);
        let snapshot = result.clone();
        self.publish(snapshot.clone());
        Some(snapshot)
    }

    fn publish(&mut self, result: TaskResult) {
        let event = TaskEvent::new(result);
        self.watchers.retain(|sink| sink.send(event.clone()).is_ok());
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

/// One bounded attempt. Async work runs on this flow; blocking work runs on
/// the pool and is abandoned (not interrupted) when the deadline passes.
async fn run_attempt(
    pool: WorkerPool,
    work: Work,
    args: TaskArgs,
    timeout: Duration,
) -> Result<Value, TaskError> {
    let attempt = async move {
        match work {
            Work::Async(f) => match AssertUnwindSafe(async move { f(args).await })
                .catch_unwind()
                .await
            {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(TaskError::execution(e)),
                Err(payload) => Err(TaskError::from_panic(payload)),
            },
            Work::Blocking(f) => pool.execute(f, args).await.unwrap_or_else(|_| {
                Err(TaskError::Execution("worker dropped the task".to_string()))
            }),
        }
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(TaskError::Timeout { timeout }),
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
