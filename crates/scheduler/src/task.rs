use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chatlog_core::{ErrorKind, Priority, TaskId};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::time::Instant;

use super::types::{SubmitOptions, TaskArgs};

/// Errors surfaced by the scheduler, and recorded per attempt on task results.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    #[error("Task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("Task timeout after {} seconds", .timeout.as_secs_f64())]
    Timeout { timeout: Duration },
    #[error("Task execution failed: {0}")]
    Execution(String),
    #[error("Task not found: {0}")]
    NotFound(TaskId),
    #[error("Task scheduler is not running")]
    Stopped,
    #[error("Worker pool error: {0}")]
    WorkerPool(String),
}

impl TaskError {
    /// Wrap an error returned by a work item, keeping its context chain.
    pub fn execution(err: anyhow::Error) -> Self {
        Self::Execution(format!("{err:#}"))
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Execution(format!("work item panicked: {message}"))
    }

    /// Classification stored on the task result.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            _ => ErrorKind::Execution,
        }
    }
}

/// Native async work: returns a future polled on the scheduler's own flow.
pub type AsyncWorkFn = dyn Fn(TaskArgs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// Blocking work: runs on the bounded worker pool.
pub type BlockingWorkFn = dyn Fn(TaskArgs) -> anyhow::Result<Value> + Send + Sync;

/// The callable part of a task. Re-invocable, since retries call it again.
///
/// Async work must yield cooperatively: it shares the coordinating flow
/// with every scheduling decision, so a future that blocks the thread
/// stalls the whole scheduler. Use [`Work::blocking`] for anything that
/// does synchronous I/O or heavy computation.
#[derive(Clone)]
pub enum Work {
    Async(Arc<AsyncWorkFn>),
    Blocking(Arc<BlockingWorkFn>),
}

impl Work {
    pub fn async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::Async(Arc::new(move |args| Box::pin(f(args))))
    }

    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(TaskArgs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::Blocking(Arc::new(f))
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Blocking(_))
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Async(_) => f.write_str("Work::Async"),
            Self::Blocking(_) => f.write_str("Work::Blocking"),
        }
    }
}

/// A queued unit of work. Owned by the scheduler's coordinating flow.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub id: TaskId,
    pub task_type: String,
    pub priority: Priority,
    pub work: Work,
    pub args: TaskArgs,
    pub max_retries: u32,
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
    /// Wall-clock not-before time, informational.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Monotonic instant from which the task may be dispatched.
    pub(crate) eligible_at: Instant,
}

impl TaskDescriptor {
    pub(crate) fn new(id: TaskId, task_type: &str, work: Work, options: SubmitOptions) -> Self {
        let now = Utc::now();
        let mut wait = options.delay.unwrap_or_default();
        if let Some(at) = options.scheduled_for {
            wait = wait.max((at - now).to_std().unwrap_or_default());
        }
        let scheduled_for = if wait.is_zero() {
            options.scheduled_for
        } else {
            chrono::Duration::from_std(wait).ok().map(|d| now + d)
        };

        Self {
            id,
            task_type: task_type.to_string(),
            priority: options.priority,
            work,
            args: options.args,
            max_retries: options.max_retries,
            timeout: options.timeout,
            created_at: now,
            scheduled_for,
            eligible_at: Instant::now() + wait,
        }
    }

    /// Push eligibility back by `delay` (retry backoff).
    pub(crate) fn defer(&mut self, delay: Duration) {
        self.eligible_at = Instant::now() + delay;
        self.scheduled_for = chrono::Duration::from_std(delay)
            .ok()
            .map(|d| Utc::now() + d);
    }
}

/// Generate a process-unique task id: `{task_type}_{uuid}`.
pub(crate) fn new_task_id(task_type: &str) -> TaskId {
    format!("{}_{}", task_type, uuid::Uuid::new_v4().simple())
}
