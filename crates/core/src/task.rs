use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque task identifier, unique for the lifetime of the process.
pub type TaskId = String;

/// Task urgency. Lower rank = dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub fn rank(self) -> u8 {
        self as u8
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl TaskStatus {
    /// No further transition happens from a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Retrying => "retrying",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies the error recorded on a [`TaskResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// The attempt exceeded its deadline.
    Timeout,
    /// The work item returned an error or panicked.
    Execution,
    /// The task was cancelled before it ran.
    Cancelled,
}

/// The externally visible state of one task. Replaced in place on every
/// transition; there is never more than one per task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub task_type: String,
    pub status: TaskStatus,
    /// Payload produced by the work item on success.
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds between `start_time` and `end_time` of the latest attempt.
    pub execution_time: Option<f64>,
    pub retry_count: u32,
}

impl TaskResult {
    pub fn pending(task_id: impl Into<TaskId>, task_type: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            error_kind: None,
            start_time: None,
            end_time: None,
            execution_time: None,
            retry_count: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Start a new attempt. Errors from a previous attempt are cleared.
    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.start_time = Some(now);
        self.end_time = None;
        self.execution_time = None;
        self.error = None;
        self.error_kind = None;
    }

    pub fn mark_completed(&mut self, value: Value, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.result = Some(value);
        self.finish(now);
    }

    /// Terminal failure.
    pub fn mark_failed(&mut self, kind: ErrorKind, message: String, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.error = Some(message);
        self.error_kind = Some(kind);
        self.finish(now);
    }

    /// Failed attempt that will be retried; bumps `retry_count`.
    pub fn mark_retrying(&mut self, kind: ErrorKind, message: String, now: DateTime<Utc>) {
        self.status = TaskStatus::Retrying;
        self.error = Some(message);
        self.error_kind = Some(kind);
        self.retry_count += 1;
        self.finish(now);
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Cancelled;
        self.error = Some("Task cancelled before execution".to_string());
        self.error_kind = Some(ErrorKind::Cancelled);
        self.end_time = Some(now);
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.end_time = Some(now);
        self.execution_time = self
            .start_time
            .map(|start| (now - start).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0);
    }
}

/// Emitted by the scheduler after every status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Snapshot of the result after the transition.
    pub result: TaskResult,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(result: TaskResult) -> Self {
        Self {
            task_id: result.task_id.clone(),
            status: result.status,
            result,
            timestamp: Utc::now(),
        }
    }
}

/// Read access to current task state, used by observers that need a
/// snapshot outside the event stream (e.g. right after subscribing).
#[async_trait::async_trait]
pub trait StatusSource: Send + Sync {
    async fn task_status(&self, task_id: &str) -> Option<TaskResult>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn priority_ordering() {
        assert!(Priority::Urgent < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!(Priority::Urgent.rank(), 0);
        assert_eq!(Priority::Low.rank(), 3);
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Retrying).unwrap();
        assert_eq!(json, "\"retrying\"");
        let p: Priority = serde_json::from_str("\"urgent\"").unwrap();
        assert_eq!(p, Priority::Urgent);
    }

    #[test]
    fn execution_time_is_derived() {
        let start = Utc::now();
        let mut r = TaskResult::pending("t1", "demo");
        r.mark_running(start);
        r.mark_completed(serde_json::json!({"rows": 3}), start + Duration::milliseconds(1500));

        assert_eq!(r.status, TaskStatus::Completed);
        assert_eq!(r.execution_time, Some(1.5));
        assert_eq!(r.result, Some(serde_json::json!({"rows": 3})));
    }

    #[test]
    fn retry_clears_on_next_attempt() {
        let now = Utc::now();
        let mut r = TaskResult::pending("t1", "demo");
        r.mark_running(now);
        r.mark_retrying(ErrorKind::Execution, "boom".into(), now);
        assert_eq!(r.status, TaskStatus::Retrying);
        assert_eq!(r.retry_count, 1);
        assert_eq!(r.error.as_deref(), Some("boom"));

        r.mark_running(now);
        assert_eq!(r.status, TaskStatus::Running);
        assert_eq!(r.retry_count, 1);
        assert!(r.error.is_none());
        assert!(r.end_time.is_none());
    }

    #[test]
    fn cancelled_has_no_execution_time() {
        let mut r = TaskResult::pending("t1", "demo");
        r.mark_cancelled(Utc::now());
        assert!(r.is_terminal());
        assert_eq!(r.error_kind, Some(ErrorKind::Cancelled));
        assert!(r.execution_time.is_none());
        assert!(r.end_time.is_some());
    }

    #[test]
    fn event_mirrors_result() {
        let r = TaskResult::pending("t9", "demo");
        let event = TaskEvent::new(r.clone());
        assert_eq!(event.task_id, "t9");
        assert_eq!(event.status, TaskStatus::Pending);
        assert_eq!(event.result, r);
    }
}
