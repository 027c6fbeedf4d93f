use std::time::Duration;

use chatlog_core::Priority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::metrics::TaskTotals;

/// Arguments handed to a work item on every attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    pub positional: Vec<Value>,
    pub keyword: Map<String, Value>,
}

impl TaskArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a keyword argument.
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    pub fn get_kw(&self, key: &str) -> Option<&Value> {
        self.keyword.get(key)
    }
}

/// Per-submission knobs. Defaults: normal priority, 3 retries, 300s timeout.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub priority: Priority,
    pub max_retries: u32,
    pub timeout: Duration,
    /// Wall-clock not-before time.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Relative not-before delay, measured on the monotonic clock.
    pub delay: Option<Duration>,
    pub args: TaskArgs,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            max_retries: 3,
            timeout: Duration::from_secs(300),
            scheduled_for: None,
            delay: None,
            args: TaskArgs::default(),
        }
    }
}

impl SubmitOptions {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn args(mut self, args: TaskArgs) -> Self {
        self.args = args;
        self
    }
}

/// Snapshot returned by `Scheduler::get_queue_stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks waiting in the pending queue (including retries in backoff).
    pub queue_size: usize,
    pub running_tasks: usize,
    /// Results currently retained by the result store.
    pub total_results: usize,
    pub max_workers: usize,
    pub max_queue_size: usize,
    pub totals: TaskTotals,
    /// Mean seconds per completed task.
    pub avg_execution_time: f64,
}
