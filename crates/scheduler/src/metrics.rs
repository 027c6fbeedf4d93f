use serde::{Deserialize, Serialize};

/// Lifetime counters kept by the coordinating flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskTotals {
    pub submitted: u64,
    pub completed: u64,
    /// Tasks that failed terminally (retries exhausted).
    pub failed: u64,
    /// Retry attempts scheduled.
    pub retried: u64,
    pub cancelled: u64,
    /// Sum of execution seconds over completed tasks.
    pub total_execution_time: f64,
}

impl TaskTotals {
    pub fn record_completion(&mut self, execution_time: Option<f64>) {
        self.completed += 1;
        self.total_execution_time += execution_time.unwrap_or(0.0);
    }

    /// Mean execution time of completed tasks, 0 when none completed.
    pub fn avg_execution_time(&self) -> f64 {
        self.total_execution_time / self.completed.max(1) as f64
    }
}
