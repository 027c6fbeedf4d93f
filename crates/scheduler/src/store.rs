use std::collections::HashMap;
use std::time::Duration;

use chatlog_core::{TaskId, TaskResult};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Bounded map of task results, exactly one entry per task id.
///
/// In-flight entries (pending, running, retrying) are never evicted or
/// swept; the bound is enforced by dropping the oldest terminal entry.
#[derive(Debug)]
pub struct ResultStore {
    entries: HashMap<TaskId, TaskResult>,
    max_entries: usize,
}

impl ResultStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries,
        }
    }

    /// Insert or replace the entry for `result.task_id`.
    pub fn insert(&mut self, result: TaskResult) {
        if !self.entries.contains_key(&result.task_id) && self.entries.len() >= self.max_entries {
            self.evict_oldest_terminal();
        }
        self.entries.insert(result.task_id.clone(), result);
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskResult> {
        self.entries.get(task_id)
    }

    pub fn get_mut(&mut self, task_id: &str) -> Option<&mut TaskResult> {
        self.entries.get_mut(task_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop terminal entries whose `end_time` is older than `retention`.
    /// Returns the number removed.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return 0;
        };

        let before = self.entries.len();
        self.entries.retain(|_, r| !is_expired(r, cutoff));
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "Swept expired task results");
        }
        removed
    }

    fn evict_oldest_terminal(&mut self) {
        let oldest = self
            .entries
            .values()
            .filter(|r| r.is_terminal())
            .min_by_key(|r| r.end_time)
            .map(|r| r.task_id.clone());

        match oldest {
            Some(id) => {
                self.entries.remove(&id);
                debug!(task_id = %id, "Evicted oldest terminal result");
            }
            None => debug!(
                len = self.entries.len(),
                "Result store over capacity with only in-flight tasks"
            ),
        }
    }
}

fn is_expired(result: &TaskResult, cutoff: DateTime<Utc>) -> bool {
    result.is_terminal() && result.end_time.is_some_and(|end| end < cutoff)
}
