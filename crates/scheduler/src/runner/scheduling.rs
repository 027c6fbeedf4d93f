use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tokio::time::Instant;

use crate::task::TaskDescriptor;

/// Heap entry. Ordered so the lowest `(rank, seq)` sits at the top.
#[derive(Debug)]
struct QueuedTask {
    rank: u8,
    seq: u64,
    descriptor: TaskDescriptor,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.rank, other.seq).cmp(&(self.rank, self.seq))
    }
}

/// Pending tasks ordered by priority, then insertion order.
///
/// A task whose not-before instant lies in the future is skipped without
/// blocking lower-priority tasks behind it.
#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    heap: BinaryHeap<QueuedTask>,
    next_seq: u64,
}

impl PendingQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, descriptor: TaskDescriptor) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedTask {
            rank: descriptor.priority.rank(),
            seq,
            descriptor,
        });
    }

    /// Pop the best task that is eligible at `now`.
    pub(crate) fn pop_eligible(&mut self, now: Instant) -> Option<TaskDescriptor> {
        let mut deferred = Vec::new();
        let mut found = None;
        while let Some(entry) = self.heap.pop() {
            if entry.descriptor.eligible_at <= now {
                found = Some(entry.descriptor);
                break;
            }
            deferred.push(entry);
        }
        self.heap.extend(deferred);
        found
    }

    /// Earliest instant at which any queued task becomes eligible.
    pub(crate) fn next_eligible_at(&self) -> Option<Instant> {
        self.heap.iter().map(|e| e.descriptor.eligible_at).min()
    }

    /// Remove a task by id. Returns whether it was queued.
    pub(crate) fn remove(&mut self, task_id: &str) -> bool {
        let before = self.heap.len();
        self.heap.retain(|e| e.descriptor.id != task_id);
        self.heap.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chatlog_core::Priority;
    use serde_json::Value;

    use crate::task::Work;
    use crate::types::SubmitOptions;

    fn descriptor(id: &str, priority: Priority) -> TaskDescriptor {
        TaskDescriptor::new(
            id.to_string(),
            "demo",
            Work::blocking(|_| Ok(Value::Null)),
            SubmitOptions::default().priority(priority),
        )
    }

    #[tokio::test]
    async fn priority_then_fifo() {
        let mut q = PendingQueue::new();
        q.push(descriptor("low", Priority::Low));
        q.push(descriptor("normal-1", Priority::Normal));
        q.push(descriptor("urgent", Priority::Urgent));
        q.push(descriptor("normal-2", Priority::Normal));

        let now = Instant::now();
        let order: Vec<_> = std::iter::from_fn(|| q.pop_eligible(now).map(|d| d.id)).collect();
        assert_eq!(order, vec!["urgent", "normal-1", "normal-2", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn future_tasks_do_not_block_others() {
        let mut q = PendingQueue::new();
        let mut later = descriptor("later", Priority::Urgent);
        later.defer(Duration::from_secs(10));
        let horizon = later.eligible_at;
        q.push(later);
        q.push(descriptor("now", Priority::Low));

        let first = q.pop_eligible(Instant::now()).map(|d| d.id);
        assert_eq!(first.as_deref(), Some("now"));
        assert!(q.pop_eligible(Instant::now()).is_none());
        assert_eq!(q.len(), 1);
        assert_eq!(q.next_eligible_at(), Some(horizon));

        tokio::time::advance(Duration::from_secs(11)).await;
        let next = q.pop_eligible(Instant::now()).map(|d| d.id);
        assert_eq!(next.as_deref(), Some("later"));
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn remove_by_id() {
        let mut q = PendingQueue::new();
        q.push(descriptor("a", Priority::Normal));
        q.push(descriptor("b", Priority::Normal));

        assert!(q.remove("a"));
        assert!(!q.remove("a"));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop_eligible(Instant::now()).map(|d| d.id).as_deref(), Some("b"));
    }
}
