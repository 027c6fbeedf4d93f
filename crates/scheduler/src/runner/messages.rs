use chatlog_core::{TaskEvent, TaskId, TaskResult};
use tokio::sync::{mpsc, oneshot};

use crate::task::{TaskDescriptor, TaskError};
use crate::types::QueueStats;

/// Messages handled by the coordinating flow.
#[derive(Debug)]
pub(crate) enum Command {
    /// Enqueue a new task. Capacity was already reserved by the handle.
    Submit(Box<TaskDescriptor>),
    /// Cancel a pending task.
    Cancel {
        task_id: TaskId,
        reply: oneshot::Sender<Result<bool, TaskError>>,
    },
    /// Query a result snapshot.
    Status {
        task_id: TaskId,
        reply: oneshot::Sender<Option<TaskResult>>,
    },
    Stats {
        reply: oneshot::Sender<QueueStats>,
    },
    /// Register a lossless event sink; it sees every transition after this
    /// command is handled.
    Watch(mpsc::UnboundedSender<TaskEvent>),
    /// Stop dispatching and exit; acknowledged once the flow is done.
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}
