use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::task::{BlockingWorkFn, TaskError};
use crate::types::TaskArgs;

/// Bounded thread pool for blocking work items.
///
/// Panics inside a work item are caught on the worker thread and reported
/// as execution errors; they never take a pool thread down.
#[derive(Clone)]
pub(crate) struct WorkerPool {
    pool: Arc<rayon::ThreadPool>,
}

impl WorkerPool {
    pub(crate) fn new(num_threads: usize) -> Result<Self, TaskError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("task-worker-{i}"))
            .build()
            .map_err(|e| TaskError::WorkerPool(e.to_string()))?;
        debug!(num_threads, "Blocking worker pool ready");
        Ok(Self { pool: Arc::new(pool) })
    }

    /// Run `work` on a pool thread. The receiver resolves with the outcome,
    /// or errors if the pool is torn down before the job finishes.
    pub(crate) fn execute(
        &self,
        work: Arc<BlockingWorkFn>,
        args: TaskArgs,
    ) -> oneshot::Receiver<Result<Value, TaskError>> {
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| work(args))) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(TaskError::execution(e)),
                Err(payload) => Err(TaskError::from_panic(payload)),
            };
            // Receiver is gone when the attempt already timed out.
            let _ = tx.send(outcome);
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_blocking_work() {
        let pool = WorkerPool::new(2).unwrap();
        let work: Arc<BlockingWorkFn> = Arc::new(|args: TaskArgs| {
            let n = args.get(0).and_then(Value::as_i64).unwrap_or(0);
            Ok(Value::from(n * 2))
        });

        let out = pool.execute(work, TaskArgs::new().arg(21)).await.unwrap();
        assert_eq!(out, Ok(Value::from(42)));
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let pool = WorkerPool::new(1).unwrap();
        let work: Arc<BlockingWorkFn> = Arc::new(|_| panic!("exploded"));

        let out = pool.execute(work, TaskArgs::new()).await.unwrap();
        match out {
            Err(TaskError::Execution(msg)) => assert!(msg.contains("exploded"), "{msg}"),
            other => panic!("expected execution error, got {:?}", other),
        }

        // The single thread survives the panic.
        let ok: Arc<BlockingWorkFn> = Arc::new(|_| Ok(Value::Bool(true)));
        let out = pool.execute(ok, TaskArgs::new()).await.unwrap();
        assert_eq!(out, Ok(Value::Bool(true)));
    }

    #[tokio::test]
    async fn errors_are_reported() {
        let pool = WorkerPool::new(1).unwrap();
        let work: Arc<BlockingWorkFn> = Arc::new(|_| Err(anyhow::anyhow!("bad input")));

        let out = pool.execute(work, TaskArgs::new()).await.unwrap();
        assert_eq!(out, Err(TaskError::Execution("bad input".into())));
    }
}
