//! Priority task scheduler with bounded concurrency, retries, and timeouts.
//!
//! A [`Scheduler`] accepts work items tagged with a [`Priority`], runs up to
//! `max_workers` attempts at a time, retries failures with exponential
//! backoff, and keeps a bounded store of [`TaskResult`]s. Every status
//! transition is published as a [`TaskEvent`] to subscribers.
//!
//! [`Priority`]: chatlog_core::Priority
//! [`TaskResult`]: chatlog_core::TaskResult
//! [`TaskEvent`]: chatlog_core::TaskEvent

pub mod metrics;
mod pool;
pub mod retry;
pub mod runner;
pub mod store;
pub mod task;
pub mod types;

pub use metrics::TaskTotals;
pub use retry::RetryPolicy;
pub use runner::Scheduler;
pub use store::ResultStore;
pub use task::{TaskError, Work};
pub use types::{QueueStats, SubmitOptions, TaskArgs};
