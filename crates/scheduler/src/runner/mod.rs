//! Task scheduler runner -- owns the queue, the result store, and the workers.
//!
//! Split into focused submodules:
//! - `core`: the cloneable `Scheduler` handle and its public operations
//! - `messages`: commands sent from handles to the coordinating flow
//! - `scheduling`: priority queue with not-before eligibility
//! - `execution`: the coordinating flow, attempt execution, retries, cleanup

mod core;
mod execution;
mod messages;
mod scheduling;

pub use self::core::Scheduler;
