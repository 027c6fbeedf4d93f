//! Live task-status hub.
//!
//! This crate provides:
//! - `Hub`: routes scheduler task events to the connections subscribed to
//!   each task, plus named broadcast rooms and direct notifications
//! - `protocol`: the `{"type", "data"}` JSON frames exchanged with clients
//! - A liveness sweep that drops connections with stale heartbeats

pub mod connection;
pub mod error;
pub mod hub;
pub mod protocol;
mod registry;

pub use connection::{ClientSummary, ConnectionId, ConnectionMeta};
pub use error::HubError;
pub use hub::Hub;
pub use protocol::{ClientMessage, NotificationPayload, ServerEvent};
pub use registry::HubStats;
