pub mod config;
pub mod task;

pub use config::{Config, HubConfig, SchedulerConfig, ServerConfig};
pub use task::*;
