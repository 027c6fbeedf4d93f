use chatlog_notify::Hub;
use chatlog_scheduler::Scheduler;

/// Shared handler state. Both handles are cheap clones over channels.
pub struct AppState {
    pub scheduler: Scheduler,
    pub hub: Hub,
}
