/// Errors surfaced by the notification hub.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("Notification hub is not running")]
    Stopped,

    #[error("Invalid client message: {0}")]
    InvalidMessage(String),
}
