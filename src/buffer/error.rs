use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("Event queue is full")]
    Full,

    #[error("Event queue is closed")]
    Closed,

    #[error("Timed out waiting for queue space")]
    Timeout,
}

impl QueueError {
    /// Whether a later attempt with the same event may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            QueueError::Full | QueueError::Timeout => true,
            QueueError::Closed => false,
        }
    }
}
