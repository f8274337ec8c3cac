use thiserror::Error;

/// Top-level error type for the reporter.
#[derive(Error, Debug)]
pub enum ReporterError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::app::ConfigError),

    #[error("Client error: {0}")]
    Client(#[from] crate::sender::ClientError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] crate::sender::SerializationError),

    #[error("Queue error: {0}")]
    Queue(#[from] crate::buffer::QueueError),

    #[error("Reporter already started")]
    AlreadyStarted,

    #[error("Reporter is closed")]
    Closed,

    #[error("Reporter must be started inside a tokio runtime")]
    NoRuntime,
}
