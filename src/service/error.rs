//! Error types for service requests

use crate::core::error::SumsError;
use thiserror::Error;

/// Service result type
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Service request errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Engine operation failed
    #[error(transparent)]
    Sums(#[from] SumsError),

    /// Caller cancelled the request
    #[error("Request cancelled")]
    Cancelled,

    /// No answer within the operation's time limit
    #[error("Request timed out")]
    Timeout,

    /// Shutdown requested; no new sessions
    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("Unknown session: {0}")]
    UnknownSession(u64),

    /// Worker behind a channel has gone away
    #[error("Worker channel closed")]
    ChannelClosed,

    /// Blocking task panicked or was aborted
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
