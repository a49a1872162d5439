//! Error types for the server core.

use shared::CodecError;
use thiserror::Error;

/// Errors raised by game-logic handlers and scheduled jobs.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a handler or job body.
pub type HandlerResult = std::result::Result<(), HandlerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Framing or payload decode failure. Fatal to the connection only.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] CodecError),

    #[error("unknown message type {0}")]
    UnknownMessageType(u16),

    #[error("message type {0} registered twice")]
    DuplicateMessageType(u16),

    #[error("processor '{0}' queue is full")]
    QueueFull(String),

    #[error("processor '{0}' is stopped")]
    ProcessorStopped(String),

    #[error("no processor named '{0}'")]
    UnknownProcessor(String),

    #[error("handler failed for owner {owner:?} type {type_id:?}: {reason}")]
    HandlerFailure {
        owner: Option<u32>,
        type_id: Option<u16>,
        reason: String,
    },

    #[error("owner {0} is gone")]
    OwnerGone(u32),

    #[error("job '{0}' is still running")]
    JobOverlap(String),

    #[error("scheduler configuration: {0}")]
    SchedulerConfig(String),

    #[error("invalid random range {0}")]
    InvalidRange(String),

    #[error("randomness service unavailable")]
    RandomnessUnavailable,

    #[error("configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;

impl ServerError {
    /// Whether this error must close the connection that produced it.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, ServerError::MalformedFrame(_) | ServerError::Io(_))
    }
}
