use crate::models::MessageStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The gateway request could not be completed.
    #[error("gateway transport error: {0}")]
    Transport(String),

    #[error("gateway protocol error: {0}")]
    Protocol(String),

    #[error("message {0} not found")]
    NotFound(i64),

    #[error("invalid status transition for message {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: i64,
        from: MessageStatus,
        to: MessageStatus,
    },

    /// Another dispatch pass took over the message after this claim's lease ran out.
    #[error("claim on message {0} was lost")]
    ClaimLost(i64),

    #[error("limit must be positive, got {0}")]
    InvalidLimit(i64),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<envy::Error> for Error {
    fn from(e: envy::Error) -> Self {
        Error::Configuration(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
