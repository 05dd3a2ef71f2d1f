//! Error types for botstream core

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure opening or reading one subscription. Fatal only to that subscription.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect subscription for table `{table}`: {source}")]
    Connect {
        table: String,
        #[source]
        source: BoxError,
    },

    #[error("Upstream returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Failed to read from upstream: {0}")]
    Read(#[source] BoxError),

    #[error("Malformed upstream payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn connect<E>(table: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        TransportError::Connect {
            table: table.into(),
            source: source.into(),
        }
    }
}

/// Queue invariant violations and the terminal stopped signal
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Pipeline stopped")]
    Stopped,

    #[error("Queue capacity must be at least 1, got {0}")]
    InvalidCapacity(usize),
}

/// A handler's own failure
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Payload does not match the handler's type: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
