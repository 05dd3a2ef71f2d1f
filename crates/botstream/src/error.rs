//! Pipeline-level errors

use botstream_core::{QueueError, TransportError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to start subscription for table `{table}`: {source}")]
    Startup {
        table: String,
        #[source]
        source: TransportError,
    },

    #[error("Invalid bot credential: {0}")]
    InvalidCredential(String),

    #[error("Handlers cannot be registered once the pipeline has started")]
    RegistryFrozen,

    #[error("Pipeline is already running")]
    AlreadyRunning,

    #[error("Pipeline is not running")]
    NotRunning,

    #[error("Pipeline has been stopped and cannot be started again")]
    NotRestartable,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}
