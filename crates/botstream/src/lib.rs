//! `botstream` façade: real-time table changes delivered to async bot handlers.
//!
//! ```no_run
//! use botstream::{BotClient, BotStreamConfig};
//!
//! # async fn run(config: BotStreamConfig) -> anyhow::Result<()> {
//! let mut client = BotClient::new(config)?;
//! client.on("messages.insert", |row| async move {
//!     println!("new message: {}", row);
//!     Ok::<_, anyhow::Error>(())
//! })?;
//! client.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod error;
pub mod state;

pub use auth::AuthContext;
pub use client::BotClient;
pub use error::PipelineError;
pub use state::PipelineState;

/// Re-export the event model, queues and dispatcher at the crate root.
#[doc(inline)]
pub use botstream_core::{
    ChangeEvent, EventHandler, EventQueueManager, EventType, HandlerError, Operation,
    ShapeSource, TransportError,
};

pub use botstream_shared::{
    BackpressureStrategy, BotStreamConfig, Credential, ObservabilitySystem, SubscriptionConfig,
};

/// Nested access to the member crates, e.g. `botstream::core::InMemoryShapeSource`.
pub use botstream_core as core;
pub use botstream_shape as shape;
pub use botstream_shared as shared;
