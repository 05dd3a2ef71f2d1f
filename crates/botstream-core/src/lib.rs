//! Change events, per-type queues and handler dispatch for botstream
//!
//! Data flows from a [`ChangeStreamClient`] into the [`EventQueueManager`], and
//! from there through the [`EventDispatcher`] to application [`EventHandler`]s.

pub mod dispatcher;
pub mod error;
pub mod event;
pub mod queue;
pub mod registry;
pub mod stream;

pub use dispatcher::*;
pub use error::*;
pub use event::*;
pub use queue::*;
pub use registry::*;
pub use stream::*;
