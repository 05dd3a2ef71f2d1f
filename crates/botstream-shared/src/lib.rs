//! Shared configuration, retry policies and observability for botstream

pub mod config;
pub mod observability;
pub mod retry;

pub use config::*;
pub use observability::*;
pub use retry::*;
