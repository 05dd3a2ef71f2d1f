//! HTTP shape-stream change source for botstream
//!
//! Each subscription is a sequence of `GET /v1/shape` requests. The first
//! request replays the table (or starts at `now`), later requests resume from
//! the offset the server returned and long-poll once the shape is up to date.

use async_trait::async_trait;
use botstream_core::{ControlMessage, ShapeMessage, ShapeSource, ShapeStream, TransportError};
use botstream_shared::{Credential, SubscriptionConfig, UpstreamConfig};
use futures::StreamExt;
use std::collections::VecDeque;
use tracing::{debug, info, instrument};

pub mod config;
pub mod connection;
pub mod offset;
pub mod protocol;

pub use config::*;
pub use connection::*;
pub use offset::*;
pub use protocol::*;

/// [`ShapeSource`] backed by the shape HTTP endpoint
#[derive(Debug, Clone)]
pub struct HttpShapeSource {
    connection: ShapeConnection,
}

impl HttpShapeSource {
    pub fn new(config: &UpstreamConfig) -> Result<Self, TransportError> {
        Self::with_config(&ShapeClientConfig::from(config))
    }

    pub fn with_config(config: &ShapeClientConfig) -> Result<Self, TransportError> {
        Ok(Self {
            connection: ShapeConnection::new(config)?,
        })
    }
}

#[async_trait]
impl ShapeSource for HttpShapeSource {
    #[instrument(skip_all, fields(table = %subscription.table))]
    async fn open(
        &self,
        subscription: &SubscriptionConfig,
        credential: &Credential,
    ) -> Result<ShapeStream, TransportError> {
        let mut session = ShapeSession {
            connection: self.connection.clone(),
            subscription: subscription.clone(),
            credential: credential.clone(),
            cursor: ShapeCursor::new(subscription.start_from_now),
            pending: VecDeque::new(),
            done: false,
        };

        // The first request doubles as the connection check
        session
            .fetch()
            .await
            .map_err(|e| TransportError::connect(subscription.table.as_str(), e))?;
        info!(handle = ?session.cursor.handle(), "Shape session established");

        Ok(futures::stream::unfold(session, ShapeSession::next).boxed())
    }
}

/// Request state of one open subscription
struct ShapeSession {
    connection: ShapeConnection,
    subscription: SubscriptionConfig,
    credential: Credential,
    cursor: ShapeCursor,
    pending: VecDeque<ShapeMessage>,
    done: bool,
}

impl ShapeSession {
    async fn fetch(&mut self) -> Result<(), TransportError> {
        let outcome = self
            .connection
            .fetch(&self.subscription, &self.credential, &self.cursor)
            .await?;
        self.cursor
            .advance(outcome.handle, outcome.offset, outcome.cursor);
        self.pending.extend(outcome.messages);
        Ok(())
    }

    async fn next(mut self) -> Option<(Result<ShapeMessage, TransportError>, Self)> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                match &message {
                    ShapeMessage::Control(ControlMessage::UpToDate) => {
                        self.cursor.mark_up_to_date();
                    }
                    ShapeMessage::Control(ControlMessage::MustRefetch) => {
                        debug!(table = %self.subscription.table, "Resetting shape cursor");
                        self.cursor.reset();
                        self.pending.clear();
                    }
                    _ => {}
                }
                return Some((Ok(message), self));
            }

            if self.done {
                return None;
            }

            if let Err(e) = self.fetch().await {
                self.done = true;
                return Some((Err(e), self));
            }
        }
    }
}
