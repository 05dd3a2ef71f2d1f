//! Upstream change feeds and the client that pumps them into the queues

use crate::{
    ChangeEvent, CoreError, EventQueueManager, Operation, QueueError, Result, TransportError,
};
use async_trait::async_trait;
use botstream_shared::{Credential, EventMetrics, SubscriptionConfig};
use futures::{Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, Instrument};

/// Row change as framed by the upstream protocol
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeMessage {
    pub operation: Operation,
    /// Table named by the message; the subscription's table is used when absent
    pub table: Option<String>,
    pub key: Option<String>,
    pub value: serde_json::Value,
}

impl ChangeMessage {
    pub fn new(operation: Operation, value: serde_json::Value) -> Self {
        Self {
            operation,
            table: None,
            key: None,
            value,
        }
    }

    pub fn into_event(self, subscription_table: &str) -> ChangeEvent {
        let table = self.table.unwrap_or_else(|| subscription_table.to_string());
        let event = ChangeEvent::new(table, self.operation, self.value);
        match self.key {
            Some(key) => event.with_key(key),
            None => event,
        }
    }
}

/// Non-change messages; never forwarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    UpToDate,
    MustRefetch,
    Other(String),
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::UpToDate => f.write_str("up-to-date"),
            ControlMessage::MustRefetch => f.write_str("must-refetch"),
            ControlMessage::Other(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShapeMessage {
    Change(ChangeMessage),
    Control(ControlMessage),
}

/// Lazy, unbounded sequence of upstream messages for one subscription
pub type ShapeStream =
    Pin<Box<dyn Stream<Item = std::result::Result<ShapeMessage, TransportError>> + Send>>;

/// Source of change feeds
#[async_trait]
pub trait ShapeSource: Send + Sync {
    /// Open one authenticated subscription.
    ///
    /// Returns once the subscription is established; the stream then yields
    /// messages until it ends, fails, or is dropped.
    async fn open(
        &self,
        subscription: &SubscriptionConfig,
        credential: &Credential,
    ) -> std::result::Result<ShapeStream, TransportError>;
}

/// Pumps one subscription's change messages into the queue manager
pub struct ChangeStreamClient {
    subscription: SubscriptionConfig,
    stream: ShapeStream,
    queues: Arc<EventQueueManager>,
}

impl ChangeStreamClient {
    /// Open `subscription` on `source`. Dropping the returned client releases
    /// the upstream connection.
    pub async fn connect(
        source: &dyn ShapeSource,
        subscription: SubscriptionConfig,
        credential: &Credential,
        queues: Arc<EventQueueManager>,
    ) -> std::result::Result<Self, TransportError> {
        let stream = source.open(&subscription, credential).await?;
        info!(
            table = %subscription.table,
            filter = subscription.where_clause.as_deref().unwrap_or(""),
            "Subscription opened"
        );
        Ok(Self {
            subscription,
            stream,
            queues,
        })
    }

    pub fn subscription(&self) -> &SubscriptionConfig {
        &self.subscription
    }

    /// Read until cancelled, the upstream ends, or a failure occurs
    #[instrument(name = "subscription", skip_all, fields(table = %self.subscription.table))]
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Subscription cancelled, releasing upstream connection");
                    return Ok(());
                }
                next = self.stream.next() => next,
            };

            match next {
                None => {
                    info!("Upstream stream ended");
                    return Ok(());
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(ShapeMessage::Control(control))) => {
                    trace!(control = %control, "Ignoring control message");
                }
                Some(Ok(ShapeMessage::Change(change))) => {
                    let event = change.into_event(&self.subscription.table);
                    if !self.forward(event)? {
                        info!("Queues closed, stopping subscription");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns `false` once the queues have been shut down
    fn forward(&self, event: ChangeEvent) -> Result<bool> {
        let event_type = event.event_type();
        EventMetrics::event_received(event_type.as_str(), &event.table);
        debug!(
            event_type = %event_type,
            operation = %event.operation,
            event_id = %event.id,
            "Received change"
        );

        match self.queues.offer(event) {
            Ok(_) => Ok(true),
            Err(QueueError::Stopped) => Ok(false),
            Err(e) => Err(CoreError::Queue(e)),
        }
    }

    /// Run as an independent task; a failure is logged and ends only this task
    pub fn spawn(self, shutdown: CancellationToken, tasks: &mut JoinSet<()>) {
        let table = self.subscription.table.clone();
        tasks.spawn(
            async move {
                if let Err(error) = self.run(shutdown).await {
                    error!(table = %table, error = %error, "Subscription terminated");
                    EventMetrics::subscription_failed(&table);
                }
            }
            .in_current_span(),
        );
    }
}

type FeedItem = std::result::Result<ShapeMessage, TransportError>;

/// In-memory shape source fed through [`ShapeFeed`] handles
#[derive(Default)]
pub struct InMemoryShapeSource {
    receivers: Mutex<HashMap<String, mpsc::UnboundedReceiver<FeedItem>>>,
    failing: Mutex<HashSet<String>>,
}

impl InMemoryShapeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the feed served for `table`; replaces any unopened feed
    pub fn feed(&self, table: impl Into<String>) -> ShapeFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.into(), rx);
        ShapeFeed { tx }
    }

    /// Make `open` fail for `table`
    pub fn fail_on_open(&self, table: impl Into<String>) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.into());
    }
}

#[async_trait]
impl ShapeSource for InMemoryShapeSource {
    async fn open(
        &self,
        subscription: &SubscriptionConfig,
        _credential: &Credential,
    ) -> std::result::Result<ShapeStream, TransportError> {
        let table = &subscription.table;
        if self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(table)
        {
            return Err(TransportError::connect(table.as_str(), "connection refused"));
        }

        let rx = self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(table)
            .ok_or_else(|| TransportError::connect(table.as_str(), "no feed for table"))?;

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

/// Producer side of an in-memory feed
#[derive(Clone)]
pub struct ShapeFeed {
    tx: mpsc::UnboundedSender<FeedItem>,
}

impl ShapeFeed {
    /// Returns `false` once the subscription side is gone
    pub fn send(&self, message: ShapeMessage) -> bool {
        self.tx.send(Ok(message)).is_ok()
    }

    pub fn change(&self, operation: Operation, value: serde_json::Value) -> bool {
        self.send(ShapeMessage::Change(ChangeMessage::new(operation, value)))
    }

    pub fn up_to_date(&self) -> bool {
        self.send(ShapeMessage::Control(ControlMessage::UpToDate))
    }

    pub fn fail(&self, error: TransportError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    /// Whether the subscription has been torn down
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
