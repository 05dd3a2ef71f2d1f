//! Per-type consumer loops with concurrent handler fan-out

use crate::{
    ChangeEvent, EventHandler, EventQueueManager, EventType, FrozenRegistry, HandlerError,
    QueueError,
};
use botstream_shared::{
    exponential_backoff, EventMetrics, ExponentialBackoff, PerfTimer, RetryConfig, RetryExecutor,
};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Drains each event type's queue and delivers its events to the registered handlers.
///
/// Within one type, events are delivered strictly one after another: the next
/// event is taken only once every handler has succeeded or exhausted its
/// retries. Handlers of the same event run concurrently, and each type's loop is
/// independent of the others.
pub struct EventDispatcher {
    queues: Arc<EventQueueManager>,
    registry: FrozenRegistry,
    retry: Arc<RetryExecutor<ExponentialBackoff>>,
}

impl EventDispatcher {
    pub fn new(
        queues: Arc<EventQueueManager>,
        registry: FrozenRegistry,
        retry: RetryConfig,
    ) -> Self {
        Self {
            queues,
            registry,
            retry: Arc::new(exponential_backoff(retry)),
        }
    }

    pub fn event_types(&self) -> Vec<EventType> {
        self.registry.event_types().cloned().collect()
    }

    /// Start one consumer loop per event type with at least one handler.
    ///
    /// Returns the number of loops started.
    pub fn spawn(self, shutdown: CancellationToken, tasks: &mut JoinSet<()>) -> usize {
        let event_types = self.event_types();
        let dispatcher = Arc::new(self);

        for event_type in &event_types {
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            let event_type = event_type.clone();
            tasks.spawn(async move { dispatcher.consume(event_type, shutdown).await });
        }

        info!(consumers = event_types.len(), "Event dispatcher started");
        event_types.len()
    }

    #[instrument(name = "consumer", skip(self, shutdown), fields(event_type = %event_type))]
    async fn consume(self: Arc<Self>, event_type: EventType, shutdown: CancellationToken) {
        info!(
            handlers = self.registry.handlers(&event_type).len(),
            "Consumer loop started"
        );

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.queues.take(&event_type) => match next {
                    Ok(event) => event,
                    Err(QueueError::Stopped) => break,
                    Err(e) => {
                        error!(error = %e, "Queue failure, stopping consumer loop");
                        break;
                    }
                },
            };

            // Dropping the delivery aborts its in-flight handler tasks.
            let event_id = event.id;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    warn!(event_id = %event_id, "Cancelled during delivery");
                    break;
                }
                _ = self.deliver(&event_type, event) => {}
            }
        }

        info!("Consumer loop stopped");
    }

    async fn deliver(&self, event_type: &EventType, event: Arc<ChangeEvent>) {
        let handlers = self.registry.handlers(event_type);
        debug!(event_id = %event.id, handlers = handlers.len(), "Delivering event");

        let mut fanout = JoinSet::new();
        for handler in handlers.iter().cloned() {
            let span = info_span!(
                "handler",
                event_type = %event_type,
                table = %event.table,
                operation = %event.operation,
                event_id = %event.id,
                handler = handler.name(),
            );
            let invocation = invoke(handler, event.clone(), self.retry.clone(), event_type.clone());
            fanout.spawn(invocation.instrument(span));
        }

        while let Some(result) = fanout.join_next().await {
            if let Err(e) = result {
                error!(
                    event_type = %event_type,
                    event_id = %event.id,
                    error = %e,
                    "Handler task failed"
                );
            }
        }
    }
}

/// How one handler invocation ended
#[derive(Debug)]
enum Outcome {
    Succeeded { attempts: u32 },
    Exhausted { attempts: u32, error: HandlerError },
    Panicked { attempt: u32, message: String },
}

/// Run `handler` under the retry policy; a panic ends the invocation at the
/// attempt that raised it.
async fn run_handler(
    handler: &dyn EventHandler,
    event: &ChangeEvent,
    retry: &RetryExecutor<ExponentialBackoff>,
) -> Outcome {
    let current = AtomicU32::new(0);
    let attempts = retry.execute(|attempt| {
        current.store(attempt, Ordering::Relaxed);
        handler.handle(event)
    });

    match AssertUnwindSafe(attempts).catch_unwind().await {
        Ok(Ok(((), attempts))) => Outcome::Succeeded { attempts },
        Ok(Err(exhausted)) => Outcome::Exhausted {
            attempts: exhausted.attempts,
            error: exhausted.last_error,
        },
        Err(payload) => Outcome::Panicked {
            attempt: current.load(Ordering::Relaxed),
            message: panic_message(payload.as_ref()),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// One handler invocation wrapped in the retry policy
async fn invoke(
    handler: Arc<dyn EventHandler>,
    event: Arc<ChangeEvent>,
    retry: Arc<RetryExecutor<ExponentialBackoff>>,
    event_type: EventType,
) {
    let timer = PerfTimer::new("botstream_handler_duration_seconds")
        .with_label("event_type", event_type.as_str());

    match run_handler(handler.as_ref(), &event, &retry).await {
        Outcome::Succeeded { attempts } => {
            debug!(
                attempts,
                elapsed_ms = timer.elapsed().as_millis() as u64,
                "Handler succeeded"
            );
            EventMetrics::handler_succeeded(event_type.as_str(), attempts);
        }
        Outcome::Exhausted { attempts, error } => {
            error!(
                event_type = %event_type,
                table = %event.table,
                operation = %event.operation,
                attempt = attempts,
                error = %error,
                "Handler failed after exhausting retries"
            );
            EventMetrics::handler_failed(event_type.as_str(), attempts);
        }
        Outcome::Panicked { attempt, message } => {
            error!(
                event_type = %event_type,
                table = %event.table,
                operation = %event.operation,
                attempt,
                error = %message,
                "Handler panicked"
            );
            EventMetrics::handler_failed(event_type.as_str(), attempt);
        }
    }
}
