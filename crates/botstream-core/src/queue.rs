//! Per-event-type bounded queues with a uniform overflow policy

use crate::{ChangeEvent, EventType, QueueError};
use botstream_shared::{BackpressureStrategy, EventMetrics, QueueConfig};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Outcome of offering an event to its queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Buffered without displacing anything
    Admitted,
    /// Buffered after evicting the oldest queued event
    EvictedOldest,
    /// Discarded because the queue was full
    DroppedNewest,
}

impl Admission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Admission::Admitted => "admitted",
            Admission::EvictedOldest => "evicted_oldest",
            Admission::DroppedNewest => "dropped_newest",
        }
    }
}

/// FIFO buffer for one event type.
///
/// `take` parks on a [`Notify`] instead of polling; closing the queue wakes every
/// parked caller with [`QueueError::Stopped`].
struct EventQueue {
    buffer: Mutex<VecDeque<Arc<ChangeEvent>>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
    strategy: BackpressureStrategy,
}

impl EventQueue {
    fn new(capacity: usize, strategy: BackpressureStrategy) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity,
            strategy,
        }
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<Arc<ChangeEvent>>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, event: Arc<ChangeEvent>) -> Result<(Admission, usize), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Stopped);
        }

        let (admission, len) = {
            let mut buffer = self.buffer();
            let admission = if buffer.len() < self.capacity {
                buffer.push_back(event);
                Admission::Admitted
            } else if self.strategy.evicts_oldest() {
                buffer.pop_front();
                buffer.push_back(event);
                Admission::EvictedOldest
            } else {
                Admission::DroppedNewest
            };
            (admission, buffer.len())
        };

        if admission != Admission::DroppedNewest {
            self.notify.notify_one();
        }
        Ok((admission, len))
    }

    async fn take(&self) -> Result<Arc<ChangeEvent>, QueueError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking state so a close or push between
            // the check and the await still wakes us.
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return Err(QueueError::Stopped);
            }
            if let Some(event) = self.buffer().pop_front() {
                return Ok(event);
            }

            notified.await;
        }
    }

    fn poll(&self) -> Option<Arc<ChangeEvent>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        self.buffer().pop_front()
    }

    fn len(&self) -> usize {
        self.buffer().len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Owns one lazily created queue per event type.
///
/// Capacity and overflow policy are fixed at construction and shared by every
/// queue. Queues live until [`EventQueueManager::shutdown`].
pub struct EventQueueManager {
    queues: DashMap<EventType, Arc<EventQueue>>,
    capacity: usize,
    strategy: BackpressureStrategy,
    closed: AtomicBool,
}

impl EventQueueManager {
    pub fn new(capacity: usize, strategy: BackpressureStrategy) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::InvalidCapacity(capacity));
        }
        Ok(Self {
            queues: DashMap::new(),
            capacity,
            strategy,
            closed: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &QueueConfig) -> Result<Self, QueueError> {
        Self::new(config.capacity, config.backpressure_strategy)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn strategy(&self) -> BackpressureStrategy {
        self.strategy
    }

    /// Get-or-create the queue for `event_type`
    fn queue(&self, event_type: &EventType) -> Arc<EventQueue> {
        if let Some(queue) = self.queues.get(event_type) {
            return queue.clone();
        }

        let queue = self
            .queues
            .entry(event_type.clone())
            .or_insert_with(|| {
                debug!(event_type = %event_type, capacity = self.capacity, "Creating event queue");
                Arc::new(EventQueue::new(self.capacity, self.strategy))
            })
            .clone();

        // A queue created concurrently with shutdown may have been missed by it.
        if self.closed.load(Ordering::SeqCst) {
            queue.close();
        }
        queue
    }

    /// Route an event to its type's queue, applying the overflow policy
    pub fn offer(&self, event: ChangeEvent) -> Result<Admission, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let event_type = event.event_type();
        let queue = self.queue(&event_type);
        let (admission, len) = queue.push(Arc::new(event))?;

        match admission {
            Admission::Admitted => {}
            Admission::EvictedOldest => debug!(
                event_type = %event_type,
                capacity = self.capacity,
                "Queue full, evicted oldest event"
            ),
            Admission::DroppedNewest => warn!(
                event_type = %event_type,
                capacity = self.capacity,
                "Queue full, dropped incoming event"
            ),
        }
        EventMetrics::queue_admission(event_type.as_str(), admission.as_str());
        EventMetrics::queue_size(len, event_type.as_str());

        Ok(admission)
    }

    /// Wait for the next event of `event_type`
    pub async fn take(&self, event_type: &EventType) -> Result<Arc<ChangeEvent>, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }
        self.queue(event_type).take().await
    }

    /// Next event of `event_type` if one is buffered
    pub fn poll(&self, event_type: &EventType) -> Option<Arc<ChangeEvent>> {
        self.queues.get(event_type).and_then(|queue| queue.poll())
    }

    pub fn size(&self, event_type: &EventType) -> usize {
        self.queues.get(event_type).map(|queue| queue.len()).unwrap_or(0)
    }

    pub fn event_types(&self) -> Vec<EventType> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Close every queue and wake parked `take` callers with [`QueueError::Stopped`]
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.queues.iter() {
            entry.value().close();
        }
        info!(queues = self.queues.len(), "Event queues shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
