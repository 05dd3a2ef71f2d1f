//! Handler registration, frozen once the pipeline starts

use crate::{ChangeEvent, EventType, HandlerError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Application code receiving change events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError>;

    /// Name used in log records
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Adapts an async closure over the raw row value
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        (self.f)(event.value.clone()).await.map_err(HandlerError::from)
    }

    fn name(&self) -> &str {
        std::any::type_name::<F>()
    }
}

/// Adapts an async closure over a deserialized row
pub struct TypedHandler<T, F> {
    f: F,
    _payload: PhantomData<fn() -> T>,
}

impl<T, F, Fut> TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> EventHandler for TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        let payload: T = serde_json::from_value(event.value.clone())?;
        (self.f)(payload).await.map_err(HandlerError::from)
    }

    fn name(&self) -> &str {
        std::any::type_name::<F>()
    }
}

fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    // Compare data pointers only; vtable pointers differ across codegen units.
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Configuration-phase registry
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventType, Vec<Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`.
    ///
    /// Returns `false` if this exact handler instance is already registered for
    /// the type; it will still be dispatched only once per event.
    pub fn register(&mut self, event_type: EventType, handler: Arc<dyn EventHandler>) -> bool {
        let handlers = self.handlers.entry(event_type).or_default();
        if handlers.iter().any(|existing| same_handler(existing, &handler)) {
            return false;
        }
        handlers.push(handler);
        true
    }

    pub fn handler_count(&self, event_type: &EventType) -> usize {
        self.handlers.get(event_type).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// End the configuration phase
    pub fn freeze(self) -> FrozenRegistry {
        FrozenRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}

/// Immutable registry shared by the consumer loops
#[derive(Clone)]
pub struct FrozenRegistry {
    handlers: Arc<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
}

impl FrozenRegistry {
    pub fn event_types(&self) -> impl Iterator<Item = &EventType> {
        self.handlers
            .iter()
            .filter(|(_, handlers)| !handlers.is_empty())
            .map(|(event_type, _)| event_type)
    }

    pub fn handlers(&self, event_type: &EventType) -> &[Arc<dyn EventHandler>] {
        self.handlers
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.event_types().next().is_none()
    }
}
