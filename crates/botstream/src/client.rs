//! Bot-facing pipeline facade

use crate::{AuthContext, PipelineError, PipelineState};
use botstream_core::{
    ChangeStreamClient, EventDispatcher, EventHandler, EventQueueManager, EventType, FnHandler,
    HandlerRegistry, ShapeSource, TypedHandler,
};
use botstream_shape::HttpShapeSource;
use botstream_shared::BotStreamConfig;
use config::ConfigError;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Streams table changes into registered handlers.
///
/// Handlers are registered first; [`BotClient::start`] then opens every
/// configured subscription and starts one consumer loop per event type.
pub struct BotClient {
    config: BotStreamConfig,
    auth: AuthContext,
    source: Arc<dyn ShapeSource>,
    queues: Arc<EventQueueManager>,
    registry: Option<HandlerRegistry>,
    state: Arc<watch::Sender<PipelineState>>,
    shutdown: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
}

impl BotClient {
    /// Build a client reading from the configured HTTP shape endpoint
    pub fn new(config: BotStreamConfig) -> Result<Self, PipelineError> {
        let source = HttpShapeSource::new(&config.upstream)
            .map_err(|e| PipelineError::Config(ConfigError::Foreign(Box::new(e))))?;
        Self::with_source(config, Arc::new(source))
    }

    /// Build a client from defaults, `botstream.toml` and `BOTSTREAM__*` variables
    pub fn load() -> Result<Self, PipelineError> {
        Self::new(BotStreamConfig::load()?)
    }

    /// Build a client reading from `source`
    pub fn with_source(
        config: BotStreamConfig,
        source: Arc<dyn ShapeSource>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let auth = AuthContext::resolve(&config.upstream.credential)?;
        let queues = Arc::new(EventQueueManager::from_config(&config.queue)?);
        let (state, _) = watch::channel(PipelineState::Stopped);

        Ok(Self {
            config,
            auth,
            source,
            queues,
            registry: Some(HandlerRegistry::new()),
            state: Arc::new(state),
            shutdown: CancellationToken::new(),
            supervisor: None,
        })
    }

    /// Register an async closure over the raw row value
    pub fn on<F, Fut>(
        &mut self,
        event_type: impl Into<EventType>,
        handler: F,
    ) -> Result<&mut Self, PipelineError>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_handler(event_type, Arc::new(FnHandler::new(handler)))
    }

    /// Register an async closure over the row deserialized as `T`.
    ///
    /// A row that does not deserialize counts as a failed delivery.
    pub fn on_typed<T, F, Fut>(
        &mut self,
        event_type: impl Into<EventType>,
        handler: F,
    ) -> Result<&mut Self, PipelineError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_handler(event_type, Arc::new(TypedHandler::new(handler)))
    }

    /// Register a shared handler instance
    pub fn on_handler(
        &mut self,
        event_type: impl Into<EventType>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<&mut Self, PipelineError> {
        let registry = self.registry.as_mut().ok_or(PipelineError::RegistryFrozen)?;
        let event_type = event_type.into();
        if !registry.register(event_type.clone(), handler) {
            warn!(event_type = %event_type, "Handler already registered, ignoring duplicate");
        }
        Ok(self)
    }

    /// Open every subscription and start dispatching.
    ///
    /// If any subscription fails to open, or this future is dropped before it
    /// completes, the subscriptions already opened are closed and the client
    /// is back in `Stopped`. Such a client never ran, so `start` may be called
    /// again. Once a client has reached `Running` it cannot be started again.
    #[instrument(skip(self), fields(bot_id = %self.auth.bot_id()))]
    pub async fn start(&mut self) -> Result<(), PipelineError> {
        match self.state() {
            PipelineState::Starting | PipelineState::Running => {
                return Err(PipelineError::AlreadyRunning)
            }
            PipelineState::Stopping => return Err(PipelineError::NotRestartable),
            PipelineState::Stopped => {}
        }
        if self.registry.is_none() || self.shutdown.is_cancelled() {
            return Err(PipelineError::NotRestartable);
        }

        let starting = StartingGuard::enter(self.state.clone());
        info!(
            subscriptions = self.config.upstream.subscriptions.len(),
            capacity = self.queues.capacity(),
            strategy = %self.queues.strategy(),
            "Starting pipeline"
        );

        let mut clients = Vec::with_capacity(self.config.upstream.subscriptions.len());
        for subscription in &self.config.upstream.subscriptions {
            let connected = ChangeStreamClient::connect(
                self.source.as_ref(),
                subscription.clone(),
                &self.config.upstream.credential,
                self.queues.clone(),
            )
            .await;

            match connected {
                Ok(client) => clients.push(client),
                Err(source) => {
                    error!(
                        table = %subscription.table,
                        error = %source,
                        opened = clients.len(),
                        "Subscription failed to open, rolling back"
                    );
                    drop(clients);
                    return Err(PipelineError::Startup {
                        table: subscription.table.clone(),
                        source,
                    });
                }
            }
        }

        let registry = self.registry.take().unwrap_or_default().freeze();
        let mut tasks = JoinSet::new();
        for client in clients {
            client.spawn(self.shutdown.clone(), &mut tasks);
        }

        let dispatcher =
            EventDispatcher::new(self.queues.clone(), registry, self.config.retry.clone());
        let consumers = dispatcher.spawn(self.shutdown.clone(), &mut tasks);

        self.supervisor = Some(tokio::spawn(supervise(
            tasks,
            self.shutdown.clone(),
            self.queues.clone(),
            self.state.clone(),
        )));
        starting.complete(PipelineState::Running);
        info!(consumers, "Pipeline running");
        Ok(())
    }

    /// Cancel every task, close the queues and wait for the tasks to finish
    #[instrument(skip(self), fields(bot_id = %self.auth.bot_id()))]
    pub async fn stop(&mut self) -> Result<(), PipelineError> {
        match self.state() {
            PipelineState::Running | PipelineState::Stopping => {}
            _ => return Err(PipelineError::NotRunning),
        }

        info!("Stopping pipeline");
        self.state.send_replace(PipelineState::Stopping);
        self.shutdown.cancel();
        self.queues.shutdown();

        if let Some(supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.await {
                error!(error = %e, "Pipeline supervisor failed");
            }
        }

        self.state.send_replace(PipelineState::Stopped);
        Ok(())
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Observe lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn auth_context(&self) -> &AuthContext {
        &self.auth
    }

    /// Token bound to every pipeline task; cancelling it shuts the pipeline down
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn queues(&self) -> &Arc<EventQueueManager> {
        &self.queues
    }

    pub fn config(&self) -> &BotStreamConfig {
        &self.config
    }
}

impl Drop for BotClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.queues.shutdown();
    }
}

/// Publishes `Starting` and falls back to `Stopped` unless completed
struct StartingGuard {
    state: Arc<watch::Sender<PipelineState>>,
    completed: bool,
}

impl StartingGuard {
    fn enter(state: Arc<watch::Sender<PipelineState>>) -> Self {
        state.send_replace(PipelineState::Starting);
        Self {
            state,
            completed: false,
        }
    }

    fn complete(mut self, next: PipelineState) {
        self.completed = true;
        self.state.send_replace(next);
    }
}

impl Drop for StartingGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.state.send_replace(PipelineState::Stopped);
        }
    }
}

/// Owns the pipeline tasks; once the token is cancelled it closes the queues,
/// drains every task and publishes `Stopped`.
async fn supervise(
    mut tasks: JoinSet<()>,
    shutdown: CancellationToken,
    queues: Arc<EventQueueManager>,
    state: Arc<watch::Sender<PipelineState>>,
) {
    shutdown.cancelled().await;
    state.send_if_modified(|current| {
        if *current == PipelineState::Running {
            *current = PipelineState::Stopping;
            true
        } else {
            false
        }
    });
    queues.shutdown();

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(error = %e, "Pipeline task panicked");
            }
        }
    }

    state.send_replace(PipelineState::Stopped);
    info!("Pipeline stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use botstream_core::{InMemoryShapeSource, Operation, ShapeStream, TransportError};
    use botstream_shared::{Credential, SubscriptionConfig};
    use futures::StreamExt;
    use mockall::mock;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    mock! {
        Source {}

        #[async_trait]
        impl ShapeSource for Source {
            async fn open(
                &self,
                subscription: &SubscriptionConfig,
                credential: &Credential,
            ) -> Result<ShapeStream, TransportError>;
        }
    }

    fn config(tables: &[&str]) -> BotStreamConfig {
        let mut config = BotStreamConfig::default();
        config.upstream.credential = Credential::new("4711:secret");
        config.upstream.subscriptions =
            tables.iter().map(|t| SubscriptionConfig::new(*t)).collect();
        config.queue.capacity = 64;
        config.retry.max_retries = 0;
        config
    }

    type Recorded = Arc<Mutex<Vec<i64>>>;
    type Ack = futures::future::Ready<anyhow::Result<()>>;

    fn recorder() -> (
        Recorded,
        impl Fn(serde_json::Value) -> Ack + Send + Sync + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = move |value: serde_json::Value| {
            sink.lock().unwrap().push(value["n"].as_i64().unwrap());
            futures::future::ready(Ok::<(), anyhow::Error>(()))
        };
        (seen, handler)
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_end_to_end_delivery_per_type() {
        let source = Arc::new(InMemoryShapeSource::new());
        let messages = source.feed("messages");
        let channels = source.feed("channels");

        let mut client =
            BotClient::with_source(config(&["messages", "channels"]), source).unwrap();
        let (inserts, on_insert) = recorder();
        let (updates, on_update) = recorder();
        client
            .on("messages.insert", on_insert)
            .unwrap()
            .on("channels.update", on_update)
            .unwrap();

        client.start().await.unwrap();
        assert_eq!(client.state(), PipelineState::Running);

        for n in 0..10 {
            messages.change(Operation::Insert, json!({ "n": n }));
            channels.change(Operation::Update, json!({ "n": n }));
        }
        messages.up_to_date();

        wait_until(|| inserts.lock().unwrap().len() == 10 && updates.lock().unwrap().len() == 10)
            .await;
        assert_eq!(*inserts.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert_eq!(*updates.lock().unwrap(), (0..10).collect::<Vec<_>>());

        client.stop().await.unwrap();
        assert_eq!(client.state(), PipelineState::Stopped);
        assert!(messages.is_closed());
        assert!(channels.is_closed());
    }

    #[tokio::test]
    async fn test_typed_handler_receives_deserialized_rows() {
        #[derive(Deserialize)]
        struct Message {
            body: String,
        }

        let source = Arc::new(InMemoryShapeSource::new());
        let feed = source.feed("messages");
        let mut client = BotClient::with_source(config(&["messages"]), source).unwrap();

        let bodies = Arc::new(Mutex::new(Vec::new()));
        let sink = bodies.clone();
        client
            .on_typed("messages.insert", move |message: Message| {
                sink.lock().unwrap().push(message.body);
                async { Ok::<(), anyhow::Error>(()) }
            })
            .unwrap();

        client.start().await.unwrap();
        feed.change(Operation::Insert, json!({ "body": 42 }));
        feed.change(Operation::Insert, json!({ "body": "hi" }));

        wait_until(|| bodies.lock().unwrap().len() == 1).await;
        assert_eq!(*bodies.lock().unwrap(), vec!["hi".to_string()]);
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back_opened_subscriptions() {
        let source = Arc::new(InMemoryShapeSource::new());
        let messages = source.feed("messages");
        source.fail_on_open("channels");

        let mut client =
            BotClient::with_source(config(&["messages", "channels"]), source.clone()).unwrap();
        let (_, on_insert) = recorder();
        client.on("messages.insert", on_insert).unwrap();

        match client.start().await {
            Err(PipelineError::Startup { table, .. }) => assert_eq!(table, "channels"),
            other => panic!("expected startup failure, got {:?}", other),
        }
        assert_eq!(client.state(), PipelineState::Stopped);
        assert!(messages.is_closed());

        // Registration stays open until a successful start
        let (_, again) = recorder();
        assert!(client.on("messages.update", again).is_ok());
    }

    #[tokio::test]
    async fn test_later_subscriptions_are_not_opened_after_a_failure() {
        let mut source = MockSource::new();
        source
            .expect_open()
            .withf(|subscription, _| subscription.table == "messages")
            .times(1)
            .returning(|_, _| Ok(futures::stream::pending().boxed()));
        source
            .expect_open()
            .withf(|subscription, _| subscription.table == "channels")
            .times(1)
            .returning(|subscription, _| {
                Err(TransportError::connect(subscription.table.as_str(), "refused"))
            });
        source
            .expect_open()
            .withf(|subscription, _| subscription.table == "reactions")
            .times(0);

        let mut client = BotClient::with_source(
            config(&["messages", "channels", "reactions"]),
            Arc::new(source),
        )
        .unwrap();

        assert!(matches!(
            client.start().await,
            Err(PipelineError::Startup { .. })
        ));
        assert_eq!(client.state(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_registration_after_start_is_rejected() {
        let source = Arc::new(InMemoryShapeSource::new());
        let _feed = source.feed("messages");
        let mut client = BotClient::with_source(config(&["messages"]), source).unwrap();
        client.start().await.unwrap();

        let (_, late) = recorder();
        assert!(matches!(
            client.on("messages.insert", late),
            Err(PipelineError::RegistryFrozen)
        ));
        assert!(matches!(client.start().await, Err(PipelineError::AlreadyRunning)));
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stopped_client_cannot_restart() {
        let source = Arc::new(InMemoryShapeSource::new());
        let _feed = source.feed("messages");
        let mut client = BotClient::with_source(config(&["messages"]), source).unwrap();

        assert!(matches!(client.stop().await, Err(PipelineError::NotRunning)));

        client.start().await.unwrap();
        client.stop().await.unwrap();

        assert!(matches!(client.start().await, Err(PipelineError::NotRestartable)));
        assert!(matches!(client.stop().await, Err(PipelineError::NotRunning)));
    }

    #[tokio::test]
    async fn test_stop_while_consumers_are_parked() {
        let source = Arc::new(InMemoryShapeSource::new());
        let _feed = source.feed("messages");
        let mut client = BotClient::with_source(config(&["messages"]), source).unwrap();
        let (_, handler) = recorder();
        client.on("messages.insert", handler).unwrap();
        client.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), client.stop())
            .await
            .expect("stop should not hang")
            .unwrap();
        assert!(client.queues().is_shutdown());
    }

    #[tokio::test]
    async fn test_external_cancellation_shuts_down_without_stop() {
        let source = Arc::new(InMemoryShapeSource::new());
        let feed = source.feed("messages");
        let mut client = BotClient::with_source(config(&["messages"]), source).unwrap();
        let (_, handler) = recorder();
        client.on("messages.insert", handler).unwrap();
        client.start().await.unwrap();

        let mut states = client.subscribe_state();
        client.cancellation_token().cancel();
        tokio::time::timeout(
            Duration::from_secs(1),
            states.wait_for(|state| *state == PipelineState::Stopped),
        )
        .await
        .expect("state should reach stopped once the tasks are drained")
        .unwrap();

        assert!(client.queues().is_shutdown());
        assert!(feed.is_closed());
        assert!(matches!(client.stop().await, Err(PipelineError::NotRunning)));
        assert!(matches!(client.start().await, Err(PipelineError::NotRestartable)));
    }

    /// Delegates to an in-memory source, except `open` never returns for `stalled`
    struct StallingSource {
        inner: InMemoryShapeSource,
        stalled: &'static str,
    }

    #[async_trait]
    impl ShapeSource for StallingSource {
        async fn open(
            &self,
            subscription: &SubscriptionConfig,
            credential: &Credential,
        ) -> Result<ShapeStream, TransportError> {
            if subscription.table == self.stalled {
                return futures::future::pending().await;
            }
            self.inner.open(subscription, credential).await
        }
    }

    #[tokio::test]
    async fn test_abandoned_start_rolls_back_to_stopped() {
        let inner = InMemoryShapeSource::new();
        let messages = inner.feed("messages");
        let source = Arc::new(StallingSource {
            inner,
            stalled: "channels",
        });
        let mut client =
            BotClient::with_source(config(&["messages", "channels"]), source.clone()).unwrap();

        let abandoned = tokio::time::timeout(Duration::from_millis(50), client.start()).await;
        assert!(abandoned.is_err());
        assert_eq!(client.state(), PipelineState::Stopped);
        assert!(messages.is_closed());
        assert!(matches!(client.stop().await, Err(PipelineError::NotRunning)));

        // The client never ran, so another attempt goes back to opening subscriptions
        let _reopened = source.inner.feed("messages");
        let retried = tokio::time::timeout(Duration::from_millis(50), client.start()).await;
        assert!(retried.is_err());
        assert_eq!(client.state(), PipelineState::Stopped);
    }

    #[test]
    fn test_construction_validates_inputs() {
        let source: Arc<dyn ShapeSource> = Arc::new(InMemoryShapeSource::new());

        let mut bad_token = config(&["messages"]);
        bad_token.upstream.credential = Credential::new("not-a-token");
        assert!(matches!(
            BotClient::with_source(bad_token, source.clone()),
            Err(PipelineError::InvalidCredential(_))
        ));

        let mut zero_capacity = config(&["messages"]);
        zero_capacity.queue.capacity = 0;
        assert!(matches!(
            BotClient::with_source(zero_capacity, source.clone()),
            Err(PipelineError::Config(_))
        ));

        let client = BotClient::with_source(config(&["messages"]), source).unwrap();
        assert_eq!(client.auth_context().bot_id(), "4711");
        assert_eq!(client.state(), PipelineState::Stopped);
    }
}
