//! Configuration management for botstream components

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Main configuration structure for botstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotStreamConfig {
    /// Per-type event queue configuration
    pub queue: QueueConfig,

    /// Handler retry configuration
    pub retry: RetryConfig,

    /// Upstream shape-stream configuration
    pub upstream: UpstreamConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of buffered events per event type
    pub capacity: usize,

    /// What to do when a queue is full
    pub backpressure_strategy: BackpressureStrategy,
}

/// Admission rule applied when a bounded queue is full
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BackpressureStrategy {
    /// Evict the oldest buffered event, then admit the new one
    Sliding,
    /// Same behavior as `Sliding`
    DropOldest,
    /// Discard the incoming event
    DropNewest,
}

impl BackpressureStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackpressureStrategy::Sliding => "sliding",
            BackpressureStrategy::DropOldest => "drop-oldest",
            BackpressureStrategy::DropNewest => "drop-newest",
        }
    }

    /// Whether a full queue evicts its head to make room
    pub fn evicts_oldest(&self) -> bool {
        matches!(
            self,
            BackpressureStrategy::Sliding | BackpressureStrategy::DropOldest
        )
    }
}

impl fmt::Display for BackpressureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    pub base_delay_ms: u64,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,

    /// Maximum jitter in milliseconds
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the shape-stream server
    pub base_url: String,

    /// Bot token used as bearer credential
    pub credential: Credential,

    /// Per-request timeout in seconds, must exceed the server's long-poll window
    pub request_timeout_secs: u64,

    /// Change feeds opened at start
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// One logical change feed: a table plus optional row filter and column projection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// Table name
    pub table: String,

    /// Row filter expression
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<String>,

    /// Projected columns (`None` = all columns)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,

    /// Skip the initial snapshot and only receive changes from now on
    #[serde(default)]
    pub start_from_now: bool,
}

impl SubscriptionConfig {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            where_clause: None,
            columns: None,
            start_from_now: false,
        }
    }

    pub fn with_where(mut self, clause: impl Into<String>) -> Self {
        self.where_clause = Some(clause.into());
        self
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn from_now(mut self) -> Self {
        self.start_from_now = true;
        self
    }
}

/// Opaque bearer credential; never printed
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json or pretty)
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    pub enabled: bool,

    /// Prometheus scrape endpoint bind address
    pub bind_address: String,
}

impl Default for BotStreamConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig {
                capacity: 1000,
                backpressure_strategy: BackpressureStrategy::Sliding,
            },
            retry: RetryConfig::default(),
            upstream: UpstreamConfig {
                base_url: "http://localhost:3000".to_string(),
                credential: Credential::default(),
                request_timeout_secs: 60,
                subscriptions: Vec::new(),
            },
            observability: ObservabilityConfig {
                logging: LoggingConfig {
                    level: "info".to_string(),
                    format: "json".to_string(),
                },
                metrics: MetricsConfig {
                    enabled: false,
                    bind_address: "0.0.0.0:9090".to_string(),
                },
            },
        }
    }
}

impl BotStreamConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("botstream.toml")
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&BotStreamConfig::default())?);

        if path.as_ref().exists() {
            builder = builder.add_source(File::from(path.as_ref()));
        }

        let config: Self = builder
            .add_source(Environment::with_prefix("BOTSTREAM").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(&BotStreamConfig::default())?)
            .add_source(Environment::with_prefix("BOTSTREAM").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.capacity == 0 {
            return Err(ConfigError::Message(
                "queue.capacity must be at least 1".to_string(),
            ));
        }
        if self.upstream.base_url.trim().is_empty() {
            return Err(ConfigError::Message(
                "upstream.base_url must not be empty".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Message(
                "retry.multiplier must be >= 1.0".to_string(),
            ));
        }
        if let Some(sub) = self
            .upstream
            .subscriptions
            .iter()
            .find(|s| s.table.trim().is_empty())
        {
            return Err(ConfigError::Message(format!(
                "subscription table must not be empty: {:?}",
                sub
            )));
        }
        Ok(())
    }
}
