//! Observability features including logging and metrics

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use tokio::time::{Duration, Instant};
use tracing::{info, Level};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::config::{LoggingConfig, MetricsConfig, ObservabilityConfig};

/// Global observability system
static OBSERVABILITY: OnceCell<ObservabilitySystem> = OnceCell::new();

/// Observability system for centralized logging and metrics
#[derive(Debug)]
pub struct ObservabilitySystem;

impl ObservabilitySystem {
    /// Initialize the observability system; fails if called twice
    pub fn init(config: &ObservabilityConfig) -> anyhow::Result<()> {
        if OBSERVABILITY.get().is_some() {
            anyhow::bail!("Observability system already initialized");
        }

        Self::init_logging(&config.logging)?;

        if config.metrics.enabled {
            Self::init_metrics(&config.metrics)?;
        }

        OBSERVABILITY
            .set(ObservabilitySystem)
            .map_err(|_| anyhow::anyhow!("Observability system already initialized"))?;

        info!("Observability system initialized");
        Ok(())
    }

    /// Initialize structured logging
    fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
        let env_filter = EnvFilter::builder()
            .with_default_directive(parse_level(&config.level).into())
            .from_env_lossy();

        let registry = tracing_subscriber::registry().with(env_filter);

        match config.format.to_lowercase().as_str() {
            "json" => {
                let json_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE);
                registry.with(json_layer).try_init()?;
            }
            _ => {
                let pretty_layer = tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_span_events(FmtSpan::CLOSE);
                registry.with(pretty_layer).try_init()?;
            }
        }

        Ok(())
    }

    /// Install the Prometheus recorder and its scrape endpoint
    fn init_metrics(config: &MetricsConfig) -> anyhow::Result<()> {
        let bind_addr: SocketAddr = config.bind_address.parse()?;

        PrometheusBuilder::new()
            .with_http_listener(bind_addr)
            .install()?;

        info!("Prometheus metrics initialized on {}", bind_addr);
        Ok(())
    }

}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Pipeline metrics
pub struct EventMetrics;

impl EventMetrics {
    /// Record a change event read from upstream
    pub fn event_received(event_type: &str, table: &str) {
        counter!("botstream_events_received_total",
                "event_type" => event_type.to_string(),
                "table" => table.to_string())
            .increment(1);
    }

    /// Record a queue admission outcome (admitted, evicted_oldest, dropped_newest)
    pub fn queue_admission(event_type: &str, outcome: &'static str) {
        counter!("botstream_queue_admissions_total",
                "event_type" => event_type.to_string(),
                "outcome" => outcome)
            .increment(1);
    }

    /// Record current queue size
    pub fn queue_size(size: usize, event_type: &str) {
        gauge!("botstream_queue_size", "event_type" => event_type.to_string())
            .set(size as f64);
    }

    /// Record a handler invocation that eventually succeeded
    pub fn handler_succeeded(event_type: &str, attempts: u32) {
        counter!("botstream_handler_success_total", "event_type" => event_type.to_string())
            .increment(1);
        if attempts > 1 {
            counter!("botstream_handler_retries_total", "event_type" => event_type.to_string())
                .increment(u64::from(attempts - 1));
        }
    }

    /// Record a handler invocation that exhausted its retries
    pub fn handler_failed(event_type: &str, attempts: u32) {
        counter!("botstream_handler_failed_total", "event_type" => event_type.to_string())
            .increment(1);
        counter!("botstream_handler_retries_total", "event_type" => event_type.to_string())
            .increment(u64::from(attempts.saturating_sub(1)));
    }

    /// Record a subscription that terminated on a transport failure
    pub fn subscription_failed(table: &str) {
        counter!("botstream_subscription_failures_total", "table" => table.to_string())
            .increment(1);
    }
}

/// Records elapsed time into a histogram when dropped
pub struct PerfTimer {
    start: Instant,
    metric_name: &'static str,
    labels: Vec<(&'static str, String)>,
}

impl PerfTimer {
    pub fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.labels.push((key, value.into()));
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for PerfTimer {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            let labels: Vec<metrics::Label> = self
                .labels
                .iter()
                .map(|(k, v)| metrics::Label::new(*k, v.clone()))
                .collect();
            histogram!(self.metric_name, labels).record(self.start.elapsed().as_secs_f64());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("nonsense"), Level::INFO);
    }

    #[test]
    fn test_perf_timer() {
        let timer = PerfTimer::new("test_metric").with_label("event_type", "messages.insert");

        assert_eq!(timer.metric_name, "test_metric");
        assert_eq!(timer.labels.len(), 1);

        // No recorder installed: dropping must still be a no-op
        drop(timer);
    }

    #[test]
    fn test_metrics_without_recorder() {
        EventMetrics::event_received("messages.insert", "messages");
        EventMetrics::queue_admission("messages.insert", "admitted");
        EventMetrics::queue_size(3, "messages.insert");
        EventMetrics::handler_succeeded("messages.insert", 2);
        EventMetrics::handler_failed("messages.insert", 4);
        EventMetrics::subscription_failed("messages");
    }

    #[test]
    fn test_init_only_once() {
        let config = crate::BotStreamConfig::default().observability;
        assert!(!config.metrics.enabled);

        ObservabilitySystem::init(&config).unwrap();
        assert!(ObservabilitySystem::init(&config).is_err());
    }
}
