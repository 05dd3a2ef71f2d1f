//! Configuration for the HTTP shape source

use botstream_shared::{SubscriptionConfig, UpstreamConfig};
use std::time::Duration;

/// Path of the shape endpoint below the configured base URL
pub const SHAPE_PATH: &str = "/v1/shape";

#[derive(Debug, Clone)]
pub struct ShapeClientConfig {
    /// Server base URL, e.g. `http://localhost:3000`
    pub base_url: String,

    /// Per-request timeout; long-poll requests must fit within it
    pub request_timeout: Duration,
}

impl ShapeClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn shape_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), SHAPE_PATH)
    }
}

impl From<&UpstreamConfig> for ShapeClientConfig {
    fn from(config: &UpstreamConfig) -> Self {
        Self::new(config.base_url.clone())
            .with_request_timeout(Duration::from_secs(config.request_timeout_secs))
    }
}

/// Query parameters selecting the shape for a subscription
pub fn subscription_params(subscription: &SubscriptionConfig) -> Vec<(&'static str, String)> {
    let mut params = vec![("table", subscription.table.clone())];
    if let Some(clause) = &subscription.where_clause {
        params.push(("where", clause.clone()));
    }
    if let Some(columns) = subscription.columns.as_ref().filter(|c| !c.is_empty()) {
        params.push(("columns", columns.join(",")));
    }
    params
}
