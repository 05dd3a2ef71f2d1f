//! HTTP connection to the shape endpoint

use crate::config::{subscription_params, ShapeClientConfig};
use crate::offset::ShapeCursor;
use crate::protocol::{parse_messages, CURSOR_HEADER, HANDLE_HEADER, OFFSET_HEADER};
use botstream_core::{ControlMessage, ShapeMessage, TransportError};
use botstream_shared::{Credential, SubscriptionConfig};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tracing::{debug, instrument, warn};

/// Result of one shape request
#[derive(Debug)]
pub struct FetchOutcome {
    pub handle: Option<String>,
    pub offset: Option<String>,
    pub cursor: Option<String>,
    pub messages: Vec<ShapeMessage>,
}

impl FetchOutcome {
    fn must_refetch() -> Self {
        Self {
            handle: None,
            offset: None,
            cursor: None,
            messages: vec![ShapeMessage::Control(ControlMessage::MustRefetch)],
        }
    }
}

/// Shared HTTP client for all subscriptions of a source
#[derive(Debug, Clone)]
pub struct ShapeConnection {
    http: reqwest::Client,
    url: String,
}

impl ShapeConnection {
    pub fn new(config: &ShapeClientConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TransportError::Read(Box::new(e)))?;

        Ok(Self {
            http,
            url: config.shape_url(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Issue one request at `cursor`. A 409 is reported as a must-refetch control message.
    #[instrument(
        skip_all,
        fields(table = %subscription.table, offset = %cursor.offset(), live = cursor.is_live())
    )]
    pub async fn fetch(
        &self,
        subscription: &SubscriptionConfig,
        credential: &Credential,
        cursor: &ShapeCursor,
    ) -> Result<FetchOutcome, TransportError> {
        let mut params = subscription_params(subscription);
        params.extend(cursor.query_params());

        let response = self
            .http
            .get(&self.url)
            .bearer_auth(credential.expose())
            .query(&params)
            .send()
            .await
            .map_err(|e| TransportError::Read(Box::new(e)))?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            warn!("Shape handle is stale, refetching from the start");
            return Ok(FetchOutcome::must_refetch());
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let headers = response.headers();
        let handle = header_value(headers, HANDLE_HEADER);
        let offset = header_value(headers, OFFSET_HEADER);
        let next_cursor = header_value(headers, CURSOR_HEADER);

        let messages = if status == StatusCode::NO_CONTENT {
            Vec::new()
        } else {
            let body = response
                .bytes()
                .await
                .map_err(|e| TransportError::Read(Box::new(e)))?;
            parse_messages(&body)?
        };

        debug!(count = messages.len(), handle = ?handle, "Fetched shape messages");
        Ok(FetchOutcome {
            handle,
            offset,
            cursor: next_cursor,
            messages,
        })
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_header_value() {
        let mut headers = HeaderMap::new();
        headers.insert(HANDLE_HEADER, HeaderValue::from_static("h-42"));
        assert_eq!(header_value(&headers, HANDLE_HEADER).as_deref(), Some("h-42"));
        assert!(header_value(&headers, OFFSET_HEADER).is_none());
    }

    #[test]
    fn test_connection_url() {
        let config = ShapeClientConfig::new("http://db.internal:3000");
        let connection = ShapeConnection::new(&config).unwrap();
        assert_eq!(connection.url(), "http://db.internal:3000/v1/shape");
    }
}
