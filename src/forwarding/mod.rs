//! Upstream HTTP forwarding for the gateway
//!
//! The [`Forwarder`] drains the forwarding queue and POSTs one
//! [`ForwardEnvelope`] per processed message. Every message gets exactly one
//! attempt: a non-2xx response is logged and the loop moves on. Any delivery
//! error (bad payload, connect, timeout) pauses the loop for
//! `failure_backoff_ms` before the next dequeue.

use crate::config::GatewaySection;
use crate::error::sanitize_detail;
use crate::forward_span;
use crate::observability::metrics::metrics;
use crate::pipeline::{QueueConsumer, QueuedMessage};
use crate::protocol::{parse_timestamp, ForwardEnvelope, TopicTemplate};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};
use url::Url;

/// Header carrying the upstream API key
pub const API_KEY_HEADER: &str = "X-Api-Key";

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Invalid payload on {topic}: {message}")]
    InvalidPayload { topic: String, message: String },

    #[error("Payload on {topic} is missing '{field}'")]
    MissingField { topic: String, field: &'static str },

    #[error("Invalid upstream endpoint '{url}': {message}")]
    InvalidEndpoint { url: String, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl ForwardError {
    /// Failures of the upstream connection rather than of one message
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Http(_))
    }
}

/// Result of a delivery that reached the upstream server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    Delivered(u16),
    Rejected { status: u16, detail: String },
}

pub struct Forwarder {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
    topic_template: TopicTemplate,
    failure_backoff: Duration,
}

impl Forwarder {
    pub fn new(gateway: &GatewaySection) -> Result<Self, ForwardError> {
        let endpoint =
            Url::parse(&gateway.server_base_url).map_err(|e| ForwardError::InvalidEndpoint {
                url: gateway.server_base_url.clone(),
                message: e.to_string(),
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(gateway.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            api_key: gateway.api_key(),
            topic_template: TopicTemplate::new(&gateway.upstream_topic_template),
            failure_backoff: Duration::from_millis(gateway.failure_backoff_ms),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Derive the outbound envelope from a processed message (pure function)
    pub fn build_envelope(&self, message: &QueuedMessage) -> Result<ForwardEnvelope, ForwardError> {
        let payload: Value =
            serde_json::from_slice(&message.payload).map_err(|e| ForwardError::InvalidPayload {
                topic: message.topic.clone(),
                message: e.to_string(),
            })?;

        let device_id = field(&payload, &["deviceId", "DeviceId", "Id", "id"])
            .and_then(scalar_to_string)
            .ok_or_else(|| ForwardError::MissingField {
                topic: message.topic.clone(),
                field: "deviceId",
            })?;

        let sensor_type = field(&payload, &["sensorType", "SensorType", "Type", "type"])
            .and_then(scalar_to_string)
            .ok_or_else(|| ForwardError::MissingField {
                topic: message.topic.clone(),
                field: "sensorType",
            })?;

        let timestamp: DateTime<Utc> = field(&payload, &["timestamp", "Timestamp"])
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .unwrap_or(message.received_at);

        let topic = self
            .topic_template
            .render(&[("device_id", &device_id), ("sensor_type", &sensor_type)]);

        Ok(ForwardEnvelope {
            device_id,
            topic,
            timestamp,
            payload_json: payload.to_string(),
        })
    }

    /// One delivery attempt
    pub async fn forward(&self, message: &QueuedMessage) -> Result<ForwardOutcome, ForwardError> {
        let envelope = self.build_envelope(message)?;

        let mut request = self.client.post(self.endpoint.clone()).json(&envelope);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(ForwardOutcome::Delivered(status.as_u16()));
        }

        // Body is only for the log; a failed read leaves it empty
        let body = response.text().await.unwrap_or_default();
        Ok(ForwardOutcome::Rejected {
            status: status.as_u16(),
            detail: sanitize_detail(&body),
        })
    }

    /// Drain `consumer` until cancelled or the queue is closed and empty
    pub async fn run(&self, consumer: QueueConsumer, token: CancellationToken) {
        info!(endpoint = %self.endpoint, queue = consumer.name(), "Forwarder started");

        loop {
            let message = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                message = consumer.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let span = forward_span!(topic = %message.topic);
            let result = self.forward(&message).instrument(span).await;

            match result {
                Ok(ForwardOutcome::Delivered(status)) => {
                    debug!(topic = %message.topic, status, "Forwarded upstream");
                    metrics().record_forward_delivered();
                }
                Ok(ForwardOutcome::Rejected { status, detail }) => {
                    error!(
                        topic = %message.topic,
                        status,
                        body = %detail,
                        "Upstream rejected message, not retrying"
                    );
                    metrics().record_forward_rejected();
                }
                Err(e) => {
                    error!(
                        topic = %message.topic,
                        error = %e,
                        transient = e.is_transient(),
                        "Failed to forward message"
                    );
                    metrics().record_forward_failed();

                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.failure_backoff) => {}
                    }
                }
            }
        }

        info!(queue = consumer.name(), "Forwarder stopped");
    }
}

fn field<'a>(payload: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| payload.get(*name))
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn gateway() -> GatewaySection {
        toml::from_str(r#"server_base_url = "http://127.0.0.1:9/api/telemetry""#).unwrap()
    }

    fn forwarder() -> Forwarder {
        Forwarder::new(&gateway()).unwrap()
    }

    #[test]
    fn test_envelope_from_aggregate_report() {
        // Arrange
        let message = QueuedMessage::new(
            "nodes/7/temperature_agg/data/processed",
            r#"{"deviceId":7,"sensorType":"Temperature","timestamp":"2025-04-26T11:21:20Z","average":21.5}"#,
        );

        // Act
        let envelope = forwarder().build_envelope(&message).unwrap();

        // Assert
        assert_eq!(envelope.device_id, "7");
        assert_eq!(envelope.topic, "nodes/7/Temperature/data/processed");
        assert_eq!(
            envelope.timestamp,
            Utc.with_ymd_and_hms(2025, 4, 26, 11, 21, 20).unwrap()
        );
        let inner: Value = serde_json::from_str(&envelope.payload_json).unwrap();
        assert_eq!(inner["average"], 21.5);
    }

    #[test]
    fn test_missing_timestamp_uses_arrival_time() {
        let message = QueuedMessage::new(
            "nodes/7/x/data/processed",
            r#"{"deviceId":"sensor-7","sensorType":"Humidity"}"#,
        );

        let envelope = forwarder().build_envelope(&message).unwrap();

        assert_eq!(envelope.device_id, "sensor-7");
        assert_eq!(envelope.timestamp, message.received_at);
    }

    #[test]
    fn test_raw_reading_layout_accepted() {
        let message = QueuedMessage::new(
            "nodes/4/soilmoisture_raw/data/processed",
            r#"{"Id":4,"Type":3,"Value":33.0}"#,
        );

        let envelope = forwarder().build_envelope(&message).unwrap();

        assert_eq!(envelope.device_id, "4");
        assert_eq!(envelope.topic, "nodes/4/3/data/processed");
    }

    #[test]
    fn test_missing_fields_are_errors() {
        let no_device = QueuedMessage::new("t", r#"{"sensorType":"Humidity"}"#);
        let no_kind = QueuedMessage::new("t", r#"{"deviceId":1}"#);
        let garbage = QueuedMessage::new("t", "not json");

        assert!(matches!(
            forwarder().build_envelope(&no_device),
            Err(ForwardError::MissingField { field: "deviceId", .. })
        ));
        assert!(matches!(
            forwarder().build_envelope(&no_kind),
            Err(ForwardError::MissingField { field: "sensorType", .. })
        ));
        assert!(matches!(
            forwarder().build_envelope(&garbage),
            Err(ForwardError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let mut gateway = gateway();
        gateway.server_base_url = "not a url".to_string();

        assert!(matches!(
            Forwarder::new(&gateway),
            Err(ForwardError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn test_only_http_errors_are_transient() {
        let error = ForwardError::MissingField {
            topic: "t".to_string(),
            field: "deviceId",
        };
        assert!(!error.is_transient());
    }
}
