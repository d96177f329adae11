//! Sensor data stream processor
//!
//! Steps per claimed message:
//! 1. Decode the payload into a [`SensorReading`]
//! 2. Classify the sensor kind against the processing table
//! 3. Validate the value against `min_value` / `max_value`
//! 4. Evaluate high and low thresholds with hysteresis
//! 5. Append to the aggregation window and publish the summary on flush
//!
//! Alert state is updated before anything is published. A failed publish is
//! logged and counted but the transition stands.

use super::aggregation::{AggregateResult, AggregationStore, SeriesKey};
use super::alerts::{AlertDirection, AlertEdge, AlertKey, AlertScope, AlertTracker};
use crate::config::{ConfigError, NodeSection, SensorProcessingConfig, UnconfiguredKindPolicy};
use crate::error::{PipelineError, ProcessingError};
use crate::observability::metrics::metrics;
use crate::pipeline::{ProcessOutcome, QueuedMessage, StreamProcessor};
use crate::protocol::{
    AggregateReport, AlertNotification, SensorKind, SensorReading, TopicFilter, TopicTemplate,
};
use crate::transport::{QoS, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Output topics, rendered with `device_id`, `reason`, `node_id` and `sensor_type`
#[derive(Debug, Clone)]
pub struct OutputTopics {
    pub processed: TopicTemplate,
    pub alert: TopicTemplate,
    pub command: TopicTemplate,
}

impl OutputTopics {
    pub fn from_node(node: &NodeSection) -> Self {
        Self {
            processed: TopicTemplate::new(&node.processed_topic_template),
            alert: TopicTemplate::new(&node.alert_topic_template),
            command: TopicTemplate::new(&node.command_topic_template),
        }
    }
}

pub struct SensorDataProcessor<T: Transport> {
    transport: Arc<T>,
    filter: TopicFilter,
    node_id: String,
    rules: HashMap<SensorKind, SensorProcessingConfig>,
    unconfigured: UnconfiguredKindPolicy,
    topics: OutputTopics,
    alerts: AlertTracker,
    aggregates: AggregationStore,
}

impl<T: Transport> SensorDataProcessor<T> {
    pub fn new(
        node: &NodeSection,
        rules: HashMap<SensorKind, SensorProcessingConfig>,
        transport: Arc<T>,
    ) -> Result<Self, PipelineError> {
        let filter = TopicFilter::new(&node.device_data_topic).map_err(|e| {
            PipelineError::Config(ConfigError::InvalidConfig(format!(
                "node.device_data_topic: {e}"
            )))
        })?;

        info!(
            filter = filter.as_str(),
            pattern = filter.regex_pattern(),
            kinds = rules.len(),
            "Sensor data processor initialized"
        );

        Ok(Self {
            transport,
            filter,
            node_id: node.node_id.clone(),
            rules,
            unconfigured: node.unconfigured_kinds,
            topics: OutputTopics::from_node(node),
            alerts: AlertTracker::new(),
            aggregates: AggregationStore::new(),
        })
    }

    pub fn alerts(&self) -> &AlertTracker {
        &self.alerts
    }

    pub fn aggregates(&self) -> &AggregationStore {
        &self.aggregates
    }

    fn render(&self, template: &TopicTemplate, device_id: i64, reason: &str, kind: &str) -> String {
        template.render(&[
            ("device_id", &device_id.to_string()),
            ("reason", reason),
            ("node_id", &self.node_id),
            ("sensor_type", kind),
        ])
    }

    /// Validation against configured bounds (pure function)
    pub fn validate(value: f64, rules: &SensorProcessingConfig) -> Result<(), String> {
        if !value.is_finite() {
            return Err(format!("value {value} is not a finite number"));
        }
        if let Some(min) = rules.min_value {
            if value < min {
                return Err(format!("value {value} is below min_value {min}"));
            }
        }
        if let Some(max) = rules.max_value {
            if value > max {
                return Err(format!("value {value} is above max_value {max}"));
            }
        }
        Ok(())
    }

    async fn handle_unconfigured(
        &self,
        reading: &SensorReading,
        message: &QueuedMessage,
    ) -> ProcessOutcome {
        metrics().record_unconfigured_reading();
        let label = reading.kind.label();

        match self.unconfigured {
            UnconfiguredKindPolicy::Drop => {
                debug!(sensor_type = %label, "No processing rules for sensor type, dropping");
                ProcessOutcome::Skipped(format!("no processing rules for sensor type '{label}'"))
            }
            UnconfiguredKindPolicy::PassThrough => {
                let segment = label.to_lowercase();
                let topic = self.render(
                    &self.topics.processed,
                    reading.device_id,
                    &format!("{segment}_raw"),
                    &segment,
                );
                if self
                    .emit(&topic, message.payload.clone(), QoS::AtMostOnce)
                    .await
                {
                    metrics().record_pass_through();
                }
                ProcessOutcome::Handled
            }
        }
    }

    async fn evaluate_thresholds(
        &self,
        device_id: i64,
        kind: SensorKind,
        value: f64,
        rules: &SensorProcessingConfig,
        scope: AlertScope,
    ) {
        for (direction, threshold) in [
            (AlertDirection::High, rules.high_threshold),
            (AlertDirection::Low, rules.low_threshold),
        ] {
            let Some(threshold) = threshold else {
                continue;
            };
            let key = AlertKey {
                device_id,
                kind,
                direction,
                scope,
            };

            if let Some(edge) = self
                .alerts
                .observe(key, direction.breached(value, threshold))
            {
                self.emit_alert(key, edge, value, threshold).await;
            }
        }
    }

    async fn emit_alert(&self, key: AlertKey, edge: AlertEdge, value: f64, threshold: f64) {
        let suffix = key.scope.suffix();
        let reason = format!("{}_{}{suffix}", key.kind.topic_segment(), key.direction);
        let alert = format!("{}_threshold{suffix}", key.direction);

        let (alert, alert_reason, value, threshold) = match edge {
            AlertEdge::Activated => {
                warn!(
                    device_id = key.device_id,
                    sensor_type = %key.kind,
                    direction = %key.direction,
                    value,
                    threshold,
                    "ALERT: threshold breached"
                );
                metrics().record_alert_activated();
                (alert, reason.clone(), Some(value), Some(threshold))
            }
            AlertEdge::Cleared => {
                info!(
                    device_id = key.device_id,
                    sensor_type = %key.kind,
                    direction = %key.direction,
                    "CLEARED: threshold alert"
                );
                metrics().record_alert_cleared();
                (
                    format!("{alert}_cleared"),
                    format!("{reason}_cleared"),
                    None,
                    None,
                )
            }
        };

        let notification = AlertNotification {
            device_id: key.device_id,
            sensor_type: key.kind.name().to_string(),
            alert,
            value,
            threshold,
            timestamp: Utc::now(),
        };
        let segment = key.kind.topic_segment();

        let alert_topic = self.render(&self.topics.alert, key.device_id, &alert_reason, segment);
        self.emit_json(&alert_topic, &notification, QoS::AtLeastOnce)
            .await;

        let command_topic = self.render(&self.topics.command, key.device_id, &reason, segment);
        self.emit_json(&command_topic, &notification, QoS::AtLeastOnce)
            .await;
    }

    async fn aggregate(
        &self,
        reading: &SensorReading,
        kind: SensorKind,
        rules: &SensorProcessingConfig,
    ) {
        let Some(window) = rules.aggregation_window() else {
            return;
        };
        let key = SeriesKey {
            device_id: reading.device_id,
            kind,
        };
        let Some(result) = self
            .aggregates
            .record(key, reading.value, window, Instant::now())
        else {
            return;
        };

        info!(
            device_id = reading.device_id,
            sensor_type = %kind,
            window_secs = rules.aggregation_window_seconds,
            count = result.count,
            average = result.average,
            min = result.min,
            max = result.max,
            "AGGREGATED"
        );

        self.publish_aggregate(reading.device_id, kind, &result, rules)
            .await;

        if rules.alert_on_aggregate {
            self.evaluate_thresholds(
                reading.device_id,
                kind,
                result.average,
                rules,
                AlertScope::Aggregate,
            )
            .await;
        }
    }

    async fn publish_aggregate(
        &self,
        device_id: i64,
        kind: SensorKind,
        result: &AggregateResult,
        rules: &SensorProcessingConfig,
    ) {
        let report = AggregateReport {
            device_id,
            sensor_type: kind.name().to_string(),
            timestamp: Utc::now(),
            aggregation_window_seconds: rules.aggregation_window_seconds,
            average: rules.publish_average.then(|| result.rounded_average()),
            minimum: rules.publish_min_max.then_some(result.min),
            maximum: rules.publish_min_max.then_some(result.max),
            count: rules.publish_count.then_some(result.count),
        };

        if !report.has_fields() {
            debug!(device_id, sensor_type = %kind, "No aggregate fields enabled, not publishing");
            return;
        }

        let segment = kind.topic_segment();
        let topic = self.render(
            &self.topics.processed,
            device_id,
            &format!("{segment}_agg"),
            segment,
        );
        if self.emit_json(&topic, &report, QoS::AtMostOnce).await {
            metrics().record_aggregate_published();
        }
    }

    async fn emit_json<P: Serialize>(&self, topic: &str, payload: &P, qos: QoS) -> bool {
        match serde_json::to_vec(payload) {
            Ok(bytes) => self.emit(topic, Bytes::from(bytes), qos).await,
            Err(e) => {
                let failure = ProcessingError::emission(topic, e.to_string());
                error!(error = %failure, "Failed to serialize outbound payload");
                metrics().record_emission_failure();
                false
            }
        }
    }

    /// Publish without propagating failure; returns whether it was accepted
    async fn emit(&self, topic: &str, payload: Bytes, qos: QoS) -> bool {
        match self.transport.publish(topic, payload, qos, false).await {
            Ok(()) => true,
            Err(e) => {
                let failure = ProcessingError::emission(topic, e.to_string());
                error!(error = %failure, "Publish failed, state change kept");
                metrics().record_emission_failure();
                false
            }
        }
    }
}

#[async_trait]
impl<T: Transport + 'static> StreamProcessor for SensorDataProcessor<T> {
    fn name(&self) -> &str {
        "sensor-data"
    }

    fn can_process(&self, topic: &str) -> bool {
        self.filter.matches(topic)
    }

    async fn process(&self, message: &QueuedMessage) -> Result<ProcessOutcome, ProcessingError> {
        let reading = SensorReading::decode(&message.topic, &message.payload, message.received_at)?;

        let Some((kind, rules)) = reading
            .kind
            .known()
            .and_then(|kind| self.rules.get(&kind).map(|rules| (kind, rules)))
        else {
            return Ok(self.handle_unconfigured(&reading, message).await);
        };

        if let Err(reason) = Self::validate(reading.value, rules) {
            warn!(
                topic = %message.topic,
                device_id = reading.device_id,
                sensor_type = %kind,
                reason = %reason,
                "FILTERED"
            );
            metrics().record_validation_rejection();
            return Ok(ProcessOutcome::Filtered(reason));
        }

        self.evaluate_thresholds(reading.device_id, kind, reading.value, rules, AlertScope::Raw)
            .await;
        self.aggregate(&reading, kind, rules).await;

        Ok(ProcessOutcome::Handled)
    }
}
