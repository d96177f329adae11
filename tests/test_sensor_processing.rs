//! Sensor stream processing integration tests
//!
//! Drives `SensorDataProcessor` with device payloads through a
//! `MockTransport` and checks what reaches the broker.

mod test_helpers;

use edge_telemetry::config::PipelineConfig;
use edge_telemetry::pipeline::{dispatch, ProcessOutcome, StreamProcessor};
use edge_telemetry::processing::{SensorDataProcessor, SeriesKey};
use edge_telemetry::protocol::SensorKind;
use edge_telemetry::testing::MockTransport;
use edge_telemetry::transport::QoS;
use edge_telemetry::QueuedMessage;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{device_reading, node_config};

const TEMPERATURE: i64 = 1;

fn build(config: &PipelineConfig) -> (Arc<SensorDataProcessor<MockTransport>>, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let processor = SensorDataProcessor::new(
        config.require_node().unwrap(),
        config.processing_table().unwrap(),
        transport.clone(),
    )
    .unwrap();
    (Arc::new(processor), transport)
}

#[tokio::test]
async fn test_hysteresis_emits_only_on_edges() {
    // Arrange
    let (processor, transport) = build(&node_config(0));

    // Act
    for value in [80.0, 90.0, 92.0, 80.0] {
        processor
            .process(&device_reading(7, TEMPERATURE, value))
            .await
            .unwrap();
    }

    // Assert
    let alerts = transport.published_with_prefix("nodes/alert/").await;
    let kinds: Vec<String> = alerts
        .iter()
        .map(|m| m.json()["alert"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(kinds, vec!["high_threshold", "high_threshold_cleared"]);
    assert_eq!(alerts[0].json()["value"], 90.0);
    assert_eq!(alerts[0].json()["sensorType"], "Temperature");
    assert_eq!(alerts[0].json()["deviceId"], 7);
    assert_eq!(alerts[1].topic, "nodes/alert/devices/7/temperature_high_cleared");
    assert!(alerts.iter().all(|m| m.qos == QoS::AtLeastOnce && !m.retain));

    let commands = transport.published_with_prefix("nodes/command/").await;
    assert_eq!(commands.len(), 2);
    assert!(commands
        .iter()
        .all(|m| m.topic == "nodes/command/devices/7/temperature_high"));
}

#[tokio::test]
async fn test_devices_keep_independent_alert_state() {
    let (processor, transport) = build(&node_config(0));

    processor.process(&device_reading(1, TEMPERATURE, 90.0)).await.unwrap();
    processor.process(&device_reading(2, TEMPERATURE, 90.0)).await.unwrap();
    processor.process(&device_reading(1, TEMPERATURE, 91.0)).await.unwrap();

    let alerts = transport.published_with_prefix("nodes/alert/").await;
    assert_eq!(alerts.len(), 2);
    assert_eq!(processor.alerts().active_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_window_flush_publishes_aggregate() {
    // Arrange
    let (processor, transport) = build(&node_config(60));

    // Act
    processor.process(&device_reading(7, TEMPERATURE, 10.0)).await.unwrap();
    tokio::time::advance(Duration::from_secs(20)).await;
    processor.process(&device_reading(7, TEMPERATURE, 20.0)).await.unwrap();
    assert!(transport.published_with_prefix("nodes/7/").await.is_empty());
    tokio::time::advance(Duration::from_secs(40)).await;
    processor.process(&device_reading(7, TEMPERATURE, 30.0)).await.unwrap();

    // Assert
    let aggregates = transport.published_with_prefix("nodes/7/").await;
    assert_eq!(aggregates.len(), 1);
    assert_eq!(aggregates[0].topic, "nodes/7/temperature_agg/data/processed");
    assert_eq!(aggregates[0].qos, QoS::AtMostOnce);

    let report = aggregates[0].json();
    assert_eq!(report["count"], 3);
    assert_eq!(report["average"], 20.0);
    assert_eq!(report["minimum"], 10.0);
    assert_eq!(report["maximum"], 30.0);
    assert_eq!(report["aggregationWindowSeconds"], 60);

    let key = SeriesKey {
        device_id: 7,
        kind: SensorKind::Temperature,
    };
    assert_eq!(processor.aggregates().pending(&key), 0);
}

#[tokio::test(start_paused = true)]
async fn test_aggregate_average_is_rounded() {
    let (processor, transport) = build(&node_config(60));

    for value in [20.0, 21.0] {
        processor.process(&device_reading(3, TEMPERATURE, value)).await.unwrap();
    }
    tokio::time::advance(Duration::from_secs(60)).await;
    processor.process(&device_reading(3, TEMPERATURE, 21.0)).await.unwrap();

    let aggregates = transport.published_with_prefix("nodes/3/").await;
    assert_eq!(aggregates[0].json()["average"], 20.67);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_aggregate_fields_publish_nothing() {
    let mut config = node_config(60);
    let rules = config.processing.get_mut("temperature").unwrap();
    rules.publish_average = false;
    rules.publish_min_max = false;
    rules.publish_count = false;
    let (processor, transport) = build(&config);

    processor.process(&device_reading(7, TEMPERATURE, 10.0)).await.unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;
    processor.process(&device_reading(7, TEMPERATURE, 20.0)).await.unwrap();

    assert!(transport.published_with_prefix("nodes/7/").await.is_empty());
}

#[tokio::test]
async fn test_value_below_min_filtered_before_state_changes() {
    // Arrange: -50 breaches both min_value and low_threshold
    let (processor, transport) = build(&node_config(60));

    // Act
    let outcome = processor
        .process(&device_reading(7, TEMPERATURE, -50.0))
        .await
        .unwrap();

    // Assert
    assert!(matches!(outcome, ProcessOutcome::Filtered(_)));
    assert_eq!(processor.alerts().active_count(), 0);
    assert_eq!(processor.aggregates().series_count(), 0);
    assert!(transport.get_published_messages().await.is_empty());
}

#[tokio::test]
async fn test_low_threshold_uses_low_reason() {
    let (processor, transport) = build(&node_config(0));

    processor.process(&device_reading(5, TEMPERATURE, -5.0)).await.unwrap();

    let alerts = transport.published_with_prefix("nodes/alert/").await;
    assert_eq!(alerts[0].topic, "nodes/alert/devices/5/temperature_low");
    assert_eq!(alerts[0].json()["alert"], "low_threshold");
    assert_eq!(alerts[0].json()["threshold"], 0.0);
}

#[tokio::test]
async fn test_malformed_payload_does_not_block_later_messages() {
    let (processor, transport) = build(&node_config(0));
    let processors = vec![processor.clone() as Arc<dyn StreamProcessor>];

    let garbage = QueuedMessage::new("devices/7/data", vec![0xff, 0xfe, 0x00]);
    assert!(dispatch(&processors, &garbage).await);
    assert!(dispatch(&processors, &device_reading(7, TEMPERATURE, 95.0)).await);
    assert!(dispatch(&processors, &device_reading(8, TEMPERATURE, 95.0)).await);

    assert_eq!(transport.published_with_prefix("nodes/alert/").await.len(), 2);
}

#[tokio::test]
async fn test_camel_case_payload_and_kind_name_accepted() {
    let (processor, transport) = build(&node_config(0));
    let message = QueuedMessage::new(
        "devices/9/data",
        r#"{"id":9,"type":"Temperature","value":99.5,"timestamp":"2025-04-26T11:21:20Z"}"#,
    );

    let outcome = processor.process(&message).await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Handled);
    assert_eq!(transport.published_with_prefix("nodes/alert/").await.len(), 1);
}

#[tokio::test]
async fn test_emission_failure_keeps_transition() {
    let (processor, transport) = build(&node_config(0));
    transport.set_should_fail(true);

    processor.process(&device_reading(7, TEMPERATURE, 95.0)).await.unwrap();
    transport.set_should_fail(false);
    processor.process(&device_reading(7, TEMPERATURE, 96.0)).await.unwrap();

    // Activation was lost on the wire and is not re-sent while still active
    assert!(transport.published_with_prefix("nodes/alert/").await.is_empty());
    assert_eq!(processor.alerts().active_count(), 1);
}
