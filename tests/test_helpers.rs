//! Test helpers and utilities for integration tests

#![allow(dead_code)]

use edge_telemetry::config::{
    GatewaySection, MqttSection, NodeSection, PipelineConfig, SensorProcessingConfig,
};
use edge_telemetry::pipeline::QueuedMessage;
use std::collections::BTreeMap;

/// Node configuration with one temperature rule and the given window
pub fn node_config(window_secs: u64) -> PipelineConfig {
    let node: NodeSection = toml::from_str(r#"node_id = "test-node""#).unwrap();

    let mut processing = BTreeMap::new();
    processing.insert(
        "temperature".to_string(),
        SensorProcessingConfig {
            unit: "C".to_string(),
            min_value: Some(-40.0),
            max_value: Some(125.0),
            high_threshold: Some(85.0),
            low_threshold: Some(0.0),
            aggregation_window_seconds: window_secs,
            publish_average: true,
            publish_min_max: true,
            publish_count: true,
            alert_on_aggregate: false,
        },
    );

    PipelineConfig {
        mqtt: MqttSection::new("mqtt://localhost:1883"),
        node: Some(node),
        processing,
        gateway: None,
        health: Default::default(),
    }
}

/// Gateway configuration pointing at `server_base_url`
pub fn gateway_config(server_base_url: &str) -> PipelineConfig {
    let gateway: GatewaySection = toml::from_str(&format!(
        r#"
        server_base_url = "{server_base_url}"
        failure_backoff_ms = 10
        shutdown_grace_secs = 2
        "#
    ))
    .unwrap();

    PipelineConfig {
        mqtt: MqttSection::new("mqtt://localhost:1883"),
        node: None,
        processing: BTreeMap::new(),
        gateway: Some(gateway),
        health: Default::default(),
    }
}

/// Raw device reading in the firmware's PascalCase layout
pub fn device_reading(device_id: i64, kind_code: i64, value: f64) -> QueuedMessage {
    QueuedMessage::new(
        format!("devices/{device_id}/data"),
        format!(
            r#"{{"Id":{device_id},"Name":"probe-{device_id}","Type":{kind_code},"Value":{value},"Unit":"C","Location":"greenhouse"}}"#
        ),
    )
}
