//! Integration tests for the MQTT client
//!
//! No broker is needed: connection failures are driven by pointing the
//! client at a closed local port.

use bytes::Bytes;
use edge_telemetry::config::MqttSection;
use edge_telemetry::transport::mqtt::{ConnectionState, MqttClient, MqttError};
use edge_telemetry::transport::{QoS, Transport};
use std::time::Duration;

/// Nothing listens on port 1, so every attempt is refused immediately
fn unreachable_config(reconnect_delay_secs: u64, max_attempts: Option<u32>) -> MqttSection {
    let mut config = MqttSection::new("mqtt://127.0.0.1:1");
    config.client_id = "edge-test-client".to_string();
    config.reconnect_delay_secs = reconnect_delay_secs;
    config.max_reconnect_attempts = max_attempts;
    config
}

#[tokio::test]
async fn test_mqtt_client_creation() {
    // Arrange
    let config = MqttSection::new("mqtt://localhost:1883");

    // Act
    let client = MqttClient::new(config).unwrap();

    // Assert: not connected until connect() is called
    assert!(!client.is_connected());
    assert_eq!(client.connection_state(), None);
    assert!(!client.is_permanently_disconnected());
}

#[tokio::test]
async fn test_invalid_broker_url_rejected() {
    for url in ["not a url", "http://localhost:1883", "mqtt://"] {
        let result = MqttClient::new(MqttSection::new(url));

        assert!(
            matches!(result, Err(MqttError::InvalidBrokerUrl(_))),
            "{url} should be rejected"
        );
    }
}

#[tokio::test]
async fn test_missing_client_id_rejected() {
    let mut config = MqttSection::new("mqtt://localhost:1883");
    config.client_id = "  ".to_string();

    assert!(matches!(
        MqttClient::new(config),
        Err(MqttError::MissingSetting(_))
    ));
}

#[tokio::test]
async fn test_operations_before_connect_fail() {
    let client = MqttClient::new(MqttSection::new("mqtt://localhost:1883")).unwrap();

    let publish = client
        .publish("nodes/1/data", Bytes::from_static(b"{}"), QoS::AtMostOnce, false)
        .await;
    let subscribe = client.subscribe("devices/+/data", QoS::AtLeastOnce).await;
    let unsubscribe = client.unsubscribe("devices/+/data").await;

    assert!(matches!(publish, Err(MqttError::NotStarted)));
    assert!(matches!(subscribe, Err(MqttError::NotStarted)));
    assert!(matches!(unsubscribe, Err(MqttError::NotStarted)));
}

#[tokio::test]
async fn test_disconnect_before_connect_is_noop() {
    let client = MqttClient::new(MqttSection::new("mqtt://localhost:1883")).unwrap();

    assert!(client.disconnect().await.is_ok());
    assert_eq!(client.connection_state(), None);
}

#[tokio::test]
async fn test_refused_connection_reported_then_permanent() {
    // Arrange
    let client = MqttClient::new(unreachable_config(0, Some(1))).unwrap();
    let mut status = client.status_events();

    // Act: connect still succeeds, retries continue in the background
    client.connect().await.unwrap();

    // Assert: the initial failure is reported with a reason
    let first = tokio::time::timeout(Duration::from_secs(5), status.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!first.is_connected);
    assert!(first.reason.is_some());

    // Assert: exhausting the retry budget is reported and terminal
    let last = tokio::time::timeout(Duration::from_secs(5), status.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!last.is_connected);
    assert!(last.reason.unwrap().contains("Max reconnection attempts"));
    assert!(client.is_permanently_disconnected());
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_connect_returns_promptly_when_broker_refuses() {
    // Arrange: a retry delay far longer than the allowed wait
    let client = MqttClient::new(unreachable_config(60, None)).unwrap();
    let mut status = client.status_events();

    // Act
    let connected = tokio::time::timeout(Duration::from_secs(5), client.connect()).await;

    // Assert: the failure surfaces as a status event, not as a blocked call
    assert!(connected.expect("connect blocked for the retry delay").is_ok());
    let event = tokio::time::timeout(Duration::from_secs(1), status.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!event.is_connected);
    assert!(event.reason.is_some());
    assert!(!client.is_connected());

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_offline_publishes_are_backlogged_up_to_limit() {
    // Arrange: long delay keeps the supervisor waiting between attempts
    let mut config = unreachable_config(60, None);
    config.offline_backlog_limit = 1;
    let client = MqttClient::new(config).unwrap();
    client.connect().await.unwrap();
    assert!(!client.is_connected());

    // Act
    let first = client
        .publish("nodes/1/data", Bytes::from_static(b"1"), QoS::AtLeastOnce, false)
        .await;
    let second = client
        .publish("nodes/1/data", Bytes::from_static(b"2"), QoS::AtLeastOnce, false)
        .await;

    // Assert: both accepted, only the first is held for reconnect
    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(client.offline_backlog(), 1);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_subscriptions_registered_while_offline() {
    let client = MqttClient::new(unreachable_config(60, None)).unwrap();
    client.connect().await.unwrap();

    assert!(client.subscribe("devices/+/data", QoS::AtLeastOnce).await.is_ok());
    assert!(client.unsubscribe("devices/+/data").await.is_ok());
    assert!(matches!(
        client.subscribe("devices/#/data", QoS::AtLeastOnce).await,
        Err(MqttError::SubscriptionFailed(_))
    ));

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_is_final() {
    // Arrange
    let client = MqttClient::new(unreachable_config(60, None)).unwrap();
    client.connect().await.unwrap();

    // Act
    client.disconnect().await.unwrap();

    // Assert
    assert_eq!(
        client.connection_state(),
        Some(ConnectionState::Disconnected("Client disconnected".to_string()))
    );
    assert!(client.connect().await.is_err());
}
