//! Transport layer for broker communication
//!
//! This module provides the transport abstraction the pipeline is written
//! against and its MQTT implementation. Inbound messages are pushed to a
//! [`MessageSink`]; connection transitions are observable through a
//! broadcast stream of [`ConnectionStatusChanged`].

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast;

pub mod mqtt;

pub use rumqttc::v5::mqttbytes::QoS;

/// Inbound message delivered by the transport
///
/// The payload is a copy owned by the message, never a view into the
/// transport's receive buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageReceived {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Emitted on every connected/disconnected transition
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatusChanged {
    pub is_connected: bool,
    /// Absent for successful connects and intentional disconnects
    pub reason: Option<String>,
}

/// Observer for inbound messages
///
/// Called on the transport's event loop task, so implementations must hand
/// the message off quickly (e.g. a non-blocking queue write).
pub trait MessageSink: Send + Sync {
    fn deliver(&self, message: MessageReceived);
}

/// Transport trait for broker communication
///
/// This trait provides an abstraction over different transport mechanisms
/// (primarily MQTT) to enable dependency injection and testing.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start the managed connection; a no-op when already started
    async fn connect(&self) -> Result<(), Self::Error>;

    /// Intentionally stop the managed connection
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Accept a message for sending
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Self::Error>;

    /// Register a subscription that survives reconnects
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), Self::Error>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), Self::Error>;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Route inbound messages to `sink`, replacing any previous sink
    fn set_message_sink(&self, sink: Arc<dyn MessageSink>);

    /// Subscribe to connection status transitions
    fn status_events(&self) -> broadcast::Receiver<ConnectionStatusChanged>;
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttClient;
