//! MQTT v5 transport built on rumqttc
//!
//! The client is split so that everything deciding *what* should happen is a
//! pure function and only [`client`] touches the network:
//!
//! - [`connection`] - Connection state, errors and rumqttc option building
//! - [`message_handler`] - Event routing and inbound message dispatch
//! - [`health_monitor`] - Reconnection, status-event and offline-publish decisions
//! - [`client`] - Impure I/O operations and coordination
//!
//! # Usage
//!
//! ```rust,no_run
//! use edge_telemetry::config::MqttSection;
//! use edge_telemetry::transport::mqtt::MqttClient;
//! use edge_telemetry::transport::QoS;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection::new("mqtt://localhost:1883");
//! let client = MqttClient::new(config)?;
//! client.connect().await?;
//! client.subscribe("devices/+/data", QoS::AtLeastOnce).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{ConnectionState, MqttError, ReconnectConfig};
pub use health_monitor::{
    ConnectionEvent, HealthMonitor, PublishDecision, ReconnectionDecision,
};
pub use message_handler::{EventRoute, MessageDispatcher, MessageHandler};
