//! Pure connection state management for MQTT client
//!
//! This module contains pure functions for connection state management
//! and translating [`MqttSection`] into rumqttc options.

use crate::config::MqttSection;
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Packets above this size are rejected by the client
const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Permanently disconnected - max reconnection attempts exceeded
    PermanentlyDisconnected(String),
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Fixed delay between attempts in milliseconds
    pub delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            delay_ms: 5_000,
        }
    }
}

impl ReconnectConfig {
    pub fn from_section(config: &MqttSection) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            delay_ms: config.reconnect_delay_secs.saturating_mul(1000),
        }
    }

    /// Worst-case time spent retrying; None for unlimited retries
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts
            .map(|max_attempts| u64::from(max_attempts).saturating_mul(self.delay_ms))
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Missing required setting: {0}")]
    MissingSetting(String),
    #[error("Client not started - call connect() first")]
    NotStarted,
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

/// Map a configured QoS level (0, 1, 2) to the protocol value
pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Split a broker URL into host, port and whether TLS is requested
pub fn parse_broker_url(broker_url: &str) -> Result<(String, u16, bool), MqttError> {
    let url =
        Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;

    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(MqttError::InvalidBrokerUrl(broker_url.to_string())),
    };

    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok((host.to_string(), port, tls))
}

/// Pure function to configure MQTT options from config
pub fn configure_mqtt_options(config: &MqttSection) -> Result<MqttOptions, MqttError> {
    if config.broker_url.trim().is_empty() {
        return Err(MqttError::MissingSetting("mqtt.broker_url".to_string()));
    }
    if config.client_id.trim().is_empty() {
        return Err(MqttError::MissingSetting("mqtt.client_id".to_string()));
    }

    let (host, port, tls) = parse_broker_url(&config.broker_url)?;
    let mut mqtt_options = MqttOptions::new(config.client_id.clone(), host, port);

    if tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    // Credentials are looked up when the client is built, never stored in config
    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(username, password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(1)));
    mqtt_options.set_clean_start(config.clean_start);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    if let Some(will) = &config.last_will {
        let qos = qos_from_level(will.qos).ok_or_else(|| {
            MqttError::ConnectionFailedStr(format!("invalid last will QoS {}", will.qos))
        })?;
        let lwt = LastWill::new(will.topic.clone(), will.payload.clone(), qos, will.retain, None);
        mqtt_options.set_last_will(lwt);
    }

    Ok(mqtt_options)
}
