//! Configuration system for edge nodes and gateways
//!
//! A single TOML file describes the broker connection, the node processing
//! rules and the gateway upstream. Sections that a role does not use may be
//! omitted; [`PipelineConfig::require_node`] and
//! [`PipelineConfig::require_gateway`] fail fast when a role starts without
//! its section.

use crate::protocol::{validate_topic_filter, SensorKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub mqtt: MqttSection,
    pub node: Option<NodeSection>,
    /// Per sensor kind processing rules, keyed by kind name
    #[serde(default)]
    pub processing: BTreeMap<String, SensorProcessingConfig>,
    pub gateway: Option<GatewaySection>,
    #[serde(default)]
    pub health: HealthSection,
}

/// MQTT broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, `mqtt://host:port` or `mqtts://host:port` for TLS
    pub broker_url: String,
    /// Client identity presented to the broker
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Fixed delay between reconnection attempts
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Give up after this many consecutive failed attempts (unset = never)
    pub max_reconnect_attempts: Option<u32>,
    /// Publishes accepted while offline before further publishes are dropped
    #[serde(default = "default_offline_backlog_limit")]
    pub offline_backlog_limit: usize,
    #[serde(default = "default_true")]
    pub clean_start: bool,
    /// Subscribed on every (re)connect
    #[serde(default)]
    pub initial_subscriptions: Vec<SubscriptionConfig>,
    pub last_will: Option<LastWillConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionConfig {
    pub filter: String,
    #[serde(default = "default_subscription_qos")]
    pub qos: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastWillConfig {
    pub topic: String,
    pub payload: String,
    #[serde(default = "default_subscription_qos")]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

/// Node role settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSection {
    pub node_id: String,
    #[serde(default = "default_device_data_topic")]
    pub device_data_topic: String,
    pub gateway_command_topic: Option<String>,
    #[serde(default = "default_processed_topic_template")]
    pub processed_topic_template: String,
    #[serde(default = "default_alert_topic_template")]
    pub alert_topic_template: String,
    #[serde(default = "default_command_topic_template")]
    pub command_topic_template: String,
    #[serde(default = "default_parallelism")]
    pub processing_parallelism: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default)]
    pub unconfigured_kinds: UnconfiguredKindPolicy,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

/// What happens to readings whose sensor kind has no processing rules
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnconfiguredKindPolicy {
    /// Discard the reading
    #[default]
    Drop,
    /// Republish the raw reading on the processed topic
    PassThrough,
}

/// Processing rules for one sensor kind
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorProcessingConfig {
    #[serde(default)]
    pub unit: String,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub high_threshold: Option<f64>,
    pub low_threshold: Option<f64>,
    /// 0 disables aggregation
    #[serde(default = "default_aggregation_window")]
    pub aggregation_window_seconds: u64,
    #[serde(default = "default_true")]
    pub publish_average: bool,
    #[serde(default)]
    pub publish_min_max: bool,
    #[serde(default)]
    pub publish_count: bool,
    /// Also evaluate thresholds against each flushed average
    #[serde(default)]
    pub alert_on_aggregate: bool,
}

impl Default for SensorProcessingConfig {
    fn default() -> Self {
        Self {
            unit: String::new(),
            min_value: None,
            max_value: None,
            high_threshold: None,
            low_threshold: None,
            aggregation_window_seconds: default_aggregation_window(),
            publish_average: true,
            publish_min_max: false,
            publish_count: false,
            alert_on_aggregate: false,
        }
    }
}

impl SensorProcessingConfig {
    pub fn aggregation_window(&self) -> Option<Duration> {
        match self.aggregation_window_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// True when at least one aggregate field would be published
    pub fn publishes_aggregates(&self) -> bool {
        self.publish_average || self.publish_min_max || self.publish_count
    }
}

/// Gateway role settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaySection {
    #[serde(default = "default_gateway_id")]
    pub gateway_id: String,
    pub server_base_url: String,
    /// Environment variable holding the upstream API key
    pub server_api_key_env: Option<String>,
    #[serde(default = "default_processed_data_topic")]
    pub processed_data_topic: String,
    /// 0 = unbounded
    #[serde(default)]
    pub upstream_channel_capacity: usize,
    #[serde(default = "default_upstream_topic_template")]
    pub upstream_topic_template: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_failure_backoff")]
    pub failure_backoff_ms: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl GatewaySection {
    /// Upstream API key resolved from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        get_env_var_optional(self.server_api_key_env.as_ref())
    }
}

/// Health and metrics HTTP server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_port")]
    pub port: u16,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_health_port(),
        }
    }
}

fn default_client_id() -> String {
    format!("edge-{}", uuid::Uuid::new_v4())
}

fn default_keep_alive() -> u64 {
    20
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_offline_backlog_limit() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_subscription_qos() -> u8 {
    1
}

fn default_device_data_topic() -> String {
    "$share/nodes/devices/+/data".to_string()
}

fn default_processed_topic_template() -> String {
    "nodes/{device_id}/{reason}/data/processed".to_string()
}

fn default_alert_topic_template() -> String {
    "nodes/alert/devices/{device_id}/{reason}".to_string()
}

fn default_command_topic_template() -> String {
    "nodes/command/devices/{device_id}/{reason}".to_string()
}

fn default_parallelism() -> usize {
    4
}

fn default_channel_capacity() -> usize {
    1000
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_aggregation_window() -> u64 {
    60
}

fn default_gateway_id() -> String {
    "gateway-instance-001".to_string()
}

fn default_processed_data_topic() -> String {
    "nodes/+/+/data/processed".to_string()
}

fn default_upstream_topic_template() -> String {
    "nodes/{device_id}/{sensor_type}/data/processed".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_failure_backoff() -> u64 {
    1000
}

fn default_health_port() -> u16 {
    8080
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Missing required setting: {0}")]
    MissingSetting(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineConfig {
    /// Load configuration from TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section that is present
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mqtt.validate()?;
        if let Some(node) = &self.node {
            node.validate()?;
        }
        self.processing_table()?;
        if let Some(gateway) = &self.gateway {
            gateway.validate()?;
        }
        Ok(())
    }

    /// Typed processing rules keyed by sensor kind
    pub fn processing_table(
        &self,
    ) -> Result<HashMap<SensorKind, SensorProcessingConfig>, ConfigError> {
        let mut table = HashMap::new();
        for (key, rules) in &self.processing {
            let kind = SensorKind::from_config_key(key).ok_or_else(|| {
                ConfigError::InvalidConfig(format!("Unknown sensor kind in [processing]: '{key}'"))
            })?;
            if let (Some(min), Some(max)) = (rules.min_value, rules.max_value) {
                if min > max {
                    return Err(ConfigError::InvalidConfig(format!(
                        "processing.{key}: min_value {min} exceeds max_value {max}"
                    )));
                }
            }
            if table.insert(kind, rules.clone()).is_some() {
                return Err(ConfigError::InvalidConfig(format!(
                    "Sensor kind {kind} configured more than once"
                )));
            }
        }
        Ok(table)
    }

    pub fn require_node(&self) -> Result<&NodeSection, ConfigError> {
        self.node
            .as_ref()
            .ok_or_else(|| ConfigError::MissingSetting("[node] section".to_string()))
    }

    pub fn require_gateway(&self) -> Result<&GatewaySection, ConfigError> {
        self.gateway
            .as_ref()
            .ok_or_else(|| ConfigError::MissingSetting("[gateway] section".to_string()))
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        get_env_var_optional(self.mqtt.password_env.as_ref())
    }
}

impl MqttSection {
    /// Minimal settings for a broker URL; everything else defaulted
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            client_id: default_client_id(),
            username_env: None,
            password_env: None,
            keep_alive_secs: default_keep_alive(),
            reconnect_delay_secs: default_reconnect_delay(),
            max_reconnect_attempts: None,
            offline_backlog_limit: default_offline_backlog_limit(),
            clean_start: true,
            initial_subscriptions: Vec::new(),
            last_will: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_url.trim().is_empty() {
            return Err(ConfigError::MissingSetting("mqtt.broker_url".to_string()));
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::MissingSetting("mqtt.client_id".to_string()));
        }
        if self.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.keep_alive_secs must be greater than 0".to_string(),
            ));
        }
        if self.offline_backlog_limit == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.offline_backlog_limit must be greater than 0".to_string(),
            ));
        }
        if self.max_reconnect_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "mqtt.max_reconnect_attempts must be greater than 0 or unset".to_string(),
            ));
        }
        for subscription in &self.initial_subscriptions {
            validate_filter("mqtt.initial_subscriptions", &subscription.filter)?;
            validate_qos("mqtt.initial_subscriptions", subscription.qos)?;
        }
        if let Some(will) = &self.last_will {
            if will.topic.trim().is_empty() {
                return Err(ConfigError::MissingSetting("mqtt.last_will.topic".to_string()));
            }
            validate_qos("mqtt.last_will", will.qos)?;
        }
        Ok(())
    }
}

impl NodeSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::MissingSetting("node.node_id".to_string()));
        }
        validate_filter("node.device_data_topic", &self.device_data_topic)?;
        if let Some(command_topic) = &self.gateway_command_topic {
            validate_filter("node.gateway_command_topic", command_topic)?;
        }
        if self.processing_parallelism == 0 {
            return Err(ConfigError::InvalidConfig(
                "node.processing_parallelism must be at least 1".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "node.channel_capacity must be at least 1".to_string(),
            ));
        }
        for (name, template) in [
            ("node.processed_topic_template", &self.processed_topic_template),
            ("node.alert_topic_template", &self.alert_topic_template),
            ("node.command_topic_template", &self.command_topic_template),
        ] {
            if !template.contains("{device_id}") {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must contain a {{device_id}} placeholder"
                )));
            }
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl GatewaySection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.server_base_url).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "gateway.server_base_url '{}' is not a valid URL: {e}",
                self.server_base_url
            ))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidConfig(format!(
                "gateway.server_base_url must use http or https, got '{}'",
                url.scheme()
            )));
        }
        validate_filter("gateway.processed_data_topic", &self.processed_data_topic)?;
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "gateway.request_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn validate_filter(setting: &str, filter: &str) -> Result<(), ConfigError> {
    validate_topic_filter(filter)
        .map_err(|e| ConfigError::InvalidConfig(format!("{setting}: {e}")))
}

fn validate_qos(setting: &str, qos: u8) -> Result<(), ConfigError> {
    if qos > 2 {
        return Err(ConfigError::InvalidConfig(format!(
            "{setting}: qos must be 0, 1 or 2, got {qos}"
        )));
    }
    Ok(())
}

/// Read an optional environment variable named by a config field
fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}
