//! edge-telemetry - edge-to-cloud sensor pipeline
//!
//! Devices publish readings over MQTT; nodes validate, aggregate and
//! threshold-check them and publish alerts, commands and aggregates; a
//! gateway forwards processed results to an upstream HTTP server.
//!
//! # Overview
//!
//! - [`transport`] - `Transport` abstraction and the rumqttc-backed `MqttClient`
//! - [`pipeline`] - ingestion queue, consumer pool and task registry
//! - [`processing`] - sensor validation, windowed aggregation, hysteresis alerts
//! - [`forwarding`] - upstream HTTP delivery for the gateway
//! - [`runtime`] - `NodeService` and `GatewayService` wiring
//! - [`observability`] - tracing setup, metrics and health endpoints
//!
//! # Quick Start
//!
//! ```rust
//! use edge_telemetry::protocol::TopicFilter;
//!
//! let filter = TopicFilter::new("$share/nodes/devices/+/data").unwrap();
//! assert!(filter.matches("devices/7/data"));
//! assert!(!filter.matches("devices/7/8/data"));
//! ```

pub mod config;
pub mod error;
pub mod forwarding;
pub mod observability;
pub mod pipeline;
pub mod processing;
pub mod protocol;
pub mod runtime;
pub mod testing;
pub mod transport;

pub use config::*;
pub use error::{PipelineError, PipelineResult, ProcessingError};
pub use forwarding::{ForwardError, ForwardOutcome, Forwarder};
pub use pipeline::{ConsumerPool, QueuedMessage, StreamProcessor, TaskRegistry};
pub use processing::SensorDataProcessor;
pub use protocol::*;
pub use runtime::{GatewayService, NodeService};
pub use transport::mqtt::MqttClient;
pub use transport::{MessageSink, Transport};
