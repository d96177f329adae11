//! Observability for the telemetry pipeline
//!
//! Structured logging, process-wide metrics and the health/metrics HTTP
//! endpoints.

pub mod health;
pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use health::{CheckStatus, HealthCheck, HealthReport, HealthServer};
pub use logging::{init_default_logging, init_logging, LogFormat, LoggingSettings};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{forward_span, lifecycle_span, mqtt_span, pipeline_span};
