//! Structured logging using the tracing crate
//!
//! Span macros for the pipeline stages (message processing, upstream
//! delivery, MQTT operations and service lifecycle) live here as well.
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE - defaults to INFO
//! - `LOG_FORMAT`: `json`, `pretty` or `compact` - defaults to json
//! - `LOG_SPANS`: `true` adds span open/close events
//! - `RUST_LOG`: replaces the level-derived filter entirely
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG ./edge-telemetry -c edge.toml node
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

/// Dependencies held at WARN unless RUST_LOG says otherwise
const QUIET_TARGETS: &[&str] = &["rumqttc", "hyper", "reqwest", "warp", "tokio"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event
    Json,
    /// Multi-line, coloured
    Pretty,
    /// Single line, coloured, no targets
    Compact,
}

impl LogFormat {
    /// Unrecognised values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Resolved subscriber settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: Level,
    pub format: LogFormat,
    pub include_spans: bool,
    /// Raw `RUST_LOG` value, used instead of `level` when present
    pub filter_override: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            include_spans: false,
            filter_override: None,
        }
    }
}

impl LoggingSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from any key lookup (the process environment in production)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            level: lookup("LOG_LEVEL")
                .map(|value| parse_level(&value))
                .unwrap_or(Level::INFO),
            format: lookup("LOG_FORMAT")
                .map(|value| LogFormat::parse(&value))
                .unwrap_or(LogFormat::Json),
            include_spans: lookup("LOG_SPANS")
                .map(|value| parse_spans_flag(&value))
                .unwrap_or(false),
            filter_override: lookup("RUST_LOG").filter(|value| !value.trim().is_empty()),
        }
    }

    /// Apply `-v` flags: one raises to DEBUG, two or more to TRACE
    pub fn with_verbosity(mut self, verbose: u8) -> Self {
        match verbose {
            0 => {}
            1 => self.level = self.level.max(Level::DEBUG),
            _ => self.level = Level::TRACE,
        }
        self
    }

    /// Filter directives handed to `EnvFilter`
    pub fn filter_directives(&self) -> String {
        if let Some(filter) = &self.filter_override {
            return filter.clone();
        }
        QUIET_TARGETS
            .iter()
            .fold(self.level.to_string().to_lowercase(), |acc, target| {
                format!("{acc},{target}=warn")
            })
    }

    fn span_events(&self) -> FmtSpan {
        if self.include_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Install the global subscriber; a second call leaves the first in place
pub fn init_logging(settings: &LoggingSettings) {
    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match settings.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_span_events(settings.span_events())
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_ansi(true)
            .with_span_events(settings.span_events())
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(true)
            .with_target(false)
            .with_span_events(settings.span_events())
            .boxed(),
    };

    let installed = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::new(settings.filter_directives()))
        .try_init();

    if let Err(e) = installed {
        eprintln!("Logging already initialised: {e}");
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() {
    init_logging(&LoggingSettings::from_env());
}

/// Map a `LOG_LEVEL` value to a tracing level, INFO when unrecognised
pub fn parse_level(value: &str) -> Level {
    match value.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// `LOG_SPANS` is only on for a literal "true"
pub fn parse_spans_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true")
}

/// Span around one queued message moving through a consumer
#[macro_export]
macro_rules! pipeline_span {
    ($($field:tt)*) => {
        tracing::info_span!("pipeline_message", $($field)*)
    };
}

/// Span around one upstream delivery
#[macro_export]
macro_rules! forward_span {
    ($($field:tt)*) => {
        tracing::info_span!("forward_delivery", $($field)*)
    };
}

#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_operation", $($field)*)
    };
}

/// Span around a node or gateway start/stop
#[macro_export]
macro_rules! lifecycle_span {
    ($($field:tt)*) => {
        tracing::info_span!("lifecycle_event", $($field)*)
    };
}

pub use {forward_span, lifecycle_span, mqtt_span, pipeline_span};
