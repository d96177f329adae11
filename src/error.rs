//! Error types for the telemetry pipeline
//!
//! Per-message failures are modelled as [`ProcessingError`] and never cross a
//! consumer loop boundary. [`PipelineError`] covers everything that may stop a
//! component: configuration, transport start-up and shutdown problems.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for pipeline components
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Queue error: {message}")]
    Queue { message: String },

    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),

    #[error("Forwarding error: {0}")]
    Forward(#[from] crate::forwarding::ForwardError),

    #[error("Shutdown error: {message}")]
    Shutdown { message: String },
}

impl PipelineError {
    /// Wrap any transport error
    pub fn transport<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport(Box::new(error))
    }

    /// Create queue error
    pub fn queue<S: Into<String>>(message: S) -> Self {
        Self::Queue {
            message: message.into(),
        }
    }

    /// Create shutdown error
    pub fn shutdown<S: Into<String>>(message: S) -> Self {
        Self::Shutdown {
            message: message.into(),
        }
    }
}

/// Failures scoped to a single queued message
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Malformed payload on topic {topic}: {source}")]
    Decode {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid payload on topic {topic}: {message}")]
    InvalidPayload { topic: String, message: String },

    #[error("Failed to emit on topic {topic}: {message}")]
    Emission { topic: String, message: String },
}

impl ProcessingError {
    pub fn decode(topic: &str, source: serde_json::Error) -> Self {
        Self::Decode {
            topic: topic.to_string(),
            source,
        }
    }

    pub fn invalid_payload<S: Into<String>>(topic: &str, message: S) -> Self {
        Self::InvalidPayload {
            topic: topic.to_string(),
            message: message.into(),
        }
    }

    pub fn emission<S: Into<String>>(topic: &str, message: S) -> Self {
        Self::Emission {
            topic: topic.to_string(),
            message: message.into(),
        }
    }

    /// Decode failures are counted separately from other per-message errors
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}

const MAX_DETAIL_LEN: usize = 500;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

/// Mask credential-looking fragments and bound the length of text that ends
/// up in logs (upstream response bodies, broker reasons).
pub fn sanitize_detail(detail: &str) -> String {
    let mut sanitized = SECRET_PATTERN.replace_all(detail, "${1}=***").to_string();

    if sanitized.len() > MAX_DETAIL_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_DETAIL_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(suffix);
    }

    sanitized
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
