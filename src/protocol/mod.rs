//! Payload types and topic handling for the telemetry pipeline

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
