//! Testing utilities and mock implementations
//!
//! This module provides mock implementations for exercising the telemetry
//! pipeline without an MQTT broker or upstream HTTP server.

pub mod mocks;

pub use mocks::*;
