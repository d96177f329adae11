//! Sensor stream processing
//!
//! [`SensorDataProcessor`] is the node's only [`StreamProcessor`]; alert and
//! aggregation state live in [`alerts`] and [`aggregation`] so they can be
//! tested without a transport.
//!
//! [`StreamProcessor`]: crate::pipeline::StreamProcessor

pub mod aggregation;
pub mod alerts;
pub mod sensor;

pub use aggregation::{AggregateResult, AggregationStore, SeriesKey};
pub use alerts::{AlertDirection, AlertEdge, AlertKey, AlertScope, AlertState, AlertTracker};
pub use sensor::{OutputTopics, SensorDataProcessor};
