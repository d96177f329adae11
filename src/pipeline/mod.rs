//! Ingestion plumbing shared by node and gateway
//!
//! - [`queue`] - Bounded or unbounded flume queues with non-blocking enqueue
//! - [`consumer`] - Worker pool dispatching queued messages to processors
//! - [`registry`] - Cancellable task tracking and bounded-wait teardown

pub mod consumer;
pub mod queue;
pub mod registry;

pub use consumer::{dispatch, ConsumerPool, ProcessOutcome, StreamProcessor};
pub use queue::{
    message_queue, EnqueueOutcome, QueueCapacity, QueueConsumer, QueueProducer, QueuedMessage,
};
pub use registry::{ShutdownReport, TaskRegistry};
