//! Consumer pool draining the ingestion queue
//!
//! Each worker pulls one message at a time and hands it to every
//! [`StreamProcessor`] that claims its topic. Failures and panics are isolated
//! to the message; only cancellation or a closed, drained queue ends a worker.

use super::queue::{QueueConsumer, QueuedMessage};
use super::registry::TaskRegistry;
use crate::error::ProcessingError;
use crate::observability::metrics::metrics;
use crate::pipeline_span;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// What a processor did with a message it claimed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Fully processed
    Handled,
    /// Rejected by validation, with the reason
    Filtered(String),
    /// Deliberately ignored (e.g. unconfigured sensor kind)
    Skipped(String),
}

/// A stage that consumes queued messages
#[async_trait]
pub trait StreamProcessor: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this processor claims messages on `topic`
    fn can_process(&self, topic: &str) -> bool;

    async fn process(&self, message: &QueuedMessage) -> Result<ProcessOutcome, ProcessingError>;
}

/// Fixed-size set of workers sharing one queue
pub struct ConsumerPool {
    processors: Arc<Vec<Arc<dyn StreamProcessor>>>,
    parallelism: usize,
}

impl ConsumerPool {
    pub fn new(processors: Vec<Arc<dyn StreamProcessor>>, parallelism: usize) -> Self {
        Self {
            processors: Arc::new(processors),
            parallelism: parallelism.max(1),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Spawn `parallelism` workers into `registry`
    pub fn spawn(&self, consumer: &QueueConsumer, registry: &TaskRegistry) {
        info!(
            queue = consumer.name(),
            workers = self.parallelism,
            processors = self.processors.len(),
            "Starting consumer pool"
        );

        for worker_id in 0..self.parallelism {
            let consumer = consumer.clone();
            let processors = self.processors.clone();
            registry.spawn(format!("{}-consumer-{worker_id}", consumer.name()), move |token| {
                run_worker(worker_id, consumer, processors, token)
            });
        }
    }
}

/// One worker loop; the in-flight message always completes before exit
pub async fn run_worker(
    worker_id: usize,
    consumer: QueueConsumer,
    processors: Arc<Vec<Arc<dyn StreamProcessor>>>,
    token: CancellationToken,
) {
    debug!(worker = worker_id, queue = consumer.name(), "Consumer started");

    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(worker = worker_id, "Consumer cancelled");
                break;
            }
            message = consumer.recv() => match message {
                Some(message) => message,
                None => {
                    debug!(worker = worker_id, "Queue closed and drained");
                    break;
                }
            },
        };

        let span = pipeline_span!(worker = worker_id, topic = %message.topic);
        dispatch(&processors, &message).instrument(span).await;
    }

    debug!(worker = worker_id, "Consumer stopped");
}

/// Run every claiming processor over `message`; returns whether any claimed it
pub async fn dispatch(processors: &[Arc<dyn StreamProcessor>], message: &QueuedMessage) -> bool {
    let mut claimed = false;

    for processor in processors.iter().filter(|p| p.can_process(&message.topic)) {
        claimed = true;
        let started = Instant::now();
        let result = AssertUnwindSafe(processor.process(message))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(outcome)) => {
                match &outcome {
                    ProcessOutcome::Handled => {}
                    ProcessOutcome::Filtered(reason) => {
                        debug!(processor = processor.name(), reason = %reason, "Message filtered");
                    }
                    ProcessOutcome::Skipped(reason) => {
                        debug!(processor = processor.name(), reason = %reason, "Message skipped");
                    }
                }
                metrics().record_message_processed(started.elapsed());
            }
            Ok(Err(e)) => {
                if e.is_decode() {
                    metrics().record_decode_failure();
                }
                warn!(processor = processor.name(), error = %e, "Message processing failed");
                metrics().record_processing_failure(started.elapsed());
            }
            Err(_) => {
                error!(processor = processor.name(), "Processor panicked, message dropped");
                metrics().record_processing_failure(started.elapsed());
            }
        }
    }

    if !claimed {
        warn!(topic = %message.topic, "No processor claimed message");
        metrics().record_message_unclaimed();
    }

    claimed
}
