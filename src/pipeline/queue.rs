//! Ingestion and forwarding queues
//!
//! One producer (the transport's message sink) and any number of consumers
//! share a flume channel. The producer never blocks the transport: a full
//! queue is logged as backpressure and the write completes on a spawned task,
//! so messages are delayed rather than dropped.

use crate::error::PipelineError;
use crate::observability::metrics::metrics;
use crate::transport::{MessageReceived, MessageSink};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use flume::{Receiver, Sender, TrySendError};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// A raw inbound message waiting for a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

impl From<MessageReceived> for QueuedMessage {
    fn from(message: MessageReceived) -> Self {
        Self {
            topic: message.topic,
            payload: message.payload,
            received_at: Utc::now(),
        }
    }
}

/// Queue sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCapacity {
    Bounded(usize),
    Unbounded,
}

impl QueueCapacity {
    /// `0` means unbounded
    pub fn from_setting(capacity: usize) -> Self {
        match capacity {
            0 => Self::Unbounded,
            n => Self::Bounded(n),
        }
    }
}

/// Result of a non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Accepted immediately
    Enqueued,
    /// Queue full; the write completes once a consumer makes room
    Deferred,
    /// Queue closed; the message was discarded
    Rejected,
}

/// Create a named queue and its two ends
pub fn message_queue(name: &str, capacity: QueueCapacity) -> (QueueProducer, QueueConsumer) {
    let (sender, receiver) = match capacity {
        QueueCapacity::Bounded(n) => flume::bounded(n),
        QueueCapacity::Unbounded => flume::unbounded(),
    };
    let name: Arc<str> = Arc::from(name);

    (
        QueueProducer {
            name: name.clone(),
            capacity,
            sender: Mutex::new(Some(sender)),
        },
        QueueConsumer { name, receiver },
    )
}

/// Writing end of a queue
pub struct QueueProducer {
    name: Arc<str>,
    capacity: QueueCapacity,
    sender: Mutex<Option<Sender<QueuedMessage>>>,
}

impl QueueProducer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> QueueCapacity {
        self.capacity
    }

    fn sender(&self) -> Option<Sender<QueuedMessage>> {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.sender().is_none()
    }

    /// Messages currently buffered
    pub fn len(&self) -> usize {
        self.sender().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best-effort enqueue that never waits for space
    pub fn enqueue(&self, message: QueuedMessage) -> EnqueueOutcome {
        let Some(sender) = self.sender() else {
            warn!(queue = %self.name, topic = %message.topic, "Queue closed, discarding message");
            metrics().record_message_rejected();
            return EnqueueOutcome::Rejected;
        };

        match sender.try_send(message) {
            Ok(()) => {
                metrics().record_message_enqueued();
                EnqueueOutcome::Enqueued
            }
            Err(TrySendError::Full(message)) => {
                warn!(
                    queue = %self.name,
                    topic = %message.topic,
                    capacity = ?self.capacity,
                    "Enqueuing message encountered backpressure"
                );
                metrics().record_message_deferred();
                self.complete_deferred(sender, message);
                EnqueueOutcome::Deferred
            }
            Err(TrySendError::Disconnected(message)) => {
                warn!(queue = %self.name, topic = %message.topic, "No consumers left, discarding message");
                metrics().record_message_rejected();
                EnqueueOutcome::Rejected
            }
        }
    }

    fn complete_deferred(&self, sender: Sender<QueuedMessage>, message: QueuedMessage) {
        let name = self.name.clone();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let topic = message.topic.clone();
                    match sender.send_async(message).await {
                        Ok(()) => {
                            debug!(queue = %name, topic = %topic, "Deferred message enqueued");
                            metrics().record_message_enqueued();
                        }
                        Err(_) => {
                            error!(queue = %name, topic = %topic, "Failed to write deferred message to queue");
                            metrics().record_message_rejected();
                        }
                    }
                });
            }
            // Outside a runtime (rumqttc sync callbacks, plain threads)
            Err(_) => {
                let topic = message.topic.clone();
                if sender.send(message).is_ok() {
                    metrics().record_message_enqueued();
                } else {
                    error!(queue = %name, topic = %topic, "Failed to write deferred message to queue");
                    metrics().record_message_rejected();
                }
            }
        }
    }

    /// Enqueue, waiting for space when the queue is full
    pub async fn enqueue_async(&self, message: QueuedMessage) -> Result<(), PipelineError> {
        let sender = self
            .sender()
            .ok_or_else(|| PipelineError::queue(format!("queue '{}' is closed", self.name)))?;
        sender
            .send_async(message)
            .await
            .map_err(|_| PipelineError::queue(format!("queue '{}' has no consumers", self.name)))?;
        metrics().record_message_enqueued();
        Ok(())
    }

    /// Stop accepting messages; consumers drain what is buffered then see the end
    pub fn close(&self) {
        let previous = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(sender) = previous {
            info!(queue = %self.name, buffered = sender.len(), "Queue closed for writing");
        }
    }
}

impl MessageSink for QueueProducer {
    fn deliver(&self, message: MessageReceived) {
        debug!(queue = %self.name, topic = %message.topic, "Message received");
        metrics().record_message_received();
        self.enqueue(QueuedMessage::from(message));
    }
}

/// Reading end of a queue, cloned once per worker
#[derive(Clone)]
pub struct QueueConsumer {
    name: Arc<str>,
    receiver: Receiver<QueuedMessage>,
}

impl QueueConsumer {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next message, or `None` once the queue is closed and drained
    pub async fn recv(&self) -> Option<QueuedMessage> {
        self.receiver.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<QueuedMessage> {
        self.receiver.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Buffer size, `None` when unbounded
    pub fn capacity(&self) -> Option<usize> {
        self.receiver.capacity()
    }

    /// Closed for writing with nothing left to read
    pub fn is_drained(&self) -> bool {
        self.receiver.is_disconnected() && self.receiver.is_empty()
    }
}
