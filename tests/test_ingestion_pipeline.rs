//! Ingestion queue and consumer pool integration tests
//!
//! Every message enqueued must be processed exactly once, whatever the
//! queue capacity and number of consumers, and backpressure may only delay.

use async_trait::async_trait;
use edge_telemetry::error::ProcessingError;
use edge_telemetry::pipeline::{
    message_queue, ConsumerPool, EnqueueOutcome, ProcessOutcome, QueueCapacity, QueuedMessage,
    StreamProcessor, TaskRegistry,
};
use edge_telemetry::testing::MockTransport;
use edge_telemetry::transport::Transport;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records the sequence number carried in every payload it sees
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<usize>>,
    delay: Option<Duration>,
}

#[async_trait]
impl StreamProcessor for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn can_process(&self, topic: &str) -> bool {
        topic.starts_with("devices/")
    }

    async fn process(&self, message: &QueuedMessage) -> Result<ProcessOutcome, ProcessingError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let sequence = std::str::from_utf8(&message.payload)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ProcessingError::invalid_payload(&message.topic, "not a number"))?;
        self.seen.lock().unwrap().push(sequence);
        Ok(ProcessOutcome::Handled)
    }
}

impl Recorder {
    fn sorted(&self) -> Vec<usize> {
        let mut seen = self.seen.lock().unwrap().clone();
        seen.sort_unstable();
        seen
    }
}

async fn run_pipeline(messages: usize, consumers: usize, capacity: usize) -> Vec<usize> {
    let recorder = Arc::new(Recorder::default());
    let (producer, consumer) = message_queue("ingest", QueueCapacity::Bounded(capacity));
    let registry = TaskRegistry::new("test");
    ConsumerPool::new(vec![recorder.clone() as Arc<dyn StreamProcessor>], consumers)
        .spawn(&consumer, &registry);

    for sequence in 0..messages {
        producer
            .enqueue_async(QueuedMessage::new(
                format!("devices/{}/data", sequence % 7),
                sequence.to_string(),
            ))
            .await
            .unwrap();
    }
    producer.close();

    assert!(
        registry.wait_idle(Duration::from_secs(10)).await,
        "consumers did not drain the queue"
    );
    recorder.sorted()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_message_processed_exactly_once() {
    for (messages, consumers, capacity) in [(1, 1, 1), (50, 1, 4), (500, 4, 16), (1000, 8, 1000)] {
        // Act
        let seen = run_pipeline(messages, consumers, capacity).await;

        // Assert
        assert_eq!(
            seen,
            (0..messages).collect::<Vec<_>>(),
            "N={messages} M={consumers} capacity={capacity}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backpressure_defers_without_dropping() {
    // Arrange: slow consumer and a tiny queue
    let recorder = Arc::new(Recorder {
        delay: Some(Duration::from_millis(2)),
        ..Default::default()
    });
    let (producer, consumer) = message_queue("ingest", QueueCapacity::Bounded(2));
    let registry = TaskRegistry::new("test");
    ConsumerPool::new(vec![recorder.clone() as Arc<dyn StreamProcessor>], 1)
        .spawn(&consumer, &registry);

    // Act: the non-blocking path never waits for space
    let outcomes: Vec<EnqueueOutcome> = (0..40)
        .map(|n| producer.enqueue(QueuedMessage::new("devices/1/data", n.to_string())))
        .collect();

    // Assert
    assert!(outcomes.contains(&EnqueueOutcome::Deferred));
    assert!(!outcomes.contains(&EnqueueOutcome::Rejected));

    tokio::time::sleep(Duration::from_millis(50)).await;
    producer.close();
    assert!(registry.wait_idle(Duration::from_secs(10)).await);
    assert_eq!(recorder.sorted(), (0..40).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_unclaimed_and_failing_messages_do_not_stop_consumers() {
    let recorder = Arc::new(Recorder::default());
    let (producer, consumer) = message_queue("ingest", QueueCapacity::Bounded(16));
    let registry = TaskRegistry::new("test");
    ConsumerPool::new(vec![recorder.clone() as Arc<dyn StreamProcessor>], 2)
        .spawn(&consumer, &registry);

    producer.enqueue(QueuedMessage::new("gateway/commands/reboot", "1"));
    producer.enqueue(QueuedMessage::new("devices/1/data", "garbage"));
    producer.enqueue(QueuedMessage::new("devices/1/data", "7"));
    producer.close();

    assert!(registry.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(recorder.sorted(), vec![7]);
}

#[tokio::test]
async fn test_transport_sink_feeds_queue() {
    // Arrange
    let transport = MockTransport::new();
    let (producer, consumer) = message_queue("ingest", QueueCapacity::Bounded(8));
    transport.set_message_sink(Arc::new(producer));

    // Act
    assert!(transport.inject("devices/4/data", "42"));

    // Assert: the queued copy carries topic and payload
    let message = consumer.try_recv().unwrap();
    assert_eq!(message.topic, "devices/4/data");
    assert_eq!(message.payload.as_ref(), b"42");
}

#[tokio::test]
async fn test_cancellation_leaves_unprocessed_messages_queued() {
    let recorder = Arc::new(Recorder {
        delay: Some(Duration::from_millis(200)),
        ..Default::default()
    });
    let (producer, consumer) = message_queue("ingest", QueueCapacity::Bounded(16));
    let registry = TaskRegistry::new("test");
    ConsumerPool::new(vec![recorder.clone() as Arc<dyn StreamProcessor>], 1)
        .spawn(&consumer, &registry);

    for n in 0..5 {
        producer.enqueue(QueuedMessage::new("devices/1/data", n.to_string()));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Act: no drain period, the in-flight message still completes
    let report = registry.cancel_all().await;

    // Assert
    assert_eq!(report.aborted, 0);
    assert_eq!(recorder.sorted(), vec![0]);
    assert_eq!(consumer.len(), 4);
}
