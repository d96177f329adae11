//! Mock implementations for testing
//!
//! Provides a mock [`Transport`] that records every publish and subscription
//! and lets tests inject inbound messages, so pipelines can be exercised
//! without a broker.

use crate::transport::mqtt::MqttError;
use crate::transport::{ConnectionStatusChanged, MessageReceived, MessageSink, QoS, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Publish captured by [`MockTransport`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishedMessage {
    /// Payload parsed as JSON, `Value::Null` if it is not JSON
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap_or(Value::Null)
    }
}

/// Mock transport for testing
pub struct MockTransport {
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    should_fail: AtomicBool,
    connected: AtomicBool,
    /// Set by `disconnect()`; publishes fail like they do on a stopped client
    disconnected: AtomicBool,
    sink: std::sync::Mutex<Option<Arc<dyn MessageSink>>>,
    status_tx: broadcast::Sender<ConnectionStatusChanged>,
}

impl Default for MockTransport {
    fn default() -> Self {
        let (status_tx, _) = broadcast::channel(16);
        Self {
            published_messages: Arc::default(),
            subscriptions: Arc::default(),
            should_fail: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            sink: std::sync::Mutex::new(None),
            status_tx,
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connect and publish fails
    pub fn with_failure() -> Self {
        let mock = Self::default();
        mock.set_should_fail(true);
        mock
    }

    pub fn set_should_fail(&self, should_fail: bool) {
        self.should_fail.store(should_fail, Ordering::SeqCst);
    }

    fn failing(&self) -> bool {
        self.should_fail.load(Ordering::SeqCst)
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published_messages.lock().await.clone()
    }

    /// Publishes whose topic starts with `prefix`
    pub async fn published_with_prefix(&self, prefix: &str) -> Vec<PublishedMessage> {
        self.published_messages
            .lock()
            .await
            .iter()
            .filter(|message| message.topic.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub async fn get_subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.published_messages.lock().await.clear();
    }

    /// Deliver an inbound message to the registered sink as the broker would
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        let sink = self.sink.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match sink {
            Some(sink) => {
                sink.deliver(MessageReceived {
                    topic: topic.to_string(),
                    payload: payload.into(),
                    qos: QoS::AtLeastOnce,
                    retain: false,
                });
                true
            }
            None => false,
        }
    }

    /// Flip the connection flag and emit a status event
    pub fn simulate_connection_change(&self, is_connected: bool, reason: Option<&str>) {
        self.connected.store(is_connected, Ordering::SeqCst);
        let _ = self.status_tx.send(ConnectionStatusChanged {
            is_connected,
            reason: reason.map(str::to_string),
        });
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MqttError;

    async fn connect(&self) -> Result<(), Self::Error> {
        if self.failing() {
            self.simulate_connection_change(false, Some("Mock connection failure"));
            return Ok(());
        }
        self.disconnected.store(false, Ordering::SeqCst);
        if !self.connected.load(Ordering::SeqCst) {
            self.simulate_connection_change(true, None);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.disconnected.store(true, Ordering::SeqCst);
        if self.connected.load(Ordering::SeqCst) {
            self.simulate_connection_change(false, None);
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Self::Error> {
        if self.failing() {
            return Err(MqttError::PublishFailed("Mock publish failure".into()));
        }
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(MqttError::PublishFailed("Mock transport disconnected".into()));
        }

        self.published_messages.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), Self::Error> {
        let mut subscriptions = self.subscriptions.lock().await;
        subscriptions.retain(|(existing, _)| existing != filter);
        subscriptions.push((filter.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), Self::Error> {
        self.subscriptions
            .lock()
            .await
            .retain(|(existing, _)| existing != filter);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_message_sink(&self, sink: Arc<dyn MessageSink>) {
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    fn status_events(&self) -> broadcast::Receiver<ConnectionStatusChanged> {
        self.status_tx.subscribe()
    }
}
