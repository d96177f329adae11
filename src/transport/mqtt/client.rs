//! Impure I/O operations for MQTT client
//!
//! This module handles all impure I/O operations including network communication,
//! async coordination, and integration with the rumqttc client.

use super::connection::{
    configure_mqtt_options, qos_from_level, ConnectionState, MqttError, ReconnectConfig,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor, PublishDecision, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageDispatcher, MessageHandler};
use crate::config::MqttSection;
use crate::mqtt_span;
use crate::observability::metrics::metrics;
use crate::protocol::validate_topic_filter;
use crate::transport::{ConnectionStatusChanged, MessageSink, QoS, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Requests beyond the offline backlog that the request channel can still hold
const REQUEST_CHANNEL_HEADROOM: usize = 64;
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
const SUPERVISOR_STOP_TIMEOUT: Duration = Duration::from_secs(2);
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
const STATUS_CHANNEL_CAPACITY: usize = 32;

/// Subscriptions replayed after every ConnAck
#[derive(Default)]
struct SubscriptionSet {
    entries: std::sync::Mutex<Vec<(String, QoS)>>,
}

impl SubscriptionSet {
    fn upsert(&self, filter: &str, qos: QoS) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.iter_mut().find(|(existing, _)| existing == filter) {
            Some(entry) => entry.1 = qos,
            None => entries.push((filter.to_string(), qos)),
        }
    }

    fn remove(&self, filter: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|(existing, _)| existing != filter);
        entries.len() != before
    }

    fn snapshot(&self) -> Vec<(String, QoS)> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// MQTT v5 transport client with managed reconnection
///
/// One `AsyncClient` is used for the lifetime of the value; after a network
/// error the event loop reconnects on its next poll and the supervisor
/// replays every registered subscription once the broker acknowledges.
pub struct MqttClient {
    client_id: String,
    client: AsyncClient,
    event_loop: Mutex<Option<EventLoop>>,
    reconnect_config: ReconnectConfig,
    backlog_limit: usize,
    state_tx: watch::Sender<ConnectionState>,
    status_tx: broadcast::Sender<ConnectionStatusChanged>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Arc<SubscriptionSet>,
    dispatcher: Arc<MessageDispatcher>,
    started: AtomicBool,
    intentional_disconnect: Arc<AtomicBool>,
    offline_backlog: Arc<AtomicUsize>,
}

impl MqttClient {
    /// Build the client; missing broker address or identity fails here
    pub fn new(config: MqttSection) -> Result<Self, MqttError> {
        let mqtt_options = configure_mqtt_options(&config)?;

        let subscriptions = Arc::new(SubscriptionSet::default());
        for subscription in &config.initial_subscriptions {
            validate_topic_filter(&subscription.filter)
                .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;
            let qos = qos_from_level(subscription.qos).ok_or_else(|| {
                MqttError::SubscriptionFailed(
                    format!("invalid QoS {} for {}", subscription.qos, subscription.filter).into(),
                )
            })?;
            subscriptions.upsert(&subscription.filter, qos);
        }

        let (client, event_loop) = AsyncClient::new(
            mqtt_options,
            config.offline_backlog_limit + REQUEST_CHANNEL_HEADROOM,
        );
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected("Not started".to_string()));
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            client_id: config.client_id.clone(),
            client,
            event_loop: Mutex::new(Some(event_loop)),
            reconnect_config: ReconnectConfig::from_section(&config),
            backlog_limit: config.offline_backlog_limit,
            state_tx,
            status_tx,
            shutdown_tx,
            supervisor: Mutex::new(None),
            subscriptions,
            dispatcher: Arc::new(MessageDispatcher::new()),
            started: AtomicBool::new(false),
            intentional_disconnect: Arc::new(AtomicBool::new(false)),
            offline_backlog: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(reason) => {
                        return Err(MqttError::ConnectionFailedStr(reason.clone()));
                    }
                    ConnectionState::PermanentlyDisconnected(reason) => {
                        return Err(MqttError::ConnectionFailedStr(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    // The watch only keeps the latest value, so a failed first
                    // attempt may already have moved on to a retry
                    ConnectionState::Reconnecting(attempt) => {
                        return Err(MqttError::ConnectionFailedStr(format!(
                            "First connection attempt failed, retrying (attempt {attempt})"
                        )));
                    }
                    ConnectionState::Connecting => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Perform interruptible sleep with shutdown monitoring
    /// Returns true if sleep completed, false if shutdown requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        if *shutdown_rx.borrow_and_update() {
            return false;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Start the managed connection
    ///
    /// Idempotent. Waits a bounded time for the first ConnAck; if it does not
    /// arrive the failure has already been reported as a status event and the
    /// supervisor keeps retrying in the background, so this still returns Ok.
    pub async fn connect(&self) -> Result<(), MqttError> {
        self.start_supervisor()
            .instrument(mqtt_span!(operation = "connect", client_id = %self.client_id))
            .await
    }

    async fn start_supervisor(&self) -> Result<(), MqttError> {
        if self.intentional_disconnect.load(Ordering::SeqCst) {
            return Err(MqttError::ConnectionFailedStr(
                "Client was disconnected; create a new client to reconnect".to_string(),
            ));
        }

        let Some(event_loop) = self.event_loop.lock().await.take() else {
            debug!("MQTT client already started");
            return Ok(());
        };

        self.state_tx.send_replace(ConnectionState::Connecting);
        let state_rx = self.state_tx.subscribe();
        let shutdown_rx = self.shutdown_tx.subscribe();

        let supervisor = Supervisor {
            client_id: self.client_id.clone(),
            client: self.client.clone(),
            state_tx: self.state_tx.clone(),
            status_tx: self.status_tx.clone(),
            subscriptions: self.subscriptions.clone(),
            dispatcher: self.dispatcher.clone(),
            reconnect_config: self.reconnect_config.clone(),
            intentional_disconnect: self.intentional_disconnect.clone(),
            offline_backlog: self.offline_backlog.clone(),
        };
        let handle = tokio::spawn(supervisor.run(event_loop, shutdown_rx));
        *self.supervisor.lock().await = Some(handle);
        self.started.store(true, Ordering::SeqCst);

        let timeout = HealthMonitor::calculate_connection_timeout(&self.reconnect_config);
        match Self::wait_for_connection_confirmation(state_rx, timeout).await {
            Ok(()) => info!(client_id = %self.client_id, "MQTT client connected"),
            Err(e) => warn!(
                client_id = %self.client_id,
                error = %e,
                "MQTT connection not confirmed, retrying in background"
            ),
        }
        Ok(())
    }

    /// Intentionally stop the managed connection
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        if !self.started.load(Ordering::SeqCst) {
            debug!("Disconnect requested before connect - nothing to stop");
            return Ok(());
        }

        self.intentional_disconnect.store(true, Ordering::SeqCst);

        if self.is_connected() {
            if let Err(e) = self.client.try_disconnect() {
                debug!(error = %e, "Could not queue DISCONNECT packet");
            }
        }

        // Signal the reconnection supervisor to stop
        let _ = self.shutdown_tx.send(true);

        if let Some(mut handle) = self.supervisor.lock().await.take() {
            match tokio::time::timeout(SUPERVISOR_STOP_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!("Event loop task ended with error: {}", e);
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("Event loop task didn't shut down gracefully, forcing abort");
                    handle.abort();
                }
            }
        }

        apply_transition(
            &self.state_tx,
            &self.status_tx,
            ConnectionEvent::ClientDisconnected,
            true,
        );
        Ok(())
    }

    /// Get current connection state
    /// Returns None if the client hasn't been started yet
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.started
            .load(Ordering::SeqCst)
            .then(|| self.state_tx.borrow().clone())
    }

    /// Check if the connection is permanently disconnected
    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            Some(ConnectionState::PermanentlyDisconnected(_))
        )
    }

    /// Publishes accepted while offline and not yet flushed by a reconnect
    pub fn offline_backlog(&self) -> usize {
        self.offline_backlog.load(Ordering::SeqCst)
    }

    fn ensure_started(&self) -> Result<(), MqttError> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MqttError::NotStarted)
        }
    }

    /// Accept a message for sending
    ///
    /// Connected: waits until the client accepts the request. Offline: queues
    /// without waiting, up to the backlog limit; beyond it the message is
    /// logged and dropped.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        self.ensure_started()?;

        let state = self.state_tx.borrow().clone();
        let backlog = self.offline_backlog.load(Ordering::SeqCst);

        match HealthMonitor::publish_decision(&state, backlog, self.backlog_limit) {
            PublishDecision::Send => {
                let send = self.client.publish(topic, qos, retain, payload);
                match tokio::time::timeout(PUBLISH_TIMEOUT, send).await {
                    Ok(Ok(())) => {
                        metrics().record_mqtt_publish();
                        Ok(())
                    }
                    Ok(Err(e)) => {
                        metrics().record_mqtt_publish_failure();
                        Err(MqttError::PublishFailed(Box::new(e)))
                    }
                    Err(_) => {
                        metrics().record_mqtt_publish_failure();
                        Err(MqttError::PublishFailed(
                            format!("publish to {topic} not accepted within {PUBLISH_TIMEOUT:?}")
                                .into(),
                        ))
                    }
                }
            }
            PublishDecision::QueueOffline => {
                self.client
                    .try_publish(topic, qos, retain, payload)
                    .map_err(|e| {
                        metrics().record_mqtt_publish_failure();
                        MqttError::PublishFailed(Box::new(e))
                    })?;
                self.offline_backlog.fetch_add(1, Ordering::SeqCst);
                metrics().record_mqtt_publish();
                debug!(topic = %topic, backlog = backlog + 1, "Queued publish while offline");
                Ok(())
            }
            PublishDecision::Drop => {
                metrics().record_offline_publish_dropped();
                warn!(
                    topic = %topic,
                    backlog_limit = self.backlog_limit,
                    "Offline publish backlog full - message dropped"
                );
                Ok(())
            }
        }
    }

    /// Register a subscription; sent now if connected and on every reconnect
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), MqttError> {
        self.ensure_started()?;
        validate_topic_filter(filter).map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;

        self.subscriptions.upsert(filter, qos);

        if !self.is_connected() {
            info!(filter = %filter, "Subscription registered, will be sent on connect");
            return Ok(());
        }

        match tokio::time::timeout(PUBLISH_TIMEOUT, self.client.subscribe(filter, qos)).await {
            Ok(Ok(())) => {
                info!(filter = %filter, qos = ?qos, "Subscribed");
                Ok(())
            }
            Ok(Err(e)) => Err(MqttError::SubscriptionFailed(Box::new(e))),
            Err(_) => Err(MqttError::SubscriptionFailed(
                format!("subscribe to {filter} not accepted within {PUBLISH_TIMEOUT:?}").into(),
            )),
        }
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<(), MqttError> {
        self.ensure_started()?;

        if !self.subscriptions.remove(filter) {
            debug!(filter = %filter, "Unsubscribe for unknown filter");
        }

        if self.is_connected() {
            self.client
                .unsubscribe(filter)
                .await
                .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;
        }
        info!(filter = %filter, "Unsubscribed");
        Ok(())
    }
}

/// Background task owning the event loop
struct Supervisor {
    client_id: String,
    client: AsyncClient,
    state_tx: watch::Sender<ConnectionState>,
    status_tx: broadcast::Sender<ConnectionStatusChanged>,
    subscriptions: Arc<SubscriptionSet>,
    dispatcher: Arc<MessageDispatcher>,
    reconnect_config: ReconnectConfig,
    intentional_disconnect: Arc<AtomicBool>,
    offline_backlog: Arc<AtomicUsize>,
}

impl Supervisor {
    async fn run(self, mut event_loop: EventLoop, mut shutdown_rx: watch::Receiver<bool>) {
        info!(client_id = %self.client_id, "Starting MQTT event loop with reconnection supervisor");
        let mut reconnect_attempts = 0u32;

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        self.flush_disconnect(&mut event_loop).await;
                        break;
                    }
                }

                event_result = event_loop.poll() => {
                    let keep_running = match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            self.process_event_route(route, &mut reconnect_attempts, &shutdown_rx)
                                .await
                        }
                        Err(e) => {
                            self.handle_event_loop_error(e, &mut reconnect_attempts, &shutdown_rx)
                                .await
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }

        info!(client_id = %self.client_id, "MQTT event loop stopped");
    }

    fn transition(&self, event: ConnectionEvent) {
        apply_transition(
            &self.state_tx,
            &self.status_tx,
            event,
            self.intentional_disconnect.load(Ordering::SeqCst),
        );
    }

    /// Returns true to continue the loop, false to stop
    async fn process_event_route(
        &self,
        route: EventRoute,
        reconnect_attempts: &mut u32,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                *reconnect_attempts = 0;
                self.offline_backlog.store(0, Ordering::SeqCst);
                self.transition(ConnectionEvent::ConnAckReceived);
                self.resubscribe();
                true
            }
            EventRoute::MessageReceived(message) => {
                metrics().record_mqtt_message_received();
                self.dispatcher.dispatch(message);
                true
            }
            EventRoute::Disconnected(reason) => {
                if self.intentional_disconnect.load(Ordering::SeqCst) {
                    return false;
                }
                self.transition(ConnectionEvent::DisconnectedByBroker(reason));
                self.reconnect(reconnect_attempts, shutdown_rx).await
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                return_codes,
            } => {
                let rejected = MessageHandler::rejected_return_codes(&return_codes);
                if rejected.is_empty() {
                    debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
                } else {
                    warn!(packet_id, codes = ?rejected, "Broker refused subscription");
                }
                true
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn handle_event_loop_error(
        &self,
        error: rumqttc::v5::ConnectionError,
        reconnect_attempts: &mut u32,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> bool {
        if self.intentional_disconnect.load(Ordering::SeqCst) || *shutdown_rx.borrow() {
            return false;
        }

        self.transition(ConnectionEvent::NetworkError(error.to_string()));
        self.reconnect(reconnect_attempts, shutdown_rx).await
    }

    async fn reconnect(
        &self,
        reconnect_attempts: &mut u32,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            *reconnect_attempts,
            &self.reconnect_config,
            *shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                *reconnect_attempts = attempt;
                self.transition(ConnectionEvent::ReconnectionStarted(attempt));

                let max_display = self
                    .reconnect_config
                    .max_attempts
                    .map_or("unlimited".to_string(), |max| max.to_string());
                info!(
                    attempt,
                    max_attempts = %max_display,
                    delay_ms,
                    "Reconnecting to MQTT broker after delay"
                );

                // The event loop reconnects on its next poll
                MqttClient::interruptible_sleep(shutdown_rx.clone(), delay_ms).await
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let max_attempts = self
                    .reconnect_config
                    .max_attempts
                    .unwrap_or(*reconnect_attempts);
                let reason = format!("Max reconnection attempts ({max_attempts}) exceeded");
                self.transition(ConnectionEvent::PermanentFailure(reason));
                false
            }
        }
    }

    fn resubscribe(&self) {
        for (filter, qos) in self.subscriptions.snapshot() {
            // try_subscribe: awaiting here would block the loop that drains the request channel
            match self.client.try_subscribe(filter.clone(), qos) {
                Ok(()) => debug!(target: "mqtt_transport", filter = %filter, "Re-subscribed"),
                Err(e) => error!(filter = %filter, error = %e, "Failed to re-subscribe"),
            }
        }
    }

    /// Give a queued DISCONNECT a chance to reach the broker
    async fn flush_disconnect(&self, event_loop: &mut EventLoop) {
        let was_connected = matches!(*self.state_tx.borrow(), ConnectionState::Connected);
        if !was_connected || !self.intentional_disconnect.load(Ordering::SeqCst) {
            return;
        }
        let _ = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
            while event_loop.poll().await.is_ok() {}
        })
        .await;
    }
}

/// Move to the next state and emit a status event when the change is visible
fn apply_transition(
    state_tx: &watch::Sender<ConnectionState>,
    status_tx: &broadcast::Sender<ConnectionStatusChanged>,
    event: ConnectionEvent,
    intentional: bool,
) {
    let mut status = None;
    state_tx.send_if_modified(|state| {
        let next = HealthMonitor::determine_next_state(state, event);
        if *state == next {
            return false;
        }
        HealthMonitor::log_state_transition(state, &next, intentional);
        status = HealthMonitor::status_change(state, &next, intentional);
        *state = next;
        true
    });

    if let Some(status) = status {
        if status.is_connected {
            metrics().record_mqtt_connected();
        } else {
            metrics().record_mqtt_disconnected();
        }
        let _ = status_tx.send(status);
    }
}

/// Implementation of Transport trait for MqttClient
#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Self::Error> {
        MqttClient::publish(self, topic, payload, qos, retain).await
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), Self::Error> {
        MqttClient::subscribe(self, filter, qos).await
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), Self::Error> {
        MqttClient::unsubscribe(self, filter).await
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    fn set_message_sink(&self, sink: Arc<dyn MessageSink>) {
        self.dispatcher.set_sink(sink);
    }

    fn status_events(&self) -> broadcast::Receiver<ConnectionStatusChanged> {
        self.status_tx.subscribe()
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        // Signal shutdown to background tasks if they're still running
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.supervisor.get_mut().take() {
            handle.abort();
        }
    }
}
