//! Thread-safe metrics collection system
//!
//! Provides atomic counters and a mutex-protected timing window for tracking
//! ingestion, stream processing, forwarding and MQTT transport statistics.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Number of processing durations kept for the average and percentiles
const PROCESSING_TIME_WINDOW: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Ingestion
    messages_received: AtomicU64,
    messages_enqueued: AtomicU64,
    messages_deferred: AtomicU64,
    messages_rejected: AtomicU64,

    // Processing
    messages_processed: AtomicU64,
    messages_unclaimed: AtomicU64,
    processing_failures: AtomicU64,
    decode_failures: AtomicU64,
    validation_rejections: AtomicU64,
    unconfigured_readings: AtomicU64,
    pass_through_readings: AtomicU64,
    alerts_activated: AtomicU64,
    alerts_cleared: AtomicU64,
    aggregates_published: AtomicU64,
    emission_failures: AtomicU64,
    last_message_processed: AtomicU64,
    processing_times: Mutex<VecDeque<u64>>, // in milliseconds

    // Forwarding
    forwards_delivered: AtomicU64,
    forwards_rejected: AtomicU64,
    forwards_failed: AtomicU64,

    // MQTT
    mqtt_connected: AtomicBool,
    connections_established: AtomicU64,
    connection_losses: AtomicU64,
    mqtt_messages_received: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    offline_publishes_dropped: AtomicU64,
    connection_start_time: AtomicU64,

    // Lifecycle
    lifecycle_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let now = current_timestamp();

        Self {
            messages_received: AtomicU64::new(0),
            messages_enqueued: AtomicU64::new(0),
            messages_deferred: AtomicU64::new(0),
            messages_rejected: AtomicU64::new(0),
            messages_processed: AtomicU64::new(0),
            messages_unclaimed: AtomicU64::new(0),
            processing_failures: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            validation_rejections: AtomicU64::new(0),
            unconfigured_readings: AtomicU64::new(0),
            pass_through_readings: AtomicU64::new(0),
            alerts_activated: AtomicU64::new(0),
            alerts_cleared: AtomicU64::new(0),
            aggregates_published: AtomicU64::new(0),
            emission_failures: AtomicU64::new(0),
            last_message_processed: AtomicU64::new(0),
            processing_times: Mutex::new(VecDeque::with_capacity(PROCESSING_TIME_WINDOW)),
            forwards_delivered: AtomicU64::new(0),
            forwards_rejected: AtomicU64::new(0),
            forwards_failed: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            connections_established: AtomicU64::new(0),
            connection_losses: AtomicU64::new(0),
            mqtt_messages_received: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            offline_publishes_dropped: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            lifecycle_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(now),
            state_transitions: AtomicU64::new(0),
        }
    }

    // Ingestion metrics
    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_enqueued(&self) {
        self.messages_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue was full and the message is waiting for space
    pub fn record_message_deferred(&self) {
        self.messages_deferred.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue was closed and the message was discarded
    pub fn record_message_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    // Processing metrics
    pub fn record_message_processed(&self, duration: Duration) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.last_message_processed
            .store(current_timestamp(), Ordering::Relaxed);
        self.record_processing_time(duration);
    }

    pub fn record_processing_failure(&self, duration: Duration) {
        self.processing_failures.fetch_add(1, Ordering::Relaxed);
        self.last_message_processed
            .store(current_timestamp(), Ordering::Relaxed);
        self.record_processing_time(duration);
    }

    pub fn record_message_unclaimed(&self) {
        self.messages_unclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_rejection(&self) {
        self.validation_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unconfigured_reading(&self) {
        self.unconfigured_readings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pass_through(&self) {
        self.pass_through_readings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert_activated(&self) {
        self.alerts_activated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert_cleared(&self) {
        self.alerts_cleared.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aggregate_published(&self) {
        self.aggregates_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emission_failure(&self) {
        self.emission_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Unix seconds of the last processed message, 0 if none yet
    pub fn last_message_processed(&self) -> u64 {
        self.last_message_processed.load(Ordering::Relaxed)
    }

    fn record_processing_time(&self, duration: Duration) {
        if let Ok(mut times) = self.processing_times.lock() {
            if times.len() == PROCESSING_TIME_WINDOW {
                times.pop_front();
            }
            times.push_back(duration.as_millis() as u64);
        }
    }

    // Forwarding metrics
    pub fn record_forward_delivered(&self) {
        self.forwards_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forward_rejected(&self) {
        self.forwards_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forward_failed(&self) {
        self.forwards_failed.fetch_add(1, Ordering::Relaxed);
    }

    // MQTT metrics
    pub fn record_mqtt_connected(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    /// Only a drop from the connected state counts as a loss
    pub fn record_mqtt_disconnected(&self) {
        if self.mqtt_connected.swap(false, Ordering::Relaxed) {
            self.connection_losses.fetch_add(1, Ordering::Relaxed);
        }
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn record_mqtt_message_received(&self) {
        self.mqtt_messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mqtt_publish(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mqtt_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_offline_publish_dropped(&self) {
        self.offline_publishes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn set_lifecycle_state(&self, state: &str) {
        if let Ok(mut current_state) = self.lifecycle_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.messages_received,
            &self.messages_enqueued,
            &self.messages_deferred,
            &self.messages_rejected,
            &self.messages_processed,
            &self.messages_unclaimed,
            &self.processing_failures,
            &self.decode_failures,
            &self.validation_rejections,
            &self.unconfigured_readings,
            &self.pass_through_readings,
            &self.alerts_activated,
            &self.alerts_cleared,
            &self.aggregates_published,
            &self.emission_failures,
            &self.last_message_processed,
            &self.forwards_delivered,
            &self.forwards_rejected,
            &self.forwards_failed,
            &self.connections_established,
            &self.connection_losses,
            &self.mqtt_messages_received,
            &self.messages_published,
            &self.publish_failures,
            &self.offline_publishes_dropped,
            &self.connection_start_time,
            &self.state_transitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);

        if let Ok(mut times) = self.processing_times.lock() {
            times.clear();
        }
        if let Ok(mut state) = self.lifecycle_state.lock() {
            *state = "initializing".to_string();
        }
    }

    /// Calculate processing time statistics (pure function)
    fn calculate_processing_time_statistics(&self) -> (f64, f64, f64) {
        let Ok(times) = self.processing_times.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        let mut sorted_times: Vec<u64> = times.iter().copied().collect();
        sorted_times.sort_unstable();

        let avg = sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64;
        (
            avg,
            percentile(&sorted_times, 50.0),
            percentile(&sorted_times, 95.0),
        )
    }

    fn connection_duration(&self, now: u64) -> u64 {
        if !self.mqtt_connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        if start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        }
    }

    fn current_lifecycle_state(&self) -> String {
        self.lifecycle_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Get complete metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let (avg_processing_time_ms, p50, p95) = self.calculate_processing_time_statistics();

        MetricsSnapshot {
            ingestion: IngestionMetrics {
                received: load(&self.messages_received),
                enqueued: load(&self.messages_enqueued),
                deferred: load(&self.messages_deferred),
                rejected: load(&self.messages_rejected),
            },
            processing: ProcessingMetrics {
                processed: load(&self.messages_processed),
                unclaimed: load(&self.messages_unclaimed),
                failures: load(&self.processing_failures),
                decode_failures: load(&self.decode_failures),
                validation_rejections: load(&self.validation_rejections),
                unconfigured_readings: load(&self.unconfigured_readings),
                pass_through_readings: load(&self.pass_through_readings),
                alerts_activated: load(&self.alerts_activated),
                alerts_cleared: load(&self.alerts_cleared),
                aggregates_published: load(&self.aggregates_published),
                emission_failures: load(&self.emission_failures),
                avg_processing_time_ms,
                processing_time_p50_ms: p50,
                processing_time_p95_ms: p95,
                last_message_processed: load(&self.last_message_processed),
            },
            forwarding: ForwardingMetrics {
                delivered: load(&self.forwards_delivered),
                rejected: load(&self.forwards_rejected),
                failed: load(&self.forwards_failed),
            },
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connections_established: load(&self.connections_established),
                connection_losses: load(&self.connection_losses),
                messages_received: load(&self.mqtt_messages_received),
                messages_published: load(&self.messages_published),
                publish_failures: load(&self.publish_failures),
                offline_publishes_dropped: load(&self.offline_publishes_dropped),
                connection_duration_seconds: self.connection_duration(now),
            },
            lifecycle: LifecycleMetrics {
                current_state: self.current_lifecycle_state(),
                uptime_seconds: now.saturating_sub(load(&self.uptime_start)),
                state_transitions: load(&self.state_transitions),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub ingestion: IngestionMetrics,
    pub processing: ProcessingMetrics,
    pub forwarding: ForwardingMetrics,
    pub mqtt: MqttMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionMetrics {
    pub received: u64,
    pub enqueued: u64,
    pub deferred: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingMetrics {
    pub processed: u64,
    pub unclaimed: u64,
    pub failures: u64,
    pub decode_failures: u64,
    pub validation_rejections: u64,
    pub unconfigured_readings: u64,
    pub pass_through_readings: u64,
    pub alerts_activated: u64,
    pub alerts_cleared: u64,
    pub aggregates_published: u64,
    pub emission_failures: u64,
    pub avg_processing_time_ms: f64,
    pub processing_time_p50_ms: f64,
    pub processing_time_p95_ms: f64,
    pub last_message_processed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForwardingMetrics {
    pub delivered: u64,
    pub rejected: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connections_established: u64,
    pub connection_losses: u64,
    pub messages_received: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub offline_publishes_dropped: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
}

// Helper functions
pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
