//! Pure health monitoring and reconnection logic for MQTT client
//!
//! This module contains pure functions for reconnection decision making,
//! connection state transitions, status-event derivation and the offline
//! publish policy.

use super::connection::{ConnectionState, ReconnectConfig};
use crate::transport::ConnectionStatusChanged;
use std::time::Duration;
use tracing::{error, info, warn};

/// Extra time allowed for the first ConnAck on top of one retry cycle
const CONNECT_GRACE: Duration = Duration::from_secs(10);

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine if reconnection should be attempted (pure function)
    /// Supports unlimited retries when max_attempts is None
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        ReconnectionDecision::Proceed {
            attempt: current_attempts + 1,
            delay_ms: config.delay_ms,
        }
    }

    /// How long `connect()` waits for the first ConnAck before returning
    pub fn calculate_connection_timeout(config: &ReconnectConfig) -> Duration {
        Duration::from_millis(config.delay_ms) + CONNECT_GRACE
    }

    /// Determine next state after connection event (pure function)
    pub fn determine_next_state(
        current_state: &ConnectionState,
        event: ConnectionEvent,
    ) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker(reason) => {
                ConnectionState::Disconnected(format!("Broker disconnected: {reason}"))
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ReconnectionStarted(attempt) => {
                // A permanent failure is terminal
                if let ConnectionState::PermanentlyDisconnected(_) = current_state {
                    current_state.clone()
                } else {
                    ConnectionState::Reconnecting(attempt)
                }
            }
            ConnectionEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
            ConnectionEvent::ClientDisconnected => {
                ConnectionState::Disconnected("Client disconnected".to_string())
            }
        }
    }

    /// Status event for a state change, if the change is externally visible
    ///
    /// Connects and losses of an established connection are always reported.
    /// Failures while still connecting are reported once for the initial
    /// attempt and once when retries are exhausted. Intentional disconnects
    /// carry no reason.
    pub fn status_change(
        from: &ConnectionState,
        to: &ConnectionState,
        intentional: bool,
    ) -> Option<ConnectionStatusChanged> {
        let disconnected = |reason: &str| ConnectionStatusChanged {
            is_connected: false,
            reason: (!intentional).then(|| reason.to_string()),
        };

        match (from, to) {
            (ConnectionState::Connected, ConnectionState::Connected) => None,
            (_, ConnectionState::Connected) => Some(ConnectionStatusChanged {
                is_connected: true,
                reason: None,
            }),
            (ConnectionState::Connected, ConnectionState::Disconnected(reason))
            | (ConnectionState::Connecting, ConnectionState::Disconnected(reason)) => {
                Some(disconnected(reason))
            }
            (ConnectionState::PermanentlyDisconnected(_), _) => None,
            (_, ConnectionState::PermanentlyDisconnected(reason)) => Some(disconnected(reason)),
            _ => None,
        }
    }

    /// Check if connection state allows sending immediately (pure function)
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Decide how a publish is handled given connectivity and offline backlog
    pub fn publish_decision(
        state: &ConnectionState,
        offline_backlog: usize,
        backlog_limit: usize,
    ) -> PublishDecision {
        if Self::can_publish(state) {
            PublishDecision::Send
        } else if offline_backlog >= backlog_limit {
            PublishDecision::Drop
        } else {
            PublishDecision::QueueOffline
        }
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState, intentional: bool) {
        match (from, to) {
            (ConnectionState::Reconnecting(_), ConnectionState::Connected) => {
                info!("MQTT reconnection successful");
            }
            (_, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (_, ConnectionState::Disconnected(reason)) if intentional => {
                info!(reason = %reason, "MQTT client disconnected");
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Disconnected(reason)) => {
                warn!(attempt = *attempt, reason = %reason, "MQTT reconnection attempt failed");
            }
            (_, ConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "MQTT connection lost");
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!(attempt, "Starting MQTT reconnection attempt");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!(reason = %reason, "MQTT connection permanently failed");
            }
            _ => {
                info!("MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// How a publish request is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishDecision {
    /// Connected: hand to the client and wait for it to be accepted
    Send,
    /// Offline with room in the backlog: queue without waiting
    QueueOffline,
    /// Offline backlog full: log and drop
    Drop,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// ConnAck received from broker
    ConnAckReceived,
    /// Broker initiated disconnect
    DisconnectedByBroker(String),
    /// Network or protocol error
    NetworkError(String),
    /// Reconnection attempt started
    ReconnectionStarted(u32),
    /// Permanent failure - no more retries
    PermanentFailure(String),
    /// `disconnect()` called by the owner
    ClientDisconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(delay_ms: u64, max_attempts: Option<u32>) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts,
            delay_ms,
        }
    }

    #[test]
    fn test_should_attempt_reconnection_uses_fixed_delay() {
        let config = fixed(5_000, None);

        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 5_000
            }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(41, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 42,
                delay_ms: 5_000
            }
        );
    }

    #[test]
    fn test_reconnection_aborts() {
        let limited = fixed(100, Some(3));

        assert_eq!(
            HealthMonitor::should_attempt_reconnection(3, &limited, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &limited, true),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_connection_timeout_covers_one_retry() {
        let timeout = HealthMonitor::calculate_connection_timeout(&fixed(5_000, None));
        assert_eq!(timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_determine_next_state() {
        let connected = ConnectionState::Connected;

        assert_eq!(
            HealthMonitor::determine_next_state(
                &ConnectionState::Connecting,
                ConnectionEvent::ConnAckReceived
            ),
            ConnectionState::Connected
        );
        assert_eq!(
            HealthMonitor::determine_next_state(
                &connected,
                ConnectionEvent::NetworkError("timeout".to_string())
            ),
            ConnectionState::Disconnected("timeout".to_string())
        );
        assert_eq!(
            HealthMonitor::determine_next_state(&connected, ConnectionEvent::ClientDisconnected),
            ConnectionState::Disconnected("Client disconnected".to_string())
        );
        assert_eq!(
            HealthMonitor::determine_next_state(
                &ConnectionState::Disconnected("x".to_string()),
                ConnectionEvent::ReconnectionStarted(2)
            ),
            ConnectionState::Reconnecting(2)
        );
    }

    #[test]
    fn test_permanent_failure_is_terminal() {
        let failed = ConnectionState::PermanentlyDisconnected("max attempts".to_string());

        let next =
            HealthMonitor::determine_next_state(&failed, ConnectionEvent::ReconnectionStarted(9));

        assert_eq!(next, failed);
    }

    #[test]
    fn test_status_change_on_connect_and_loss() {
        let up = HealthMonitor::status_change(
            &ConnectionState::Reconnecting(1),
            &ConnectionState::Connected,
            false,
        )
        .unwrap();
        assert!(up.is_connected);
        assert!(up.reason.is_none());

        let down = HealthMonitor::status_change(
            &ConnectionState::Connected,
            &ConnectionState::Disconnected("keep alive timeout".to_string()),
            false,
        )
        .unwrap();
        assert!(!down.is_connected);
        assert_eq!(down.reason.as_deref(), Some("keep alive timeout"));
    }

    #[test]
    fn test_status_change_suppressed_between_retries() {
        let repeated = HealthMonitor::status_change(
            &ConnectionState::Reconnecting(3),
            &ConnectionState::Disconnected("refused".to_string()),
            false,
        );
        assert!(repeated.is_none());

        let retry = HealthMonitor::status_change(
            &ConnectionState::Disconnected("refused".to_string()),
            &ConnectionState::Reconnecting(4),
            false,
        );
        assert!(retry.is_none());
    }

    #[test]
    fn test_status_change_for_initial_failure_and_exhaustion() {
        let initial = HealthMonitor::status_change(
            &ConnectionState::Connecting,
            &ConnectionState::Disconnected("connection refused".to_string()),
            false,
        );
        assert!(initial.is_some_and(|s| !s.is_connected));

        let exhausted = HealthMonitor::status_change(
            &ConnectionState::Reconnecting(5),
            &ConnectionState::PermanentlyDisconnected("max attempts".to_string()),
            false,
        );
        assert_eq!(
            exhausted.and_then(|s| s.reason),
            Some("max attempts".to_string())
        );
    }

    #[test]
    fn test_intentional_disconnect_has_no_reason() {
        let status = HealthMonitor::status_change(
            &ConnectionState::Connected,
            &ConnectionState::Disconnected("Client disconnected".to_string()),
            true,
        )
        .unwrap();

        assert!(!status.is_connected);
        assert!(status.reason.is_none());
    }

    #[test]
    fn test_publish_decision() {
        let offline = ConnectionState::Reconnecting(1);

        assert_eq!(
            HealthMonitor::publish_decision(&ConnectionState::Connected, 5_000, 10),
            PublishDecision::Send
        );
        assert_eq!(
            HealthMonitor::publish_decision(&offline, 9, 10),
            PublishDecision::QueueOffline
        );
        assert_eq!(
            HealthMonitor::publish_decision(&offline, 10, 10),
            PublishDecision::Drop
        );
    }
}
