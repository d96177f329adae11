//! Service wiring for the two deployable roles
//!
//! - [`NodeService`] - device readings through the consumer pool and sensor processor
//! - [`GatewayService`] - processed results through the forwarder to the upstream server
//!
//! Both follow the same lifecycle: `start()` wires the transport sink and
//! spawns workers before connecting, `shutdown()` closes the queue, lets
//! workers drain for the configured grace (cancelling stragglers) and only
//! then disconnects.

pub mod gateway;
pub mod node;

pub use gateway::GatewayService;
pub use node::NodeService;

use crate::observability::metrics::metrics;
use crate::observability::HealthServer;
use crate::pipeline::{ShutdownReport, TaskRegistry};
use crate::transport::Transport;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

/// Lifecycle states reported through metrics
pub mod state {
    pub const STARTING: &str = "starting";
    pub const RUNNING: &str = "running";
    pub const STOPPING: &str = "stopping";
    pub const STOPPED: &str = "stopped";
}

/// Follow connection status transitions for logging and the health server
pub(crate) fn spawn_status_watcher<T>(
    transport: &Arc<T>,
    health: Option<Arc<HealthServer>>,
    registry: &TaskRegistry,
) where
    T: Transport + 'static,
{
    let mut events = transport.status_events();

    registry.spawn("status-watcher", move |token| async move {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(status) => {
                    if let Some(health) = &health {
                        health.set_mqtt_connected(status.is_connected);
                    }
                    match (status.is_connected, status.reason) {
                        (true, _) => info!("Transport connected"),
                        (false, None) => info!("Transport disconnected"),
                        (false, Some(reason)) => {
                            warn!(reason = %reason, "Transport connection lost")
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Status watcher lagged behind transport events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Serve health endpoints until the registry is cancelled
pub(crate) fn spawn_health_server(health: Arc<HealthServer>, registry: &TaskRegistry) {
    registry.spawn("health-server", move |token| async move {
        let port = health.port();
        if let Err(e) = health.start(token).await {
            error!(port, error = %e, "Health server failed");
        }
    });
}

/// Final teardown step shared by both services
pub(crate) async fn finish_shutdown(
    service: &str,
    report: ShutdownReport,
    support: &TaskRegistry,
) -> ShutdownReport {
    support.cancel_all().await;

    if report.aborted > 0 {
        warn!(
            service,
            drained = report.drained,
            cancelled = report.cancelled,
            aborted = report.aborted,
            "Shutdown aborted workers that did not stop in time"
        );
    } else {
        info!(
            service,
            drained = report.drained,
            cancelled = report.cancelled,
            "Shutdown complete"
        );
    }

    metrics().set_lifecycle_state(state::STOPPED);
    report
}
