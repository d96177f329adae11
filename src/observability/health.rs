//! Health and metrics HTTP endpoints
//!
//! | Route      | Meaning                                                   |
//! |------------|-----------------------------------------------------------|
//! | `/health`  | aggregated checks, 503 unless every check is healthy      |
//! | `/ready`   | broker connection, 503 while disconnected                 |
//! | `/live`    | process is up                                             |
//! | `/metrics` | [`MetricsSnapshot`](super::MetricsSnapshot) as JSON       |
//! | `/`        | endpoint index                                            |

use crate::observability::metrics::{current_timestamp, metrics};
use crate::pipeline::QueueConsumer;
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// Seconds without a processed message before processing is reported stale
const PROCESSING_STALENESS_THRESHOLD_SECONDS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Healthy,
    Stale,
    Saturated,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: CheckStatus,
    pub message: String,
}

impl HealthCheck {
    fn new(status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub instance_id: String,
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub checks: BTreeMap<&'static str, HealthCheck>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// HTTP health endpoint state for one node or gateway
pub struct HealthServer {
    instance_id: String,
    port: u16,
    mqtt_connected: AtomicBool,
    queue: OnceCell<QueueConsumer>,
}

impl HealthServer {
    pub fn new(instance_id: String, port: u16) -> Self {
        Self {
            instance_id,
            port,
            mqtt_connected: AtomicBool::new(false),
            queue: OnceCell::new(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.mqtt_connected.load(Ordering::Relaxed)
    }

    /// Report depth of `queue` under `/health`; only the first call takes effect
    pub fn watch_queue(&self, queue: QueueConsumer) {
        let _ = self.queue.set(queue);
    }

    /// Evaluate every check at `now` (seconds since the epoch)
    pub fn report(&self, now: u64) -> HealthReport {
        let mut checks = BTreeMap::new();
        checks.insert("mqtt", mqtt_check(self.is_ready()));
        checks.insert(
            "message_processing",
            processing_check(metrics().last_message_processed(), now),
        );
        if let Some(queue) = self.queue.get() {
            checks.insert("queue", queue_check(queue.name(), queue.len(), queue.capacity()));
        }

        let healthy = checks
            .values()
            .all(|check| check.status == CheckStatus::Healthy);

        HealthReport {
            status: if healthy { "healthy" } else { "degraded" },
            instance_id: self.instance_id.clone(),
            timestamp: now,
            uptime_seconds: metrics().snapshot().lifecycle.uptime_seconds,
            checks,
        }
    }

    /// All routes, without binding a socket
    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone + Send + Sync + 'static
    {
        let server = warp::any().map({
            let this = self.clone();
            move || this.clone()
        });

        let health = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and(server.clone())
            .and_then(health_handler);
        let ready = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and(server.clone())
            .and_then(ready_handler);
        let live = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&serde_json::json!({
                    "alive": true,
                    "timestamp": current_timestamp(),
                }))
            });
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().snapshot()));
        let index = warp::path::end()
            .and(warp::get())
            .and(server)
            .map(|server: Arc<HealthServer>| {
                warp::reply::json(&serde_json::json!({
                    "instance_id": server.instance_id,
                    "endpoints": {
                        "/health": "Aggregated health checks",
                        "/ready": "Broker connection readiness",
                        "/live": "Liveness probe",
                        "/metrics": "Pipeline counters",
                    },
                }))
            });

        health.or(ready).or(live).or(metrics_route).or(index)
    }

    /// Serve until `shutdown` is cancelled; fails if the port cannot be bound
    pub async fn start(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let (bound, server) = warp::serve(self.routes())
            .try_bind_with_graceful_shutdown(addr, async move { shutdown.cancelled().await })?;

        tracing::info!(addr = %bound, instance_id = %self.instance_id, "Health server listening");
        server.await;
        tracing::info!("Health server stopped");
        Ok(())
    }
}

async fn health_handler(server: Arc<HealthServer>) -> Result<impl Reply, Infallible> {
    let report = server.report(current_timestamp());
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(warp::reply::with_status(warp::reply::json(&report), status))
}

async fn ready_handler(server: Arc<HealthServer>) -> Result<impl Reply, Infallible> {
    let ready = server.is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&serde_json::json!({
            "ready": ready,
            "timestamp": current_timestamp(),
        })),
        status,
    ))
}

fn mqtt_check(connected: bool) -> HealthCheck {
    if connected {
        HealthCheck::new(CheckStatus::Healthy, "Broker connection established")
    } else {
        HealthCheck::new(CheckStatus::Unhealthy, "Not connected to broker")
    }
}

fn processing_check(last_processed: u64, now: u64) -> HealthCheck {
    if last_processed == 0 {
        return HealthCheck::new(CheckStatus::Healthy, "No messages processed yet");
    }
    let idle = now.saturating_sub(last_processed);
    if idle > PROCESSING_STALENESS_THRESHOLD_SECONDS {
        HealthCheck::new(
            CheckStatus::Stale,
            format!("No message activity for {idle} seconds"),
        )
    } else {
        HealthCheck::new(CheckStatus::Healthy, "Recent message activity")
    }
}

fn queue_check(name: &str, depth: usize, capacity: Option<usize>) -> HealthCheck {
    match capacity {
        Some(capacity) if depth >= capacity => HealthCheck::new(
            CheckStatus::Saturated,
            format!("Queue '{name}' full ({depth}/{capacity}), producers are deferring"),
        ),
        Some(capacity) => HealthCheck::new(
            CheckStatus::Healthy,
            format!("Queue '{name}' at {depth}/{capacity}"),
        ),
        None => HealthCheck::new(CheckStatus::Healthy, format!("Queue '{name}' at {depth}")),
    }
}
