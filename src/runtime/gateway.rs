//! Gateway role: forward processed results to the upstream HTTP server

use super::{finish_shutdown, spawn_health_server, spawn_status_watcher, state};
use crate::config::{GatewaySection, PipelineConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::forwarding::Forwarder;
use crate::lifecycle_span;
use crate::observability::metrics::metrics;
use crate::observability::HealthServer;
use crate::pipeline::{
    message_queue, QueueCapacity, QueueConsumer, QueueProducer, ShutdownReport, TaskRegistry,
};
use crate::transport::{QoS, Transport};
use std::sync::Arc;
use tracing::{error, info, Instrument};

pub struct GatewayService<T: Transport + 'static> {
    gateway: GatewaySection,
    transport: Arc<T>,
    forwarder: Arc<Forwarder>,
    producer: Arc<QueueProducer>,
    consumer: QueueConsumer,
    workers: TaskRegistry,
    support: TaskRegistry,
    health: Option<Arc<HealthServer>>,
}

impl<T: Transport + 'static> GatewayService<T> {
    pub fn new(config: &PipelineConfig, transport: Arc<T>) -> PipelineResult<Self> {
        let gateway = config.require_gateway()?.clone();
        let forwarder = Arc::new(Forwarder::new(&gateway)?);
        let (producer, consumer) = message_queue(
            "upstream",
            QueueCapacity::from_setting(gateway.upstream_channel_capacity),
        );

        Ok(Self {
            gateway,
            transport,
            forwarder,
            producer: Arc::new(producer),
            consumer,
            workers: TaskRegistry::new("gateway-workers"),
            support: TaskRegistry::new("gateway-support"),
            health: None,
        })
    }

    pub fn with_health_server(mut self, health: Arc<HealthServer>) -> Self {
        health.watch_queue(self.consumer.clone());
        self.health = Some(health);
        self
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway.gateway_id
    }

    pub fn queue(&self) -> &QueueConsumer {
        &self.consumer
    }

    pub fn is_forwarding(&self) -> bool {
        self.workers.is_running("forwarder")
    }

    pub async fn start(&self) -> PipelineResult<()> {
        let span = lifecycle_span!(service = "gateway", gateway_id = %self.gateway.gateway_id);
        self.start_inner().instrument(span).await
    }

    async fn start_inner(&self) -> PipelineResult<()> {
        info!(endpoint = %self.forwarder.endpoint(), "Starting gateway");
        metrics().set_lifecycle_state(state::STARTING);

        self.transport.set_message_sink(self.producer.clone());
        spawn_status_watcher(&self.transport, self.health.clone(), &self.support);
        if let Some(health) = &self.health {
            spawn_health_server(health.clone(), &self.support);
        }

        let forwarder = self.forwarder.clone();
        let consumer = self.consumer.clone();
        self.workers.spawn("forwarder", move |token| async move {
            forwarder.run(consumer, token).await;
        });

        self.transport
            .connect()
            .await
            .map_err(PipelineError::transport)?;
        self.transport
            .subscribe(&self.gateway.processed_data_topic, QoS::AtLeastOnce)
            .await
            .map_err(PipelineError::transport)?;
        info!(filter = %self.gateway.processed_data_topic, "Subscribed to processed data");

        metrics().set_lifecycle_state(state::RUNNING);
        info!("Gateway running");
        Ok(())
    }

    /// Close intake, let the forwarder drain for the grace period, then disconnect
    pub async fn shutdown(&self) -> ShutdownReport {
        let span = lifecycle_span!(service = "gateway", gateway_id = %self.gateway.gateway_id);
        async {
            info!(pending = self.consumer.len(), "Shutting down gateway");
            metrics().set_lifecycle_state(state::STOPPING);

            self.producer.close();
            let report = self.workers.shutdown(self.gateway.shutdown_grace()).await;

            // Workers may still publish while draining
            if let Err(e) = self.transport.disconnect().await {
                error!(error = %e, "Transport disconnect failed");
            }
            finish_shutdown("gateway", report, &self.support).await
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    fn config() -> PipelineConfig {
        PipelineConfig::from_toml_str(
            r#"
            [mqtt]
            broker_url = "mqtt://localhost:1883"

            [gateway]
            server_base_url = "http://127.0.0.1:9/api/telemetry"
            shutdown_grace_secs = 1
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_requires_gateway_section() {
        let mut config = config();
        config.gateway = None;

        let result = GatewayService::new(&config, Arc::new(MockTransport::new()));

        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_subscribes_processed_topic() {
        // Arrange
        let transport = Arc::new(MockTransport::new());
        let service = GatewayService::new(&config(), transport.clone()).unwrap();

        // Act
        service.start().await.unwrap();

        // Assert
        assert_eq!(
            transport.get_subscriptions().await,
            vec![("nodes/+/+/data/processed".to_string(), QoS::AtLeastOnce)]
        );
        assert!(service.is_forwarding());

        let report = service.shutdown().await;
        assert_eq!(report.aborted, 0);
        assert!(!service.is_forwarding());
    }
}
