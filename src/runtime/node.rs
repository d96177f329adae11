//! Node role: ingest device readings, process, publish alerts and aggregates

use super::{finish_shutdown, spawn_health_server, spawn_status_watcher, state};
use crate::config::{NodeSection, PipelineConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::lifecycle_span;
use crate::observability::metrics::metrics;
use crate::observability::HealthServer;
use crate::pipeline::{
    message_queue, ConsumerPool, QueueCapacity, QueueConsumer, QueueProducer, ShutdownReport,
    StreamProcessor, TaskRegistry,
};
use crate::processing::SensorDataProcessor;
use crate::transport::{QoS, Transport};
use std::sync::Arc;
use tracing::{error, info, Instrument};

pub struct NodeService<T: Transport + 'static> {
    node: NodeSection,
    transport: Arc<T>,
    processor: Arc<SensorDataProcessor<T>>,
    pool: ConsumerPool,
    producer: Arc<QueueProducer>,
    consumer: QueueConsumer,
    workers: TaskRegistry,
    support: TaskRegistry,
    health: Option<Arc<HealthServer>>,
}

impl<T: Transport + 'static> NodeService<T> {
    pub fn new(config: &PipelineConfig, transport: Arc<T>) -> PipelineResult<Self> {
        let node = config.require_node()?.clone();
        let rules = config.processing_table()?;

        let processor = Arc::new(SensorDataProcessor::new(&node, rules, transport.clone())?);
        let (producer, consumer) =
            message_queue("ingest", QueueCapacity::Bounded(node.channel_capacity));
        let pool = ConsumerPool::new(
            vec![processor.clone() as Arc<dyn StreamProcessor>],
            node.processing_parallelism,
        );

        Ok(Self {
            node,
            transport,
            processor,
            pool,
            producer: Arc::new(producer),
            consumer,
            workers: TaskRegistry::new("node-workers"),
            support: TaskRegistry::new("node-support"),
            health: None,
        })
    }

    /// Serve health endpoints for this node once started
    pub fn with_health_server(mut self, health: Arc<HealthServer>) -> Self {
        health.watch_queue(self.consumer.clone());
        self.health = Some(health);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node.node_id
    }

    pub fn processor(&self) -> &Arc<SensorDataProcessor<T>> {
        &self.processor
    }

    pub fn queue(&self) -> &QueueConsumer {
        &self.consumer
    }

    pub fn running_workers(&self) -> usize {
        self.workers.len()
    }

    pub async fn start(&self) -> PipelineResult<()> {
        let span = lifecycle_span!(service = "node", node_id = %self.node.node_id);
        self.start_inner().instrument(span).await
    }

    async fn start_inner(&self) -> PipelineResult<()> {
        info!(
            parallelism = self.pool.parallelism(),
            capacity = self.node.channel_capacity,
            "Starting node"
        );
        metrics().set_lifecycle_state(state::STARTING);

        self.transport.set_message_sink(self.producer.clone());
        spawn_status_watcher(&self.transport, self.health.clone(), &self.support);
        if let Some(health) = &self.health {
            spawn_health_server(health.clone(), &self.support);
        }
        self.pool.spawn(&self.consumer, &self.workers);

        self.transport
            .connect()
            .await
            .map_err(PipelineError::transport)?;

        self.transport
            .subscribe(&self.node.device_data_topic, QoS::AtLeastOnce)
            .await
            .map_err(PipelineError::transport)?;
        info!(filter = %self.node.device_data_topic, "Subscribed to device data");

        if let Some(command_topic) = &self.node.gateway_command_topic {
            self.transport
                .subscribe(command_topic, QoS::AtLeastOnce)
                .await
                .map_err(PipelineError::transport)?;
            info!(filter = %command_topic, "Subscribed to gateway commands");
        }

        metrics().set_lifecycle_state(state::RUNNING);
        info!("Node running");
        Ok(())
    }

    /// Close intake, drain the ingestion queue for the grace period, then disconnect
    pub async fn shutdown(&self) -> ShutdownReport {
        let span = lifecycle_span!(service = "node", node_id = %self.node.node_id);
        async {
            info!(pending = self.consumer.len(), "Shutting down node");
            metrics().set_lifecycle_state(state::STOPPING);

            self.producer.close();
            let report = self.workers.shutdown(self.node.shutdown_grace()).await;

            // Workers may still publish while draining
            if let Err(e) = self.transport.disconnect().await {
                error!(error = %e, "Transport disconnect failed");
            }
            finish_shutdown("node", report, &self.support).await
        }
        .instrument(span)
        .await
    }
}
