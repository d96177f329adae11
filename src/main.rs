//! edge-telemetry - Main Entry Point
//!
//! Runs either role of the pipeline against an MQTT broker:
//! `node` processes device readings, `gateway` forwards processed results
//! upstream. `config` validates (and optionally prints) the configuration.

use clap::{Parser, Subcommand};
use edge_telemetry::config::PipelineConfig;
use edge_telemetry::observability::{init_logging, HealthServer, LoggingSettings};
use edge_telemetry::runtime::{GatewayService, NodeService};
use edge_telemetry::transport::mqtt::MqttClient;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["edge.toml", "config/edge.toml"];

/// Edge-to-cloud telemetry pipeline
#[derive(Parser)]
#[command(name = "edge-telemetry")]
#[command(about = "MQTT sensor ingestion, stream processing and upstream forwarding")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a processing node
    Node,
    /// Run the upstream gateway
    Gateway,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_observability(cli.verbose);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting edge-telemetry");

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Node => run_node(config).await,
        Commands::Gateway => run_gateway(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn init_observability(verbose: u8) {
    init_logging(&LoggingSettings::from_env().with_verbosity(verbose));
}

fn load_configuration(
    config_path: Option<&Path>,
) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(PipelineConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = Path::new(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(PipelineConfig::load_from_file(path)?);
        }
    }

    Err(format!(
        "No configuration file found. Provide one with -c/--config or create {}",
        DEFAULT_CONFIG_PATHS.join(" or ")
    )
    .into())
}

fn build_health_server(config: &PipelineConfig, instance_id: &str) -> Option<Arc<HealthServer>> {
    if !config.health.enabled {
        return None;
    }
    let port = std::env::var("HEALTH_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(config.health.port);
    info!(port, "Health server enabled");
    Some(Arc::new(HealthServer::new(instance_id.to_string(), port)))
}

async fn run_node(config: PipelineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let node = config.require_node()?;
    let transport = Arc::new(MqttClient::new(config.mqtt.clone())?);

    let mut service = NodeService::new(&config, transport.clone())?;
    if let Some(health) = build_health_server(&config, &node.node_id) {
        service = service.with_health_server(health);
    }

    service.start().await?;
    wait_for_shutdown(&transport).await?;
    service.shutdown().await;
    Ok(())
}

async fn run_gateway(config: PipelineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let gateway = config.require_gateway()?;
    let transport = Arc::new(MqttClient::new(config.mqtt.clone())?);

    let mut service = GatewayService::new(&config, transport.clone())?;
    if let Some(health) = build_health_server(&config, &gateway.gateway_id) {
        service = service.with_health_server(health);
    }

    service.start().await?;
    wait_for_shutdown(&transport).await?;
    service.shutdown().await;
    Ok(())
}

/// Block until SIGINT, SIGTERM or the transport gives up reconnecting
async fn wait_for_shutdown(transport: &MqttClient) -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    let terminate = async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        sigterm.recv().await;
        Ok::<(), std::io::Error>(())
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<(), std::io::Error>>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received SIGINT, shutting down gracefully...");
        }
        result = terminate => {
            result?;
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = monitor_connection_health(transport) => {
            warn!("MQTT connection permanently lost, shutting down...");
        }
    }
    Ok(())
}

async fn monitor_connection_health(transport: &MqttClient) {
    loop {
        if transport.is_permanently_disconnected() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
}

fn handle_config_command(
    config: &PipelineConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    let kinds = config.processing_table()?.len();
    info!(
        node = config.node.is_some(),
        gateway = config.gateway.is_some(),
        processing_kinds = kinds,
        "Configuration validation complete"
    );
    Ok(())
}
