use std::sync::Arc;

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use tracing::{info, warn};

use admin_node::api::{create_api_router, ApiState};
use admin_node::broker::BrokerClient;
use admin_node::config::AdminConfig;
use admin_node::health::ClusterValidator;
use admin_node::orchestrator::RestartOrchestrator;
use admin_node::ssh::{CommandRunner, SshExecutor};
use admin_node::status::StatusReporter;
use admin_node::topology::ClusterTopology;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "admin_node=info".into()),
        )
        .with_target(false)
        .with_line_number(true)
        .init();

    info!(
        "Starting rolling-restart admin node v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/admin".to_string());
    let mut config = match AdminConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %config_path, error = %e, "Config file not loaded, using defaults");
            AdminConfig::default()
        }
    };
    config.apply_env_overrides();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("Invalid configuration")?;

    // Load cluster topology
    let mut topology = ClusterTopology::load(&config.cluster.topology_path)
        .with_context(|| format!("Failed to load topology {}", config.cluster.topology_path))?;
    if let Some(defaults) = topology.restart_config.take() {
        config.restart.timeouts.apply_topology_defaults(&defaults);
    }
    info!(
        cluster = %topology.cluster_name,
        nodes = topology.node_count(),
        "Cluster topology loaded"
    );

    let config = Arc::new(config);
    let topology = Arc::new(topology);

    // Wire up clients and the orchestrator
    let runner: Arc<dyn CommandRunner> = Arc::new(SshExecutor::new(config.ssh.clone()));
    let broker = Arc::new(
        BrokerClient::new(
            config.broker.clone(),
            Arc::clone(&topology),
            config.restart.timeouts.api_timeout(),
        )
        .map_err(|e| anyhow::anyhow!(e))?,
    );
    let validator = Arc::new(ClusterValidator::new(
        broker.clone(),
        Arc::clone(&topology),
        config.restart.clone(),
    ));
    let orchestrator = Arc::new(RestartOrchestrator::new(
        broker.clone(),
        Arc::clone(&runner),
        Arc::clone(&validator),
        Arc::clone(&topology),
        config.restart.clone(),
        config.broker.service_name.clone(),
    ));
    let reporter = Arc::new(StatusReporter::new(Arc::clone(&orchestrator)));

    // Metrics
    initialize_metrics();
    if config.metrics.enabled {
        let metrics_addr: std::net::SocketAddr = config
            .metrics
            .listen_addr
            .parse()
            .context("Invalid metrics listen address")?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(metrics_addr = %config.metrics.listen_addr, "Prometheus metrics server started");
    }

    let state = ApiState {
        config: Arc::clone(&config),
        topology: Arc::clone(&topology),
        broker,
        runner: Arc::clone(&runner),
        orchestrator,
        validator,
        reporter,
    };
    let app = create_api_router(state);

    info!(listen_addr = %config.api.listen_addr, "Starting admin API server");
    let listener = tokio::net::TcpListener::bind(&config.api.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    info!("Shutting down, disposing SSH sessions");
    runner.dispose_all().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
}

/// Initialize metrics descriptions
fn initialize_metrics() {
    describe_counter!(
        "rolling_restarts_started_total",
        "Total number of rolling restarts started"
    );
    describe_counter!(
        "rolling_restarts_completed_total",
        "Total number of rolling restarts completed successfully"
    );
    describe_counter!(
        "rolling_restarts_failed_total",
        "Total number of rolling restarts that failed"
    );
    describe_counter!(
        "rolling_restarts_cancelled_total",
        "Total number of rolling restarts cancelled"
    );
    describe_counter!(
        "rolling_restart_nodes_restarted_total",
        "Total number of nodes restarted by rolling restarts"
    );
    describe_gauge!(
        "rolling_restart_active",
        "Whether a rolling restart is currently in progress"
    );
}
