use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use rollout_core::{
    load_rollout_config, ConfigError, DeploymentController, DeploymentError, HttpRobotFleet,
    HttpTelemetryService, MonitorSettings, SqliteDeploymentStore, StoreError,
};

pub mod routes;

pub use routes::AppState;

pub type Result<T> = std::result::Result<T, ServeError>;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("controller error: {0}")]
    Deployment(#[from] DeploymentError),
    #[error("http client error: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("invalid bind address: {0}")]
    BindAddress(#[from] std::net::AddrParseError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Canary rollout controller for robot ML fleets", long_about = None)]
pub struct Cli {
    /// Path to rollout.toml
    #[arg(long, default_value = "configs/rollout.toml")]
    pub config: PathBuf,
    /// Override the configured bind address
    #[arg(long)]
    pub bind: Option<String>,
    /// Override the configured port
    #[arg(long)]
    pub port: Option<u16>,
    /// Override the configured deployment database path
    #[arg(long)]
    pub db_path: Option<PathBuf>,
}

pub async fn run(cli: Cli) -> Result<()> {
    init_tracing();

    let config = load_rollout_config(&cli.config)?;

    let db_path = cli
        .db_path
        .unwrap_or_else(|| config.resolve_path(&config.store.db_path));
    let store = SqliteDeploymentStore::builder()
        .path(&db_path)
        .create_if_missing(config.store.create_if_missing)
        .build()?;
    store.initialize()?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.fleet.request_timeout_seconds))
        .build()?;
    let fleet = Arc::new(HttpRobotFleet::new(
        client.clone(),
        &config.fleet.fleet_base_url,
    ));
    let telemetry = Arc::new(HttpTelemetryService::new(
        client,
        &config.fleet.telemetry_base_url,
    ));

    let controller = DeploymentController::new(
        store,
        fleet,
        telemetry,
        MonitorSettings::from(&config.monitoring),
    );
    let resumed = controller.resume_monitoring().await?;
    if resumed > 0 {
        tracing::info!(target: "rolloutd", count = resumed, "resumed monitoring after restart");
    }

    let state = AppState {
        controller,
        started_at: Utc::now(),
    };
    let app = routes::router(
        state,
        config.server.enable_cors,
        Duration::from_secs(config.server.request_timeout_seconds),
    );

    let bind = cli.bind.unwrap_or_else(|| config.server.bind_address.clone());
    let port = cli.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;

    tracing::info!(target: "rolloutd", %addr, db = %db_path.display(), "rollout controller listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!(target: "rolloutd", "shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!(target: "rolloutd", "shutdown signal received");
    }
}
