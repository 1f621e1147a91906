//! Outreach engine: multi-step sales sequences with scheduled dispatch,
//! outcome branching and funnel analytics.
//!
//! Main entry point that wires the engine, starts the scheduler loop and
//! serves the dashboard API.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use outreach_api::{ApiServer, AppState};
use outreach_channels::email::EmailConfig;
use outreach_channels::sms::SmsConfig;
use outreach_channels::social::SocialConfig;
use outreach_channels::{AdapterRegistry, EmailAdapter, SmsAdapter, SocialAdapter};
use outreach_core::config::AppConfig;
use outreach_core::directory::InMemoryDirectory;
use outreach_core::event_bus::TracingSink;
use outreach_core::types::Prospect;
use outreach_sequences::{EngineStores, SequenceEngine};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "outreach-engine")]
#[command(about = "Sequence execution and analytics engine for sales outreach")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "OUTREACH__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "OUTREACH__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Prometheus exporter port (overrides config)
    #[arg(long, env = "OUTREACH__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// TOML config file
    #[arg(long, short = 'c', env = "OUTREACH_CONFIG")]
    config: Option<String>,

    /// JSON array of prospects to load into the directory
    #[arg(long, env = "OUTREACH_PROSPECTS")]
    prospects: Option<String>,

    /// Load the sample sequences on startup
    #[arg(long, default_value_t = false)]
    seed_demo: bool,
}

fn load_prospects(path: &str) -> anyhow::Result<Vec<Prospect>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading prospects from {}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing prospects in {}", path))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "outreach_engine=info,outreach_sequences=info,tower_http=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Outreach engine starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        poll_interval_ms = config.scheduler.poll_interval_ms,
        max_concurrent_dispatches = config.scheduler.max_concurrent_dispatches,
        "Configuration loaded"
    );

    let directory = Arc::new(InMemoryDirectory::new());
    if let Some(path) = cli.prospects.as_deref() {
        let prospects = load_prospects(path)?;
        info!(count = prospects.len(), path, "Prospects loaded");
        for prospect in prospects {
            directory.upsert(prospect);
        }
    }

    let email = Arc::new(EmailAdapter::new(EmailConfig {
        from_name: config.dispatch.sender_name.clone(),
        ..EmailConfig::default()
    }));
    let adapters = AdapterRegistry::new()
        .with_adapter(email.clone())
        .with_adapter(Arc::new(SmsAdapter::new(SmsConfig::default())))
        .with_adapter(Arc::new(SocialAdapter::new(SocialConfig::default())));

    let engine = SequenceEngine::new(
        &config,
        EngineStores::in_memory(),
        directory,
        adapters,
        Arc::new(TracingSink::new(config.node_id.clone())),
    );

    if cli.seed_demo {
        let seeded = engine.seed_demo_sequences()?;
        info!(count = seeded.len(), "Demo sequences loaded");
    }

    let state = AppState::new(engine.clone(), email, config.node_id.clone());
    let api_server = ApiServer::new(config.clone(), state.clone());

    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = engine.spawn_scheduler(shutdown_rx);
    state.mark_ready();

    info!("Outreach engine is ready to serve traffic");

    // Blocks until ctrl-c.
    let served = api_server.start_http(shutdown_signal()).await;

    info!("Shutting down scheduler");
    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler.await {
        error!(error = %e, "Scheduler task ended abnormally");
    }

    served
}
