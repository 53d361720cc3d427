//! The Phoenix server binary.
//!
//! Exit codes: 0 on normal shutdown, 1 on unrecoverable startup failure
//! (store connect, bind), 2 on misconfiguration.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use phoenix::api::{self, ApiState};
use phoenix::bus::EventBus;
use phoenix::config::{Config, LogFormat, ServerConfig, StoreBackend};
use phoenix::dispatch::AgentDispatcher;
use phoenix::experiment::{
    ConfigRenderer, ExperimentEngine, MetricSource, NullMetricSource, PrometheusSource,
    TemplateDirRenderer,
};
use phoenix::hub::RealtimeHub;
use phoenix::queue::{HostSignals, TaskQueue, spawn_reaper};
use phoenix::store::{MemoryStore, PgStore, Store};

#[derive(Debug, Parser)]
#[command(name = "phoenix", version, about = "Observability pipeline experiment control plane")]
struct Cli {
    /// Listen address (overrides PHOENIX_LISTEN).
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("phoenix: configuration error: {e}");
            std::process::exit(2);
        }
    };
    init_tracing(&config.server);

    if let Err(e) = run(cli, config).await {
        tracing::error!(error = %e, "Startup failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = match config.database.backend {
        StoreBackend::Postgres => {
            let store = PgStore::new(&config.database)
                .await
                .context("connecting to PostgreSQL")?;
            store.run_migrations().await.context("running migrations")?;
            Arc::new(store)
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the ephemeral in-memory store; state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let bus = Arc::new(EventBus::default());
    let signals = Arc::new(HostSignals::new());
    let queue = Arc::new(TaskQueue::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&signals),
        &config.queue,
    ));
    let dispatcher = Arc::new(AgentDispatcher::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&bus),
        Arc::clone(&signals),
        config.dispatch.clone(),
    ));

    let renderer: Arc<dyn ConfigRenderer> =
        Arc::new(TemplateDirRenderer::new(&config.engine.template_dir));
    let metrics: Arc<dyn MetricSource> = match &config.metrics.base_url {
        Some(url) => Arc::new(PrometheusSource::new(url.clone())),
        None => {
            tracing::warn!("METRICS_URL not set; analyses will report insufficient data");
            Arc::new(NullMetricSource)
        }
    };
    let engine = Arc::new(ExperimentEngine::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&bus),
        renderer,
        Arc::clone(&metrics),
        config.engine.clone(),
        &config.analyzer,
        config.metrics.push_endpoint.clone(),
    ));
    let hub = Arc::new(RealtimeHub::new(Arc::clone(&bus), config.hub.clone()));

    let recovered = engine.recover().await.context("recovering experiments")?;
    if recovered > 0 {
        tracing::info!(recovered, "Re-attached monitors to live experiments");
    }
    let _reaper = spawn_reaper(Arc::clone(&queue), config.queue.reaper_interval);

    let state = Arc::new(ApiState {
        engine,
        dispatcher,
        queue,
        hub,
        store,
        metrics,
        agent_token: config.server.agent_token.clone(),
    });

    let listen = cli.listen.unwrap_or(config.server.listen);
    api::start(listen, state, shutdown_signal())
        .await
        .context("serving the API")?;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install the shutdown handler");
        return;
    }
    tracing::info!("Shutdown signal received");
}

fn init_tracing(server: &ServerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("phoenix=info,warn"));
    match server.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}
