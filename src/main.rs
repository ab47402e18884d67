//! dockyard - Main entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use dockyard::{
    config::{Config, StateBackend},
    engine::{ContainerEngine, DockerEngine, connect_docker},
    index::{InMemoryRecordStore, JsonFileRecordStore, OwnershipIndex, RecordStore},
    orchestrator::{AppState, DashboardApi, LifecycleOrchestrator},
    payload::PayloadStore,
    reconciler::{ReconcileTrigger, Reconciler},
    status::StatusReporter,
};

#[derive(Parser, Debug)]
#[command(name = "dockyard")]
#[command(about = "Per-user nginx containers on a shared Docker host")]
#[command(version)]
struct Args {
    /// Keep container records in memory only (lost on restart)
    #[arg(long)]
    memory: bool,

    /// Disable the background reconciler
    #[arg(long)]
    no_reconcile: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dockyard=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    tracing::info!("Starting dockyard...");

    let mut config = Config::from_env()?;
    if args.memory {
        config.storage.backend = StateBackend::Memory;
    }
    if args.no_reconcile {
        config.reconciler.enabled = false;
    }

    // Docker daemon
    let docker = connect_docker(
        config.engine.docker_host.as_deref(),
        config.engine.timeout(),
        config.engine.timeout() + config.engine.stop_grace(),
    )
    .await?;
    let engine: Arc<dyn ContainerEngine> = Arc::new(DockerEngine::new(docker, config.engine.timeout()));
    tracing::info!(image = %config.engine.image, "Connected to Docker daemon");

    // Record storage
    let store: Arc<dyn RecordStore> = match config.storage.backend {
        StateBackend::File => {
            let store = JsonFileRecordStore::open(config.storage.state_file()).await?;
            tracing::info!("Container records stored in {}", store.path().display());
            Arc::new(store)
        }
        StateBackend::Memory => {
            tracing::warn!("Running with in-memory container records");
            Arc::new(InMemoryRecordStore::new())
        }
    };
    let index = Arc::new(OwnershipIndex::load(store).await?);

    let payloads = PayloadStore::new(config.storage.payload_root());
    tokio::fs::create_dir_all(payloads.root()).await?;

    let trigger = ReconcileTrigger::new();
    let orchestrator = Arc::new(LifecycleOrchestrator::new(
        config.engine.clone(),
        engine.clone(),
        index.clone(),
        payloads.clone(),
        trigger.clone(),
    ));
    let status = Arc::new(StatusReporter::new(
        engine.clone(),
        index.clone(),
        &config.engine,
        config.status.max_age(),
        trigger.clone(),
    ));

    let (reconciler_stop, reconciler_handle) = if config.reconciler.enabled {
        let reconciler = Arc::new(Reconciler::new(
            engine,
            index,
            payloads,
            config.reconciler.clone(),
            config.engine.clone(),
            trigger,
        ));
        let (tx, rx) = tokio::sync::oneshot::channel();
        (Some(tx), Some(reconciler.spawn(rx)))
    } else {
        tracing::warn!("Reconciler disabled; drift will not be repaired");
        (None, None)
    };

    let addr = config.server.bind_addr()?;
    DashboardApi::serve(AppState { orchestrator, status }, addr, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutdown requested");
    })
    .await?;

    if let Some(tx) = reconciler_stop {
        let _ = tx.send(());
    }
    if let Some(handle) = reconciler_handle
        && let Err(e) = handle.await
    {
        tracing::error!("Reconciler task failed: {}", e);
    }

    tracing::info!("dockyard shutdown complete");
    Ok(())
}
