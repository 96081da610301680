//! coordinatord is the process entry point: wires one `Orchestrator` per
//! store class to a shared Status Store, Lock Manager, Validator, and
//! Topology, serves the Control API (§6), and drains the Event Bus
//! Adapter's inbound commands and outbound events.

use anyhow::Context;
use api::{AppState, DynDriver};
use clap::Parser;
use eventbus::{memory::MemoryBus, BufferedPublisher, Command, EventBus};
use models::{Id, StoreClass};
use orchestrator::Orchestrator;
use status_store::pg::PgStatusStore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use store_driver::memory::MemoryDriver;
use store_driver::StoreDriver;
use topology::{StaticSource, Topology};
use validator::{Validator, ValidatorConfig};

/// Config is the engine's recognized environment (§6): back-end
/// connections, topology source, concurrency and batch bounds, lock TTL,
/// event bus selection, and default rollback policy.
#[derive(Parser, Debug)]
#[command(name = "coordinatord")]
struct Config {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:7878")]
    bind_addr: SocketAddr,

    /// Fixed shard count for the document store class (`topology_source = static`).
    #[arg(long, env = "DOCUMENT_SHARDS", default_value_t = 4)]
    document_shards: u32,

    /// Fixed shard count for the relational store class (`topology_source = static`).
    #[arg(long, env = "RELATIONAL_SHARDS", default_value_t = 4)]
    relational_shards: u32,

    #[arg(long, env = "PER_STORE_CLASS_PARALLELISM", default_value_t = 8)]
    per_store_class_parallelism: usize,

    #[arg(long, env = "BATCH_CONCURRENCY", default_value_t = 16)]
    batch_concurrency: usize,

    #[arg(long, env = "DEFAULT_BATCH", default_value_t = 512)]
    default_batch: usize,

    #[arg(long, env = "MIN_BATCH", default_value_t = 64)]
    min_batch: usize,

    #[arg(long, env = "MAX_BATCH", default_value_t = 8192)]
    max_batch: usize,

    #[arg(long, env = "LOCK_TTL", value_parser = humantime::parse_duration, default_value = "30s")]
    lock_ttl: Duration,

    #[arg(long, env = "LOCK_REAP_INTERVAL", value_parser = humantime::parse_duration, default_value = "10s")]
    lock_reap_interval: Duration,

    #[arg(long, env = "LOCK_REAP_GRACE", value_parser = humantime::parse_duration, default_value = "15s")]
    lock_reap_grace: Duration,

    #[arg(long, env = "EVENT_BUS_DRAIN_INTERVAL", value_parser = humantime::parse_duration, default_value = "2s")]
    event_bus_drain_interval: Duration,

    #[arg(long, env = "COUNT_DELTA_TOLERANCE", default_value_t = 0.01)]
    count_delta_tolerance: f64,

    #[arg(long, env = "VALIDATION_SAMPLE_SIZE", default_value_t = 200)]
    validation_sample_size: usize,

    /// Disambiguates id generation between coordinator processes racing to
    /// take over the same Migration (§6's "coordinator may be restarted").
    #[arg(long, env = "COORDINATOR_SHARD", default_value_t = 1)]
    coordinator_shard: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let config = Config::parse();

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(16)
        .connect(&config.database_url)
        .await
        .context("connecting to the status store database")?;
    let status: Arc<dyn status_store::StatusStore> = Arc::new(PgStatusStore::new(pool));

    let topology = Arc::new(
        Topology::new(Box::new(StaticSource::new([
            (StoreClass::Document, config.document_shards),
            (StoreClass::Relational, config.relational_shards),
        ])))
        .await
        .context("discovering initial topology")?,
    );

    let locks = Arc::new(lockmgr::LockManager::new(status.clone()));
    let validator = Arc::new(Validator::new(ValidatorConfig {
        count_delta_tolerance: config.count_delta_tolerance,
        sample_size: config.validation_sample_size,
    }));

    // Transformer registration is deployment-specific (each payload_ref
    // names a transformer the operator's build registers); none are wired
    // here by default.
    let registry = Arc::new(transform::Registry::new());

    let batch_config = batch_pump::BatchPumpConfig {
        min_batch: config.min_batch,
        max_batch: config.max_batch,
        initial_batch: config.default_batch,
        ..Default::default()
    };

    // Real back-end wiring (the document and relational store protocols) is
    // out of scope (§1); both store classes run against the in-memory
    // reference `StoreDriver` until a concrete adapter is plugged in here.
    let driver: DynDriver = Arc::new(MemoryDriver::new());

    let mut orchestrators = HashMap::new();
    for store_class in [StoreClass::Document, StoreClass::Relational] {
        let orchestrator = Orchestrator::new(
            driver.clone(),
            status.clone(),
            topology.clone(),
            locks.clone(),
            validator.clone(),
            registry.clone(),
            batch_config,
            config.per_store_class_parallelism,
            config.batch_concurrency,
            config.coordinator_shard,
        );
        orchestrators.insert(store_class, Arc::new(orchestrator));
    }

    let state = Arc::new(AppState {
        orchestrators,
        status: status.clone(),
    });

    let bus = Arc::new(MemoryBus::new());
    let publisher = Arc::new(BufferedPublisher::new(BusHandle(bus.clone())));

    let shutdown = shutdown_signal();
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    tokio::spawn({
        let locks = locks.clone();
        let mut rx = shutdown_tx.subscribe();
        async move {
            locks
                .reap_loop(config.lock_reap_interval, config.lock_reap_grace, async move {
                    rx.recv().await.ok();
                })
                .await;
        }
    });

    tokio::spawn({
        let publisher = publisher.clone();
        let mut rx = shutdown_tx.subscribe();
        async move {
            publisher
                .drain_loop(config.event_bus_drain_interval, async move {
                    rx.recv().await.ok();
                })
                .await;
        }
    });

    tokio::spawn({
        let state = state.clone();
        let bus = bus.clone();
        let mut rx = shutdown_tx.subscribe();
        async move {
            command_loop(state, bus, &mut rx).await;
        }
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .context("binding control API listener")?;
    tracing::info!(addr = %config.bind_addr, "coordinatord listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            let _ = shutdown_tx.send(());
        })
        .await
        .context("control API server")?;

    Ok(())
}

/// BusHandle adapts `Arc<MemoryBus>` to the `EventBus` trait so it can be
/// cloned freely into background tasks while sharing one bus instance.
struct BusHandle(Arc<MemoryBus>);

#[async_trait::async_trait]
impl EventBus for BusHandle {
    async fn publish(&self, event: &models::Event) -> anyhow::Result<()> {
        self.0.publish(event).await
    }
    async fn recv_command(&self) -> anyhow::Result<Option<Command>> {
        self.0.recv_command().await
    }
}

/// Polls inbound `migration.request` / `migration.cancel` commands (§4.9)
/// and dispatches them against the matching store class's Orchestrator.
async fn command_loop(
    state: Arc<AppState>,
    bus: Arc<MemoryBus>,
    shutdown: &mut tokio::sync::broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                while let Ok(Some(command)) = bus.recv_command().await {
                    handle_command(&state, command).await;
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}

async fn handle_command(state: &Arc<AppState>, command: Command) {
    match command {
        Command::Request { request } => {
            let Some(orchestrator) = state.orchestrators.get(&request.store_class) else {
                tracing::warn!(store_class = %request.store_class, "no orchestrator for requested store class");
                return;
            };
            match orchestrator.create_migration(request).await {
                Ok(migration_id) => {
                    if let Err(err) = orchestrator.start(migration_id).await {
                        tracing::error!(?err, %migration_id, "migration start failed");
                    }
                }
                Err(err) => tracing::error!(?err, "migration admission failed"),
            }
        }
        Command::Cancel { migration_id } => {
            cancel_migration(state, migration_id).await;
        }
    }
}

async fn cancel_migration(state: &Arc<AppState>, migration_id: Id) {
    let Ok(Some(request)) = state.status.get_request(migration_id).await else {
        tracing::warn!(%migration_id, "cancel requested for unknown migration");
        return;
    };
    if let Some(orchestrator) = state.orchestrators.get(&request.store_class) {
        orchestrator.cancel(migration_id).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
