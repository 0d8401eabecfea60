//! Bulkline - campaign engine entry point

use anyhow::Result;
use bulkline_api::AppState;
use bulkline_common::config::{Config, LoggingConfig};
use bulkline_core::{CampaignManager, DeliveryWorker, HttpTransport, QuotaGate, Scheduler};
use bulkline_storage::{CampaignStore, DatabasePool, MemoryStore, PgStore, QuotaStore};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging);

    info!(instance_id = %config.server.instance_id, "Starting Bulkline campaign engine...");

    // Initialize the campaign store
    let (store, quota_store, db_pool) = open_store(&config).await?;

    // Wire the delivery engine
    let quota = Arc::new(QuotaGate::new(quota_store, config.quota.clone()));
    let transport = Arc::new(HttpTransport::new(config.transport.clone())?);
    let worker = Arc::new(
        DeliveryWorker::new(store.clone(), quota.clone(), transport, config.delivery.clone())
            .with_instance_id(config.server.instance_id.clone()),
    );
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        worker.clone(),
        config.scheduler.clone(),
    ));
    let manager = Arc::new(CampaignManager::new(store, worker));

    // Pick up campaigns missed while the process was down
    let recovered = scheduler.recover_on_startup(Utc::now()).await;
    if !recovered.triggered.is_empty() {
        info!(campaigns = recovered.triggered.len(), "Recovered missed campaigns");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start scheduler
    let scheduler_handle = {
        let scheduler = scheduler.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            scheduler.run(shutdown).await;
        })
    };

    // Start API server if enabled
    let api_handle = if config.api.enabled {
        let state = Arc::new(AppState {
            manager,
            quota,
            db_pool,
        });
        let app = bulkline_api::create_router(state);
        let listener = tokio::net::TcpListener::bind(&config.api.bind).await?;
        info!("Starting API server on {}", config.api.bind);

        let mut shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = result {
                error!("API server error: {}", e);
            }
        }))
    } else {
        info!("API server disabled");
        None
    };

    info!("Bulkline started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if shutdown_tx.send(true).is_err() {
        warn!("Scheduler already stopped");
    }
    if let Err(e) = scheduler_handle.await {
        error!("Scheduler task failed: {}", e);
    }
    if let Some(handle) = api_handle {
        if let Err(e) = handle.await {
            error!("API server task failed: {}", e);
        }
    }

    info!("Bulkline shutdown complete");

    Ok(())
}

type Stores = (
    Arc<dyn CampaignStore>,
    Arc<dyn QuotaStore>,
    Option<DatabasePool>,
);

async fn open_store(config: &Config) -> Result<Stores> {
    match config.database.backend.as_str() {
        "postgres" => {
            let db_pool = DatabasePool::new(&config.database).await?;
            db_pool.migrate().await?;

            let store = Arc::new(PgStore::new(db_pool.clone()));
            let campaigns: Arc<dyn CampaignStore> = store.clone();
            let quotas: Arc<dyn QuotaStore> = store;
            Ok((campaigns, quotas, Some(db_pool)))
        }
        "memory" => {
            warn!("Using the in-memory store; campaigns are lost on restart");
            let store = Arc::new(MemoryStore::new());
            let campaigns: Arc<dyn CampaignStore> = store.clone();
            let quotas: Arc<dyn QuotaStore> = store;
            Ok((campaigns, quotas, None))
        }
        other => anyhow::bail!("Unsupported database backend: {}", other),
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
