//! Resi tracking core.
//!
//! Offline-tolerant write path for the warehouse dashboard: UI actions are
//! persisted to a local queue and drained to the hosted backend by a
//! background sync engine. Also hosts the per-courier aggregation used by
//! the dashboard and the cache invalidation that keeps it current.

use anyhow::Context as _;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod actions;
pub mod apply;
pub mod cache;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod feed;
pub mod gateway;
pub mod models;
pub mod optimistic;
pub mod queue;
pub mod storage;
pub mod summary;
pub mod sync;

pub use actions::{ActionError, ResiActions};
pub use cache::{InvalidationCoordinator, QueryCache, QueryKey};
pub use config::AppConfig;
pub use gateway::{GatewayError, RemoteGateway, SupabaseGateway};
pub use models::{Operation, OperationKind, PendingOperation};
pub use queue::{OperationStore, StoreError};
pub use summary::{compute_courier_summaries, CourierSummary, SummaryInputs};
pub use sync::{CycleOutcome, SyncEngineContext, SyncEvent};

// ============================================================================
// Logging
// ============================================================================

/// Console + daily rolling file logging.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,resi_tracker=debug"));

    // Prune old log files before setting up the appender
    diagnostics::prune_old_logs();

    let log_dir = diagnostics::get_log_dir();
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Dropping the guard flushes and stops the writer; it must outlive the process.
    std::mem::forget(guard);
}

// ============================================================================
// Worker entry point
// ============================================================================

/// Run the sync worker until Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    init_logging();
    info!("Starting resi-sync v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = config::data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let db_state = Arc::new(db::init(&data_dir).map_err(anyhow::Error::msg)?);
    let app_config = AppConfig::load(&db_state);
    info!(
        interval_secs = app_config.sync_interval_secs,
        max_retries = app_config.max_retries,
        "Configuration loaded"
    );

    let gateway = SupabaseGateway::from_credentials(Some(app_config.request_timeout()))
        .context("backend credentials are not configured")?;

    let coordinator = InvalidationCoordinator::new(Arc::new(QueryCache::new()));
    let engine = SyncEngineContext::new(
        OperationStore::new(db_state),
        Arc::new(gateway),
        coordinator,
        app_config,
    );

    let mut events = engine.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SyncEvent::OperationDropped { message, .. }) => error!("{message}"),
                Ok(SyncEvent::CycleFinished(_)) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    engine.start();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");

    engine.shutdown().await;
    reporter.abort();
    info!(
        pending = engine.pending_operation_count(),
        "Sync worker stopped"
    );
    Ok(())
}
