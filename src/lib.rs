//! Benchpilot -- benchmark orchestration engine.
//!
//! Schedules, activates, monitors, and retires independent test run
//! executions, each driving a configurable event-driven workload simulation
//! against a SQLite record store.

pub mod api;
pub mod config;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod model;
pub mod props;
pub mod storage;
pub mod workload;

use anyhow::Result;
use config::Config;
use std::sync::Arc;
use std::time::Duration;

/// Start the benchpilot daemon: API server plus the run lifecycle monitor.
pub async fn serve(config: Config) -> Result<()> {
    // 1. Record store
    tracing::info!(db_path = %config.db_path, "Initializing record store");
    let pool = storage::open_pool(&config.db_path)?;
    let dao = storage::Dao::new(pool.clone());
    let props = props::PropertyStore::new(pool);

    // 2. Lifecycle monitor
    let workload = Arc::new(workload::SimWorkload);
    let monitor = lifecycle::Monitor::new(
        dao.clone(),
        props.clone(),
        workload,
        config.dispatcher_concurrency,
    );
    let monitor_loop = Arc::clone(&monitor);
    let period = Duration::from_millis(config.monitor_period_ms);
    tokio::spawn(async move {
        lifecycle::run_monitor_loop(monitor_loop, period).await;
    });

    // 3. API server
    let addr: std::net::SocketAddr = config.bind.parse()?;
    let app = api::router(api::state::AppState {
        dao,
        props,
        monitor: Arc::clone(&monitor),
    });

    tracing::info!(%addr, "Benchpilot listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    monitor.shutdown().await;
    Ok(())
}
