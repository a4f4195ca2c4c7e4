//! Standalone sweep daemon.
//!
//! Opens the reward database and resolves expired pending rewards on an
//! interval until interrupted.
//!
//! Environment:
//! - `TRELLIS_DB` - RocksDB path (default `trellis-db`)
//! - `TRELLIS_SWEEP_INTERVAL_SECS` - seconds between runs (default 60)
//! - `RUST_LOG` - log filter

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trellis_model::{MatrixConfig, QualificationSchedule};
use trellis_rewards::StoreDirectory;
use trellis_rollup::{RollupEngine, SweepRunner};
use trellis_store::RocksStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trellis=info,trellis_sweep=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let db_path = std::env::var("TRELLIS_DB").unwrap_or_else(|_| "trellis-db".into());
    let interval_secs = std::env::var("TRELLIS_SWEEP_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60u64);

    tracing::info!(db = %db_path, interval_secs, "starting sweep daemon");

    let store = Arc::new(RocksStore::open(&db_path)?);
    let engine = Arc::new(RollupEngine::new(
        store.clone(),
        StoreDirectory::new(store),
        &MatrixConfig::default(),
        QualificationSchedule::standard(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = SweepRunner::new(engine, Duration::from_secs(interval_secs)).spawn(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    runner.await?;

    Ok(())
}
