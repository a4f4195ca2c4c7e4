//! Periodic background sweep.

use crate::RollupEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use trellis_model::now_ms;
use trellis_rewards::MemberDirectory;
use trellis_store::Store;

/// Runs [`RollupEngine::resolve_expired`] on an interval until told to stop.
pub struct SweepRunner<S, D> {
    engine: Arc<RollupEngine<S, D>>,
    interval: Duration,
}

impl<S, D> SweepRunner<S, D>
where
    S: Store + 'static,
    D: MemberDirectory + 'static,
{
    pub fn new(engine: Arc<RollupEngine<S, D>>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Spawn the sweep loop. Flip the watch channel to `true` to stop it.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = self.interval.as_millis() as u64, "sweep runner started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // The store is synchronous; keep it off the async
                        // workers.
                        let engine = self.engine.clone();
                        match tokio::task::spawn_blocking(move || engine.resolve_expired(now_ms())).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => error!(error = %e, "sweep run failed"),
                            Err(e) => error!(error = %e, "sweep task panicked"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("sweep runner stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
