//! Interface refresh service
//!
//! Re-runs the pool's interface reconciliation on a fixed period so modems that
//! are plugged in or drop off are picked up without a restart.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::proxy::ProxyPool;

/// Periodically refreshes the proxy pool
pub struct RefreshService {
    pool: Arc<ProxyPool>,
    period: Duration,
}

impl RefreshService {
    pub fn new(pool: Arc<ProxyPool>, period: Duration) -> Self {
        Self { pool, period }
    }

    /// Run the refresh loop (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting interface refresh every {:?}", self.period);

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // Startup refresh already ran

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.pool.refresh().await {
                        Ok(summary) if summary.is_empty() => debug!("No interface changes"),
                        Ok(_) => {}
                        Err(e) => warn!(kind = %e.kind(), "Interface refresh failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Interface refresh service shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Handle for stopping the refresh service
pub struct RefreshHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl RefreshHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for RefreshHandle {
    fn default() -> Self {
        Self::new().0
    }
}
