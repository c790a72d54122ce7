//! Background eviction of idle limiter entries.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::limiter::KeyedLimiterRegistry;
use crate::error::{KeygateError, Result};

/// Periodic idle-entry eviction for a registry.
pub struct Sweeper;

/// Handle to a running sweeper. Dropping it stops the sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<usize>,
}

impl Sweeper {
    /// Start sweeping `registry` every `interval` on the current tokio runtime.
    ///
    /// Fails if the registry has no idle TTL or the interval is zero.
    pub fn spawn(registry: Arc<KeyedLimiterRegistry>, interval: Duration) -> Result<SweeperHandle> {
        let Some(ttl) = registry.config().idle_ttl() else {
            return Err(KeygateError::Config(
                "sweeper requires idle_ttl_ms to be set".to_string(),
            ));
        };
        if interval.is_zero() {
            return Err(KeygateError::Config(
                "sweep interval must be greater than zero".to_string(),
            ));
        }

        info!(
            interval_ms = interval.as_millis() as u64,
            idle_ttl_ms = ttl.as_millis() as u64,
            "Starting idle entry sweeper"
        );

        let (tx, mut rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut total = 0;

            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = ticker.tick() => {
                        let evicted = registry.evict_idle(registry.now());
                        if evicted > 0 {
                            debug!(evicted = evicted, keys = registry.len(), "Sweep finished");
                        }
                        total += evicted;
                    }
                }
            }

            info!(total_evicted = total, "Idle entry sweeper stopped");
            total
        });

        Ok(SweeperHandle {
            shutdown: Some(tx),
            task,
        })
    }
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it. Returns the number of entries it evicted.
    pub async fn shutdown(mut self) -> usize {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }

        match (&mut self.task).await {
            Ok(total) => total,
            Err(e) => {
                warn!(error = %e, "Sweeper task failed");
                0
            }
        }
    }
}
