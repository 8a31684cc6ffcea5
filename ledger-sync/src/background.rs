//! Periodic background sync
//!
//! Runs a sync cycle over every account on a fixed interval. A cycle with
//! any failed account is retried sooner, with exponential backoff, until it
//! succeeds or the backoff reaches the regular interval.

use crate::client::jitter_duration;
use crate::{CancelToken, SyncEngine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Background sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundSyncConfig {
    /// Delay between successful cycles
    pub interval: Duration,
    /// First retry delay after a failed cycle
    pub failure_backoff: Duration,
    /// Backoff multiplier between consecutive failures
    pub backoff_multiplier: f64,
    /// Run a cycle immediately on start
    pub sync_on_start: bool,
}

impl Default for BackgroundSyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20), // one Cardano block is ~20s
            failure_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            sync_on_start: true,
        }
    }
}

impl BackgroundSyncConfig {
    /// Delay before the next cycle after `failures` consecutive failed cycles
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.interval;
        }
        let factor = self.backoff_multiplier.powi(failures.saturating_sub(1) as i32);
        let millis = (self.failure_backoff.as_millis() as f64 * factor) as u64;
        std::cmp::min(Duration::from_millis(millis), self.interval)
    }
}

/// Outcome of one background cycle
#[derive(Debug, Clone, Default)]
pub struct BackgroundSyncResult {
    /// Accounts that synced
    pub synced: usize,
    /// Accounts whose sync failed
    pub failed: usize,
    /// Transactions inserted across accounts
    pub new_transactions: usize,
    /// Rollbacks performed across accounts
    pub rollbacks: usize,
    /// Wall time of the cycle
    pub duration: Duration,
    /// Failure messages, one per failed account
    pub errors: Vec<String>,
}

/// Background sync loop
pub struct BackgroundSync {
    engine: Arc<SyncEngine>,
    config: BackgroundSyncConfig,
    cancel: CancelToken,
}

#[allow(dead_code)]
fn _assert_background_sync_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<BackgroundSync>();
}

impl BackgroundSync {
    /// Create loop around `engine`; cancelling the engine stops the loop
    pub fn new(engine: Arc<SyncEngine>, config: BackgroundSyncConfig) -> Self {
        let cancel = engine.cancel_token();
        Self {
            engine,
            config,
            cancel,
        }
    }

    /// Token that stops the loop
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// One cycle over every account
    pub async fn run_once(&self) -> BackgroundSyncResult {
        let started = Instant::now();
        let mut result = BackgroundSyncResult::default();
        match self.engine.sync_all().await {
            Ok(reports) => {
                for (account, report) in reports {
                    match report {
                        Ok(report) => {
                            result.synced += 1;
                            result.new_transactions += report.inserted;
                            result.rollbacks += usize::from(report.rollback.is_some());
                        }
                        Err(e) => {
                            result.failed += 1;
                            result.errors.push(format!("account {account}: {e}"));
                        }
                    }
                }
            }
            Err(e) => {
                result.failed += 1;
                result.errors.push(e.to_string());
            }
        }
        result.duration = started.elapsed();
        result
    }

    /// Run until cancelled
    pub async fn run(&self) {
        info!(
            event = "background_sync_started",
            interval_secs = self.config.interval.as_secs()
        );
        let mut failures: u32 = 0;
        let mut first = true;

        loop {
            if !(first && self.config.sync_on_start) {
                let delay = jitter_duration(self.config.delay_after(failures));
                debug!(delay_ms = delay.as_millis() as u64, failures, "Waiting for next cycle");
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            first = false;
            if self.cancel.is_cancelled() {
                break;
            }

            let result = self.run_once().await;
            if result.failed == 0 {
                failures = 0;
                info!(
                    event = "background_sync_completed",
                    accounts = result.synced,
                    new_transactions = result.new_transactions,
                    rollbacks = result.rollbacks,
                    duration_ms = result.duration.as_millis() as u64
                );
            } else {
                failures = failures.saturating_add(1);
                warn!(
                    event = "background_sync_failed",
                    failed = result.failed,
                    consecutive = failures,
                    errors = ?result.errors
                );
            }
        }
        info!(event = "background_sync_stopped");
    }

    /// Spawn [`Self::run`] on the current runtime
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_backoff_grows_up_to_interval() {
        let config = BackgroundSyncConfig {
            interval: Duration::from_secs(20),
            failure_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            sync_on_start: true,
        };
        assert_eq!(config.delay_after(0), Duration::from_secs(20));
        assert_eq!(config.delay_after(1), Duration::from_secs(2));
        assert_eq!(config.delay_after(2), Duration::from_secs(4));
        assert_eq!(config.delay_after(3), Duration::from_secs(8));
        assert_eq!(config.delay_after(10), Duration::from_secs(20));
    }
}
