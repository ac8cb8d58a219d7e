//! Background purge of expired tombstones.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use keepingtab_store::TabStore;

use crate::error::Result;
use crate::now_millis;
use crate::shutdown::Shutdown;

/// Reaper settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaperConfig {
    /// How long a tombstone is kept after the delete was applied locally.
    pub retention: Duration,
    /// Time between purge passes.
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Periodically removes tombstones older than the retention window.
///
/// Only rows that are still tombstones when the purge runs are removed; the
/// store's conditional delete keeps a tab that was re-created meanwhile.
pub struct TombstoneReaper<S> {
    store: S,
    config: ReaperConfig,
}

impl<S: TabStore> TombstoneReaper<S> {
    /// Create a reaper.
    pub fn new(store: S, config: ReaperConfig) -> Self {
        Self { store, config }
    }

    /// Run one purge pass. Returns the number of rows removed.
    pub async fn reap_once(&self) -> Result<u64> {
        let retention_ms = i64::try_from(self.config.retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(retention_ms);

        let removed = self.store.purge_tombstones(cutoff).await?;
        if removed > 0 {
            info!(removed, cutoff, "purged expired tombstones");
        } else {
            debug!(cutoff, "no expired tombstones");
        }
        Ok(removed)
    }

    /// Purge on every interval tick until shutdown.
    ///
    /// Transient store errors skip a pass; a fatal one ends the reaper.
    /// Returns the total number of rows removed.
    pub async fn run(self, shutdown: Shutdown) -> Result<u64> {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut total = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => break,
            }

            match self.reap_once().await {
                Ok(removed) => total += removed,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(error = %e, "tombstone purge failed, will retry next interval"),
            }
        }

        debug!(total, "tombstone reaper stopped");
        Ok(total)
    }
}
