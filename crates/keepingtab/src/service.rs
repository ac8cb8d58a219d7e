//! The sync service: store, worker pool and tombstone reaper under one
//! lifecycle.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use keepingtab_store::{SqliteStore, TabStore};
use keepingtab_sync::{
    shutdown, PoolReport, QueueConnector, ShutdownTrigger, TombstoneReaper, WorkerPool,
    WorkerPoolHandle,
};

use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};

/// Outcome of a service run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceReport {
    /// Per-partition sync results.
    pub pool: PoolReport,
    /// Tombstones removed by the reaper.
    pub tombstones_purged: u64,
}

/// The sync service.
///
/// Owns the local store and the configuration. [`SyncService::start`]
/// attaches it to a change queue.
pub struct SyncService<S = Arc<SqliteStore>> {
    config: ServiceConfig,
    store: S,
}

impl SyncService<Arc<SqliteStore>> {
    /// Open the SQLite store named by the configuration.
    ///
    /// Validates the configuration, creates the database if needed and logs
    /// how many tabs it already holds.
    pub async fn open(config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(SqliteStore::open(&config.database_path)?);
        let tabs_in_db = store.count().await?;
        info!(
            path = %config.database_path.display(),
            tabs_in_db,
            "opened tab store"
        );
        Ok(Self { config, store })
    }
}

impl<S> SyncService<S>
where
    S: TabStore + Clone + 'static,
{
    /// Build a service over an already opened store.
    pub fn with_store(store: S, config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, store })
    }

    /// The local store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Start one worker per queue partition and the tombstone reaper.
    pub fn start(&self, connector: Arc<dyn QueueConnector>) -> Result<RunningService> {
        let actual = connector.partition_count();
        if actual != self.config.partition_count {
            return Err(ServiceError::PartitionMismatch {
                configured: self.config.partition_count,
                actual,
            });
        }

        let (trigger, _) = shutdown::channel();
        let reaper = TombstoneReaper::new(self.store.clone(), self.config.reaper_config());
        let reaper = tokio::spawn(reaper.run(trigger.subscribe()));
        let pool = WorkerPool::new(self.store.clone(), connector, self.config.worker_config())
            .spawn(trigger.clone());

        info!(
            consumer = %self.config.consumer_id,
            partitions = actual,
            "sync service started"
        );
        Ok(RunningService {
            pool,
            reaper,
            trigger,
        })
    }

    /// Run until `signal` completes or the service stops on its own, then
    /// shut down gracefully.
    pub async fn run_until<F>(
        &self,
        connector: Arc<dyn QueueConnector>,
        signal: F,
    ) -> Result<ServiceReport>
    where
        F: Future<Output = ()>,
    {
        let running = self.start(connector)?;
        let stopped = running.trigger.subscribe();

        tokio::select! {
            _ = signal => info!("shutdown requested"),
            _ = stopped.wait() => warn!("sync service stopping on its own"),
        }
        running.shutdown().await
    }
}

/// Handle to a started service.
pub struct RunningService {
    pool: WorkerPoolHandle,
    reaper: JoinHandle<keepingtab_sync::Result<u64>>,
    trigger: ShutdownTrigger,
}

impl RunningService {
    /// Trigger that stops the service when raised.
    pub fn trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    /// Check if shutdown was raised, by request or by a failing worker.
    pub fn is_stopping(&self) -> bool {
        self.trigger.is_triggered()
    }

    /// Stop every worker, flush cursors and wait for completion.
    pub async fn shutdown(self) -> Result<ServiceReport> {
        self.trigger.trigger();
        self.join().await
    }

    /// Wait for the service to stop.
    ///
    /// Returns the first worker error. A reaper failure is reported only if
    /// the pool itself stopped cleanly.
    pub async fn join(self) -> Result<ServiceReport> {
        let pool = self.pool.join().await;
        // The reaper only stops on shutdown; make sure it sees one.
        self.trigger.trigger();
        let reaper = self.reaper.await;

        let pool = pool?;
        let tombstones_purged = reaper.map_err(|e| ServiceError::Task(e.to_string()))??;

        let totals = pool.totals();
        info!(
            applied = totals.applied,
            rejected = totals.rejected,
            restarts = pool.restarts,
            tombstones_purged,
            "sync service stopped"
        );
        Ok(ServiceReport {
            pool,
            tombstones_purged,
        })
    }
}
