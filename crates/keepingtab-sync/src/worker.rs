//! Worker pool: one supervised coordinator per partition.
//!
//! Partitions are processed in parallel and strictly sequentially inside.
//! A worker that panics is restarted from its persisted cursor, up to
//! `max_restarts` times. A worker that fails with an error stops the whole
//! pool.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use keepingtab_core::PartitionId;
use keepingtab_store::TabStore;

use crate::coordinator::{Coordinator, CoordinatorConfig, SyncReport, SyncStats};
use crate::error::{Result, SyncError};
use crate::queue::QueueConnector;
use crate::shutdown::{Shutdown, ShutdownTrigger};

/// Pool-wide settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Settings for each partition's coordinator.
    pub coordinator: CoordinatorConfig,
    /// Panics tolerated per partition before the pool gives up.
    pub max_restarts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            max_restarts: 5,
        }
    }
}

/// Combined result of all partition workers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    /// Per-partition reports, ordered by partition.
    pub partitions: Vec<SyncReport>,
    /// Worker restarts after panics.
    pub restarts: u32,
}

impl PoolReport {
    /// Counters summed over all partitions.
    pub fn totals(&self) -> SyncStats {
        let mut totals = SyncStats::default();
        for report in &self.partitions {
            totals.absorb(&report.stats);
        }
        totals
    }
}

/// Spawns and supervises partition workers.
pub struct WorkerPool<S> {
    store: S,
    connector: Arc<dyn QueueConnector>,
    config: WorkerConfig,
}

impl<S> WorkerPool<S>
where
    S: TabStore + Clone + 'static,
{
    /// Create a pool over a store and a queue connector.
    pub fn new(store: S, connector: Arc<dyn QueueConnector>, config: WorkerConfig) -> Self {
        Self {
            store,
            connector,
            config,
        }
    }

    /// Start one worker per partition.
    ///
    /// Workers stop when `trigger` is raised. A failing worker raises it too.
    pub fn spawn(self, trigger: ShutdownTrigger) -> WorkerPoolHandle {
        let partitions = self.connector.partition_count();
        let mut tasks = JoinSet::new();

        for p in 0..partitions {
            let supervisor = Supervisor {
                partition: PartitionId(p),
                store: self.store.clone(),
                connector: Arc::clone(&self.connector),
                config: self.config.clone(),
                trigger: trigger.clone(),
            };
            tasks.spawn(supervisor.run());
        }

        info!(partitions, "worker pool started");
        WorkerPoolHandle { tasks, trigger }
    }
}

/// Handle to a running pool.
pub struct WorkerPoolHandle {
    tasks: JoinSet<Result<(SyncReport, u32)>>,
    trigger: ShutdownTrigger,
}

impl WorkerPoolHandle {
    /// Raise shutdown and wait for every worker.
    pub async fn shutdown(self) -> Result<PoolReport> {
        self.trigger.trigger();
        self.join().await
    }

    /// Wait for every worker to finish.
    ///
    /// Returns the first worker error, if any; the rest of the pool has
    /// already been told to stop by then.
    pub async fn join(mut self) -> Result<PoolReport> {
        let mut report = PoolReport::default();
        let mut first_error = None;

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok((partition_report, restarts))) => {
                    report.restarts += restarts;
                    report.partitions.push(partition_report);
                }
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    self.trigger.trigger();
                    first_error.get_or_insert(SyncError::Task(e.to_string()));
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        report.partitions.sort_by_key(|r| r.partition);
        info!(
            partitions = report.partitions.len(),
            restarts = report.restarts,
            "worker pool stopped"
        );
        Ok(report)
    }
}

struct Supervisor<S> {
    partition: PartitionId,
    store: S,
    connector: Arc<dyn QueueConnector>,
    config: WorkerConfig,
    trigger: ShutdownTrigger,
}

impl<S> Supervisor<S>
where
    S: TabStore + Clone + 'static,
{
    async fn run(self) -> Result<(SyncReport, u32)> {
        let mut restarts = 0u32;
        let mut totals = SyncStats::default();

        loop {
            let worker = tokio::spawn(run_worker(
                self.partition,
                self.store.clone(),
                Arc::clone(&self.connector),
                self.config.coordinator.clone(),
                self.trigger.subscribe(),
            ));

            match worker.await {
                Ok(Ok(mut report)) => {
                    totals.absorb(&report.stats);
                    report.stats = totals;
                    return Ok((report, restarts));
                }
                Ok(Err(e)) => {
                    error!(partition = %self.partition, error = %e, "worker failed, stopping pool");
                    self.trigger.trigger();
                    return Err(e);
                }
                Err(join) if join.is_panic() => {
                    if self.trigger.is_triggered() {
                        warn!(partition = %self.partition, "worker panicked during shutdown");
                        return Ok((
                            SyncReport {
                                partition: self.partition,
                                cursor: self.persisted_cursor().await?,
                                stats: totals,
                            },
                            restarts,
                        ));
                    }
                    if restarts >= self.config.max_restarts {
                        error!(
                            partition = %self.partition,
                            restarts,
                            "worker keeps panicking, stopping pool"
                        );
                        self.trigger.trigger();
                        return Err(SyncError::RestartsExhausted {
                            partition: self.partition,
                            restarts,
                        });
                    }
                    restarts += 1;
                    warn!(
                        partition = %self.partition,
                        restarts,
                        "worker panicked, restarting from persisted cursor"
                    );
                }
                Err(join) => {
                    self.trigger.trigger();
                    return Err(SyncError::Task(join.to_string()));
                }
            }
        }
    }
}

impl<S: TabStore> Supervisor<S> {
    /// Offset the partition's last worker managed to persist.
    async fn persisted_cursor(&self) -> Result<Option<u64>> {
        let cursor = self
            .store
            .load_cursor(&self.config.coordinator.consumer, self.partition)
            .await?;
        Ok(cursor.map(|c| c.offset))
    }
}

async fn run_worker<S: TabStore + 'static>(
    partition: PartitionId,
    store: S,
    connector: Arc<dyn QueueConnector>,
    config: CoordinatorConfig,
    shutdown: Shutdown,
) -> Result<SyncReport> {
    match Coordinator::start(store, connector.as_ref(), partition, config, &shutdown).await? {
        Some(coordinator) => coordinator.run(shutdown).await,
        None => Ok(SyncReport {
            partition,
            cursor: None,
            stats: SyncStats::default(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::queue::memory::MemoryBroker;
    use crate::queue::QueueConfig;
    use crate::shutdown;
    use async_trait::async_trait;
    use keepingtab_core::{ChangeEvent, ConsumerId, Tab, TabId};
    use keepingtab_store::{DeadLetter, DeleteOutcome, MemoryStore, PutOutcome, SyncCursor};
    use keepingtab_testkit::FlakyStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Store whose armed `put` raises shutdown and then panics.
    struct PanicsDuringShutdown {
        inner: MemoryStore,
        trigger: ShutdownTrigger,
        armed: AtomicBool,
    }

    #[async_trait]
    impl TabStore for PanicsDuringShutdown {
        async fn get(&self, id: &TabId) -> keepingtab_store::Result<Option<Tab>> {
            self.inner.get(id).await
        }

        async fn put(&self, tab: &Tab) -> keepingtab_store::Result<PutOutcome> {
            if self.armed.load(Ordering::SeqCst) {
                self.trigger.trigger();
                panic!("store torn down under the worker");
            }
            self.inner.put(tab).await
        }

        async fn delete(&self, id: &TabId) -> keepingtab_store::Result<DeleteOutcome> {
            self.inner.delete(id).await
        }

        async fn list_page(
            &self,
            after: Option<&TabId>,
            limit: usize,
        ) -> keepingtab_store::Result<Vec<Tab>> {
            self.inner.list_page(after, limit).await
        }

        async fn count(&self) -> keepingtab_store::Result<u64> {
            self.inner.count().await
        }

        async fn purge_tombstones(&self, before: i64) -> keepingtab_store::Result<u64> {
            self.inner.purge_tombstones(before).await
        }

        async fn load_cursor(
            &self,
            consumer: &ConsumerId,
            partition: PartitionId,
        ) -> keepingtab_store::Result<Option<SyncCursor>> {
            self.inner.load_cursor(consumer, partition).await
        }

        async fn save_cursor(&self, cursor: &SyncCursor) -> keepingtab_store::Result<()> {
            self.inner.save_cursor(cursor).await
        }

        async fn record_dead_letter(&self, letter: &DeadLetter) -> keepingtab_store::Result<bool> {
            self.inner.record_dead_letter(letter).await
        }

        async fn list_dead_letters(&self) -> keepingtab_store::Result<Vec<DeadLetter>> {
            self.inner.list_dead_letters().await
        }
    }

    fn config(max_restarts: u32) -> WorkerConfig {
        let fast = BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(4));
        WorkerConfig {
            coordinator: CoordinatorConfig {
                consumer: ConsumerId::new("pool"),
                batch_size: 1,
                retry_budget: 2,
                store_backoff: fast.clone(),
                queue_backoff: fast,
            },
            max_restarts,
        }
    }

    fn broker(partitions: u32) -> Arc<MemoryBroker> {
        Arc::new(MemoryBroker::new(partitions, QueueConfig::default()))
    }

    async fn wait_for_count<S: TabStore>(store: &S, count: u64) {
        while store.count().await.unwrap() < count {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_pool_processes_all_partitions() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(4);
        for (i, origin) in ["laptop", "phone", "tablet", "desktop", "work"].iter().enumerate() {
            let id = format!("tab-{i}");
            broker
                .publish(ChangeEvent::upsert(Tab::new(id.as_str(), *origin, 10), 1))
                .unwrap();
        }

        let (trigger, _shutdown) = shutdown::channel();
        let handle = WorkerPool::new(store.clone(), broker.clone(), config(3)).spawn(trigger);

        wait_for_count(&store, 5).await;
        let report = handle.shutdown().await.unwrap();

        assert_eq!(report.partitions.len(), 4);
        assert_eq!(report.totals().applied, 5);
        assert_eq!(report.restarts, 0);
    }

    #[tokio::test]
    async fn test_panicking_worker_is_restarted() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        store.panic_on_put(1);
        let broker = broker(1);
        broker
            .publish(ChangeEvent::upsert(Tab::new("1", "A", 10), 1))
            .unwrap();
        broker
            .publish(ChangeEvent::upsert(Tab::new("2", "A", 10), 2))
            .unwrap();

        let (trigger, _shutdown) = shutdown::channel();
        let handle = WorkerPool::new(store.clone(), broker.clone(), config(3)).spawn(trigger);

        wait_for_count(&store, 2).await;
        let report = handle.shutdown().await.unwrap();

        assert_eq!(report.restarts, 1);
        assert_eq!(report.partitions[0].cursor, Some(2));
    }

    #[tokio::test]
    async fn test_panic_during_shutdown_reports_persisted_cursor() {
        let (trigger, _shutdown) = shutdown::channel();
        let store = Arc::new(PanicsDuringShutdown {
            inner: MemoryStore::new(),
            trigger: trigger.clone(),
            armed: AtomicBool::new(false),
        });
        let broker = broker(1);
        broker
            .publish(ChangeEvent::upsert(Tab::new("1", "A", 10), 1))
            .unwrap();

        let handle = WorkerPool::new(store.clone(), broker.clone(), config(3)).spawn(trigger);

        let consumer = ConsumerId::new("pool");
        while store
            .load_cursor(&consumer, PartitionId(0))
            .await
            .unwrap()
            .is_none()
        {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        store.armed.store(true, Ordering::SeqCst);
        broker
            .publish(ChangeEvent::upsert(Tab::new("2", "A", 11), 2))
            .unwrap();

        let report = handle.join().await.unwrap();
        assert_eq!(report.restarts, 0);
        assert_eq!(report.partitions[0].cursor, Some(1));
        assert!(store.get(&TabId::from("2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restart_limit_stops_pool() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        store.panic_on_put(u32::MAX);
        let broker = broker(2);
        broker
            .publish(ChangeEvent::upsert(Tab::new("1", "A", 10), 1))
            .unwrap();

        let (trigger, _shutdown) = shutdown::channel();
        let handle = WorkerPool::new(store.clone(), broker.clone(), config(2)).spawn(trigger.clone());

        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, SyncError::RestartsExhausted { restarts: 2, .. }));
        assert!(trigger.is_triggered());
    }

    #[tokio::test]
    async fn test_fatal_error_stops_every_worker() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        let broker = broker(3);

        let (trigger, _shutdown) = shutdown::channel();
        let handle = WorkerPool::new(store.clone(), broker.clone(), config(3)).spawn(trigger.clone());

        // Let every worker subscribe before the store goes bad.
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.corrupt();
        broker
            .publish(ChangeEvent::upsert(Tab::new("1", "A", 10), 1))
            .unwrap();

        let err = handle.join().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(trigger.is_triggered());
    }
}
