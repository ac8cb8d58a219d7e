//! Sync coordinator: drives one partition from the queue into the store.
//!
//! Each delivery walks a small state machine:
//!
//! ```text
//! Received ─▶ Merging ─▶ Applying ─▶ Acknowledged
//!     │          │          │
//!     │          └──────────┴──▶ Retrying ─▶ (redelivered) ─▶ Received
//!     └──────────────────────────────────▶ Rejected (dead letter)
//! ```
//!
//! Transient store failures are retried in place up to `retry_budget`, then
//! the delivery goes back to the queue. Malformed events and deliveries the
//! queue gives up on are dead-lettered. The cursor only moves past an event
//! once it is acknowledged or its dead letter is durably recorded.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use keepingtab_core::{
    encode_event, merge, validate_event, ConsumerId, MergeDecision, NoopReason, PartitionId,
    ValidationError,
};
use keepingtab_store::{DeadLetter, PutOutcome, StoreError, SyncCursor, TabStore};

use crate::backoff::BackoffPolicy;
use crate::error::{QueueError, Result};
use crate::now_millis;
use crate::queue::{ChangeQueue, Delivery, NackOutcome, NackReason, QueueConnector};
use crate::shutdown::Shutdown;

/// Where a delivery is in its processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventState {
    /// Taken off the queue.
    Received,
    /// Reading the stored tab and deciding.
    Merging,
    /// Writing the resolved tab.
    Applying,
    /// Written (or discarded as a no-op) and acked.
    Acknowledged,
    /// Dead-lettered.
    Rejected,
    /// Waiting for another attempt.
    Retrying,
}

impl EventState {
    /// Check if the event is settled and the cursor may pass it.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventState::Acknowledged | EventState::Rejected)
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received => write!(f, "Received"),
            Self::Merging => write!(f, "Merging"),
            Self::Applying => write!(f, "Applying"),
            Self::Acknowledged => write!(f, "Acknowledged"),
            Self::Rejected => write!(f, "Rejected"),
            Self::Retrying => write!(f, "Retrying"),
        }
    }
}

/// Configuration for a coordinator.
///
/// # Fields
///
/// - `batch_size`: settled events between cursor writes (default: 50)
/// - `retry_budget`: in-place retries of a failing store write (default: 3)
/// - `store_backoff`: delay schedule between store retries
/// - `queue_backoff`: delay schedule while the queue is unreachable
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Identity the cursor is stored under.
    pub consumer: ConsumerId,
    /// Settled events between cursor writes.
    pub batch_size: usize,
    /// In-place retries before a delivery is returned to the queue.
    pub retry_budget: u32,
    /// Backoff between store retries.
    pub store_backoff: BackoffPolicy,
    /// Backoff while the queue is unavailable.
    pub queue_backoff: BackoffPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            consumer: ConsumerId::default(),
            batch_size: 50,
            retry_budget: 3,
            store_backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(5))
                .with_jitter(0.2),
            queue_backoff: BackoffPolicy::new(Duration::from_millis(250), Duration::from_secs(30))
                .with_jitter(0.2),
        }
    }
}

/// Counters for one coordinator run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Deliveries taken off the queue, redeliveries included.
    pub received: u64,
    /// Tabs written.
    pub applied: u64,
    /// Events older than the stored version.
    pub stale: u64,
    /// Events whose exact version was already stored.
    pub duplicates: u64,
    /// Deletes for tabs never stored.
    pub unknown_deletes: u64,
    /// Writes that lost a compare-and-set race and were re-merged.
    pub conflicts: u64,
    /// In-place store retries.
    pub retries: u64,
    /// Deliveries returned to the queue.
    pub redeliveries: u64,
    /// Events dead-lettered.
    pub rejected: u64,
    /// Cursor writes.
    pub cursor_flushes: u64,
    /// Times the queue was found unavailable.
    pub queue_outages: u64,
}

impl SyncStats {
    /// Add another run's counters to these.
    pub fn absorb(&mut self, other: &SyncStats) {
        self.received += other.received;
        self.applied += other.applied;
        self.stale += other.stale;
        self.duplicates += other.duplicates;
        self.unknown_deletes += other.unknown_deletes;
        self.conflicts += other.conflicts;
        self.retries += other.retries;
        self.redeliveries += other.redeliveries;
        self.rejected += other.rejected;
        self.cursor_flushes += other.cursor_flushes;
        self.queue_outages += other.queue_outages;
    }

    /// Events that reached a terminal state.
    pub fn settled(&self) -> u64 {
        self.applied + self.stale + self.duplicates + self.unknown_deletes + self.rejected
    }
}

/// Final state of a coordinator run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// The partition that was processed.
    pub partition: PartitionId,
    /// Last settled offset, if any.
    pub cursor: Option<u64>,
    /// Counters.
    pub stats: SyncStats,
}

enum Applied {
    Written,
    Noop(NoopReason),
}

enum ApplyError {
    Invalid(ValidationError),
    Store(StoreError),
}

impl From<StoreError> for ApplyError {
    fn from(e: StoreError) -> Self {
        ApplyError::Store(e)
    }
}

enum Attempt {
    Applied(Applied),
    Failed(NackReason),
    Interrupted,
}

/// Drives one partition subscription.
pub struct Coordinator<S> {
    store: S,
    queue: Box<dyn ChangeQueue>,
    config: CoordinatorConfig,
    partition: PartitionId,
    state: EventState,
    /// States the most recent delivery went through, in order.
    trail: Vec<EventState>,
    /// Last settled offset.
    cursor: Option<u64>,
    /// Last offset written to the store.
    persisted: Option<u64>,
    unflushed: usize,
    stats: SyncStats,
}

impl<S: TabStore> Coordinator<S> {
    /// Create a coordinator over an open subscription positioned after
    /// `resume_after`.
    pub fn new(
        store: S,
        queue: Box<dyn ChangeQueue>,
        config: CoordinatorConfig,
        resume_after: Option<u64>,
    ) -> Self {
        Self {
            store,
            partition: queue.partition(),
            queue,
            config,
            state: EventState::Received,
            trail: Vec::new(),
            cursor: resume_after,
            persisted: resume_after,
            unflushed: 0,
            stats: SyncStats::default(),
        }
    }

    /// Open a coordinator for `partition`, resuming after the persisted
    /// cursor.
    ///
    /// Transient failures are retried until they clear. Returns `None` if
    /// shutdown is raised first.
    pub async fn start(
        store: S,
        connector: &dyn QueueConnector,
        partition: PartitionId,
        config: CoordinatorConfig,
        shutdown: &Shutdown,
    ) -> Result<Option<Self>> {
        let loaded = {
            let store = &store;
            let consumer = &config.consumer;
            retry_store(&config.store_backoff, shutdown, "cursor load", move || {
                store.load_cursor(consumer, partition)
            })
            .await?
        };
        let resume_after = match loaded {
            Some(cursor) => cursor.map(|c| c.offset),
            None => return Ok(None),
        };

        let mut outages = 0u32;
        let queue = loop {
            match connector.subscribe(partition, resume_after).await {
                Ok(queue) => break queue,
                Err(e) if e.is_transient() => {
                    outages = outages.saturating_add(1);
                    let delay = config.queue_backoff.jittered(outages);
                    warn!(
                        partition = %partition,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "subscribe failed, retrying"
                    );
                    if !shutdown.sleep(delay).await {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        };

        info!(
            partition = %partition,
            consumer = %config.consumer,
            resume_after = ?resume_after,
            "coordinator resuming"
        );

        Ok(Some(Self::new(store, queue, config, resume_after)))
    }

    /// The partition this coordinator drives.
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// State of the most recent delivery.
    pub fn state(&self) -> EventState {
        self.state
    }

    /// States the most recent delivery went through, in order.
    pub fn trail(&self) -> &[EventState] {
        &self.trail
    }

    /// Last settled offset.
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    /// Counters so far.
    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// Snapshot of the run so far.
    pub fn report(&self) -> SyncReport {
        SyncReport {
            partition: self.partition,
            cursor: self.cursor,
            stats: self.stats.clone(),
        }
    }

    /// Process deliveries until shutdown, then persist the cursor.
    ///
    /// Returns an error only for conditions no retry can fix: a corrupt
    /// store or a broken subscription.
    pub async fn run(mut self, shutdown: Shutdown) -> Result<SyncReport> {
        loop {
            match self.step(&shutdown).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    if !e.is_fatal() {
                        if let Err(flush) = self.flush_cursor(&shutdown).await {
                            warn!(partition = %self.partition, error = %flush, "cursor flush failed");
                        }
                    }
                    error!(partition = %self.partition, error = %e, "coordinator stopped");
                    return Err(e);
                }
            }
        }

        self.flush_cursor(&shutdown).await?;
        info!(
            partition = %self.partition,
            cursor = ?self.cursor,
            applied = self.stats.applied,
            rejected = self.stats.rejected,
            "coordinator stopped"
        );
        Ok(self.report())
    }

    /// Receive and process one delivery.
    ///
    /// Waits out queue outages. Returns `None` once shutdown is raised.
    pub async fn step(&mut self, shutdown: &Shutdown) -> Result<Option<EventState>> {
        let mut outages = 0u32;
        let delivery = loop {
            match self.queue.receive(shutdown).await {
                Ok(Some(delivery)) => break delivery,
                Ok(None) => return Ok(None),
                Err(QueueError::Unavailable(reason)) => {
                    outages = outages.saturating_add(1);
                    self.stats.queue_outages += 1;
                    let delay = self.config.queue_backoff.jittered(outages);
                    warn!(
                        partition = %self.partition,
                        %reason,
                        outages,
                        delay_ms = delay.as_millis() as u64,
                        "queue unavailable, backing off"
                    );
                    if !shutdown.sleep(delay).await {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.process(delivery, shutdown).await.map(Some)
    }

    /// Take one delivery as far as it can go.
    ///
    /// Returns the state the delivery was left in. Anything but a terminal
    /// state means the event was not settled and will be seen again.
    pub async fn process(&mut self, delivery: Delivery, shutdown: &Shutdown) -> Result<EventState> {
        self.stats.received += 1;
        self.trail.clear();
        self.enter(&delivery, EventState::Received);
        self.enter(&delivery, EventState::Merging);

        let reason = match validate_event(&delivery.event) {
            Err(e) => NackReason::Invalid(e.to_string()),
            Ok(()) => match self.apply_with_retries(&delivery, shutdown).await? {
                Attempt::Applied(applied) => {
                    self.count(&delivery, &applied);
                    return self.acknowledge(&delivery, shutdown).await;
                }
                Attempt::Failed(reason) => reason,
                Attempt::Interrupted => return Ok(self.state),
            },
        };

        self.reject(&delivery, reason, shutdown).await
    }

    fn enter(&mut self, delivery: &Delivery, state: EventState) {
        if self.trail.last() == Some(&state) {
            return;
        }
        trace!(
            partition = %self.partition,
            offset = delivery.offset,
            from = %self.state,
            to = %state,
            "event state"
        );
        self.state = state;
        self.trail.push(state);
    }

    fn count(&mut self, delivery: &Delivery, applied: &Applied) {
        let event = &delivery.event;
        match applied {
            Applied::Written => {
                self.stats.applied += 1;
                debug!(
                    partition = %self.partition,
                    offset = delivery.offset,
                    tab_id = %event.tab_id,
                    operation = event.operation.as_str(),
                    "change applied"
                );
            }
            Applied::Noop(reason) => {
                match reason {
                    NoopReason::Stale => self.stats.stale += 1,
                    NoopReason::AlreadyApplied => self.stats.duplicates += 1,
                    NoopReason::UnknownTab => self.stats.unknown_deletes += 1,
                }
                debug!(
                    partition = %self.partition,
                    offset = delivery.offset,
                    tab_id = %event.tab_id,
                    reason = reason.as_str(),
                    "change discarded"
                );
            }
        }
    }

    async fn apply_with_retries(
        &mut self,
        delivery: &Delivery,
        shutdown: &Shutdown,
    ) -> Result<Attempt> {
        let mut failures = 0u32;
        loop {
            match self.merge_and_apply(delivery).await {
                Ok(applied) => return Ok(Attempt::Applied(applied)),
                Err(ApplyError::Invalid(e)) => {
                    return Ok(Attempt::Failed(NackReason::Invalid(e.to_string())))
                }
                Err(ApplyError::Store(e)) if e.is_fatal() => {
                    error!(
                        partition = %self.partition,
                        offset = delivery.offset,
                        error = %e,
                        "local store is unusable"
                    );
                    return Err(e.into());
                }
                Err(ApplyError::Store(e)) => {
                    failures += 1;
                    if failures > self.config.retry_budget {
                        return Ok(Attempt::Failed(NackReason::Transient(e.to_string())));
                    }

                    self.stats.retries += 1;
                    self.enter(delivery, EventState::Retrying);
                    let delay = self.config.store_backoff.jittered(failures);
                    warn!(
                        partition = %self.partition,
                        offset = delivery.offset,
                        tab_id = %delivery.event.tab_id,
                        error = %e,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "store operation failed, retrying"
                    );
                    if !shutdown.sleep(delay).await {
                        return Ok(Attempt::Interrupted);
                    }
                }
            }
        }
    }

    async fn merge_and_apply(&mut self, delivery: &Delivery) -> std::result::Result<Applied, ApplyError> {
        let event = &delivery.event;
        self.enter(delivery, EventState::Merging);
        let mut stored = self.store.get(&event.tab_id).await?;

        loop {
            match merge(stored.as_ref(), event).map_err(ApplyError::Invalid)? {
                MergeDecision::Noop(reason) => return Ok(Applied::Noop(reason)),
                MergeDecision::Apply(tab) => {
                    self.enter(delivery, EventState::Applying);
                    match self.store.put(&tab).await? {
                        PutOutcome::Written => return Ok(Applied::Written),
                        PutOutcome::Conflict { current } => {
                            self.stats.conflicts += 1;
                            debug!(
                                partition = %self.partition,
                                tab_id = %event.tab_id,
                                "concurrent write won, merging again"
                            );
                            self.enter(delivery, EventState::Merging);
                            stored = Some(current);
                        }
                    }
                }
            }
        }
    }

    async fn acknowledge(&mut self, delivery: &Delivery, shutdown: &Shutdown) -> Result<EventState> {
        let mut outages = 0u32;
        loop {
            match self.queue.ack(delivery).await {
                Ok(()) => break,
                Err(e) if e.is_transient() => {
                    outages = outages.saturating_add(1);
                    warn!(partition = %self.partition, offset = delivery.offset, error = %e, "ack failed");
                    if !shutdown.sleep(self.config.queue_backoff.jittered(outages)).await {
                        return Ok(self.state);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.enter(delivery, EventState::Acknowledged);
        self.settle(delivery.offset, shutdown).await?;
        Ok(EventState::Acknowledged)
    }

    async fn reject(
        &mut self,
        delivery: &Delivery,
        reason: NackReason,
        shutdown: &Shutdown,
    ) -> Result<EventState> {
        let mut outages = 0u32;
        let outcome = loop {
            match self.queue.nack(delivery, &reason).await {
                Ok(outcome) => break outcome,
                Err(e) if e.is_transient() => {
                    outages = outages.saturating_add(1);
                    warn!(partition = %self.partition, offset = delivery.offset, error = %e, "nack failed");
                    if !shutdown.sleep(self.config.queue_backoff.jittered(outages)).await {
                        return Ok(self.state);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        };

        match outcome {
            NackOutcome::Redeliver { attempt, after } => {
                self.stats.redeliveries += 1;
                warn!(
                    partition = %self.partition,
                    offset = delivery.offset,
                    tab_id = %delivery.event.tab_id,
                    attempt,
                    after_ms = after.as_millis() as u64,
                    %reason,
                    "event returned to queue"
                );
                self.enter(delivery, EventState::Retrying);
                Ok(EventState::Retrying)
            }
            NackOutcome::DeadLettered => {
                if !self.dead_letter(delivery, &reason, shutdown).await? {
                    return Ok(self.state);
                }
                self.stats.rejected += 1;
                self.enter(delivery, EventState::Rejected);
                self.settle(delivery.offset, shutdown).await?;
                Ok(EventState::Rejected)
            }
        }
    }

    /// Durably record a dead letter. Returns false if shutdown came first.
    async fn dead_letter(
        &mut self,
        delivery: &Delivery,
        reason: &NackReason,
        shutdown: &Shutdown,
    ) -> Result<bool> {
        let event = &delivery.event;
        let encoded = encode_event(event).unwrap_or_else(|e| {
            warn!(
                partition = %delivery.partition,
                offset = delivery.offset,
                error = %e,
                "could not encode dead-lettered event, storing it empty"
            );
            Vec::new()
        });
        let letter = DeadLetter {
            partition: delivery.partition,
            offset: delivery.offset,
            tab_id: event.tab_id.clone(),
            origin: event.origin.clone(),
            sequence: event.sequence,
            reason: reason.to_string(),
            attempts: delivery.attempt,
            event: encoded,
            recorded_at: now_millis(),
        };

        error!(
            partition = %delivery.partition,
            offset = delivery.offset,
            tab_id = %event.tab_id,
            origin = %event.origin,
            sequence = event.sequence,
            attempts = delivery.attempt,
            %reason,
            "event dead-lettered"
        );

        let store = &self.store;
        let letter = &letter;
        let recorded = retry_store(&self.config.store_backoff, shutdown, "dead letter", move || {
            store.record_dead_letter(letter)
        })
        .await?;

        Ok(recorded.is_some())
    }

    async fn settle(&mut self, offset: u64, shutdown: &Shutdown) -> Result<()> {
        self.cursor = Some(offset);
        self.unflushed += 1;
        if self.unflushed >= self.config.batch_size.max(1) {
            self.flush_cursor(shutdown).await?;
        }
        Ok(())
    }

    /// Persist the cursor if it moved since the last write.
    pub async fn flush_cursor(&mut self, shutdown: &Shutdown) -> Result<()> {
        let offset = match self.cursor {
            Some(offset) if self.persisted != Some(offset) => offset,
            _ => return Ok(()),
        };

        let cursor = SyncCursor {
            consumer: self.config.consumer.clone(),
            partition: self.partition,
            offset,
            updated_at: now_millis(),
        };

        let store = &self.store;
        let cursor = &cursor;
        let saved = retry_store(&self.config.store_backoff, shutdown, "cursor save", move || {
            store.save_cursor(cursor)
        })
        .await?;

        match saved {
            Some(()) => {
                self.persisted = Some(offset);
                self.unflushed = 0;
                self.stats.cursor_flushes += 1;
                debug!(partition = %self.partition, offset, "cursor persisted");
            }
            None => {
                warn!(
                    partition = %self.partition,
                    persisted = ?self.persisted,
                    settled = offset,
                    "cursor not persisted before shutdown, events will replay"
                );
            }
        }
        Ok(())
    }
}

/// Retry a store operation on transient errors until it succeeds.
///
/// Fatal errors are returned at once. Returns `None` if shutdown interrupts
/// a backoff; when shutdown is already raised the operation is still tried
/// once.
async fn retry_store<T, F, Fut>(
    policy: &BackoffPolicy,
    shutdown: &Shutdown,
    what: &'static str,
    mut op: F,
) -> std::result::Result<Option<T>, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = keepingtab_store::Result<T>>,
{
    let mut failures = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(Some(value)),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = policy.jittered(failures);
                warn!(
                    operation = what,
                    error = %e,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    "store operation failed, retrying"
                );
                if !shutdown.sleep(delay).await {
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::MemoryBroker;
    use crate::queue::QueueConfig;
    use crate::shutdown::{self, ShutdownTrigger};
    use keepingtab_core::{ChangeEvent, Tab, TabId};
    use keepingtab_store::MemoryStore;
    use keepingtab_testkit::FlakyStore;
    use std::sync::Arc;

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(4))
    }

    fn config(batch_size: usize, retry_budget: u32) -> CoordinatorConfig {
        CoordinatorConfig {
            consumer: ConsumerId::new("test"),
            batch_size,
            retry_budget,
            store_backoff: fast_backoff(),
            queue_backoff: fast_backoff(),
        }
    }

    fn broker(max_deliveries: u32) -> MemoryBroker {
        MemoryBroker::new(
            1,
            QueueConfig {
                max_deliveries,
                redelivery_backoff: fast_backoff(),
            },
        )
    }

    fn upsert(id: &str, origin: &str, ts: u64, seq: u64) -> ChangeEvent {
        ChangeEvent::upsert(
            Tab::new(id, origin, ts).with_url(format!("https://example.com/{id}/{ts}")),
            seq,
        )
    }

    async fn coordinator<S: TabStore>(
        store: S,
        broker: &MemoryBroker,
        config: CoordinatorConfig,
    ) -> (Coordinator<S>, ShutdownTrigger, Shutdown) {
        let (trigger, shutdown) = shutdown::channel();
        let coordinator = Coordinator::start(store, broker, PartitionId(0), config, &shutdown)
            .await
            .unwrap()
            .unwrap();
        (coordinator, trigger, shutdown)
    }

    #[tokio::test]
    async fn test_applies_and_acknowledges() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(3);
        broker.publish(upsert("1", "A", 10, 1)).unwrap();

        let (mut coord, _trigger, shutdown) = coordinator(store.clone(), &broker, config(10, 3)).await;
        let state = coord.step(&shutdown).await.unwrap();

        assert_eq!(state, Some(EventState::Acknowledged));
        assert_eq!(coord.cursor(), Some(1));
        assert_eq!(coord.stats().applied, 1);
        let tab = store.get(&TabId::from("1")).await.unwrap().unwrap();
        assert_eq!(tab.url, "https://example.com/1/10");
    }

    #[tokio::test]
    async fn test_cursor_persisted_per_batch() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(3);
        for seq in 1..=3 {
            broker.publish(upsert("1", "A", seq * 10, seq)).unwrap();
        }
        let consumer = ConsumerId::new("test");

        let (mut coord, _trigger, shutdown) = coordinator(store.clone(), &broker, config(2, 3)).await;

        coord.step(&shutdown).await.unwrap();
        assert!(store.load_cursor(&consumer, PartitionId(0)).await.unwrap().is_none());

        coord.step(&shutdown).await.unwrap();
        let cursor = store.load_cursor(&consumer, PartitionId(0)).await.unwrap();
        assert_eq!(cursor.map(|c| c.offset), Some(2));

        coord.step(&shutdown).await.unwrap();
        let cursor = store.load_cursor(&consumer, PartitionId(0)).await.unwrap();
        assert_eq!(cursor.map(|c| c.offset), Some(2));

        coord.flush_cursor(&shutdown).await.unwrap();
        let cursor = store.load_cursor(&consumer, PartitionId(0)).await.unwrap();
        assert_eq!(cursor.map(|c| c.offset), Some(3));
    }

    #[tokio::test]
    async fn test_noops_are_acknowledged() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(3);
        broker.publish(upsert("1", "A", 10, 1)).unwrap();
        broker.publish(upsert("1", "A", 10, 1)).unwrap();
        broker.publish(upsert("1", "A", 5, 2)).unwrap();
        broker.publish(ChangeEvent::delete("ghost", "A", 11, 3)).unwrap();

        let (mut coord, _trigger, shutdown) = coordinator(store.clone(), &broker, config(10, 3)).await;
        for _ in 0..4 {
            assert_eq!(
                coord.step(&shutdown).await.unwrap(),
                Some(EventState::Acknowledged)
            );
        }

        let stats = coord.stats();
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.stale, 1);
        assert_eq!(stats.unknown_deletes, 1);
        assert_eq!(coord.cursor(), Some(4));
        assert!(store.get(&TabId::from("ghost")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_event_is_dead_lettered() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(3);
        broker.publish(upsert("1", "A", 10, 0)).unwrap();
        broker.publish(upsert("2", "A", 10, 2)).unwrap();

        let (mut coord, _trigger, shutdown) = coordinator(store.clone(), &broker, config(10, 3)).await;

        assert_eq!(coord.step(&shutdown).await.unwrap(), Some(EventState::Rejected));
        assert_eq!(coord.cursor(), Some(1));
        assert_eq!(coord.step(&shutdown).await.unwrap(), Some(EventState::Acknowledged));

        let letters = store.list_dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].offset, 1);
        assert_eq!(letters[0].attempts, 1);
        assert!(letters[0].reason.starts_with("invalid"));
        assert_eq!(
            keepingtab_core::decode_event(&letters[0].event).unwrap(),
            upsert("1", "A", 10, 0)
        );
        assert!(store.get(&TabId::from("1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejected_event_passes_through_merging() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(3);
        broker.publish(upsert("1", "A", 10, 0)).unwrap();
        broker.publish(upsert("2", "A", 10, 2)).unwrap();

        let (mut coord, _trigger, shutdown) = coordinator(store, &broker, config(10, 3)).await;

        coord.step(&shutdown).await.unwrap();
        assert_eq!(
            coord.trail(),
            &[EventState::Received, EventState::Merging, EventState::Rejected]
        );
        coord.step(&shutdown).await.unwrap();
        assert_eq!(
            coord.trail(),
            &[
                EventState::Received,
                EventState::Merging,
                EventState::Applying,
                EventState::Acknowledged
            ]
        );
    }

    #[tokio::test]
    async fn test_unstorable_timestamp_is_rejected_without_retry() {
        let store = Arc::new(keepingtab_store::SqliteStore::open_memory().unwrap());
        let broker = broker(3);
        let too_late = keepingtab_core::tab::MAX_LOGICAL_TIME + 1;
        broker.publish(upsert("1", "A", too_late, 1)).unwrap();

        let (mut coord, _trigger, shutdown) = coordinator(store.clone(), &broker, config(10, 3)).await;

        assert_eq!(coord.step(&shutdown).await.unwrap(), Some(EventState::Rejected));
        assert_eq!(coord.stats().retries, 0);
        assert_eq!(coord.stats().redeliveries, 0);

        let letters = store.list_dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 1);
        assert!(letters[0].reason.starts_with("invalid"));
        assert!(store.get(&TabId::from("1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_store_failure_is_retried_in_place() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        store.fail_puts(2);
        let broker = broker(3);
        broker.publish(upsert("1", "A", 10, 1)).unwrap();

        let (mut coord, _trigger, shutdown) = coordinator(store.clone(), &broker, config(10, 3)).await;

        assert_eq!(coord.step(&shutdown).await.unwrap(), Some(EventState::Acknowledged));
        assert_eq!(coord.stats().retries, 2);
        assert!(store.get(&TabId::from("1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_exhausted_retries_redeliver_then_dead_letter() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        store.fail_puts(u32::MAX);
        let broker = broker(2);
        broker.publish(upsert("1", "A", 10, 1)).unwrap();

        let (mut coord, _trigger, shutdown) = coordinator(store.clone(), &broker, config(10, 1)).await;

        assert_eq!(coord.step(&shutdown).await.unwrap(), Some(EventState::Retrying));
        assert_eq!(coord.cursor(), None);
        assert_eq!(coord.step(&shutdown).await.unwrap(), Some(EventState::Rejected));
        assert_eq!(coord.cursor(), Some(1));

        let stats = coord.stats();
        assert_eq!(stats.redeliveries, 1);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.rejected, 1);

        let letters = store.list_dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 2);
        assert!(letters[0].reason.starts_with("transient"));
    }

    #[tokio::test]
    async fn test_fatal_store_error_stops() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        let broker = broker(3);
        broker.publish(upsert("1", "A", 10, 1)).unwrap();

        let (mut coord, _trigger, shutdown) = coordinator(store.clone(), &broker, config(10, 3)).await;
        store.corrupt();

        let err = coord.step(&shutdown).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(coord.cursor(), None);
    }

    #[tokio::test]
    async fn test_conflict_is_merged_again() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        store.put(&Tab::new("1", "B", 20)).await.unwrap();
        store.hide_gets(1);
        let broker = broker(3);
        broker.publish(upsert("1", "A", 10, 1)).unwrap();

        let (mut coord, _trigger, shutdown) = coordinator(store.clone(), &broker, config(10, 3)).await;

        assert_eq!(coord.step(&shutdown).await.unwrap(), Some(EventState::Acknowledged));
        assert_eq!(coord.stats().conflicts, 1);
        assert_eq!(coord.stats().stale, 1);
        let tab = store.get(&TabId::from("1")).await.unwrap().unwrap();
        assert_eq!(tab.origin.as_str(), "B");
    }

    #[tokio::test]
    async fn test_run_flushes_cursor_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(3);
        for seq in 1..=3 {
            broker.publish(upsert(&format!("t{seq}"), "A", 10, seq)).unwrap();
        }

        let (coord, trigger, shutdown) = coordinator(store.clone(), &broker, config(100, 3)).await;
        let task = tokio::spawn(coord.run(shutdown));

        while store.count().await.unwrap() < 3 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        trigger.trigger();

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.cursor, Some(3));
        assert_eq!(report.stats.cursor_flushes, 1);
        let cursor = store
            .load_cursor(&ConsumerId::new("test"), PartitionId(0))
            .await
            .unwrap();
        assert_eq!(cursor.map(|c| c.offset), Some(3));
    }

    #[tokio::test]
    async fn test_start_resumes_after_cursor() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(3);
        broker.publish(upsert("1", "A", 10, 1)).unwrap();
        broker.publish(upsert("2", "A", 10, 2)).unwrap();
        store
            .save_cursor(&SyncCursor {
                consumer: ConsumerId::new("test"),
                partition: PartitionId(0),
                offset: 1,
                updated_at: 0,
            })
            .await
            .unwrap();

        let (mut coord, _trigger, shutdown) = coordinator(store.clone(), &broker, config(10, 3)).await;
        assert_eq!(coord.cursor(), Some(1));
        coord.step(&shutdown).await.unwrap();

        assert_eq!(coord.cursor(), Some(2));
        assert!(store.get(&TabId::from("1")).await.unwrap().is_none());
        assert!(store.get(&TabId::from("2")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_waits_out_queue_outage() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(3);
        broker.set_available(false);

        let (mut coord, _trigger, shutdown) = coordinator(store.clone(), &broker, config(10, 3)).await;

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.set_available(true);
            publisher.publish(upsert("1", "A", 10, 1)).unwrap();
        });

        assert_eq!(coord.step(&shutdown).await.unwrap(), Some(EventState::Acknowledged));
        assert!(coord.stats().queue_outages > 0);
    }

    #[tokio::test]
    async fn test_step_returns_none_after_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(3);
        let (mut coord, trigger, shutdown) = coordinator(store, &broker, config(10, 3)).await;

        trigger.trigger();
        assert_eq!(coord.step(&shutdown).await.unwrap(), None);
    }
}
