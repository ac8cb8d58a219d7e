//! Change queue abstraction.
//!
//! The queue delivers [`ChangeEvent`]s per partition with at-least-once
//! semantics. Implementations may sit on Kafka, NATS, SQS or anything that
//! can redeliver; [`memory::MemoryBroker`] is an in-process log for tests
//! and embedding.
//!
//! ## Delivery contract
//!
//! - Events of one partition are delivered in offset order, and all events
//!   of an origin share a partition.
//! - Every delivery is settled with `ack` or `nack` before the next
//!   `receive`.
//! - A nacked delivery that is redelivered holds back the rest of its
//!   partition until it is delivered again.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use keepingtab_core::{ChangeEvent, PartitionId};

use crate::backoff::BackoffPolicy;
use crate::error::QueueError;
use crate::shutdown::Shutdown;

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// One delivery of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Partition the event was read from.
    pub partition: PartitionId,
    /// Position of the event in its partition, starting at 1.
    pub offset: u64,
    /// Delivery attempt, starting at 1.
    pub attempt: u32,
    /// The event.
    pub event: ChangeEvent,
}

/// Why a delivery is being returned to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackReason {
    /// Processing failed for a reason that may go away.
    Transient(String),
    /// The event can never be processed.
    Invalid(String),
}

impl NackReason {
    /// Whether a redelivery may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NackReason::Transient(_))
    }
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NackReason::Transient(reason) => write!(f, "transient: {}", reason),
            NackReason::Invalid(reason) => write!(f, "invalid: {}", reason),
        }
    }
}

/// What the queue does with a nacked delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// The event comes back as `attempt` after `after`.
    Redeliver { attempt: u32, after: Duration },
    /// The queue gave up on the event; the caller owns the dead letter.
    DeadLettered,
}

/// Redelivery settings for a queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Deliveries of one event before it is dead-lettered.
    pub max_deliveries: u32,
    /// Delay schedule between redeliveries.
    pub redelivery_backoff: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_deliveries: 5,
            redelivery_backoff: BackoffPolicy::new(
                Duration::from_millis(200),
                Duration::from_secs(5),
            )
            .with_jitter(0.2),
        }
    }
}

/// A subscription to one partition.
#[async_trait]
pub trait ChangeQueue: Send {
    /// The partition this subscription reads.
    fn partition(&self) -> PartitionId;

    /// Wait for the next delivery.
    ///
    /// Returns `None` once `shutdown` is raised. Cancel-safe: dropping the
    /// future loses no event.
    async fn receive(&mut self, shutdown: &Shutdown) -> Result<Option<Delivery>>;

    /// Settle a delivery as processed.
    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;

    /// Return a delivery to the queue.
    async fn nack(&mut self, delivery: &Delivery, reason: &NackReason) -> Result<NackOutcome>;
}

/// Opens partition subscriptions.
#[async_trait]
pub trait QueueConnector: Send + Sync {
    /// Number of partitions events are spread over.
    fn partition_count(&self) -> u32;

    /// Subscribe to a partition, starting after offset `resume_after`
    /// (or at the beginning).
    async fn subscribe(
        &self,
        partition: PartitionId,
        resume_after: Option<u64>,
    ) -> Result<Box<dyn ChangeQueue>>;
}

/// In-memory partitioned log.
///
/// Events are retained for the broker's lifetime, so a subscription opened
/// after a crash replays everything after its cursor.
pub mod memory {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use tokio::sync::Notify;
    use tokio::time::Instant;

    struct Partition {
        log: Mutex<Vec<ChangeEvent>>,
        notify: Notify,
    }

    struct BrokerShared {
        partitions: Vec<Partition>,
        available: AtomicBool,
        config: QueueConfig,
    }

    impl BrokerShared {
        fn check_available(&self) -> Result<()> {
            if self.available.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(QueueError::Unavailable("broker offline".into()))
            }
        }

        fn read(&self, partition: PartitionId, offset: u64) -> Result<Option<ChangeEvent>> {
            let index = (offset - 1) as usize;
            let log = self.partitions[partition.get() as usize]
                .log
                .lock()
                .map_err(|_| QueueError::Unavailable("partition log poisoned".into()))?;
            Ok(log.get(index).cloned())
        }
    }

    /// In-process broker implementing [`QueueConnector`].
    #[derive(Clone)]
    pub struct MemoryBroker {
        shared: Arc<BrokerShared>,
    }

    impl MemoryBroker {
        /// Create a broker with `partition_count` partitions (at least one).
        pub fn new(partition_count: u32, config: QueueConfig) -> Self {
            let partitions = (0..partition_count.max(1))
                .map(|_| Partition {
                    log: Mutex::new(Vec::new()),
                    notify: Notify::new(),
                })
                .collect();

            Self {
                shared: Arc::new(BrokerShared {
                    partitions,
                    available: AtomicBool::new(true),
                    config,
                }),
            }
        }

        /// Append an event to its origin's partition.
        ///
        /// Returns where it landed.
        pub fn publish(&self, event: ChangeEvent) -> Result<(PartitionId, u64)> {
            self.shared.check_available()?;

            let partition = PartitionId::for_origin(&event.origin, self.partition_count());
            let slot = &self.shared.partitions[partition.get() as usize];
            let offset = {
                let mut log = slot
                    .log
                    .lock()
                    .map_err(|_| QueueError::Unavailable("partition log poisoned".into()))?;
                log.push(event);
                log.len() as u64
            };
            slot.notify.notify_waiters();

            tracing::trace!(partition = %partition, offset, "event published");
            Ok((partition, offset))
        }

        /// Publish events in order.
        pub fn publish_all(
            &self,
            events: impl IntoIterator<Item = ChangeEvent>,
        ) -> Result<Vec<(PartitionId, u64)>> {
            events.into_iter().map(|e| self.publish(e)).collect()
        }

        /// Take the broker offline or bring it back.
        ///
        /// While offline, `publish` and `receive` fail with
        /// [`QueueError::Unavailable`].
        pub fn set_available(&self, available: bool) {
            self.shared.available.store(available, Ordering::SeqCst);
            if available {
                for slot in &self.shared.partitions {
                    slot.notify.notify_waiters();
                }
            }
        }

        /// Number of events retained in a partition.
        pub fn len(&self, partition: PartitionId) -> u64 {
            self.shared
                .partitions
                .get(partition.get() as usize)
                .and_then(|slot| slot.log.lock().ok().map(|log| log.len() as u64))
                .unwrap_or(0)
        }

        /// Check if no partition holds an event.
        pub fn is_empty(&self) -> bool {
            (0..self.partition_count()).all(|p| self.len(PartitionId(p)) == 0)
        }
    }

    #[async_trait]
    impl QueueConnector for MemoryBroker {
        fn partition_count(&self) -> u32 {
            self.shared.partitions.len() as u32
        }

        async fn subscribe(
            &self,
            partition: PartitionId,
            resume_after: Option<u64>,
        ) -> Result<Box<dyn ChangeQueue>> {
            if partition.get() >= self.partition_count() {
                return Err(QueueError::UnknownPartition {
                    partition,
                    count: self.partition_count(),
                });
            }

            Ok(Box::new(MemoryConsumer {
                shared: Arc::clone(&self.shared),
                partition,
                next_offset: resume_after.unwrap_or(0) + 1,
                in_flight: None,
                redelivery: None,
            }))
        }
    }

    struct Redelivery {
        delivery: Delivery,
        ready_at: Instant,
    }

    /// Subscription handed out by [`MemoryBroker`].
    struct MemoryConsumer {
        shared: Arc<BrokerShared>,
        partition: PartitionId,
        /// Next never-delivered offset.
        next_offset: u64,
        in_flight: Option<u64>,
        redelivery: Option<Redelivery>,
    }

    impl MemoryConsumer {
        fn settle(&mut self, delivery: &Delivery) -> Result<()> {
            match self.in_flight {
                Some(offset) if offset == delivery.offset => {
                    self.in_flight = None;
                    Ok(())
                }
                _ => Err(QueueError::NotInFlight {
                    partition: self.partition,
                    offset: delivery.offset,
                }),
            }
        }
    }

    #[async_trait]
    impl ChangeQueue for MemoryConsumer {
        fn partition(&self) -> PartitionId {
            self.partition
        }

        async fn receive(&mut self, shutdown: &Shutdown) -> Result<Option<Delivery>> {
            if shutdown.is_triggered() {
                return Ok(None);
            }

            if let Some(pending) = self.redelivery.take() {
                if !shutdown.sleep_until(pending.ready_at).await {
                    self.redelivery = Some(pending);
                    return Ok(None);
                }
                self.in_flight = Some(pending.delivery.offset);
                return Ok(Some(pending.delivery));
            }

            let slot = &self.shared.partitions[self.partition.get() as usize];
            loop {
                self.shared.check_available()?;

                // Register interest before looking so a publish in between
                // is not missed.
                let notified = slot.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(event) = self.shared.read(self.partition, self.next_offset)? {
                    let delivery = Delivery {
                        partition: self.partition,
                        offset: self.next_offset,
                        attempt: 1,
                        event,
                    };
                    self.next_offset += 1;
                    self.in_flight = Some(delivery.offset);
                    return Ok(Some(delivery));
                }

                tokio::select! {
                    _ = &mut notified => {}
                    _ = shutdown.wait() => return Ok(None),
                }
            }
        }

        async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
            self.settle(delivery)
        }

        async fn nack(&mut self, delivery: &Delivery, reason: &NackReason) -> Result<NackOutcome> {
            self.settle(delivery)?;

            let config = &self.shared.config;
            if !reason.is_retryable() || delivery.attempt >= config.max_deliveries {
                return Ok(NackOutcome::DeadLettered);
            }

            let attempt = delivery.attempt + 1;
            let after = config.redelivery_backoff.jittered(delivery.attempt);
            self.redelivery = Some(Redelivery {
                delivery: Delivery {
                    attempt,
                    ..delivery.clone()
                },
                ready_at: Instant::now() + after,
            });

            Ok(NackOutcome::Redeliver { attempt, after })
        }
    }
}
