use crate::buffer::{QueueError, QueueMetrics, QueueMetricsCollector};
use crate::domain::Event;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, timeout_at};

/// What a producer does when every slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdmissionPolicy {
    /// Wait for the consumer to free a slot. Nothing is ever dropped.
    #[default]
    Block,
    /// Reject the event immediately with `QueueError::Full`.
    DropOnFull,
}

impl AdmissionPolicy {
    pub fn from_drop_flag(drop_events_if_queue_full: bool) -> Self {
        if drop_events_if_queue_full {
            AdmissionPolicy::DropOnFull
        } else {
            AdmissionPolicy::Block
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub policy: AdmissionPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 512,
            policy: AdmissionPolicy::Block,
        }
    }
}

impl QueueConfig {
    /// Slot count actually allocated: the next power of two, never below 2.
    pub fn capacity(&self) -> usize {
        self.max_queue_size.max(2).next_power_of_two()
    }
}

/// An event stamped with its position in the queue.
#[derive(Debug)]
pub struct Sequenced {
    pub sequence: u64,
    pub event: Event,
}

/// Creates a bounded multi-producer, single-consumer event queue.
pub fn event_queue(config: &QueueConfig) -> (EventProducer, EventConsumer) {
    let capacity = config.capacity();
    let (tx, rx) = mpsc::channel(capacity);
    let metrics = Arc::new(QueueMetricsCollector::new());

    let producer = EventProducer {
        tx,
        last_sequence: Arc::new(Mutex::new(0)),
        policy: config.policy,
        capacity,
        metrics: Arc::clone(&metrics),
    };
    let consumer = EventConsumer { rx, metrics };
    (producer, consumer)
}

#[derive(Clone)]
pub struct EventProducer {
    tx: mpsc::Sender<Sequenced>,
    last_sequence: Arc<Mutex<u64>>,
    policy: AdmissionPolicy,
    capacity: usize,
    metrics: Arc<QueueMetricsCollector>,
}

impl EventProducer {
    /// Enqueues under the configured admission policy and returns the
    /// sequence number the event was published with.
    pub async fn enqueue(&self, event: Event) -> Result<u64, QueueError> {
        let permit = match self.policy {
            AdmissionPolicy::DropOnFull => match self.tx.try_reserve() {
                Ok(permit) => permit,
                Err(TrySendError::Full(())) => {
                    self.metrics.record_rejected();
                    return Err(QueueError::Full);
                }
                Err(TrySendError::Closed(())) => return Err(QueueError::Closed),
            },
            AdmissionPolicy::Block => self.tx.reserve().await.map_err(|_| QueueError::Closed)?,
        };
        Ok(self.publish(permit, event))
    }

    /// Waits for a free slot regardless of policy, giving up at `deadline`.
    ///
    /// Used for flush and shutdown, which must not be dropped just because
    /// the queue is momentarily full.
    pub async fn enqueue_until(&self, event: Event, deadline: Instant) -> Result<u64, QueueError> {
        let permit = timeout_at(deadline, self.tx.reserve())
            .await
            .map_err(|_| QueueError::Timeout)?
            .map_err(|_| QueueError::Closed)?;
        Ok(self.publish(permit, event))
    }

    /// Waits for a free slot regardless of policy, without a deadline.
    pub async fn enqueue_waiting(&self, event: Event) -> Result<u64, QueueError> {
        let permit = self.tx.reserve().await.map_err(|_| QueueError::Closed)?;
        Ok(self.publish(permit, event))
    }

    fn publish(&self, permit: mpsc::Permit<'_, Sequenced>, event: Event) -> u64 {
        // Stamping and sending under one lock keeps sequence order equal to
        // dequeue order.
        let mut last = self.last_sequence.lock();
        *last += 1;
        let sequence = *last;
        permit.send(Sequenced { sequence, event });
        drop(last);

        self.metrics.record_enqueued();
        sequence
    }

    /// Sequence number of the most recently published event (0 if none).
    pub fn last_sequence(&self) -> u64 {
        *self.last_sequence.lock()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.metrics.snapshot(self.capacity, self.len())
    }

    #[cfg(test)]
    pub(crate) fn sender(&self) -> &mpsc::Sender<Sequenced> {
        &self.tx
    }
}

pub struct EventConsumer {
    rx: mpsc::Receiver<Sequenced>,
    metrics: Arc<QueueMetricsCollector>,
}

impl EventConsumer {
    /// Waits for the next event. `None` once the queue is drained and either
    /// every producer is gone or it was closed with no slot still reserved.
    pub async fn dequeue(&mut self) -> Option<Sequenced> {
        let next = self.rx.recv().await;
        if next.is_some() {
            self.metrics.record_dequeued();
        }
        next
    }

    pub fn try_dequeue(&mut self) -> Option<Sequenced> {
        let next = self.rx.try_recv().ok();
        if next.is_some() {
            self.metrics.record_dequeued();
        }
        next
    }

    /// Stops admission. Producers waiting for a slot fail with `Closed`.
    /// Events already queued, and those sent through slots reserved before
    /// the close, are still delivered by [`EventConsumer::dequeue`].
    pub fn close(&mut self) {
        self.rx.close();
    }
}
