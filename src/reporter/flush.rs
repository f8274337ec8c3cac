use crate::domain::FlushTicket;
use crate::reliability::BackoffState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};

/// Upper bound between two health checks while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A flush request that has been queued.
///
/// The flush is complete once the dispatcher's progress watermark reaches
/// the flush event's sequence number, which also means every event queued
/// before it has been handled.
pub struct FlushHandle {
    sequence: u64,
    ticket: FlushTicket,
    progress: watch::Receiver<u64>,
    backoff: Arc<BackoffState>,
}

impl FlushHandle {
    pub(crate) fn new(
        sequence: u64,
        ticket: FlushTicket,
        progress: watch::Receiver<u64>,
        backoff: Arc<BackoffState>,
    ) -> Self {
        Self {
            sequence,
            ticket,
            progress,
            backoff,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_done(&self) -> bool {
        *self.progress.borrow() >= self.sequence
    }

    /// Withdraws the flush. Has no effect once the dispatcher started it.
    pub fn cancel(&self) -> bool {
        self.ticket.cancel()
    }

    /// Waits for the flush to be processed.
    ///
    /// Returns `false` when `deadline` passes first, when the dispatcher
    /// starts backing off, or when it stops without reaching this flush.
    /// A flush that timed out before being started is cancelled.
    pub async fn wait(mut self, deadline: Option<Instant>) -> bool {
        loop {
            if self.is_done() {
                return true;
            }
            if !self.backoff.is_healthy() {
                return false;
            }
            let now = Instant::now();
            let poll = match deadline {
                Some(deadline) if now >= deadline => {
                    self.ticket.cancel();
                    return false;
                }
                Some(deadline) => POLL_INTERVAL.min(deadline - now),
                None => POLL_INTERVAL,
            };

            let dispatcher_gone = tokio::select! {
                changed = self.progress.changed() => changed.is_err(),
                () = sleep(poll) => false,
            };
            if dispatcher_gone {
                return self.is_done();
            }
        }
    }
}
