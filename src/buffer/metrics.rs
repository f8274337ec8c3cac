use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueMetrics {
    pub capacity: usize,
    pub depth: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub rejected: u64,
}

impl QueueMetrics {
    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.depth as f64 / self.capacity as f64
    }
}

#[derive(Debug, Default)]
pub struct QueueMetricsCollector {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    rejected: AtomicU64,
}

impl QueueMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dequeued(&self) {
        self.dequeued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, capacity: usize, depth: usize) -> QueueMetrics {
        QueueMetrics {
            capacity,
            depth,
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}
