// Reporter counters shared between producers, the dispatcher and readers.
//
// Everything is a relaxed atomic: readers want a recent value, not a
// consistent cut across fields.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ReporterStats {
    reported: AtomicU64,
    dropped: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    bytes_sent: AtomicU64,
}

impl ReporterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_reported(&self, count: u64) {
        self.reported.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a completed request and the body bytes it streamed
    pub fn record_request(&self, success: bool, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        if success {
            self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn reported(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, consecutive_errors: u64) -> StatsSnapshot {
        StatsSnapshot {
            reported: self.reported(),
            dropped: self.dropped(),
            requests_succeeded: self.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            consecutive_errors,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub reported: u64,
    pub dropped: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub bytes_sent: u64,
    pub consecutive_errors: u64,
}

impl StatsSnapshot {
    /// Fraction of completed requests that succeeded (1.0 before the first one)
    pub fn success_rate(&self) -> f64 {
        let total = self.requests_succeeded + self.requests_failed;
        if total == 0 {
            return 1.0;
        }
        self.requests_succeeded as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_basic_operations() {
        let stats = ReporterStats::new();
        stats.add_reported(3);
        stats.add_dropped(1);
        stats.record_request(true, 1024);
        stats.record_request(false, 512);

        let snapshot = stats.snapshot(2);
        assert_eq!(snapshot.reported, 3);
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(snapshot.bytes_sent, 1536);
        assert_eq!(snapshot.consecutive_errors, 2);
        assert!((snapshot.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_concurrent_access() {
        let stats = Arc::new(ReporterStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..100 {
                        stats.add_dropped(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.dropped(), 800);
    }
}
