use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Backoff sleep interrupted")]
pub struct Interrupted;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    /// Error count at which the delay stops growing.
    pub max_error_exponent: u32,
    /// Relative jitter applied in both directions.
    pub jitter_ratio: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_error_exponent: 6,
            jitter_ratio: 0.1,
        }
    }
}

impl BackoffConfig {
    /// `min(n, max_error_exponent)^2` seconds: 0, 1, 4, 9, 16, 25, 36, 36, ...
    pub fn base_delay(&self, error_count: u64) -> Duration {
        let n = error_count.min(u64::from(self.max_error_exponent));
        Duration::from_secs(n * n)
    }

    pub fn delay(&self, error_count: u64) -> Duration {
        self.apply_jitter(self.base_delay(error_count))
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        let millis = delay.as_millis() as i64;
        let spread = (millis as f64 * self.jitter_ratio) as i64;
        if spread <= 0 {
            return delay;
        }
        let jitter = rand::rng().random_range(0..=2 * spread) - spread;
        Duration::from_millis((millis + jitter).max(0) as u64)
    }
}

/// Backoff state readable from outside the dispatcher.
#[derive(Debug)]
pub struct BackoffState {
    consecutive_errors: AtomicU64,
    backing_off: AtomicBool,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            consecutive_errors: AtomicU64::new(0),
            backing_off: AtomicBool::new(false),
        }
    }

    pub fn consecutive_errors(&self) -> u64 {
        self.consecutive_errors.load(Ordering::Acquire)
    }

    /// `false` while a backoff sleep is in progress.
    pub fn is_healthy(&self) -> bool {
        !self.backing_off.load(Ordering::Acquire)
    }
}

/// Error-count driven backoff for one reporter.
///
/// The sleep listens on the reporter's own cancellation token, so closing
/// one reporter never wakes another one.
pub struct Backoff {
    config: BackoffConfig,
    state: Arc<BackoffState>,
    token: CancellationToken,
}

impl Backoff {
    pub fn new(config: BackoffConfig, token: CancellationToken) -> Self {
        Self {
            config,
            state: Arc::new(BackoffState::new()),
            token,
        }
    }

    pub fn state(&self) -> Arc<BackoffState> {
        Arc::clone(&self.state)
    }

    pub fn consecutive_errors(&self) -> u64 {
        self.state.consecutive_errors()
    }

    pub fn reset(&self) {
        self.state.consecutive_errors.store(0, Ordering::Release);
    }

    /// Counts a failed request and sleeps for the delay earned by the errors
    /// before it, so the first failure in a row does not wait at all.
    pub async fn on_failure(&self) -> Result<(), Interrupted> {
        let previous = self.state.consecutive_errors.fetch_add(1, Ordering::AcqRel);
        let delay = self.config.delay(previous);
        if delay.is_zero() {
            return Ok(());
        }
        if self.token.is_cancelled() {
            return Err(Interrupted);
        }

        tracing::info!(
            "Backing off for {} ms after {} consecutive errors",
            delay.as_millis(),
            previous + 1
        );
        self.state.backing_off.store(true, Ordering::Release);
        let result = tokio::select! {
            () = tokio::time::sleep(delay) => Ok(()),
            () = self.token.cancelled() => Err(Interrupted),
        };
        self.state.backing_off.store(false, Ordering::Release);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_is_capped_square() {
        let config = BackoffConfig::default();
        let seconds: Vec<u64> = (0..10).map(|n| config.base_delay(n).as_secs()).collect();
        assert_eq!(seconds, vec![0, 1, 4, 9, 16, 25, 36, 36, 36, 36]);
    }

    #[test]
    fn test_zero_jitter_ratio_is_exact() {
        let config = BackoffConfig {
            jitter_ratio: 0.0,
            ..Default::default()
        };
        assert_eq!(config.delay(3), Duration::from_secs(9));
    }

    #[tokio::test]
    async fn test_first_failure_does_not_sleep() {
        let backoff = Backoff::new(BackoffConfig::default(), CancellationToken::new());
        let started = std::time::Instant::now();
        assert_eq!(backoff.on_failure().await, Ok(()));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(backoff.consecutive_errors(), 1);

        backoff.reset();
        assert_eq!(backoff.consecutive_errors(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_sleep() {
        let token = CancellationToken::new();
        let backoff = Backoff::new(BackoffConfig::default(), token.clone());
        let state = backoff.state();
        backoff.on_failure().await.unwrap();

        let sleeper = tokio::spawn(async move { backoff.on_failure().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!state.is_healthy());

        token.cancel();
        let result = sleeper.await.unwrap();
        assert_eq!(result, Err(Interrupted));
        assert!(state.is_healthy());
        assert_eq!(state.consecutive_errors(), 2);
    }
}
