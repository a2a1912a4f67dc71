use crate::stream::types::LinkConfig;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Linear backoff shared by the connect-failure and post-close retry loops.
///
/// The counter holds the number of the next attempt. It starts at 1, grows by
/// one per failed attempt or unexpected close, and returns to 1 once a
/// connection is confirmed, so the Nth consecutive wait is `N * base_delay`.
/// There is no jitter; an optional cap bounds a single wait.
#[derive(Debug)]
pub struct RetryController {
    base_delay: Duration,
    max_delay: Option<Duration>,
    attempt: AtomicU32,
}

impl RetryController {
    pub fn new(base_delay: Duration, max_delay: Option<Duration>) -> Self {
        Self {
            base_delay,
            max_delay,
            attempt: AtomicU32::new(1),
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_base_delay_ms),
            config.retry_max_delay_ms.map(Duration::from_millis),
        )
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let linear = self.base_delay.saturating_mul(attempt.max(1));
        match self.max_delay {
            Some(cap) => linear.min(cap),
            None => linear,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::Acquire)
    }

    /// Returns the wait for the pending attempt and advances the counter.
    pub fn next_delay(&self) -> (u32, Duration) {
        let attempt = match self
            .attempt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(1))
            }) {
            Ok(previous) | Err(previous) => previous,
        };
        (attempt, self.delay(attempt))
    }

    pub fn reset(&self) {
        self.attempt.store(1, Ordering::Release);
    }
}
