//! Idle backoff for the processing loop.
//!
//! The manager asks its [`WaitStrategy`] how long to sleep whenever a round
//! transitions nothing, and reports productive rounds through
//! [`WaitStrategy::success`] so the strategy can reset.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Backoff policy for unproductive rounds.
///
/// Methods take `&self`; implementations keep any counters in atomics so a
/// strategy can be shared with tests that observe it.
pub trait WaitStrategy: Send + Sync + 'static {
    /// Milliseconds to sleep before the next round.
    fn retry_in_millis(&self) -> u64;

    /// Called after a round that transitioned at least one entity.
    fn success(&self) {}
}

/// Sleep the same interval every time.
#[derive(Debug, Clone, Copy)]
pub struct FixedWaitStrategy {
    millis: u64,
}

impl FixedWaitStrategy {
    pub fn new(millis: u64) -> Self {
        Self { millis }
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self::new(duration.as_millis() as u64)
    }
}

impl WaitStrategy for FixedWaitStrategy {
    fn retry_in_millis(&self) -> u64 {
        self.millis
    }
}

/// Exponential backoff with optional jitter, reset on success.
///
/// The n-th consecutive idle round waits `base * 2^(n-1)`, capped at `max`,
/// plus up to `jitter` of that value drawn at random.
#[derive(Debug)]
pub struct ExponentialWaitStrategy {
    base_ms: u64,
    max_ms: u64,
    jitter: f64,
    idle_rounds: AtomicU32,
}

impl ExponentialWaitStrategy {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms: max_ms.max(base_ms),
            jitter: 0.0,
            idle_rounds: AtomicU32::new(0),
        }
    }

    /// Add up to `fraction` (0.0..=1.0) of random extra delay.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    /// Deterministic delay for the given attempt number (1-based).
    pub fn delay_for(&self, attempt: u32) -> u64 {
        exponential_delay(self.base_ms, self.max_ms, attempt)
    }

    pub fn idle_rounds(&self) -> u32 {
        self.idle_rounds.load(Ordering::Acquire)
    }
}

impl WaitStrategy for ExponentialWaitStrategy {
    fn retry_in_millis(&self) -> u64 {
        let attempt = self
            .idle_rounds
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        let delay = self.delay_for(attempt);
        if self.jitter > 0.0 {
            let extra = (delay as f64 * self.jitter * fastrand::f64()) as u64;
            delay.saturating_add(extra)
        } else {
            delay
        }
    }

    fn success(&self) {
        self.idle_rounds.store(0, Ordering::Release);
    }
}

/// `base * 2^(attempt-1)` capped at `max`; attempt 0 yields 0.
pub fn exponential_delay(base_ms: u64, max_ms: u64, attempt: u32) -> u64 {
    if attempt == 0 {
        return 0;
    }
    let exponent = (attempt - 1).min(32);
    base_ms
        .saturating_mul(1u64 << exponent)
        .min(max_ms)
}
