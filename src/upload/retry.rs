//! Retry backoff policy for chunk delivery.
//!
//! The chunk loop in [`super::transfer`] is an explicit loop driven by this
//! policy value rather than a retry combinator: between attempts the engine
//! has to probe the session and reconcile offsets, which a wrapped closure
//! cannot express cleanly.

use std::time::Duration;

use rand::Rng;
use tokio_retry::strategy::ExponentialBackoff;

use crate::config::{
    CHUNK_MAX_ATTEMPTS, RETRY_BASE_DELAY_MS, RETRY_JITTER_FRACTION, RETRY_MAX_DELAY_MS,
};

/// Backoff configuration driving a bounded retry loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts allowed (the first send counts as attempt 1).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling applied to the exponentially growing delay.
    pub max_delay: Duration,
    /// Jitter applied symmetrically to every delay, as a fraction of it.
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: CHUNK_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(RETRY_MAX_DELAY_MS),
            jitter_fraction: RETRY_JITTER_FRACTION,
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after the given number of failed attempts.
    ///
    /// Doubles from `base_delay`, capped at `max_delay`, with
    /// `±jitter_fraction` of spread so simultaneous transfers do not
    /// retry in lockstep.
    #[must_use]
    pub fn delay_after(&self, failures: u32) -> Duration {
        let raw = ExponentialBackoff::from_millis(2)
            .factor(self.base_delay.as_millis() as u64 / 2)
            .max_delay(self.max_delay)
            .nth(failures.saturating_sub(1) as usize)
            .unwrap_or(self.max_delay);
        self.jittered(raw)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_fraction <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter_fraction..=self.jitter_fraction);
        delay.mul_f64(1.0 + spread)
    }
}
