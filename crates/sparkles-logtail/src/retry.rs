//! Retry policy for transient `ReadOutput` failures.
//!
//! The decision to retry or give up is a pure function of the number of
//! consecutive failures and the time spent failing; randomness only enters
//! through [`RetryPolicy::jittered`].

use std::time::Duration;

use rand::Rng;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then repeat the identical request.
    Retry(Duration),
    GiveUp,
}

/// Capped exponential backoff with optional jitter and a retry ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Consecutive failed attempts after which we give up. `None` never gives up on count.
    pub max_attempts: Option<u32>,
    /// Time spent in consecutive failures after which we give up.
    pub max_elapsed: Option<Duration>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(10),
            max_elapsed: Some(Duration::from_secs(300)),
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Retry without delay, giving up after `max_attempts` consecutive failures.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            max_elapsed: None,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Never give up, but keep backing off.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            max_elapsed: None,
            ..Self::default()
        }
    }

    /// Delay before retrying after the `attempt`-th consecutive failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_nanos() as f64 * self.multiplier.max(1.0).powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_nanos() as f64 {
            return self.max_delay.max(self.initial_delay);
        }
        Duration::from_nanos(scaled as u64)
    }

    /// Decide after the `attempt`-th consecutive failure, `elapsed` since the first one.
    pub fn decide(&self, attempt: u32, elapsed: Duration) -> RetryDecision {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return RetryDecision::GiveUp;
        }
        if self.max_elapsed.is_some_and(|max| elapsed >= max) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.backoff(attempt))
    }

    /// Spread `delay` over `[delay/2, delay]` when jitter is enabled.
    pub fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let half = delay / 2;
        let extra = rand::rng().random_range(0..=half.as_nanos() as u64);
        half + Duration::from_nanos(extra)
    }
}
