//! # Reconnect Policies
//!
//! A policy is asked once per unexpected close. It receives the number of
//! reconnect attempts already made since the last successful open and answers
//! with the delay before the next attempt, or `None` to give up.
//!
//! The default is [`FixedInterval`]: 5000 ms between attempts, at most 5
//! attempts, no jitter. [`ExponentialBackoff`] is available for callers that
//! want the delay to grow.

use rand::Rng;
use std::fmt;
use std::time::Duration;

/// Default delay between two reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);
/// Default bound on automatic reconnect attempts.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Decides whether and when to retry after an unexpected close.
pub trait ReconnectPolicy: fmt::Debug + Send + Sync {
    /// `attempts` is the number of reconnects already made since the last
    /// successful open. `None` means the connection is exhausted.
    fn next_delay(&self, attempts: u32) -> Option<Duration>;
}

/// Same delay before every attempt, bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedInterval {
    /// Delay before each attempt.
    pub interval: Duration,
    /// Attempts allowed before giving up.
    pub max_attempts: u32,
}

impl FixedInterval {
    /// Creates a fixed-interval policy.
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }
}

impl Default for FixedInterval {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_INTERVAL, DEFAULT_MAX_RECONNECT_ATTEMPTS)
    }
}

impl ReconnectPolicy for FixedInterval {
    fn next_delay(&self, attempts: u32) -> Option<Duration> {
        (attempts < self.max_attempts).then_some(self.interval)
    }
}

/// Doubling delay capped at `max_delay`, with optional full jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Delay before the first attempt.
    pub base: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Attempts allowed before giving up.
    pub max_attempts: u32,
    /// Pick the delay uniformly from `[0, computed]` instead of `computed`.
    pub jitter: bool,
}

impl ExponentialBackoff {
    /// Creates a backoff policy without jitter.
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay,
            max_attempts,
            jitter: false,
        }
    }

    /// Enables full jitter.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    fn ceiling(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts);
        self.base.saturating_mul(factor).min(self.max_delay)
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&self, attempts: u32) -> Option<Duration> {
        if attempts >= self.max_attempts {
            return None;
        }
        let ceiling = self.ceiling(attempts);
        if !self.jitter {
            return Some(ceiling);
        }
        let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        Some(Duration::from_millis(rand::rng().random_range(0..=ceiling_ms)))
    }
}
