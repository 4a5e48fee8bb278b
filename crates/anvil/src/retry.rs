// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Exponential backoff for flush retries and bus reconnects.
//!
//! Delay for attempt `n` (1-based) is
//! `min(initial * multiplier^(n-1), max)`, then reduced by a random
//! fraction of up to `jitter` so retries from both sinks do not line up.

use rand::Rng;
use std::time::Duration;

/// Retry budget and backoff shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Delay cap.
    pub max_backoff: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Jitter factor (0.0 - 1.0).
    pub jitter: f64,
    /// Failed attempts allowed before giving up.
    pub max_attempts: u32,
    /// Time since the first failure before giving up.
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: 10,
            max_elapsed: Some(Duration::from_secs(300)),
        }
    }
}

impl RetryPolicy {
    /// Backoff without randomness (used by tests and for logging).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let max = self.max_backoff.as_secs_f64();
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= max {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Backoff to wait after the `attempt`-th consecutive failure.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = 1.0 - rand::thread_rng().gen_range(0.0..=jitter);
        base.mul_f64(factor)
    }

    /// Whether the budget is spent after `attempts` failures spanning `elapsed`.
    pub fn is_exhausted(&self, attempts: u32, elapsed: Duration) -> bool {
        attempts >= self.max_attempts || self.max_elapsed.is_some_and(|max| elapsed >= max)
    }
}

/// Stateful backoff for an unbounded reconnect loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.policy.delay(self.attempt)
    }

    /// Consecutive failures since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Start over after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
