//! Retry policy: when a finished attempt gets another go, and after how long.
//!
//! Attempts are numbered from 1. After each attempt the policy decides:
//!
//! ```text
//!                    outcome in retry_on
//!                    and attempt < max_attempts
//! Pending(n) ─► Running(n) ───────────────────────► Pending(n+1) after backoff(n)
//!                    │
//!                    └── otherwise ──► Finalized
//! ```
//!
//! `backoff(n)` is `initial_backoff × multiplier^(n-1)`, capped at
//! `max_backoff`. With jitter enabled each delay is drawn uniformly from
//! the upper half of that value.

use std::time::Duration;

use rand::Rng;

use crate::suite::Outcome;

/// Retry policy for a test case.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, first one included. Never below 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    pub jitter: bool,
    /// Outcomes that may be retried.
    pub retry_on: Vec<Outcome>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
            jitter: false,
            retry_on: vec![Outcome::Failed, Outcome::TimedOut, Outcome::Errored],
        }
    }
}

/// What happens after an attempt finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Run attempt `attempt` once `delay` has passed.
    Retry { attempt: u32, delay: Duration },
    /// The attempt just recorded is the last one.
    Finalize,
}

impl RetryPolicy {
    /// Decides what follows attempt `attempt` ending with `outcome`.
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use lisa::orchestrator::retry::{NextStep, RetryPolicy};
    /// use lisa::suite::Outcome;
    ///
    /// let policy = RetryPolicy { max_attempts: 2, ..Default::default() };
    /// assert_eq!(
    ///     policy.next(1, Outcome::TimedOut),
    ///     NextStep::Retry { attempt: 2, delay: Duration::from_secs(1) }
    /// );
    /// assert_eq!(policy.next(2, Outcome::TimedOut), NextStep::Finalize);
    /// assert_eq!(policy.next(1, Outcome::Passed), NextStep::Finalize);
    /// ```
    pub fn next(&self, attempt: u32, outcome: Outcome) -> NextStep {
        if attempt >= self.max_attempts || !self.retry_on.contains(&outcome) {
            return NextStep::Finalize;
        }
        NextStep::Retry {
            attempt: attempt + 1,
            delay: self.backoff(attempt),
        }
    }

    /// Delay before the attempt following attempt `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_backoff.as_nanos() as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = base.min(self.max_backoff.as_nanos() as f64);
        let nanos = if self.jitter && capped > 0.0 {
            rand::thread_rng().gen_range(capped / 2.0..=capped)
        } else {
            capped
        };
        Duration::from_nanos(nanos as u64)
    }
}
