//! Exponential backoff for endpoint retry waits.
//!
//! When every candidate endpoint has failed, the endpoint service answers a
//! lookup with "retry after N". This module computes N. The protocol state
//! machine never computes delays itself; it only schedules the timer the
//! endpoint service asks for.
//!
//! # Algorithm
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max_delay)
//! ```
//!
//! With the defaults (initial=1s, multiplier=2.0, max=60s):
//! - Round 1: wait 1s
//! - Round 2: wait 2s
//! - Round 3: wait 4s
//! - ...
//! - Round 7+: wait 60s (capped)
//!
//! The schedule retries forever unless an attempt limit is set.

use std::time::Duration;

use thiserror::Error;

use super::config::RetryOptions;

/// Error type for backoff exhaustion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackoffError {
    /// Maximum retry rounds exceeded with the given limit.
    #[error("Maximum number of attempts exceeded: {0}")]
    MaxAttemptLimitError(u32),
}

/// Exponential backoff controller.
///
/// Each call to [`Backoff::next_sleep`] returns the current delay and grows
/// the next one. A successful connection resets it.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt: u32,
    /// Hard limit on retry rounds. `None` retries forever.
    max_attempts: Option<u32>,
}

impl Backoff {
    /// Creates a backoff controller with custom timing parameters.
    ///
    /// A multiplier at or below 1.0 yields a constant delay of `initial`.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay: initial,
            current_delay: initial.min(max),
            max_delay: max,
            multiplier: multiplier.max(1.0),
            attempt: 0,
            max_attempts: None,
        }
    }

    /// Creates a backoff controller from the client's retry options.
    pub fn from_options(options: &RetryOptions) -> Self {
        let mut backoff = Self::new(
            Duration::from_millis(options.initial_delay_ms),
            Duration::from_millis(options.max_delay_ms),
            options.multiplier,
        );
        if let Some(max) = options.max_attempts {
            backoff.set_max_attempts(max);
        }
        backoff
    }

    /// Sets an explicit maximum number of retry rounds.
    pub fn set_max_attempts(&mut self, max: u32) {
        self.max_attempts = Some(max);
    }

    /// Resets the schedule after a successful connection.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay.min(self.max_delay);
        self.attempt = 0;
    }

    /// Returns the next sleep duration and advances the schedule.
    ///
    /// # Errors
    /// Returns [`BackoffError::MaxAttemptLimitError`] once the configured
    /// number of rounds has been used up.
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        self.attempt += 1;
        if let Some(max) = self.max_attempts {
            if self.attempt > max {
                return Err(BackoffError::MaxAttemptLimitError(max));
            }
        }

        let sleep = self.current_delay;
        let next = self.current_delay.as_secs_f64() * self.multiplier;
        self.current_delay = Duration::from_secs_f64(next).min(self.max_delay);

        Ok(sleep)
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The delay the next call to `next_sleep` will return.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

impl Default for Backoff {
    /// 1 second initial delay, doubling, capped at 60 seconds, unlimited rounds.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 2.0)
    }
}
