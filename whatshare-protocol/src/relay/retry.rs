//! Retry with exponential backoff for relay calls

use crate::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Default number of attempts (first call included)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Delay before the first retry
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);

/// Upper bound for a single delay
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(8);

/// How often and how patiently a transient relay failure is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first call included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Fresh backoff schedule for one operation
    pub fn backoff(&self) -> Backoff {
        Backoff {
            attempt: 0,
            max_retries: self.max_attempts.saturating_sub(1),
            current_delay: self.initial_delay,
            max_delay: self.max_delay,
        }
    }

    /// Sum of all delays when every attempt fails, saturating at
    /// `Duration::MAX`
    ///
    /// Outer deadlines must not be shorter than this window.
    pub fn total_backoff(&self) -> Duration {
        let mut backoff = self.backoff();
        let mut total = Duration::ZERO;

        while let Some(delay) = backoff.next_delay() {
            total = total.saturating_add(delay);
            if delay >= self.max_delay {
                // Capped from here on
                let rest = self.max_delay.saturating_mul(backoff.remaining());
                return total.saturating_add(rest);
            }
        }
        total
    }
}

/// Backoff schedule, doubling the delay after each retry
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    max_retries: u32,
    current_delay: Duration,
    max_delay: Duration,
}

impl Backoff {
    /// Check if more retries are available
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt < self.max_retries
    }

    /// Retries left
    pub fn remaining(&self) -> u32 {
        self.max_retries - self.attempt
    }

    /// Get next delay, or `None` when retries are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.has_attempts_remaining() {
            return None;
        }

        let delay = self.current_delay.min(self.max_delay);
        self.attempt += 1;
        self.current_delay = self.current_delay.saturating_mul(2).min(self.max_delay);

        Some(delay)
    }

    /// Get human-readable status
    pub fn status(&self) -> String {
        format!(
            "Retry {}/{}, next delay: {:?}",
            self.attempt, self.max_retries, self.current_delay
        )
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.next_delay()
    }
}

/// Run `op`, retrying transient failures according to `policy`
///
/// Only errors for which [`ProtocolError::is_transient`](crate::ProtocolError::is_transient)
/// holds are retried; any other error is returned immediately.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = policy.backoff();
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded after {} attempts", operation, attempt);
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() => match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        operation, attempt, policy.max_attempts, e, delay
                    );
                    debug!("{} backoff: {}", operation, backoff.status());
                    sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    error!("{} failed after {} attempts: {}", operation, attempt, e);
                    return Err(e);
                }
            },
            Err(e) => return Err(e),
        }
    }
}
