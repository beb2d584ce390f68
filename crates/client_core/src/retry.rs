use std::{fmt::Display, future::Future, time::Duration};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Exponential { factor: u32, max: Duration },
}

/// Delay schedule shared by reconnects and other timed retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub backoff: Backoff,
    /// `None` retries for as long as the caller keeps asking.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            backoff: Backoff::Fixed,
            max_attempts: None,
        }
    }

    pub fn exponential(delay: Duration, factor: u32, max: Duration) -> Self {
        Self {
            delay,
            backoff: Backoff::Exponential { factor, max },
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay before retry number `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { factor, max } => {
                let multiplier = factor.max(1).saturating_pow(attempt);
                self.delay.saturating_mul(multiplier).min(max)
            }
        }
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

/// Runs `op` until it succeeds or the policy runs out of attempts.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let next = attempt.saturating_add(1);
                if !policy.allows(next) {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                debug!(attempt, ?delay, "retry: attempt failed: {err}");
                tokio::time::sleep(delay).await;
                attempt = next;
            }
        }
    }
}
