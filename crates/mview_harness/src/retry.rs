//! Bounded retry schedule.
//!
//! Callers own the comparison; the schedule only decides how many more
//! attempts are allowed and how long to wait before each one.

use std::time::Duration;

use serde::Serialize;

/// Delay inserted before each retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately (busy polling).
    None,
    Fixed { delay: Duration },
    /// Doubles from `initial` up to `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::None => Duration::ZERO,
            Self::Fixed { delay } => delay,
            Self::Exponential { initial, max } => {
                let shift = attempt.saturating_sub(1).min(31);
                initial.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn busy(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::None,
        }
    }

    pub fn schedule(&self) -> RetrySchedule {
        RetrySchedule {
            policy: *self,
            used: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::busy(100)
    }
}

/// Hands out retry numbers `1..=max_retries`, sleeping the backoff first.
#[derive(Debug)]
pub struct RetrySchedule {
    policy: RetryPolicy,
    used: u32,
}

impl RetrySchedule {
    /// Wait for the next retry slot, or `None` once the budget is spent.
    pub async fn next_attempt(&mut self) -> Option<u32> {
        if self.used >= self.policy.max_retries {
            return None;
        }
        self.used += 1;
        let delay = self.policy.backoff.delay(self.used);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Some(self.used)
    }

    /// Retries handed out so far.
    pub fn used(&self) -> u32 {
        self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(2), Duration::from_millis(20));
        assert_eq!(backoff.delay(3), Duration::from_millis(40));
        assert_eq!(backoff.delay(4), Duration::from_millis(50));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn schedule_yields_exactly_max_retries() {
        let mut schedule = RetryPolicy::busy(3).schedule();
        let mut seen = Vec::new();
        while let Some(attempt) = schedule.next_attempt().await {
            seen.push(attempt);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(schedule.used(), 3);
        assert_eq!(schedule.next_attempt().await, None);
    }

    #[tokio::test]
    async fn zero_budget_never_retries() {
        let mut schedule = RetryPolicy::busy(0).schedule();
        assert_eq!(schedule.next_attempt().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_backoff_sleeps_between_attempts() {
        let policy = RetryPolicy {
            max_retries: 2,
            backoff: Backoff::Fixed {
                delay: Duration::from_secs(5),
            },
        };
        let started = tokio::time::Instant::now();
        let mut schedule = policy.schedule();
        while schedule.next_attempt().await.is_some() {}
        assert!(started.elapsed() >= Duration::from_secs(10));
    }
}
