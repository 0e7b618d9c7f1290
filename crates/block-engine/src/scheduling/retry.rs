//! Retry budgets for generation jobs and downloads.
//!
//! [`RetryPolicy::decide`] is pure: callers count failures and act on the
//! returned [`RetryDecision`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// delay * 2^(failures-1), capped
    Exponential { max_delay_ms: u64 },
}

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Budget exhausted; mark the item failed.
    GiveUp,
    /// Make the item eligible again after the given delay.
    RetryAfter(Duration),
}

/// Retry budget shared by generation jobs and downloads.
///
/// `max_retries` counts failures: an item that has failed `max_retries`
/// times is given up on, so it is attempted at most `max_retries` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Fixed-delay policy
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    /// Decide what to do after the item's `failures`-th failure (1-based).
    pub fn decide(&self, failures: u32) -> RetryDecision {
        if failures >= self.max_retries {
            return RetryDecision::GiveUp;
        }

        match self.backoff {
            Backoff::Fixed => RetryDecision::RetryAfter(self.delay),
            Backoff::Exponential { max_delay_ms } => {
                let exp = 1u32 << failures.saturating_sub(1).min(8);
                let raw = self.delay.saturating_mul(exp);
                RetryDecision::RetryAfter(raw.min(Duration::from_millis(max_delay_ms)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay_until_budget_exhausted() {
        let p = RetryPolicy::fixed(3, Duration::from_secs(2));
        assert_eq!(p.decide(1), RetryDecision::RetryAfter(Duration::from_secs(2)));
        assert_eq!(p.decide(2), RetryDecision::RetryAfter(Duration::from_secs(2)));
        assert_eq!(p.decide(3), RetryDecision::GiveUp);
        assert_eq!(p.decide(4), RetryDecision::GiveUp);
    }

    #[test]
    fn test_zero_budget_never_retries() {
        let p = RetryPolicy::fixed(0, Duration::from_secs(1));
        assert_eq!(p.decide(1), RetryDecision::GiveUp);
    }

    #[test]
    fn test_exponential_backoff_grows_and_is_capped() {
        let p = RetryPolicy {
            max_retries: 20,
            delay: Duration::from_millis(250),
            backoff: Backoff::Exponential { max_delay_ms: 1_000 },
        };
        assert_eq!(p.decide(1), RetryDecision::RetryAfter(Duration::from_millis(250)));
        assert_eq!(p.decide(2), RetryDecision::RetryAfter(Duration::from_millis(500)));
        assert_eq!(p.decide(10), RetryDecision::RetryAfter(Duration::from_millis(1_000)));
    }
}
