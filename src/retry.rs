//! C7 — retry policy.
//!
//! Decides, for a failed step, whether to retry at all (transient vs.
//! permanent classification, mirroring the `RetryCondition` split the
//! secondary reference repo's workflow policy module uses) and how long to
//! wait before the next attempt (exponential/linear/constant/fibonacci
//! backoff with jitter).

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::constants::DEFAULT_JITTER_FRACTION;
use crate::error::Error;

/// Backoff shape applied between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BackoffStrategy {
    /// Delay grows as `base * 2^(attempt - 1)`.
    Exponential,
    /// Delay grows as `base * attempt`.
    Linear,
    /// Delay is always `base`.
    Constant,
    /// Delay follows the Fibonacci sequence scaled by `base`.
    Fibonacci,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential
    }
}

/// Decides whether a given error is worth retrying at all, independent of
/// how many attempts remain. `Always`/`Never` are easy overrides for
/// testing or for steps whose handler already classified the failure;
/// `OnTransient` is the default production behavior.
#[derive(Debug, Clone)]
pub enum RetryCondition {
    /// Retry regardless of error kind (bounded only by attempt count).
    Always,
    /// Never retry, regardless of error kind.
    Never,
    /// Retry only errors classified as transient (the default).
    OnTransient,
}

impl Default for RetryCondition {
    fn default() -> Self {
        RetryCondition::OnTransient
    }
}

impl RetryCondition {
    fn allows(&self, error: &Error) -> bool {
        match self {
            RetryCondition::Always => true,
            RetryCondition::Never => false,
            RetryCondition::OnTransient => error.is_retryable(),
        }
    }
}

/// Computes whether and how long to wait before the next attempt at a
/// failed step.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    strategy: BackoffStrategy,
    condition: RetryCondition,
}

impl RetryPolicy {
    /// Build a policy from config with the default exponential-backoff,
    /// transient-only condition.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            strategy: BackoffStrategy::default(),
            condition: RetryCondition::default(),
        }
    }

    /// Override the backoff strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Override the retry condition.
    #[must_use]
    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.condition = condition;
        self
    }

    /// Decide the outcome for a step that just failed on `attempt` (1-based).
    pub fn decide(&self, error: &Error, attempt: u32) -> RetryDecision {
        if attempt >= self.config.max_attempts {
            return RetryDecision::GiveUp;
        }
        if !self.condition.allows(error) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for(attempt))
    }

    /// Compute the backoff delay before the `attempt`-th retry (1-based:
    /// `attempt == 1` is the delay before the second overall try), with
    /// symmetric `±`[`DEFAULT_JITTER_FRACTION`] jitter to avoid synchronized
    /// retry storms across concurrently failing steps without systematically
    /// inflating the delay.
    fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_delay.as_millis() as f64;
        let raw_ms = match self.strategy {
            BackoffStrategy::Constant => base_ms,
            BackoffStrategy::Linear => base_ms * attempt as f64,
            BackoffStrategy::Exponential => base_ms * 2f64.powi(attempt as i32 - 1),
            BackoffStrategy::Fibonacci => base_ms * fibonacci(attempt) as f64,
        };

        let jitter = rand::thread_rng().gen_range(-DEFAULT_JITTER_FRACTION..=DEFAULT_JITTER_FRACTION);
        let jittered_ms = (raw_ms * (1.0 + jitter)).max(0.0);

        let max_ms = self.config.max_delay.as_millis() as f64;
        Duration::from_millis(jittered_ms.min(max_ms) as u64)
    }
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 1..n {
        let next = a + b;
        a = b;
        b = next;
    }
    a
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait the given duration, then retry.
    Retry(Duration),
    /// Stop retrying; the step has permanently failed.
    GiveUp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransientError;

    fn transient() -> Error {
        Error::Transient {
            step: crate::types::StepId::new(),
            source: TransientError::Timeout(Duration::from_secs(1)),
        }
    }

    fn permanent() -> Error {
        Error::Permanent {
            step: crate::types::StepId::new(),
            source: crate::error::PermanentError::InvalidState("bad".into()),
        }
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            ..Default::default()
        });
        assert_eq!(policy.decide(&transient(), 3), RetryDecision::GiveUp);
    }

    #[test]
    fn retries_transient_under_limit() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            ..Default::default()
        });
        assert!(matches!(policy.decide(&transient(), 1), RetryDecision::Retry(_)));
    }

    #[test]
    fn does_not_retry_permanent_by_default() {
        let policy = RetryPolicy::new(RetryConfig::default());
        assert_eq!(policy.decide(&permanent(), 1), RetryDecision::GiveUp);
    }

    #[test]
    fn always_condition_retries_permanent_too() {
        let policy = RetryPolicy::new(RetryConfig::default()).with_condition(RetryCondition::Always);
        assert!(matches!(policy.decide(&permanent(), 1), RetryDecision::Retry(_)));
    }

    #[test]
    fn exponential_delay_grows_with_attempt() {
        let policy = RetryPolicy::new(RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        })
        .with_strategy(BackoffStrategy::Exponential);
        let first = policy.delay_for(1);
        let second = policy.delay_for(2);
        assert!(second > first);
    }

    #[test]
    fn delay_is_capped_at_max_delay() {
        let policy = RetryPolicy::new(RetryConfig {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(1500),
            max_attempts: 20,
        })
        .with_strategy(BackoffStrategy::Exponential);
        assert!(policy.delay_for(10) <= Duration::from_millis(1500));
    }
}
