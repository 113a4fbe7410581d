//! Backoff for transient execution failures
//!
//! Only transient failures (infrastructure errors, timeouts, lost runs) are
//! retried. Each retry is a new attempt of the same pair, so attempt `n`
//! failing transiently is followed by attempt `n + 1` after
//! [`RetryPolicy::after_attempt`] returns a delay.

use rand::Rng;
use std::time::Duration;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    None,
    Fixed,
    Exponential,

    /// Exponential backoff where half the delay is randomised, so
    /// coordinators retrying the same backend spread out
    ExponentialWithJitter,
}

impl std::str::FromStr for RetryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(RetryStrategy::None),
            "fixed" => Ok(RetryStrategy::Fixed),
            "exponential" => Ok(RetryStrategy::Exponential),
            "exponential_jitter" => Ok(RetryStrategy::ExponentialWithJitter),
            other => Err(format!("unknown retry strategy '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt; a pair gets at most
    /// `max_attempts + 1` attempts per run
    pub max_attempts: u32,

    pub initial_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    pub strategy: RetryStrategy,

    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: RetryStrategy::ExponentialWithJitter,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            strategy: RetryStrategy::None,
            ..Default::default()
        }
    }

    /// Delay before the attempt following `attempt_number` (1-based), or
    /// `None` when retries are exhausted
    pub fn after_attempt(&self, attempt_number: u32) -> Option<Duration> {
        let retries_done = attempt_number.saturating_sub(1);
        self.should_retry(retries_done)
            .then(|| self.calculate_delay(retries_done))
    }

    /// Delay before retry number `retry` (0-based)
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        match self.strategy {
            RetryStrategy::None => Duration::ZERO,
            RetryStrategy::Fixed => self.initial_delay.min(self.max_delay),
            RetryStrategy::Exponential => self.exponential_delay(retry),
            RetryStrategy::ExponentialWithJitter => {
                let full = self.exponential_delay(retry).as_secs_f64();
                if full <= 0.0 {
                    return Duration::ZERO;
                }
                let half = full / 2.0;
                Duration::from_secs_f64(half + rand::thread_rng().gen_range(0.0..=half))
            }
        }
    }

    fn exponential_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Whether another retry is allowed once `retries_done` have been made
    pub fn should_retry(&self, retries_done: u32) -> bool {
        self.strategy != RetryStrategy::None && retries_done < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempts_are_bounded() {
        let policy = RetryPolicy::default();
        assert!(policy.after_attempt(1).is_some());
        assert!(policy.after_attempt(3).is_some());
        assert_eq!(policy.after_attempt(4), None);

        assert_eq!(RetryPolicy::none().after_attempt(1), None);
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy {
            strategy: RetryStrategy::Fixed,
            initial_delay: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(policy.after_attempt(1), Some(Duration::from_secs(5)));
        assert_eq!(policy.after_attempt(2), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            strategy: RetryStrategy::Exponential,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };

        assert_eq!(policy.calculate_delay(0), Duration::from_secs(1));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(4));
        assert_eq!(policy.calculate_delay(8), Duration::from_secs(10));
        assert_eq!(policy.calculate_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_keeps_half_the_backoff() {
        let policy = RetryPolicy::default();
        for retry in 0..5 {
            let full = policy.exponential_delay(retry);
            let delay = policy.calculate_delay(retry);
            assert!(delay >= full / 2, "{delay:?} < half of {full:?}");
            assert!(delay <= full);
        }
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("fixed".parse::<RetryStrategy>(), Ok(RetryStrategy::Fixed));
        assert_eq!(
            "exponential_jitter".parse::<RetryStrategy>(),
            Ok(RetryStrategy::ExponentialWithJitter)
        );
        assert!("linear".parse::<RetryStrategy>().is_err());
    }
}
