//! Execution policy and retry backoff

use std::time::Duration;

use rand::Rng;

use crate::error::CoreError;

/// Randomization applied on top of a backoff delay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Jitter {
    /// Use the computed delay as is
    #[default]
    None,
    /// Uniform in `[0, delay]`
    Full,
    /// `delay / 2` plus uniform in `[0, delay / 2]`
    Equal,
}

/// Delay growth between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Retry immediately
    None,
    /// Same delay after every attempt
    Constant(Duration),
    /// `step * attempt`, capped at `max`
    Linear { step: Duration, max: Duration },
    /// `base * factor^(attempt - 1)`, capped at `max`
    Exponential {
        base: Duration,
        factor: u32,
        max: Duration,
    },
}

/// Backoff strategy plus jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub strategy: BackoffStrategy,
    pub jitter: Jitter,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential {
                base: Duration::from_secs(1),
                factor: 2,
                max: Duration::from_secs(30),
            },
            jitter: Jitter::Equal,
        }
    }
}

impl Backoff {
    /// No delay between attempts
    #[must_use]
    pub fn none() -> Self {
        Self {
            strategy: BackoffStrategy::None,
            jitter: Jitter::None,
        }
    }

    /// Fixed delay without jitter
    #[must_use]
    pub fn constant(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Constant(delay),
            jitter: Jitter::None,
        }
    }

    /// Set jitter mode
    #[must_use]
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::rng())
    }

    /// Same as [`Backoff::delay`] with a caller-supplied random source
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let attempt = attempt.max(1);
        let base = match self.strategy {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Constant(delay) => delay,
            BackoffStrategy::Linear { step, max } => step.saturating_mul(attempt).min(max),
            BackoffStrategy::Exponential { base, factor, max } => base
                .saturating_mul(factor.saturating_pow(attempt - 1))
                .min(max),
        };

        let millis = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        match self.jitter {
            Jitter::None => base,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=millis)),
            Jitter::Equal => {
                let half = millis / 2;
                Duration::from_millis(half + rng.random_range(0..=millis - half))
            }
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        if let BackoffStrategy::Exponential { factor, .. } = self.strategy
            && factor == 0
        {
            return Err(CoreError::InvalidPolicy(
                "exponential backoff factor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Timeout, retry and concurrency settings shared by every host in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPolicy {
    /// Wall-clock limit for one attempt (connect + run)
    pub timeout: Duration,
    /// Tighter limit for connecting and authenticating, if any
    pub connect_timeout: Option<Duration>,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay between attempts
    pub backoff: Backoff,
    /// Hosts processed at the same time
    pub max_concurrent_hosts: usize,
    /// Limit across all attempts for one host, if any
    pub deadline: Option<Duration>,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            connect_timeout: Some(Duration::from_secs(30)),
            max_retries: 2,
            backoff: Backoff::default(),
            max_concurrent_hosts: 16,
            deadline: None,
        }
    }
}

impl ExecutionPolicy {
    /// Total attempts allowed per host
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Set per-attempt timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set connect timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Option<Duration>) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Set retry count
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set concurrency limit
    #[must_use]
    pub fn with_concurrency(mut self, max_concurrent_hosts: usize) -> Self {
        self.max_concurrent_hosts = max_concurrent_hosts;
        self
    }

    /// Set backoff
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set per-host deadline across attempts
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Reject settings that cannot run
    ///
    /// # Errors
    /// Returns `CoreError::InvalidPolicy` describing the first problem found.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_concurrent_hosts == 0 {
            return Err(CoreError::InvalidPolicy(
                "max_concurrent_hosts must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(CoreError::InvalidPolicy(
                "timeout must be greater than zero".to_string(),
            ));
        }
        if self.connect_timeout.is_some_and(|t| t.is_zero()) {
            return Err(CoreError::InvalidPolicy(
                "connect_timeout must be greater than zero".to_string(),
            ));
        }
        if self.deadline.is_some_and(|d| d.is_zero()) {
            return Err(CoreError::InvalidPolicy(
                "deadline must be greater than zero".to_string(),
            ));
        }
        self.backoff.validate()
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn test_default_policy_is_valid() {
        let policy = ExecutionPolicy::default();
        assert!(policy.validate().is_ok());
        assert_eq!(policy.max_attempts(), 3);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let policy = ExecutionPolicy::default().with_concurrency(0);
        assert!(matches!(
            policy.validate(),
            Err(CoreError::InvalidPolicy(msg)) if msg.contains("max_concurrent_hosts")
        ));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let policy = ExecutionPolicy::default().with_timeout(Duration::ZERO);
        assert!(policy.validate().is_err());

        let policy = ExecutionPolicy {
            connect_timeout: Some(Duration::ZERO),
            ..ExecutionPolicy::default()
        };
        assert!(policy.validate().is_err());

        let policy = ExecutionPolicy::default().with_deadline(Duration::ZERO);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_linear_backoff_caps() {
        let backoff = Backoff {
            strategy: BackoffStrategy::Linear {
                step: Duration::from_secs(2),
                max: Duration::from_secs(5),
            },
            jitter: Jitter::None,
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(3), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_backoff_grows_and_caps() {
        let backoff = Backoff {
            strategy: BackoffStrategy::Exponential {
                base: Duration::from_millis(100),
                factor: 3,
                max: Duration::from_secs(1),
            },
            jitter: Jitter::None,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(300));
        assert_eq!(backoff.delay(3), Duration::from_millis(900));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        assert_eq!(backoff.delay(40), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let full = Backoff::constant(Duration::from_millis(1000)).with_jitter(Jitter::Full);
        let equal = Backoff::constant(Duration::from_millis(1000)).with_jitter(Jitter::Equal);

        for attempt in 1..50 {
            assert!(full.delay_with(attempt, &mut rng) <= Duration::from_millis(1000));

            let d = equal.delay_with(attempt, &mut rng);
            assert!(d >= Duration::from_millis(500));
            assert!(d <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_zero_factor_rejected() {
        let policy = ExecutionPolicy::default().with_backoff(Backoff {
            strategy: BackoffStrategy::Exponential {
                base: Duration::from_secs(1),
                factor: 0,
                max: Duration::from_secs(1),
            },
            jitter: Jitter::None,
        });
        assert!(policy.validate().is_err());
    }
}
