use std::time::Duration;

use crate::config::RetryPolicy;

/// Delays for successive retries: exponential from `base_delay`, capped at
/// `max_delay`, with jitter in the upper half. Yields `max_attempts - 1` delays.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            policy: policy.clone(),
            attempt: 1,
        }
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempt
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let exp = self
            .policy
            .base_delay
            .saturating_mul(1u32 << (self.attempt - 1).min(16));
        let capped = exp.min(self.policy.max_delay);
        self.attempt += 1;
        let jitter = 0.5 + rand::random::<f64>() * 0.5;
        Some(capped.mul_f64(jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        let delays: Vec<_> = Backoff::new(&policy).collect();
        assert_eq!(delays.len(), 4);
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(300)));
        assert!(delays[0] >= Duration::from_millis(50));
    }

    #[test]
    fn single_attempt_policy_never_retries() {
        let policy = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        assert_eq!(Backoff::new(&policy).next(), None);
    }
}
