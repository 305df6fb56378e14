//! Fixed-interval retry policy for the delivery-redelivery layer.
//!
//! Redelivery runs in-process: the observable contract is a fixed delay
//! between a bounded number of attempts, with the SMIR rate-limited class
//! optionally exempt so its failure handling fires on first occurrence.

use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::models::FailureClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    interval: Duration,
    retries_smir: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, interval: Duration, retries_smir: bool) -> Self {
        RetryPolicy {
            max_retries,
            interval,
            retries_smir,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.retries, config.retries_interval, config.retries_smir)
    }

    /// Redelivery attempts remaining after the initial failure, for the
    /// given failure class. Zero means the failure handler fires at once.
    pub fn redeliveries_for(&self, class: FailureClass) -> u32 {
        match class {
            FailureClass::DependencyRateLimited if !self.retries_smir => 0,
            _ => self.max_retries,
        }
    }

    /// Fixed delay applied before each redelivery attempt.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_failures_get_configured_retries() {
        let policy = RetryPolicy::new(2, Duration::from_millis(300_000), false);
        assert_eq!(policy.redeliveries_for(FailureClass::Generic), 2);
    }

    #[test]
    fn test_smir_exempt_when_retries_smir_disabled() {
        let policy = RetryPolicy::new(2, Duration::from_millis(300_000), false);
        assert_eq!(
            policy.redeliveries_for(FailureClass::DependencyRateLimited),
            0
        );
    }

    #[test]
    fn test_smir_retries_when_enabled() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), true);
        assert_eq!(
            policy.redeliveries_for(FailureClass::DependencyRateLimited),
            3
        );
    }

    #[test]
    fn test_zero_retries_means_immediate_dead_letter() {
        let policy = RetryPolicy::new(0, Duration::from_millis(100), true);
        assert_eq!(policy.redeliveries_for(FailureClass::Generic), 0);
    }

    #[test]
    fn test_interval_is_fixed() {
        let policy = RetryPolicy::new(5, Duration::from_millis(250), false);
        assert_eq!(policy.interval(), Duration::from_millis(250));
    }
}
