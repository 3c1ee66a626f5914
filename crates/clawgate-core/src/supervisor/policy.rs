//! Exponential-backoff restart policy

use std::time::Duration;

/// Backoff schedule for automatic worker restarts.
///
/// `delay = min(base × 2^attempts, max)`; once `attempts` reaches
/// `max_attempts` auto-restart stops until an explicit operator action
/// resets the counter. A clean shutdown never consults this policy.
#[derive(Debug, Clone)]
pub struct RestartSettings {
    /// First retry delay
    pub base_delay: Duration,
    /// Upper bound on the delay
    pub max_delay: Duration,
    /// Consecutive failures tolerated before giving up
    pub max_attempts: u32,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl RestartSettings {
    /// Delay before the restart following `attempts` prior failures.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another automatic restart may be scheduled.
    #[must_use]
    pub fn may_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = RestartSettings::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RestartSettings::default();
        assert_eq!(policy.delay_for(6), Duration::from_secs(60));
        assert_eq!(policy.delay_for(31), Duration::from_secs(60));
        // Exponent overflow saturates at the cap rather than panicking.
        assert_eq!(policy.delay_for(200), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_budget() {
        let policy = RestartSettings::default();
        assert!(policy.may_retry(0));
        assert!(policy.may_retry(4));
        assert!(!policy.may_retry(5));
        assert!(!policy.may_retry(6));
    }
}
