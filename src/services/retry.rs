//! Retry policy shared by every broker implementation.

use std::time::Duration;

/// Delay before the first retry.
pub const BASE_BACKOFF: Duration = Duration::from_secs(2);

/// Upper bound on a single backoff delay, so a large attempt number cannot overflow.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Delay between attempt `attempt` failing and attempt `attempt + 1` starting.
///
/// `2 * 2^(attempt - 1)` seconds: 2s after the first failure, 4s after the
/// second, 8s after the third. Attempt numbers start at 1; 0 is treated as 1.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.max(1) - 1;
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    let secs = BASE_BACKOFF.as_secs().saturating_mul(factor);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

/// Whether a job that has just failed its `attempt`-th try gets another one.
pub fn should_retry(attempt: u32, max_attempts: u32) -> bool {
    attempt < max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        for n in 1..10 {
            assert_eq!(backoff_delay(n + 1), backoff_delay(n) * 2);
        }
    }

    #[test]
    fn test_backoff_zero_and_cap() {
        assert_eq!(backoff_delay(0), backoff_delay(1));
        assert_eq!(backoff_delay(40), MAX_BACKOFF);
        assert_eq!(backoff_delay(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn test_should_retry_budget() {
        assert!(should_retry(1, 3));
        assert!(should_retry(2, 3));
        assert!(!should_retry(3, 3));
        assert!(should_retry(1, 2));
        assert!(!should_retry(2, 2));
    }
}
