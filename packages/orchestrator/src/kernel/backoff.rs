//! Retry decision and backoff computation.
//!
//! A pure function of the attempt count and failure kind; the queue
//! manager applies the result, nothing here touches state.

use std::time::Duration;

use rand::Rng;

use crate::common::ErrorKind;

pub const BACKOFF_BASE: Duration = Duration::from_secs(2);
pub const BACKOFF_CAP: Duration = Duration::from_secs(300);
pub const BACKOFF_JITTER: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    fn no() -> Self {
        Self {
            should_retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// Decide whether a failed attempt is retried and how long to wait:
/// `min(cap, base * 2^retry_count)`, spread by ±30% jitter.
pub fn retry_decision(retry_count: i32, max_retries: i32, kind: ErrorKind) -> RetryDecision {
    if !kind.retries_job() || retry_count >= max_retries {
        return RetryDecision::no();
    }
    RetryDecision {
        should_retry: true,
        delay: jittered(exponential_delay(retry_count)),
    }
}

/// The un-jittered exponential step.
pub fn exponential_delay(retry_count: i32) -> Duration {
    let shift = retry_count.clamp(0, 30) as u32;
    let scaled = BACKOFF_BASE.saturating_mul(1u32 << shift.min(20));
    scaled.min(BACKOFF_CAP)
}

fn jittered(delay: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(-BACKOFF_JITTER..=BACKOFF_JITTER);
    delay.mul_f64(factor.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_retry_is_near_the_base() {
        let decision = retry_decision(0, 3, ErrorKind::Transient);
        assert!(decision.should_retry);
        assert!(decision.delay >= BACKOFF_BASE.mul_f64(1.0 - BACKOFF_JITTER));
        assert!(decision.delay <= BACKOFF_BASE.mul_f64(1.0 + BACKOFF_JITTER));
    }

    #[test]
    fn delay_doubles_per_attempt() {
        assert_eq!(exponential_delay(0), Duration::from_secs(2));
        assert_eq!(exponential_delay(1), Duration::from_secs(4));
        assert_eq!(exponential_delay(2), Duration::from_secs(8));
        assert_eq!(exponential_delay(5), Duration::from_secs(64));
    }

    #[test]
    fn delay_caps_at_five_minutes() {
        assert_eq!(exponential_delay(8), BACKOFF_CAP);
        assert_eq!(exponential_delay(30), BACKOFF_CAP);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for retry_count in 0..8 {
            let raw = exponential_delay(retry_count);
            for _ in 0..50 {
                let decision = retry_decision(retry_count, 10, ErrorKind::Timeout);
                assert!(decision.delay >= raw.mul_f64(1.0 - BACKOFF_JITTER));
                assert!(decision.delay <= raw.mul_f64(1.0 + BACKOFF_JITTER));
            }
        }
    }

    #[test]
    fn non_retriable_kinds_never_retry() {
        for kind in [
            ErrorKind::Invalid,
            ErrorKind::Cancelled,
            ErrorKind::Fatal,
            ErrorKind::NotFound,
        ] {
            assert!(!retry_decision(0, 3, kind).should_retry);
        }
    }

    #[test]
    fn exhausted_budget_never_retries() {
        assert!(!retry_decision(3, 3, ErrorKind::Transient).should_retry);
        assert!(!retry_decision(4, 3, ErrorKind::Transient).should_retry);
    }
}
