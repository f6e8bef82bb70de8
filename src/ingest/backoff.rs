//! Reconnect backoff: exponential with a capped exponent plus uniform jitter.

use rand::Rng;
use std::time::Duration;

use crate::config::StreamSettings;

/// Largest exponent honoured regardless of configuration; keeps the shift in range.
const MAX_EXPONENT: u32 = 31;

#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap_exponent: u32,
    pub max_jitter: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl BackoffPolicy {
    pub fn from_settings(settings: &StreamSettings) -> Self {
        Self {
            base: settings.reconnect_delay,
            cap_exponent: settings.backoff_cap,
            max_jitter: settings.max_jitter,
            max_attempts: settings.max_reconnect_attempts,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based):
    /// `base * 2^min(attempt - 1, cap) + jitter`, jitter in `[0, max_jitter)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt
            .saturating_sub(1)
            .min(self.cap_exponent)
            .min(MAX_EXPONENT);
        let backoff = self.base.saturating_mul(1u32 << exponent);
        backoff.saturating_add(self.jitter())
    }

    /// True once `attempt` is past the configured maximum.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }

    fn jitter(&self) -> Duration {
        let max_micros = self.max_jitter.as_micros().min(u64::MAX as u128) as u64;
        if max_micros == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::thread_rng().gen_range(0..max_micros))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: Option<u32>) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(100),
            cap_exponent: 3,
            max_jitter: Duration::from_millis(50),
            max_attempts,
        }
    }

    #[test]
    fn delay_stays_within_bounds_for_each_attempt() {
        let policy = policy(None);
        for attempt in 1..=8u32 {
            let floor = Duration::from_millis(100) * (1u32 << (attempt - 1).min(3));
            let ceiling = floor + Duration::from_millis(50);
            for _ in 0..50 {
                let delay = policy.delay_for(attempt);
                assert!(delay >= floor, "attempt {attempt}: {delay:?} < {floor:?}");
                assert!(delay < ceiling, "attempt {attempt}: {delay:?} >= {ceiling:?}");
            }
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let policy = BackoffPolicy {
            max_jitter: Duration::ZERO,
            ..policy(None)
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(40), Duration::from_millis(800));
    }

    #[test]
    fn exhausted_only_past_the_cap() {
        let capped = policy(Some(2));
        assert!(!capped.exhausted(1));
        assert!(!capped.exhausted(2));
        assert!(capped.exhausted(3));
        assert!(!policy(None).exhausted(u32::MAX));
    }
}
