use std::time::Duration;

use rand::Rng;
use runsync_protocol::BackoffConfig;

/// Largest exponent applied before the cap takes over. 2^20 × any sane initial
/// delay is already far past every realistic cap.
const MAX_EXPONENT: u32 = 20;

/// Exponential reconnect delays with additive jitter.
///
/// `delay(k) = base(k) + base(k) * U(0, jitter_fraction)` where
/// `base(k) = min(cap, initial * 2^k)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    config: BackoffConfig,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Delay before reconnect number `attempt` (1-based).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let fraction = self.jitter_fraction();
        let unit = if fraction > 0.0 {
            rand::rng().random_range(0.0..=1.0)
        } else {
            0.0
        };
        self.delay_with_unit(attempt, unit)
    }

    /// Deterministic form of [`next_delay`](Self::next_delay). `unit` is the
    /// random draw in `[0, 1]`, scaled by the jitter fraction.
    pub fn delay_with_unit(&self, attempt: u32, unit: f64) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = base.as_secs_f64() * self.jitter_fraction() * unit.clamp(0.0, 1.0);
        base + Duration::from_secs_f64(jitter)
    }

    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1_u32 << attempt.min(MAX_EXPONENT);
        self.config
            .initial
            .checked_mul(factor)
            .map_or(self.config.cap, |delay| delay.min(self.config.cap))
    }

    /// Upper bound on any delay this policy returns.
    pub fn max_delay(&self) -> Duration {
        self.config.cap + Duration::from_secs_f64(self.config.cap.as_secs_f64() * self.jitter_fraction())
    }

    fn jitter_fraction(&self) -> f64 {
        self.config.jitter_fraction.clamp(0.0, 1.0)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy::new(BackoffConfig {
            jitter_fraction: 0.0,
            ..BackoffConfig::default()
        })
    }

    #[test]
    fn doubles_from_initial_until_cap() {
        let policy = no_jitter();
        assert_eq!(policy.next_delay(1), Duration::from_millis(1_600));
        assert_eq!(policy.next_delay(2), Duration::from_millis(3_200));
        assert_eq!(policy.next_delay(3), Duration::from_millis(6_400));
        assert_eq!(policy.next_delay(4), Duration::from_millis(12_800));
        assert_eq!(policy.next_delay(5), Duration::from_secs(20));
        assert_eq!(policy.next_delay(6), Duration::from_secs(20));
    }

    #[test]
    fn huge_attempts_do_not_overflow() {
        let policy = no_jitter();
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(20));
    }

    #[test]
    fn jitter_is_additive_and_bounded() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_with_unit(2, 0.0), Duration::from_millis(3_200));
        assert_eq!(policy.delay_with_unit(2, 1.0), Duration::from_millis(4_000));
        assert_eq!(policy.max_delay(), Duration::from_secs(25));
        for attempt in 0..40 {
            let delay = policy.next_delay(attempt);
            assert!(delay >= policy.base_delay(attempt));
            assert!(delay <= policy.max_delay(), "attempt {attempt}: {delay:?}");
        }
    }

    #[test]
    fn lower_bound_never_decreases_with_attempt() {
        let policy = BackoffPolicy::default();
        let mut previous_floor = Duration::ZERO;
        let mut previous_ceiling = Duration::ZERO;
        for attempt in 1..=10 {
            let floor = policy.delay_with_unit(attempt, 0.0);
            let ceiling = policy.delay_with_unit(attempt, 1.0);
            assert!(floor >= previous_floor);
            assert!(ceiling >= previous_ceiling);
            previous_floor = floor;
            previous_ceiling = ceiling;
        }
    }
}
