//! Retry backoff policy.

use std::time::Duration;

const DEFAULT_INITIAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX: Duration = Duration::from_secs(600);
const DEFAULT_FACTOR: f64 = 2.0;

/// Exponential backoff between failed attempts, optionally jittered.
///
/// The delay after the `n`th failed attempt (1-based) is
/// `initial * factor^(n - 1)`, capped at `max`. With jitter enabled the
/// delay is scaled into `[delay / 2, delay)` using a deterministic
/// per-job seed, so concurrent pollers spread out without needing an RNG.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL,
            factor: DEFAULT_FACTOR,
            max: DEFAULT_MAX,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// A constant delay between attempts.
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            factor: 1.0,
            max: delay,
            jitter: false,
        }
    }

    /// Delay before the job may run again after `attempts` failed attempts.
    pub fn delay(&self, attempts: u32, seed: u64) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max_ms = self.max.as_millis() as f64;
        let mut delay_ms = (self.initial.as_millis() as f64 * self.factor.powi(exponent)).min(max_ms);

        if self.jitter {
            let mut mixed = seed ^ (u64::from(attempts) << 32);
            mixed = mixed.wrapping_mul(6364136223846793005).wrapping_add(1);
            let frac = ((mixed >> 32) as f64) / (u32::MAX as f64);
            delay_ms = delay_ms / 2.0 + delay_ms / 2.0 * frac;
        }

        if !delay_ms.is_finite() || delay_ms < 0.0 {
            return self.max;
        }
        Duration::from_millis(delay_ms.round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_until_capped() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_millis(500),
            jitter: false,
        };
        assert_eq!(policy.delay(1, 0), Duration::from_millis(100));
        assert_eq!(policy.delay(2, 0), Duration::from_millis(200));
        assert_eq!(policy.delay(3, 0), Duration::from_millis(400));
        assert_eq!(policy.delay(4, 0), Duration::from_millis(500));
        assert_eq!(policy.delay(40, 0), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(1000),
            factor: 1.0,
            max: Duration::from_secs(10),
            jitter: true,
        };
        for seed in [0u64, 1, 42, u64::MAX, 0xdead_beef] {
            let delay = policy.delay(1, seed);
            assert!(delay >= Duration::from_millis(500), "{delay:?}");
            assert!(delay <= Duration::from_millis(1000), "{delay:?}");
        }
    }

    #[test]
    fn jitter_is_deterministic_per_seed() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(3, 7), policy.delay(3, 7));
    }
}
