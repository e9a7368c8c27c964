//! Bounded retry policy for transient source failures.
//!
//! An explicit policy object rather than ad hoc sleep loops, so the delay
//! schedule is testable without any network in sight.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Jitter as a fraction of the capped delay (0.3 = ±30%).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Deterministic delay for a zero-based attempt index, before jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay with jitter applied, floored at the base delay so thundering
    /// herds spread out without collapsing to zero.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let capped = self.delay_for(attempt).as_millis() as f64;
        let jitter_range = capped * self.jitter_factor;
        let jitter = (rand::thread_rng().gen::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_ms = (capped + jitter).max(self.base_delay.as_millis() as f64);
        Duration::from_millis(final_ms as u64)
    }

    pub fn attempts_exhausted(&self, attempt: u32) -> bool {
        attempt + 1 >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_geometrically_until_the_cap() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(500),
            jitter_factor: 0.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(5), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_band_and_above_base() {
        let policy = RetryPolicy {
            jitter_factor: 0.3,
            ..RetryPolicy::default()
        };
        for attempt in 0..4 {
            let nominal = policy.delay_for(attempt).as_millis() as f64;
            for _ in 0..50 {
                let d = policy.jittered_delay(attempt).as_millis() as f64;
                assert!(d >= policy.base_delay.as_millis() as f64);
                assert!(d <= nominal * 1.3 + 1.0);
            }
        }
    }

    #[test]
    fn exhaustion_matches_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        assert!(!policy.attempts_exhausted(0));
        assert!(!policy.attempts_exhausted(1));
        assert!(policy.attempts_exhausted(2));
    }
}
