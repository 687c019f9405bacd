use rand::Rng;
use std::time::Duration;

/// Exponential backoff for failed notification attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    /// Fraction of the delay added or removed at random, e.g. `0.2` for ±20%.
    pub jitter: f64,
    /// Attempts after which a job is abandoned.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            multiplier: 2.0,
            cap: Duration::from_secs(60 * 60),
            jitter: 0.2,
            max_attempts: 20,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `failures`-th consecutive failure,
    /// without jitter: `base * multiplier^(failures - 1)`, capped.
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.cap.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// [`base_delay`](Self::base_delay) spread by the jitter factor. Jitter is
    /// applied after the cap so capped retries still spread out.
    pub fn delay<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let delay = self.base_delay(failures);
        if self.jitter <= 0.0 {
            return delay;
        }
        let jitter = self.jitter.min(1.0);
        let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
        delay.mul_f64(factor)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(1), Duration::from_secs(30));
        assert_eq!(policy.base_delay(2), Duration::from_secs(60));
        assert_eq!(policy.base_delay(3), Duration::from_secs(120));
        assert_eq!(policy.base_delay(8), Duration::from_secs(3600));
        assert_eq!(policy.base_delay(500), Duration::from_secs(3600));
    }

    #[test]
    fn delays_never_shrink_without_jitter() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        let mut rng = rand::thread_rng();
        let mut previous = Duration::ZERO;
        for k in 1..40 {
            let d = policy.delay(k, &mut rng);
            assert!(d >= previous, "delay {k} shrank: {d:?} < {previous:?}");
            assert!(d <= policy.cap);
            previous = d;
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let d = policy.delay(2, &mut rng).as_secs_f64();
            assert!((48.0..=72.0).contains(&d), "{d}");
        }
    }

    #[test]
    fn exhausted_at_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
    }
}
