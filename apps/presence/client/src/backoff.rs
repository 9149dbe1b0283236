//! Exponential backoff shared by the socket reconnect loop and the location
//! sampler's transient-error retries.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
    /// Fraction of the exponential delay added as uniform random jitter.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 10,
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.max(0.0);
        self
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// `base * 2^attempt`, before jitter and cap.
    pub fn exponential(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exp = self.exponential(attempt).min(self.cap);
        let spread = exp.as_secs_f64() * self.jitter;
        let jitter = if spread > 0.0 {
            Duration::from_secs_f64(rng.gen_range(0.0..=spread))
        } else {
            Duration::ZERO
        };
        (exp + jitter).min(self.cap)
    }
}

/// Attempt counter driven by a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next try, or `None` once the attempt cap is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.policy.exhausted(self.attempt) {
            return None;
        }
        let delay = self.policy.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn fourth_retry_waits_between_eight_and_thirty_seconds() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let delay = policy.delay_with(3, &mut rng);
            assert!(delay >= Duration::from_secs(8), "{delay:?}");
            assert!(delay <= Duration::from_secs(30), "{delay:?}");
        }
    }

    #[test]
    fn delays_never_exceed_cap() {
        let policy = BackoffPolicy::default();
        for attempt in 0..64 {
            assert!(policy.delay_for(attempt) <= policy.cap);
        }
        assert_eq!(policy.delay_for(40), policy.cap);
    }

    #[test]
    fn zero_jitter_is_exact() {
        let policy = BackoffPolicy::default().with_jitter(0.0);
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
    }

    #[test]
    fn counter_stops_at_cap_and_resets() {
        let mut backoff = Backoff::new(BackoffPolicy::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
            3,
        ));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay().is_some());
    }
}
