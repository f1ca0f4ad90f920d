use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Decides how long to wait before the next reconnect attempt.
///
/// Policies are pure: the delay depends only on the 1-based attempt number counted since the
/// last successful connection. `None` means "stop retrying"; the manager then moves to
/// `Failed` until `connect()` is called again.
pub trait ReconnectPolicy: Send + Sync + 'static {
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

impl<P> ReconnectPolicy for Box<P>
where
    P: ReconnectPolicy + ?Sized,
{
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (**self).next_delay(attempt)
    }
}

impl<P> ReconnectPolicy for Arc<P>
where
    P: ReconnectPolicy + ?Sized,
{
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (**self).next_delay(attempt)
    }
}

/// Constant delay between attempts; unbounded unless `max_attempts` is set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedDelay {
    delay: Duration,
    max_attempts: Option<u32>,
}

impl FixedDelay {
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(5);

    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for FixedDelay {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DELAY)
    }
}

impl ReconnectPolicy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt > max) {
            return None;
        }
        Some(self.delay)
    }
}

/// Exponential backoff: `base * factor^(attempt - 1)`, capped at `max`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    factor: f64,
    max_attempts: Option<u32>,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration, factor: f64) -> Self {
        let factor = if factor.is_finite() && factor > 1.0 {
            factor
        } else {
            1.5
        };
        Self {
            base,
            max,
            factor,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 1.5)
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt > max) {
            return None;
        }
        if self.base.is_zero() {
            return Some(Duration::ZERO);
        }
        // Past ~1000 doublings the product is infinite anyway; clamp keeps powi well-defined.
        let exponent = attempt.saturating_sub(1).min(1024) as i32;
        let secs = self.base.as_secs_f64() * self.factor.powi(exponent);
        if secs >= self.max.as_secs_f64() {
            return Some(self.max);
        }
        Some(Duration::try_from_secs_f64(secs).unwrap_or(self.max))
    }
}

/// Scales the inner policy's delay by a factor in `[0.5, 1.0]`.
///
/// The factor is drawn from a generator seeded with `(seed, attempt)`, so the wrapper stays a
/// pure function of the attempt number while still spreading a fleet of consoles apart.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Jittered<P> {
    inner: P,
    seed: u64,
}

impl<P> Jittered<P> {
    pub fn new(inner: P) -> Self {
        Self { inner, seed: 0 }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn factor(&self, attempt: u32) -> f64 {
        let mixed = self
            .seed
            .wrapping_add(u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let mut rng = SmallRng::seed_from_u64(mixed);
        rng.gen_range(0.5..=1.0)
    }
}

impl<P> ReconnectPolicy for Jittered<P>
where
    P: ReconnectPolicy,
{
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        self.inner
            .next_delay(attempt)
            .map(|delay| delay.mul_f64(self.factor(attempt)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay_defaults_to_five_seconds_forever() {
        let policy = FixedDelay::default();
        for attempt in [1, 2, 3, 100, u32::MAX] {
            assert_eq!(policy.next_delay(attempt), Some(Duration::from_secs(5)));
        }
    }

    #[test]
    fn fixed_delay_stops_after_max_attempts() {
        let policy = FixedDelay::new(Duration::from_millis(250)).with_max_attempts(2);
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(250)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(250)));
        assert_eq!(policy.next_delay(3), None);
    }

    #[test]
    fn exponential_backoff_grows_and_caps() {
        let policy =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10), 2.0);
        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(4), Some(Duration::from_secs(8)));
        assert_eq!(policy.next_delay(5), Some(Duration::from_secs(10)));
        assert_eq!(policy.next_delay(u32::MAX), Some(Duration::from_secs(10)));
    }

    #[test]
    fn exponential_backoff_without_practical_cap_saturates() {
        let policy = ExponentialBackoff::new(Duration::from_secs(1), Duration::MAX, 2.0);
        assert_eq!(policy.next_delay(3), Some(Duration::from_secs(4)));
        assert_eq!(policy.next_delay(100), Some(Duration::MAX));
        assert_eq!(policy.next_delay(u32::MAX), Some(Duration::MAX));
    }

    #[test]
    fn exponential_backoff_sanitizes_factor_and_respects_limit() {
        let policy = ExponentialBackoff::new(Duration::from_secs(2), Duration::from_secs(60), 0.5)
            .with_max_attempts(1);
        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(2), None);
    }

    #[test]
    fn jitter_is_bounded_and_deterministic() {
        let policy = Jittered::new(FixedDelay::new(Duration::from_secs(4))).with_seed(7);
        for attempt in 1..50 {
            let delay = policy.next_delay(attempt).unwrap();
            assert!(delay >= Duration::from_secs(2), "attempt {attempt}: {delay:?}");
            assert!(delay <= Duration::from_secs(4), "attempt {attempt}: {delay:?}");
            assert_eq!(policy.next_delay(attempt), Some(delay));
        }
    }

    #[test]
    fn jitter_passes_through_exhaustion() {
        let policy = Jittered::new(FixedDelay::default().with_max_attempts(1));
        assert!(policy.next_delay(1).is_some());
        assert_eq!(policy.next_delay(2), None);
    }

    #[test]
    fn boxed_policies_delegate() {
        let policy: Box<dyn ReconnectPolicy> = Box::new(FixedDelay::new(Duration::from_secs(1)));
        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(1)));
    }
}
