//! # Restart delay computation.
//!
//! [`BackoffPolicy`] derives the delay before restart attempt `n` as
//! `first × factor^n`, clamped to `max`, with optional jitter on top. The
//! base is computed from the attempt number alone, so jitter never feeds back
//! into later delays.
//!
//! The default is a constant delay ([`BackoffPolicy::constant`]): a runner
//! configured with a flat restart delay gets exactly that.

use rand::Rng;
use std::time::Duration;

/// Randomization applied to a computed backoff delay.
///
/// Spreads simultaneous restarts of many workers so they do not hammer a
/// shared collaborator in lockstep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JitterPolicy {
    /// Use the exact computed delay.
    #[default]
    None,
    /// Random delay in `[0, delay]`.
    Full,
    /// `delay/2 + random[0, delay/2]`; keeps most of the backoff.
    Equal,
}

impl JitterPolicy {
    fn apply(self, delay: Duration) -> Duration {
        let ms = delay.as_millis().min(u128::from(u64::MAX)) as u64;
        if ms == 0 {
            return delay;
        }
        match self {
            JitterPolicy::None => delay,
            JitterPolicy::Full => Duration::from_millis(rand::rng().random_range(0..=ms)),
            JitterPolicy::Equal => {
                let half = ms / 2;
                Duration::from_millis(half + rand::rng().random_range(0..=ms - half))
            }
        }
    }
}

/// Delay curve for worker restarts.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Delay before the first restart.
    pub first: Duration,
    /// Cap on the computed delay.
    pub max: Duration,
    /// Multiplicative growth factor; `1.0` keeps the delay constant.
    pub factor: f64,
    /// Randomization applied after clamping.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::constant(Duration::from_secs(1))
    }
}

impl BackoffPolicy {
    /// Flat delay for every restart, no jitter.
    pub fn constant(delay: Duration) -> Self {
        Self {
            first: delay,
            max: delay,
            factor: 1.0,
            jitter: JitterPolicy::None,
        }
    }

    /// Delay before restart attempt `attempt` (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let raw = self.first.as_secs_f64() * self.factor.powi(attempt.min(i32::MAX as u32) as i32);
        let base = if !raw.is_finite() || raw < 0.0 || raw > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(raw)
        };
        self.jitter.apply(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_policy_never_varies() {
        let policy = BackoffPolicy::constant(Duration::from_millis(250));
        for attempt in 0..16 {
            assert_eq!(policy.next(attempt), Duration::from_millis(250));
        }
    }

    #[test]
    fn exponential_growth_clamps_at_max() {
        let policy = BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(5),
            factor: 2.0,
            jitter: JitterPolicy::None,
        };
        assert_eq!(policy.next(0), Duration::from_millis(100));
        assert_eq!(policy.next(1), Duration::from_millis(200));
        assert_eq!(policy.next(3), Duration::from_millis(800));
        assert_eq!(policy.next(30), Duration::from_secs(5));
        assert_eq!(policy.next(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn full_jitter_stays_within_base() {
        let policy = BackoffPolicy {
            first: Duration::from_millis(1000),
            max: Duration::from_secs(1),
            factor: 1.0,
            jitter: JitterPolicy::Full,
        };
        for _ in 0..100 {
            assert!(policy.next(0) <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn equal_jitter_keeps_at_least_half() {
        let policy = BackoffPolicy {
            first: Duration::from_millis(1000),
            max: Duration::from_secs(1),
            factor: 1.0,
            jitter: JitterPolicy::Equal,
        };
        for _ in 0..100 {
            let delay = policy.next(0);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1000));
        }
    }
}
