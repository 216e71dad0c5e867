//! Reconnection Backoff
//!
//! Exponential backoff with an optional jitter for push channel reconnects.
//! The delay is a pure function of the consecutive failure count, so the
//! connection state machine can compute `next_retry_at` without carrying
//! policy state of its own.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound on any delay, jitter included.
    pub cap: Duration,
    /// Growth factor per consecutive failure (values below 1.0 are treated as 1.0).
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (e.g., 0.1 = ±10%), at most 1.0.
    /// 0 disables jitter.
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl BackoffConfig {
    /// Create a configuration without jitter.
    #[must_use]
    pub const fn new(base: Duration, cap: Duration, multiplier: f64) -> Self {
        Self {
            base,
            cap,
            multiplier,
            jitter_factor: 0.0,
        }
    }

    /// Set the jitter factor.
    #[must_use]
    pub const fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }
}

/// Backoff policy computing `delay(attempt)`.
///
/// # Example
///
/// ```rust
/// use live_sync::domain::connection::{BackoffConfig, BackoffPolicy};
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::new(BackoffConfig::default());
///
/// assert_eq!(policy.delay(1), Duration::from_secs(1));
/// assert_eq!(policy.delay(3), Duration::from_secs(4));
/// assert_eq!(policy.delay(50), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: BackoffConfig,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl BackoffPolicy {
    /// Create a new policy.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// The policy configuration.
    #[must_use]
    pub const fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Delay before the reconnect that follows the `attempt`-th consecutive
    /// failure (1-based; 0 is treated as 1).
    ///
    /// Without jitter the result is non-decreasing in `attempt`. It never
    /// exceeds the configured cap.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        let base_millis = self.config.base.as_millis() as f64;
        #[allow(clippy::cast_precision_loss)]
        let cap_millis = self.config.cap.as_millis() as f64;

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = base_millis * self.config.multiplier.max(1.0).powi(exponent);
        let capped = if scaled.is_finite() {
            scaled.min(cap_millis)
        } else {
            cap_millis
        };

        let jittered = self.apply_jitter(capped).clamp(0.0, cap_millis);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = jittered.round() as u64;
        Duration::from_millis(millis)
    }

    /// Jitter factors that are not finite are ignored and factors above 1.0
    /// are clamped.
    fn apply_jitter(&self, millis: f64) -> f64 {
        let factor = self.config.jitter_factor;
        if !factor.is_finite() || factor <= 0.0 || !millis.is_finite() || millis <= 0.0 {
            return millis;
        }

        let jitter_range = millis * factor.min(1.0);
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        (millis + jitter).max(1.0)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn default_config_values() {
        let config = BackoffConfig::default();
        assert_eq!(config.base, Duration::from_secs(1));
        assert_eq!(config.cap, Duration::from_secs(30));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert!(config.jitter_factor.abs() < f64::EPSILON);
    }

    #[test_case(0, 1_000 ; "attempt zero is the first delay")]
    #[test_case(1, 1_000 ; "first failure")]
    #[test_case(2, 2_000 ; "second failure")]
    #[test_case(3, 4_000 ; "third failure")]
    #[test_case(4, 8_000 ; "fourth failure")]
    #[test_case(5, 16_000 ; "fifth failure")]
    #[test_case(6, 30_000 ; "capped")]
    #[test_case(7, 30_000 ; "stays capped")]
    #[test_case(1_000, 30_000 ; "large attempt")]
    #[test_case(u32::MAX, 30_000 ; "max attempt")]
    fn exponential_delays(attempt: u32, expected_millis: u64) {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(attempt), Duration::from_millis(expected_millis));
    }

    #[test]
    fn delays_are_non_decreasing_up_to_cap() {
        let policy = BackoffPolicy::new(BackoffConfig::new(
            Duration::from_millis(250),
            Duration::from_secs(10),
            1.5,
        ));
        let cap = Duration::from_secs(10);

        let mut previous = Duration::ZERO;
        for attempt in 1..200 {
            let delay = policy.delay(attempt);
            assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
            assert!(delay <= cap);
            previous = delay;
        }
        assert_eq!(previous, cap);
    }

    #[test]
    fn base_above_cap_is_capped() {
        let policy = BackoffPolicy::new(BackoffConfig::new(
            Duration::from_secs(60),
            Duration::from_secs(30),
            2.0,
        ));
        assert_eq!(policy.delay(1), Duration::from_secs(30));
    }

    #[test]
    fn multiplier_below_one_does_not_shrink() {
        let policy = BackoffPolicy::new(BackoffConfig::new(
            Duration::from_secs(2),
            Duration::from_secs(30),
            0.5,
        ));
        assert_eq!(policy.delay(5), Duration::from_secs(2));
    }

    #[test]
    fn jitter_bounds() {
        let policy = BackoffPolicy::new(BackoffConfig::default().with_jitter(0.1));

        for _ in 0..100 {
            let millis = policy.delay(1).as_millis();
            assert!(millis >= 900, "delay {millis}ms is below minimum 900ms");
            assert!(millis <= 1100, "delay {millis}ms is above maximum 1100ms");
        }
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy = BackoffPolicy::new(BackoffConfig::default().with_jitter(0.5));

        for _ in 0..100 {
            assert!(policy.delay(20) <= Duration::from_secs(30));
        }
    }

    #[test_case(f64::NAN ; "not a number")]
    #[test_case(f64::INFINITY ; "infinite")]
    #[test_case(f64::NEG_INFINITY ; "negative infinity")]
    fn non_finite_jitter_is_ignored(jitter: f64) {
        let policy = BackoffPolicy::new(BackoffConfig::default().with_jitter(jitter));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
    }

    #[test]
    fn oversized_jitter_is_clamped() {
        let policy = BackoffPolicy::new(BackoffConfig::default().with_jitter(1e308));

        for _ in 0..100 {
            assert!(policy.delay(2) <= Duration::from_secs(4));
        }
    }
}
