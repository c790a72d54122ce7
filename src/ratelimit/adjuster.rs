//! Feedback controller for a key's effective limit.
//!
//! The decision rule lives in [`next_limit`], a pure function of the current
//! limit, the smoothed rate and the target, so its stability can be checked
//! without any clock. [`LimitAdjuster`] adds the per-key state: the limit
//! itself and the cooldown gate.

use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::LimiterConfig;

/// Bounds and gains of the adjustment rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdjustPolicy {
    /// Floor for the limit
    pub min_limit: f64,
    /// Ceiling for the limit
    pub max_limit: f64,
    /// Multiplier when traffic is below target
    pub increase_factor: f64,
    /// Multiplier when traffic is above target
    pub decrease_factor: f64,
    /// Relative dead band around the target
    pub tolerance: f64,
}

impl AdjustPolicy {
    /// Build the policy described by a limiter configuration.
    pub fn from_config(config: &LimiterConfig) -> Self {
        Self {
            min_limit: config.min_limit,
            max_limit: config.max_limit,
            increase_factor: config.increase_factor,
            decrease_factor: config.decrease_factor,
            tolerance: config.tolerance,
        }
    }

    /// Same gains with different bounds.
    pub fn with_bounds(self, min_limit: f64, max_limit: f64) -> Self {
        Self {
            min_limit,
            max_limit,
            ..self
        }
    }

    /// Clamp a limit into `[min_limit, max_limit]`.
    pub fn clamp(&self, limit: f64) -> f64 {
        limit.max(self.min_limit).min(self.max_limit)
    }
}

/// Compute the limit that follows `current` given the smoothed rate.
///
/// Above `target * (1 + tolerance)` the limit shrinks by `decrease_factor`;
/// below `target * (1 - tolerance)` it grows by `increase_factor`; inside the
/// band it is left alone. The result is always within the policy bounds.
pub fn next_limit(current: f64, estimate: f64, target: f64, policy: &AdjustPolicy) -> f64 {
    let next = if estimate > target * (1.0 + policy.tolerance) {
        current * policy.decrease_factor
    } else if estimate < target * (1.0 - policy.tolerance) {
        // Only an exact zero needs a seed; any positive limit grows from itself.
        let base = if current > 0.0 { current } else { 1.0 };
        base * policy.increase_factor
    } else {
        current
    };

    policy.clamp(next)
}

/// Per-key limit with a cooldown between changes.
#[derive(Debug, Clone)]
pub struct LimitAdjuster {
    limit: f64,
    last_adjusted: Instant,
    policy: AdjustPolicy,
}

impl LimitAdjuster {
    /// Start at `base_limit` (clamped into the policy bounds).
    ///
    /// The cooldown runs from `created_at`, so a fresh key is not adjusted on
    /// its first few requests.
    pub fn new(base_limit: f64, policy: AdjustPolicy, created_at: Instant) -> Self {
        Self {
            limit: policy.clamp(base_limit),
            last_adjusted: created_at,
            policy,
        }
    }

    /// Apply [`next_limit`] unless the last change happened less than `cooldown` ago.
    ///
    /// Returns the limit in effect afterwards.
    pub fn maybe_adjust(
        &mut self,
        now: Instant,
        estimate: f64,
        target: f64,
        cooldown: Duration,
    ) -> f64 {
        if now.saturating_duration_since(self.last_adjusted) < cooldown {
            return self.limit;
        }

        let next = next_limit(self.limit, estimate, target, &self.policy);
        if next != self.limit {
            debug!(
                previous = self.limit,
                limit = next,
                estimate = estimate,
                target = target,
                "Adjusted limit"
            );
            self.limit = next;
            self.last_adjusted = now;
        }

        self.limit
    }

    /// Force the limit (clamped into bounds) and restart the cooldown.
    pub fn set_limit(&mut self, limit: f64, now: Instant) -> f64 {
        self.limit = self.policy.clamp(limit);
        self.last_adjusted = now;
        self.limit
    }

    /// Limit currently in effect.
    pub fn limit(&self) -> f64 {
        self.limit
    }

    /// Policy this adjuster follows.
    pub fn policy(&self) -> &AdjustPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AdjustPolicy {
        AdjustPolicy {
            min_limit: 2.0,
            max_limit: 100.0,
            increase_factor: 1.1,
            decrease_factor: 0.9,
            tolerance: 0.1,
        }
    }

    #[test]
    fn test_next_limit_directions() {
        let p = policy();
        // Well above target shrinks
        assert!((next_limit(50.0, 80.0, 50.0, &p) - 45.0).abs() < 1e-9);
        // Well below target grows
        assert!((next_limit(50.0, 10.0, 50.0, &p) - 55.0).abs() < 1e-9);
        // Inside the dead band stays put
        assert_eq!(next_limit(50.0, 52.0, 50.0, &p), 50.0);
        assert_eq!(next_limit(50.0, 46.0, 50.0, &p), 50.0);
    }

    #[test]
    fn test_next_limit_clamps() {
        let p = policy();
        assert_eq!(next_limit(2.1, 1_000.0, 50.0, &p), 2.0);
        assert_eq!(next_limit(99.0, 0.0, 50.0, &p), 100.0);
    }

    #[test]
    fn test_growth_from_zero() {
        let p = policy().with_bounds(0.0, 10.0);
        assert!((next_limit(0.0, 0.0, 5.0, &p) - 1.1).abs() < 1e-9);
    }

    #[test]
    fn test_sub_one_limit_grows_by_factor() {
        let p = policy().with_bounds(0.25, 10.0);
        assert!((next_limit(0.5, 0.0, 10.0, &p) - 0.55).abs() < 1e-9);
        assert!((next_limit(0.25, 0.0, 10.0, &p) - 0.275).abs() < 1e-9);
    }

    #[test]
    fn test_limit_stays_within_bounds() {
        let p = policy();
        let mut limit = 50.0;
        let estimates = [0.0, 1e6, 3.0, 500.0, 0.0, 0.0, 1e9, 49.0, 0.0];
        for round in 0..500 {
            let estimate = estimates[round % estimates.len()];
            limit = next_limit(limit, estimate, 50.0, &p);
            assert!((p.min_limit..=p.max_limit).contains(&limit));
        }
    }

    #[test]
    fn test_feedback_loop_settles() {
        // Offered load far above target; the admitted rate follows the limit.
        let p = policy();
        let target = 50.0;
        let offered = 200.0;
        let mut limit = 100.0;
        let mut history = Vec::new();

        for _ in 0..200 {
            let admitted_rate = f64::min(limit, offered);
            limit = next_limit(limit, admitted_rate, target, &p);
            history.push(limit);
        }

        let settled = &history[50..];
        for &l in settled {
            assert!(
                l >= target * (1.0 - p.tolerance) * p.decrease_factor
                    && l <= target * (1.0 + p.tolerance) * p.increase_factor,
                "limit {} oscillates outside the band",
                l
            );
        }
    }

    #[test]
    fn test_cooldown_allows_one_change() {
        let created = Instant::now();
        let cooldown = Duration::from_secs(60);
        let start = created + cooldown;
        let mut adjuster = LimitAdjuster::new(50.0, policy(), created);

        let first = adjuster.maybe_adjust(start, 500.0, 50.0, cooldown);
        assert!((first - 45.0).abs() < 1e-9);
        assert_eq!(adjuster.last_adjusted, start);

        let second = adjuster.maybe_adjust(start + Duration::from_secs(30), 500.0, 50.0, cooldown);
        assert_eq!(second, first);

        let third = adjuster.maybe_adjust(start + cooldown, 500.0, 50.0, cooldown);
        assert!(third < second);
    }

    #[test]
    fn test_fresh_adjuster_waits_for_cooldown() {
        let start = Instant::now();
        let cooldown = Duration::from_secs(1);
        let mut adjuster = LimitAdjuster::new(50.0, policy(), start);

        assert_eq!(adjuster.maybe_adjust(start, 0.0, 50.0, cooldown), 50.0);
        assert!(adjuster.maybe_adjust(start + cooldown, 0.0, 50.0, cooldown) > 50.0);
    }

    #[test]
    fn test_in_band_does_not_restart_cooldown() {
        let start = Instant::now();
        let cooldown = Duration::from_secs(10);
        let mut adjuster = LimitAdjuster::new(50.0, policy(), start);

        adjuster.maybe_adjust(start + cooldown, 50.0, 50.0, cooldown);
        assert_eq!(adjuster.last_adjusted, start);
    }

    #[test]
    fn test_base_and_manual_limits_are_clamped() {
        let start = Instant::now();
        let mut adjuster = LimitAdjuster::new(500.0, policy(), start);
        assert_eq!(adjuster.limit(), 100.0);

        assert_eq!(adjuster.set_limit(0.5, start), 2.0);
        assert_eq!(adjuster.policy().min_limit, 2.0);
    }
}
