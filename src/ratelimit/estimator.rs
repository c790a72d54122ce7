//! Exponentially weighted moving average of a key's request rate.

use std::time::Duration;

/// Smoothed per-key request rate.
///
/// Each sample is `admitted_in_window / elapsed_since_last_call`; samples are
/// folded in as `alpha * sample + (1 - alpha) * previous`.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    alpha: f64,
    estimate: f64,
}

impl RateEstimator {
    /// Create an estimator starting at zero.
    ///
    /// `alpha` is expected in (0, 1]; the registry validates it at construction.
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            estimate: 0.0,
        }
    }

    /// Fold in one observation and return the new estimate.
    ///
    /// A zero `elapsed` carries the previous estimate forward.
    pub fn update(&mut self, elapsed: Duration, admitted_in_window: usize) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return self.estimate;
        }

        let sample = admitted_in_window as f64 / secs;
        self.estimate = self.alpha * sample + (1.0 - self.alpha) * self.estimate;
        self.estimate
    }

    /// Current estimate in requests per second.
    pub fn estimate(&self) -> f64 {
        self.estimate
    }
}
