//! Sliding window admission counter.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of admissions a (possibly fractional) limit allows per window.
///
/// Non-positive and non-finite limits allow nothing.
pub fn capacity(limit: f64) -> usize {
    if limit.is_finite() && limit >= 1.0 {
        limit.floor() as usize
    } else {
        0
    }
}

/// Tracks admitted request timestamps within a trailing window.
///
/// Timestamps are kept in ascending order so expired entries are always at
/// the front; pruning is amortized O(1) per admission. Callers must pass
/// non-decreasing instants (the registry clamps clock regressions).
#[derive(Debug, Clone)]
pub struct SlidingWindowCounter {
    /// Admission instants, oldest first
    events: VecDeque<Instant>,
    /// Length of the trailing window
    window: Duration,
}

impl SlidingWindowCounter {
    /// Create an empty counter for the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            window,
        }
    }

    /// Try to admit one request at `now` under `limit`.
    ///
    /// Returns `true` and records `now` if fewer than `limit` admissions remain
    /// in the window after pruning; otherwise returns `false` and records nothing.
    pub fn try_admit(&mut self, now: Instant, limit: f64) -> bool {
        self.prune(now);

        if self.events.len() < capacity(limit) {
            self.events.push_back(now);
            true
        } else {
            false
        }
    }

    /// Drop admissions that fell out of the window ending at `now`.
    pub fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.events.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admissions recorded as of the last prune.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether no admission is recorded.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Admissions still available under `limit`.
    pub fn remaining(&self, limit: f64) -> usize {
        capacity(limit).saturating_sub(self.events.len())
    }

    /// How long until one more admission fits under `limit`.
    ///
    /// `None` when the limit admits nothing at all.
    pub fn retry_after(&self, now: Instant, limit: f64) -> Option<Duration> {
        let capacity = capacity(limit);
        if capacity == 0 {
            return None;
        }
        if self.events.len() < capacity {
            return Some(Duration::ZERO);
        }

        // This admission must expire before the count drops below capacity.
        let blocking = self.events[self.events.len() - capacity];
        // Entries expire strictly after the window.
        let expires_at = blocking + self.window + Duration::from_nanos(1);
        Some(expires_at.saturating_duration_since(now))
    }
}
