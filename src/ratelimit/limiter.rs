//! Keyed limiter registry.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::adjuster::{AdjustPolicy, LimitAdjuster};
use super::backend::AdmissionControl;
use super::clock::{Clock, SystemClock};
use super::estimator::RateEstimator;
use super::key::LimiterKey;
use super::rules::{LimitBounds, OverrideRules};
use super::window::SlidingWindowCounter;
use crate::config::LimiterConfig;
use crate::error::{KeygateError, Result};

/// Outcome code of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    /// The request is admitted
    Ok,
    /// The key has used up its window
    OverLimit,
    /// The key is outside the accepted domain; nothing was recorded
    InvalidKey,
}

/// Result of one admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Outcome
    pub code: Code,
    /// Limit in effect after this check
    pub limit: f64,
    /// Smoothed request rate after this check (requests per second)
    pub estimate: f64,
    /// Admissions still available in the current window
    pub remaining: usize,
    /// On rejection, how long until one more admission would fit
    pub retry_after: Option<Duration>,
}

impl Decision {
    /// Whether the request is admitted.
    pub fn allowed(&self) -> bool {
        self.code == Code::Ok
    }

    fn invalid_key() -> Self {
        Self {
            code: Code::InvalidKey,
            limit: 0.0,
            estimate: 0.0,
            remaining: 0,
            retry_after: None,
        }
    }
}

/// Point-in-time view of one key's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeySnapshot {
    pub key: String,
    pub limit: f64,
    pub estimate: f64,
    pub in_window: usize,
    pub min_limit: f64,
    pub max_limit: f64,
}

/// Everything tracked for one key.
#[derive(Debug)]
struct LimiterEntry {
    window: SlidingWindowCounter,
    estimator: RateEstimator,
    adjuster: LimitAdjuster,
    /// Latest instant this entry has observed; never moves backwards
    last_seen: Instant,
}

impl LimiterEntry {
    fn new(config: &LimiterConfig, policy: AdjustPolicy, bounds: LimitBounds, now: Instant) -> Self {
        let policy = policy.with_bounds(bounds.min_limit, bounds.max_limit);
        Self {
            window: SlidingWindowCounter::new(config.window()),
            estimator: RateEstimator::new(config.alpha),
            adjuster: LimitAdjuster::new(bounds.base_limit, policy, now),
            last_seen: now,
        }
    }

    /// Clamp `now` so time never runs backwards for this entry.
    fn observe(&mut self, now: Instant) -> (Instant, Duration) {
        let now = now.max(self.last_seen);
        let elapsed = now.duration_since(self.last_seen);
        self.last_seen = now;
        (now, elapsed)
    }

    fn check(&mut self, now: Instant, config: &LimiterConfig) -> Decision {
        let (now, elapsed) = self.observe(now);

        // The rate sample counts admissions before this request.
        self.window.prune(now);
        let prior_admissions = self.window.len();
        let admitted = self.window.try_admit(now, self.adjuster.limit());

        let (limit, estimate) = if config.adaptive {
            let estimate = self.estimator.update(elapsed, prior_admissions);
            let limit = self.adjuster.maybe_adjust(
                now,
                estimate,
                config.target_rate,
                config.adjustment_cooldown(),
            );
            (limit, estimate)
        } else {
            (self.adjuster.limit(), self.estimator.estimate())
        };

        Decision {
            code: if admitted { Code::Ok } else { Code::OverLimit },
            limit,
            estimate,
            remaining: self.window.remaining(limit),
            retry_after: if admitted {
                None
            } else {
                self.window.retry_after(now, limit)
            },
        }
    }

    fn snapshot(&self, key: &str) -> KeySnapshot {
        KeySnapshot {
            key: key.to_string(),
            limit: self.adjuster.limit(),
            estimate: self.estimator.estimate(),
            in_window: self.window.len(),
            min_limit: self.adjuster.policy().min_limit,
            max_limit: self.adjuster.policy().max_limit,
        }
    }
}

/// Concurrency-safe map from key to limiter state.
///
/// Lookups go through a sharded map; each key's state sits behind its own
/// mutex, taken only after the map guard is released. Checks on different
/// keys therefore never wait on each other, while checks on the same key are
/// serialized.
///
/// The registry is an ordinary value: build one per deployment (or per test)
/// and share it with `Arc`.
pub struct KeyedLimiterRegistry {
    /// Per-key state indexed by key
    entries: DashMap<LimiterKey, Arc<Mutex<LimiterEntry>>>,
    /// Validated construction parameters
    config: LimiterConfig,
    /// Adjustment rule derived from `config`
    policy: AdjustPolicy,
    /// Per-key bounds consulted when an entry is created
    overrides: OverrideRules,
    /// Time source for `allow`
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for KeyedLimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLimiterRegistry")
            .field("keys", &self.entries.len())
            .field("config", &self.config)
            .field("overrides", &self.overrides.len())
            .finish()
    }
}

impl KeyedLimiterRegistry {
    /// Create a registry, validating `config`.
    pub fn new(config: LimiterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_overrides(config, clock, OverrideRules::new())
    }

    /// Create a registry reading the system clock.
    pub fn with_system_clock(config: LimiterConfig) -> Result<Self> {
        Self::new(config, Arc::new(SystemClock::new()))
    }

    /// Create a registry with per-key limit overrides.
    pub fn with_overrides(
        config: LimiterConfig,
        clock: Arc<dyn Clock>,
        overrides: OverrideRules,
    ) -> Result<Self> {
        config.validate()?;
        overrides.validate(&config)?;

        debug!(
            window_ms = config.window_ms,
            base_limit = config.base_limit,
            adaptive = config.adaptive,
            overrides = overrides.len(),
            "Created limiter registry"
        );

        Ok(Self {
            entries: DashMap::new(),
            policy: AdjustPolicy::from_config(&config),
            config,
            overrides,
            clock,
        })
    }

    /// Check admission for `key` at the registry clock's current instant.
    pub fn allow(&self, key: &str) -> Decision {
        self.allow_at(key, self.clock.now())
    }

    /// Check admission for `key` at `now`.
    ///
    /// Never fails: an unseen key gets fresh state, an empty key is rejected
    /// with [`Code::InvalidKey`] and leaves no trace.
    pub fn allow_at(&self, key: &str, now: Instant) -> Decision {
        trace!(key = %key, "Checking admission");

        let entry = match self.get_or_create(key, now) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Rejecting request with invalid key");
                return Decision::invalid_key();
            }
        };

        let decision = entry.lock().check(now, &self.config);

        if !decision.allowed() {
            debug!(
                key = %key,
                limit = decision.limit,
                estimate = decision.estimate,
                retry_after = ?decision.retry_after,
                "Admission limit exceeded"
            );
        }

        decision
    }

    /// Boolean shorthand for [`allow_at`](Self::allow_at).
    pub fn is_allowed(&self, key: &str, now: Instant) -> bool {
        self.allow_at(key, now).allowed()
    }

    /// Override a key's limit, clamped into its bounds.
    ///
    /// Creates the key if needed and restarts its adjustment cooldown.
    /// Returns the limit actually applied.
    pub fn set_limit(&self, key: &str, limit: f64) -> Result<f64> {
        if !limit.is_finite() {
            return Err(KeygateError::RateLimit(format!(
                "limit must be finite, got {}",
                limit
            )));
        }

        let now = self.clock.now();
        let entry = self.get_or_create(key, now)?;
        let mut entry = entry.lock();
        let (now, _) = entry.observe(now);
        let applied = entry.adjuster.set_limit(limit, now);

        debug!(key = %key, requested = limit, limit = applied, "Limit set manually");
        Ok(applied)
    }

    /// Current limit of `key`, if it has been seen.
    pub fn current_limit(&self, key: &str) -> Option<f64> {
        self.get(key).map(|entry| entry.lock().adjuster.limit())
    }

    /// Current rate estimate of `key`, if it has been seen.
    pub fn current_estimate(&self, key: &str) -> Option<f64> {
        self.get(key).map(|entry| entry.lock().estimator.estimate())
    }

    /// State of one key.
    pub fn snapshot(&self, key: &str) -> Option<KeySnapshot> {
        self.get(key).map(|entry| entry.lock().snapshot(key))
    }

    /// State of every key, ordered by key.
    pub fn snapshots(&self) -> Vec<KeySnapshot> {
        let entries: Vec<(LimiterKey, Arc<Mutex<LimiterEntry>>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut snapshots: Vec<KeySnapshot> = entries
            .iter()
            .map(|(key, entry)| entry.lock().snapshot(key.as_str()))
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Remove entries idle for longer than the configured idle TTL.
    ///
    /// Entries currently held by an in-flight check are kept. Returns the
    /// number of entries removed; always zero without an idle TTL.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let Some(ttl) = self.config.idle_ttl() else {
            return 0;
        };

        let mut evicted = 0;
        self.entries.retain(|key, entry| {
            // Another holder means a check is in progress.
            if Arc::strong_count(entry) > 1 {
                return true;
            }

            // Strictly longer: an admission exactly one window old still counts.
            let idle = now.saturating_duration_since(entry.lock().last_seen) > ttl;
            if idle {
                trace!(key = %key, "Evicting idle entry");
                evicted += 1;
            }
            !idle
        });

        if evicted > 0 {
            debug!(evicted = evicted, remaining = self.entries.len(), "Evicted idle entries");
        }
        evicted
    }

    /// Forget one key. Returns whether it was tracked.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Forget every key.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Construction parameters.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Current instant of the registry clock.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    fn get(&self, key: &str) -> Option<Arc<Mutex<LimiterEntry>>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    fn get_or_create(&self, key: &str, now: Instant) -> Result<Arc<Mutex<LimiterEntry>>> {
        if let Some(entry) = self.get(key) {
            return Ok(entry);
        }

        let key = LimiterKey::new(key)?;
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| {
                let bounds = self
                    .overrides
                    .bounds_for(key.as_str(), LimitBounds::from_config(&self.config));
                debug!(
                    key = %key,
                    limit = bounds.base_limit,
                    min_limit = bounds.min_limit,
                    max_limit = bounds.max_limit,
                    "Creating new limiter entry"
                );
                Arc::new(Mutex::new(LimiterEntry::new(
                    &self.config,
                    self.policy,
                    bounds,
                    now,
                )))
            });

        Ok(Arc::clone(entry.value()))
    }
}

impl AdmissionControl for KeyedLimiterRegistry {
    fn allow(&self, key: &str) -> Decision {
        KeyedLimiterRegistry::allow(self, key)
    }
}
