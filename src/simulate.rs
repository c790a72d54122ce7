//! Synthetic load driver.
//!
//! Replays a traffic pattern against an [`AdmissionControl`] implementation
//! on simulated time and reports how each key fared. Time only moves through
//! the supplied [`ManualClock`], so a run takes as long as the CPU needs
//! rather than the simulated duration, and a given seed always produces the
//! same report.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::SimulationConfig;
use crate::ratelimit::{AdmissionControl, Code, ManualClock};

/// Request arrival pattern.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LoadPattern {
    /// One request every 50ms
    #[default]
    Constant,
    /// One request every 10ms
    Burst,
    /// Uniformly random gaps between 0 and 99ms
    Spike,
}

impl LoadPattern {
    /// Gap before the next request.
    pub fn next_gap<R: Rng>(&self, rng: &mut R) -> Duration {
        match self {
            LoadPattern::Constant => Duration::from_millis(50),
            LoadPattern::Burst => Duration::from_millis(10),
            LoadPattern::Spike => Duration::from_millis(rng.gen_range(0..100)),
        }
    }
}

impl std::fmt::Display for LoadPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LoadPattern::Constant => "constant",
            LoadPattern::Burst => "burst",
            LoadPattern::Spike => "spike",
        };
        f.write_str(name)
    }
}

/// Outcome for one key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KeyReport {
    pub key: String,
    pub admitted: u64,
    pub rejected: u64,
    pub final_limit: f64,
    pub final_estimate: f64,
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationReport {
    pub pattern: LoadPattern,
    pub seed: u64,
    /// Simulated time covered, in milliseconds
    pub simulated_ms: u64,
    pub requests: u64,
    pub admitted: u64,
    pub rejected: u64,
    /// Whether the run stopped before covering the configured duration
    pub cancelled: bool,
    pub keys: Vec<KeyReport>,
}

impl SimulationReport {
    /// Fraction of requests admitted.
    pub fn admission_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.admitted as f64 / self.requests as f64
        }
    }
}

/// Drive `limiter` with the configured pattern until the simulated duration
/// is covered or `cancel` is raised.
///
/// `clock` must be the clock `limiter` reads.
pub fn run(
    limiter: &dyn AdmissionControl,
    clock: &ManualClock,
    config: &SimulationConfig,
    cancel: &AtomicBool,
) -> SimulationReport {
    let duration = Duration::from_secs(config.duration_secs);
    let key_count = config.keys.max(1);
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut per_key: BTreeMap<String, KeyReport> = BTreeMap::new();
    let mut elapsed = Duration::ZERO;
    let mut cancelled = false;

    info!(
        pattern = %config.pattern,
        duration_secs = config.duration_secs,
        keys = key_count,
        seed = config.seed,
        "Starting load simulation"
    );

    while elapsed < duration {
        if cancel.load(Ordering::Relaxed) {
            cancelled = true;
            break;
        }

        let key = format!("user:{}", rng.gen_range(0..key_count));
        let decision = limiter.allow(&key);

        let report = per_key.entry(key).or_insert_with_key(|key| KeyReport {
            key: key.clone(),
            ..Default::default()
        });
        match decision.code {
            Code::Ok => report.admitted += 1,
            Code::OverLimit | Code::InvalidKey => report.rejected += 1,
        }
        report.final_limit = decision.limit;
        report.final_estimate = decision.estimate;

        let gap = config.pattern.next_gap(&mut rng);
        clock.advance(gap);
        elapsed += gap;
    }

    let keys: Vec<KeyReport> = per_key.into_values().collect();
    let admitted = keys.iter().map(|k| k.admitted).sum();
    let rejected = keys.iter().map(|k| k.rejected).sum();

    let report = SimulationReport {
        pattern: config.pattern,
        seed: config.seed,
        simulated_ms: elapsed.as_millis() as u64,
        requests: admitted + rejected,
        admitted,
        rejected,
        cancelled,
        keys,
    };

    debug!(
        requests = report.requests,
        admitted = report.admitted,
        rejected = report.rejected,
        cancelled = report.cancelled,
        "Load simulation finished"
    );
    report
}
