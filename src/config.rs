//! Configuration management for Keygate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{KeygateError, Result};
use crate::simulate::LoadPattern;

/// Prefix for environment variable overrides, e.g. `KEYGATE__LIMITER__BASE_LIMIT=20`.
pub const ENV_PREFIX: &str = "KEYGATE";

/// Main configuration for a Keygate deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Admission control configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Idle-entry sweeper configuration
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Load simulation configuration (used by the CLI)
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Optional path to per-key override rules
    #[serde(default)]
    pub overrides_path: Option<String>,
}

/// Construction parameters of a limiter registry.
///
/// Every registry validates these once at construction; nothing is checked on
/// the request path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Length of the trailing window in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Limit a new key starts with (admissions per window)
    #[serde(default = "default_base_limit")]
    pub base_limit: f64,

    /// Floor for the adjusted limit
    #[serde(default = "default_min_limit")]
    pub min_limit: f64,

    /// Ceiling for the adjusted limit
    #[serde(default = "default_max_limit")]
    pub max_limit: f64,

    /// EWMA smoothing factor, in (0, 1]
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Multiplier applied when traffic sits comfortably below target (> 1)
    #[serde(default = "default_increase_factor")]
    pub increase_factor: f64,

    /// Multiplier applied when traffic exceeds target (in (0, 1))
    #[serde(default = "default_decrease_factor")]
    pub decrease_factor: f64,

    /// Minimum time between two limit adjustments of one key, in milliseconds
    #[serde(default = "default_adjustment_cooldown_ms")]
    pub adjustment_cooldown_ms: u64,

    /// Request rate (per second) the adjuster steers each key toward
    #[serde(default = "default_target_rate")]
    pub target_rate: f64,

    /// Relative dead band around the target, in [0, 1)
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    /// Whether the estimator and adjuster run on each check
    #[serde(default = "default_adaptive")]
    pub adaptive: bool,

    /// Entries idle for this long may be evicted; `None` keeps them forever
    #[serde(default)]
    pub idle_ttl_ms: Option<u64>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            base_limit: default_base_limit(),
            min_limit: default_min_limit(),
            max_limit: default_max_limit(),
            alpha: default_alpha(),
            increase_factor: default_increase_factor(),
            decrease_factor: default_decrease_factor(),
            adjustment_cooldown_ms: default_adjustment_cooldown_ms(),
            target_rate: default_target_rate(),
            tolerance: default_tolerance(),
            adaptive: default_adaptive(),
            idle_ttl_ms: None,
        }
    }
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_base_limit() -> f64 {
    10.0
}

fn default_min_limit() -> f64 {
    1.0
}

fn default_max_limit() -> f64 {
    100.0
}

fn default_alpha() -> f64 {
    0.1
}

fn default_increase_factor() -> f64 {
    1.2
}

fn default_decrease_factor() -> f64 {
    0.8
}

fn default_adjustment_cooldown_ms() -> u64 {
    60_000
}

fn default_target_rate() -> f64 {
    10.0
}

fn default_tolerance() -> f64 {
    0.1
}

fn default_adaptive() -> bool {
    true
}

impl LimiterConfig {
    /// Window duration.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Cooldown between adjustments.
    pub fn adjustment_cooldown(&self) -> Duration {
        Duration::from_millis(self.adjustment_cooldown_ms)
    }

    /// Idle time after which an entry may be evicted.
    pub fn idle_ttl(&self) -> Option<Duration> {
        self.idle_ttl_ms.map(Duration::from_millis)
    }

    /// Check every parameter, failing on the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.window_ms == 0 {
            return Err(config_error("window_ms must be greater than zero"));
        }
        validate_bounds(self.base_limit, self.min_limit, self.max_limit)?;
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(config_error(format!(
                "alpha must be in (0, 1], got {}",
                self.alpha
            )));
        }
        if !(self.increase_factor.is_finite() && self.increase_factor > 1.0) {
            return Err(config_error(format!(
                "increase_factor must be greater than 1, got {}",
                self.increase_factor
            )));
        }
        if !(self.decrease_factor > 0.0 && self.decrease_factor < 1.0) {
            return Err(config_error(format!(
                "decrease_factor must be in (0, 1), got {}",
                self.decrease_factor
            )));
        }
        if self.adaptive && !(self.target_rate.is_finite() && self.target_rate > 0.0) {
            return Err(config_error(format!(
                "target_rate must be positive, got {}",
                self.target_rate
            )));
        }
        if !(self.tolerance >= 0.0 && self.tolerance < 1.0) {
            return Err(config_error(format!(
                "tolerance must be in [0, 1), got {}",
                self.tolerance
            )));
        }
        if let Some(ttl) = self.idle_ttl_ms {
            if ttl < self.window_ms {
                return Err(config_error(format!(
                    "idle_ttl_ms ({}) must not be shorter than window_ms ({})",
                    ttl, self.window_ms
                )));
            }
        }
        Ok(())
    }
}

/// Check a `(base, min, max)` limit triple.
pub(crate) fn validate_bounds(base: f64, min: f64, max: f64) -> Result<()> {
    for (name, value) in [("base_limit", base), ("min_limit", min), ("max_limit", max)] {
        if !value.is_finite() || value < 0.0 {
            return Err(config_error(format!(
                "{} must be a finite non-negative number, got {}",
                name, value
            )));
        }
    }
    if min > max {
        return Err(config_error(format!(
            "min_limit ({}) must not exceed max_limit ({})",
            min, max
        )));
    }
    if base < min || base > max {
        return Err(config_error(format!(
            "base_limit ({}) must lie within [{}, {}]",
            base, min, max
        )));
    }
    Ok(())
}

fn config_error(message: impl Into<String>) -> KeygateError {
    KeygateError::Config(message.into())
}

/// Idle-entry sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Run the sweeper (only effective when `idle_ttl_ms` is set)
    #[serde(default = "default_sweeper_enabled")]
    pub enabled: bool,

    /// Sweep interval in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub interval_ms: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: default_sweeper_enabled(),
            interval_ms: default_sweep_interval_ms(),
        }
    }
}

fn default_sweeper_enabled() -> bool {
    true
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

impl SweeperConfig {
    /// Sweep interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Load simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Arrival pattern
    #[serde(default)]
    pub pattern: LoadPattern,

    /// Simulated duration in seconds
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,

    /// Number of distinct keys traffic is spread over
    #[serde(default = "default_keys")]
    pub keys: usize,

    /// RNG seed for spike gaps and key selection
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            pattern: LoadPattern::default(),
            duration_secs: default_duration_secs(),
            keys: default_keys(),
            seed: default_seed(),
        }
    }
}

fn default_duration_secs() -> u64 {
    60
}

fn default_keys() -> usize {
    4
}

fn default_seed() -> u64 {
    42
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(yaml)?;
        config.limiter.validate()?;
        Ok(config)
    }

    /// Load configuration layered from an optional file and `KEYGATE__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let env = config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true);
        Self::load_layered(path, env)
    }

    fn load_layered(path: Option<&str>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading layered configuration");
            builder = builder.add_source(config::File::with_name(path));
        }

        let config: AppConfig = builder.add_source(env).build()?.try_deserialize()?;
        config.limiter.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .source(Some(map))
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(LimiterConfig::default().validate().is_ok());
        assert_eq!(LimiterConfig::default().window(), Duration::from_secs(60));
    }

    #[test]
    fn test_rejects_zero_window() {
        let config = LimiterConfig {
            window_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(KeygateError::Config(_))));
    }

    #[test]
    fn test_rejects_alpha_out_of_range() {
        for alpha in [0.0, -0.5, 1.5, f64::NAN] {
            let config = LimiterConfig {
                alpha,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "alpha {} should be rejected", alpha);
        }

        let config = LimiterConfig {
            alpha: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        let config = LimiterConfig {
            min_limit: 50.0,
            max_limit: 10.0,
            base_limit: 20.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_base_outside_bounds() {
        let config = LimiterConfig {
            base_limit: 500.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_factors() {
        let config = LimiterConfig {
            increase_factor: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = LimiterConfig {
            decrease_factor: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = LimiterConfig {
            decrease_factor: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_idle_ttl_shorter_than_window() {
        let config = LimiterConfig {
            window_ms: 10_000,
            idle_ttl_ms: Some(5_000),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_limits_are_valid() {
        let config = LimiterConfig {
            base_limit: 0.0,
            min_limit: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
limiter:
  window_ms: 10000
  base_limit: 5
  min_limit: 1
  max_limit: 20
  alpha: 0.5
  idle_ttl_ms: 30000
sweeper:
  interval_ms: 250
simulation:
  pattern: burst
  keys: 8
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.window(), Duration::from_secs(10));
        assert_eq!(config.limiter.base_limit, 5.0);
        assert_eq!(config.limiter.alpha, 0.5);
        assert_eq!(config.limiter.idle_ttl(), Some(Duration::from_secs(30)));
        // Unspecified fields fall back to defaults
        assert_eq!(config.limiter.increase_factor, 1.2);
        assert_eq!(config.sweeper.interval(), Duration::from_millis(250));
        assert!(config.sweeper.enabled);
        assert_eq!(config.simulation.pattern, LoadPattern::Burst);
        assert_eq!(config.simulation.keys, 8);
        assert_eq!(config.simulation.seed, 42);
    }

    #[test]
    fn test_invalid_yaml_values_fail_fast() {
        let yaml = r#"
limiter:
  alpha: 2.0
"#;
        assert!(matches!(
            AppConfig::from_yaml(yaml),
            Err(KeygateError::Config(_))
        ));
    }

    #[test]
    fn test_layered_env_overrides() {
        let env = env_from(&[
            ("KEYGATE__LIMITER__BASE_LIMIT", "25"),
            ("KEYGATE__LIMITER__ADAPTIVE", "false"),
        ]);
        let config = AppConfig::load_layered(None, env).unwrap();
        assert_eq!(config.limiter.base_limit, 25.0);
        assert!(!config.limiter.adaptive);
        assert_eq!(config.limiter.window_ms, 60_000);
    }

    #[test]
    fn test_layered_file_then_env() {
        let path = std::env::temp_dir().join(format!(
            "keygate-config-test-{}.yaml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "limiter:\n  window_ms: 5000\n  base_limit: 3\n",
        )
        .unwrap();

        let env = env_from(&[("KEYGATE__LIMITER__BASE_LIMIT", "4")]);
        let config = AppConfig::load_layered(path.to_str(), env).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.limiter.window_ms, 5000);
        assert_eq!(config.limiter.base_limit, 4.0);
    }

    #[test]
    fn test_from_file_reads_and_validates() {
        let dir = std::env::temp_dir();
        let good = dir.join(format!("keygate-file-test-{}.yaml", std::process::id()));
        let bad = dir.join(format!("keygate-file-bad-{}.yaml", std::process::id()));
        std::fs::write(&good, "limiter:\n  base_limit: 7\nsimulation:\n  keys: 2\n").unwrap();
        std::fs::write(&bad, "limiter:\n  window_ms: 0\n").unwrap();

        let config = AppConfig::from_file(&good);
        let rejected = AppConfig::from_file(&bad);
        std::fs::remove_file(&good).ok();
        std::fs::remove_file(&bad).ok();

        let config = config.unwrap();
        assert_eq!(config.limiter.base_limit, 7.0);
        assert_eq!(config.simulation.keys, 2);
        assert!(matches!(rejected, Err(KeygateError::Config(_))));
        assert!(AppConfig::from_file(dir.join("keygate-missing.yaml")).is_err());
    }
}
