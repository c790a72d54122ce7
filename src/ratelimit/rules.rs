//! Per-key limit overrides.
//!
//! Overrides let selected keys (matched exactly or by prefix) start from, and
//! stay within, different limits than the global configuration. They are
//! consulted once, when a key's entry is created.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::config::{validate_bounds, LimiterConfig};
use crate::error::{KeygateError, Result};

/// A set of override rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverrideRules {
    /// Rules in declaration order
    #[serde(default)]
    pub overrides: Vec<LimitOverride>,
}

/// One override rule.
///
/// Exactly one of `key` and `prefix` must be set. Bounds left unset inherit
/// the global configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitOverride {
    /// Exact key to match
    #[serde(default)]
    pub key: Option<String>,
    /// Key prefix to match (e.g. `ip:`)
    #[serde(default)]
    pub prefix: Option<String>,
    /// Starting limit
    #[serde(default)]
    pub base_limit: Option<f64>,
    /// Floor for the adjusted limit
    #[serde(default)]
    pub min_limit: Option<f64>,
    /// Ceiling for the adjusted limit
    #[serde(default)]
    pub max_limit: Option<f64>,
    /// Optional name/description for this rule
    #[serde(default)]
    pub name: Option<String>,
}

/// Resolved `(base, min, max)` limits for one key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitBounds {
    pub base_limit: f64,
    pub min_limit: f64,
    pub max_limit: f64,
}

impl LimitBounds {
    /// Global bounds from a limiter configuration.
    pub fn from_config(config: &LimiterConfig) -> Self {
        Self {
            base_limit: config.base_limit,
            min_limit: config.min_limit,
            max_limit: config.max_limit,
        }
    }
}

impl LimitOverride {
    /// How specifically this rule matches `key`, if at all.
    ///
    /// Exact matches beat any prefix; longer prefixes beat shorter ones.
    fn specificity(&self, key: &str) -> Option<usize> {
        if let Some(ref exact) = self.key {
            return (exact == key).then_some(usize::MAX);
        }
        match self.prefix {
            Some(ref prefix) if key.starts_with(prefix.as_str()) => Some(prefix.len()),
            _ => None,
        }
    }

    /// Overlay this rule on `defaults`.
    pub fn resolve(&self, defaults: LimitBounds) -> LimitBounds {
        LimitBounds {
            base_limit: self.base_limit.unwrap_or(defaults.base_limit),
            min_limit: self.min_limit.unwrap_or(defaults.min_limit),
            max_limit: self.max_limit.unwrap_or(defaults.max_limit),
        }
    }

    fn describe(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.key.clone().map(|k| format!("key={}", k)))
            .or_else(|| self.prefix.clone().map(|p| format!("prefix={}", p)))
            .unwrap_or_else(|| "<unnamed>".to_string())
    }
}

impl OverrideRules {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limit overrides");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    ///
    /// Accepts either a bare list of rules or a document with an `overrides` list.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules = match serde_yaml::from_str::<Vec<LimitOverride>>(yaml) {
            Ok(overrides) => OverrideRules { overrides },
            Err(_) => serde_yaml::from_str(yaml).map_err(|e| {
                KeygateError::Config(format!("Failed to parse limit overrides: {}", e))
            })?,
        };

        for rule in &rules.overrides {
            if rule.key.is_some() == rule.prefix.is_some() {
                return Err(KeygateError::Config(format!(
                    "override {} must set exactly one of `key` or `prefix`",
                    rule.describe()
                )));
            }
        }

        Ok(rules)
    }

    /// Check that every rule resolves to valid bounds under `config`.
    pub fn validate(&self, config: &LimiterConfig) -> Result<()> {
        let defaults = LimitBounds::from_config(config);
        for rule in &self.overrides {
            let bounds = rule.resolve(defaults);
            validate_bounds(bounds.base_limit, bounds.min_limit, bounds.max_limit).map_err(
                |e| KeygateError::Config(format!("override {}: {}", rule.describe(), e)),
            )?;
        }
        Ok(())
    }

    /// Most specific rule matching `key`.
    pub fn find(&self, key: &str) -> Option<&LimitOverride> {
        let mut best: Option<(usize, &LimitOverride)> = None;
        for rule in &self.overrides {
            if let Some(score) = rule.specificity(key) {
                if best.map_or(true, |(s, _)| score > s) {
                    best = Some((score, rule));
                }
            }
        }
        best.map(|(_, rule)| rule)
    }

    /// Bounds for `key`: the matching rule overlaid on `defaults`.
    pub fn bounds_for(&self, key: &str, defaults: LimitBounds) -> LimitBounds {
        match self.find(key) {
            Some(rule) => rule.resolve(defaults),
            None => defaults,
        }
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    /// Whether there are no rules.
    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
overrides:
  - key: "user:alice"
    base_limit: 100
    max_limit: 500
    name: alice
  - prefix: "user:"
    base_limit: 20
  - prefix: "ip:"
    base_limit: 5
    min_limit: 1
    max_limit: 10
  - prefix: "ip:10."
    base_limit: 50
    max_limit: 50
"#;

    fn defaults() -> LimitBounds {
        LimitBounds::from_config(&LimiterConfig::default())
    }

    #[test]
    fn test_parse_rules() {
        let rules = OverrideRules::from_yaml(RULES).unwrap();
        assert_eq!(rules.len(), 4);
        assert_eq!(rules.overrides[0].name.as_deref(), Some("alice"));
    }

    #[test]
    fn test_parse_bare_list() {
        let yaml = r#"
- prefix: "api:"
  base_limit: 3
"#;
        let rules = OverrideRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn test_exact_beats_prefix() {
        let rules = OverrideRules::from_yaml(RULES).unwrap();

        let bounds = rules.bounds_for("user:alice", defaults());
        assert_eq!(bounds.base_limit, 100.0);
        assert_eq!(bounds.max_limit, 500.0);

        let bounds = rules.bounds_for("user:bob", defaults());
        assert_eq!(bounds.base_limit, 20.0);
        // Inherited from the global configuration
        assert_eq!(bounds.max_limit, 100.0);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let rules = OverrideRules::from_yaml(RULES).unwrap();

        assert_eq!(rules.bounds_for("ip:10.1.2.3", defaults()).base_limit, 50.0);
        assert_eq!(rules.bounds_for("ip:192.168.0.1", defaults()).base_limit, 5.0);
    }

    #[test]
    fn test_no_match_uses_defaults() {
        let rules = OverrideRules::from_yaml(RULES).unwrap();
        assert!(rules.find("session:xyz").is_none());
        assert_eq!(rules.bounds_for("session:xyz", defaults()), defaults());
    }

    #[test]
    fn test_rule_needs_one_selector() {
        let both = r#"
overrides:
  - key: a
    prefix: b
    base_limit: 1
"#;
        assert!(OverrideRules::from_yaml(both).is_err());

        let neither = r#"
overrides:
  - base_limit: 1
"#;
        assert!(OverrideRules::from_yaml(neither).is_err());
    }

    #[test]
    fn test_validate_against_config() {
        let rules = OverrideRules::from_yaml(RULES).unwrap();
        assert!(rules.validate(&LimiterConfig::default()).is_ok());

        let bad = r#"
overrides:
  - prefix: "ip:"
    base_limit: 1000
"#;
        let rules = OverrideRules::from_yaml(bad).unwrap();
        assert!(matches!(
            rules.validate(&LimiterConfig::default()),
            Err(KeygateError::Config(_))
        ));
    }
}
