//! Limiter key validation.

use std::borrow::Borrow;

use crate::error::{KeygateError, Result};

/// Identity under which a limit is tracked (user id, API key, IP, ...).
///
/// The engine never interprets the contents; the only contract is that the
/// key is non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LimiterKey(String);

impl LimiterKey {
    /// Validate and wrap a key.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(KeygateError::InvalidKey("key must not be empty".to_string()));
        }
        Ok(Self(key))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for LimiterKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_key_creation() {
        let key = LimiterKey::new("user:42").unwrap();
        assert_eq!(key.as_str(), "user:42");
        assert_eq!(key.to_string(), "user:42");
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(
            LimiterKey::new(""),
            Err(KeygateError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(LimiterKey::new("10.0.0.1").unwrap(), 7);
        assert_eq!(map.get("10.0.0.1"), Some(&7));
        assert_eq!(map.get("10.0.0.2"), None);
    }
}
