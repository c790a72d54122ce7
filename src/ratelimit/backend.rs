//! Admission control trait for abstracting over limiter implementations.

use super::limiter::Decision;

/// Anything that can decide whether a request for a key may proceed.
///
/// Transports and load drivers depend on this trait rather than on the
/// registry type, so they can be exercised against any implementation.
pub trait AdmissionControl: Send + Sync {
    /// Decide admission for `key` at the implementation's current instant.
    fn allow(&self, key: &str) -> Decision;

    /// Boolean shorthand for [`allow`](Self::allow).
    fn is_allowed_now(&self, key: &str) -> bool {
        self.allow(key).allowed()
    }
}
