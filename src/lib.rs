//! Keygate - Adaptive Per-Key Admission Control
//!
//! This crate decides, per opaque key, whether a request may proceed. Each key
//! owns a sliding-window counter whose limit is steered by an exponentially
//! weighted estimate of the key's request rate. State lives in an explicitly
//! constructed [`ratelimit::KeyedLimiterRegistry`] that is safe to share
//! across threads.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod simulate;
