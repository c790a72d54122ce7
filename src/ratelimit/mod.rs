//! Per-key admission control: sliding windows, rate estimation and limit adjustment.

mod adjuster;
mod backend;
mod clock;
mod estimator;
mod key;
mod limiter;
mod rules;
mod sweeper;
mod window;

pub use adjuster::{next_limit, AdjustPolicy, LimitAdjuster};
pub use backend::AdmissionControl;
pub use clock::{Clock, ManualClock, SystemClock};
pub use estimator::RateEstimator;
pub use key::LimiterKey;
pub use limiter::{Code, Decision, KeySnapshot, KeyedLimiterRegistry};
pub use rules::{LimitBounds, LimitOverride, OverrideRules};
pub use sweeper::{Sweeper, SweeperHandle};
pub use window::{capacity, SlidingWindowCounter};
