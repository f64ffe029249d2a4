//! Admission and pacing policies. Pure state machines with no I/O; the
//! pipeline owns one instance of each behind a single lock.

pub mod backoff;
pub mod dedup;
pub mod delay;
pub mod rate;
pub mod schedule;

pub use backoff::{Availability, BackoffPolicy, ErrorClass, ErrorClassifier};
pub use dedup::DedupCache;
pub use delay::AdaptiveDelayController;
pub use rate::RateGate;
pub use schedule::TimeWindowGate;
