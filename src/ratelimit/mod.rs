//! Leaky bucket rate limiting.

mod admission;
mod bucket;

pub use admission::AdmissionControl;
pub use bucket::LeakyBucket;
