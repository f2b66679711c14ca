//! Admission control trait used by the HTTP middleware.

use std::time::Duration;

use super::bucket::LeakyBucket;

/// Something that accepts or rejects a unit of work.
///
/// The middleware only needs this contract, so tests and alternative gates
/// can stand in for the [`LeakyBucket`].
pub trait AdmissionControl: Send + Sync {
    /// Try to admit one unit of work. Must not block.
    fn try_admit(&self) -> bool;

    /// Upper bound on how long a rejected caller should wait before retrying.
    fn retry_after(&self) -> Duration;
}

impl AdmissionControl for LeakyBucket {
    fn try_admit(&self) -> bool {
        self.try_reserve()
    }

    fn retry_after(&self) -> Duration {
        self.drain_interval()
    }
}
