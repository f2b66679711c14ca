//! Leaky bucket implementation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::config::BucketConfig;
use crate::error::{Result, SluiceError};

/// A fixed-capacity slot pool drained at a constant rate.
///
/// Each successful [`try_reserve`](Self::try_reserve) occupies one slot, and a
/// background task frees exactly one occupied slot per drain interval. Slots
/// are never freed by finished work, only by the clock, and a tick that finds
/// the bucket empty is lost rather than banked for a later burst.
///
/// The drain task is spawned on the current tokio runtime at construction and
/// lives until [`shutdown`](Self::shutdown) is called or the bucket is dropped.
///
/// Occupancy can only go down through a drain tick; there is no public way
/// to release a slot early:
///
/// ```compile_fail
/// # async fn release_early() -> sluice::error::Result<()> {
/// let bucket = sluice::ratelimit::LeakyBucket::new(1, std::time::Duration::from_secs(60))?;
/// bucket.try_reserve();
/// bucket.drain_once();
/// # Ok(())
/// # }
/// ```
pub struct LeakyBucket {
    /// Occupancy state shared with the drain task
    state: Arc<BucketState>,
    /// Stops the drain task
    cancel: CancellationToken,
    /// Handle of the drain task, taken on shutdown
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

struct BucketState {
    capacity: usize,
    drain_interval: Duration,
    occupancy: Mutex<usize>,
}

impl BucketState {
    fn try_reserve(&self) -> bool {
        let mut occupancy = self.occupancy.lock();
        if *occupancy < self.capacity {
            *occupancy += 1;
            trace!(occupancy = *occupancy, capacity = self.capacity, "Slot reserved");
            true
        } else {
            false
        }
    }

    fn drain_once(&self) -> bool {
        let mut occupancy = self.occupancy.lock();
        if *occupancy > 0 {
            *occupancy -= 1;
            trace!(occupancy = *occupancy, "Slot drained");
            true
        } else {
            false
        }
    }
}

impl LeakyBucket {
    /// Create a new leaky bucket and start draining it.
    ///
    /// Must be called from within a tokio runtime. The first drain tick fires
    /// one full `drain_interval` after construction.
    pub fn new(capacity: usize, drain_interval: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(SluiceError::Config(
                "bucket capacity must be greater than zero".to_string(),
            ));
        }
        if drain_interval.is_zero() {
            return Err(SluiceError::Config(
                "bucket drain interval must be greater than zero".to_string(),
            ));
        }

        let state = Arc::new(BucketState {
            capacity,
            drain_interval,
            occupancy: Mutex::new(0),
        });
        let cancel = CancellationToken::new();
        let first_tick = Instant::now() + drain_interval;
        let tick = {
            let state = state.clone();
            move || state.drain_once()
        };
        let drain_task = tokio::spawn(drain_loop(tick, drain_interval, cancel.clone(), first_tick));

        debug!(
            capacity = capacity,
            drain_interval_ms = drain_interval.as_millis() as u64,
            "Leaky bucket created"
        );

        Ok(Self {
            state,
            cancel,
            drain_task: Mutex::new(Some(drain_task)),
        })
    }

    /// Create a leaky bucket from configuration.
    pub fn from_config(config: &BucketConfig) -> Result<Self> {
        Self::new(config.capacity, config.drain_interval())
    }

    /// Try to reserve one slot.
    ///
    /// Returns `true` if a slot was reserved, `false` if the bucket is full.
    /// Never waits.
    pub fn try_reserve(&self) -> bool {
        self.state.try_reserve()
    }

    /// Get the capacity of the bucket.
    pub fn capacity(&self) -> usize {
        self.state.capacity
    }

    /// Get the time between drain ticks.
    pub fn drain_interval(&self) -> Duration {
        self.state.drain_interval
    }

    /// Get the number of reserved, undrained slots.
    pub fn occupancy(&self) -> usize {
        *self.state.occupancy.lock()
    }

    /// Get the number of free slots.
    pub fn available(&self) -> usize {
        self.state.capacity - self.occupancy()
    }

    /// Whether the drain task is still running.
    pub fn is_running(&self) -> bool {
        self.drain_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop the drain task and wait for it to exit.
    ///
    /// Reserved slots are no longer released afterwards. Calling this more
    /// than once is a no-op.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let task = self.drain_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Drain task terminated abnormally");
            }
            info!(occupancy = self.occupancy(), "Leaky bucket stopped");
        }
    }
}

impl Drop for LeakyBucket {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for LeakyBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeakyBucket")
            .field("capacity", &self.state.capacity)
            .field("drain_interval", &self.state.drain_interval)
            .field("occupancy", &self.occupancy())
            .finish()
    }
}

/// Run `tick` once per `period` until cancelled.
///
/// A panicking tick is logged and the loop keeps going.
async fn drain_loop<F>(tick: F, period: Duration, cancel: CancellationToken, first_tick: Instant)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let mut ticker = interval_at(first_tick, period);
    // A stalled runtime must not release a burst of catch-up ticks.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Drain loop cancelled");
                break;
            }
            _ = ticker.tick() => {
                let guarded = AssertUnwindSafe(async { tick() });
                if let Err(panic) = guarded.catch_unwind().await {
                    error!(panic = ?panic, "Drain tick panicked, continuing");
                }
            }
        }
    }
}
