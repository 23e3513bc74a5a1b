//! Monotonic time helpers.
//!
//! The scheduler caches "now" once per loop iteration rather than calling
//! this on every comparison; see [`crate::scheduler::Scheduler::run`].

use std::sync::OnceLock;
use std::time::Instant;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Current monotonic time in milliseconds, relative to an arbitrary
/// process-local epoch. Only differences between calls are meaningful.
#[inline]
pub fn now_ms() -> u64 {
    epoch().elapsed().as_millis() as u64
}
