//! Rate limiting for repeated log reports.
//!
//! Routing failures can repeat thousands of times per second while a shard is
//! degraded. Each warning call site holds one static [`LogThrottle`] so the
//! log carries one report per window instead of a flood.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Allows one report per window per call site.
///
/// Lock-free; two threads racing on a window boundary may both pass, which is
/// acceptable for log output.
pub(crate) struct LogThrottle {
    window_ms: u64,
    last_ms: AtomicU64,
}

impl LogThrottle {
    pub(crate) const fn new(window: Duration) -> Self {
        Self {
            window_ms: window.as_millis() as u64,
            last_ms: AtomicU64::new(0),
        }
    }

    /// Returns true iff the caller should emit its report now.
    pub(crate) fn allow(&self) -> bool {
        let now = current_time_ms();
        let last = self.last_ms.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < self.window_ms {
            return false;
        }
        self.last_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

pub(crate) fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
