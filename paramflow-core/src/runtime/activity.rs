//! Quiescence detection for the iteration loop.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Shared tracker of loop traffic.
///
/// Every enqueue into a partition queue increments the in-flight count;
/// every completed handler decrements it. The loop is quiescent once the
/// count is zero and no event has completed for the configured wait, which
/// is exactly the "no record traversed the loop" condition: a counted but
/// unprocessed event keeps the count positive, and a handler that is still
/// running keeps its own event counted until it returns.
pub(crate) struct LoopActivity {
    started: Instant,
    in_flight: AtomicI64,
    last_activity_ms: AtomicU64,
    aborted: AtomicBool,
}

impl LoopActivity {
    pub(crate) fn new() -> Self {
        Self {
            started: Instant::now(),
            in_flight: AtomicI64::new(0),
            last_activity_ms: AtomicU64::new(0),
            aborted: AtomicBool::new(false),
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn touch(&self) {
        self.last_activity_ms.store(self.now_ms(), Ordering::SeqCst);
    }

    /// An event entered a partition queue.
    pub(crate) fn sent(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    /// An event left a queue and its handler ran to completion.
    pub(crate) fn done(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.touch();
    }

    /// A partition failed; the job must tear down.
    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub(crate) fn quiescent(&self, wait: Duration) -> bool {
        if self.in_flight.load(Ordering::SeqCst) != 0 {
            return false;
        }
        let idle = self
            .now_ms()
            .saturating_sub(self.last_activity_ms.load(Ordering::SeqCst));
        idle >= wait.as_millis() as u64
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::LoopActivity;

    #[test]
    fn test_in_flight_blocks_quiescence() {
        let activity = LoopActivity::new();
        activity.sent();
        assert_eq!(activity.in_flight(), 1);
        assert!(!activity.quiescent(Duration::ZERO));
        activity.done();
        assert_eq!(activity.in_flight(), 0);
    }

    #[test]
    fn test_idle_elapses_into_quiescence() {
        let activity = LoopActivity::new();
        activity.sent();
        activity.done();
        assert!(!activity.quiescent(Duration::from_secs(3600)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(activity.quiescent(Duration::from_millis(10)));
    }

    #[test]
    fn test_abort_is_sticky() {
        let activity = LoopActivity::new();
        assert!(!activity.is_aborted());
        activity.abort();
        assert!(activity.is_aborted());
    }
}
