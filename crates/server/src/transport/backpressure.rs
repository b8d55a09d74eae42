use std::sync::atomic::{AtomicI64, Ordering};

/// Tracks how long a connection's outbound channel has been full. The
/// connection closes the socket once the blocked interval exceeds the
/// configured grace, instead of buffering without bound for a reader
/// that stopped draining.
#[derive(Default)]
pub struct BackpressureGuard {
    blocked_since_ms: AtomicI64,
}

impl BackpressureGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the first moment the channel was observed full. Later
    /// observations keep the original timestamp.
    pub fn mark_blocked(&self, now_ms: i64) {
        let _ = self.blocked_since_ms.compare_exchange(
            0,
            now_ms.max(1),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Clears the blocked state after a successful write.
    pub fn mark_drained(&self) {
        self.blocked_since_ms.store(0, Ordering::SeqCst);
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked_since_ms.load(Ordering::SeqCst) != 0
    }

    /// True once the channel has stayed full past the grace interval.
    pub fn exceeded(&self, now_ms: i64, grace_ms: i64) -> bool {
        let since = self.blocked_since_ms.load(Ordering::SeqCst);
        since != 0 && now_ms - since >= grace_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_interval_tracking() {
        let guard = BackpressureGuard::new();
        assert!(!guard.is_blocked());
        assert!(!guard.exceeded(10_000, 5_000));

        guard.mark_blocked(10_000);
        guard.mark_blocked(12_000);
        assert!(guard.is_blocked());
        assert!(!guard.exceeded(14_000, 5_000));
        assert!(guard.exceeded(15_000, 5_000));

        guard.mark_drained();
        assert!(!guard.is_blocked());
        assert!(!guard.exceeded(20_000, 5_000));
    }
}
