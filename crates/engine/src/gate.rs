//! Startup readiness gate: live dispatch stays suppressed until every
//! registered kind has completed its initial full listing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::watch;

pub struct ReadinessGate {
    expected: usize,
    reported: AtomicUsize,
    synced: AtomicBool,
    all_reported: watch::Sender<bool>,
}

impl ReadinessGate {
    pub fn new(expected: usize) -> Self {
        let (all_reported, _) = watch::channel(expected == 0);
        Self { expected, reported: AtomicUsize::new(0), synced: AtomicBool::new(false), all_reported }
    }

    /// Record one handler's initial listing as complete. Callers report at
    /// most once per handler.
    pub(crate) fn report(&self) {
        let n = self.reported.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= self.expected {
            self.all_reported.send_replace(true);
        }
    }

    /// Resolves once every registered handler has reported. Returns
    /// immediately when that already happened.
    pub(crate) async fn wait_all_reported(&self) {
        let mut rx = self.all_reported.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Flip the public flag. Monotonic; there is no reset.
    pub(crate) fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }

    pub fn synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn waits_for_every_handler() {
        let gate = ReadinessGate::new(2);
        assert!(!gate.synced());
        gate.report();
        let mut rx = gate.all_reported.subscribe();
        assert!(!*rx.borrow_and_update());
        gate.report();
        gate.wait_all_reported().await;
        assert!(!gate.synced(), "synced flips only when the engine says so");
        gate.mark_synced();
        assert!(gate.synced());
        gate.mark_synced();
        assert!(gate.synced(), "transition is idempotent");
    }

    #[tokio::test]
    async fn zero_kinds_is_trivially_ready() {
        let gate = ReadinessGate::new(0);
        gate.wait_all_reported().await;
        gate.mark_synced();
        assert!(gate.synced());
    }
}
