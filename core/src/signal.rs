//! Refresh signal between the watcher task and the scanner.
//!
//! Single producer (the watcher sets it), single consumer (the scanner
//! clears it after consuming). An atomic flag plus a notifier is the
//! whole synchronization story; no shared collection is written by both
//! sides.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::Notify;

/// "Something changed" signal with a generation counter.
#[derive(Debug, Default)]
pub struct RefreshSignal {
    flagged: AtomicBool,
    generation: AtomicU64,
    notify: Notify,
}

impl RefreshSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake any waiter. Each set bumps the
    /// generation counter.
    pub fn set(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.flagged.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.flagged.load(Ordering::SeqCst)
    }

    /// Consume the signal.
    pub fn clear(&self) {
        self.flagged.store(false, Ordering::SeqCst);
    }

    /// Number of times the signal has ever been set.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Wait until the signal is set or the timeout elapses. Returns
    /// whether the signal was set.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let notified = self.notify.notified();
        if self.is_set() {
            return true;
        }
        tokio::select! {
            _ = notified => true,
            _ = tokio::time::sleep(timeout) => self.is_set(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn set_then_wait_returns_immediately() {
        let signal = RefreshSignal::new();
        signal.set();
        assert!(signal.wait(Duration::from_millis(1)).await);
        assert_eq!(signal.generation(), 1);
    }

    #[tokio::test]
    async fn wait_times_out_when_unset() {
        let signal = RefreshSignal::new();
        assert!(!signal.wait(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn set_wakes_a_parked_waiter() {
        let signal = Arc::new(RefreshSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.wait(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        signal.set();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn clear_consumes_the_signal() {
        let signal = RefreshSignal::new();
        signal.set();
        signal.clear();
        assert!(!signal.is_set());
        assert_eq!(signal.generation(), 1);
    }
}
