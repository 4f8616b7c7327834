//! Cooperative cancellation for long block operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Checked at every block boundary by encode/decode and erasure operations.
pub trait Cancellation {
    fn is_cancelled(&self) -> bool;
}

impl<F: Fn() -> bool> Cancellation for F {
    fn is_cancelled(&self) -> bool {
        self()
    }
}

/// Shared stop flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep up to `total`, waking early once stopped. Polls at 100ms.
    /// Returns false if stopped.
    pub fn sleep(&self, total: std::time::Duration) -> bool {
        let step = std::time::Duration::from_millis(100);
        let deadline = std::time::Instant::now() + total;
        loop {
            if self.is_stopped() {
                return false;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(step.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn closure_is_a_cancellation() {
        let flag = StopFlag::new();
        let removed = AtomicBool::new(false);
        let cancel = || flag.is_stopped() || removed.load(Ordering::SeqCst);
        assert!(!cancel.is_cancelled());
        removed.store(true, Ordering::SeqCst);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn sleep_wakes_on_stop() {
        let flag = StopFlag::new();
        let remote = flag.clone();
        let handle = std::thread::spawn(move || remote.sleep(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(50));
        flag.stop();
        assert!(!handle.join().unwrap());
    }
}
