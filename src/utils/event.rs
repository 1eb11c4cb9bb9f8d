//! Minimal kernel-event object for the deferred-work dispatcher.
//!
//! Stays signalled until reset, like the scheduler's event objects. The
//! wait degrades to a yield loop against the platform clock; the embedding
//! kernel's scheduler decides what a yield costs.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Signaled,
    Timeout,
}

#[derive(Debug)]
pub struct KernelEvent {
    signaled: AtomicBool,
}

impl KernelEvent {
    pub const fn new() -> Self {
        Self {
            signaled: AtomicBool::new(false),
        }
    }

    pub fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Waits until the event is signalled or `timeout_ms` elapses. Does not
    /// consume the signal.
    pub fn wait_timeout(&self, timeout_ms: u64) -> WaitResult {
        let deadline = platform::time_ms() + timeout_ms;
        loop {
            if self.is_signaled() {
                return WaitResult::Signaled;
            }
            if platform::time_ms() >= deadline {
                return WaitResult::Timeout;
            }
            platform::thread_yield();
        }
    }
}
