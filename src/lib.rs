//! xHCI USB host stack and class drivers for a hobby kernel.
//!
//! The crate owns the xHCI controller driver, the USB device/interface/
//! endpoint tree it enumerates, the hub class driver, and the boot
//! keyboard/mouse and mass-storage class drivers, together with the
//! deferred-work dispatcher and device-interrupt registry they run on.
//! Everything the embedding kernel must provide (frames, clock, interrupt
//! controller, PCI config space) goes through [`platform::Platform`].
#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod config;
pub mod devices;
pub mod drivers;
pub mod logging;
pub mod memory;
pub mod platform;
pub mod storage;
pub mod utils;

pub use memory::{PhysAddr, VirtAddr};

/// Returns the number of milliseconds since the system was started.
#[macro_export]
macro_rules! time {
    () => {
        $crate::platform::time_ms()
    };
}

#[macro_export]
macro_rules! sleep {
    ($ms:literal ms) => {
        $crate::platform::sleep_ms($ms)
    };
    ($ms:expr) => {
        $crate::platform::sleep_ms($ms)
    };
}

/// Polls `$cond` until it holds or `$ms` milliseconds have passed,
/// yielding between attempts. Evaluates to whether the condition was met.
#[macro_export]
macro_rules! sleep_until {
    ($ms:literal ms, $cond:expr) => {
        $crate::sleep_until!($ms, $cond)
    };
    ($ms:expr, $cond:expr) => {{
        let deadline = $crate::platform::time_ms() + ($ms) as u64;
        let mut met = false;
        loop {
            if $cond {
                met = true;
                break;
            }
            if $crate::platform::time_ms() >= deadline {
                break;
            }
            $crate::platform::thread_yield();
        }
        met
    }};
}
