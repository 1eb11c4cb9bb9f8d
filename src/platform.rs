//! Contract between this crate and the embedding kernel.
//!
//! The page allocator, virtual-memory mapper, clock, scheduler yield,
//! interrupt-flag control, interrupt-controller programming and PCI
//! configuration space all live outside this crate; the kernel installs one
//! [`Platform`] implementation at boot and every module here goes through
//! it. The test build installs a hosted implementation so the logic can run
//! under the standard test harness.

use spin::Once;

use crate::drivers::pci::PciAddress;
use crate::memory::{PhysAddr, VirtAddr};

pub trait Platform: Send + Sync {
    /// Milliseconds since system start, monotonic.
    fn time_ms(&self) -> u64;

    /// Allocates one zeroed, page-aligned physical frame.
    fn allocate_frame(&self) -> Option<PhysAddr>;
    fn deallocate_frame(&self, frame: PhysAddr);

    fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr;
    fn virt_to_phys(&self, virt: VirtAddr) -> PhysAddr;

    /// Maps an MMIO range (device memory, uncacheable) and returns its
    /// linear address.
    fn map_mmio(&self, phys: PhysAddr, size: usize) -> Option<VirtAddr>;

    fn save_and_disable_interrupts(&self) -> usize;
    fn restore_interrupts(&self, flags: usize);

    fn thread_yield(&self);

    /// True while the scheduler cannot put tasks to sleep; sleeps then
    /// degrade to clock spins.
    fn scheduler_frozen(&self) -> bool {
        false
    }

    /// Routes a legacy IRQ to the given vector on the given CPU.
    fn configure_device_interrupt(&self, legacy_irq: u8, vector: u8, target_cpu: u8) -> bool;
    fn enable_device_interrupt(&self, legacy_irq: u8) -> bool;
    fn disable_device_interrupt(&self, legacy_irq: u8);

    fn pci_write_command(&self, address: PciAddress, value: u16);
    fn pci_read_command_status(&self, address: PciAddress) -> u32;
}

static PLATFORM: Once<&'static dyn Platform> = Once::new();

/// Installs the platform implementation. Only the first call wins.
pub fn install(platform: &'static dyn Platform) {
    PLATFORM.call_once(|| platform);
}

pub fn get() -> &'static dyn Platform {
    *PLATFORM
        .get()
        .expect("platform accessed before platform::install")
}

#[inline]
pub fn time_ms() -> u64 {
    get().time_ms()
}

#[inline]
pub fn thread_yield() {
    get().thread_yield()
}

/// Sleeps for `ms` milliseconds. Spins on the clock instead of yielding
/// when the scheduler is frozen.
pub fn sleep_ms(ms: u64) {
    let platform = get();
    let deadline = platform.time_ms() + ms;
    while platform.time_ms() < deadline {
        if platform.scheduler_frozen() {
            core::hint::spin_loop();
        } else {
            platform.thread_yield();
        }
    }
}

/// Runs `f` with interrupts masked, restoring the previous flag state.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let platform = get();
    let flags = platform.save_and_disable_interrupts();
    let result = f();
    platform.restore_interrupts(flags);
    result
}

#[cfg(test)]
pub(crate) mod test {
    //! Hosted platform used by the unit tests: identity-mapped, leaked
    //! 4 KiB allocations stand in for physical frames.

    use super::*;
    use crate::logging::{LogLevel, LogSink};
    use core::fmt::Arguments;
    use std::alloc::{Layout, alloc_zeroed, dealloc};
    use std::sync::Once as StdOnce;
    use std::time::Instant;

    struct HostPlatform {
        start: Instant,
    }

    impl Platform for HostPlatform {
        fn time_ms(&self) -> u64 {
            self.start.elapsed().as_millis() as u64
        }

        fn allocate_frame(&self) -> Option<PhysAddr> {
            let layout = Layout::from_size_align(crate::memory::PAGE_SIZE, crate::memory::PAGE_SIZE)
                .unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                None
            } else {
                Some(PhysAddr::new(ptr as usize))
            }
        }

        fn deallocate_frame(&self, frame: PhysAddr) {
            let layout = Layout::from_size_align(crate::memory::PAGE_SIZE, crate::memory::PAGE_SIZE)
                .unwrap();
            unsafe { dealloc(frame.into_raw() as *mut u8, layout) };
        }

        fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr {
            VirtAddr::new(phys.into_raw())
        }

        fn virt_to_phys(&self, virt: VirtAddr) -> PhysAddr {
            PhysAddr::new(virt.into_raw())
        }

        fn map_mmio(&self, phys: PhysAddr, _size: usize) -> Option<VirtAddr> {
            Some(VirtAddr::new(phys.into_raw()))
        }

        fn save_and_disable_interrupts(&self) -> usize {
            0
        }

        fn restore_interrupts(&self, _flags: usize) {}

        fn thread_yield(&self) {
            std::thread::yield_now();
        }

        fn configure_device_interrupt(&self, _irq: u8, _vector: u8, _cpu: u8) -> bool {
            true
        }

        fn enable_device_interrupt(&self, _irq: u8) -> bool {
            true
        }

        fn disable_device_interrupt(&self, _irq: u8) {}

        fn pci_write_command(&self, _address: PciAddress, _value: u16) {}

        fn pci_read_command_status(&self, _address: PciAddress) -> u32 {
            0
        }
    }

    struct StderrSink;

    impl LogSink for StderrSink {
        fn log(&self, level: LogLevel, module: Option<&str>, args: Arguments) {
            match module {
                Some(module) => eprintln!("[{:<5}] {}: {}", level.as_str(), module, args),
                None => eprintln!("[{:<5}] {}", level.as_str(), args),
            }
        }
    }

    static INIT: StdOnce = StdOnce::new();

    /// Serializes tests that poke global driver state (polling mode,
    /// interrupt slots) against each other.
    pub fn serial_guard() -> std::sync::MutexGuard<'static, ()> {
        static SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());
        SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Installs the hosted platform and a stderr log sink, once per process.
    pub fn setup() {
        INIT.call_once(|| {
            let platform = Box::leak(Box::new(HostPlatform {
                start: Instant::now(),
            }));
            install(platform);
            crate::logging::set_sink(&StderrSink);
        });
    }
}
