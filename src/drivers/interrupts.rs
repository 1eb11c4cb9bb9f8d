//! Device interrupt registry: vector slots, top-half vetos, polling fallback.
//!
//! Each registered device gets one vector slot (`vector = BASE + slot`) and
//! a paired deferred-work item. The top half runs in interrupt context and
//! votes on whether the bottom half should run; a device that keeps vetoing
//! while its IRQ is armed is spamming a shared line, so the slot demotes
//! itself to polling after a threshold. Handlers are held as `Weak`
//! references: a driver may free its device between interrupt delivery and
//! bottom-half execution, the failed upgrade just drops the dispatch.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use crate::drivers::deferred_work::{self, DeferredWorkHandle, DeferredWorkRegistration};
use crate::utils::locks::Mutex;
use crate::{config, debug, error, warn};

pub const DEVICE_INTERRUPT_VECTOR_BASE: u8 = 0x70;
pub const DEVICE_INTERRUPT_VECTOR_MAX: u8 = 16;
pub const DEVICE_INTERRUPT_VECTOR_DEFAULT: u8 = 8;
pub const DEVICE_INTERRUPT_SPURIOUS_THRESHOLD: u32 = 64;

const INTERRUPT_LOG_SAMPLE_LIMIT: u32 = 16;

pub trait DeviceInterruptHandler: Send + Sync {
    /// Top half, interrupt context: inspect hardware state and vote.
    /// Returning false vetoes the bottom half.
    fn interrupt(&self) -> bool;

    /// Bottom half, dispatcher task context.
    fn deferred(&self);

    /// Polling fallback, dispatcher task context.
    fn poll(&self) {}
}

pub struct DeviceInterruptRegistration {
    pub handler: Weak<dyn DeviceInterruptHandler>,
    /// None when the device has no usable IRQ line; the slot then runs in
    /// polling mode from the start.
    pub legacy_irq: Option<u8>,
    pub target_cpu: u8,
    /// Whether the handler's `poll` does anything; a demoted slot without a
    /// poll path is dead and worth a louder warning.
    pub wants_poll: bool,
    pub name: &'static str,
}

/// Counters and flags shared with the deferred-work thunks.
struct SlotShared {
    interrupt_count: AtomicU32,
    deferred_count: AtomicU32,
    poll_count: AtomicU32,
    suppressed_count: AtomicU32,
    interrupt_enabled: AtomicBool,
}

struct SlotState {
    handler: Weak<dyn DeviceInterruptHandler>,
    legacy_irq: Option<u8>,
    #[allow(dead_code)]
    target_cpu: u8,
    deferred_handle: DeferredWorkHandle,
    wants_poll: bool,
    name: &'static str,
    shared: Arc<SlotShared>,
}

struct Entry {
    state: Mutex<Option<SlotState>>,
}

impl Entry {
    const fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_ENTRY: Entry = Entry::new();

static ENTRIES: [Entry; DEVICE_INTERRUPT_VECTOR_MAX as usize] =
    [EMPTY_ENTRY; DEVICE_INTERRUPT_VECTOR_MAX as usize];

static SLOT_COUNT: AtomicU8 = AtomicU8::new(DEVICE_INTERRUPT_VECTOR_DEFAULT);

pub struct DeviceInterruptRegistry;

pub fn slot_count() -> u8 {
    SLOT_COUNT.load(Ordering::Relaxed).clamp(1, DEVICE_INTERRUPT_VECTOR_MAX)
}

pub const fn vector_for_slot(slot: u8) -> u8 {
    DEVICE_INTERRUPT_VECTOR_BASE + slot
}

/// Applies `General.DeviceInterruptSlots`, clamped to the vector capacity.
pub fn initialize() {
    let mut count = DEVICE_INTERRUPT_VECTOR_DEFAULT;

    if let Some(requested) = config::get_u32(config::GENERAL_DEVICE_INTERRUPT_SLOTS) {
        if requested == 0 {
            warn!(
                DeviceInterruptRegistry,
                "requested slot count is zero, forcing minimum of 1"
            );
            count = 1;
        } else if requested > DEVICE_INTERRUPT_VECTOR_MAX as u32 {
            warn!(
                DeviceInterruptRegistry,
                "requested slot count {requested} exceeds capacity {DEVICE_INTERRUPT_VECTOR_MAX}"
            );
            count = DEVICE_INTERRUPT_VECTOR_MAX;
        } else {
            count = requested as u8;
        }
    }

    SLOT_COUNT.store(count, Ordering::Relaxed);
    debug!(
        DeviceInterruptRegistry,
        "active slots={count} (capacity={DEVICE_INTERRUPT_VECTOR_MAX})"
    );
}

/// Allocates the next free slot, wires the paired deferred-work item and
/// programs the interrupt controller unless polling mode forbids it.
pub fn register(registration: DeviceInterruptRegistration) -> Option<u8> {
    let count = slot_count();

    for index in 0..count {
        let entry = &ENTRIES[index as usize];
        let mut state = entry.state.lock();
        if state.is_some() {
            continue;
        }

        let shared = Arc::new(SlotShared {
            interrupt_count: AtomicU32::new(0),
            deferred_count: AtomicU32::new(0),
            poll_count: AtomicU32::new(0),
            suppressed_count: AtomicU32::new(0),
            interrupt_enabled: AtomicBool::new(false),
        });

        let deferred_handle = {
            let work_handler = registration.handler.clone();
            let work_shared = shared.clone();
            let work_name = registration.name;
            let work = move || {
                let Some(device) = work_handler.upgrade() else {
                    return;
                };
                let n = work_shared.deferred_count.fetch_add(1, Ordering::Relaxed) + 1;
                if n <= INTERRUPT_LOG_SAMPLE_LIMIT {
                    debug!(DeviceInterruptRegistry, "deferred {work_name} count={n}");
                }
                device.deferred();
            };

            let poll = registration.wants_poll.then(|| {
                let poll_handler = registration.handler.clone();
                let poll_shared = shared.clone();
                let cb: deferred_work::Callback = Arc::new(move || {
                    let Some(device) = poll_handler.upgrade() else {
                        return;
                    };
                    poll_shared.poll_count.fetch_add(1, Ordering::Relaxed);
                    device.poll();
                });
                cb
            });

            deferred_work::register(DeferredWorkRegistration {
                work: Some(Arc::new(work)),
                poll,
                name: registration.name,
            })
        };

        let Some(deferred_handle) = deferred_handle else {
            error!(
                DeviceInterruptRegistry,
                "failed to register deferred work for slot {index}"
            );
            return None;
        };

        let polling_mode = deferred_work::is_polling_mode();
        let should_configure = registration.legacy_irq.is_some() && !polling_mode;
        let mut configured = false;

        if should_configure {
            let irq = registration.legacy_irq.unwrap();
            let vector = vector_for_slot(index);
            let platform = crate::platform::get();

            if platform.configure_device_interrupt(irq, vector, registration.target_cpu) {
                if platform.enable_device_interrupt(irq) {
                    configured = true;
                } else {
                    warn!(DeviceInterruptRegistry, "failed to enable IRQ {irq}");
                }
            } else {
                warn!(
                    DeviceInterruptRegistry,
                    "failed to configure IRQ {irq} for vector {vector}"
                );
            }
        }

        shared.interrupt_enabled.store(configured, Ordering::Release);

        debug!(
            DeviceInterruptRegistry,
            "slot {index} assigned to {} IRQ {:?} vector {}",
            registration.name,
            registration.legacy_irq,
            vector_for_slot(index)
        );
        if !configured {
            debug!(DeviceInterruptRegistry, "slot {index} operating in polling mode");
        }

        *state = Some(SlotState {
            handler: registration.handler,
            legacy_irq: registration.legacy_irq,
            target_cpu: registration.target_cpu,
            deferred_handle,
            wants_poll: registration.wants_poll,
            name: registration.name,
            shared,
        });

        return Some(index);
    }

    error!(DeviceInterruptRegistry, "no free device interrupt slots");
    None
}

pub fn unregister(slot: u8) -> bool {
    if slot >= slot_count() {
        return false;
    }

    let entry = &ENTRIES[slot as usize];
    let mut guard = entry.state.lock();
    let Some(state) = guard.take() else {
        return false;
    };

    if state.shared.interrupt_enabled.load(Ordering::Acquire) {
        if let Some(irq) = state.legacy_irq {
            crate::platform::get().disable_device_interrupt(irq);
        }
    }
    deferred_work::unregister(state.deferred_handle);

    debug!(
        DeviceInterruptRegistry,
        "slot {slot} released (IRQ {:?}, {})", state.legacy_irq, state.name
    );
    true
}

/// Top-half entry point, called from the vector stub in interrupt context.
pub fn handler(slot: u8) {
    if slot >= slot_count() {
        return;
    }

    // try_lock: a registration racing on another CPU just loses this
    // interrupt, the line is either level-triggered or polled anyway.
    let Some(guard) = ENTRIES[slot as usize].state.try_lock() else {
        return;
    };
    let Some(state) = guard.as_ref() else {
        debug!(DeviceInterruptRegistry, "spurious device interrupt on slot {slot}");
        return;
    };

    let handler = state.handler.clone();
    let legacy_irq = state.legacy_irq;
    let deferred_handle = state.deferred_handle;
    let wants_poll = state.wants_poll;
    let name = state.name;
    let shared = state.shared.clone();
    drop(guard);

    let count = shared.interrupt_count.fetch_add(1, Ordering::Relaxed) + 1;
    if count <= INTERRUPT_LOG_SAMPLE_LIMIT {
        debug!(
            DeviceInterruptRegistry,
            "slot={slot} irq={legacy_irq:?} {name} count={count} enabled={}",
            shared.interrupt_enabled.load(Ordering::Relaxed)
        );
    }

    // The device may have been released since delivery.
    let Some(device) = handler.upgrade() else {
        return;
    };

    let should_signal = device.interrupt();

    if should_signal {
        shared.suppressed_count.store(0, Ordering::Relaxed);
        deferred_work::signal(deferred_handle);
        return;
    }

    if !shared.interrupt_enabled.load(Ordering::Acquire) {
        return;
    }

    // Veto with the IRQ still armed: suspicious, count towards demotion.
    let suppressed = shared.suppressed_count.fetch_add(1, Ordering::Relaxed) + 1;
    let should_warn = count <= 8 || count % 256 == 0;
    if should_warn {
        warn!(
            DeviceInterruptRegistry,
            "slot={slot} irq={legacy_irq:?} handler suppressed signal while IRQ still armed (count={count})"
        );
    }

    if suppressed >= DEVICE_INTERRUPT_SPURIOUS_THRESHOLD {
        if let Some(irq) = legacy_irq {
            warn!(
                DeviceInterruptRegistry,
                "slot={slot} irq={irq} disabled after {suppressed} suppressed signals"
            );
            crate::platform::get().disable_device_interrupt(irq);
            shared.interrupt_enabled.store(false, Ordering::Release);
            shared.suppressed_count.store(0, Ordering::Relaxed);
            if wants_poll {
                warn!(DeviceInterruptRegistry, "slot={slot} falling back to polling");
            }
        }
    }
}

pub fn slot_is_enabled(slot: u8) -> bool {
    if slot >= slot_count() {
        return false;
    }

    let guard = ENTRIES[slot as usize].state.lock();
    guard
        .as_ref()
        .map(|state| state.shared.interrupt_enabled.load(Ordering::Acquire))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;

    struct VetoDevice {
        vetoes: AtomicU32,
        deferred: AtomicU32,
        polls: AtomicU32,
        vote: AtomicBool,
    }

    impl VetoDevice {
        fn new(vote: bool) -> Self {
            Self {
                vetoes: AtomicU32::new(0),
                deferred: AtomicU32::new(0),
                polls: AtomicU32::new(0),
                vote: AtomicBool::new(vote),
            }
        }
    }

    impl DeviceInterruptHandler for VetoDevice {
        fn interrupt(&self) -> bool {
            let vote = self.vote.load(Ordering::Relaxed);
            if !vote {
                self.vetoes.fetch_add(1, Ordering::Relaxed);
            }
            vote
        }

        fn deferred(&self) {
            self.deferred.fetch_add(1, Ordering::Relaxed);
        }

        fn poll(&self) {
            self.polls.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn setup() {
        crate::platform::test::setup();
        deferred_work::initialize();
        initialize();
    }

    #[test]
    fn veto_demotes_after_threshold() {
        setup();
        let _serial = crate::platform::test::serial_guard();
        let device = Arc::new(VetoDevice::new(false));
        let weak: Weak<dyn DeviceInterruptHandler> = {
            let weak = Arc::downgrade(&device);
            weak
        };

        let slot = register(DeviceInterruptRegistration {
            handler: weak,
            legacy_irq: Some(11),
            target_cpu: 0,
            wants_poll: true,
            name: "veto-test",
        })
        .unwrap();

        assert!(slot_is_enabled(slot));

        for _ in 0..DEVICE_INTERRUPT_SPURIOUS_THRESHOLD {
            handler(slot);
        }
        assert!(!slot_is_enabled(slot));
        assert_eq!(
            device.vetoes.load(Ordering::Relaxed),
            DEVICE_INTERRUPT_SPURIOUS_THRESHOLD
        );

        // A demoted slot no longer counts suppressions.
        handler(slot);
        {
            let guard = ENTRIES[slot as usize].state.lock();
            let shared = guard.as_ref().unwrap().shared.clone();
            assert_eq!(shared.suppressed_count.load(Ordering::Relaxed), 0);
        }

        // The poll path keeps running after demotion.
        deferred_work::process_poll_callbacks();
        assert!(device.polls.load(Ordering::Relaxed) >= 1);

        assert!(unregister(slot));
    }

    #[test]
    fn good_interrupt_signals_bottom_half() {
        setup();
        let _serial = crate::platform::test::serial_guard();
        let device = Arc::new(VetoDevice::new(true));
        let device_dyn: Arc<dyn DeviceInterruptHandler> = device.clone();
        let weak: Weak<dyn DeviceInterruptHandler> = Arc::downgrade(&device_dyn);

        let slot = register(DeviceInterruptRegistration {
            handler: weak,
            legacy_irq: Some(10),
            target_cpu: 0,
            wants_poll: false,
            name: "signal-test",
        })
        .unwrap();

        handler(slot);
        handler(slot);
        deferred_work::process_pending_work();
        assert_eq!(device.deferred.load(Ordering::Relaxed), 2);

        assert!(unregister(slot));
    }

    #[test]
    fn released_device_is_not_dispatched() {
        setup();
        let _serial = crate::platform::test::serial_guard();
        let device = Arc::new(VetoDevice::new(true));
        let device_dyn: Arc<dyn DeviceInterruptHandler> = device.clone();
        let weak: Weak<dyn DeviceInterruptHandler> = Arc::downgrade(&device_dyn);

        let slot = register(DeviceInterruptRegistration {
            handler: weak,
            legacy_irq: Some(9),
            target_cpu: 0,
            wants_poll: true,
            name: "release-test",
        })
        .unwrap();

        drop(device);

        // Neither path reaches a freed device.
        handler(slot);
        deferred_work::process_pending_work();
        deferred_work::process_poll_callbacks();

        assert!(unregister(slot));
    }
}
