//! Deferred work dispatcher: the bottom-half engine shared by every driver.
//!
//! Interrupt top halves only bump a per-item pending count and signal one
//! kernel event; a low-priority dispatcher task drains the counts and runs
//! the work callbacks in task context. When `General.Polling` forces
//! polling mode (or an item registered poll-only), the same task invokes
//! poll callbacks on a fixed cadence instead of sleeping on the event.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::utils::event::{KernelEvent, WaitResult};
use crate::utils::locks::Mutex;
use crate::{config, debug, error, platform, warn};

pub const DEFERRED_WORK_MAX_ITEMS: usize = 32;
pub const DEFERRED_WORK_WAIT_TIMEOUT_MS: u64 = 100;
pub const DEFERRED_WORK_POLL_DELAY_MS: u64 = 10;

pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Callbacks plus debug name for one registered item. The closure carries
/// the driver's context.
pub struct DeferredWorkRegistration {
    pub work: Option<Callback>,
    pub poll: Option<Callback>,
    pub name: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredWorkHandle(usize);

impl DeferredWorkHandle {
    pub const fn index(self) -> usize {
        self.0
    }

    pub const fn from_index(index: usize) -> Self {
        Self(index)
    }
}

struct SlotCallbacks {
    work: Option<Callback>,
    poll: Option<Callback>,
    name: &'static str,
}

struct Slot {
    /// Read from interrupt context by `signal`, so it lives outside the
    /// callback mutex.
    signalable: AtomicBool,
    pending: AtomicU32,
    callbacks: Mutex<Option<SlotCallbacks>>,
}

impl Slot {
    const fn new() -> Self {
        Self {
            signalable: AtomicBool::new(false),
            pending: AtomicU32::new(0),
            callbacks: Mutex::new(None),
        }
    }
}

struct DeferredWork {
    slots: [Slot; DEFERRED_WORK_MAX_ITEMS],
    event: KernelEvent,
    polling_mode: AtomicBool,
    dispatcher_started: AtomicBool,
    wait_timeout_ms: AtomicU64,
    poll_delay_ms: AtomicU64,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: Slot = Slot::new();

static DEFERRED_WORK: DeferredWork = DeferredWork {
    slots: [EMPTY_SLOT; DEFERRED_WORK_MAX_ITEMS],
    event: KernelEvent::new(),
    polling_mode: AtomicBool::new(false),
    dispatcher_started: AtomicBool::new(false),
    wait_timeout_ms: AtomicU64::new(DEFERRED_WORK_WAIT_TIMEOUT_MS),
    poll_delay_ms: AtomicU64::new(DEFERRED_WORK_POLL_DELAY_MS),
};

pub struct DeferredWorkDispatcher;

/// Applies configuration and marks the dispatcher ready. The kernel spawns
/// a task running [`dispatcher_loop`] afterwards.
pub fn initialize() -> bool {
    if DEFERRED_WORK.dispatcher_started.load(Ordering::Acquire) {
        return true;
    }

    if let Some(timeout) = config::get_u32(config::GENERAL_DEFERRED_WORK_WAIT_TIMEOUT_MS) {
        DEFERRED_WORK
            .wait_timeout_ms
            .store(timeout as u64, Ordering::Relaxed);
    }

    if let Some(delay) = config::get_u32(config::GENERAL_DEFERRED_WORK_POLL_DELAY_MS) {
        DEFERRED_WORK
            .poll_delay_ms
            .store(delay as u64, Ordering::Relaxed);
    }

    let polling = config::get_bool(config::GENERAL_POLLING);
    DEFERRED_WORK.polling_mode.store(polling, Ordering::Relaxed);
    if polling {
        warn!(DeferredWorkDispatcher, "devices in polling mode");
    }

    DEFERRED_WORK.dispatcher_started.store(true, Ordering::Release);
    debug!(DeferredWorkDispatcher, "dispatcher ready");
    true
}

pub fn shutdown() {
    DEFERRED_WORK.dispatcher_started.store(false, Ordering::Release);
    DEFERRED_WORK.polling_mode.store(false, Ordering::Relaxed);
    DEFERRED_WORK.event.reset();
}

pub fn is_polling_mode() -> bool {
    DEFERRED_WORK.polling_mode.load(Ordering::Relaxed)
}

/// Registers a work item. Fails when neither callback is supplied or every
/// slot is taken.
pub fn register(registration: DeferredWorkRegistration) -> Option<DeferredWorkHandle> {
    if registration.work.is_none() && registration.poll.is_none() {
        return None;
    }

    for (index, slot) in DEFERRED_WORK.slots.iter().enumerate() {
        let mut callbacks = slot.callbacks.lock();
        if callbacks.is_some() {
            continue;
        }

        slot.pending.store(0, Ordering::Relaxed);
        slot.signalable
            .store(registration.work.is_some(), Ordering::Release);
        *callbacks = Some(SlotCallbacks {
            work: registration.work,
            poll: registration.poll,
            name: registration.name,
        });

        debug!(
            DeferredWorkDispatcher,
            "registered work item {index} ({})", registration.name
        );
        return Some(DeferredWorkHandle(index));
    }

    error!(DeferredWorkDispatcher, "no free deferred work slots");
    None
}

pub fn register_poll_only(
    poll: Callback,
    name: &'static str,
) -> Option<DeferredWorkHandle> {
    register(DeferredWorkRegistration {
        work: None,
        poll: Some(poll),
        name,
    })
}

pub fn unregister(handle: DeferredWorkHandle) {
    let Some(slot) = DEFERRED_WORK.slots.get(handle.0) else {
        return;
    };

    slot.signalable.store(false, Ordering::Release);
    *slot.callbacks.lock() = None;
    slot.pending.store(0, Ordering::Relaxed);

    debug!(DeferredWorkDispatcher, "unregistered work item {}", handle.0);
}

/// Queues one work-callback invocation. Safe from interrupt context: no
/// locks, just the interrupts-off pending bump plus the event signal.
pub fn signal(handle: DeferredWorkHandle) {
    let Some(slot) = DEFERRED_WORK.slots.get(handle.0) else {
        return;
    };

    if !slot.signalable.load(Ordering::Acquire) {
        return;
    }

    platform::without_interrupts(|| {
        slot.pending.fetch_add(1, Ordering::Relaxed);
    });

    DEFERRED_WORK.event.signal();
}

/// Drains pending work until a full sweep finds nothing, so callbacks
/// re-signalled while draining are still observed, then resets the event
/// iff no pending count is left.
pub fn process_pending_work() {
    loop {
        let mut work_found = false;

        for slot in DEFERRED_WORK.slots.iter() {
            let work = {
                let callbacks = slot.callbacks.lock();
                match callbacks.as_ref().and_then(|c| c.work.clone()) {
                    Some(work) => work,
                    None => continue,
                }
            };

            let pending =
                platform::without_interrupts(|| slot.pending.swap(0, Ordering::Relaxed));

            for _ in 0..pending {
                work();
                work_found = true;
            }
        }

        if !work_found {
            break;
        }
    }

    platform::without_interrupts(|| {
        let pending_left = DEFERRED_WORK
            .slots
            .iter()
            .any(|slot| slot.pending.load(Ordering::Relaxed) > 0);

        if !pending_left {
            DEFERRED_WORK.event.reset();
        }
    });
}

/// Runs every registered poll callback once.
pub fn process_poll_callbacks() {
    for slot in DEFERRED_WORK.slots.iter() {
        let poll = {
            let callbacks = slot.callbacks.lock();
            callbacks.as_ref().and_then(|c| c.poll.clone())
        };

        if let Some(poll) = poll {
            poll();
        }
    }
}

#[cfg(test)]
pub(crate) fn set_polling_mode_for_test(polling: bool) {
    DEFERRED_WORK.polling_mode.store(polling, Ordering::Relaxed);
}

/// One dispatcher iteration. Polling mode drains any signalled work first
/// (drivers may still signal from their own threads), runs the poll
/// callbacks, then sleeps the poll delay.
pub fn dispatcher_step() {
    if is_polling_mode() {
        process_pending_work();
        process_poll_callbacks();
        platform::sleep_ms(DEFERRED_WORK.poll_delay_ms.load(Ordering::Relaxed));
        return;
    }

    let timeout = DEFERRED_WORK.wait_timeout_ms.load(Ordering::Relaxed);
    match DEFERRED_WORK.event.wait_timeout(timeout) {
        WaitResult::Timeout => process_poll_callbacks(),
        WaitResult::Signaled => process_pending_work(),
    }
}

/// Task entry point for the dispatcher.
pub fn dispatcher_loop() -> ! {
    loop {
        dispatcher_step();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::locks::Mutex;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, Ordering};

    fn setup() {
        crate::platform::test::setup();
        initialize();
    }

    fn counting_callback() -> (Callback, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        let captured = count.clone();
        let callback: Callback = Arc::new(move || {
            captured.fetch_add(1, Ordering::Relaxed);
        });
        (callback, count)
    }

    #[test]
    fn registration_requires_a_callback() {
        setup();
        assert!(
            register(DeferredWorkRegistration {
                work: None,
                poll: None,
                name: "empty",
            })
            .is_none()
        );
    }

    #[test]
    fn signal_count_matches_invocations() {
        setup();
        let (work, count) = counting_callback();
        let handle = register(DeferredWorkRegistration {
            work: Some(work),
            poll: None,
            name: "counter",
        })
        .unwrap();

        signal(handle);
        process_pending_work();
        assert_eq!(count.load(Ordering::Relaxed), 1);

        for _ in 0..12 {
            signal(handle);
        }
        process_pending_work();
        assert_eq!(count.load(Ordering::Relaxed), 13);

        // nothing pending, nothing runs
        process_pending_work();
        assert_eq!(count.load(Ordering::Relaxed), 13);

        unregister(handle);
    }

    #[test]
    fn resignal_during_drain_is_observed() {
        setup();
        let chained = Arc::new(AtomicU32::new(0));

        let handle_cell = Arc::new(Mutex::new(None::<DeferredWorkHandle>));
        let captured_cell = handle_cell.clone();
        let captured_count = chained.clone();
        let work: Callback = Arc::new(move || {
            let first = captured_count.fetch_add(1, Ordering::Relaxed) == 0;
            if first {
                if let Some(handle) = *captured_cell.lock() {
                    signal(handle);
                }
            }
        });

        let handle = register(DeferredWorkRegistration {
            work: Some(work),
            poll: None,
            name: "chained",
        })
        .unwrap();
        *handle_cell.lock() = Some(handle);

        signal(handle);
        process_pending_work();
        assert_eq!(chained.load(Ordering::Relaxed), 2);

        unregister(handle);
    }

    #[test]
    fn signal_on_poll_only_item_is_ignored() {
        setup();
        let (poll, count) = counting_callback();
        let handle = register_poll_only(poll, "poll-only").unwrap();

        signal(handle);
        process_pending_work();
        assert_eq!(count.load(Ordering::Relaxed), 0);

        process_poll_callbacks();
        assert_eq!(count.load(Ordering::Relaxed), 1);

        unregister(handle);
    }

    #[test]
    fn polling_mode_step_drains_work_before_polls() {
        setup();
        let _serial = crate::platform::test::serial_guard();

        // Order probe: the poll callback records how many work invocations
        // it saw when it ran.
        let work_count = Arc::new(AtomicU32::new(0));
        let seen_at_poll = Arc::new(AtomicU32::new(u32::MAX));

        let counted = work_count.clone();
        let work: Callback = Arc::new(move || {
            counted.fetch_add(1, Ordering::Relaxed);
        });

        let observed = work_count.clone();
        let recorded = seen_at_poll.clone();
        let poll: Callback = Arc::new(move || {
            recorded.store(observed.load(Ordering::Relaxed), Ordering::Relaxed);
        });

        let handle = register(DeferredWorkRegistration {
            work: Some(work),
            poll: Some(poll),
            name: "polling-order",
        })
        .unwrap();

        for _ in 0..12 {
            signal(handle);
        }

        set_polling_mode_for_test(true);
        dispatcher_step();
        set_polling_mode_for_test(false);

        assert_eq!(work_count.load(Ordering::Relaxed), 12);
        // the poll ran after the drain
        assert_eq!(seen_at_poll.load(Ordering::Relaxed), 12);

        unregister(handle);
    }

    #[test]
    fn unregister_frees_the_slot() {
        setup();
        let (work, _count) = counting_callback();
        let handle = register(DeferredWorkRegistration {
            work: Some(work),
            poll: None,
            name: "transient",
        })
        .unwrap();
        unregister(handle);

        let (work, count) = counting_callback();
        let reused = register(DeferredWorkRegistration {
            work: Some(work),
            poll: None,
            name: "reuse",
        })
        .unwrap();

        signal(reused);
        process_pending_work();
        assert_eq!(count.load(Ordering::Relaxed), 1);

        unregister(reused);
    }
}
