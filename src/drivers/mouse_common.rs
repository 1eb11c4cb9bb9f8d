//! Mouse packet coalescing.
//!
//! Report handlers may fire far faster than consumers care to redraw a
//! cursor. Deltas accumulate into a single pending packet under an
//! interrupts-off guard (buttons keep the latest mask so edges survive),
//! one deferred-work item is signalled, and the work callback dispatches
//! one combined event per drain.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};

use crate::devices::input::{self, MouseButtons, MouseEvent};
use crate::drivers::deferred_work::{self, DeferredWorkRegistration};
use crate::platform;

pub struct MouseDispatch;

static DELTA_X: AtomicI32 = AtomicI32::new(0);
static DELTA_Y: AtomicI32 = AtomicI32::new(0);
static BUTTONS: AtomicU8 = AtomicU8::new(0);
static PENDING: AtomicBool = AtomicBool::new(false);

/// Deferred-work handle, stored as index + 1 so zero means "not
/// registered" and the fast path stays lock-free.
static DISPATCH_HANDLE: AtomicUsize = AtomicUsize::new(0);

/// Registers the dispatch work item. Idempotent.
pub fn initialize() -> bool {
    if DISPATCH_HANDLE.load(Ordering::Acquire) != 0 {
        return true;
    }

    let handle = deferred_work::register(DeferredWorkRegistration {
        work: Some(Arc::new(dispatch_pending)),
        poll: None,
        name: "MouseDispatch",
    });

    match handle {
        Some(handle) => {
            DISPATCH_HANDLE.store(handle.index() + 1, Ordering::Release);
            true
        }
        None => false,
    }
}

/// Folds one packet into the pending state and signals the dispatcher.
/// Deltas sum, buttons take the latest mask.
pub fn queue_packet(delta_x: i32, delta_y: i32, buttons: MouseButtons) {
    platform::without_interrupts(|| {
        DELTA_X.fetch_add(delta_x, Ordering::Relaxed);
        DELTA_Y.fetch_add(delta_y, Ordering::Relaxed);
        BUTTONS.store(buttons.bits(), Ordering::Relaxed);
        PENDING.store(true, Ordering::Release);
    });

    let raw = DISPATCH_HANDLE.load(Ordering::Acquire);
    if raw != 0 {
        deferred_work::signal(deferred_work::DeferredWorkHandle::from_index(raw - 1));
    }
}

/// Snapshots and clears the pending packet under interrupts-off, then
/// hands the combined event to the consumer. Idempotent over "nothing
/// pending": repeated signals collapse to one dispatch.
pub(crate) fn dispatch_pending() {
    let (delta_x, delta_y, buttons, had_packet) = platform::without_interrupts(|| {
        let had_packet = PENDING.swap(false, Ordering::AcqRel);
        (
            DELTA_X.swap(0, Ordering::Relaxed),
            DELTA_Y.swap(0, Ordering::Relaxed),
            BUTTONS.load(Ordering::Relaxed),
            had_packet,
        )
    });

    if !had_packet {
        return;
    }

    input::dispatch_mouse_event(MouseEvent {
        buttons: MouseButtons::from_bits_truncate(buttons),
        delta_x: delta_x.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
        delta_y: delta_y.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::input::{MouseSink, set_mouse_sink};
    use crate::utils::locks::Mutex;

    struct CapturingSink {
        events: Mutex<alloc::vec::Vec<MouseEvent>>,
    }

    impl MouseSink for CapturingSink {
        fn mouse_event(&self, event: MouseEvent) {
            self.events.lock().push(event);
        }
    }

    #[test]
    fn bursts_coalesce_into_one_event() {
        crate::platform::test::setup();

        let sink: &'static CapturingSink = Box::leak(Box::new(CapturingSink {
            events: Mutex::new(alloc::vec::Vec::new()),
        }));
        set_mouse_sink(sink);

        queue_packet(3, -2, MouseButtons::LEFT);
        queue_packet(1, 1, MouseButtons::LEFT);
        queue_packet(2, 0, MouseButtons::empty());

        dispatch_pending();

        {
            let events = sink.events.lock();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].delta_x, 6);
            assert_eq!(events[0].delta_y, -1);
            // latest mask wins
            assert_eq!(events[0].buttons, MouseButtons::empty());
        }

        // nothing pending, nothing dispatched
        dispatch_pending();
        assert_eq!(sink.events.lock().len(), 1);
    }
}
