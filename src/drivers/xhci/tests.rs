//! Ring and completion-queue behavior, exercised against plain memory.

use super::rings::command::XHCICommandRing;
use super::rings::event::XHCIEventRing;
use super::rings::transfer::XHCITransferRing;
use super::rings::trbs::{
    CompletionStatusCode, TRB, TRB_TYPE_CMD_COMPLETION, TRB_TYPE_LINK, TRB_TYPE_NORMAL,
    TRB_TYPE_TRANSFER_EVENT, TRBCommand,
};
use super::regs::InterrupterRegs;
use super::{Completion, CompletionQueue, MAX_TRB_COUNT};
use crate::read_ref;

fn setup() {
    crate::platform::test::setup();
}

fn noop_trb() -> TRB {
    TRB::new(TRBCommand::new().with_trb_type(TRB_TYPE_NORMAL), 0, 0)
}

#[test]
fn command_ring_link_trb_points_home() {
    setup();
    let ring = XHCICommandRing::create(MAX_TRB_COUNT).unwrap();

    let link = ring.trb_at(ring.len() - 1);
    assert_eq!(link.cmd.trb_type(), TRB_TYPE_LINK);
    assert!(link.cmd.toggle_cycle());
    assert_eq!(link.parameter, ring.base_phys_addr().into_raw() as u64);
}

#[test]
fn command_ring_wrap_toggles_cycle() {
    setup();
    let trb_count = 256;
    let mut ring = XHCICommandRing::create(trb_count).unwrap();
    assert_eq!(ring.current_ring_cycle(), 1);

    // Fill every usable slot; the 255th enqueue hits the link index.
    for i in 0..trb_count - 1 {
        let phys = ring.enqueue(noop_trb());
        assert_eq!(
            phys.into_raw(),
            ring.base_phys_addr().into_raw() + i * size_of::<TRB>()
        );
    }

    // The link TRB carries the old cycle and the producer flipped.
    let link = ring.trb_at(trb_count - 1);
    assert_eq!(link.cmd.trb_type(), TRB_TYPE_LINK);
    assert_eq!(link.cmd.cycle_bit(), 1);
    assert!(link.cmd.toggle_cycle());
    assert_eq!(ring.current_ring_cycle(), 0);

    // The 256th command lands at index 0 with the inverted cycle bit.
    let phys = ring.enqueue(noop_trb());
    assert_eq!(phys, ring.base_phys_addr());
    assert_eq!(ring.trb_at(0).cmd.cycle_bit(), 0);
}

#[test]
fn even_wrap_count_restores_cycle() {
    setup();
    let trb_count = 8;
    let mut ring = XHCITransferRing::create(trb_count, 1).unwrap();
    assert_eq!(ring.curr_ring_cycle_bit(), 1);

    // two full wraps
    for _ in 0..2 * (trb_count - 1) {
        ring.enqueue(noop_trb());
    }
    assert_eq!(ring.curr_ring_cycle_bit(), 1);

    // and an odd number of wraps leaves it flipped
    for _ in 0..trb_count - 1 {
        ring.enqueue(noop_trb());
    }
    assert_eq!(ring.curr_ring_cycle_bit(), 0);
}

#[test]
fn transfer_ring_reports_written_trb_physical() {
    setup();
    let mut ring = XHCITransferRing::create(16, 3).unwrap();

    let first = ring.enqueue(noop_trb());
    let second = ring.enqueue(noop_trb());
    assert_eq!(second.into_raw() - first.into_raw(), size_of::<TRB>());
    assert_eq!(ring.trb_at(0).cmd.cycle_bit(), 1);
}

#[test]
fn event_ring_consumes_matching_cycle_only() {
    setup();
    let interrupter: &'static mut InterrupterRegs =
        Box::leak(Box::new(unsafe { core::mem::zeroed() }));
    let mut ring = XHCIEventRing::create(16, interrupter as *mut _).unwrap();

    let mut event = TRB::new(
        TRBCommand::new()
            .with_trb_type(TRB_TYPE_TRANSFER_EVENT)
            .with_cycle_bit(1),
        0,
        0x1000,
    );
    ring.produce_for_test(0, event.clone());
    event.parameter = 0x2000;
    ring.produce_for_test(1, event);

    // index 2 still has the old cycle (0) and must not be consumed
    let events = ring.dequeue_events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].parameter, 0x1000);
    assert_eq!(events[1].parameter, 0x2000);

    assert!(ring.dequeue_events().is_empty());
}

#[test]
fn event_ring_publishes_erdp_with_handler_busy() {
    setup();
    let interrupter: &'static mut InterrupterRegs =
        Box::leak(Box::new(unsafe { core::mem::zeroed() }));
    let interrupter_ptr = interrupter as *mut InterrupterRegs;
    let mut ring = XHCIEventRing::create(16, interrupter_ptr).unwrap();

    let event = TRB::new(
        TRBCommand::new()
            .with_trb_type(TRB_TYPE_TRANSFER_EVENT)
            .with_cycle_bit(1),
        0,
        0,
    );
    ring.produce_for_test(0, event);
    ring.dequeue_events();

    let regs = unsafe { &mut *interrupter_ptr };
    let erdp = read_ref!(regs.event_ring_deque);
    assert!(erdp.handler_busy());
}

#[test]
fn completion_queue_matches_by_type_and_trb() {
    let mut queue = CompletionQueue::new();

    queue.push(Completion {
        trb_physical: 0x1000,
        code: CompletionStatusCode::Success,
        event_type: TRB_TYPE_CMD_COMPLETION,
        slot_id: 1,
    });
    queue.push(Completion {
        trb_physical: 0x1000,
        code: CompletionStatusCode::ShortPacket,
        event_type: TRB_TYPE_TRANSFER_EVENT,
        slot_id: 1,
    });

    // same TRB address, different event type: only the transfer pops
    let popped = queue.pop(TRB_TYPE_TRANSFER_EVENT, 0x1000).unwrap();
    assert_eq!(popped.code, CompletionStatusCode::ShortPacket);
    assert!(queue.pop(TRB_TYPE_TRANSFER_EVENT, 0x1000).is_none());

    // the command completion is still there, and popping removes it
    assert!(queue.pop(TRB_TYPE_CMD_COMPLETION, 0x1000).is_some());
    assert_eq!(queue.len(), 0);
}

#[test]
fn completion_queue_drops_oldest_on_overflow() {
    let mut queue = CompletionQueue::new();

    for i in 0..super::COMPLETION_QUEUE_MAX as u64 + 1 {
        queue.push(Completion {
            trb_physical: 0x1000 + i * 16,
            code: CompletionStatusCode::Success,
            event_type: TRB_TYPE_TRANSFER_EVENT,
            slot_id: 1,
        });
    }

    assert_eq!(queue.len(), super::COMPLETION_QUEUE_MAX);
    // the first entry was evicted
    assert!(queue.pop(TRB_TYPE_TRANSFER_EVENT, 0x1000).is_none());
    assert!(queue.pop(TRB_TYPE_TRANSFER_EVENT, 0x1010).is_some());
}

#[test]
fn enqueue_then_complete_matches_in_fifo_order() {
    setup();
    let mut ring = XHCITransferRing::create(32, 1).unwrap();
    let mut queue = CompletionQueue::new();

    let submitted: alloc::vec::Vec<u64> = (0..8)
        .map(|_| ring.enqueue(noop_trb()).into_raw() as u64)
        .collect();

    for trb in &submitted {
        queue.push(Completion {
            trb_physical: *trb,
            code: CompletionStatusCode::Success,
            event_type: TRB_TYPE_TRANSFER_EVENT,
            slot_id: 1,
        });
    }

    for trb in &submitted {
        let completion = queue.pop(TRB_TYPE_TRANSFER_EVENT, *trb).unwrap();
        assert_eq!(completion.trb_physical, *trb);
    }
    assert_eq!(queue.len(), 0);
}
