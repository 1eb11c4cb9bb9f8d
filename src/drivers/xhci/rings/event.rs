use crate::{PhysAddr, debug, write_ref};

use super::{
    super::{
        regs::{EventRingDequePtr, InterrupterRegs},
        utils::allocate_buffers,
    },
    trbs::TRB,
};

use alloc::vec::Vec;

/// One Event Ring Segment Table entry (xHCI 6.5). A single-segment table
/// is enough for one interrupter.
#[repr(C)]
#[derive(Clone, Debug)]
struct XHCIEventRingEntry {
    ring_segment_base: u64,
    /// Size of the segment in TRBs (only the low 16 bits are used)
    ring_segment_size: u32,
    __: u32,
}

/// The controller-written event ring. The driver is the consumer here:
/// an entry belongs to us while its cycle bit matches our consumer cycle,
/// and the dequeue pointer is published back through ERDP.
#[derive(Debug)]
pub struct XHCIEventRing {
    interrupter_registers: *mut InterrupterRegs,

    trbs: &'static mut [TRB],
    trbs_phys_base: PhysAddr,

    ring_segment_table: &'static mut [XHCIEventRingEntry],
    segment_table_base: PhysAddr,

    dequeue_ptr: usize,
    curr_ring_cycle_bit: u8,
}

unsafe impl Send for XHCIEventRing {}

impl XHCIEventRing {
    pub fn create(trb_count: usize, interrupter_registers: *mut InterrupterRegs) -> Option<Self> {
        let curr_ring_cycle_bit = 1;

        let (trbs, trbs_phys_base) = allocate_buffers::<TRB>(trb_count)?;

        let segment_count = 1;
        let (segment_table, segment_table_base) =
            allocate_buffers::<XHCIEventRingEntry>(segment_count)?;

        segment_table[0].ring_segment_base = trbs_phys_base.into_raw() as u64;
        segment_table[0].ring_segment_size = trb_count as u32;
        segment_table[0].__ = 0;

        let mut this = Self {
            trbs_phys_base,
            trbs,
            interrupter_registers,
            segment_table_base,
            ring_segment_table: segment_table,
            dequeue_ptr: 0,
            curr_ring_cycle_bit,
        };
        this.reset();

        debug!(
            XHCIEventRing,
            "created with {} TRBs at {:?}",
            this.trbs.len(),
            this.trbs_phys_base
        );
        Some(this)
    }

    /// Publishes segment table size, dequeue pointer and table base, in
    /// that order.
    pub fn reset(&mut self) {
        let regs = unsafe { &mut *self.interrupter_registers };
        write_ref!(regs.erst_sz, self.ring_segment_table.len() as u32);
        self.update_erdp();
        write_ref!(regs.erst_base, self.segment_table_base.into_raw() as u64);
    }

    /// Syncs ERDP in the interrupter with the current dequeue index.
    pub fn update_erdp(&mut self) {
        let offset = self.dequeue_ptr * size_of::<TRB>();
        let dequeue_addr = self.trbs_phys_base + offset;
        let regs = unsafe { &mut *self.interrupter_registers };
        write_ref!(regs.event_ring_deque, EventRingDequePtr::from_addr(dequeue_addr));
    }

    /// Drains every ready event, then writes ERDP with Event Handler Busy
    /// set to clear it.
    pub fn dequeue_events(&mut self) -> Vec<TRB> {
        let mut results = Vec::new();
        while let Some(next) = self.dequeue_trb() {
            results.push(next.clone());
        }

        self.update_erdp();
        let regs = unsafe { &mut *self.interrupter_registers };
        let erdp = regs.event_ring_deque.with_handler_busy(true);
        write_ref!(regs.event_ring_deque, erdp);
        results
    }

    fn dequeue_trb(&mut self) -> Option<&TRB> {
        let curr_trb = &self.trbs[self.dequeue_ptr];
        if curr_trb.cmd.cycle_bit() != self.curr_ring_cycle_bit {
            return None;
        }

        self.dequeue_ptr += 1;
        if self.dequeue_ptr >= self.trbs.len() {
            self.dequeue_ptr = 0;
            self.curr_ring_cycle_bit = (!self.curr_ring_cycle_bit) & 0x1;
        }

        Some(curr_trb)
    }

    #[cfg(test)]
    pub(crate) fn produce_for_test(&mut self, index: usize, trb: TRB) {
        self.trbs[index] = trb;
    }
}
