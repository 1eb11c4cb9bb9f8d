use super::super::utils::allocate_buffers;
use crate::drivers::xhci::rings::trbs::TRB;
use crate::{PhysAddr, debug};

/// The controller-global command ring. The terminal slot is a link TRB
/// back to the ring base with toggle-cycle set; the producer cycle flips
/// exactly once per wrap.
#[derive(Debug)]
pub struct XHCICommandRing {
    enqueue_ptr: usize,
    // TODO: free this on drop? a controller currently lives forever
    trbs_phys_addr: PhysAddr,
    trbs: &'static mut [TRB],
    curr_ring_cycle_bit: u8,
}

impl XHCICommandRing {
    pub fn create(trb_count: usize) -> Option<Self> {
        let (trbs, trbs_phys_addr) = allocate_buffers::<TRB>(trb_count)?;

        let link_trb = &mut trbs[trb_count - 1];
        *link_trb = TRB::new_link(trbs_phys_addr, 1);

        debug!(
            XHCICommandRing,
            "created with {} TRBs at {:?}", trb_count, trbs_phys_addr
        );
        Some(Self {
            trbs_phys_addr,
            trbs,
            enqueue_ptr: 0,
            curr_ring_cycle_bit: 1,
        })
    }

    /// Writes `trb` with the producer cycle ORed in and returns its
    /// physical address for completion matching. Wraps through the link
    /// TRB, toggling the producer cycle.
    pub fn enqueue(&mut self, mut trb: TRB) -> PhysAddr {
        trb.cmd.set_cycle_bit(self.curr_ring_cycle_bit);

        let trb_phys = self.trbs_phys_addr + self.enqueue_ptr * size_of::<TRB>();
        unsafe {
            (&mut self.trbs[self.enqueue_ptr] as *mut TRB).write_volatile(trb);
        }
        self.enqueue_ptr += 1;

        if self.enqueue_ptr >= self.trbs.len() - 1 {
            // Update the link trb to reflect the current cycle
            let link_trb = &mut self.trbs[self.trbs.len() - 1];
            link_trb.cmd.set_cycle_bit(self.curr_ring_cycle_bit);

            // Start a new cycle
            self.enqueue_ptr = 0;
            self.curr_ring_cycle_bit = (!self.curr_ring_cycle_bit) & 0x1;
        }

        trb_phys
    }

    pub fn base_phys_addr(&self) -> PhysAddr {
        self.trbs_phys_addr
    }

    pub fn current_ring_cycle(&self) -> u8 {
        self.curr_ring_cycle_bit
    }

    #[cfg(test)]
    pub(crate) fn trb_at(&self, index: usize) -> TRB {
        self.trbs[index].clone()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.trbs.len()
    }
}
