use crate::drivers::xhci::{rings::trbs::TRB, utils::XhciError, utils::allocate_buffers};
use crate::memory::frame_allocator::{self, FramePtr};
use crate::{PhysAddr, VirtAddr};

/// A transfer ring, one per active endpoint. Same cycle discipline as the
/// command ring; the endpoint context's dequeue pointer is seeded from
/// [`physical_dequeue_pointer`](Self::physical_dequeue_pointer) with the
/// current cycle state.
#[derive(Debug)]
pub struct XHCITransferRing {
    trbs_ptr: FramePtr<[TRB]>,
    trbs_len: usize,

    curr_ring_cycle_bit: u8,

    enqueue_ptr: usize,

    doorbell_id: u8,
}

impl XHCITransferRing {
    pub const fn doorbell_id(&self) -> u8 {
        self.doorbell_id
    }

    pub const fn curr_ring_cycle_bit(&self) -> u8 {
        self.curr_ring_cycle_bit
    }

    pub fn create(max_trb_count: usize, doorbell_id: u8) -> Result<Self, XhciError> {
        let curr_ring_cycle_bit = 1;

        let (trbs, trbs_phys_addr) =
            allocate_buffers(max_trb_count).ok_or(XhciError::OutOfMemory)?;
        trbs[max_trb_count - 1] = TRB::new_link(trbs_phys_addr, curr_ring_cycle_bit);

        let trbs_len = trbs.len();
        let trbs_ptr = unsafe { FramePtr::from_ptr(trbs) };

        Ok(Self {
            trbs_ptr,
            trbs_len,
            enqueue_ptr: 0,
            curr_ring_cycle_bit,
            doorbell_id,
        })
    }

    unsafe fn get_trb(&self, index: usize) -> *mut TRB {
        assert!(index < self.trbs_len);
        unsafe { (self.trbs_ptr.as_ptr() as *mut TRB).add(index) }
    }

    unsafe fn write_trb(&mut self, index: usize, trb: TRB) {
        unsafe {
            self.get_trb(index).write_volatile(trb);
        }
    }

    /// Physical address of the current enqueue slot; what a freshly built
    /// endpoint context points its dequeue pointer at.
    pub fn physical_dequeue_pointer(&self) -> PhysAddr {
        unsafe { VirtAddr::from_ptr(self.get_trb(self.enqueue_ptr)).into_phys() }
    }

    /// Enqueues a TRB and returns its physical address so the caller can
    /// match the eventual transfer event.
    pub fn enqueue(&mut self, mut trb: TRB) -> PhysAddr {
        trb.cmd.set_cycle_bit(self.curr_ring_cycle_bit);

        let trb_phys = unsafe { VirtAddr::from_ptr(self.get_trb(self.enqueue_ptr)).into_phys() };
        unsafe {
            self.write_trb(self.enqueue_ptr, trb);
        }
        self.enqueue_ptr += 1;

        if self.enqueue_ptr >= self.trbs_len - 1 {
            // Update the link trb to reflect the current cycle
            let link_trb = unsafe { &mut *self.get_trb(self.trbs_len - 1) };
            link_trb.cmd.set_cycle_bit(self.curr_ring_cycle_bit);

            // Start a new cycle
            self.enqueue_ptr = 0;
            self.curr_ring_cycle_bit = (!self.curr_ring_cycle_bit) & 0x1;
        }

        trb_phys
    }

    #[cfg(test)]
    pub(crate) fn trb_at(&self, index: usize) -> TRB {
        unsafe { (*self.get_trb(index)).clone() }
    }
}

impl Drop for XHCITransferRing {
    fn drop(&mut self) {
        frame_allocator::deallocate_frame(self.trbs_ptr.frame());
    }
}
