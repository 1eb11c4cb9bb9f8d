//! A configured endpoint: its descriptor, its transfer ring, and a page of
//! DMA-able buffer space for the class driver using it.

use crate::drivers::xhci::rings::transfer::XHCITransferRing;
use crate::drivers::xhci::rings::trbs::NormalTRB;
use crate::drivers::xhci::usb::UsbEndpointDescriptor;
use crate::drivers::xhci::utils::XhciError;
use crate::drivers::xhci::MAX_TRB_COUNT;
use crate::memory::frame_allocator::{self, Frame};
use crate::memory::{PAGE_SIZE, PhysAddr};
use crate::utils::locks::Mutex;

#[derive(Debug)]
pub struct USBEndpoint {
    desc: UsbEndpointDescriptor,
    dci: u8,
    transfer_ring: Mutex<XHCITransferRing>,
    data_frame: Frame,
}

impl USBEndpoint {
    pub fn create(descriptor: UsbEndpointDescriptor, slot_id: u8) -> Result<Self, XhciError> {
        let transfer_ring = XHCITransferRing::create(MAX_TRB_COUNT, slot_id)?;
        let data_frame = frame_allocator::allocate_frame().ok_or(XhciError::OutOfMemory)?;
        Ok(Self {
            dci: descriptor.dci(),
            desc: descriptor,
            transfer_ring: Mutex::new(transfer_ring),
            data_frame,
        })
    }

    pub fn desc(&self) -> &UsbEndpointDescriptor {
        &self.desc
    }

    pub const fn dci(&self) -> u8 {
        self.dci
    }

    pub fn transfer_ring(&self) -> &Mutex<XHCITransferRing> {
        &self.transfer_ring
    }

    pub fn data_buffer_phys(&self) -> PhysAddr {
        self.data_frame.phys_addr()
    }

    /// Copies out of the DMA buffer. Volatile: the controller writes this
    /// memory behind the compiler's back.
    pub fn read_data(&self, out: &mut [u8]) {
        assert!(out.len() <= PAGE_SIZE);
        let base = self.data_frame.virt_addr().into_ptr::<u8>();
        for (index, byte) in out.iter_mut().enumerate() {
            *byte = unsafe { base.add(index).read_volatile() };
        }
    }

    /// Enqueues one interrupt/bulk Normal TRB with IOC set and returns its
    /// physical address; the caller rings the slot doorbell.
    pub fn submit_normal_transfer(&self, length: u32, dir_in: bool) -> PhysAddr {
        self.submit_transfer_with(self.data_buffer_phys(), length, dir_in)
    }

    /// Same, against a caller-owned DMA buffer.
    pub fn submit_transfer_with(&self, buffer: PhysAddr, length: u32, dir_in: bool) -> PhysAddr {
        let mut trb = NormalTRB::new(buffer, length, 0);
        trb.cmd.set_ioc(true);
        trb.cmd.set_dir_in(dir_in);
        self.transfer_ring.lock().enqueue(trb.into_trb())
    }
}

impl Drop for USBEndpoint {
    fn drop(&mut self) {
        frame_allocator::deallocate_frame(self.data_frame);
    }
}
