//! PCI contract: what the bus enumerator hands to drivers.
//!
//! The enumerator itself lives in the kernel; it scans configuration space
//! and calls each registered driver's probe with a filled-in
//! [`PciDeviceInfo`]. Config-space writes go back through the platform.

use bitflags::bitflags;

use crate::memory::PhysAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PciCommand: u16 {
        const IO_SPACE = 1 << 0;
        const MEM_SPACE = 1 << 1;
        const BUS_MASTER = 1 << 2;
        const INTERRUPT_DISABLE = 1 << 10;
    }
}

const BAR_IO_SPACE: u32 = 1 << 0;
const BAR_TYPE_MASK: u32 = 0b110;
const BAR_TYPE_64BIT: u32 = 0b100;

/// Everything a driver needs from the enumerator: identity, class triple,
/// raw BAR dwords with their probed sizes, and the routed legacy IRQ.
#[derive(Debug, Clone)]
pub struct PciDeviceInfo {
    pub address: PciAddress,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    /// Raw BAR register values as read from configuration space.
    pub bars: [u32; 6],
    /// Probed size of each BAR region; 0 for unimplemented BARs.
    pub bar_sizes: [u64; 6],
    pub legacy_irq: Option<u8>,
}

impl PciDeviceInfo {
    /// Decodes a memory BAR into its physical base, merging the upper
    /// dword for 64-bit BAR layouts. I/O BARs and empty BARs yield None.
    pub fn memory_bar(&self, index: usize) -> Option<(PhysAddr, u64)> {
        let bar = *self.bars.get(index)?;
        if bar & BAR_IO_SPACE != 0 {
            return None;
        }

        let mut base = (bar & !0xF) as u64;
        if bar & BAR_TYPE_MASK == BAR_TYPE_64BIT {
            let high = *self.bars.get(index + 1)?;
            base |= (high as u64) << 32;
        }

        if base == 0 {
            return None;
        }

        Some((PhysAddr::new(base as usize), self.bar_sizes[index]))
    }

    pub fn enable_bus_mastering(&self) {
        crate::platform::get()
            .pci_write_command(self.address, (PciCommand::BUS_MASTER | PciCommand::MEM_SPACE).bits());
    }

    /// PCI command/status dword, for diagnostic snapshots.
    pub fn read_command_status(&self) -> u32 {
        crate::platform::get().pci_read_command_status(self.address)
    }
}

/// A PCI function driver. The enumerator matches on the class triple,
/// calls `create` once per matching function, then `start` after the
/// device object is pinned.
pub trait PciDevice: Sized + Send + Sync {
    /// (class, subclass, prog_if) this driver binds to.
    fn class() -> (u8, u8, u8);

    fn create(info: PciDeviceInfo) -> Option<alloc::sync::Arc<Self>>;

    fn start(device: &alloc::sync::Arc<Self>) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_with_bars(bars: [u32; 6], sizes: [u64; 6]) -> PciDeviceInfo {
        PciDeviceInfo {
            address: PciAddress {
                bus: 0,
                device: 4,
                function: 0,
            },
            vendor_id: 0x1b36,
            device_id: 0x000d,
            class: 0x0c,
            subclass: 0x03,
            prog_if: 0x30,
            bars,
            bar_sizes: sizes,
            legacy_irq: Some(11),
        }
    }

    #[test]
    fn decodes_32bit_memory_bar() {
        let info = info_with_bars([0xfebf0000, 0, 0, 0, 0, 0], [0x10000, 0, 0, 0, 0, 0]);
        let (base, size) = info.memory_bar(0).unwrap();
        assert_eq!(base.into_raw(), 0xfebf0000);
        assert_eq!(size, 0x10000);
    }

    #[test]
    fn decodes_64bit_memory_bar() {
        // 64-bit prefetchable BAR at 0x8_0000_0000
        let info = info_with_bars(
            [0x0000_000c, 0x0000_0008, 0, 0, 0, 0],
            [0x4000, 0, 0, 0, 0, 0],
        );
        let (base, _) = info.memory_bar(0).unwrap();
        assert_eq!(base.into_raw(), 0x8_0000_0000usize);
    }

    #[test]
    fn rejects_io_and_empty_bars() {
        let info = info_with_bars([0x0000_c001, 0, 0, 0, 0, 0], [0; 6]);
        assert!(info.memory_bar(0).is_none());
        assert!(info.memory_bar(1).is_none());
    }
}
