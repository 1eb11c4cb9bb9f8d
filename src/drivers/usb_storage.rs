//! USB mass storage: Bulk-Only Transport with a SCSI command set, kept
//! deliberately read-only.
//!
//! Every command is a CBW on the bulk OUT endpoint, an optional data
//! stage, and a CSW on bulk IN whose signature and tag are validated.
//! Transfers retry through CLEAR_FEATURE(ENDPOINT_HALT) on stalls; hard
//! failures escalate to BOT reset recovery (class request 0xFF plus halt
//! clears on both endpoints). The presence poll unbinds disks whose
//! device vanished and broadcasts the unmount.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Lazy;

use crate::drivers::deferred_work;
use crate::drivers::driver::{self, BusMessage};
use crate::drivers::xhci::device as xhci_device;
use crate::drivers::xhci::rings::trbs::{
    CompletionStatusCode, PacketRecipient, PacketType, XHCIDeviceRequestPacket,
};
use crate::drivers::xhci::usb::{
    ENDPOINT_TRANSFER_BULK, MASS_STORAGE_PROTOCOL_BULK_ONLY, MASS_STORAGE_SUBCLASS_SCSI,
    USB_CLASS_MASS_STORAGE,
};
use crate::drivers::xhci::usb_device::USBDevice;
use crate::drivers::xhci::usb_endpoint::USBEndpoint;
use crate::drivers::xhci::usb_interface::USBInterface;
use crate::drivers::xhci::utils::XhciError;
use crate::drivers::xhci::{self, XHCI};
use crate::memory::frame_allocator::{self, Frame};
use crate::memory::PAGE_SIZE;
use crate::storage::{self, BlockDevice, DiskId, DiskInfo, StorageError};
use crate::utils::locks::Mutex;
use crate::{debug, info, warn};

const CBW_SIGNATURE: u32 = 0x4342_5355; // "USBC"
const CSW_SIGNATURE: u32 = 0x5342_5355; // "USBS"
pub const CBW_LENGTH: usize = 31;
pub const CSW_LENGTH: usize = 13;

const CBW_FLAG_DATA_IN: u8 = 0x80;

const BULK_TIMEOUT_MS: u64 = 1000;
const BULK_RETRIES: u32 = 3;

/// Bulk-Only Transport class-specific reset request.
const BOT_RESET_REQUEST: u8 = 0xFF;

const SCSI_INQUIRY: u8 = 0x12;
const SCSI_READ_CAPACITY_10: u8 = 0x25;
const SCSI_READ_10: u8 = 0x28;
const INQUIRY_ALLOCATION: u8 = 36;

/// 31-byte Command Block Wrapper, little-endian.
#[repr(C, packed)]
struct CommandBlockWrapper {
    signature: u32,
    tag: u32,
    data_transfer_length: u32,
    flags: u8,
    lun: u8,
    cb_length: u8,
    cb: [u8; 16],
}

const _: () = assert!(size_of::<CommandBlockWrapper>() == CBW_LENGTH);

/// 13-byte Command Status Wrapper.
#[repr(C, packed)]
struct CommandStatusWrapper {
    signature: u32,
    tag: u32,
    data_residue: u32,
    status: u8,
}

const _: () = assert!(size_of::<CommandStatusWrapper>() == CSW_LENGTH);

pub(crate) fn build_cbw(tag: u32, data_length: u32, direction_in: bool, cb: &[u8]) -> [u8; CBW_LENGTH] {
    assert!(!cb.is_empty() && cb.len() <= 16);

    let mut wrapper = CommandBlockWrapper {
        signature: CBW_SIGNATURE.to_le(),
        tag: tag.to_le(),
        data_transfer_length: data_length.to_le(),
        flags: if direction_in { CBW_FLAG_DATA_IN } else { 0 },
        lun: 0, // single-LUN devices only
        cb_length: cb.len() as u8,
        cb: [0; 16],
    };
    wrapper.cb[..cb.len()].copy_from_slice(cb);

    unsafe { core::mem::transmute(wrapper) }
}

/// Validates a CSW and returns (status, residue). Status 0 is success.
pub(crate) fn parse_csw(bytes: &[u8; CSW_LENGTH], expected_tag: u32) -> Result<(u8, u32), XhciError> {
    let wrapper: CommandStatusWrapper =
        unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast()) };

    let signature = u32::from_le(wrapper.signature);
    let tag = u32::from_le(wrapper.tag);
    if signature != CSW_SIGNATURE || tag != expected_tag {
        return Err(XhciError::BadParameter);
    }
    Ok((wrapper.status, u32::from_le(wrapper.data_residue)))
}

/// READ(10): big-endian LBA and 16-bit block count.
pub(crate) fn build_read10(lba: u32, blocks: u16) -> [u8; 10] {
    let mut cb = [0u8; 10];
    cb[0] = SCSI_READ_10;
    cb[2..6].copy_from_slice(&lba.to_be_bytes());
    cb[7..9].copy_from_slice(&blocks.to_be_bytes());
    cb
}

pub(crate) fn build_read_capacity10() -> [u8; 10] {
    let mut cb = [0u8; 10];
    cb[0] = SCSI_READ_CAPACITY_10;
    cb
}

pub(crate) fn build_inquiry(allocation: u8) -> [u8; 6] {
    let mut cb = [0u8; 6];
    cb[0] = SCSI_INQUIRY;
    cb[4] = allocation;
    cb
}

/// READ CAPACITY(10) payload: big-endian last LBA and block size.
pub(crate) fn parse_read_capacity10(bytes: &[u8; 8]) -> (u32, u32) {
    let last_lba = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let block_size = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    (last_lba, block_size)
}

/// Rejects reads that run past the medium before anything hits the wire.
pub(crate) fn validate_read_range(lba: u64, blocks: u64, block_count: u64) -> bool {
    blocks > 0 && lba < block_count && blocks <= block_count - lba
}

pub struct USBMassStorage {
    controller: Weak<XHCI>,
    device: Arc<USBDevice>,
    #[allow(dead_code)]
    interface: Arc<USBInterface>,
    bulk_in: Arc<USBEndpoint>,
    bulk_out: Arc<USBEndpoint>,
    interface_number: u8,
    tag: AtomicU32,
    block_count: u32,
    block_size: u32,
    io_frame: Frame,
    /// Serializes BOT commands: one shared I/O page per device.
    io_lock: Mutex<()>,
    ready: AtomicBool,
}

impl Drop for USBMassStorage {
    fn drop(&mut self) {
        frame_allocator::deallocate_frame(self.io_frame);
    }
}

impl USBMassStorage {
    fn controller(&self) -> Result<Arc<XHCI>, XhciError> {
        self.controller.upgrade().ok_or(XhciError::NoDevice)
    }

    /// `ready && still present` is revalidated before every command.
    fn usable(&self) -> bool {
        self.ready.load(Ordering::Acquire) && self.device.is_present()
    }

    fn write_io(&self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= PAGE_SIZE);
        let base = self.io_frame.virt_addr().into_ptr::<u8>();
        for (index, byte) in bytes.iter().enumerate() {
            unsafe { base.add(offset + index).write_volatile(*byte) };
        }
    }

    fn read_io(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= PAGE_SIZE);
        let base = self.io_frame.virt_addr().into_ptr::<u8>();
        for (index, byte) in out.iter_mut().enumerate() {
            *byte = unsafe { base.add(offset + index).read_volatile() };
        }
    }

    fn clear_endpoint_halt(&self, endpoint: &USBEndpoint) -> Result<(), XhciError> {
        let controller = self.controller()?;
        let mut state = self.device.state();
        xhci_device::clear_endpoint_halt(&controller, &mut state, endpoint.desc().b_endpoint_address)
    }

    /// One bulk transfer against the I/O page, bounded by the bulk
    /// timeout.
    fn bulk_transfer_once(
        &self,
        endpoint: &USBEndpoint,
        length: u32,
        direction_in: bool,
    ) -> Result<CompletionStatusCode, XhciError> {
        let controller = self.controller()?;
        let slot_id = self.device.state().slot_id;

        let trb = endpoint.submit_transfer_with(self.io_frame.phys_addr(), length, direction_in);
        controller.ring_endpoint_doorbell(slot_id, endpoint.dci());
        controller.wait_for_transfer_completion_timeout(trb, BULK_TIMEOUT_MS)
    }

    /// Bulk transfer with stall recovery: up to three attempts, clearing
    /// the endpoint halt between them.
    fn bulk_transfer(
        &self,
        endpoint: &USBEndpoint,
        length: u32,
        direction_in: bool,
    ) -> Result<(), XhciError> {
        let mut last_error = XhciError::NoTransferResponse;

        for _attempt in 0..BULK_RETRIES {
            match self.bulk_transfer_once(endpoint, length, direction_in) {
                Ok(code) if code.is_transfer_success() => return Ok(()),
                Ok(CompletionStatusCode::StallErr) => {
                    let _ = self.clear_endpoint_halt(endpoint);
                    last_error = XhciError::TransferNotSuccessful(CompletionStatusCode::StallErr);
                }
                Ok(code) => {
                    warn!(USBMassStorage, "bulk completion {code:?}");
                    return Err(XhciError::TransferNotSuccessful(code));
                }
                Err(err) => {
                    let _ = self.clear_endpoint_halt(endpoint);
                    last_error = err;
                }
            }
        }

        Err(last_error)
    }

    /// BOT reset recovery: class reset on the interface, then clear the
    /// halt on both bulk endpoints.
    fn reset_recovery(&self) -> Result<(), XhciError> {
        let controller = self.controller()?;
        {
            let mut state = self.device.state();
            let packet = XHCIDeviceRequestPacket::new()
                .with_recipient(PacketRecipient::Interface)
                .with_p_type(PacketType::Class)
                .with_device_to_host(false)
                .with_b_request(BOT_RESET_REQUEST)
                .with_w_value(0)
                .with_w_index(self.interface_number as u16)
                .with_w_length(0);
            xhci_device::control_transfer(&controller, &mut state, packet, None, false)?;
        }

        let in_ok = self.clear_endpoint_halt(&self.bulk_in).is_ok();
        let out_ok = self.clear_endpoint_halt(&self.bulk_out).is_ok();
        if !in_ok || !out_ok {
            warn!(USBMassStorage, "reset recovery halt clear failed in={in_ok} out={out_ok}");
        }
        Ok(())
    }

    /// One CBW / data / CSW sequence. `data_out` receives IN data.
    fn bot_command(
        &self,
        cb: &[u8],
        data_length: usize,
        direction_in: bool,
        data_out: Option<&mut [u8]>,
    ) -> Result<(), XhciError> {
        if cb.is_empty() || cb.len() > 16 || data_length > PAGE_SIZE {
            return Err(XhciError::BadParameter);
        }
        if !self.usable() {
            return Err(XhciError::NoDevice);
        }

        let _io = self.io_lock.lock();

        let tag = self.tag.fetch_add(1, Ordering::Relaxed);
        let cbw = build_cbw(tag, data_length as u32, direction_in, cb);
        self.write_io(0, &cbw);

        self.bulk_transfer(&self.bulk_out, CBW_LENGTH as u32, false)?;

        if data_length > 0 {
            let endpoint = if direction_in {
                &self.bulk_in
            } else {
                &self.bulk_out
            };
            self.bulk_transfer(endpoint, data_length as u32, direction_in)?;

            if direction_in {
                if let Some(out) = data_out {
                    let len = out.len().min(data_length);
                    self.read_io(0, &mut out[..len]);
                }
            }
        }

        // The CSW reuses the I/O page, so IN data is already copied out.
        self.bulk_transfer(&self.bulk_in, CSW_LENGTH as u32, true)?;

        let mut csw = [0u8; CSW_LENGTH];
        self.read_io(0, &mut csw);
        let (status, residue) = parse_csw(&csw, tag)?;
        if status != 0 {
            warn!(USBMassStorage, "CSW status={status:#x} residue={residue}");
            return Err(XhciError::Other);
        }

        Ok(())
    }

    /// A command with one reset-recovery escalation between attempts.
    fn bot_command_with_recovery(
        &self,
        cb: &[u8],
        data_length: usize,
        direction_in: bool,
        mut data_out: Option<&mut [u8]>,
    ) -> Result<(), XhciError> {
        match self.bot_command(cb, data_length, direction_in, data_out.as_deref_mut()) {
            Ok(()) => Ok(()),
            Err(_) if self.usable() => {
                self.reset_recovery()?;
                self.bot_command(cb, data_length, direction_in, data_out)
            }
            Err(err) => Err(err),
        }
    }

    fn inquiry(&self) -> Result<(), XhciError> {
        let mut response = [0u8; INQUIRY_ALLOCATION as usize];
        self.bot_command_with_recovery(
            &build_inquiry(INQUIRY_ALLOCATION),
            INQUIRY_ALLOCATION as usize,
            true,
            Some(&mut response),
        )?;

        debug!(
            USBMassStorage,
            "inquiry: type={:#x} removable={} vendor={:?}",
            response[0] & 0x1F,
            response[1] & 0x80 != 0,
            core::str::from_utf8(&response[8..16]).unwrap_or("?")
        );
        Ok(())
    }

    fn read_capacity(&self) -> Result<(u32, u32), XhciError> {
        let mut response = [0u8; 8];
        self.bot_command_with_recovery(&build_read_capacity10(), 8, true, Some(&mut response))?;

        let (last_lba, block_size) = parse_read_capacity10(&response);
        if last_lba == u32::MAX {
            // would need READ CAPACITY(16), out of scope for this driver
            return Err(XhciError::BadParameter);
        }
        if block_size != 512 && block_size != 4096 {
            warn!(USBMassStorage, "unsupported block size {block_size}");
            return Err(XhciError::BadParameter);
        }

        Ok((last_lba + 1, block_size))
    }

    /// Reads `blocks` starting at `lba` into `out`, one page-sized READ(10)
    /// at a time.
    fn read_blocks_internal(&self, lba: u64, out: &mut [u8]) -> Result<(), StorageError> {
        if !self.usable() {
            return Err(StorageError::NoDevice);
        }

        let block_size = self.block_size as u64;
        if out.is_empty() || out.len() as u64 % block_size != 0 {
            return Err(StorageError::BadParameter);
        }
        let blocks = out.len() as u64 / block_size;
        if !validate_read_range(lba, blocks, self.block_count as u64) {
            return Err(StorageError::BadParameter);
        }

        let blocks_per_command = (PAGE_SIZE as u64 / block_size).max(1);
        let mut current_lba = lba;
        let mut remaining = blocks;
        let mut offset = 0usize;

        while remaining > 0 {
            let chunk = remaining.min(blocks_per_command);
            let chunk_bytes = (chunk * block_size) as usize;
            let cb = build_read10(current_lba as u32, chunk as u16);

            self.bot_command_with_recovery(
                &cb,
                chunk_bytes,
                true,
                Some(&mut out[offset..offset + chunk_bytes]),
            )
            .map_err(|err| match err {
                XhciError::NoDevice => StorageError::NoDevice,
                XhciError::BadParameter => StorageError::BadParameter,
                _ => StorageError::Io,
            })?;

            current_lba += chunk;
            remaining -= chunk;
            offset += chunk_bytes;
        }

        Ok(())
    }
}

impl BlockDevice for USBMassStorage {
    fn info(&self) -> Result<DiskInfo, StorageError> {
        if !self.usable() {
            return Err(StorageError::NoDevice);
        }
        Ok(DiskInfo {
            block_count: self.block_count as u64,
            block_size: self.block_size,
            removable: true,
        })
    }

    fn read_blocks(&self, lba: u64, buffer: &mut [u8]) -> Result<(), StorageError> {
        self.read_blocks_internal(lba, buffer)
    }

    fn write_blocks(&self, _lba: u64, _buffer: &[u8]) -> Result<(), StorageError> {
        // this driver is read-only on purpose
        Err(StorageError::NoPermission)
    }

    fn reset(&self) -> Result<(), StorageError> {
        if !self.usable() {
            return Err(StorageError::NoDevice);
        }
        self.reset_recovery().map_err(|_| StorageError::Io)
    }
}

struct TrackedDisk {
    device: Arc<USBMassStorage>,
    disk_id: DiskId,
}

static TRACKED: Lazy<Mutex<Vec<TrackedDisk>>> = Lazy::new(|| Mutex::new(Vec::new()));

pub struct UsbStorageDriver;

/// Registers the detection/presence poll.
pub fn initialize() -> bool {
    deferred_work::register_poll_only(Arc::new(poll), "USBStorage").is_some()
}

fn poll() {
    update_presence();
    scan_controllers();
}

/// Drops disks whose USB device disappeared: unregister, broadcast the
/// unmount, release the subtree references.
fn update_presence() {
    let mut detached = Vec::new();
    {
        let mut tracked = TRACKED.lock();
        tracked.retain(|entry| {
            if entry.device.device.is_present() {
                true
            } else {
                entry.device.ready.store(false, Ordering::Release);
                detached.push(entry.disk_id);
                false
            }
        });
    }

    for disk_id in detached {
        info!("USB mass storage disk {disk_id:?} detached");
        storage::unregister_disk(disk_id);
        driver::broadcast(BusMessage::UsbMassStorageUnmounted { disk: disk_id });
    }
}

fn is_tracked(device: &Arc<USBDevice>) -> bool {
    TRACKED
        .lock()
        .iter()
        .any(|entry| Arc::ptr_eq(&entry.device.device, device))
}

/// Looks for untracked Bulk-Only SCSI interfaces on every controller.
fn scan_controllers() {
    for controller in xhci::controllers() {
        controller.ensure_usb_devices();

        for device in controller.devices() {
            if is_tracked(&device) {
                continue;
            }

            let found = {
                let state = device.state();
                if state.is_hub() {
                    continue;
                }
                state
                    .interfaces
                    .iter()
                    .find(|interface| {
                        interface.matches_class(
                            USB_CLASS_MASS_STORAGE,
                            MASS_STORAGE_SUBCLASS_SCSI,
                            MASS_STORAGE_PROTOCOL_BULK_ONLY,
                        )
                    })
                    .and_then(|interface| {
                        let bulk_in = interface.find_endpoint(ENDPOINT_TRANSFER_BULK, true)?;
                        let bulk_out = interface.find_endpoint(ENDPOINT_TRANSFER_BULK, false)?;
                        Some((interface.clone(), bulk_in, bulk_out))
                    })
            };

            let Some((interface, bulk_in, bulk_out)) = found else {
                continue;
            };

            match start_device(&controller, &device, interface, bulk_in, bulk_out) {
                Ok(storage_device) => {
                    let disk_id = storage::register_disk(storage_device.clone());
                    info!(
                        "USB mass storage attached on port {}: {} blocks of {} bytes ({disk_id:?})",
                        device.root_port(),
                        storage_device.block_count,
                        storage_device.block_size
                    );
                    TRACKED.lock().push(TrackedDisk {
                        device: storage_device,
                        disk_id,
                    });
                    driver::broadcast(BusMessage::UsbMassStorageMounted { disk: disk_id });
                }
                Err(err) => {
                    warn!(UsbStorageDriver, "mass storage start failed: {err}");
                }
            }
        }
    }
}

fn start_device(
    controller: &Arc<XHCI>,
    device: &Arc<USBDevice>,
    interface: Arc<USBInterface>,
    bulk_in: Arc<USBEndpoint>,
    bulk_out: Arc<USBEndpoint>,
) -> Result<Arc<USBMassStorage>, XhciError> {
    {
        let mut state = device.state();
        xhci_device::add_bulk_endpoint(controller, &mut state, &bulk_in)?;
        xhci_device::add_bulk_endpoint(controller, &mut state, &bulk_out)?;
    }

    let io_frame = frame_allocator::allocate_frame().ok_or(XhciError::OutOfMemory)?;

    let mut storage_device = USBMassStorage {
        controller: Arc::downgrade(controller),
        device: device.clone(),
        interface_number: interface.interface_number(),
        interface,
        bulk_in,
        bulk_out,
        tag: AtomicU32::new(1),
        block_count: 0,
        block_size: 0,
        io_frame,
        io_lock: Mutex::new(()),
        ready: AtomicBool::new(true),
    };

    storage_device.inquiry()?;
    let (block_count, block_size) = storage_device.read_capacity()?;
    storage_device.block_count = block_count;
    storage_device.block_size = block_size;

    Ok(Arc::new(storage_device))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbw_layout() {
        let cb = build_read10(0x11223344, 8);
        let cbw = build_cbw(7, 4096, true, &cb);

        assert_eq!(&cbw[0..4], b"USBC");
        assert_eq!(u32::from_le_bytes([cbw[4], cbw[5], cbw[6], cbw[7]]), 7);
        assert_eq!(u32::from_le_bytes([cbw[8], cbw[9], cbw[10], cbw[11]]), 4096);
        assert_eq!(cbw[12], 0x80);
        assert_eq!(cbw[13], 0); // LUN
        assert_eq!(cbw[14], 10); // CB length
        assert_eq!(cbw[15], SCSI_READ_10);
    }

    #[test]
    fn read10_is_big_endian() {
        let cb = build_read10(0x00ABCDEF, 0x0102);
        assert_eq!(&cb[2..6], &[0x00, 0xAB, 0xCD, 0xEF]);
        assert_eq!(&cb[7..9], &[0x01, 0x02]);
    }

    #[test]
    fn csw_validation() {
        let mut csw = [0u8; CSW_LENGTH];
        csw[0..4].copy_from_slice(b"USBS");
        csw[4..8].copy_from_slice(&9u32.to_le_bytes());
        csw[8..12].copy_from_slice(&0u32.to_le_bytes());
        csw[12] = 0;

        assert_eq!(parse_csw(&csw, 9).unwrap(), (0, 0));

        // wrong tag
        assert!(parse_csw(&csw, 10).is_err());

        // wrong signature
        csw[0] = b'X';
        assert!(parse_csw(&csw, 9).is_err());
    }

    #[test]
    fn csw_failure_status_is_reported() {
        let mut csw = [0u8; CSW_LENGTH];
        csw[0..4].copy_from_slice(b"USBS");
        csw[4..8].copy_from_slice(&3u32.to_le_bytes());
        csw[8..12].copy_from_slice(&512u32.to_le_bytes());
        csw[12] = 1;

        assert_eq!(parse_csw(&csw, 3).unwrap(), (1, 512));
    }

    #[test]
    fn read_capacity_parse() {
        let payload = [0x00, 0x00, 0x3F, 0xFF, 0x00, 0x00, 0x02, 0x00];
        let (last_lba, block_size) = parse_read_capacity10(&payload);
        assert_eq!(last_lba, 0x3FFF);
        assert_eq!(block_size, 512);
    }

    #[test]
    fn read_range_bounds() {
        assert!(validate_read_range(0, 8, 100));
        assert!(validate_read_range(92, 8, 100));
        // sector_low + num_sectors exceeding the medium is rejected
        assert!(!validate_read_range(93, 8, 100));
        assert!(!validate_read_range(100, 1, 100));
        assert!(!validate_read_range(0, 0, 100));
        // no overflow on pathological inputs
        assert!(!validate_read_range(u64::MAX, 1, 100));
    }

    #[test]
    fn inquiry_command_block() {
        let cb = build_inquiry(36);
        assert_eq!(cb[0], SCSI_INQUIRY);
        assert_eq!(cb[4], 36);
    }
}
