//! The xHCI host-controller driver.
//!
//! One [`XHCI`] instance per controller function: it owns the MMIO banks,
//! the command and event rings, the DCBAA, and one [`USBDevice`] object
//! per root port. The interrupt top half acknowledges the interrupter and
//! votes; the bottom half (or the poll fallback) drains the event ring
//! into a per-controller completion queue that blocking waiters match by
//! TRB physical address.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use serde::Serialize;

use crate::drivers::deferred_work::{self, DeferredWorkHandle};
use crate::drivers::driver::{
    DriverCommand, DriverError, DriverResult, KernelDriver, make_version,
};
use crate::drivers::interrupts::{
    self, DeviceInterruptHandler, DeviceInterruptRegistration,
};
use crate::drivers::pci::{PciDevice, PciDeviceInfo};
use crate::utils::locks::Mutex;
use crate::utils::threshold_latch::ThresholdLatch;
use crate::{PhysAddr, debug, error, platform, time, warn};

pub mod contexts;
pub mod device;
pub mod hub;
pub mod regs;
pub mod rings;
pub mod usb;
pub mod usb_device;
pub mod usb_endpoint;
pub mod usb_interface;
pub mod utils;

#[cfg(test)]
mod tests;

use lazy_static::lazy_static;
use regs::{PortSpeed, XHCIDoorbellManager, XHCIRegisters};
use rings::command::XHCICommandRing;
use rings::event::XHCIEventRing;
use rings::trbs::{
    CompletionStatusCode, EventResponseTRB, TRB, TRB_TYPE_CMD_COMPLETION, TRB_TYPE_TRANSFER_EVENT,
};
use usb_device::{EnumError, USBDevice, tree_has_references};
use utils::XhciError;

/// TRBs per ring (command, event and transfer rings alike).
pub const MAX_TRB_COUNT: usize = 256;

pub const COMPLETION_QUEUE_MAX: usize = 64;

const COMMAND_TIMEOUT_MS: u64 = 1000;
const TRANSFER_TIMEOUT_MS: u64 = 1000;
const COMPLETION_WARN_THRESHOLD_MS: u64 = 200;

/// How often a root port's enumeration failure is re-logged.
const ENUM_LOG_INTERVAL_MS: u64 = 2000;

/// One recorded completion event, matched by `(event_type, trb_physical)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub trb_physical: u64,
    pub code: CompletionStatusCode,
    pub event_type: u8,
    pub slot_id: u8,
}

/// Fixed-capacity completion queue; controller-authoritative order, oldest
/// entries evicted on overflow.
#[derive(Debug, Default)]
pub(super) struct CompletionQueue {
    entries: heapless::Vec<Completion, COMPLETION_QUEUE_MAX>,
}

impl CompletionQueue {
    pub const fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
        }
    }

    pub fn push(&mut self, completion: Completion) {
        if self.entries.is_full() {
            self.entries.remove(0);
        }
        let _ = self.entries.push(completion);
    }

    /// Removes and returns the first entry matching type and TRB address.
    pub fn pop(&mut self, event_type: u8, trb_physical: u64) -> Option<Completion> {
        let index = self
            .entries
            .iter()
            .position(|c| c.event_type == event_type && c.trb_physical == trb_physical)?;
        Some(self.entries.remove(index))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommandResponse {
    pub slot_id: u8,
    pub code: CompletionStatusCode,
    pub trb_pointer: u64,
}

/// Capability snapshot taken once at attach.
#[derive(Debug, Clone, Copy)]
pub struct ControllerCaps {
    pub hci_version: u16,
    pub max_slots: usize,
    pub max_ports: u8,
    pub max_interrupters: u16,
    pub context_size_64: bool,
    pub scratchpad_count: usize,
    pub port_power_control: bool,
}

/// The main xHCI driver instance.
pub struct XHCI {
    pci: PciDeviceInfo,
    /// be careful using the registers, everything in there is unsafe
    regs: UnsafeCell<XHCIRegisters>,
    caps: ControllerCaps,
    /// Only touched by the bottom half / poll and by waiting tasks.
    event_ring: Mutex<XHCIEventRing>,
    command_ring: Mutex<XHCICommandRing>,
    doorbells: Mutex<XHCIDoorbellManager>,
    completions: Mutex<CompletionQueue>,
    /// One device object per root port, populated or not. 0-indexed by
    /// port index, port numbers are 1-based.
    ports: Vec<Arc<USBDevice>>,
    interrupt_slot: Mutex<Option<u8>>,
    hub_poll_handle: Mutex<Option<DeferredWorkHandle>>,
    hse_logged: AtomicBool,
}

unsafe impl Send for XHCI {}
unsafe impl Sync for XHCI {}

lazy_static! {
    static ref CONTROLLERS: Mutex<Vec<Arc<XHCI>>> = Mutex::new(Vec::new());
}

/// Snapshot of the registered controllers, for the class-driver scans.
pub fn controllers() -> Vec<Arc<XHCI>> {
    CONTROLLERS.lock().clone()
}

impl XHCI {
    /// The register wrapper. Callers must not hold two of these across a
    /// suspension point; the banks themselves are volatile-accessed.
    #[allow(clippy::mut_from_ref)]
    unsafe fn regs(&self) -> &mut XHCIRegisters {
        unsafe { &mut *self.regs.get() }
    }

    pub const fn caps(&self) -> &ControllerCaps {
        &self.caps
    }

    pub fn pci_info(&self) -> &PciDeviceInfo {
        &self.pci
    }

    pub fn ports(&self) -> &[Arc<USBDevice>] {
        &self.ports
    }

    /// Every present device reachable through this controller, root ports
    /// and hub subtrees alike.
    pub fn devices(&self) -> Vec<Arc<USBDevice>> {
        fn collect(device: &Arc<USBDevice>, out: &mut Vec<Arc<USBDevice>>) {
            if !device.is_present() {
                return;
            }
            out.push(device.clone());

            let children: Vec<Arc<USBDevice>> = {
                let state = device.state();
                match &state.hub {
                    Some(hub) => hub.children.iter().flatten().cloned().collect(),
                    None => Vec::new(),
                }
            };
            for child in &children {
                collect(child, out);
            }
        }

        let mut out = Vec::new();
        for device in &self.ports {
            collect(device, &mut out);
        }
        out
    }

    pub fn ring_endpoint_doorbell(&self, slot_id: u8, dci: u8) {
        self.doorbells.lock().ring_endpoint_doorbell(slot_id, dci);
    }

    pub(super) unsafe fn set_dcbaa_entry(&self, slot_id: u8, entry: PhysAddr) {
        unsafe { self.regs().set_dcbaa_entry(slot_id, entry) }
    }

    pub(super) unsafe fn clear_dcbaa_entry(&self, slot_id: u8) {
        unsafe { self.regs().clear_dcbaa_entry(slot_id) }
    }

    /// Drains the event ring into the completion queue. Runs from the
    /// bottom half, the poll callback, and from blocking waiters.
    pub fn poll_completions(&self) {
        let events = self.event_ring.lock().dequeue_events();
        if events.is_empty() {
            return;
        }

        let mut completions = self.completions.lock();
        for event in events {
            let Some(response) = event.into_event_trb() else {
                continue;
            };
            match response {
                EventResponseTRB::CommandCompletion(res) => {
                    debug!(
                        XHCI,
                        "command completed with code {:?} ({:#x}), slot: {}",
                        res.status.code(),
                        res.status.code() as u8,
                        res.cmd.slot_id(),
                    );
                    completions.push(Completion {
                        trb_physical: res.trb_pointer,
                        code: res.status.code(),
                        event_type: TRB_TYPE_CMD_COMPLETION,
                        slot_id: res.cmd.slot_id(),
                    });
                }
                EventResponseTRB::TransferResponse(res) => {
                    completions.push(Completion {
                        trb_physical: res.trb_ptr,
                        code: res.status.completion_code(),
                        event_type: TRB_TYPE_TRANSFER_EVENT,
                        slot_id: res.cmd.slot_id(),
                    });
                }
                EventResponseTRB::PortStatusChange(event) => {
                    debug!(
                        XHCI,
                        "port status change for port {} with code {:?}",
                        event.parameter.port_index(),
                        event.status.completion_code(),
                    );
                }
            }
        }
    }

    pub(super) fn pop_completion(&self, event_type: u8, trb_physical: PhysAddr) -> Option<Completion> {
        self.completions
            .lock()
            .pop(event_type, trb_physical.into_raw() as u64)
    }

    /// Enqueues a command TRB, rings the command doorbell and blocks for
    /// its completion event.
    pub fn send_command(&self, trb: TRB) -> Result<CommandResponse, XhciError> {
        let trb_phys = self.command_ring.lock().enqueue(trb);
        self.doorbells.lock().ring_command_doorbell();
        self.wait_for_command_completion(trb_phys)
    }

    fn wait_for_command_completion(
        &self,
        trb_phys: PhysAddr,
    ) -> Result<CommandResponse, XhciError> {
        let mut latch =
            ThresholdLatch::new("command completion", COMPLETION_WARN_THRESHOLD_MS, time!());
        let deadline = time!() + COMMAND_TIMEOUT_MS;

        loop {
            self.poll_completions();
            if let Some(completion) = self.pop_completion(TRB_TYPE_CMD_COMPLETION, trb_phys) {
                return Ok(CommandResponse {
                    slot_id: completion.slot_id,
                    code: completion.code,
                    trb_pointer: completion.trb_physical,
                });
            }

            let now = time!();
            if latch.check(now) {
                warn!(
                    XHCI,
                    "command completion for {trb_phys:?} exceeded {COMPLETION_WARN_THRESHOLD_MS}ms"
                );
            }
            if now >= deadline {
                return Err(XhciError::NoCommandResponse);
            }
            platform::sleep_ms(1);
        }
    }

    /// Blocks until the transfer TRB at `trb_phys` completes, up to the
    /// transfer timeout.
    pub fn wait_for_transfer_completion(
        &self,
        trb_phys: PhysAddr,
    ) -> Result<CompletionStatusCode, XhciError> {
        self.wait_for_transfer_completion_timeout(trb_phys, TRANSFER_TIMEOUT_MS)
    }

    pub fn wait_for_transfer_completion_timeout(
        &self,
        trb_phys: PhysAddr,
        timeout_ms: u64,
    ) -> Result<CompletionStatusCode, XhciError> {
        let mut latch =
            ThresholdLatch::new("transfer completion", COMPLETION_WARN_THRESHOLD_MS, time!());
        let deadline = time!() + timeout_ms;

        loop {
            if let Some(code) = self.check_transfer_completion(trb_phys) {
                return Ok(code);
            }

            let now = time!();
            if latch.check(now) {
                warn!(
                    XHCI,
                    "transfer completion for {trb_phys:?} exceeded {COMPLETION_WARN_THRESHOLD_MS}ms"
                );
            }
            if now >= deadline {
                return Err(XhciError::NoTransferResponse);
            }
            platform::sleep_ms(1);
        }
    }

    /// Non-blocking transfer-completion check, for pollers keeping one
    /// transfer in flight.
    pub fn check_transfer_completion(&self, trb_phys: PhysAddr) -> Option<CompletionStatusCode> {
        self.poll_completions();
        self.pop_completion(TRB_TYPE_TRANSFER_EVENT, trb_phys)
            .map(|completion| completion.code)
    }

    fn check_host_system_error(&self) {
        let regs = unsafe { self.regs() };
        let status = crate::read_ref!(unsafe { regs.operational_regs() }.usbstatus);
        if !status.contains(regs::USBSts::HSERROR) {
            return;
        }
        if self.hse_logged.swap(true, Ordering::AcqRel) {
            return;
        }

        let snapshot = regs.snapshot();
        let pci_status = self.pci.read_command_status();
        error!(
            XHCI,
            "host system error on controller {:?}: pci cmd/status={pci_status:#x}\n{snapshot}",
            self.pci.address
        );
    }

    /// Walks the root ports: probes newly connected ports, tears down
    /// devices whose port lost its connection. Runs from the class-driver
    /// poll callbacks, so hot-plug works in both execution modes.
    pub fn ensure_usb_devices(&self) {
        for (port_index, device) in self.ports.iter().enumerate() {
            let port_sc = unsafe { self.regs() }.read_port_status(port_index as u8);

            if !port_sc.ccs() {
                if device.is_present() || device.destroy_pending() {
                    debug!(XHCI, "port {} disconnected...", port_index + 1);
                    // clone so the reference floor matches every other
                    // destroy call site (owner table + caller)
                    self.destroy_usb_device(&device.clone());
                }
                continue;
            }

            if !device.is_present() {
                let _ = self.probe_port(device, port_index as u8);
            }
        }
    }

    /// Resets and enumerates the device on a connected root port.
    fn probe_port(&self, device: &Arc<USBDevice>, port_index: u8) -> Result<(), XhciError> {
        let port_sc = unsafe { self.regs() }.read_port_status(port_index);
        if !port_sc.ccs() {
            device.set_present(false);
            return Err(XhciError::NoDevice);
        }

        // A device that was unplugged while a class driver still holds
        // references must finish dying before the port re-enumerates.
        if device.destroy_pending() && tree_has_references(device, 2) {
            self.log_enum_failure(device, port_index, EnumError::Busy);
            return Err(XhciError::NoDevice);
        }

        let speed = port_sc.port_speed();
        {
            let mut state = device.state();
            state.route_string = 0;
            state.depth = 0;
            state.parent_port = 0;
            state.tt_hub_slot = 0;
            state.tt_hub_port = 0;
            state.speed = speed;
        }
        device.set_destroy_pending(false);

        let is_usb3 = matches!(speed, PortSpeed::Super | PortSpeed::SuperPlus);
        if !port_sc.ped() {
            let ok = unsafe {
                self.regs()
                    .operational_regs()
                    .reset_port(is_usb3, port_index)
            };
            if !ok {
                device.state().last_enum_error = EnumError::ResetTimeout;
                self.log_enum_failure(device, port_index, EnumError::ResetTimeout);
                return Err(XhciError::ControllerTimeout);
            }
        }

        let port_sc = unsafe { self.regs() }.read_port_status(port_index);
        let speed = port_sc.port_speed();
        if speed == PortSpeed::Undefined {
            device.state().last_enum_error = EnumError::InvalidSpeed;
            self.log_enum_failure(device, port_index, EnumError::InvalidSpeed);
            return Err(XhciError::NoDevice);
        }
        device.state().speed = speed;

        debug!(
            XHCI,
            "setting up device at port {}, speed {} ({:#x}), 64-byte contexts: {}",
            port_index + 1,
            speed.as_str(),
            speed as u8,
            self.caps.context_size_64
        );

        if let Err(err) = self.enumerate_device(device) {
            let enum_error = device.state().last_enum_error;
            self.log_enum_failure(device, port_index, enum_error);
            return Err(err);
        }

        let is_hub = device.state().is_hub();
        if is_hub {
            if let Err(err) = hub::init_hub(self, device) {
                device.state().last_enum_error = EnumError::HubInit;
                error!(XHCI, "port {} hub init failed: {err}", port_index + 1);
            }
        }

        Ok(())
    }

    /// Full enumeration of a reset, connected device: slot, address,
    /// descriptors, configuration. The caller handles hub init.
    pub(super) fn enumerate_device(&self, device: &Arc<USBDevice>) -> Result<(), XhciError> {
        let mut state = device.state();
        state.clear_enumeration();
        state.last_enum_error = EnumError::None;
        state.last_enum_completion = 0;
        state.max_packet_size0 = state.speed.default_max_packet_size0();

        // Enable Slot picks the slot id the whole rest hangs off.
        let slot_id = match device::enable_slot(self) {
            Ok(slot_id) => slot_id,
            Err(err) => {
                state.last_enum_error = EnumError::EnableSlot;
                return Err(err);
            }
        };

        let slot = match device::XhciSlot::create(self.caps.context_size_64, slot_id, state.speed)
        {
            Ok(slot) => slot,
            Err(err) => {
                state.last_enum_error = EnumError::InitState;
                return Err(err);
            }
        };

        debug!(XHCI, "slot {slot_id} was chosen for port {}", device.root_port());

        // Publish the output device context before Address Device.
        unsafe { self.set_dcbaa_entry(slot_id, slot.device_ctx_base()) };
        state.slot_id = slot_id;
        state.slot = Some(slot);

        let (mps0, route, root_port, tt_slot, tt_port) = (
            state.max_packet_size0,
            state.route_string,
            device.root_port(),
            state.tt_hub_slot,
            state.tt_hub_port,
        );
        state
            .slot
            .as_mut()
            .unwrap()
            .build_address_input_ctx(mps0, route, root_port, tt_slot, tt_port);

        if let Err(err) = device::address_device(self, &mut state) {
            state.last_enum_error = EnumError::AddressDevice;
            state.last_enum_completion = completion_of(&err);
            return Err(err);
        }
        state.address = slot_id;

        // First 8 descriptor bytes tell us the real EP0 max packet size.
        if let Err(err) = self.read_device_descriptor(&mut state, 8) {
            state.last_enum_error = EnumError::DeviceDescriptor;
            state.last_enum_completion = completion_of(&err);
            return Err(err);
        }

        let refined = compute_max_packet_size0(state.speed, state.descriptor.b_max_packet_size_0);
        if refined != state.max_packet_size0 {
            state.max_packet_size0 = refined;
            state.slot.as_mut().unwrap().build_ep0_evaluate_ctx(refined);
            // A controller rejecting Evaluate Context is not fatal, the
            // default size keeps working for most devices.
            if let Err(err) = device::evaluate_context(self, &mut state) {
                warn!(XHCI, "evaluate context failed: {err}");
            }
        }

        if let Err(err) =
            self.read_device_descriptor(&mut state, usb::USB_DEVICE_DESCRIPTOR_LENGTH)
        {
            state.last_enum_error = EnumError::DeviceDescriptor;
            state.last_enum_completion = completion_of(&err);
            return Err(err);
        }

        let config_blob = match self.read_config_descriptor(&mut state) {
            Ok(blob) => blob,
            Err(err) => {
                state.last_enum_error = EnumError::ConfigDescriptor;
                state.last_enum_completion = completion_of(&err);
                return Err(err);
            }
        };

        let parsed = match usb::parse_configuration(&config_blob) {
            Ok(parsed) => parsed,
            Err(err) => {
                state.last_enum_error = EnumError::ConfigParse;
                return Err(err);
            }
        };

        state.configs.clear();
        state.configs.push(parsed.configuration);
        state.interfaces.clear();
        for interface in &parsed.interfaces {
            let interface = usb_interface::USBInterface::new(
                interface.descriptor,
                &interface.endpoints,
                slot_id,
            )?;
            state.interfaces.push(Arc::new(interface));
        }

        let config_value = parsed.configuration.value;
        if let Err(err) = self.set_configuration(&mut state, config_value) {
            state.last_enum_error = EnumError::SetConfiguration;
            state.last_enum_completion = completion_of(&err);
            return Err(err);
        }
        state.selected_config = config_value;

        debug!(
            XHCI,
            "port {} enumerated: vid={:04x} pid={:04x} class={:#x} config={} interfaces={}",
            device.root_port(),
            state.descriptor.id_vendor,
            state.descriptor.id_product,
            state.descriptor.b_device_class,
            config_value,
            state.interfaces.len()
        );

        drop(state);
        device.set_present(true);
        Ok(())
    }

    fn read_device_descriptor(
        &self,
        state: &mut usb_device::UsbDeviceState,
        length: usize,
    ) -> Result<(), XhciError> {
        use rings::trbs::{PacketRecipient, PacketType, XHCIDeviceRequestPacket};

        let scratch = device::ScratchPage::new()?;
        let packet = XHCIDeviceRequestPacket::new()
            .with_p_type(PacketType::Standard)
            .with_recipient(PacketRecipient::Device)
            .with_device_to_host(true)
            .with_b_request(usb::REQUEST_GET_DESCRIPTOR)
            .with_w_value(usb::USB_DESCRIPTOR_DEVICE_TYPE << 8)
            .with_w_index(0)
            .with_w_length(length as u16);

        device::control_transfer(self, state, packet, Some(scratch.phys_addr()), true)?;

        let mut bytes = [0u8; usb::USB_DEVICE_DESCRIPTOR_LENGTH];
        scratch.read(&mut bytes[..length]);
        let full: usb::UsbDeviceDescriptor = unsafe { core::mem::transmute(bytes) };
        if length >= usb::USB_DEVICE_DESCRIPTOR_LENGTH {
            state.descriptor = full;
        } else {
            // partial read: only the max-packet field is trustworthy
            state.descriptor.b_max_packet_size_0 = full.b_max_packet_size_0;
        }
        Ok(())
    }

    /// Reads the configuration descriptor in two steps: the 9-byte header
    /// for wTotalLength, then the whole thing (clamped to one page).
    fn read_config_descriptor(
        &self,
        state: &mut usb_device::UsbDeviceState,
    ) -> Result<Vec<u8>, XhciError> {
        use rings::trbs::{PacketRecipient, PacketType, XHCIDeviceRequestPacket};

        let scratch = device::ScratchPage::new()?;
        let mut packet = XHCIDeviceRequestPacket::new()
            .with_p_type(PacketType::Standard)
            .with_recipient(PacketRecipient::Device)
            .with_device_to_host(true)
            .with_b_request(usb::REQUEST_GET_DESCRIPTOR)
            .with_w_value(usb::USB_DESCRIPTOR_CONFIGURATION_TYPE << 8)
            .with_w_index(0)
            .with_w_length(usb::USB_CONFIGURATION_DESCRIPTOR_LENGTH as u16);

        device::control_transfer(self, state, packet, Some(scratch.phys_addr()), true)?;

        let mut header = [0u8; usb::USB_CONFIGURATION_DESCRIPTOR_LENGTH];
        scratch.read(&mut header);
        let total_length = u16::from_le_bytes([header[2], header[3]]);
        if total_length == 0 {
            return Err(XhciError::BadParameter);
        }
        let total_length =
            (total_length as usize).min(crate::memory::PAGE_SIZE);

        packet.set_w_length(total_length as u16);
        device::control_transfer(self, state, packet, Some(scratch.phys_addr()), true)?;

        let mut blob = alloc::vec![0u8; total_length];
        scratch.read(&mut blob);
        Ok(blob)
    }

    fn set_configuration(
        &self,
        state: &mut usb_device::UsbDeviceState,
        configuration: u8,
    ) -> Result<(), XhciError> {
        use rings::trbs::{PacketRecipient, PacketType, XHCIDeviceRequestPacket};

        let packet = XHCIDeviceRequestPacket::new()
            .with_p_type(PacketType::Standard)
            .with_recipient(PacketRecipient::Device)
            .with_device_to_host(false)
            .with_b_request(usb::REQUEST_SET_CONFIGURATION)
            .with_w_index(0)
            .with_w_length(0)
            .with_w_value(configuration as u16);
        device::control_transfer(self, state, packet, None, false)
    }

    /// Marks the device gone and frees the subtree once no class driver
    /// holds a share of it; otherwise the free is deferred to a later
    /// poll. Returns whether the device was actually freed.
    pub fn destroy_usb_device(&self, device: &Arc<USBDevice>) -> bool {
        device.set_present(false);
        device.set_destroy_pending(true);

        // owner table + our caller's clone
        if tree_has_references(device, 2) {
            debug!(
                XHCI,
                "port {} teardown deferred, subtree still referenced",
                device.root_port()
            );
            return false;
        }

        // Children first so their slots die before the hub's.
        let children: Vec<Arc<USBDevice>> = {
            let mut state = device.state();
            match state.hub.as_mut() {
                Some(hub) => hub.children.iter_mut().filter_map(|c| c.take()).collect(),
                None => Vec::new(),
            }
        };
        for child in &children {
            self.destroy_usb_device(child);
        }

        let mut state = device.state();
        let slot_id = state.slot_id;
        if slot_id != 0 {
            // Quiesce EP0 and the endpoint rings, then release the slot.
            let _ = device::stop_endpoint(self, slot_id, device::XHCI_EP0_DCI);
            for interface in &state.interfaces {
                for endpoint in interface.endpoints() {
                    let _ = device::stop_endpoint(self, slot_id, endpoint.dci());
                }
            }
            let _ = device::disable_slot(self, slot_id);
            unsafe { self.clear_dcbaa_entry(slot_id) };
        }

        state.clear_enumeration();
        drop(state);
        device.set_destroy_pending(false);

        debug!(XHCI, "port {} device destroyed", device.root_port());
        true
    }

    /// One rate-limited diagnostic per root port with the registers that
    /// matter for postmortems.
    fn log_enum_failure(&self, device: &Arc<USBDevice>, port_index: u8, enum_error: EnumError) {
        let now = time!();
        {
            let mut state = device.state();
            if now.saturating_sub(state.last_enum_log_ms) < ENUM_LOG_INTERVAL_MS {
                return;
            }
            state.last_enum_log_ms = now;
        }

        let regs = unsafe { self.regs() };
        let port_sc = regs.read_port_status(port_index);
        let op_regs = unsafe { regs.operational_regs() };
        let usbcmd = crate::read_ref!(op_regs.usbcmd);
        let usbsts = crate::read_ref!(op_regs.usbstatus);
        warn!(
            XHCI,
            "port {} enumeration failed ({enum_error:?}): portsc={:#x} usbcmd={usbcmd:?} usbsts={usbsts:?}",
            port_index + 1,
            port_sc.into_bits()
        );
    }
}

/// EP0 max packet size from the descriptor field: SuperSpeed encodes it as
/// a power of two, everything else carries the byte count directly.
fn compute_max_packet_size0(speed: PortSpeed, descriptor_value: u8) -> u16 {
    match speed {
        PortSpeed::Super | PortSpeed::SuperPlus => 1u16 << descriptor_value.min(9),
        _ => {
            if descriptor_value == 0 {
                speed.default_max_packet_size0()
            } else {
                descriptor_value as u16
            }
        }
    }
}

fn completion_of(err: &XhciError) -> u8 {
    match err {
        XhciError::CommandNotSuccessful(code) | XhciError::TransferNotSuccessful(code) => {
            code.into_bits()
        }
        _ => 0,
    }
}

impl DeviceInterruptHandler for XHCI {
    /// Top half: check for a pending interrupter, acknowledge it, vote.
    /// No interrupt pending means a shared line fired for someone else.
    fn interrupt(&self) -> bool {
        self.check_host_system_error();

        let regs = unsafe { self.regs() };
        if !regs.has_pending_interrupt() {
            return false;
        }

        unsafe {
            // We only use interrupter 0 for now
            regs.acknowledge_irq(0);
        }
        true
    }

    /// Bottom half: all the data movement.
    fn deferred(&self) {
        self.poll_completions();
        crate::drivers::keyboard::on_xhci_interrupt(self);
        crate::drivers::usb_mouse::on_xhci_interrupt(self);
    }

    /// Polling fallback: acknowledge anything pending, then behave like
    /// the bottom half.
    fn poll(&self) {
        let regs = unsafe { self.regs() };
        if regs.has_pending_interrupt() {
            unsafe { regs.acknowledge_irq(0) };
        }
        self.deferred();
    }
}

impl PciDevice for XHCI {
    fn class() -> (u8, u8, u8) {
        (0x0c, 0x03, 0x30)
    }

    fn create(info: PciDeviceInfo) -> Option<Arc<Self>> {
        match Self::try_create(info) {
            Ok(controller) => Some(controller),
            Err(err) => {
                error!(XHCI, "controller attach failed: {err}");
                None
            }
        }
    }

    fn start(controller: &Arc<Self>) -> bool {
        let controller_dyn: Arc<dyn DeviceInterruptHandler> = controller.clone();
        let weak: Weak<dyn DeviceInterruptHandler> = Arc::downgrade(&controller_dyn);
        let slot = interrupts::register(DeviceInterruptRegistration {
            handler: weak,
            legacy_irq: controller.pci.legacy_irq,
            target_cpu: 0,
            wants_poll: true,
            name: "XHCI",
        });
        if slot.is_none() {
            warn!(XHCI, "no interrupt slot available, controller will rely on polling");
        }
        *controller.interrupt_slot.lock() = slot;

        Self::register_hub_poll(controller);

        let regs = unsafe { controller.regs() };
        if let Err(err) = unsafe { regs.start() } {
            error!(XHCI, "controller failed to start: {err}");
            return false;
        }
        unsafe { regs.power_ports() };

        debug!(XHCI, "started\n{}", unsafe { regs.operational_regs() });

        controller.ensure_usb_devices();
        CONTROLLERS.lock().push(controller.clone());
        true
    }
}

impl XHCI {
    fn try_create(info: PciDeviceInfo) -> Result<Arc<Self>, XhciError> {
        info.enable_bus_mastering();

        let (bar0, bar0_size) = info.memory_bar(0).ok_or(XhciError::BadParameter)?;
        let mmio = platform::get()
            .map_mmio(bar0, bar0_size as usize)
            .ok_or(XhciError::OutOfMemory)?;

        let caps_ptr = mmio.into_ptr::<regs::CapsReg>();
        let mut registers = unsafe { XHCIRegisters::new(caps_ptr)? };
        unsafe { registers.reset_zero()? };

        let caps_reg = unsafe { registers.capabilities() };
        let caps = ControllerCaps {
            hci_version: caps_reg.hci_version(),
            max_slots: caps_reg.max_device_slots(),
            max_ports: caps_reg.max_ports(),
            max_interrupters: caps_reg.max_interrupters(),
            context_size_64: caps_reg.context_sz_64bytes(),
            scratchpad_count: caps_reg.max_scratchpad_buffers(),
            port_power_control: caps_reg.port_power_ctrl(),
        };

        let command_ring = XHCICommandRing::create(MAX_TRB_COUNT).ok_or(XhciError::OutOfMemory)?;
        let mut event_ring = XHCIEventRing::create(MAX_TRB_COUNT, registers.interrupter_ptr(0))
            .ok_or(XhciError::OutOfMemory)?;

        unsafe { registers.reconfigure(&mut event_ring, &command_ring)? };

        let doorbells = XHCIDoorbellManager::new(caps_reg.doorbells_base(), caps.max_slots);

        let ports = (1..=caps.max_ports)
            .map(|port| Arc::new(USBDevice::new_empty(port)))
            .collect();

        debug!(XHCI, "created\n{}", caps_reg);

        Ok(Arc::new(Self {
            pci: info,
            regs: UnsafeCell::new(registers),
            caps,
            event_ring: Mutex::new(event_ring),
            command_ring: Mutex::new(command_ring),
            doorbells: Mutex::new(doorbells),
            completions: Mutex::new(CompletionQueue::new()),
            ports,
            interrupt_slot: Mutex::new(None),
            hub_poll_handle: Mutex::new(None),
            hse_logged: AtomicBool::new(false),
        }))
    }

    fn register_hub_poll(controller: &Arc<Self>) {
        let mut handle = controller.hub_poll_handle.lock();
        if handle.is_some() {
            return;
        }

        let weak = Arc::downgrade(controller);
        *handle = deferred_work::register_poll_only(
            Arc::new(move || {
                if let Some(controller) = weak.upgrade() {
                    hub::poll_hubs(&controller);
                }
            }),
            "XHCIHub",
        );
        if handle.is_none() {
            warn!(XHCI, "failed to register hub poll");
        }
    }
}

/// One node of the enumeration report.
#[derive(Debug, Serialize)]
pub struct UsbDeviceSummary {
    pub root_port: u8,
    pub parent_port: u8,
    pub address: u8,
    pub slot_id: u8,
    pub speed: &'static str,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub configuration: u8,
    pub is_hub: bool,
    pub children: Vec<UsbDeviceSummary>,
}

fn summarize_device(device: &Arc<USBDevice>) -> Option<UsbDeviceSummary> {
    if !device.is_present() {
        return None;
    }

    let state = device.state();
    let mut children = Vec::new();
    if let Some(hub) = &state.hub {
        for child in hub.children.iter().flatten() {
            if let Some(summary) = summarize_device(child) {
                children.push(summary);
            }
        }
    }

    Some(UsbDeviceSummary {
        root_port: device.root_port(),
        parent_port: state.parent_port,
        address: state.address,
        slot_id: state.slot_id,
        speed: state.speed.as_str(),
        vendor_id: state.descriptor.id_vendor,
        product_id: state.descriptor.id_product,
        class: state.descriptor.b_device_class,
        configuration: state.selected_config,
        is_hub: state.is_hub(),
        children,
    })
}

fn flatten_summaries(summary: UsbDeviceSummary, out: &mut Vec<UsbDeviceSummary>) {
    let mut shallow = summary;
    let children = core::mem::take(&mut shallow.children);
    out.push(shallow);
    for child in children {
        flatten_summaries(child, out);
    }
}

/// The host-facing xHCI driver entry: probe binds controllers, the enum
/// commands report the device tree.
pub struct XhciDriver;

pub static XHCI_DRIVER: XhciDriver = XhciDriver;

impl KernelDriver for XhciDriver {
    fn name(&self) -> &'static str {
        "xhci"
    }

    fn command(&self, command: DriverCommand<'_>) -> DriverResult {
        match command {
            DriverCommand::Load | DriverCommand::Unload => Ok(0),
            DriverCommand::GetVersion => Ok(make_version(1, 0)),
            DriverCommand::GetCaps => Ok(0),
            DriverCommand::Probe(info) => {
                let (class, subclass, prog_if) = XHCI::class();
                if (info.class, info.subclass, info.prog_if) != (class, subclass, prog_if) {
                    return Err(DriverError::NoDevice);
                }
                let controller = XHCI::create(info.clone()).ok_or(DriverError::Unexpected)?;
                if !XHCI::start(&controller) {
                    return Err(DriverError::Unexpected);
                }
                Ok(0)
            }
            DriverCommand::EnumNext(request) => {
                let mut all = Vec::new();
                for controller in controllers() {
                    for device in controller.ports() {
                        if let Some(summary) = summarize_device(device) {
                            flatten_summaries(summary, &mut all);
                        }
                    }
                }

                let index = request.index as usize;
                if index >= all.len() {
                    request.summary = None;
                    return Err(DriverError::NoDevice);
                }
                request.summary = Some(all.swap_remove(index));
                Ok(0)
            }
            DriverCommand::EnumPretty(request) => {
                let mut roots = Vec::new();
                for controller in controllers() {
                    for device in controller.ports() {
                        if let Some(summary) = summarize_device(device) {
                            roots.push(summary);
                        }
                    }
                }
                request.output =
                    serde_json::to_string_pretty(&roots).map_err(|_| DriverError::Unexpected)?;
                Ok(roots.len() as u32)
            }
        }
    }
}

