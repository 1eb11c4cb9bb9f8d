//! Per-device xHCI plumbing: the input/output context pages and EP0
//! transfer ring behind a slot, EP0 control transfers, and the slot
//! commands (Enable/Disable Slot, Address Device, Evaluate Context,
//! Configure Endpoint, Stop/Reset Endpoint).

use crate::drivers::xhci::contexts::{
    DeviceEndpointState, DeviceEndpointType, EndpointDeviceCTXQword2, XHCIEndpointDeviceCtx32,
    XHCIInputControlCtx32, XHCIInputCtx32, XHCIInputCtx64, XHCISlotDeviceCtx32,
};
use crate::drivers::xhci::regs::PortSpeed;
use crate::drivers::xhci::rings::transfer::XHCITransferRing;
use crate::drivers::xhci::rings::trbs::{
    AddressDeviceCommandTRB, CompletionStatusCode, ConfigureEndpointCommandTRB, DataStageTRB,
    EndpointCommandTRB, EvaluateContextCommandTRB, PacketRecipient, PacketType, SetupStageTRB,
    SlotCommandTRB, TRB_TYPE_DISABLE_SLOT_CMD, TRB_TYPE_ENABLE_SLOT_CMD,
    TRB_TYPE_RESET_ENDPOINT_CMD, TRB_TYPE_STOP_ENDPOINT_CMD, SETUP_TRT_IN_DATA,
    SETUP_TRT_NO_DATA, SETUP_TRT_OUT_DATA, StatusStageTRB, XHCIDeviceRequestPacket,
};
use crate::drivers::xhci::usb::{
    ENDPOINT_TRANSFER_BULK, ENDPOINT_TRANSFER_INTERRUPT, REQUEST_CLEAR_FEATURE,
    USB_FEATURE_ENDPOINT_HALT, UsbEndpointDescriptor,
};
use crate::drivers::xhci::usb_device::UsbDeviceState;
use crate::drivers::xhci::usb_endpoint::USBEndpoint;
use crate::drivers::xhci::utils::XhciError;
use crate::drivers::xhci::{MAX_TRB_COUNT, XHCI};
use crate::memory::frame_allocator::{self, Frame};
use crate::memory::{PAGE_SIZE, PhysAddr};
use crate::{debug, error, write_ref};

pub const XHCI_EP0_DCI: u8 = 1;

/// One page of DMA-able scratch space for descriptor fetches; freed on
/// drop.
pub(super) struct ScratchPage {
    frame: Frame,
}

impl ScratchPage {
    pub fn new() -> Result<Self, XhciError> {
        let frame = frame_allocator::allocate_frame().ok_or(XhciError::OutOfMemory)?;
        Ok(Self { frame })
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.frame.phys_addr()
    }

    pub fn read(&self, out: &mut [u8]) {
        assert!(out.len() <= PAGE_SIZE);
        let base = self.frame.virt_addr().into_ptr::<u8>();
        for (index, byte) in out.iter_mut().enumerate() {
            *byte = unsafe { base.add(index).read_volatile() };
        }
    }
}

impl Drop for ScratchPage {
    fn drop(&mut self) {
        frame_allocator::deallocate_frame(self.frame);
    }
}

/// The xHCI face of an addressed device: input context page, output device
/// context page (what DCBAA[slot] points at) and the EP0 transfer ring.
#[derive(Debug)]
pub struct XhciSlot {
    use_64byte_ctx: bool,
    input_frame: Frame,
    input_ctx_base: PhysAddr,
    output_frame: Frame,
    device_ctx_base: PhysAddr,
    ep0_ring: XHCITransferRing,
    slot_id: u8,
    speed: PortSpeed,
}

impl XhciSlot {
    pub fn create(
        use_64byte_ctx: bool,
        slot_id: u8,
        speed: PortSpeed,
    ) -> Result<Self, XhciError> {
        let input_ctx_sz = if use_64byte_ctx {
            size_of::<XHCIInputCtx64>()
        } else {
            size_of::<XHCIInputCtx32>()
        };
        assert!(input_ctx_sz <= PAGE_SIZE);

        // The ring cleans itself up on drop, so build it first and the
        // frame unwind paths stay trivial.
        let ep0_ring = XHCITransferRing::create(MAX_TRB_COUNT, slot_id)?;

        let input_frame = frame_allocator::allocate_frame().ok_or(XhciError::OutOfMemory)?;
        let output_frame = match frame_allocator::allocate_frame() {
            Some(frame) => frame,
            None => {
                frame_allocator::deallocate_frame(input_frame);
                return Err(XhciError::OutOfMemory);
            }
        };

        Ok(Self {
            use_64byte_ctx,
            input_ctx_base: input_frame.phys_addr(),
            input_frame,
            device_ctx_base: output_frame.phys_addr(),
            output_frame,
            ep0_ring,
            slot_id,
            speed,
        })
    }

    pub const fn slot_id(&self) -> u8 {
        self.slot_id
    }

    pub const fn speed(&self) -> PortSpeed {
        self.speed
    }

    pub const fn input_ctx_base(&self) -> PhysAddr {
        self.input_ctx_base
    }

    pub const fn device_ctx_base(&self) -> PhysAddr {
        self.device_ctx_base
    }

    pub fn ep0_ring(&mut self) -> &mut XHCITransferRing {
        &mut self.ep0_ring
    }

    const fn ctx_size(&self) -> usize {
        if self.use_64byte_ctx { 64 } else { 32 }
    }

    fn input_base_ptr(&self) -> *mut u8 {
        self.input_frame.virt_addr().into_ptr::<u8>()
    }

    /// The meaningful fields of every context sit in its leading bytes, so
    /// the 32-byte layouts double as views over 64-byte contexts.
    pub fn input_control_ctx(&mut self) -> &mut XHCIInputControlCtx32 {
        unsafe { &mut *(self.input_base_ptr() as *mut XHCIInputControlCtx32) }
    }

    pub fn input_slot_ctx(&mut self) -> &mut XHCISlotDeviceCtx32 {
        let offset = self.ctx_size();
        unsafe { &mut *(self.input_base_ptr().add(offset) as *mut XHCISlotDeviceCtx32) }
    }

    pub fn input_ep_ctx(&mut self, dci: u8) -> &mut XHCIEndpointDeviceCtx32 {
        assert!((1..=31).contains(&dci));
        let offset = self.ctx_size() * (1 + dci as usize);
        unsafe { &mut *(self.input_base_ptr().add(offset) as *mut XHCIEndpointDeviceCtx32) }
    }

    /// The controller-owned slot context in the output device context.
    pub fn output_slot_ctx(&self) -> XHCISlotDeviceCtx32 {
        let ptr = self.output_frame.virt_addr().into_ptr::<XHCISlotDeviceCtx32>();
        unsafe { ptr.read_volatile() }
    }

    fn zero_input_ctx(&mut self) {
        let len = if self.use_64byte_ctx {
            size_of::<XHCIInputCtx64>()
        } else {
            size_of::<XHCIInputCtx32>()
        };
        let base = self.input_base_ptr();
        for index in 0..len {
            unsafe { base.add(index).write_volatile(0) };
        }
    }

    /// Builds the input context for Address Device: slot context routing
    /// plus the EP0 context pointing at our EP0 ring.
    pub fn build_address_input_ctx(
        &mut self,
        max_packet_size: u16,
        route_string: u32,
        root_port: u8,
        tt_hub_slot: u8,
        tt_hub_port: u8,
    ) {
        self.zero_input_ctx();

        let speed = self.speed;
        let in_control_ctx = self.input_control_ctx();
        // Enable slot and control endpoint contexts
        in_control_ctx.add_ctx_flags = (1 << 0) | (1 << 1);
        in_control_ctx.drop_flags = 0;

        let slot_ctx = self.input_slot_ctx();
        write_ref!(
            slot_ctx.dword0,
            slot_ctx
                .dword0
                .with_context_entries(1)
                .with_speed(speed.into_bits())
                .with_route_string(route_string)
        );
        write_ref!(slot_ctx.dword1, slot_ctx.dword1.with_root_hub_port_id(root_port));
        write_ref!(
            slot_ctx.dword2,
            slot_ctx
                .dword2
                .with_parent_hub_slot_id(tt_hub_slot)
                .with_parent_port_id(tt_hub_port)
                // only interrupter 0 is used
                .with_interrupter_target(0)
        );

        self.configure_ep0_ctx(max_packet_size);
        debug!(
            XhciSlot,
            "built address input context for slot {} (port {root_port}, route {route_string:#x}, mps {max_packet_size})",
            self.slot_id
        );
    }

    fn configure_ep0_ctx(&mut self, max_packet_size: u16) {
        let dequeue = self.ep0_ring.physical_dequeue_pointer();
        let cycle = self.ep0_ring.curr_ring_cycle_bit();

        let endpoint_ctx = self.input_ep_ctx(XHCI_EP0_DCI);
        write_ref!(
            endpoint_ctx.dword0,
            endpoint_ctx
                .dword0
                .with_endpoint_state(DeviceEndpointState::Disabled)
                .with_interval(0)
        );
        write_ref!(
            endpoint_ctx.dword1,
            endpoint_ctx
                .dword1
                .with_err_cnt(3)
                .with_er_type(DeviceEndpointType::ControlBI)
                .with_max_packet_size(max_packet_size)
        );
        write_ref!(
            endpoint_ctx.qword2,
            EndpointDeviceCTXQword2::from_dequeue(dequeue, cycle)
        );
        write_ref!(endpoint_ctx.average_trb_length, 8);
    }

    /// Builds the input context for Evaluate Context after the real EP0
    /// max packet size is known.
    pub fn build_ep0_evaluate_ctx(&mut self, max_packet_size: u16) {
        let in_control_ctx = self.input_control_ctx();
        in_control_ctx.add_ctx_flags = 1 << 1;
        in_control_ctx.drop_flags = 0;
        self.configure_ep0_ctx(max_packet_size);
    }

    /// Builds the input context to add one non-EP0 endpoint: current slot
    /// context copied in, ContextEntries raised to cover the new DCI, the
    /// endpoint context pointing at its ring.
    pub fn build_add_endpoint_ctx(&mut self, endpoint: &USBEndpoint) {
        let dci = endpoint.dci();
        let speed = self.speed;
        let desc = *endpoint.desc();

        let current_slot = self.output_slot_ctx();

        let in_control_ctx = self.input_control_ctx();
        in_control_ctx.add_ctx_flags = (1 << 0) | (1u32 << dci);
        in_control_ctx.drop_flags = 0;

        let slot_ctx = self.input_slot_ctx();
        write_ref!(slot_ctx.dword0, current_slot.dword0);
        write_ref!(slot_ctx.dword1, current_slot.dword1);
        write_ref!(slot_ctx.dword2, current_slot.dword2);
        write_ref!(slot_ctx.dword3, current_slot.dword3);
        if dci > read_ref_dword0_entries(slot_ctx) {
            write_ref!(slot_ctx.dword0, slot_ctx.dword0.with_context_entries(dci));
        }

        let interval = endpoint_interval(speed, &desc);
        let max_packet = desc.max_packet_size();
        let dequeue;
        let cycle;
        {
            let ring = endpoint.transfer_ring().lock();
            dequeue = ring.physical_dequeue_pointer();
            cycle = ring.curr_ring_cycle_bit();
        }

        let endpoint_ctx = self.input_ep_ctx(dci);
        write_ref!(
            endpoint_ctx.dword0,
            endpoint_ctx
                .dword0
                .with_endpoint_state(DeviceEndpointState::Disabled)
                .with_interval(interval)
        );
        write_ref!(
            endpoint_ctx.dword1,
            endpoint_ctx
                .dword1
                .with_err_cnt(3)
                .with_er_type(desc.endpoint_type())
                .with_max_burst_size(0)
                .with_max_packet_size(max_packet)
        );
        write_ref!(
            endpoint_ctx.qword2,
            EndpointDeviceCTXQword2::from_dequeue(dequeue, cycle)
        );
        write_ref!(endpoint_ctx.average_trb_length, max_packet);
    }

    /// Marks this device as a hub in the slot context (Hub flag + port
    /// count) for a follow-up Configure Endpoint / Evaluate Context.
    pub fn build_hub_slot_ctx(&mut self, port_count: u8) {
        let current_slot = self.output_slot_ctx();

        let in_control_ctx = self.input_control_ctx();
        in_control_ctx.add_ctx_flags = 1 << 0;
        in_control_ctx.drop_flags = 0;

        let slot_ctx = self.input_slot_ctx();
        write_ref!(slot_ctx.dword0, current_slot.dword0.with_is_hub(true));
        write_ref!(
            slot_ctx.dword1,
            current_slot.dword1.with_number_of_ports(port_count)
        );
        write_ref!(slot_ctx.dword2, current_slot.dword2);
        write_ref!(slot_ctx.dword3, current_slot.dword3);
    }
}

fn read_ref_dword0_entries(slot_ctx: &XHCISlotDeviceCtx32) -> u8 {
    crate::read_ref!(slot_ctx.dword0).context_entries()
}

impl Drop for XhciSlot {
    fn drop(&mut self) {
        frame_allocator::deallocate_frame(self.input_frame);
        frame_allocator::deallocate_frame(self.output_frame);
    }
}

/// xHCI service interval for an endpoint, per port speed. HS and SS
/// express bInterval as 2^(n-1) microframes already; LS/FS interrupt
/// endpoints give it in 1 ms frames.
pub(super) fn endpoint_interval(speed: PortSpeed, desc: &UsbEndpointDescriptor) -> u8 {
    match desc.transfer_type() {
        ENDPOINT_TRANSFER_INTERRUPT | crate::drivers::xhci::usb::ENDPOINT_TRANSFER_ISOCH => {
            match speed {
                PortSpeed::High | PortSpeed::Super | PortSpeed::SuperPlus => {
                    (desc.b_interval.clamp(1, 16)) - 1
                }
                _ => {
                    let frames = desc.b_interval.max(1) as u32;
                    // 1 ms frame = 8 * 125 us units
                    let log = 31 - frames.leading_zeros() as u8;
                    (log + 3).min(10)
                }
            }
        }
        _ => 0,
    }
}

/// Which stages a control transfer needs: the setup TRT field and the
/// status-stage direction. No data stage means an IN status stage; with a
/// data stage the status direction is the opposite of the data direction.
pub(super) const fn control_stage_plan(length: u16, dir_in: bool) -> (u8, bool) {
    if length == 0 {
        (SETUP_TRT_NO_DATA, true)
    } else if dir_in {
        (SETUP_TRT_IN_DATA, false)
    } else {
        (SETUP_TRT_OUT_DATA, true)
    }
}

/// Issues one EP0 control transfer and waits for its status stage. A
/// stalled EP0 gets an automatic CLEAR_FEATURE(ENDPOINT_HALT) before the
/// error is surfaced.
pub fn control_transfer(
    controller: &XHCI,
    state: &mut UsbDeviceState,
    packet: XHCIDeviceRequestPacket,
    buffer: Option<PhysAddr>,
    dir_in: bool,
) -> Result<(), XhciError> {
    control_transfer_inner(controller, state, packet, buffer, dir_in, true)
}

fn control_transfer_inner(
    controller: &XHCI,
    state: &mut UsbDeviceState,
    packet: XHCIDeviceRequestPacket,
    buffer: Option<PhysAddr>,
    dir_in: bool,
    allow_stall_recovery: bool,
) -> Result<(), XhciError> {
    let length = packet.w_length();
    let slot_id = state.slot_id;
    let slot = state.slot.as_mut().ok_or(XhciError::NoDevice)?;

    let (trt, status_in) = control_stage_plan(length, dir_in);

    let status_phys;
    {
        let ring = slot.ep0_ring();

        let mut setup = SetupStageTRB::new(packet, 0);
        setup.info = setup.info.with_trt(trt);
        ring.enqueue(setup.into_trb());

        if length > 0 {
            let buffer = buffer.ok_or(XhciError::BadParameter)?;
            let data = DataStageTRB::new(buffer, length, dir_in, 0);
            ring.enqueue(data.into_trb());
        }

        let status = StatusStageTRB::new(status_in, 0);
        status_phys = ring.enqueue(status.into_trb());
    }

    controller.ring_endpoint_doorbell(slot_id, XHCI_EP0_DCI);

    let completion = controller.wait_for_transfer_completion(status_phys)?;
    if completion.is_transfer_success() {
        return Ok(());
    }

    if completion == CompletionStatusCode::StallErr && allow_stall_recovery {
        let clear_halt = XHCIDeviceRequestPacket::new()
            .with_recipient(PacketRecipient::Endpoint)
            .with_p_type(PacketType::Standard)
            .with_device_to_host(false)
            .with_b_request(REQUEST_CLEAR_FEATURE)
            .with_w_value(USB_FEATURE_ENDPOINT_HALT)
            .with_w_index(0)
            .with_w_length(0);
        let _ = control_transfer_inner(controller, state, clear_halt, None, false, false);
    }

    error!(XhciSlot, "control transfer completion code {completion:?}");
    Err(XhciError::TransferNotSuccessful(completion))
}

/// CLEAR_FEATURE(ENDPOINT_HALT) on an arbitrary endpoint.
pub fn clear_endpoint_halt(
    controller: &XHCI,
    state: &mut UsbDeviceState,
    endpoint_address: u8,
) -> Result<(), XhciError> {
    let packet = XHCIDeviceRequestPacket::new()
        .with_recipient(PacketRecipient::Endpoint)
        .with_p_type(PacketType::Standard)
        .with_device_to_host(false)
        .with_b_request(REQUEST_CLEAR_FEATURE)
        .with_w_value(USB_FEATURE_ENDPOINT_HALT)
        .with_w_index(endpoint_address as u16)
        .with_w_length(0);
    control_transfer(controller, state, packet, None, false)
}

/// Enable Slot: returns the slot id the controller picked.
pub fn enable_slot(controller: &XHCI) -> Result<u8, XhciError> {
    let trb = SlotCommandTRB::new(TRB_TYPE_ENABLE_SLOT_CMD, 0).into_trb();
    let response = controller.send_command(trb)?;
    if response.code != CompletionStatusCode::Success {
        return Err(XhciError::CommandNotSuccessful(response.code));
    }
    if response.slot_id == 0 {
        return Err(XhciError::CommandNotSuccessful(CompletionStatusCode::NoSlotsAvailable));
    }
    Ok(response.slot_id)
}

pub fn disable_slot(controller: &XHCI, slot_id: u8) -> Result<(), XhciError> {
    let trb = SlotCommandTRB::new(TRB_TYPE_DISABLE_SLOT_CMD, slot_id).into_trb();
    let response = controller.send_command(trb)?;
    if response.code != CompletionStatusCode::Success {
        return Err(XhciError::CommandNotSuccessful(response.code));
    }
    Ok(())
}

/// Address Device against the prepared input context.
pub fn address_device(controller: &XHCI, state: &mut UsbDeviceState) -> Result<(), XhciError> {
    let slot = state.slot.as_ref().ok_or(XhciError::NoDevice)?;
    let trb = AddressDeviceCommandTRB::new(slot.input_ctx_base(), false, slot.slot_id()).into_trb();
    let response = controller.send_command(trb)?;
    if response.code != CompletionStatusCode::Success {
        return Err(XhciError::CommandNotSuccessful(response.code));
    }
    Ok(())
}

pub fn evaluate_context(controller: &XHCI, state: &mut UsbDeviceState) -> Result<(), XhciError> {
    let slot = state.slot.as_ref().ok_or(XhciError::NoDevice)?;
    let trb = EvaluateContextCommandTRB::new(slot.input_ctx_base(), slot.slot_id()).into_trb();
    let response = controller.send_command(trb)?;
    if response.code != CompletionStatusCode::Success {
        return Err(XhciError::CommandNotSuccessful(response.code));
    }
    Ok(())
}

pub fn configure_endpoint(controller: &XHCI, state: &mut UsbDeviceState) -> Result<(), XhciError> {
    let slot = state.slot.as_ref().ok_or(XhciError::NoDevice)?;
    let trb = ConfigureEndpointCommandTRB::new(slot.input_ctx_base(), slot.slot_id()).into_trb();
    let response = controller.send_command(trb)?;
    if response.code != CompletionStatusCode::Success {
        return Err(XhciError::CommandNotSuccessful(response.code));
    }
    Ok(())
}

pub fn stop_endpoint(controller: &XHCI, slot_id: u8, dci: u8) -> Result<(), XhciError> {
    let trb = EndpointCommandTRB::new(TRB_TYPE_STOP_ENDPOINT_CMD, slot_id, dci).into_trb();
    let response = controller.send_command(trb)?;
    if response.code != CompletionStatusCode::Success {
        return Err(XhciError::CommandNotSuccessful(response.code));
    }
    Ok(())
}

pub fn reset_endpoint(controller: &XHCI, slot_id: u8, dci: u8) -> Result<(), XhciError> {
    let trb = EndpointCommandTRB::new(TRB_TYPE_RESET_ENDPOINT_CMD, slot_id, dci).into_trb();
    let response = controller.send_command(trb)?;
    if response.code != CompletionStatusCode::Success {
        return Err(XhciError::CommandNotSuccessful(response.code));
    }
    Ok(())
}

fn add_endpoint(
    controller: &XHCI,
    state: &mut UsbDeviceState,
    endpoint: &USBEndpoint,
) -> Result<(), XhciError> {
    let slot = state.slot.as_mut().ok_or(XhciError::NoDevice)?;
    slot.build_add_endpoint_ctx(endpoint);
    configure_endpoint(controller, state)
}

/// Installs an interrupt endpoint: Configure Endpoint with the endpoint's
/// ring wired into the input context.
pub fn add_interrupt_endpoint(
    controller: &XHCI,
    state: &mut UsbDeviceState,
    endpoint: &USBEndpoint,
) -> Result<(), XhciError> {
    if endpoint.desc().transfer_type() != ENDPOINT_TRANSFER_INTERRUPT {
        return Err(XhciError::BadParameter);
    }
    add_endpoint(controller, state, endpoint)
}

pub fn add_bulk_endpoint(
    controller: &XHCI,
    state: &mut UsbDeviceState,
    endpoint: &USBEndpoint,
) -> Result<(), XhciError> {
    if endpoint.desc().transfer_type() != ENDPOINT_TRANSFER_BULK {
        return Err(XhciError::BadParameter);
    }
    add_endpoint(controller, state, endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_stage_plan_rules() {
        // Length 0: no data stage, IN status stage.
        assert_eq!(control_stage_plan(0, false), (SETUP_TRT_NO_DATA, true));
        assert_eq!(control_stage_plan(0, true), (SETUP_TRT_NO_DATA, true));

        // IN data stage: OUT status stage.
        assert_eq!(control_stage_plan(18, true), (SETUP_TRT_IN_DATA, false));

        // OUT data stage: IN status stage.
        assert_eq!(control_stage_plan(31, false), (SETUP_TRT_OUT_DATA, true));
    }

    #[test]
    fn interval_per_speed() {
        let interrupt_ep = UsbEndpointDescriptor {
            b_endpoint_address: 0x81,
            bm_attributes: 0x03,
            w_max_packet_size: 8,
            b_interval: 10,
            ..Default::default()
        };

        // HS bInterval is already 2^(n-1) in microframes.
        assert_eq!(endpoint_interval(PortSpeed::High, &interrupt_ep), 9);

        // FS bInterval 10 frames -> 2^3 * 8 = 64 microframe units is the
        // nearest power of two at or below.
        assert_eq!(endpoint_interval(PortSpeed::Full, &interrupt_ep), 6);

        let bulk_ep = UsbEndpointDescriptor {
            b_endpoint_address: 0x82,
            bm_attributes: 0x02,
            w_max_packet_size: 512,
            ..Default::default()
        };
        assert_eq!(endpoint_interval(PortSpeed::High, &bulk_ep), 0);
    }
}
