//! Slot, endpoint, device and input context layouts (xHCI 6.2).
//!
//! Contexts come in 32- and 64-byte flavours depending on HCCPARAMS1.CSZ;
//! both are generated from the same generic structs with trailing padding.

use core::mem::offset_of;

use bitfield_struct::bitfield;

use crate::PhysAddr;

/// The first dword of the slot context: route string, speed, hub topology
/// bits and the index of the last valid endpoint context.
#[bitfield(u32)]
pub struct SlotDeviceCTXDword0 {
    /// Route String: 4 bits per hub hop, used to route packets through the
    /// tree (USB3 8.9).
    #[bits(20)]
    pub route_string: u32,
    /// Port-speed id, same encoding as PORTSC.PortSpeed.
    #[bits(4)]
    pub speed: u8,
    #[bits(1)]
    __: (),
    /// Multi-TT hub flag.
    pub mtt: bool,
    /// Set when this device is a hub.
    pub is_hub: bool,
    /// Index of the last valid endpoint context in this device context
    /// (1 = only EP0).
    #[bits(5)]
    pub context_entries: u8,
}

#[bitfield(u32)]
pub struct SlotDeviceCTXDword1 {
    pub max_exit_latency: u16,
    /// Root hub port this device hangs off, 1-based.
    pub root_hub_port_id: u8,
    /// Downstream port count when this device is a hub, else 0.
    pub number_of_ports: u8,
}

#[bitfield(u32)]
pub struct SlotDeviceCTXDword2 {
    /// TT hub slot id for LS/FS devices behind a high-speed hub.
    pub parent_hub_slot_id: u8,
    /// TT hub downstream port for LS/FS devices behind a high-speed hub.
    pub parent_port_id: u8,
    #[bits(2)]
    pub think_time: u8,
    #[bits(4)]
    __: (),
    #[bits(10)]
    pub interrupter_target: u16,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum DeviceSlotState {
    DisabledEnabled = 0,
    Default = 1,
    Addressed = 2,
    Configured = 3,
    Reserved(u8),
}

impl DeviceSlotState {
    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::DisabledEnabled,
            1 => Self::Default,
            2 => Self::Addressed,
            3 => Self::Configured,
            _ => Self::Reserved(bits),
        }
    }

    pub const fn into_bits(self) -> u8 {
        match self {
            Self::Reserved(bits) => bits,
            Self::DisabledEnabled => 0,
            Self::Default => 1,
            Self::Addressed => 2,
            Self::Configured => 3,
        }
    }
}

#[bitfield(u32)]
pub struct SlotDeviceCTXDword3 {
    /// Address the controller assigned on Address Device.
    pub usb_device_address: u8,
    #[bits(19)]
    __: (),
    #[bits(5)]
    pub slot_state: DeviceSlotState,
}

/// The Slot Context: device-wide state. As Input software fills it before
/// a command; as Output the controller keeps it current.
#[repr(C)]
pub struct XHCISlotDeviceCtx<const CTX_SZ_MINUS_16: usize> {
    pub dword0: SlotDeviceCTXDword0,
    pub dword1: SlotDeviceCTXDword1,
    pub dword2: SlotDeviceCTXDword2,
    pub dword3: SlotDeviceCTXDword3,
    __: [u8; CTX_SZ_MINUS_16],
}

pub type XHCISlotDeviceCtx64 = XHCISlotDeviceCtx<{ 64 - 16 }>;
pub type XHCISlotDeviceCtx32 = XHCISlotDeviceCtx<{ 32 - 16 }>;

const _: () = assert!(size_of::<XHCISlotDeviceCtx64>() == 64);
const _: () = assert!(size_of::<XHCISlotDeviceCtx32>() == 32);
const _: () = assert!(offset_of!(XHCISlotDeviceCtx64, dword3) == 0xC);
const _: () = assert!(offset_of!(XHCISlotDeviceCtx32, dword3) == 0xC);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceEndpointState {
    /// Not operational.
    Disabled = 0,
    /// Waiting for a doorbell or processing TDs.
    Running = 1,
    /// Halted on a USB halt condition; Reset Endpoint recovers.
    Halted = 2,
    /// Stopped by command or halt recovery; the ring may be manipulated.
    Stopped = 3,
    /// Stopped on a TRB error.
    Error = 4,
    Reserved = 5,
}

impl DeviceEndpointState {
    pub const fn from_bits(bits: u8) -> Self {
        if bits < Self::Reserved as u8 {
            unsafe { core::mem::transmute(bits) }
        } else {
            Self::Reserved
        }
    }

    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

#[bitfield(u32)]
pub struct EndpointDeviceCTXDword0 {
    #[bits(3)]
    pub endpoint_state: DeviceEndpointState,
    #[bits(5)]
    __: (),
    /// Max bursts per interval minus one; SS isochronous only.
    #[bits(2)]
    pub mult: u8,
    /// Non-zero switches the dequeue pointer to a stream context array;
    /// this driver never uses streams.
    #[bits(5)]
    pub max_primary_streams: u8,
    pub lsa: bool,
    /// Service interval in 125 us * 2^interval units.
    pub interval: u8,
    pub max_esit_payload_hi: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceEndpointType {
    NA = 0,
    IsochOut = 1,
    BulkOut = 2,
    IntOut = 3,
    ControlBI = 4,
    IsochIn = 5,
    BulkIn = 6,
    IntIn = 7,
}

impl DeviceEndpointType {
    pub const fn from_bits(bits: u8) -> Self {
        if bits <= Self::IntIn as u8 {
            unsafe { core::mem::transmute(bits) }
        } else {
            Self::NA
        }
    }

    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

#[bitfield(u32)]
pub struct EndpointDeviceCTXDword1 {
    #[bits(1)]
    __: (),
    /// Consecutive bus errors allowed while executing a TD before the
    /// endpoint halts.
    #[bits(2)]
    pub err_cnt: u8,
    #[bits(3)]
    pub er_type: DeviceEndpointType,
    #[bits(1)]
    __: (),
    pub host_initiate_disable: bool,
    pub max_burst_size: u8,
    /// Max packet size; the field is 16 bits wide but the USB-legal range
    /// fits in 11.
    pub max_packet_size: u16,
}

#[bitfield(u64)]
pub struct EndpointDeviceCTXQword2 {
    /// Dequeue Cycle State: consumer cycle for the TRB the dequeue pointer
    /// references.
    #[bits(1)]
    pub dequeue_cycle_state: u8,
    #[bits(3)]
    __: (),
    /// TR Dequeue Pointer bits 63:4; the ring is 16-byte aligned.
    #[bits(60)]
    pub trb_dequeue_ptr: u64,
}

impl EndpointDeviceCTXQword2 {
    pub fn from_dequeue(dequeue_ptr: PhysAddr, cycle_state: u8) -> Self {
        Self::from_bits(dequeue_ptr.into_raw() as u64 | (cycle_state as u64 & 1))
    }
}

/// The Endpoint Context (xHCI 6.2.3).
#[repr(C)]
pub struct XHCIEndpointDeviceCtx<const CTX_SZ_MINUS_20: usize> {
    pub dword0: EndpointDeviceCTXDword0,
    pub dword1: EndpointDeviceCTXDword1,
    pub qword2: EndpointDeviceCTXQword2,
    /// Average TRB length executed on this endpoint, used by the
    /// controller for bandwidth math.
    pub average_trb_length: u16,
    pub max_esit_payload_low: u16,
    __: [u8; CTX_SZ_MINUS_20],
}

pub type XHCIEndpointDeviceCtx64 = XHCIEndpointDeviceCtx<{ 64 - 20 }>;
pub type XHCIEndpointDeviceCtx32 = XHCIEndpointDeviceCtx<{ 32 - 20 }>;

const _: () = assert!(size_of::<XHCIEndpointDeviceCtx64>() == 64);
const _: () = assert!(size_of::<XHCIEndpointDeviceCtx32>() == 32);
const _: () = assert!(offset_of!(XHCIEndpointDeviceCtx64, qword2) == 0x8);
const _: () = assert!(offset_of!(XHCIEndpointDeviceCtx32, qword2) == 0x8);

/// The Device Context: slot context, EP0 context, then up to 30 endpoint
/// contexts indexed by DCI - 1.
#[repr(C)]
pub struct XHCIDeviceCtx<const CTX_SZ_MINUS_16: usize, const CTX_SZ_MINUS_20: usize> {
    pub slot_context: XHCISlotDeviceCtx<CTX_SZ_MINUS_16>,
    /// Primary control endpoint (DCI 1)
    pub control_ep_context: XHCIEndpointDeviceCtx<CTX_SZ_MINUS_20>,
    /// Remaining endpoints (DCI 2..=31)
    pub ep: [XHCIEndpointDeviceCtx<CTX_SZ_MINUS_20>; 30],
}

pub type XHCIDeviceCtx64 = XHCIDeviceCtx<{ 64 - 16 }, { 64 - 20 }>;
pub type XHCIDeviceCtx32 = XHCIDeviceCtx<{ 32 - 16 }, { 32 - 20 }>;

const _: () = assert!(size_of::<XHCIDeviceCtx64>() == 2048);
const _: () = assert!(size_of::<XHCIDeviceCtx32>() == 1024);

/// The Input Control Context: which contexts the next command consumes
/// (add) or releases (drop).
#[repr(C)]
pub struct XHCIInputControlCtx<const CTX_SZ_MINUS_32: usize> {
    pub drop_flags: u32,
    pub add_ctx_flags: u32,
    __: [u32; 5],
    pub config_value: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    __rsdvz: u8,
    __pad: [u8; CTX_SZ_MINUS_32],
}

pub type XHCIInputControlCtx64 = XHCIInputControlCtx<{ 64 - 32 }>;
pub type XHCIInputControlCtx32 = XHCIInputControlCtx<0>;

const _: () = assert!(size_of::<XHCIInputControlCtx64>() == 64);
const _: () = assert!(size_of::<XHCIInputControlCtx32>() == 32);

/// The Input Context handed to Address Device / Configure Endpoint /
/// Evaluate Context: an input control context followed by a full device
/// context.
#[repr(C)]
pub struct XHCIInputCtx<
    const ICC_PAD: usize,
    const CTX_SZ_MINUS_16: usize,
    const CTX_SZ_MINUS_20: usize,
> {
    pub input_control_context: XHCIInputControlCtx<ICC_PAD>,
    pub device_context: XHCIDeviceCtx<CTX_SZ_MINUS_16, CTX_SZ_MINUS_20>,
}

pub type XHCIInputCtx64 = XHCIInputCtx<{ 64 - 32 }, { 64 - 16 }, { 64 - 20 }>;
pub type XHCIInputCtx32 = XHCIInputCtx<0, { 32 - 16 }, { 32 - 20 }>;

const _: () = assert!(size_of::<XHCIInputCtx64>() == 64 + 2048);
const _: () = assert!(size_of::<XHCIInputCtx32>() == 32 + 1024);
