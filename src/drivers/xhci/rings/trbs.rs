//! TRB layouts: 16 bytes, four dwords, type in bits 10..15 of the last
//! dword. Command and transfer variants are separate structs that
//! transmute into the generic [`TRB`] for ring enqueue; event variants
//! transmute out of it on dequeue.

use bitfield_struct::bitfield;

use crate::PhysAddr;

pub const TRB_TYPE_NORMAL: u8 = 0x1;
pub const TRB_TYPE_SETUP_STAGE: u8 = 0x2;
pub const TRB_TYPE_DATA_STAGE: u8 = 0x3;
pub const TRB_TYPE_STATUS_STAGE: u8 = 0x4;
pub const TRB_TYPE_LINK: u8 = 0x6;

pub const TRB_TYPE_ENABLE_SLOT_CMD: u8 = 0x9;
pub const TRB_TYPE_DISABLE_SLOT_CMD: u8 = 0xA;
pub const TRB_TYPE_ADDRESS_DEVICE_CMD: u8 = 0xB;
pub const TRB_TYPE_CONFIGURE_ENDPOINT_CMD: u8 = 0xC;
pub const TRB_TYPE_EVALUATE_CONTEXT_CMD: u8 = 0xD;
pub const TRB_TYPE_RESET_ENDPOINT_CMD: u8 = 0xE;
pub const TRB_TYPE_STOP_ENDPOINT_CMD: u8 = 0xF;

pub const TRB_TYPE_TRANSFER_EVENT: u8 = 0x20;
pub const TRB_TYPE_CMD_COMPLETION: u8 = 0x21;
pub const TRB_TYPE_PORT_STATUS_CHANGE_EVENT: u8 = 0x22;

#[bitfield(u32)]
pub struct TRBCommand {
    #[bits(1)]
    pub cycle_bit: u8,
    #[bits(1)]
    pub toggle_cycle: bool,
    __: u8,
    #[bits(6)]
    pub trb_type: u8,
    __: u16,
}

#[derive(Debug, Clone)]
#[repr(C)]
pub struct TRB {
    pub parameter: u64,
    pub status: u32,
    pub cmd: TRBCommand,
}

impl TRB {
    pub fn new(cmd: TRBCommand, status: u32, parameter: u64) -> Self {
        Self {
            parameter,
            status,
            cmd,
        }
    }

    /// A link TRB pointing back to `phys_base_addr` with the toggle-cycle
    /// bit set, which is what makes the producer cycle flip on wrap.
    pub fn new_link(phys_base_addr: PhysAddr, cycle_bit: u8) -> Self {
        assert!(cycle_bit == 0 || cycle_bit == 1);
        let mut link_trb: Self = unsafe { core::mem::zeroed() };
        link_trb.parameter = phys_base_addr.into_raw() as u64;
        link_trb.cmd.set_trb_type(TRB_TYPE_LINK);
        link_trb.cmd.set_toggle_cycle(true);
        link_trb.cmd.set_cycle_bit(cycle_bit);
        link_trb
    }

    /// Attempts to convert self into a known event TRB, None if the type
    /// is not one the driver consumes.
    pub fn into_event_trb(self) -> Option<EventResponseTRB> {
        macro_rules! decided {
            ($variant: ident) => {
                Some(EventResponseTRB::$variant(unsafe {
                    core::mem::transmute(self)
                }))
            };
        }
        match self.cmd.trb_type() {
            TRB_TYPE_CMD_COMPLETION => decided!(CommandCompletion),
            TRB_TYPE_TRANSFER_EVENT => decided!(TransferResponse),
            TRB_TYPE_PORT_STATUS_CHANGE_EVENT => decided!(PortStatusChange),
            _ => None,
        }
    }
}

// size is hard to tell with the bitfields involved
const _: () = assert!(size_of::<TRB>() == 16);

pub enum EventResponseTRB {
    CommandCompletion(CmdResponseTRB),
    TransferResponse(TransferResponseTRB),
    PortStatusChange(PortStatusChangeTRB),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompletionStatusCode {
    Invalid = 0,
    Success = 1,
    DataBufferErr = 2,
    BabbleDetectedErr = 3,
    UsbTransactionErr = 4,
    TrbErr = 5,
    StallErr = 6,
    ResourceErr = 7,
    BandwidthErr = 8,
    NoSlotsAvailable = 9,
    InvalidStreamType = 0xA,
    SlotNotEnabled = 0xB,
    EndpointNotEnabled = 0xC,
    ShortPacket = 0xD,
    RingUnderrun = 0xE,
    RingOverrun = 0xF,
    VFEventRingFull = 0x10,
    ParameterErr = 0x11,
    BandwidthOverrun = 0x12,
    ContextStateErr = 0x13,
    NoPingResponse = 0x14,
    EventRingFull = 0x15,
    IncompatibleDevice = 0x16,
    MissedService = 0x17,
    CommandRingStopped = 0x18,
    CommandAborted = 0x19,
    Stopped = 0x1A,
    StoppedLengthInvalid = 0x1B,
    StoppedShortPacket = 0x1C,
    MaxExitLatencyErr = 0x1D,
    Other,
}

impl CompletionStatusCode {
    pub const fn from_bits(bits: u8) -> Self {
        if bits >= Self::Other as u8 {
            Self::Other
        } else {
            unsafe { core::mem::transmute(bits) }
        }
    }

    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    /// Short packets retire the TD without error, so both count as a
    /// successful transfer.
    pub const fn is_transfer_success(self) -> bool {
        matches!(self, Self::Success | Self::ShortPacket)
    }
}

#[bitfield(u32)]
pub struct CmdCompletionStatus {
    #[bits(24)]
    __: (),
    #[bits(8)]
    pub code: CompletionStatusCode,
}

#[bitfield(u32)]
pub struct CmdComplInfo {
    #[bits(1)]
    pub cycle_bit: u8,
    #[bits(9)]
    __: (),
    #[bits(6)]
    pub trb_type: u8,
    pub vfid: u8,
    pub slot_id: u8,
}

/// Command Completion event TRB
#[derive(Debug, Clone)]
#[repr(C)]
pub struct CmdResponseTRB {
    pub trb_pointer: u64,
    pub status: CmdCompletionStatus,
    pub cmd: CmdComplInfo,
}

#[bitfield(u32)]
pub struct TransferResponseInfo {
    #[bits(1)]
    pub cycle_bit: u8,
    #[bits(1)]
    __: (),
    pub event_data: bool,
    #[bits(7)]
    __: (),
    #[bits(6)]
    pub trb_type: u8,
    #[bits(5)]
    pub endpoint_id: u8,
    #[bits(3)]
    __: (),
    pub slot_id: u8,
}

#[bitfield(u32)]
pub struct TransferResponseStatus {
    #[bits(24)]
    pub transfer_length: u32,
    #[bits(8)]
    pub completion_code: CompletionStatusCode,
}

#[derive(Debug)]
#[repr(C)]
pub struct TransferResponseTRB {
    pub trb_ptr: u64,
    pub status: TransferResponseStatus,
    pub cmd: TransferResponseInfo,
}

#[bitfield(u64)]
pub struct PortStatusChangePar {
    #[bits(24)]
    __: (),
    pub port_id: u8,
    __: u32,
}

impl PortStatusChangePar {
    /// Returns the port_id - 1
    pub fn port_index(&self) -> u8 {
        self.port_id() - 1
    }
}

#[bitfield(u32)]
pub struct PortStatusChangeStatus {
    #[bits(24)]
    __: (),
    #[bits(8)]
    pub completion_code: CompletionStatusCode,
}

#[bitfield(u32)]
pub struct PortStatusChangeInfo {
    #[bits(1)]
    pub cycle_bit: u8,
    #[bits(9)]
    __: (),
    #[bits(6)]
    pub trb_type: u8,
    __: u16,
}

#[derive(Debug)]
#[repr(C)]
pub struct PortStatusChangeTRB {
    pub parameter: PortStatusChangePar,
    pub status: PortStatusChangeStatus,
    pub cmd: PortStatusChangeInfo,
}

#[bitfield(u32)]
pub struct AddressDeviceCommandInfo {
    #[bits(1)]
    pub cycle_bit: u8,
    __: u8,
    /// Block Set Address Request. When clear the command generates a USB
    /// SET_ADDRESS request on the wire.
    pub bsr: bool,
    #[bits(6)]
    pub trb_type: u8,
    __: u8,
    pub slot_id: u8,
}

#[derive(Debug)]
#[repr(C)]
pub struct AddressDeviceCommandTRB {
    pub input_context_physical_address: u64,
    __: u32,
    pub info: AddressDeviceCommandInfo,
}

impl AddressDeviceCommandTRB {
    pub fn new(input_context_physical_address: PhysAddr, bsr: bool, slot_id: u8) -> Self {
        Self {
            input_context_physical_address: input_context_physical_address.into_raw() as u64,
            __: 0,
            info: AddressDeviceCommandInfo::new()
                .with_bsr(bsr)
                .with_slot_id(slot_id)
                .with_trb_type(TRB_TYPE_ADDRESS_DEVICE_CMD),
        }
    }

    pub fn into_trb(self) -> TRB {
        unsafe { core::mem::transmute(self) }
    }
}

#[bitfield(u32)]
struct ConfigureEndpointCommandInfo {
    #[bits(1)]
    cycle_bit: u8,
    __: u8,
    deconfigure: bool,
    #[bits(6)]
    trb_type: u8,
    __: u8,
    slot_id: u8,
}

#[derive(Debug)]
#[repr(C)]
pub struct ConfigureEndpointCommandTRB {
    input_ctx_base: u64,
    __rsdvz: u32,
    cmd: ConfigureEndpointCommandInfo,
}

impl ConfigureEndpointCommandTRB {
    pub fn new(input_ctx_base: PhysAddr, slot_id: u8) -> Self {
        Self {
            input_ctx_base: input_ctx_base.into_raw() as u64,
            __rsdvz: 0,
            cmd: ConfigureEndpointCommandInfo::new()
                .with_deconfigure(false)
                .with_trb_type(TRB_TYPE_CONFIGURE_ENDPOINT_CMD)
                .with_slot_id(slot_id),
        }
    }

    pub fn into_trb(self) -> TRB {
        unsafe { core::mem::transmute(self) }
    }
}

#[bitfield(u32)]
struct EvaluateContextInfo {
    #[bits(1)]
    cycle_bit: u8,
    #[bits(9)]
    __: (),
    #[bits(6)]
    trb_type: u8,
    __: u8,
    slot_id: u8,
}

#[repr(C)]
pub struct EvaluateContextCommandTRB {
    input_ctx_phys_base: u64,
    __: u32,
    cmd: EvaluateContextInfo,
}

impl EvaluateContextCommandTRB {
    pub fn new(input_ctx_phys_base: PhysAddr, slot_id: u8) -> Self {
        Self {
            input_ctx_phys_base: input_ctx_phys_base.into_raw() as u64,
            __: 0,
            cmd: EvaluateContextInfo::new()
                .with_slot_id(slot_id)
                .with_trb_type(TRB_TYPE_EVALUATE_CONTEXT_CMD),
        }
    }

    pub fn into_trb(self) -> TRB {
        unsafe { core::mem::transmute(self) }
    }
}

#[bitfield(u32)]
struct SlotCommandInfo {
    #[bits(1)]
    cycle_bit: u8,
    #[bits(9)]
    __: (),
    #[bits(6)]
    trb_type: u8,
    __: u8,
    slot_id: u8,
}

/// Slot-scoped command with no parameter: Enable Slot (slot id 0) and
/// Disable Slot.
#[repr(C)]
pub struct SlotCommandTRB {
    __: u64,
    __rsdvz: u32,
    cmd: SlotCommandInfo,
}

impl SlotCommandTRB {
    pub fn new(trb_type: u8, slot_id: u8) -> Self {
        Self {
            __: 0,
            __rsdvz: 0,
            cmd: SlotCommandInfo::new()
                .with_trb_type(trb_type)
                .with_slot_id(slot_id),
        }
    }

    pub fn into_trb(self) -> TRB {
        unsafe { core::mem::transmute(self) }
    }
}

#[bitfield(u32)]
struct EndpointCommandInfo {
    #[bits(1)]
    cycle_bit: u8,
    #[bits(9)]
    __: (),
    #[bits(6)]
    trb_type: u8,
    #[bits(5)]
    endpoint_id: u8,
    #[bits(3)]
    __: (),
    slot_id: u8,
}

/// Stop Endpoint / Reset Endpoint share the same shape: no parameter,
/// endpoint DCI + slot id in the control dword.
#[repr(C)]
pub struct EndpointCommandTRB {
    __: u64,
    __rsdvz: u32,
    cmd: EndpointCommandInfo,
}

impl EndpointCommandTRB {
    pub fn new(trb_type: u8, slot_id: u8, dci: u8) -> Self {
        Self {
            __: 0,
            __rsdvz: 0,
            cmd: EndpointCommandInfo::new()
                .with_trb_type(trb_type)
                .with_endpoint_id(dci)
                .with_slot_id(slot_id),
        }
    }

    pub fn into_trb(self) -> TRB {
        unsafe { core::mem::transmute(self) }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum PacketRecipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
    Reserved = 4,
}

impl PacketRecipient {
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    pub const fn from_bits(bits: u8) -> Self {
        if bits < Self::Reserved as u8 {
            unsafe { core::mem::transmute(bits) }
        } else {
            Self::Reserved
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum PacketType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

impl PacketType {
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    pub const fn from_bits(bits: u8) -> Self {
        if bits < Self::Reserved as u8 {
            unsafe { core::mem::transmute(bits) }
        } else {
            Self::Reserved
        }
    }
}

/// The SETUP data carried immediately in a Setup Stage TRB's parameter
/// component (xHCI 4.11.2.2).
#[bitfield(u64)]
pub struct XHCIDeviceRequestPacket {
    #[bits(5)]
    pub recipient: PacketRecipient,
    #[bits(2)]
    pub p_type: PacketType,
    pub device_to_host: bool,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

#[bitfield(u32)]
pub struct SetupStageStatus {
    #[bits(17)]
    pub trb_transfer_length: u32,
    #[bits(5)]
    __: (),
    #[bits(10)]
    pub interrupter: u16,
}

/// Transfer Type field of a Setup Stage TRB.
pub const SETUP_TRT_NO_DATA: u8 = 0;
pub const SETUP_TRT_OUT_DATA: u8 = 2;
pub const SETUP_TRT_IN_DATA: u8 = 3;

#[bitfield(u32)]
pub struct SetupStageInfo {
    #[bits(1)]
    pub cycle_bit: u8,
    #[bits(4)]
    __: (),
    /// Interrupt On Completion.
    pub ioc: bool,
    /// Immediate Data; always set in a Setup Stage TRB, the parameter IS
    /// the setup packet.
    pub idt: bool,
    #[bits(3)]
    __: (),
    #[bits(6)]
    pub trb_type: u8,
    /// Transfer Type: 0 no data stage, 2 OUT data stage, 3 IN data stage.
    #[bits(2)]
    pub trt: u8,
    #[bits(14)]
    __: (),
}

#[repr(C)]
pub struct SetupStageTRB {
    pub parameter: XHCIDeviceRequestPacket,
    pub status: SetupStageStatus,
    pub info: SetupStageInfo,
}

impl SetupStageTRB {
    pub fn new(packet: XHCIDeviceRequestPacket, interrupter: u16) -> Self {
        Self {
            parameter: packet,
            status: SetupStageStatus::new()
                .with_trb_transfer_length(8)
                .with_interrupter(interrupter),
            info: SetupStageInfo::new()
                .with_idt(true)
                .with_trb_type(TRB_TYPE_SETUP_STAGE),
        }
    }

    pub fn into_trb(self) -> TRB {
        unsafe { core::mem::transmute(self) }
    }
}

#[bitfield(u32)]
pub struct DataStagePar {
    /// For OUT the byte count to send, for IN the size of the receive
    /// buffer.
    #[bits(17)]
    pub trb_transfer_len: u32,
    #[bits(5)]
    pub td_size: u8,
    #[bits(10)]
    pub interrupter_target: u16,
}

#[bitfield(u32)]
pub struct DataStageCMD {
    #[bits(1)]
    pub cycle_bit: u8,
    /// Evaluate Next TRB.
    pub ent: bool,
    /// Interrupt-on Short Packet.
    pub isp: bool,
    pub no_snoop: bool,
    /// Chain: ties this TRB to the next one of the same TD.
    pub chain: bool,
    pub ioc: bool,
    pub idt: bool,
    #[bits(3)]
    __: (),
    #[bits(6)]
    pub trb_type: u8,
    /// Direction: set = IN (read), clear = OUT (write).
    pub dir_in: bool,
    #[bits(15)]
    __: (),
}

#[repr(C)]
pub struct DataStageTRB {
    pub data_buffer_base: u64,
    pub parameter: DataStagePar,
    pub cmd: DataStageCMD,
}

impl DataStageTRB {
    pub fn new(data_buffer_base: PhysAddr, length: u16, dir_in: bool, interrupter: u16) -> Self {
        Self {
            data_buffer_base: data_buffer_base.into_raw() as u64,
            parameter: DataStagePar::new()
                .with_trb_transfer_len(length as u32)
                .with_interrupter_target(interrupter),
            cmd: DataStageCMD::new()
                .with_trb_type(TRB_TYPE_DATA_STAGE)
                .with_dir_in(dir_in),
        }
    }

    pub fn into_trb(self) -> TRB {
        unsafe { core::mem::transmute(self) }
    }
}

#[bitfield(u32)]
pub struct StatusStageTRBStatus {
    #[bits(22)]
    __: (),
    #[bits(10)]
    pub interrupter_target: u16,
}

#[bitfield(u32)]
pub struct StatusStageTRBCmd {
    #[bits(1)]
    pub cycle_bit: u8,
    pub ent: bool,
    #[bits(2)]
    __: (),
    pub chain: bool,
    pub ioc: bool,
    #[bits(4)]
    __: (),
    #[bits(6)]
    pub trb_type: u8,
    /// Status stage direction, opposite of the data stage (IN when there
    /// was no data stage).
    pub dir_in: bool,
    #[bits(15)]
    __: u16,
}

#[repr(C)]
pub struct StatusStageTRB {
    __rsdv: u64,
    pub status: StatusStageTRBStatus,
    pub cmd: StatusStageTRBCmd,
}

impl StatusStageTRB {
    pub fn new(dir_in: bool, interrupter_target: u16) -> Self {
        Self {
            __rsdv: 0,
            status: StatusStageTRBStatus::new().with_interrupter_target(interrupter_target),
            cmd: StatusStageTRBCmd::new()
                .with_trb_type(TRB_TYPE_STATUS_STAGE)
                .with_dir_in(dir_in)
                .with_ioc(true),
        }
    }

    pub fn into_trb(self) -> TRB {
        unsafe { core::mem::transmute(self) }
    }
}

#[bitfield(u32)]
pub struct NormalTRBStatus {
    #[bits(17)]
    pub trb_transfer_length: u32,
    #[bits(5)]
    pub td_size: u8,
    #[bits(10)]
    pub interrupter_target: u16,
}

#[bitfield(u32)]
pub struct NormalTRBCMD {
    #[bits(1)]
    pub cycle_bit: u8,
    pub ent: bool,
    pub isp: bool,
    pub no_snoop: bool,
    pub chain: bool,
    pub ioc: bool,
    pub idt: bool,
    #[bits(3)]
    __: (),
    #[bits(6)]
    pub trb_type: u8,
    pub dir_in: bool,
    #[bits(15)]
    __: (),
}

#[repr(C)]
pub struct NormalTRB {
    data_buffer_base: u64,
    pub status: NormalTRBStatus,
    pub cmd: NormalTRBCMD,
}

impl NormalTRB {
    pub fn new(data_base_addr: PhysAddr, trb_transfer_length: u32, interrupter: u16) -> Self {
        Self {
            data_buffer_base: data_base_addr.into_raw() as u64,
            status: NormalTRBStatus::new()
                .with_interrupter_target(interrupter)
                .with_trb_transfer_length(trb_transfer_length),
            cmd: NormalTRBCMD::new().with_trb_type(TRB_TYPE_NORMAL),
        }
    }

    pub fn into_trb(self) -> TRB {
        unsafe { core::mem::transmute(self) }
    }
}
