//! xHCI register banks: capability, operational, runtime, doorbells, and
//! the owning [`XHCIRegisters`] wrapper that performs controller reset and
//! bring-up (DCBAA, scratchpads, CRCR, interrupter 0).

use core::fmt::Display;

use bitfield_struct::bitfield;
use bitflags::bitflags;

use crate::drivers::xhci::contexts::XHCIDeviceCtx32;
use crate::drivers::xhci::rings::{command::XHCICommandRing, event::XHCIEventRing};
use crate::drivers::xhci::utils::{XhciError, allocate_buffers_frame};
use crate::memory::frame_allocator::{self, Frame};
use crate::memory::{PAGE_SIZE, PhysAddr, VirtAddr};
use crate::utils::threshold_latch::ThresholdLatch;
use crate::{debug, platform, read_ref, time, warn, write_ref};

/// Iteration bound for register waits; guarantees forward progress even if
/// the clock is broken.
const MAX_WAIT_ITERATIONS: u32 = 1_000_000;

/// A register wait that takes longer than this is reported once.
const WAIT_WARN_THRESHOLD_MS: u64 = 200;

pub const RESET_TIMEOUT_MS: u64 = 1000;
pub const HALT_TIMEOUT_MS: u64 = 200;
pub const RUN_TIMEOUT_MS: u64 = 1000;
pub const PORT_RESET_TIMEOUT_MS: u64 = 50;

/// Waits until `cond` holds, bounded by both wall clock and an iteration
/// count, warning through a threshold latch when the wait turns slow.
pub(super) fn wait_for_condition(
    name: &'static str,
    timeout_ms: u64,
    mut cond: impl FnMut() -> bool,
) -> bool {
    let mut latch = ThresholdLatch::new(name, WAIT_WARN_THRESHOLD_MS, time!());
    let deadline = time!() + timeout_ms;

    for _ in 0..MAX_WAIT_ITERATIONS {
        if cond() {
            return true;
        }

        let now = time!();
        if latch.check(now) {
            warn!("xHCI wait '{name}' exceeded {WAIT_WARN_THRESHOLD_MS}ms, still waiting");
        }
        if now >= deadline {
            return false;
        }

        platform::thread_yield();
    }

    false
}

#[repr(C)]
pub struct CapsReg {
    reg_length: u8,
    _reserved0: u8,
    version_number: u16,
    hcsparams_1: u32,
    hcsparams_2: u32,
    hcsparams_3: u32,
    hccparams_1: u32,
    doorbell_off: u32,
    runtime_off: u32,
    hccparams_2: u32,
}

impl CapsReg {
    pub fn operational_regs_ptr(&self) -> *mut OperationalRegs {
        let caps_ptr = self as *const _ as *const u8;
        unsafe { caps_ptr.add(self.reg_length as usize) as *mut OperationalRegs }
    }

    pub fn runtime_regs_ptr(&self) -> *mut RuntimeRegs {
        let caps_ptr = self as *const _ as *const u8;
        unsafe { caps_ptr.add((self.runtime_off & !0x1F) as usize) as *mut RuntimeRegs }
    }

    pub fn doorbells_base(&self) -> VirtAddr {
        let caps_ptr = self as *const _ as *const u8;
        unsafe { VirtAddr::from_ptr(caps_ptr.add((self.doorbell_off & !0x3) as usize)) }
    }

    pub const fn hci_version(&self) -> u16 {
        self.version_number
    }

    pub const fn max_device_slots(&self) -> usize {
        (self.hcsparams_1 & 0xFF) as usize
    }

    pub const fn max_interrupters(&self) -> u16 {
        ((self.hcsparams_1 >> 8) & 0x7FF) as u16
    }

    pub const fn max_ports(&self) -> u8 {
        (self.hcsparams_1 >> 24) as u8
    }

    pub const fn interrupt_schd_t(&self) -> u8 {
        (self.hcsparams_2 as u8) & 0xF
    }

    pub const fn erst_max(&self) -> u8 {
        ((self.hcsparams_2 >> 4) as u8) & 0xF
    }

    /// Scratchpad page count, split into hi [25:21] and lo [31:27] fields.
    pub const fn max_scratchpad_buffers(&self) -> usize {
        let hi = ((self.hcsparams_2 >> 21) & 0x1F) as usize;
        let lo = ((self.hcsparams_2 >> 27) & 0x1F) as usize;
        (hi << 5) | lo
    }

    pub const fn addressing_64bits(&self) -> bool {
        (self.hccparams_1 & 0x1) != 0
    }

    pub const fn context_sz_64bytes(&self) -> bool {
        ((self.hccparams_1 >> 2) & 0x1) != 0
    }

    pub const fn port_power_ctrl(&self) -> bool {
        ((self.hccparams_1 >> 3) & 0x1) != 0
    }
}

impl Display for CapsReg {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "xHCI Capability Registers @{:?}:", VirtAddr::from_ptr(self as *const _))?;
        writeln!(f, "\tLength             : {:#x}", self.reg_length)?;
        writeln!(f, "\tHCI Version        : {:#x}", self.hci_version())?;
        writeln!(f, "\tMax Device Slots   : {}", self.max_device_slots())?;
        writeln!(f, "\tMax Interrupters   : {}", self.max_interrupters())?;
        writeln!(f, "\tMax Ports          : {}", self.max_ports())?;
        writeln!(f, "\tIST                : {}", self.interrupt_schd_t())?;
        writeln!(f, "\tERST Max Size      : {}", self.erst_max())?;
        writeln!(f, "\tScratchpad Buffers : {}", self.max_scratchpad_buffers())?;
        writeln!(f, "\t64-bit Addressing  : {}", self.addressing_64bits())?;
        writeln!(f, "\t64-byte Contexts   : {}", self.context_sz_64bytes())?;
        write!(f,   "\tPort Power Control : {}", self.port_power_ctrl())
    }
}

bitflags! {
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct USBCmd: u32 {
        /// Run/Stop. The controller halts within 16 ms of clearing it.
        const RUN = 1 << 0;
        /// Host Controller Reset; cleared by hardware once the reset
        /// completes. Only legal while HCHalted is set.
        const HCRESET = 1 << 1;
        /// Interrupter Enable: master gate for interrupter interrupts.
        const INTERRUPT_ENABLE = 1 << 2;
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct USBSts: u32 {
        /// HCHalted: set once the controller has stopped after RUN was
        /// cleared (or after an internal error).
        const HCHALTED = 1 << 0;
        /// Host System Error: the controller hit a fatal bus error and
        /// needs a reset.
        const HSERROR = 1 << 2;
        /// Event Interrupt, RW1C. Set when any interrupter's IP goes
        /// pending; clear before clearing IP.
        const EINT = 1 << 3;
        /// Port Change Detect.
        const PORT_CHANGE = 1 << 4;
        /// Controller Not Ready: no doorbell/op-register writes until it
        /// clears after reset.
        const NOT_READY = 1 << 11;
        /// Host Controller Error (internal).
        const HCERROR = 1 << 12;
    }
}

#[repr(C)]
pub struct OperationalRegs {
    pub usbcmd: USBCmd,
    pub usbstatus: USBSts,
    pub page_size: u32,
    _reserved0: [u32; 2],
    pub dnctrl: u32,
    pub crcr: u64,
    _reserved1: [u32; 4],
    pub dcbaap: u64,
    pub config: u32,
    _reserved2: [u32; 49],
}

impl Display for OperationalRegs {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "xHCI Operational Registers @{:?}:", VirtAddr::from_ptr(self as *const _))?;
        writeln!(f, "\tusbcmd    : {:?}", read_ref!(self.usbcmd))?;
        writeln!(f, "\tusbstatus : {:?}", read_ref!(self.usbstatus))?;
        writeln!(f, "\tPage Size : {:#x}", read_ref!(self.page_size))?;
        writeln!(f, "\tdnctrl    : {:#x}", read_ref!(self.dnctrl))?;
        writeln!(f, "\tcrcr      : {:#x}", read_ref!(self.crcr))?;
        writeln!(f, "\tdcbaap    : {:#x}", read_ref!(self.dcbaap))?;
        write!(f,   "\tconfig    : {:#x}", read_ref!(self.config))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PortSpeed {
    Undefined = 0,
    /// 12 Mb/s USB 2.0
    Full = 1,
    /// 1.5 Mb/s USB 2.0
    Low = 2,
    /// 480 Mb/s USB 2.0
    High = 3,
    /// 5 Gb/s USB 3.0
    Super = 4,
    /// 10 Gb/s USB 3.1
    SuperPlus = 5,
}

impl Default for PortSpeed {
    fn default() -> Self {
        Self::Undefined
    }
}

impl PortSpeed {
    pub const fn from_bits(bits: u8) -> Self {
        if bits > Self::SuperPlus as u8 {
            Self::Undefined
        } else {
            unsafe { core::mem::transmute(bits) }
        }
    }

    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    /// Initial EP0 max packet size before the device descriptor has been
    /// read.
    pub const fn default_max_packet_size0(&self) -> u16 {
        match self {
            Self::Low => 8,
            Self::Full | Self::High => 64,
            Self::Super | Self::SuperPlus => 512,
            Self::Undefined => 8,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Full => "full-speed",
            Self::Low => "low-speed",
            Self::High => "high-speed",
            Self::Super => "super-speed",
            Self::SuperPlus => "super-speed-plus",
        }
    }
}

/// Port Status & Control. The change bits (csc, pec, wrc, prc) are RW1C:
/// writing them back clears them, so read-modify-write sequences must be
/// deliberate about which ones they preserve.
#[bitfield(u32)]
pub struct PortSCReg {
    /// Current Connect Status; 0 whenever port power is off.
    pub ccs: bool,
    /// Port Enabled/Disabled. Only the controller enables a port;
    /// software writing 1 disables it.
    pub ped: bool,
    #[bits(2)]
    __: (),
    /// Port Reset; set to start bus reset signaling, clears when the root
    /// hub finishes.
    pub pr: bool,
    /// Port Link State, RW under PLS-write-strobe rules.
    #[bits(4)]
    pub pls: u8,
    /// Port Power.
    pub pp: bool,
    /// Speed of the attached device; only meaningful while CCS is set.
    #[bits(4)]
    pub port_speed: PortSpeed,
    #[bits(3)]
    __: (),
    /// Connect Status Change, RW1C.
    pub csc: bool,
    /// Port Enabled/Disabled Change, RW1C.
    pub pec: bool,
    /// Warm Port Reset Change, RW1C (USB3 only).
    pub wrc: bool,
    #[bits(1)]
    __: (),
    /// Port Reset Change, RW1C: set on the 1 -> 0 transition of PR.
    pub prc: bool,
    #[bits(9)]
    __: (),
    /// Warm Port Reset (USB3 only); reads as 0.
    pub wpr: bool,
}

#[derive(Debug)]
#[repr(C)]
pub struct PortRegisters {
    pub port_sc: PortSCReg,
    port_pmsc: u32,
    port_li: u32,
    __: u32,
}

const _: () = assert!(size_of::<PortRegisters>() == 0x10);

impl OperationalRegs {
    pub unsafe fn port_registers(&mut self, port_index: u8) -> &'static mut PortRegisters {
        let ptr = self as *mut Self;
        unsafe {
            let port_reg_ptr = ptr
                .byte_add(0x400usize + (size_of::<PortRegisters>() * port_index as usize))
                as *mut PortRegisters;
            &mut *port_reg_ptr
        }
    }

    /// Resets a root port and waits for the reset to complete. Powers the
    /// port first when needed. Returns false when the port never enabled,
    /// which is normal for an empty port.
    pub unsafe fn reset_port(&mut self, is_usb3: bool, port_index: u8) -> bool {
        let port_regs = unsafe { self.port_registers(port_index) };
        let mut port_sc = read_ref!(port_regs.port_sc);

        if !port_sc.pp() {
            write_ref!(port_regs.port_sc, port_sc.with_pp(true));

            // wait 20ms for power to stabilize
            crate::sleep!(20 ms);

            port_sc = read_ref!(port_regs.port_sc);
            if !port_sc.pp() {
                warn!("xHCI port {port_index} didn't power up, stopping reset");
                return false;
            }
        }

        // Clear lingering change bits before initiating the reset
        port_sc = read_ref!(port_regs.port_sc)
            .with_csc(true)
            .with_pec(true)
            .with_prc(true);
        write_ref!(port_regs.port_sc, port_sc);

        port_sc = read_ref!(port_regs.port_sc);
        if is_usb3 {
            // warm reset for usb3
            port_sc.set_wpr(true);
        } else {
            // standard hot reset for usb2
            port_sc.set_pr(true);
        }
        write_ref!(port_regs.port_sc, port_sc);

        let reset_done = wait_for_condition("port reset", PORT_RESET_TIMEOUT_MS, || {
            let sc = read_ref!(port_regs.port_sc);
            (!is_usb3 && sc.prc()) || (is_usb3 && sc.wrc()) || (!sc.pr() && sc.ped())
        });
        if !reset_done {
            warn!("xHCI port {port_index}: reset timeout after {PORT_RESET_TIMEOUT_MS}ms");
            return false;
        }

        // let the hardware settle before touching the change bits
        crate::sleep!(5 ms);

        port_sc = read_ref!(port_regs.port_sc)
            .with_prc(true)
            .with_wrc(true)
            .with_csc(true)
            .with_pec(true)
            .with_ped(false);
        write_ref!(port_regs.port_sc, port_sc);

        crate::sleep!(5 ms);

        port_sc = read_ref!(port_regs.port_sc);

        // Happens when the port was reset after a disconnect and nothing
        // has connected since.
        if !port_sc.ped() {
            warn!("xHCI port {port_index} reset attempted, port didn't enable, is_usb3 {is_usb3}");
            false
        } else {
            true
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy)]
    pub struct XHCIIman: u32 {
        /// Interrupt Pending, RW1C.
        const INTERRUPT_PENDING = 1 << 0;
        const INTERRUPT_ENABLE = 1 << 1;
    }
}

#[bitfield(u64)]
pub struct EventRingDequePtr {
    #[bits(3)]
    pub erst_segment_index: usize,
    /// Event Handler Busy, RW1C.
    #[bits(1)]
    pub handler_busy: bool,
    #[bits(60)]
    pub dequeue_ptr: u64,
}

impl EventRingDequePtr {
    pub const fn from_addr(addr: PhysAddr) -> Self {
        Self::from_bits(addr.into_raw() as u64)
    }
}

#[derive(Debug)]
#[repr(C)]
pub struct InterrupterRegs {
    /// Interrupt management
    pub iman: XHCIIman,
    /// Interrupt moderation
    pub imod: u32,
    /// Event ring segment table size
    pub erst_sz: u32,
    __: u32,
    /// Base of the event ring segment table
    pub erst_base: u64,
    pub event_ring_deque: EventRingDequePtr,
}

const _: () = assert!(size_of::<InterrupterRegs>() == 0x20);

#[repr(C)]
pub struct RuntimeRegs {
    /// Microframe index
    mf_index: u32,
    __: [u32; 7],
    interrupter_registers: [InterrupterRegs; 1024],
}

impl RuntimeRegs {
    pub fn interrupter_ptr(&mut self, index: usize) -> *mut InterrupterRegs {
        &raw mut self.interrupter_registers[index]
    }
}

#[bitfield(u32)]
pub struct DoorbellReg {
    pub db_target: u8,
    __: u8,
    pub db_stream_id: u16,
}

/// The doorbell array: index 0 rings the command ring, index N rings
/// device slot N with the endpoint DCI as target.
#[derive(Debug)]
pub struct XHCIDoorbellManager {
    doorbells: &'static mut [DoorbellReg],
}

unsafe impl Send for XHCIDoorbellManager {}

impl XHCIDoorbellManager {
    pub fn new(base: VirtAddr, max_device_slots: usize) -> Self {
        let doorbells_ptr = base.into_ptr::<DoorbellReg>();
        // slot doorbells are 1-based, slot 0 is the command doorbell
        let doorbells =
            unsafe { core::slice::from_raw_parts_mut(doorbells_ptr, max_device_slots + 1) };
        Self { doorbells }
    }

    pub fn ring_doorbell(&mut self, doorbell: u8, target: u8) {
        let doorbell = &mut self.doorbells[doorbell as usize];
        unsafe {
            (doorbell as *mut DoorbellReg).write_volatile(DoorbellReg::new().with_db_target(target));
        }
    }

    pub fn ring_command_doorbell(&mut self) {
        self.ring_doorbell(0, 0);
    }

    /// Rings a slot doorbell with the endpoint DCI as target (EP0 is DCI 1).
    pub fn ring_endpoint_doorbell(&mut self, slot_id: u8, dci: u8) {
        self.ring_doorbell(slot_id, dci);
    }
}

/// Owns the mapped register banks plus the DCBAA and scratchpad storage.
#[derive(Debug)]
pub struct XHCIRegisters {
    caps_regs: *mut CapsReg,
    op_regs: *mut OperationalRegs,
    runtime_regs: *mut RuntimeRegs,
    /// Backs the DCBAA and the scratchpad pointer array.
    buffers_frame: Frame,
    scratchpad_buffers: Option<&'static mut [PhysAddr]>,
    dcbaa: &'static mut [PhysAddr],
}

unsafe impl Send for XHCIRegisters {}

impl XHCIRegisters {
    /// Takes ownership of the mapped register area. The controller still
    /// has to be reset and reconfigured before use.
    pub unsafe fn new(caps: *mut CapsReg) -> Result<Self, XhciError> {
        unsafe {
            Ok(Self {
                caps_regs: caps,
                op_regs: (*caps).operational_regs_ptr(),
                runtime_regs: (*caps).runtime_regs_ptr(),
                buffers_frame: frame_allocator::allocate_frame().ok_or(XhciError::OutOfMemory)?,
                scratchpad_buffers: None,
                dcbaa: &mut [],
            })
        }
    }

    pub unsafe fn capabilities(&self) -> &'static CapsReg {
        unsafe { &*self.caps_regs }
    }

    pub unsafe fn operational_regs(&self) -> &'static mut OperationalRegs {
        unsafe { &mut *self.op_regs }
    }

    unsafe fn runtime_regs<'a>(&self) -> &'a mut RuntimeRegs {
        unsafe { &mut *self.runtime_regs }
    }

    pub fn interrupter_ptr(&mut self, index: usize) -> *mut InterrupterRegs {
        unsafe { self.runtime_regs().interrupter_ptr(index) }
    }

    pub unsafe fn set_dcbaa_entry(&mut self, slot_id: u8, entry: PhysAddr) {
        let slot_id = slot_id as usize;
        assert!(slot_id != 0 && slot_id < self.dcbaa.len());

        let ptr = self.dcbaa.as_mut_ptr();
        unsafe {
            ptr.add(slot_id).write_volatile(entry);
        }
    }

    pub unsafe fn clear_dcbaa_entry(&mut self, slot_id: u8) {
        unsafe { self.set_dcbaa_entry(slot_id, PhysAddr::null()) }
    }

    pub unsafe fn dcbaa_entry(&self, slot_id: u8) -> PhysAddr {
        let slot_id = slot_id as usize;
        assert!(slot_id < self.dcbaa.len());
        unsafe { self.dcbaa.as_ptr().add(slot_id).read_volatile() }
    }

    pub unsafe fn get_dcbaa_entry_as_ptr(&mut self, slot_id: u8) -> *mut XHCIDeviceCtx32 {
        unsafe { self.dcbaa_entry(slot_id).into_virt().into_ptr() }
    }

    /// True when interrupter 0 has an interrupt pending; the top half's
    /// vote.
    pub fn has_pending_interrupt(&self) -> bool {
        let op_regs = unsafe { self.operational_regs() };
        if read_ref!(op_regs.usbstatus).contains(USBSts::EINT) {
            return true;
        }

        let interrupter = unsafe { &mut *self.runtime_regs().interrupter_ptr(0) };
        read_ref!(interrupter.iman).contains(XHCIIman::INTERRUPT_PENDING)
    }

    /// Acknowledges an interrupt on the given interrupter: both EINT and
    /// IMAN.IP are RW1C.
    pub unsafe fn acknowledge_irq(&mut self, interrupter: u8) {
        let op_regs = unsafe { self.operational_regs() };
        write_ref!(op_regs.usbstatus, USBSts::EINT);

        let runtime_regs = unsafe { self.runtime_regs() };
        let interrupt_reg = unsafe { &mut *runtime_regs.interrupter_ptr(interrupter as usize) };
        let iman = read_ref!(interrupt_reg.iman) | XHCIIman::INTERRUPT_PENDING;
        write_ref!(interrupt_reg.iman, iman);
    }

    /// Starts the controller and waits for HCHalted to clear.
    pub unsafe fn start(&mut self) -> Result<(), XhciError> {
        let regs = unsafe { self.operational_regs() };
        write_ref!(
            regs.usbcmd,
            read_ref!(regs.usbcmd) | USBCmd::RUN | USBCmd::INTERRUPT_ENABLE
        );

        if !wait_for_condition("controller run", RUN_TIMEOUT_MS, || {
            !read_ref!(regs.usbstatus).contains(USBSts::HCHALTED)
        }) {
            return Err(XhciError::ControllerTimeout);
        }

        Ok(())
    }

    /// Resets the controller to its power-on state: stop, wait HCH, reset,
    /// wait HCRST and CNR to clear.
    pub unsafe fn reset_zero(&mut self) -> Result<(), XhciError> {
        let regs = unsafe { self.operational_regs() };

        write_ref!(regs.usbcmd, read_ref!(regs.usbcmd) & !USBCmd::RUN);

        if !wait_for_condition("controller halt", HALT_TIMEOUT_MS, || {
            read_ref!(regs.usbstatus).contains(USBSts::HCHALTED)
        }) {
            warn!(
                "xHCI halt timeout after {HALT_TIMEOUT_MS}ms: {:?}",
                read_ref!(regs.usbstatus)
            );
            return Err(XhciError::ControllerTimeout);
        }

        write_ref!(regs.usbcmd, read_ref!(regs.usbcmd) | USBCmd::HCRESET);

        if !wait_for_condition("controller reset", RESET_TIMEOUT_MS, || {
            !read_ref!(regs.usbcmd).contains(USBCmd::HCRESET)
                && !read_ref!(regs.usbstatus).contains(USBSts::NOT_READY)
        }) {
            warn!(
                "xHCI reset timeout after {RESET_TIMEOUT_MS}ms: {:?}",
                read_ref!(regs.usbcmd)
            );
            return Err(XhciError::ControllerTimeout);
        }

        debug!(XHCIRegisters, "controller reset\n{}", regs);
        Ok(())
    }

    /// Programs the controller after a reset: CONFIG.MaxSlots, DNCTRL,
    /// DCBAA (+scratchpads), CRCR and interrupter 0.
    pub unsafe fn reconfigure(
        &mut self,
        event_ring: &mut XHCIEventRing,
        command_ring: &XHCICommandRing,
    ) -> Result<(), XhciError> {
        let op_regs = unsafe { self.operational_regs() };
        write_ref!(
            op_regs.config,
            unsafe { self.capabilities() }.max_device_slots() as u32
        );
        // Enable device notifications
        write_ref!(op_regs.dnctrl, 0xFFFF);
        self.configure_dcbaa()?;
        self.configure_crcr(command_ring);
        self.configure_runtime(event_ring);
        Ok(())
    }

    fn configure_crcr(&mut self, command_ring: &XHCICommandRing) {
        let op_regs = unsafe { self.operational_regs() };
        write_ref!(
            op_regs.crcr,
            command_ring.base_phys_addr().into_raw() as u64
                | command_ring.current_ring_cycle() as u64
        );
    }

    fn configure_dcbaa(&mut self) -> Result<(), XhciError> {
        let caps = unsafe { self.capabilities() };
        let op_regs = unsafe { self.operational_regs() };

        // entry 0 is the scratchpad array pointer, slots are 1-based
        let dcbaa_len = caps.max_device_slots() + 1;
        assert!(dcbaa_len * size_of::<PhysAddr>() <= PAGE_SIZE);

        let (dcbaa_slice, dcbaa_phys_addr) =
            allocate_buffers_frame::<PhysAddr>(self.buffers_frame, 0, dcbaa_len);

        // The scratchpad pointer array shares the DCBAA frame: at most
        // 256 DCBAA entries plus 1023 scratchpad pointers would overflow a
        // page, but real controllers stay far below that; the 64-byte
        // alignment requirement is what actually matters here.
        if caps.max_scratchpad_buffers() > 0 {
            let array_offset = (dcbaa_phys_addr + dcbaa_len * size_of::<PhysAddr>())
                .to_next_multiple_of(64)
                .into_raw()
                - dcbaa_phys_addr.into_raw();

            let (scratchpad_array, scratchpad_array_phys) = allocate_buffers_frame::<PhysAddr>(
                self.buffers_frame,
                array_offset,
                caps.max_scratchpad_buffers(),
            );

            for slot in scratchpad_array.iter_mut() {
                let frame = frame_allocator::allocate_frame().ok_or(XhciError::OutOfMemory)?;
                *slot = frame.phys_addr();
            }
            self.scratchpad_buffers = Some(scratchpad_array);
            // DCBAA[0] publishes the scratchpad array
            dcbaa_slice[0] = scratchpad_array_phys;
        }

        self.dcbaa = dcbaa_slice;
        write_ref!(op_regs.dcbaap, dcbaa_phys_addr.into_raw() as u64);
        Ok(())
    }

    fn configure_runtime(&mut self, event_ring: &mut XHCIEventRing) {
        event_ring.reset();
        let runtime_regs = unsafe { self.runtime_regs() };
        let interrupt_reg = unsafe { &mut *runtime_regs.interrupter_ptr(0) };
        write_ref!(interrupt_reg.iman, XHCIIman::INTERRUPT_ENABLE);

        // Clear anything pending from before the reset
        unsafe {
            self.acknowledge_irq(0);
        }
    }

    /// Powers every root port when the controller has port power control.
    pub unsafe fn power_ports(&mut self) {
        let caps = unsafe { self.capabilities() };
        if !caps.port_power_ctrl() {
            return;
        }

        let op_regs = unsafe { self.operational_regs() };
        for port_index in 0..caps.max_ports() {
            let port_regs = unsafe { op_regs.port_registers(port_index) };
            let port_sc = read_ref!(port_regs.port_sc);
            if !port_sc.pp() {
                write_ref!(port_regs.port_sc, port_sc.with_pp(true));
            }
        }
    }

    pub fn read_port_status(&mut self, port_index: u8) -> PortSCReg {
        let op_regs = unsafe { self.operational_regs() };
        let port_regs = unsafe { op_regs.port_registers(port_index) };
        read_ref!(port_regs.port_sc)
    }

    /// Full register snapshot for the one-shot host-system-error report.
    pub fn snapshot(&mut self) -> RegisterSnapshot {
        let op_regs = unsafe { self.operational_regs() };
        let interrupter = unsafe { &mut *self.runtime_regs().interrupter_ptr(0) };
        RegisterSnapshot {
            usbcmd: read_ref!(op_regs.usbcmd),
            usbsts: read_ref!(op_regs.usbstatus),
            config: read_ref!(op_regs.config),
            crcr: read_ref!(op_regs.crcr),
            dcbaap: read_ref!(op_regs.dcbaap),
            iman: read_ref!(interrupter.iman),
            imod: read_ref!(interrupter.imod),
            erst_sz: read_ref!(interrupter.erst_sz),
            erst_base: read_ref!(interrupter.erst_base),
            erdp: read_ref!(interrupter.event_ring_deque),
        }
    }
}

#[derive(Debug)]
pub struct RegisterSnapshot {
    pub usbcmd: USBCmd,
    pub usbsts: USBSts,
    pub config: u32,
    pub crcr: u64,
    pub dcbaap: u64,
    pub iman: XHCIIman,
    pub imod: u32,
    pub erst_sz: u32,
    pub erst_base: u64,
    pub erdp: EventRingDequePtr,
}

impl Display for RegisterSnapshot {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "usbcmd={:?} usbsts={:?} config={:#x}", self.usbcmd, self.usbsts, self.config)?;
        writeln!(f, "crcr={:#x} dcbaap={:#x}", self.crcr, self.dcbaap)?;
        write!(
            f,
            "iman={:?} imod={:#x} erstsz={} erstba={:#x} erdp={:#x}",
            self.iman, self.imod, self.erst_sz, self.erst_base, self.erdp.into_bits()
        )
    }
}
