//! The USB device object: one per root port and per downstream hub port,
//! populated or not.
//!
//! Ownership is a tree: the controller holds root-port devices, a hub's
//! state holds its children, a device holds its interfaces, an interface
//! its endpoints. Class drivers clone `Arc` shares of the nodes they use;
//! teardown defers the actual free until every share is gone, so a driver
//! never sees its endpoint's storage reused mid-operation.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use crate::drivers::xhci::device::XhciSlot;
use crate::drivers::xhci::hub::HubState;
use crate::drivers::xhci::regs::PortSpeed;
use crate::drivers::xhci::usb::{USB_CLASS_HUB, UsbConfiguration, UsbDeviceDescriptor};
use crate::drivers::xhci::usb_interface::USBInterface;
use crate::utils::locks::{Mutex, MutexGuard};

/// Enumeration failure tag, recorded at the step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum EnumError {
    #[default]
    None,
    /// Subtree still referenced, enumeration deferred.
    Busy,
    ResetTimeout,
    InvalidSpeed,
    InitState,
    EnableSlot,
    AddressDevice,
    DeviceDescriptor,
    ConfigDescriptor,
    ConfigParse,
    SetConfiguration,
    HubInit,
}

/// Mutable device state, guarded by the device mutex: contexts, transfer
/// rings, the parsed descriptor tree and hub bookkeeping.
#[derive(Default)]
pub struct UsbDeviceState {
    pub slot_id: u8,
    pub address: u8,
    pub speed: PortSpeed,
    /// 4 bits per hub hop, derived solely from the ancestor chain.
    pub route_string: u32,
    pub depth: u8,
    /// Downstream port on the parent hub; 0 for root-port devices.
    pub parent_port: u8,
    /// TT fields for LS/FS devices behind a high-speed hub.
    pub tt_hub_slot: u8,
    pub tt_hub_port: u8,
    pub max_packet_size0: u16,
    pub descriptor: UsbDeviceDescriptor,
    pub configs: Vec<UsbConfiguration>,
    pub selected_config: u8,
    pub interfaces: Vec<Arc<USBInterface>>,
    /// xHCI-side slot state: input/output contexts and the EP0 ring.
    pub slot: Option<XhciSlot>,
    pub hub: Option<HubState>,
    pub last_enum_error: EnumError,
    pub last_enum_completion: u8,
    pub(super) last_enum_log_ms: u64,
}

impl UsbDeviceState {
    pub fn is_hub(&self) -> bool {
        self.descriptor.b_device_class == USB_CLASS_HUB
            || self
                .interfaces
                .iter()
                .any(|interface| interface.desc().b_interface_class == USB_CLASS_HUB)
    }

    /// Forgets everything a previous enumeration produced. Dropping the
    /// slot state releases the context pages and rings.
    pub fn clear_enumeration(&mut self) {
        self.slot_id = 0;
        self.address = 0;
        self.max_packet_size0 = 0;
        self.descriptor = UsbDeviceDescriptor::default();
        self.configs.clear();
        self.selected_config = 0;
        self.interfaces.clear();
        self.slot = None;
        self.hub = None;
    }
}

pub struct USBDevice {
    /// Root port this device is reached through, 1-based.
    root_port: u8,
    present: AtomicBool,
    destroy_pending: AtomicBool,
    state: Mutex<UsbDeviceState>,
}

impl USBDevice {
    /// An empty device object for a (root or hub) port; enumeration fills
    /// it in when something connects.
    pub fn new_empty(root_port: u8) -> Self {
        Self {
            root_port,
            present: AtomicBool::new(false),
            destroy_pending: AtomicBool::new(false),
            state: Mutex::new(UsbDeviceState::default()),
        }
    }

    pub const fn root_port(&self) -> u8 {
        self.root_port
    }

    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }

    pub fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::Release);
    }

    pub fn destroy_pending(&self) -> bool {
        self.destroy_pending.load(Ordering::Acquire)
    }

    pub fn set_destroy_pending(&self, pending: bool) {
        self.destroy_pending.store(pending, Ordering::Release);
    }

    pub fn state(&self) -> MutexGuard<'_, UsbDeviceState> {
        self.state.lock()
    }

    pub fn try_state(&self) -> Option<MutexGuard<'_, UsbDeviceState>> {
        self.state.try_lock()
    }
}

/// True when any interface or endpoint of `device`, or the device object
/// itself, is still shared beyond the tree's own holdings. `device_floor`
/// is the number of `Arc` holds the caller accounts for (owner table plus
/// its own clones); interfaces and endpoints have an idle floor of one,
/// their parent's hold.
pub fn tree_has_references(device: &Arc<USBDevice>, device_floor: usize) -> bool {
    if Arc::strong_count(device) > device_floor {
        return true;
    }

    let Some(state) = device.try_state() else {
        // Locked elsewhere counts as referenced.
        return true;
    };

    for interface in &state.interfaces {
        if Arc::strong_count(interface) > 1 {
            return true;
        }
        for endpoint in interface.endpoints() {
            if Arc::strong_count(endpoint) > 1 {
                return true;
            }
        }
    }

    if let Some(hub) = &state.hub {
        for child in hub.children.iter().flatten() {
            if tree_has_references(child, 1) {
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::xhci::usb::{UsbEndpointDescriptor, UsbInterfaceDescriptor};

    fn setup() {
        crate::platform::test::setup();
    }

    fn device_with_interface() -> Arc<USBDevice> {
        let device = Arc::new(USBDevice::new_empty(1));
        let endpoint = UsbEndpointDescriptor {
            b_length: 7,
            b_descriptor_type: 5,
            b_endpoint_address: 0x81,
            bm_attributes: 0x03,
            w_max_packet_size: 8,
            b_interval: 10,
        };
        let interface = USBInterface::new(
            UsbInterfaceDescriptor {
                b_num_endpoints: 1,
                b_interface_class: 3,
                ..Default::default()
            },
            &[endpoint],
            1,
        )
        .unwrap();
        device.state().interfaces.push(Arc::new(interface));
        device
    }

    #[test]
    fn idle_tree_has_no_references() {
        setup();
        let device = device_with_interface();
        assert!(!tree_has_references(&device, 1));
    }

    #[test]
    fn class_driver_hold_blocks_teardown() {
        setup();
        let device = device_with_interface();

        let endpoint_share = device.state().interfaces[0].endpoints()[0].clone();
        assert!(tree_has_references(&device, 1));

        drop(endpoint_share);
        assert!(!tree_has_references(&device, 1));

        let interface_share = device.state().interfaces[0].clone();
        assert!(tree_has_references(&device, 1));
        drop(interface_share);
        assert!(!tree_has_references(&device, 1));

        let device_share = device.clone();
        assert!(tree_has_references(&device, 1));
        drop(device_share);
        assert!(!tree_has_references(&device, 1));
    }
}
