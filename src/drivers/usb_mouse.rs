//! HID boot mouse driver.
//!
//! Same shape as the boot keyboard: claim the first 03/01/02 interface
//! with an interrupt-IN endpoint, keep one transfer in flight, parse
//! 3+ byte reports. Parsed packets go through the coalescing queue in
//! [`mouse_common`](crate::drivers::mouse_common) rather than straight to
//! the consumer.

use alloc::sync::{Arc, Weak};

use spin::Lazy;

use crate::devices::input::MouseButtons;
use crate::drivers::deferred_work;
use crate::drivers::mouse_common;
use crate::drivers::xhci::device as xhci_device;
use crate::drivers::xhci::usb::{
    ENDPOINT_TRANSFER_INTERRUPT, HID_PROTOCOL_MOUSE, HID_SUBCLASS_BOOT, USB_CLASS_HID,
};
use crate::drivers::xhci::usb_device::USBDevice;
use crate::drivers::xhci::usb_endpoint::USBEndpoint;
use crate::drivers::xhci::usb_interface::USBInterface;
use crate::drivers::xhci::utils::XhciError;
use crate::drivers::xhci::{self, XHCI};
use crate::memory::PhysAddr;
use crate::utils::locks::Mutex;
use crate::{info, warn};

pub const BOOT_MOUSE_REPORT_SIZE: usize = 3;

pub struct USBMouse {
    controller: Weak<XHCI>,
    device: Arc<USBDevice>,
    #[allow(dead_code)]
    interface: Arc<USBInterface>,
    endpoint: Arc<USBEndpoint>,
    report_trb: PhysAddr,
    report_pending: bool,
}

static MOUSE: Lazy<Mutex<Option<USBMouse>>> = Lazy::new(|| Mutex::new(None));

/// Registers the mouse poll and the coalescing dispatcher.
pub fn initialize() -> bool {
    if !mouse_common::initialize() {
        return false;
    }
    deferred_work::register_poll_only(Arc::new(poll), "USBMouse").is_some()
}

fn poll() {
    let mut guard = MOUSE.lock();
    match guard.as_mut() {
        None => {
            if let Some(mouse) = detect_mouse() {
                *guard = Some(mouse);
            }
        }
        Some(mouse) => {
            if !mouse.device.is_present() {
                info!("USB mouse detached");
                *guard = None;
                return;
            }
            mouse.process_reports();
        }
    }
}

/// Report path for interrupt mode, called from the controller bottom half.
pub fn on_xhci_interrupt(controller: &XHCI) {
    let Some(mut guard) = MOUSE.try_lock() else {
        return;
    };
    let Some(mouse) = guard.as_mut() else {
        return;
    };

    let Some(owner) = mouse.controller.upgrade() else {
        return;
    };
    if !core::ptr::eq(Arc::as_ptr(&owner), controller as *const XHCI) {
        return;
    }
    if !mouse.device.is_present() {
        return;
    }

    mouse.process_reports();
}

fn detect_mouse() -> Option<USBMouse> {
    for controller in xhci::controllers() {
        controller.ensure_usb_devices();

        for device in controller.devices() {
            let found = {
                let state = device.state();
                state
                    .interfaces
                    .iter()
                    .find(|interface| {
                        interface.matches_class(USB_CLASS_HID, HID_SUBCLASS_BOOT, HID_PROTOCOL_MOUSE)
                    })
                    .and_then(|interface| {
                        interface
                            .find_endpoint(ENDPOINT_TRANSFER_INTERRUPT, true)
                            .map(|endpoint| (interface.clone(), endpoint))
                    })
            };

            let Some((interface, endpoint)) = found else {
                continue;
            };

            match start_mouse(&controller, &device, interface, endpoint) {
                Ok(mouse) => {
                    info!("USB mouse attached on port {}", device.root_port());
                    return Some(mouse);
                }
                Err(err) => {
                    warn!(USBMouse, "mouse start failed: {err}");
                }
            }
        }
    }
    None
}

fn start_mouse(
    controller: &Arc<XHCI>,
    device: &Arc<USBDevice>,
    interface: Arc<USBInterface>,
    endpoint: Arc<USBEndpoint>,
) -> Result<USBMouse, XhciError> {
    let interface_number = interface.interface_number();
    {
        let mut state = device.state();
        super::keyboard::usb_kbd::set_hid_boot_protocol(controller, &mut state, interface_number)?;
        super::keyboard::usb_kbd::set_hid_idle(controller, &mut state, interface_number)?;
        xhci_device::add_interrupt_endpoint(controller, &mut state, &endpoint)?;
    }

    let mut mouse = USBMouse {
        controller: Arc::downgrade(controller),
        device: device.clone(),
        interface,
        endpoint,
        report_trb: PhysAddr::null(),
        report_pending: false,
    };
    mouse.submit_report(controller);
    Ok(mouse)
}

impl USBMouse {
    fn submit_report(&mut self, controller: &XHCI) {
        let length = (self.endpoint.desc().max_packet_size() as usize)
            .max(BOOT_MOUSE_REPORT_SIZE) as u32;
        self.report_trb = self.endpoint.submit_normal_transfer(length, true);
        self.report_pending = true;

        let slot_id = self.device.state().slot_id;
        controller.ring_endpoint_doorbell(slot_id, self.endpoint.dci());
    }

    fn process_reports(&mut self) {
        let Some(controller) = self.controller.upgrade() else {
            return;
        };

        if !self.report_pending {
            self.submit_report(&controller);
            return;
        }

        let Some(completion) = controller.check_transfer_completion(self.report_trb) else {
            return;
        };

        self.report_pending = false;
        if completion.is_transfer_success() {
            let mut report = [0u8; BOOT_MOUSE_REPORT_SIZE];
            self.endpoint.read_data(&mut report);
            if let Some((buttons, delta_x, delta_y)) = parse_boot_report(&report) {
                mouse_common::queue_packet(delta_x as i32, delta_y as i32, buttons);
            }
        } else {
            warn!(USBMouse, "report completion {completion:?}");
        }

        self.submit_report(&controller);
    }
}

/// Decodes a boot-protocol mouse report: buttons in the low three bits of
/// byte 0, signed X/Y deltas in bytes 1 and 2. An all-zero report carries
/// no information.
pub(crate) fn parse_boot_report(data: &[u8]) -> Option<(MouseButtons, i16, i16)> {
    if data.len() < BOOT_MOUSE_REPORT_SIZE {
        return None;
    }
    if data[..BOOT_MOUSE_REPORT_SIZE] == [0, 0, 0] {
        return None;
    }

    let buttons = MouseButtons::from_bits_truncate(data[0] & 0b111);
    let delta_x = data[1] as i8 as i16;
    let delta_y = data[2] as i8 as i16;
    Some((buttons, delta_x, delta_y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_buttons_and_signed_deltas() {
        let (buttons, dx, dy) = parse_boot_report(&[0b101, 0x05, 0xFB]).unwrap();
        assert_eq!(buttons, MouseButtons::LEFT | MouseButtons::MIDDLE);
        assert_eq!(dx, 5);
        assert_eq!(dy, -5);
    }

    #[test]
    fn empty_report_is_ignored() {
        assert!(parse_boot_report(&[0, 0, 0]).is_none());
        assert!(parse_boot_report(&[0]).is_none());
    }

    #[test]
    fn button_only_report_survives() {
        let (buttons, dx, dy) = parse_boot_report(&[0b010, 0, 0]).unwrap();
        assert_eq!(buttons, MouseButtons::RIGHT);
        assert_eq!(dx, 0);
        assert_eq!(dy, 0);
    }

    #[test]
    fn reserved_button_bits_are_masked() {
        let (buttons, _, _) = parse_boot_report(&[0xF9, 1, 1]).unwrap();
        assert_eq!(buttons, MouseButtons::LEFT);
    }
}
