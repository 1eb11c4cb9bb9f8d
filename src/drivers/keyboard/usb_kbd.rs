//! HID boot keyboard driver.
//!
//! Detection runs from a polling callback: the first present device with a
//! 03/01/01 interface and an interrupt-IN endpoint is claimed, switched to
//! the boot protocol, and polled by keeping exactly one interrupt-IN
//! transfer in flight. Completed reports are diffed against the previous
//! one; vanished usages become key-ups, new usages key-downs, and modifier
//! transitions synthesize the 0xE0..0xE7 usages. The same report path runs
//! from the controller's bottom half when interrupts are live.

use alloc::sync::{Arc, Weak};

use spin::Lazy;

use super::{MODIFIER_USAGES, UsbKeyModifiers, UsbKeyUsage};
use crate::devices::input::{self, KeyEvent};
use crate::drivers::deferred_work;
use crate::drivers::xhci::device::{self as xhci_device};
use crate::drivers::xhci::rings::trbs::{PacketRecipient, PacketType, XHCIDeviceRequestPacket};
use crate::drivers::xhci::usb::{
    ENDPOINT_TRANSFER_INTERRUPT, HID_PROTOCOL_BOOT, HID_PROTOCOL_KEYBOARD, HID_REQUEST_SET_IDLE,
    HID_REQUEST_SET_PROTOCOL, HID_SUBCLASS_BOOT, USB_CLASS_HID,
};
use crate::drivers::xhci::usb_device::USBDevice;
use crate::drivers::xhci::usb_endpoint::USBEndpoint;
use crate::drivers::xhci::usb_interface::USBInterface;
use crate::drivers::xhci::utils::XhciError;
use crate::drivers::xhci::{self, XHCI};
use crate::memory::PhysAddr;
use crate::utils::locks::Mutex;
use crate::{info, warn};

pub const BOOT_REPORT_SIZE: usize = 8;
const BOOT_KEYS: usize = 6;

/// Ctrl + this usage (F9) triggers the privileged action hook.
const PRIVILEGED_USAGE: u8 = 0x42;

/// Identical consecutive non-empty reports swallowed before key repeat
/// kicks in.
const IGNORED_REPEATED_REPORTS: u8 = 2;

const MAX_REPORT_EVENTS: usize = BOOT_KEYS * 2 + MODIFIER_USAGES.len();

pub struct USBKeyboard {
    controller: Weak<XHCI>,
    device: Arc<USBDevice>,
    /// Held so the interface/endpoint subtree outlives us across unplug.
    #[allow(dead_code)]
    interface: Arc<USBInterface>,
    endpoint: Arc<USBEndpoint>,
    report_trb: PhysAddr,
    report_pending: bool,
    report_state: ReportState,
}

#[derive(Debug, Default)]
pub(crate) struct ReportState {
    prev_modifiers: u8,
    prev_keys: [u8; BOOT_KEYS],
    last_report: [u8; BOOT_REPORT_SIZE],
    repeated_reports_to_ignore: u8,
}

static KEYBOARD: Lazy<Mutex<Option<USBKeyboard>>> = Lazy::new(|| Mutex::new(None));

/// Registers the keyboard poll with the deferred-work dispatcher.
pub fn initialize() -> bool {
    deferred_work::register_poll_only(Arc::new(poll), "USBKeyboard").is_some()
}

fn poll() {
    let mut guard = KEYBOARD.lock();
    match guard.as_mut() {
        None => {
            if let Some(keyboard) = detect_keyboard() {
                *guard = Some(keyboard);
            }
        }
        Some(keyboard) => {
            if !keyboard.device.is_present() {
                info!("USB keyboard detached");
                *guard = None;
                return;
            }
            keyboard.process_reports();
        }
    }
}

/// Report path for interrupt mode, called from the controller bottom half.
pub fn on_xhci_interrupt(controller: &XHCI) {
    // try_lock: the poll callback may be mid-detection on another CPU.
    let Some(mut guard) = KEYBOARD.try_lock() else {
        return;
    };
    let Some(keyboard) = guard.as_mut() else {
        return;
    };

    let Some(owner) = keyboard.controller.upgrade() else {
        return;
    };
    if !core::ptr::eq(Arc::as_ptr(&owner), controller as *const XHCI) {
        return;
    }
    if !keyboard.device.is_present() {
        return;
    }

    keyboard.process_reports();
}

fn detect_keyboard() -> Option<USBKeyboard> {
    for controller in xhci::controllers() {
        controller.ensure_usb_devices();

        for device in controller.devices() {
            let found = {
                let state = device.state();
                state
                    .interfaces
                    .iter()
                    .find(|interface| {
                        interface.matches_class(USB_CLASS_HID, HID_SUBCLASS_BOOT, HID_PROTOCOL_KEYBOARD)
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

            match start_keyboard(&controller, &device, interface, endpoint) {
                Ok(keyboard) => {
                    info!("USB keyboard attached on port {}", device.root_port());
                    return Some(keyboard);
                }
                Err(err) => {
                    warn!(USBKeyboard, "keyboard start failed: {err}");
                }
            }
        }
    }
    None
}

fn start_keyboard(
    controller: &Arc<XHCI>,
    device: &Arc<USBDevice>,
    interface: Arc<USBInterface>,
    endpoint: Arc<USBEndpoint>,
) -> Result<USBKeyboard, XhciError> {
    let interface_number = interface.interface_number();
    {
        let mut state = device.state();

        set_hid_boot_protocol(controller, &mut state, interface_number)?;
        set_hid_idle(controller, &mut state, interface_number)?;
        xhci_device::add_interrupt_endpoint(controller, &mut state, &endpoint)?;
    }

    let mut keyboard = USBKeyboard {
        controller: Arc::downgrade(controller),
        device: device.clone(),
        interface,
        endpoint,
        report_trb: PhysAddr::null(),
        report_pending: false,
        report_state: ReportState::default(),
    };
    keyboard.submit_report(controller);
    Ok(keyboard)
}

/// SET_PROTOCOL(Boot) on a HID interface; shared with the mouse driver.
pub(crate) fn set_hid_boot_protocol(
    controller: &XHCI,
    state: &mut crate::drivers::xhci::usb_device::UsbDeviceState,
    interface_number: u8,
) -> Result<(), XhciError> {
    let packet = XHCIDeviceRequestPacket::new()
        .with_recipient(PacketRecipient::Interface)
        .with_p_type(PacketType::Class)
        .with_device_to_host(false)
        .with_b_request(HID_REQUEST_SET_PROTOCOL)
        .with_w_value(HID_PROTOCOL_BOOT)
        .with_w_index(interface_number as u16)
        .with_w_length(0);
    xhci_device::control_transfer(controller, state, packet, None, false)
}

/// SET_IDLE(0): only report on actual state changes.
pub(crate) fn set_hid_idle(
    controller: &XHCI,
    state: &mut crate::drivers::xhci::usb_device::UsbDeviceState,
    interface_number: u8,
) -> Result<(), XhciError> {
    let packet = XHCIDeviceRequestPacket::new()
        .with_recipient(PacketRecipient::Interface)
        .with_p_type(PacketType::Class)
        .with_device_to_host(false)
        .with_b_request(HID_REQUEST_SET_IDLE)
        .with_w_value(0)
        .with_w_index(interface_number as u16)
        .with_w_length(0);
    xhci_device::control_transfer(controller, state, packet, None, false)
}

impl USBKeyboard {
    fn submit_report(&mut self, controller: &XHCI) {
        let length = (self.endpoint.desc().max_packet_size() as usize)
            .max(BOOT_REPORT_SIZE) as u32;
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
            let mut report = [0u8; BOOT_REPORT_SIZE];
            self.endpoint.read_data(&mut report);
            self.handle_report(report);
        } else {
            warn!(USBKeyboard, "report completion {completion:?}");
        }

        self.submit_report(&controller);
    }

    fn handle_report(&mut self, report: [u8; BOOT_REPORT_SIZE]) {
        let events = process_report(&mut self.report_state, report);
        for event in &events {
            input::dispatch_key_event(*event);

            if event.pressed && event.usage == PRIVILEGED_USAGE {
                let modifiers = UsbKeyModifiers::from_bits_retain(self.report_state.prev_modifiers);
                if modifiers.ctrl_pressed() {
                    input::run_privileged_action();
                }
            }
        }
    }
}

fn report_has_usage(keys: &[u8; BOOT_KEYS], usage: u8) -> bool {
    usage != 0 && keys.contains(&usage)
}

/// Diffs one boot report against the driver state, updating it and
/// producing the key transitions: modifier edges first, then releases,
/// then presses. Handles the repeat window for identical reports.
pub(crate) fn process_report(
    state: &mut ReportState,
    report: [u8; BOOT_REPORT_SIZE],
) -> heapless::Vec<KeyEvent, MAX_REPORT_EVENTS> {
    let mut events = heapless::Vec::new();

    // Identical non-empty reports: swallow a few, then replay the held
    // keys as repeats by pretending everything was released.
    if report == state.last_report && report != [0; BOOT_REPORT_SIZE] {
        if state.repeated_reports_to_ignore > 0 {
            state.repeated_reports_to_ignore -= 1;
            return events;
        }
        state.prev_modifiers = 0;
        state.prev_keys = [0; BOOT_KEYS];
    }
    state.repeated_reports_to_ignore = IGNORED_REPEATED_REPORTS;
    state.last_report = report;

    let new_modifiers = report[0];
    let mut new_keys = [0u8; BOOT_KEYS];
    new_keys.copy_from_slice(&report[2..2 + BOOT_KEYS]);

    if new_modifiers != state.prev_modifiers {
        for (bit, usage) in MODIFIER_USAGES.iter().enumerate() {
            let was_set = state.prev_modifiers & (1 << bit) != 0;
            let is_set = new_modifiers & (1 << bit) != 0;
            if was_set != is_set {
                let _ = events.push(KeyEvent {
                    usage: *usage,
                    pressed: is_set,
                });
            }
        }
    }

    for usage in state.prev_keys {
        if usage == 0 || report_has_usage(&new_keys, usage) {
            continue;
        }
        if UsbKeyUsage::try_from(usage).is_err() {
            continue;
        }
        let _ = events.push(KeyEvent {
            usage,
            pressed: false,
        });
    }

    for usage in new_keys {
        if usage == 0 || report_has_usage(&state.prev_keys, usage) {
            continue;
        }
        if UsbKeyUsage::try_from(usage).is_err() {
            warn!(USBKeyboard, "unknown key usage {usage:#x} encountered");
            continue;
        }
        let _ = events.push(KeyEvent {
            usage,
            pressed: true,
        });
    }

    state.prev_modifiers = new_modifiers;
    state.prev_keys = new_keys;

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(modifiers: u8, keys: &[u8]) -> [u8; BOOT_REPORT_SIZE] {
        let mut out = [0u8; BOOT_REPORT_SIZE];
        out[0] = modifiers;
        out[2..2 + keys.len()].copy_from_slice(keys);
        out
    }

    #[test]
    fn press_and_release_sequence() {
        let mut state = ReportState::default();

        // Left Shift + A
        let events = process_report(&mut state, report(0x02, &[0x04]));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], KeyEvent { usage: 0xE1, pressed: true });
        assert_eq!(events[1], KeyEvent { usage: 0x04, pressed: true });

        // Shift released, A released, B pressed
        let events = process_report(&mut state, report(0x00, &[0x05]));
        assert_eq!(
            &events[..],
            &[
                KeyEvent { usage: 0xE1, pressed: false },
                KeyEvent { usage: 0x04, pressed: false },
                KeyEvent { usage: 0x05, pressed: true },
            ]
        );
    }

    #[test]
    fn unchanged_keys_do_not_rereport() {
        let mut state = ReportState::default();

        process_report(&mut state, report(0, &[0x04]));
        // A still held, B newly pressed
        let events = process_report(&mut state, report(0, &[0x04, 0x05]));
        assert_eq!(&events[..], &[KeyEvent { usage: 0x05, pressed: true }]);
    }

    #[test]
    fn repeat_window_then_replay() {
        let mut state = ReportState::default();
        let held = report(0, &[0x04]);

        assert_eq!(process_report(&mut state, held).len(), 1);

        // identical reports are swallowed while the window lasts
        assert!(process_report(&mut state, held).is_empty());
        assert!(process_report(&mut state, held).is_empty());

        // then the held key repeats
        let events = process_report(&mut state, held);
        assert_eq!(&events[..], &[KeyEvent { usage: 0x04, pressed: true }]);
    }

    #[test]
    fn unknown_usages_are_dropped() {
        let mut state = ReportState::default();
        let events = process_report(&mut state, report(0, &[0x47, 0x04]));
        // 0x47 (scroll lock) is not in the usage table
        assert_eq!(&events[..], &[KeyEvent { usage: 0x04, pressed: true }]);
    }

    #[test]
    fn empty_report_releases_everything() {
        let mut state = ReportState::default();
        process_report(&mut state, report(0x01, &[0x04, 0x05]));

        let events = process_report(&mut state, report(0, &[]));
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|event| !event.pressed));
    }
}
