//! Hub class driver: descriptor fetch, per-port power/reset/status through
//! class-specific control transfers, and the change-bitmap poll that
//! extends hot-plug to downstream ports.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::drivers::xhci::device::{self, ScratchPage};
use crate::drivers::xhci::regs::PortSpeed;
use crate::drivers::xhci::rings::trbs::{
    PacketRecipient, PacketType, XHCIDeviceRequestPacket,
};
use crate::drivers::xhci::usb::{
    ENDPOINT_TRANSFER_INTERRUPT, HUB_FEATURE_C_PORT_CONNECTION, HUB_FEATURE_C_PORT_ENABLE,
    HUB_FEATURE_C_PORT_RESET, HUB_FEATURE_PORT_POWER, HUB_FEATURE_PORT_RESET,
    HUB_PORT_CHANGE_CONNECTION, HUB_PORT_CHANGE_ENABLE, HUB_PORT_CHANGE_RESET,
    HUB_PORT_STATUS_CONNECTION, HUB_PORT_STATUS_HIGH_SPEED, HUB_PORT_STATUS_LOW_SPEED,
    REQUEST_CLEAR_FEATURE, REQUEST_GET_DESCRIPTOR, REQUEST_GET_STATUS, REQUEST_SET_FEATURE,
    USB_DESCRIPTOR_HUB_TYPE, USB_DESCRIPTOR_SS_HUB_TYPE, USB_HUB_DESCRIPTOR_LENGTH,
    UsbPortStatus,
};
use crate::drivers::xhci::usb_device::{USBDevice, UsbDeviceState};
use crate::drivers::xhci::usb_endpoint::USBEndpoint;
use crate::drivers::xhci::utils::XhciError;
use crate::drivers::xhci::XHCI;
use crate::memory::PhysAddr;
use crate::{debug, platform, warn};

const HUB_PORT_RESET_TIMEOUT_MS: u64 = 200;

/// Hub bookkeeping hung off the hub's device state. The status endpoint is
/// held weakly: the interface owns it, and teardown accounting must not see
/// a phantom share.
pub struct HubState {
    pub port_count: u8,
    pub children: Vec<Option<Arc<USBDevice>>>,
    /// Last observed wPortStatus per port.
    pub port_status: Vec<u16>,
    pub status_endpoint: Weak<USBEndpoint>,
    pub status_trb: PhysAddr,
    pub status_pending: bool,
    /// ceil((ports + 1) / 8) bytes of change bitmap per status transfer.
    pub interrupt_length: u16,
}

pub struct HubDriver;

fn read_hub_descriptor(
    controller: &XHCI,
    state: &mut UsbDeviceState,
) -> Result<u8, XhciError> {
    let descriptor_type = match state.speed {
        PortSpeed::Super | PortSpeed::SuperPlus => USB_DESCRIPTOR_SS_HUB_TYPE,
        _ => USB_DESCRIPTOR_HUB_TYPE,
    };

    let scratch = ScratchPage::new()?;
    let packet = XHCIDeviceRequestPacket::new()
        .with_recipient(PacketRecipient::Device)
        .with_p_type(PacketType::Class)
        .with_device_to_host(true)
        .with_b_request(REQUEST_GET_DESCRIPTOR)
        .with_w_value(descriptor_type << 8)
        .with_w_index(0)
        .with_w_length(USB_HUB_DESCRIPTOR_LENGTH as u16);

    device::control_transfer(controller, state, packet, Some(scratch.phys_addr()), true)?;

    let mut bytes = [0u8; USB_HUB_DESCRIPTOR_LENGTH];
    scratch.read(&mut bytes);
    // bNbrPorts sits right after length and type
    Ok(bytes[2])
}

fn set_port_feature(
    controller: &XHCI,
    state: &mut UsbDeviceState,
    port: u8,
    feature: u16,
) -> Result<(), XhciError> {
    let packet = XHCIDeviceRequestPacket::new()
        .with_recipient(PacketRecipient::Other)
        .with_p_type(PacketType::Class)
        .with_device_to_host(false)
        .with_b_request(REQUEST_SET_FEATURE)
        .with_w_value(feature)
        .with_w_index(port as u16)
        .with_w_length(0);
    device::control_transfer(controller, state, packet, None, false)
}

fn clear_port_feature(
    controller: &XHCI,
    state: &mut UsbDeviceState,
    port: u8,
    feature: u16,
) -> Result<(), XhciError> {
    let packet = XHCIDeviceRequestPacket::new()
        .with_recipient(PacketRecipient::Other)
        .with_p_type(PacketType::Class)
        .with_device_to_host(false)
        .with_b_request(REQUEST_CLEAR_FEATURE)
        .with_w_value(feature)
        .with_w_index(port as u16)
        .with_w_length(0);
    device::control_transfer(controller, state, packet, None, false)
}

fn get_port_status(
    controller: &XHCI,
    state: &mut UsbDeviceState,
    port: u8,
) -> Result<UsbPortStatus, XhciError> {
    let scratch = ScratchPage::new()?;
    let packet = XHCIDeviceRequestPacket::new()
        .with_recipient(PacketRecipient::Other)
        .with_p_type(PacketType::Class)
        .with_device_to_host(true)
        .with_b_request(REQUEST_GET_STATUS)
        .with_w_value(0)
        .with_w_index(port as u16)
        .with_w_length(4);

    device::control_transfer(controller, state, packet, Some(scratch.phys_addr()), true)?;

    let mut bytes = [0u8; 4];
    scratch.read(&mut bytes);
    Ok(UsbPortStatus {
        status: u16::from_le_bytes([bytes[0], bytes[1]]),
        change: u16::from_le_bytes([bytes[2], bytes[3]]),
    })
}

/// SET_FEATURE(PORT_RESET), then poll until C_PORT_RESET shows up and
/// clear it.
fn reset_hub_port(
    controller: &XHCI,
    state: &mut UsbDeviceState,
    port: u8,
) -> Result<(), XhciError> {
    set_port_feature(controller, state, port, HUB_FEATURE_PORT_RESET)?;

    let deadline = crate::time!() + HUB_PORT_RESET_TIMEOUT_MS;
    loop {
        let status = get_port_status(controller, state, port)?;
        if status.change & HUB_PORT_CHANGE_RESET != 0 {
            let _ = clear_port_feature(controller, state, port, HUB_FEATURE_C_PORT_RESET);
            return Ok(());
        }
        if crate::time!() >= deadline {
            return Err(XhciError::ControllerTimeout);
        }
        platform::sleep_ms(1);
    }
}

/// Downstream-port speed: LS/HS status bits for USB2 hubs, otherwise the
/// child runs at the hub's own speed.
fn hub_port_speed(hub_speed: PortSpeed, status: &UsbPortStatus) -> PortSpeed {
    if status.status & HUB_PORT_STATUS_LOW_SPEED != 0 {
        PortSpeed::Low
    } else if status.status & HUB_PORT_STATUS_HIGH_SPEED != 0 {
        PortSpeed::High
    } else {
        match hub_speed {
            PortSpeed::Super | PortSpeed::SuperPlus => hub_speed,
            PortSpeed::High => PortSpeed::Full,
            other => other,
        }
    }
}

/// Brings a freshly enumerated hub up: descriptor, slot-context update,
/// status endpoint, port power, initial probes of occupied ports.
pub fn init_hub(controller: &XHCI, device_obj: &Arc<USBDevice>) -> Result<(), XhciError> {
    let port_count;
    {
        let mut state = device_obj.state();

        port_count = read_hub_descriptor(controller, &mut state)?;
        if port_count == 0 {
            return Err(XhciError::BadParameter);
        }

        // Tell the controller this slot is a hub before its children
        // start routing through it.
        {
            let slot = state.slot.as_mut().ok_or(XhciError::NoDevice)?;
            slot.build_hub_slot_ctx(port_count);
        }
        device::evaluate_context(controller, &mut state)?;

        let status_endpoint = state
            .interfaces
            .iter()
            .find_map(|interface| interface.find_endpoint(ENDPOINT_TRANSFER_INTERRUPT, true))
            .ok_or(XhciError::BadParameter)?;
        device::add_interrupt_endpoint(controller, &mut state, &status_endpoint)?;

        let interrupt_length = (port_count as u16 + 1).div_ceil(8);

        state.hub = Some(HubState {
            port_count,
            children: alloc::vec![None; port_count as usize],
            port_status: alloc::vec![0; port_count as usize],
            status_endpoint: Arc::downgrade(&status_endpoint),
            status_trb: PhysAddr::null(),
            status_pending: false,
            interrupt_length,
        });

        for port in 1..=port_count {
            if let Err(err) = set_port_feature(controller, &mut state, port, HUB_FEATURE_PORT_POWER)
            {
                warn!(HubDriver, "hub port {port} power-on failed: {err}");
            }
        }

        debug!(
            HubDriver,
            "hub on port {} initialized with {port_count} ports",
            device_obj.root_port()
        );
    }

    // Probe whatever is already plugged in.
    for port in 1..=port_count {
        let connected = {
            let mut state = device_obj.state();
            match get_port_status(controller, &mut state, port) {
                Ok(status) => status.status & HUB_PORT_STATUS_CONNECTION != 0,
                Err(_) => false,
            }
        };
        if connected {
            if let Err(err) = probe_hub_port(controller, device_obj, port) {
                warn!(HubDriver, "hub port {port} probe failed: {err}");
            }
        }
    }

    Ok(())
}

/// Resets a downstream port, allocates the child device and enumerates it;
/// recurses into child hubs.
fn probe_hub_port(controller: &XHCI, hub: &Arc<USBDevice>, port: u8) -> Result<(), XhciError> {
    let (child_speed, child_route, child_depth, tt_slot, tt_port) = {
        let mut state = hub.state();

        let status = get_port_status(controller, &mut state, port)?;
        if status.status & HUB_PORT_STATUS_CONNECTION == 0 {
            return Err(XhciError::NoDevice);
        }

        reset_hub_port(controller, &mut state, port)?;

        let status = get_port_status(controller, &mut state, port)?;
        let child_speed = hub_port_speed(state.speed, &status);

        let child_route =
            state.route_string | ((port as u32 & 0xF) << (4 * state.depth as u32));

        // LS/FS traffic below a high-speed hub goes through that hub's
        // transaction translator.
        let (tt_slot, tt_port) = if matches!(child_speed, PortSpeed::Low | PortSpeed::Full)
            && state.speed == PortSpeed::High
        {
            (state.slot_id, port)
        } else {
            (state.tt_hub_slot, state.tt_hub_port)
        };

        (child_speed, child_route, state.depth + 1, tt_slot, tt_port)
    };

    let child = Arc::new(USBDevice::new_empty(hub.root_port()));
    {
        let mut child_state = child.state();
        child_state.speed = child_speed;
        child_state.route_string = child_route;
        child_state.depth = child_depth;
        child_state.parent_port = port;
        child_state.tt_hub_slot = tt_slot;
        child_state.tt_hub_port = tt_port;
    }

    controller.enumerate_device(&child)?;

    {
        let mut state = hub.state();
        if let Some(hub_state) = state.hub.as_mut() {
            hub_state.children[port as usize - 1] = Some(child.clone());
        }
    }

    let child_is_hub = child.state().is_hub();
    if child_is_hub {
        init_hub(controller, &child)?;
    }

    debug!(
        HubDriver,
        "hub port {port} enumerated at depth {child_depth} (route {child_route:#x}, {})",
        child_speed.as_str()
    );
    Ok(())
}

enum PortAction {
    Probe(u8),
    Destroy(u8),
}

/// Keeps one interrupt-IN status transfer in flight per present hub and
/// decodes the change bitmap when it completes.
pub fn poll_hubs(controller: &Arc<XHCI>) {
    let mut hubs = Vec::new();
    for device in controller.ports() {
        collect_present_hubs(device, &mut hubs);
    }

    for hub in hubs {
        retry_deferred_teardown(controller, &hub);
        service_hub(controller, &hub);
    }
}

fn collect_present_hubs(device: &Arc<USBDevice>, out: &mut Vec<Arc<USBDevice>>) {
    if !device.is_present() {
        return;
    }

    let children: Vec<Arc<USBDevice>> = {
        let state = device.state();
        let Some(hub) = &state.hub else {
            return;
        };
        hub.children.iter().flatten().cloned().collect()
    };

    out.push(device.clone());
    for child in &children {
        collect_present_hubs(child, out);
    }
}

/// Finishes teardown of children whose free was deferred while class
/// drivers still held references.
fn retry_deferred_teardown(controller: &Arc<XHCI>, hub: &Arc<USBDevice>) {
    let pending: Vec<(u8, Arc<USBDevice>)> = {
        let state = hub.state();
        let Some(hub_state) = &state.hub else {
            return;
        };
        hub_state
            .children
            .iter()
            .enumerate()
            .filter_map(|(index, child)| {
                let child = child.as_ref()?;
                child
                    .destroy_pending()
                    .then(|| (index as u8 + 1, child.clone()))
            })
            .collect()
    };

    for (port, child) in pending {
        if controller.destroy_usb_device(&child) {
            let mut state = hub.state();
            if let Some(hub_state) = state.hub.as_mut() {
                hub_state.children[port as usize - 1] = None;
            }
        }
    }
}

fn service_hub(controller: &Arc<XHCI>, hub: &Arc<USBDevice>) {
    let actions = {
        let Some(mut state) = hub.try_state() else {
            return;
        };

        let Some(hub_state) = state.hub.as_mut() else {
            return;
        };

        if !hub_state.status_pending {
            submit_status_transfer(controller, &mut state);
            return;
        }

        let status_trb = hub_state.status_trb;
        let Some(completion) = controller.check_transfer_completion(status_trb) else {
            return;
        };

        state.hub.as_mut().unwrap().status_pending = false;
        if !completion.is_transfer_success() {
            warn!(HubDriver, "hub status transfer completion {completion:?}");
            return;
        }

        decode_port_changes(controller, &mut state)
    };

    for action in actions {
        match action {
            PortAction::Probe(port) => {
                if let Err(err) = probe_hub_port(controller, hub, port) {
                    warn!(HubDriver, "hub port {port} probe failed: {err}");
                }
            }
            PortAction::Destroy(port) => {
                let child = {
                    let state = hub.state();
                    state
                        .hub
                        .as_ref()
                        .and_then(|h| h.children[port as usize - 1].clone())
                };
                if let Some(child) = child {
                    debug!(HubDriver, "hub port {port} disconnected...");
                    if controller.destroy_usb_device(&child) {
                        let mut state = hub.state();
                        if let Some(hub_state) = state.hub.as_mut() {
                            hub_state.children[port as usize - 1] = None;
                        }
                    }
                }
            }
        }
    }
}

fn submit_status_transfer(controller: &XHCI, state: &mut UsbDeviceState) {
    let slot_id = state.slot_id;
    let Some(hub_state) = state.hub.as_mut() else {
        return;
    };
    let Some(endpoint) = hub_state.status_endpoint.upgrade() else {
        return;
    };

    let length = hub_state.interrupt_length as u32;
    let trb = endpoint.submit_normal_transfer(length, true);
    hub_state.status_trb = trb;
    hub_state.status_pending = true;
    controller.ring_endpoint_doorbell(slot_id, endpoint.dci());
}

/// Reads the change bitmap and turns every flagged port into an action,
/// clearing the change bits along the way.
fn decode_port_changes(controller: &XHCI, state: &mut UsbDeviceState) -> Vec<PortAction> {
    let mut actions = Vec::new();

    let (port_count, bitmap) = {
        let Some(hub_state) = state.hub.as_mut() else {
            return actions;
        };
        let Some(endpoint) = hub_state.status_endpoint.upgrade() else {
            return actions;
        };
        let mut bitmap = [0u8; 32];
        let len = (hub_state.interrupt_length as usize).min(bitmap.len());
        endpoint.read_data(&mut bitmap[..len]);
        (hub_state.port_count, bitmap)
    };

    for port in 1..=port_count {
        let byte = bitmap[port as usize / 8];
        if byte & (1 << (port % 8)) == 0 {
            continue;
        }

        let Ok(status) = get_port_status(controller, state, port) else {
            continue;
        };

        if status.change & HUB_PORT_CHANGE_CONNECTION != 0 {
            let _ = clear_port_feature(controller, state, port, HUB_FEATURE_C_PORT_CONNECTION);

            let has_child = state
                .hub
                .as_ref()
                .map(|h| h.children[port as usize - 1].is_some())
                .unwrap_or(false);

            if status.status & HUB_PORT_STATUS_CONNECTION != 0 {
                if !has_child {
                    actions.push(PortAction::Probe(port));
                }
            } else if has_child {
                actions.push(PortAction::Destroy(port));
            }
        }

        if status.change & HUB_PORT_CHANGE_ENABLE != 0 {
            let _ = clear_port_feature(controller, state, port, HUB_FEATURE_C_PORT_ENABLE);
        }
        if status.change & HUB_PORT_CHANGE_RESET != 0 {
            let _ = clear_port_feature(controller, state, port, HUB_FEATURE_C_PORT_RESET);
        }

        if let Some(hub_state) = state.hub.as_mut() {
            hub_state.port_status[port as usize - 1] = status.status;
        }
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_speed_from_status_bits() {
        let low = UsbPortStatus {
            status: HUB_PORT_STATUS_CONNECTION | HUB_PORT_STATUS_LOW_SPEED,
            change: 0,
        };
        assert_eq!(hub_port_speed(PortSpeed::High, &low), PortSpeed::Low);

        let high = UsbPortStatus {
            status: HUB_PORT_STATUS_CONNECTION | HUB_PORT_STATUS_HIGH_SPEED,
            change: 0,
        };
        assert_eq!(hub_port_speed(PortSpeed::High, &high), PortSpeed::High);

        // neither bit on a high-speed hub means a full-speed device
        let full = UsbPortStatus {
            status: HUB_PORT_STATUS_CONNECTION,
            change: 0,
        };
        assert_eq!(hub_port_speed(PortSpeed::High, &full), PortSpeed::Full);

        // superspeed hubs only carry superspeed children
        assert_eq!(hub_port_speed(PortSpeed::Super, &full), PortSpeed::Super);
    }

    #[test]
    fn route_string_nibbles() {
        // Mirrors the route computation in probe_hub_port: 4 bits per
        // hop, low nibble first.
        let hub_route = 0u32;
        let depth0_child = hub_route | ((3u32 & 0xF) << (4 * 0));
        assert_eq!(depth0_child, 0x3);

        let nested = depth0_child | ((2u32 & 0xF) << (4 * 1));
        assert_eq!(nested, 0x23);
    }
}
