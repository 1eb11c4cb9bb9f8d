//! USB wire formats: standard descriptors, request constants, and the
//! configuration-descriptor walker.

use alloc::vec::Vec;

use serde::Serialize;

use crate::drivers::xhci::contexts::DeviceEndpointType;
use crate::drivers::xhci::utils::XhciError;
use crate::warn;

pub const USB_DESCRIPTOR_DEVICE_TYPE: u16 = 1;
pub const USB_DESCRIPTOR_CONFIGURATION_TYPE: u16 = 2;
pub const USB_DESCRIPTOR_STRING_TYPE: u16 = 3;
pub const USB_DESCRIPTOR_INTERFACE_TYPE: u8 = 4;
pub const USB_DESCRIPTOR_ENDPOINT_TYPE: u8 = 5;
pub const USB_DESCRIPTOR_HUB_TYPE: u16 = 0x29;
pub const USB_DESCRIPTOR_SS_HUB_TYPE: u16 = 0x2A;

pub const REQUEST_GET_STATUS: u8 = 0;
pub const REQUEST_CLEAR_FEATURE: u8 = 1;
pub const REQUEST_SET_FEATURE: u8 = 3;
pub const REQUEST_SET_ADDRESS: u8 = 5;
pub const REQUEST_GET_DESCRIPTOR: u8 = 6;
pub const REQUEST_SET_CONFIGURATION: u8 = 9;

pub const HID_REQUEST_SET_IDLE: u8 = 0x0A;
pub const HID_REQUEST_SET_PROTOCOL: u8 = 0x0B;
pub const HID_PROTOCOL_BOOT: u16 = 0;

pub const USB_FEATURE_ENDPOINT_HALT: u16 = 0;

pub const USB_CLASS_HID: u8 = 0x03;
pub const USB_CLASS_MASS_STORAGE: u8 = 0x08;
pub const USB_CLASS_HUB: u8 = 0x09;

pub const HID_SUBCLASS_BOOT: u8 = 0x01;
pub const HID_PROTOCOL_KEYBOARD: u8 = 0x01;
pub const HID_PROTOCOL_MOUSE: u8 = 0x02;

pub const MASS_STORAGE_SUBCLASS_SCSI: u8 = 0x06;
pub const MASS_STORAGE_PROTOCOL_BULK_ONLY: u8 = 0x50;

/// Hub class port feature selectors (USB2 11.24.2).
pub const HUB_FEATURE_PORT_CONNECTION: u16 = 0;
pub const HUB_FEATURE_PORT_ENABLE: u16 = 1;
pub const HUB_FEATURE_PORT_RESET: u16 = 4;
pub const HUB_FEATURE_PORT_POWER: u16 = 8;
pub const HUB_FEATURE_C_PORT_CONNECTION: u16 = 16;
pub const HUB_FEATURE_C_PORT_ENABLE: u16 = 17;
pub const HUB_FEATURE_C_PORT_RESET: u16 = 20;

/// Hub port status bits (wPortStatus).
pub const HUB_PORT_STATUS_CONNECTION: u16 = 0x0001;
pub const HUB_PORT_STATUS_ENABLE: u16 = 0x0002;
pub const HUB_PORT_STATUS_RESET: u16 = 0x0010;
pub const HUB_PORT_STATUS_POWER: u16 = 0x0100;
pub const HUB_PORT_STATUS_LOW_SPEED: u16 = 0x0200;
pub const HUB_PORT_STATUS_HIGH_SPEED: u16 = 0x0400;

/// Hub port change bits (wPortChange).
pub const HUB_PORT_CHANGE_CONNECTION: u16 = 0x0001;
pub const HUB_PORT_CHANGE_ENABLE: u16 = 0x0002;
pub const HUB_PORT_CHANGE_RESET: u16 = 0x0010;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct UsbDescriptorHeader {
    pub b_length: u8,
    pub b_descriptor_type: u8,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[repr(C)]
pub struct UsbDeviceDescriptor {
    #[serde(skip)]
    pub b_length: u8,
    #[serde(skip)]
    pub b_descriptor_type: u8,
    pub bcd_usb: u16,
    pub b_device_class: u8,
    pub b_device_subclass: u8,
    pub b_device_protocol: u8,
    pub b_max_packet_size_0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub num_configurations: u8,
}

pub const USB_DEVICE_DESCRIPTOR_LENGTH: usize = 18;
const _: () = assert!(size_of::<UsbDeviceDescriptor>() == USB_DEVICE_DESCRIPTOR_LENGTH);

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct UsbConfigurationDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub w_total_length: u16,
    pub b_num_interfaces: u8,
    pub b_configuration_value: u8,
    pub i_configuration: u8,
    pub bm_attributes: u8,
    pub b_max_power: u8,
}

pub const USB_CONFIGURATION_DESCRIPTOR_LENGTH: usize = 9;
const _: () = assert!(size_of::<UsbConfigurationDescriptor>() == USB_CONFIGURATION_DESCRIPTOR_LENGTH);

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct UsbInterfaceDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_interface_number: u8,
    pub b_alternate_setting: u8,
    pub b_num_endpoints: u8,
    pub b_interface_class: u8,
    pub b_interface_subclass: u8,
    pub b_interface_protocol: u8,
    pub i_interface: u8,
}

const _: () = assert!(size_of::<UsbInterfaceDescriptor>() == 9);

#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed)]
pub struct UsbEndpointDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_endpoint_address: u8,
    pub bm_attributes: u8,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
}

pub const USB_ENDPOINT_DESCRIPTOR_LENGTH: usize = 7;
const _: () = assert!(size_of::<UsbEndpointDescriptor>() == USB_ENDPOINT_DESCRIPTOR_LENGTH);

pub const ENDPOINT_TRANSFER_CONTROL: u8 = 0;
pub const ENDPOINT_TRANSFER_ISOCH: u8 = 1;
pub const ENDPOINT_TRANSFER_BULK: u8 = 2;
pub const ENDPOINT_TRANSFER_INTERRUPT: u8 = 3;

impl UsbEndpointDescriptor {
    pub const fn endpoint_number(&self) -> u8 {
        self.b_endpoint_address & 0x0F
    }

    pub const fn direction_in(&self) -> bool {
        self.b_endpoint_address & 0x80 != 0
    }

    pub const fn transfer_type(&self) -> u8 {
        self.bm_attributes & 0x3
    }

    /// Device Context Index: `2 * endpoint + direction`, EP0 is DCI 1.
    pub const fn dci(&self) -> u8 {
        if self.endpoint_number() == 0 {
            1
        } else {
            self.endpoint_number() * 2 + self.direction_in() as u8
        }
    }

    /// Max packet size with the high (burst) bits masked off.
    pub fn max_packet_size(&self) -> u16 {
        self.w_max_packet_size & 0x7FF
    }

    pub const fn endpoint_type(&self) -> DeviceEndpointType {
        match (self.transfer_type(), self.direction_in()) {
            (ENDPOINT_TRANSFER_CONTROL, _) => DeviceEndpointType::ControlBI,
            (ENDPOINT_TRANSFER_ISOCH, false) => DeviceEndpointType::IsochOut,
            (ENDPOINT_TRANSFER_ISOCH, true) => DeviceEndpointType::IsochIn,
            (ENDPOINT_TRANSFER_BULK, false) => DeviceEndpointType::BulkOut,
            (ENDPOINT_TRANSFER_BULK, true) => DeviceEndpointType::BulkIn,
            (ENDPOINT_TRANSFER_INTERRUPT, false) => DeviceEndpointType::IntOut,
            (ENDPOINT_TRANSFER_INTERRUPT, true) => DeviceEndpointType::IntIn,
            _ => DeviceEndpointType::NA,
        }
    }
}

/// The 9-byte hub class descriptor prefix; only the port count matters to
/// this driver.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed)]
pub struct UsbHubDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_nbr_ports: u8,
    pub w_hub_characteristics: u16,
    pub b_pwr_on_2_pwr_good: u8,
    pub b_hub_contr_current: u8,
    pub device_removable: u8,
    pub port_pwr_ctrl_mask: u8,
}

pub const USB_HUB_DESCRIPTOR_LENGTH: usize = 9;
const _: () = assert!(size_of::<UsbHubDescriptor>() == USB_HUB_DESCRIPTOR_LENGTH);

/// GET_PORT_STATUS reply: status word then change word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct UsbPortStatus {
    pub status: u16,
    pub change: u16,
}

/// Configuration as a flat value object; the interface/endpoint tree hangs
/// off the device separately.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UsbConfiguration {
    pub value: u8,
    pub index: u8,
    pub attributes: u8,
    pub max_power: u8,
    pub num_interfaces: u8,
    pub total_length: u16,
}

/// One parsed interface with its endpoint descriptors.
#[derive(Debug, Clone, Default)]
pub struct ParsedInterface {
    pub descriptor: UsbInterfaceDescriptor,
    pub endpoints: Vec<UsbEndpointDescriptor>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedConfiguration {
    pub configuration: UsbConfiguration,
    pub interfaces: Vec<ParsedInterface>,
}

pub struct UsbDescriptorParser;

/// Walks a full configuration-descriptor buffer and builds the
/// configuration/interface/endpoint tree. Unknown descriptor types (HID,
/// class-specific) are skipped; a zero-length descriptor aborts the walk
/// since the buffer cannot advance past it.
pub fn parse_configuration(buffer: &[u8]) -> Result<ParsedConfiguration, XhciError> {
    if buffer.len() < USB_CONFIGURATION_DESCRIPTOR_LENGTH {
        return Err(XhciError::BadParameter);
    }

    let mut parsed = ParsedConfiguration::default();
    let mut offset = 0usize;

    while offset + 2 <= buffer.len() {
        let length = buffer[offset] as usize;
        let descriptor_type = buffer[offset + 1];

        if length == 0 {
            warn!(UsbDescriptorParser, "zero-length descriptor at offset {offset}");
            return Err(XhciError::BadParameter);
        }
        if offset + length > buffer.len() {
            break;
        }

        let bytes = &buffer[offset..offset + length];
        match descriptor_type {
            t if t == USB_DESCRIPTOR_CONFIGURATION_TYPE as u8 => {
                if length < USB_CONFIGURATION_DESCRIPTOR_LENGTH {
                    return Err(XhciError::BadParameter);
                }
                let raw: UsbConfigurationDescriptor =
                    unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast()) };
                parsed.configuration = UsbConfiguration {
                    value: raw.b_configuration_value,
                    index: raw.i_configuration,
                    attributes: raw.bm_attributes,
                    max_power: raw.b_max_power,
                    num_interfaces: raw.b_num_interfaces,
                    total_length: raw.w_total_length,
                };
            }
            USB_DESCRIPTOR_INTERFACE_TYPE => {
                if length < size_of::<UsbInterfaceDescriptor>() {
                    return Err(XhciError::BadParameter);
                }
                let descriptor: UsbInterfaceDescriptor =
                    unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast()) };
                // Alternate settings shadow the default; only alternate 0
                // contributes endpoints.
                if descriptor.b_alternate_setting == 0 {
                    parsed.interfaces.push(ParsedInterface {
                        descriptor,
                        endpoints: Vec::new(),
                    });
                }
            }
            USB_DESCRIPTOR_ENDPOINT_TYPE => {
                if length < USB_ENDPOINT_DESCRIPTOR_LENGTH {
                    return Err(XhciError::BadParameter);
                }
                let descriptor: UsbEndpointDescriptor =
                    unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast()) };
                if let Some(interface) = parsed.interfaces.last_mut() {
                    interface.endpoints.push(descriptor);
                }
            }
            _ => {}
        }

        offset += length;
    }

    if parsed.configuration.value == 0 && parsed.configuration.num_interfaces == 0 {
        return Err(XhciError::BadParameter);
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_config(buffer: &mut Vec<u8>, value: u8, interfaces: u8, total_length: u16) {
        buffer.extend_from_slice(&[
            9,
            2,
            total_length as u8,
            (total_length >> 8) as u8,
            interfaces,
            value,
            0,
            0xA0,
            50,
        ]);
    }

    fn push_interface(buffer: &mut Vec<u8>, number: u8, class: u8, endpoints: u8) {
        buffer.extend_from_slice(&[9, 4, number, 0, endpoints, class, 0, 0, 0]);
    }

    fn push_endpoint(buffer: &mut Vec<u8>, address: u8, attributes: u8, max_packet: u16) {
        buffer.extend_from_slice(&[
            7,
            5,
            address,
            attributes,
            max_packet as u8,
            (max_packet >> 8) as u8,
            10,
        ]);
    }

    #[test]
    fn parses_interfaces_and_endpoints() {
        let mut buffer = Vec::new();
        push_config(&mut buffer, 1, 2, 0);
        push_interface(&mut buffer, 0, USB_CLASS_HID, 1);
        push_endpoint(&mut buffer, 0x81, 0x03, 8);
        push_interface(&mut buffer, 1, USB_CLASS_MASS_STORAGE, 2);
        push_endpoint(&mut buffer, 0x82, 0x02, 512);
        push_endpoint(&mut buffer, 0x02, 0x02, 512);
        let total = buffer.len() as u16;
        buffer[2] = total as u8;
        buffer[3] = (total >> 8) as u8;

        let parsed = parse_configuration(&buffer).unwrap();
        assert_eq!(parsed.configuration.value, 1);
        assert_eq!(parsed.configuration.num_interfaces, 2);
        assert_eq!(parsed.interfaces.len(), 2);
        assert_eq!(parsed.interfaces[0].endpoints.len(), 1);
        assert_eq!(parsed.interfaces[1].endpoints.len(), 2);

        let int_in = &parsed.interfaces[0].endpoints[0];
        assert!(int_in.direction_in());
        assert_eq!(int_in.dci(), 3);
        assert_eq!(int_in.endpoint_type(), DeviceEndpointType::IntIn);

        let bulk_out = &parsed.interfaces[1].endpoints[1];
        assert!(!bulk_out.direction_in());
        assert_eq!(bulk_out.dci(), 4);
        assert_eq!(bulk_out.endpoint_type(), DeviceEndpointType::BulkOut);
    }

    #[test]
    fn skips_unknown_descriptors() {
        let mut buffer = Vec::new();
        push_config(&mut buffer, 1, 1, 0);
        push_interface(&mut buffer, 0, USB_CLASS_HID, 1);
        // a HID class descriptor between interface and endpoint
        buffer.extend_from_slice(&[9, 0x21, 0x11, 0x01, 0, 1, 0x22, 0x3F, 0]);
        push_endpoint(&mut buffer, 0x81, 0x03, 8);

        let parsed = parse_configuration(&buffer).unwrap();
        assert_eq!(parsed.interfaces.len(), 1);
        assert_eq!(parsed.interfaces[0].endpoints.len(), 1);
    }

    #[test]
    fn alternate_settings_do_not_duplicate_interfaces() {
        let mut buffer = Vec::new();
        push_config(&mut buffer, 1, 1, 0);
        push_interface(&mut buffer, 0, USB_CLASS_HID, 1);
        push_endpoint(&mut buffer, 0x81, 0x03, 8);
        // alternate setting 1 of interface 0
        buffer.extend_from_slice(&[9, 4, 0, 1, 1, USB_CLASS_HID, 0, 0, 0]);
        push_endpoint(&mut buffer, 0x81, 0x03, 16);

        let parsed = parse_configuration(&buffer).unwrap();
        assert_eq!(parsed.interfaces.len(), 1);
        assert_eq!(parsed.interfaces[0].endpoints.len(), 1);
        assert_eq!(parsed.interfaces[0].endpoints[0].max_packet_size(), 8);
    }

    #[test]
    fn rejects_zero_length_descriptor() {
        let mut buffer = Vec::new();
        push_config(&mut buffer, 1, 1, 0);
        buffer.extend_from_slice(&[0, 4]);

        assert!(parse_configuration(&buffer).is_err());
    }

    #[test]
    fn round_trips_descriptor_counts() {
        for (interface_count, endpoints_per_interface) in [(1usize, 1usize), (3, 2), (4, 0)] {
            let mut buffer = Vec::new();
            push_config(&mut buffer, 1, interface_count as u8, 0);
            for i in 0..interface_count {
                push_interface(&mut buffer, i as u8, 0xFF, endpoints_per_interface as u8);
                for e in 0..endpoints_per_interface {
                    push_endpoint(&mut buffer, 0x81 + e as u8, 0x02, 64);
                }
            }

            let parsed = parse_configuration(&buffer).unwrap();
            assert_eq!(parsed.interfaces.len(), interface_count);
            for interface in &parsed.interfaces {
                assert_eq!(interface.endpoints.len(), endpoints_per_interface);
            }
        }
    }
}
