use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::drivers::xhci::usb::{UsbEndpointDescriptor, UsbInterfaceDescriptor};
use crate::drivers::xhci::usb_endpoint::USBEndpoint;
use crate::drivers::xhci::utils::XhciError;

/// One interface of the selected configuration, parenting its endpoints.
/// Class drivers hold `Arc` shares of the interface and the endpoints they
/// use; those shares are what keeps the subtree alive across hot-unplug.
#[derive(Debug)]
pub struct USBInterface {
    descriptor: UsbInterfaceDescriptor,
    endpoints: Vec<Arc<USBEndpoint>>,
}

impl USBInterface {
    pub fn new(
        descriptor: UsbInterfaceDescriptor,
        endpoint_descs: &[UsbEndpointDescriptor],
        slot_id: u8,
    ) -> Result<Self, XhciError> {
        let mut endpoints = Vec::with_capacity(endpoint_descs.len());
        for endpoint_desc in endpoint_descs {
            endpoints.push(Arc::new(USBEndpoint::create(*endpoint_desc, slot_id)?));
        }

        Ok(Self {
            descriptor,
            endpoints,
        })
    }

    pub const fn desc(&self) -> &UsbInterfaceDescriptor {
        &self.descriptor
    }

    pub const fn interface_number(&self) -> u8 {
        self.descriptor.b_interface_number
    }

    pub fn endpoints(&self) -> &[Arc<USBEndpoint>] {
        &self.endpoints
    }

    pub fn matches_class(&self, class: u8, subclass: u8, protocol: u8) -> bool {
        self.descriptor.b_interface_class == class
            && self.descriptor.b_interface_subclass == subclass
            && self.descriptor.b_interface_protocol == protocol
    }

    /// First endpoint with the given transfer type and direction.
    pub fn find_endpoint(&self, transfer_type: u8, direction_in: bool) -> Option<Arc<USBEndpoint>> {
        self.endpoints
            .iter()
            .find(|endpoint| {
                endpoint.desc().transfer_type() == transfer_type
                    && endpoint.desc().direction_in() == direction_in
            })
            .cloned()
    }
}
