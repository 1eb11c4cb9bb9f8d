//! Driver-command dispatch and the process-message bus contract.
//!
//! Every driver in the subsystem answers the same small command set; the
//! kernel's driver manager calls through [`KernelDriver`]. Enumeration
//! events that interest other processes (storage mounts) are broadcast on
//! the bus.

use alloc::string::String;

use alloc::vec::Vec;
use spin::Lazy;
use thiserror::Error;

use crate::drivers::pci::PciDeviceInfo;
use crate::storage::DiskId;
use crate::utils::locks::RwLock;

pub const fn make_version(major: u16, minor: u16) -> u32 {
    ((major as u32) << 16) | minor as u32
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    #[error("function not implemented")]
    NotImplemented,
    #[error("unexpected failure")]
    Unexpected,
    #[error("no permission")]
    NoPermission,
    #[error("bad parameter")]
    BadParameter,
    #[error("no such device")]
    NoDevice,
    #[error("timeout")]
    Timeout,
}

pub type DriverResult = Result<u32, DriverError>;

/// Cursor-driven device enumeration: the caller passes the index of the
/// next device it wants; the driver fills `summary` when one exists.
#[derive(Debug, Default)]
pub struct EnumNextRequest {
    pub index: u32,
    pub summary: Option<crate::drivers::xhci::UsbDeviceSummary>,
}

/// Human-oriented enumeration: the driver renders its device tree as JSON.
#[derive(Debug, Default)]
pub struct EnumPrettyRequest {
    pub output: String,
}

pub enum DriverCommand<'a> {
    Load,
    Unload,
    GetVersion,
    GetCaps,
    Probe(&'a PciDeviceInfo),
    EnumNext(&'a mut EnumNextRequest),
    EnumPretty(&'a mut EnumPrettyRequest),
}

pub trait KernelDriver: Send + Sync {
    fn name(&self) -> &'static str;
    fn command(&self, command: DriverCommand<'_>) -> DriverResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMessage {
    UsbMassStorageMounted { disk: DiskId },
    UsbMassStorageUnmounted { disk: DiskId },
}

pub trait BusListener: Send + Sync {
    fn on_message(&self, message: &BusMessage);
}

static BUS_LISTENERS: Lazy<RwLock<Vec<&'static dyn BusListener>>> =
    Lazy::new(|| RwLock::new(Vec::new()));

pub fn register_bus_listener(listener: &'static dyn BusListener) {
    BUS_LISTENERS.write().push(listener);
}

pub fn broadcast(message: BusMessage) {
    for listener in BUS_LISTENERS.read().iter() {
        listener.on_message(&message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::locks::Mutex;

    struct RecordingListener {
        messages: Mutex<Vec<BusMessage>>,
    }

    impl BusListener for RecordingListener {
        fn on_message(&self, message: &BusMessage) {
            self.messages.lock().push(*message);
        }
    }

    #[test]
    fn version_packing() {
        assert_eq!(make_version(1, 0), 0x0001_0000);
        assert_eq!(make_version(2, 7), 0x0002_0007);
    }

    #[test]
    fn broadcast_reaches_listeners() {
        crate::platform::test::setup();

        let listener: &'static RecordingListener = Box::leak(Box::new(RecordingListener {
            messages: Mutex::new(Vec::new()),
        }));
        register_bus_listener(listener);

        broadcast(BusMessage::UsbMassStorageMounted {
            disk: DiskId(3),
        });

        let messages = listener.messages.lock();
        assert!(messages
            .iter()
            .any(|m| *m == BusMessage::UsbMassStorageMounted { disk: DiskId(3) }));
    }
}
