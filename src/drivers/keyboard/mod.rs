//! Keyboard support: the HID boot-protocol usage table shared by the USB
//! keyboard driver, and the modifier bookkeeping.

pub mod usb_kbd;

pub use usb_kbd::{initialize, on_xhci_interrupt};

use bitflags::bitflags;
use int_enum::IntEnum;

/// HID boot keyboard usage codes this kernel knows how to route. Unknown
/// usages are logged once and dropped.
#[repr(u8)]
#[derive(IntEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbKeyUsage {
    Null = 0x00, // Reserved

    KeyA = 0x04,
    KeyB = 0x05,
    KeyC = 0x06,
    KeyD = 0x07,
    KeyE = 0x08,
    KeyF = 0x09,
    KeyG = 0x0A,
    KeyH = 0x0B,
    KeyI = 0x0C,
    KeyJ = 0x0D,
    KeyK = 0x0E,
    KeyL = 0x0F,
    KeyM = 0x10,
    KeyN = 0x11,
    KeyO = 0x12,
    KeyP = 0x13,
    KeyQ = 0x14,
    KeyR = 0x15,
    KeyS = 0x16,
    KeyT = 0x17,
    KeyU = 0x18,
    KeyV = 0x19,
    KeyW = 0x1A,
    KeyX = 0x1B,
    KeyY = 0x1C,
    KeyZ = 0x1D,

    Key1 = 0x1E,
    Key2 = 0x1F,
    Key3 = 0x20,
    Key4 = 0x21,
    Key5 = 0x22,
    Key6 = 0x23,
    Key7 = 0x24,
    Key8 = 0x25,
    Key9 = 0x26,
    Key0 = 0x27,

    Return = 0x28,
    Esc = 0x29,
    Backspace = 0x2A,
    Tab = 0x2B,
    Space = 0x2C,
    Minus = 0x2D,
    Equals = 0x2E,
    LeftBrace = 0x2F,
    RightBrace = 0x30,
    BackSlash = 0x31,
    Semicolon = 0x33,
    Quote = 0x34,
    BackQuote = 0x35,
    Comma = 0x36,
    Dot = 0x37,
    Slash = 0x38,
    CapsLock = 0x39,

    F1 = 0x3A,
    F2 = 0x3B,
    F3 = 0x3C,
    F4 = 0x3D,
    F5 = 0x3E,
    F6 = 0x3F,
    F7 = 0x40,
    F8 = 0x41,
    F9 = 0x42,
    F10 = 0x43,
    F11 = 0x44,
    F12 = 0x45,
    PrintScr = 0x46,

    Insert = 0x49,
    Home = 0x4A,
    PageUp = 0x4B,
    Delete = 0x4C,
    End = 0x4D,
    PageDown = 0x4E,
    Right = 0x4F,
    Left = 0x50,
    Down = 0x51,
    Up = 0x52,

    LeftCtrl = 0xE0,
    LeftShift = 0xE1,
    LeftAlt = 0xE2,
    LeftSuper = 0xE3,
    RightCtrl = 0xE4,
    RightShift = 0xE5,
    RightAlt = 0xE6,
    RightSuper = 0xE7,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UsbKeyModifiers: u8 {
        const LEFT_CTRL = 1 << 0;
        const LEFT_SHIFT = 1 << 1;
        const LEFT_ALT = 1 << 2;
        const LEFT_SUPER = 1 << 3;
        const RIGHT_CTRL = 1 << 4;
        const RIGHT_SHIFT = 1 << 5;
        const RIGHT_ALT = 1 << 6;
        const RIGHT_SUPER = 1 << 7;
    }
}

impl UsbKeyModifiers {
    pub const fn ctrl_pressed(&self) -> bool {
        self.contains(Self::LEFT_CTRL) || self.contains(Self::RIGHT_CTRL)
    }
}

/// The synthetic usage code reported for each modifier bit, bit 0 first.
pub const MODIFIER_USAGES: [u8; 8] = [
    UsbKeyUsage::LeftCtrl as u8,
    UsbKeyUsage::LeftShift as u8,
    UsbKeyUsage::LeftAlt as u8,
    UsbKeyUsage::LeftSuper as u8,
    UsbKeyUsage::RightCtrl as u8,
    UsbKeyUsage::RightShift as u8,
    UsbKeyUsage::RightAlt as u8,
    UsbKeyUsage::RightSuper as u8,
];
