//! Input-event dispatcher contract.
//!
//! The HID drivers produce key and mouse events; whoever owns the console
//! (terminal, compositor, test harness) registers sinks for them. Events
//! produced before a sink is installed are dropped.

use bitflags::bitflags;
use spin::Lazy;

use crate::utils::locks::RwLock;

/// A key transition, carried as the raw HID usage code so the consumer
/// decides about layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub usage: u8,
    pub pressed: bool,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MouseButtons: u8 {
        const LEFT = 1 << 0;
        const RIGHT = 1 << 1;
        const MIDDLE = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MouseEvent {
    pub buttons: MouseButtons,
    pub delta_x: i16,
    pub delta_y: i16,
}

pub trait KeyboardSink: Send + Sync {
    fn key_event(&self, event: KeyEvent);
}

pub trait MouseSink: Send + Sync {
    fn mouse_event(&self, event: MouseEvent);
}

struct Sinks {
    keyboard: Option<&'static dyn KeyboardSink>,
    mouse: Option<&'static dyn MouseSink>,
    /// Invoked for privileged key chords (Ctrl+F9).
    privileged_action: Option<fn()>,
}

static SINKS: Lazy<RwLock<Sinks>> = Lazy::new(|| {
    RwLock::new(Sinks {
        keyboard: None,
        mouse: None,
        privileged_action: None,
    })
});

pub fn set_keyboard_sink(sink: &'static dyn KeyboardSink) {
    SINKS.write().keyboard = Some(sink);
}

pub fn set_mouse_sink(sink: &'static dyn MouseSink) {
    SINKS.write().mouse = Some(sink);
}

pub fn set_privileged_action(action: fn()) {
    SINKS.write().privileged_action = Some(action);
}

pub fn dispatch_key_event(event: KeyEvent) {
    if let Some(sink) = SINKS.read().keyboard {
        sink.key_event(event);
    }
}

pub fn dispatch_mouse_event(event: MouseEvent) {
    if let Some(sink) = SINKS.read().mouse {
        sink.mouse_event(event);
    }
}

pub fn run_privileged_action() {
    let action = SINKS.read().privileged_action;
    if let Some(action) = action {
        action();
    }
}
