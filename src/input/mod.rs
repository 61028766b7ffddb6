pub mod codes;
pub mod haptics;
pub mod manager;
pub mod source;
pub mod target;

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

use crate::config::InputDecl;

/// Key of a proxied force-feedback effect on a sink:
/// `(source output id, virtual effect id)`.
pub type SlotKey = (String, i16);

/// Haptics sink state of an attached input. Each slot holds the kernel
/// effect uploaded to the sink; dropping the handle erases it.
#[derive(Debug, Default)]
pub struct SinkHaptics {
    pub supported: bool,
    pub slots: HashMap<SlotKey, evdev::FFEffect>,
}

/// Transport-specific handle of an attached input.
pub enum BackendHandle {
    Evdev(evdev::Device),
    Hidraw(std::fs::File),
    Usb(source::usb::UsbHandle),
    Gatt(source::gatt::GattHandle),
    Midi(source::midi::MidiHandle),
}

/// Live runtime state of an attached input device.
pub struct InputCtx {
    /// The declaration it was matched from, with `devnode` resolved.
    pub decl: InputDecl,
    /// Backing fd, or -1 when the transport has no single fd (USB, GATT,
    /// MIDI).
    pub fd: RawFd,
    pub backend: BackendHandle,
    pub active: bool,
    /// Exclusive grab requested but not yet acquired; retried on each
    /// readable wake until it succeeds or the device detaches.
    pub grab_pending: bool,
    pub haptics: SinkHaptics,
}

impl InputCtx {
    pub fn id(&self) -> &str {
        &self.decl.id
    }
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("device id '{0}' is already attached")]
    Duplicate(String),
    #[error("no device matched the declaration")]
    NoMatch,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("usb: {0}")]
    Usb(#[from] rusb::Error),
    #[error("bus: {0}")]
    Bus(#[from] dbus::Error),
    #[error("midi: {0}")]
    Midi(String),
    #[error("{0}")]
    Failed(String),
}
