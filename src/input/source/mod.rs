pub mod evdev;
pub mod gatt;
pub mod hidraw;
pub mod midi;
pub mod usb;
