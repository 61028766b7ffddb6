/// Program name used for default MIDI client names and log prefixes.
pub const PROGRAM: &str = "aelkey";

/// Environment variable that permits running as root when set non-empty.
pub const ALLOW_ROOT_ENV: &str = "AELKEY_ALLOW_ROOT";

/// Maximum bytes read from a hidraw device per wake-up.
pub const HIDRAW_READ_MAX: usize = 4096;

/// Maximum size of a HID feature report or input report read.
pub const HID_REPORT_MAX: usize = 256;

/// Capacity of each MIDI SPSC ring in bytes.
pub const MIDI_RING_BYTES: usize = 64 * 1024;

/// Interval of the MIDI ring drain tick in milliseconds.
pub const MIDI_DRAIN_MS: u64 = 8;

/// Timeout for synchronous D-Bus method calls.
pub const BUS_CALL_TIMEOUT_MS: u64 = 5000;

/// Number of force-feedback effect slots advertised by virtual gamepads.
pub const FF_EFFECTS_MAX: u32 = 16;
