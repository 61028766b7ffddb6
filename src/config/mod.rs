use regex::Regex;
use serde::{Deserialize, Serialize};

/// Input transport families. Each maps to one backend/dispatcher pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclType {
    Evdev,
    Hidraw,
    Libusb,
    Gatt,
    Midi,
}

impl DeclType {
    /// The udev subsystem that delivers hot-plug events for this transport,
    /// if it has one.
    pub fn subsystem(&self) -> Option<&'static str> {
        match self {
            DeclType::Evdev => Some("input"),
            DeclType::Hidraw => Some("hidraw"),
            DeclType::Libusb => Some("usb"),
            DeclType::Gatt | DeclType::Midi => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeclType::Evdev => "evdev",
            DeclType::Hidraw => "hidraw",
            DeclType::Libusb => "libusb",
            DeclType::Gatt => "gatt",
            DeclType::Midi => "midi",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Usb,
    Bluetooth,
    Pci,
}

impl BusKind {
    /// Kernel BUS_* constant.
    pub fn bustype(&self) -> u16 {
        match self {
            BusKind::Pci => 0x01,
            BusKind::Usb => 0x03,
            BusKind::Bluetooth => 0x05,
        }
    }
}

/// One `(event-type, event-code)` predicate, e.g. `{type="EV_KEY", code="KEY_A"}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CapabilityDecl {
    #[serde(rename = "type")]
    pub event_type: String,
    pub code: String,
}

fn default_interface() -> i32 {
    -1
}

/// Script-provided declaration of a desired input device.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputDecl {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: DeclType,
    #[serde(default)]
    pub vendor: u16,
    #[serde(default)]
    pub product: u16,
    #[serde(default)]
    pub bus: Option<BusKind>,
    #[serde(default = "default_interface")]
    pub interface: i32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phys: String,
    #[serde(default)]
    pub uniq: String,
    #[serde(default)]
    pub grab: bool,
    #[serde(default)]
    pub capabilities: Vec<CapabilityDecl>,
    #[serde(default)]
    pub service: u16,
    #[serde(default)]
    pub characteristic: u16,
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub on_event: String,
    #[serde(default)]
    pub on_state: String,
    /// Resolved at match time: a /dev node, a sysfs path, a D-Bus object
    /// path or a `midi:<Client:Port>` locator depending on the transport.
    #[serde(default)]
    pub devnode: String,
}

/// Virtual output device profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    Keyboard,
    Consumer,
    Mouse,
    Gamepad,
    Touchpad,
    TouchpadMt,
    Touchscreen,
    Digitizer,
}

fn default_out_vendor() -> u16 {
    0x1234
}

fn default_out_product() -> u16 {
    0x5678
}

fn default_out_version() -> u16 {
    1
}

/// Script-provided declaration of a virtual output device.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputDecl {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: OutputType,
    #[serde(default = "default_out_vendor")]
    pub vendor: u16,
    #[serde(default = "default_out_product")]
    pub product: u16,
    #[serde(default)]
    pub bus: Option<BusKind>,
    #[serde(default = "default_out_version")]
    pub version: u16,
    #[serde(default)]
    pub name: String,
    /// Extra event-code tokens enabled on top of the profile (e.g. "KEY_F13").
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Script global invoked when the virtual device receives an FF action.
    #[serde(default)]
    pub on_haptics: String,
}

impl OutputDecl {
    pub fn bustype(&self) -> u16 {
        self.bus.map(|b| b.bustype()).unwrap_or(0x03)
    }
}

/// Returns true if `s` should be treated as a regular expression.
///
/// The heuristic is intentionally permissive: a leading `^`, a trailing `$`,
/// or an embedded `.*` / `.+` marks the pattern as regex.
pub fn looks_like_regex(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    if s.starts_with('^') || s.ends_with('$') {
        return true;
    }
    s.contains(".*") || s.contains(".+")
}

/// Matches `value` against `pattern`.
///
/// Empty patterns match everything. Regex-looking patterns are compiled and
/// must match the whole value; a pattern that fails to compile falls back to
/// literal equality.
pub fn match_string(pattern: &str, value: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }

    if looks_like_regex(pattern) {
        // Whole-value match, like regex_match.
        return match Regex::new(&format!(r"\A(?:{pattern})\z")) {
            Ok(re) => re.is_match(value),
            Err(_) => pattern == value,
        };
    }

    pattern == value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pattern_matches_everything() {
        assert!(match_string("", "anything"));
        assert!(match_string("", ""));
    }

    #[test]
    fn literal_patterns_compare_exactly() {
        assert!(match_string("Logitech USB Receiver", "Logitech USB Receiver"));
        assert!(!match_string("Logitech", "Logitech USB Receiver"));
    }

    #[test]
    fn regex_detection() {
        assert!(looks_like_regex("^Logitech"));
        assert!(looks_like_regex("Receiver$"));
        assert!(looks_like_regex("Logi.*ech"));
        assert!(looks_like_regex("Logi.+ech"));
        assert!(!looks_like_regex("Logitech USB Receiver"));
        assert!(!looks_like_regex(""));
    }

    #[test]
    fn regex_patterns_must_match_whole_value() {
        assert!(match_string("^Logitech .*$", "Logitech USB Receiver"));
        assert!(!match_string("^Logitech .*$", "Corsair Keyboard"));
        assert!(match_string("Logi.* Receiver", "Logitech USB Receiver"));
        assert!(!match_string("^USB", "Logitech USB Receiver"));
    }

    #[test]
    fn invalid_regex_falls_back_to_literal() {
        assert!(match_string("^[", "^["));
        assert!(!match_string("^[", "anything"));
    }

    #[test]
    fn bus_kind_constants() {
        assert_eq!(BusKind::Usb.bustype(), 3);
        assert_eq!(BusKind::Bluetooth.bustype(), 5);
        assert_eq!(BusKind::Pci.bustype(), 1);
    }

    #[test]
    fn decl_type_subsystems() {
        assert_eq!(DeclType::Evdev.subsystem(), Some("input"));
        assert_eq!(DeclType::Hidraw.subsystem(), Some("hidraw"));
        assert_eq!(DeclType::Libusb.subsystem(), Some("usb"));
        assert_eq!(DeclType::Gatt.subsystem(), None);
        assert_eq!(DeclType::Midi.subsystem(), None);
    }
}
