//! Virtual uinput output devices.
//!
//! Each declared output gets a uinput node with the event codes of its
//! profile plus any extra capability tokens, using the default absolute
//! ranges (sticks ±32767, triggers 0..255, positions 0..65535, tilt ±90,
//! hats ±1, five multitouch slots). FF-capable outputs double as haptics
//! sources.

use std::os::fd::{AsRawFd, RawFd};
use std::str::FromStr;

use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{
    AbsInfo, AbsoluteAxisCode, AttributeSet, BusType, FFEffectCode, InputEvent, InputId, KeyCode,
    MiscCode, PropType, RelativeAxisCode, SwitchCode, UinputAbsSetup,
};
use nix::fcntl::{FcntlArg, OFlag};

use crate::config::{OutputDecl, OutputType};
use crate::constants::FF_EFFECTS_MAX;
use crate::input::haptics;
use crate::runtime::Rt;

pub struct VirtualOutput {
    pub decl: OutputDecl,
    pub device: VirtualDevice,
    pub fd: RawFd,
}

const KEYBOARD_KEYS: &[KeyCode] = &[
    // Letters
    KeyCode::KEY_A, KeyCode::KEY_B, KeyCode::KEY_C, KeyCode::KEY_D, KeyCode::KEY_E,
    KeyCode::KEY_F, KeyCode::KEY_G, KeyCode::KEY_H, KeyCode::KEY_I, KeyCode::KEY_J,
    KeyCode::KEY_K, KeyCode::KEY_L, KeyCode::KEY_M, KeyCode::KEY_N, KeyCode::KEY_O,
    KeyCode::KEY_P, KeyCode::KEY_Q, KeyCode::KEY_R, KeyCode::KEY_S, KeyCode::KEY_T,
    KeyCode::KEY_U, KeyCode::KEY_V, KeyCode::KEY_W, KeyCode::KEY_X, KeyCode::KEY_Y,
    KeyCode::KEY_Z,
    // Numbers
    KeyCode::KEY_1, KeyCode::KEY_2, KeyCode::KEY_3, KeyCode::KEY_4, KeyCode::KEY_5,
    KeyCode::KEY_6, KeyCode::KEY_7, KeyCode::KEY_8, KeyCode::KEY_9, KeyCode::KEY_0,
    // Function keys
    KeyCode::KEY_F1, KeyCode::KEY_F2, KeyCode::KEY_F3, KeyCode::KEY_F4, KeyCode::KEY_F5,
    KeyCode::KEY_F6, KeyCode::KEY_F7, KeyCode::KEY_F8, KeyCode::KEY_F9, KeyCode::KEY_F10,
    KeyCode::KEY_F11, KeyCode::KEY_F12, KeyCode::KEY_F13, KeyCode::KEY_F14, KeyCode::KEY_F15,
    KeyCode::KEY_F16, KeyCode::KEY_F17, KeyCode::KEY_F18, KeyCode::KEY_F19, KeyCode::KEY_F20,
    KeyCode::KEY_F21, KeyCode::KEY_F22, KeyCode::KEY_F23, KeyCode::KEY_F24,
    // Modifiers
    KeyCode::KEY_LEFTSHIFT, KeyCode::KEY_RIGHTSHIFT, KeyCode::KEY_LEFTCTRL,
    KeyCode::KEY_RIGHTCTRL, KeyCode::KEY_LEFTALT, KeyCode::KEY_RIGHTALT,
    KeyCode::KEY_LEFTMETA, KeyCode::KEY_RIGHTMETA, KeyCode::KEY_CAPSLOCK,
    KeyCode::KEY_NUMLOCK, KeyCode::KEY_SCROLLLOCK,
    // Navigation / editing
    KeyCode::KEY_UP, KeyCode::KEY_DOWN, KeyCode::KEY_LEFT, KeyCode::KEY_RIGHT,
    KeyCode::KEY_HOME, KeyCode::KEY_END, KeyCode::KEY_PAGEUP, KeyCode::KEY_PAGEDOWN,
    KeyCode::KEY_INSERT, KeyCode::KEY_DELETE, KeyCode::KEY_BACKSPACE, KeyCode::KEY_ENTER,
    KeyCode::KEY_ESC, KeyCode::KEY_TAB, KeyCode::KEY_SPACE,
    // Punctuation row
    KeyCode::KEY_MINUS, KeyCode::KEY_EQUAL, KeyCode::KEY_LEFTBRACE, KeyCode::KEY_RIGHTBRACE,
    KeyCode::KEY_SEMICOLON, KeyCode::KEY_APOSTROPHE, KeyCode::KEY_GRAVE,
    KeyCode::KEY_BACKSLASH, KeyCode::KEY_COMMA, KeyCode::KEY_DOT, KeyCode::KEY_SLASH,
    // Keypad
    KeyCode::KEY_KPSLASH, KeyCode::KEY_KPASTERISK, KeyCode::KEY_KPMINUS, KeyCode::KEY_KPPLUS,
    KeyCode::KEY_KPENTER, KeyCode::KEY_KPDOT, KeyCode::KEY_KP0, KeyCode::KEY_KP1,
    KeyCode::KEY_KP2, KeyCode::KEY_KP3, KeyCode::KEY_KP4, KeyCode::KEY_KP5, KeyCode::KEY_KP6,
    KeyCode::KEY_KP7, KeyCode::KEY_KP8, KeyCode::KEY_KP9,
    // System
    KeyCode::KEY_SYSRQ, KeyCode::KEY_PAUSE, KeyCode::KEY_PRINT, KeyCode::KEY_MENU,
];

const CONSUMER_KEYS: &[KeyCode] = &[
    // Playback
    KeyCode::KEY_PLAY, KeyCode::KEY_PAUSE, KeyCode::KEY_PLAYPAUSE, KeyCode::KEY_STOP,
    KeyCode::KEY_RECORD, KeyCode::KEY_NEXTSONG, KeyCode::KEY_PREVIOUSSONG,
    KeyCode::KEY_FASTFORWARD, KeyCode::KEY_REWIND,
    // Volume
    KeyCode::KEY_VOLUMEUP, KeyCode::KEY_VOLUMEDOWN, KeyCode::KEY_MUTE,
    // Browser / navigation
    KeyCode::KEY_WWW, KeyCode::KEY_BACK, KeyCode::KEY_FORWARD, KeyCode::KEY_REFRESH,
    KeyCode::KEY_SEARCH, KeyCode::KEY_FAVORITES, KeyCode::KEY_HOMEPAGE,
    // Application launch
    KeyCode::KEY_EMAIL, KeyCode::KEY_CALC, KeyCode::KEY_COMPUTER, KeyCode::KEY_MEDIA,
    KeyCode::KEY_CHAT, KeyCode::KEY_PHONE,
    // Power
    KeyCode::KEY_POWER, KeyCode::KEY_SLEEP, KeyCode::KEY_WAKEUP,
    // Programmable
    KeyCode::KEY_PROG1, KeyCode::KEY_PROG2, KeyCode::KEY_PROG3, KeyCode::KEY_PROG4,
    // Multimedia
    KeyCode::KEY_CAMERA, KeyCode::KEY_VIDEO, KeyCode::KEY_AUDIO, KeyCode::KEY_CD,
    KeyCode::KEY_TUNER, KeyCode::KEY_MP3, KeyCode::KEY_DVD, KeyCode::KEY_RADIO,
    KeyCode::KEY_TV, KeyCode::KEY_VCR,
];

const MOUSE_BUTTONS: &[KeyCode] = &[
    KeyCode::BTN_LEFT, KeyCode::BTN_RIGHT, KeyCode::BTN_MIDDLE, KeyCode::BTN_SIDE,
    KeyCode::BTN_EXTRA, KeyCode::BTN_FORWARD, KeyCode::BTN_BACK, KeyCode::BTN_TASK,
];

const MOUSE_REL: &[RelativeAxisCode] = &[
    RelativeAxisCode::REL_X, RelativeAxisCode::REL_Y, RelativeAxisCode::REL_WHEEL,
    RelativeAxisCode::REL_HWHEEL, RelativeAxisCode::REL_WHEEL_HI_RES,
    RelativeAxisCode::REL_HWHEEL_HI_RES,
];

const GAMEPAD_BUTTONS: &[KeyCode] = &[
    KeyCode::BTN_SOUTH, KeyCode::BTN_EAST, KeyCode::BTN_NORTH, KeyCode::BTN_WEST,
    KeyCode::BTN_C, KeyCode::BTN_Z, KeyCode::BTN_TL, KeyCode::BTN_TR, KeyCode::BTN_TL2,
    KeyCode::BTN_TR2, KeyCode::BTN_SELECT, KeyCode::BTN_START, KeyCode::BTN_MODE,
    KeyCode::BTN_THUMBL, KeyCode::BTN_THUMBR,
];

const GAMEPAD_ABS: &[AbsoluteAxisCode] = &[
    AbsoluteAxisCode::ABS_X, AbsoluteAxisCode::ABS_Y, AbsoluteAxisCode::ABS_RX,
    AbsoluteAxisCode::ABS_RY, AbsoluteAxisCode::ABS_Z, AbsoluteAxisCode::ABS_RZ,
    AbsoluteAxisCode::ABS_HAT0X, AbsoluteAxisCode::ABS_HAT0Y,
];

const GAMEPAD_FF: &[FFEffectCode] = &[
    FFEffectCode::FF_RUMBLE, FFEffectCode::FF_PERIODIC, FFEffectCode::FF_SQUARE,
    FFEffectCode::FF_TRIANGLE, FFEffectCode::FF_SINE, FFEffectCode::FF_CONSTANT,
    FFEffectCode::FF_GAIN,
];

const TOUCHPAD_BUTTONS: &[KeyCode] = &[
    KeyCode::BTN_LEFT, KeyCode::BTN_RIGHT, KeyCode::BTN_TOUCH, KeyCode::BTN_TOOL_FINGER,
    KeyCode::BTN_TOOL_DOUBLETAP,
];

const TOUCHPAD_REL: &[RelativeAxisCode] = &[RelativeAxisCode::REL_X, RelativeAxisCode::REL_Y];

const TOUCHPAD_ABS: &[AbsoluteAxisCode] = &[
    AbsoluteAxisCode::ABS_X, AbsoluteAxisCode::ABS_Y, AbsoluteAxisCode::ABS_PRESSURE,
];

const TOUCHPAD_MT_BUTTONS: &[KeyCode] = &[
    KeyCode::BTN_LEFT, KeyCode::BTN_TOUCH, KeyCode::BTN_TOOL_FINGER,
    KeyCode::BTN_TOOL_DOUBLETAP, KeyCode::BTN_TOOL_TRIPLETAP,
];

const TOUCHPAD_MT_ABS: &[AbsoluteAxisCode] = &[
    AbsoluteAxisCode::ABS_X, AbsoluteAxisCode::ABS_Y, AbsoluteAxisCode::ABS_MT_SLOT,
    AbsoluteAxisCode::ABS_MT_POSITION_X, AbsoluteAxisCode::ABS_MT_POSITION_Y,
    AbsoluteAxisCode::ABS_MT_TRACKING_ID, AbsoluteAxisCode::ABS_MT_TOOL_TYPE,
    AbsoluteAxisCode::ABS_MT_PRESSURE,
];

const TOUCHSCREEN_KEYS: &[KeyCode] = &[KeyCode::BTN_TOUCH];

const TOUCHSCREEN_ABS: &[AbsoluteAxisCode] = &[
    AbsoluteAxisCode::ABS_X, AbsoluteAxisCode::ABS_Y, AbsoluteAxisCode::ABS_PRESSURE,
    AbsoluteAxisCode::ABS_MT_SLOT, AbsoluteAxisCode::ABS_MT_POSITION_X,
    AbsoluteAxisCode::ABS_MT_POSITION_Y, AbsoluteAxisCode::ABS_MT_TRACKING_ID,
];

const DIGITIZER_KEYS: &[KeyCode] = &[
    KeyCode::BTN_TOUCH, KeyCode::BTN_TOOL_PEN, KeyCode::BTN_STYLUS, KeyCode::BTN_STYLUS2,
];

const DIGITIZER_ABS: &[AbsoluteAxisCode] = &[
    AbsoluteAxisCode::ABS_X, AbsoluteAxisCode::ABS_Y, AbsoluteAxisCode::ABS_PRESSURE,
    AbsoluteAxisCode::ABS_TILT_X, AbsoluteAxisCode::ABS_TILT_Y, AbsoluteAxisCode::ABS_DISTANCE,
];

/// Default range for an absolute axis on a virtual device.
pub fn default_abs_info(kind: OutputType, code: AbsoluteAxisCode) -> AbsInfo {
    let stick = AbsInfo::new(0, -32767, 32767, 0, 0, 0);
    let trigger = AbsInfo::new(0, 0, 255, 0, 0, 0);
    let position = AbsInfo::new(0, 0, 65535, 0, 0, 0);
    let hat = AbsInfo::new(0, -1, 1, 0, 0, 0);

    if kind == OutputType::Gamepad
        && matches!(code, AbsoluteAxisCode::ABS_X | AbsoluteAxisCode::ABS_Y)
    {
        return stick;
    }

    match code {
        AbsoluteAxisCode::ABS_RX | AbsoluteAxisCode::ABS_RY => stick,
        AbsoluteAxisCode::ABS_X | AbsoluteAxisCode::ABS_Y => position,
        AbsoluteAxisCode::ABS_Z
        | AbsoluteAxisCode::ABS_RZ
        | AbsoluteAxisCode::ABS_THROTTLE
        | AbsoluteAxisCode::ABS_BRAKE
        | AbsoluteAxisCode::ABS_GAS
        | AbsoluteAxisCode::ABS_RUDDER => trigger,
        AbsoluteAxisCode::ABS_PRESSURE | AbsoluteAxisCode::ABS_MT_PRESSURE => position,
        AbsoluteAxisCode::ABS_TILT_X | AbsoluteAxisCode::ABS_TILT_Y => {
            AbsInfo::new(0, -90, 90, 0, 0, 0)
        }
        AbsoluteAxisCode::ABS_DISTANCE => AbsInfo::new(0, 0, 255, 0, 0, 0),
        AbsoluteAxisCode::ABS_MT_ORIENTATION => AbsInfo::new(0, 0, 3, 0, 0, 0),
        AbsoluteAxisCode::ABS_WHEEL => AbsInfo::new(0, -32768, 32767, 0, 0, 0),
        AbsoluteAxisCode::ABS_HAT0X
        | AbsoluteAxisCode::ABS_HAT0Y
        | AbsoluteAxisCode::ABS_HAT1X
        | AbsoluteAxisCode::ABS_HAT1Y
        | AbsoluteAxisCode::ABS_HAT2X
        | AbsoluteAxisCode::ABS_HAT2Y
        | AbsoluteAxisCode::ABS_HAT3X
        | AbsoluteAxisCode::ABS_HAT3Y => hat,
        AbsoluteAxisCode::ABS_MT_POSITION_X | AbsoluteAxisCode::ABS_MT_POSITION_Y => position,
        AbsoluteAxisCode::ABS_MT_SLOT => AbsInfo::new(0, 0, 4, 0, 0, 0),
        AbsoluteAxisCode::ABS_MT_TRACKING_ID => AbsInfo::new(0, -1, 65535, 0, 0, 0),
        AbsoluteAxisCode::ABS_MT_TOOL_TYPE => AbsInfo::new(0, 0, 2, 0, 0, 0),
        AbsoluteAxisCode::ABS_MT_TOUCH_MAJOR
        | AbsoluteAxisCode::ABS_MT_TOUCH_MINOR
        | AbsoluteAxisCode::ABS_MT_WIDTH_MAJOR
        | AbsoluteAxisCode::ABS_MT_WIDTH_MINOR => AbsInfo::new(0, 0, 255, 0, 0, 0),
        _ => position,
    }
}

struct CapabilitySets {
    keys: AttributeSet<KeyCode>,
    rel: AttributeSet<RelativeAxisCode>,
    abs: Vec<AbsoluteAxisCode>,
    msc: AttributeSet<MiscCode>,
    switches: AttributeSet<SwitchCode>,
    props: AttributeSet<PropType>,
    ff: AttributeSet<FFEffectCode>,
    has_keys: bool,
    has_rel: bool,
    has_msc: bool,
    has_switches: bool,
    has_props: bool,
    has_ff: bool,
}

impl CapabilitySets {
    fn new() -> Self {
        Self {
            keys: AttributeSet::new(),
            rel: AttributeSet::new(),
            abs: Vec::new(),
            msc: AttributeSet::new(),
            switches: AttributeSet::new(),
            props: AttributeSet::new(),
            ff: AttributeSet::new(),
            has_keys: false,
            has_rel: false,
            has_msc: false,
            has_switches: false,
            has_props: false,
            has_ff: false,
        }
    }

    fn add_keys(&mut self, keys: &[KeyCode]) {
        for key in keys {
            self.keys.insert(*key);
        }
        self.has_keys |= !keys.is_empty();
    }

    fn add_rel(&mut self, axes: &[RelativeAxisCode]) {
        for axis in axes {
            self.rel.insert(*axis);
        }
        self.has_rel |= !axes.is_empty();
    }

    fn add_abs(&mut self, axes: &[AbsoluteAxisCode]) {
        for axis in axes {
            if !self.abs.contains(axis) {
                self.abs.push(*axis);
            }
        }
    }

    fn add_prop(&mut self, prop: PropType) {
        self.props.insert(prop);
        self.has_props = true;
    }

    fn add_ff(&mut self, codes: &[FFEffectCode]) {
        for code in codes {
            self.ff.insert(*code);
        }
        self.has_ff |= !codes.is_empty();
    }

    /// Resolves one extra capability token by its code-name prefix.
    fn add_token(&mut self, token: &str) {
        if token.starts_with("KEY_") || token.starts_with("BTN_") {
            if let Ok(code) = KeyCode::from_str(token) {
                self.keys.insert(code);
                self.has_keys = true;
                return;
            }
        } else if token.starts_with("REL_") {
            if let Ok(code) = RelativeAxisCode::from_str(token) {
                self.rel.insert(code);
                self.has_rel = true;
                return;
            }
        } else if token.starts_with("ABS_") {
            if let Ok(code) = AbsoluteAxisCode::from_str(token) {
                self.add_abs(&[code]);
                return;
            }
        } else if token.starts_with("MSC_") {
            if let Ok(code) = MiscCode::from_str(token) {
                self.msc.insert(code);
                self.has_msc = true;
                return;
            }
        } else if token.starts_with("SW_") {
            if let Ok(code) = SwitchCode::from_str(token) {
                self.switches.insert(code);
                self.has_switches = true;
                return;
            }
        } else if token.starts_with("FF_") {
            if let Ok(code) = FFEffectCode::from_str(token) {
                self.ff.insert(code);
                self.has_ff = true;
                return;
            }
        }
        log::warn!("unknown capability token: {token}");
    }
}

fn profile_sets(decl: &OutputDecl) -> CapabilitySets {
    let mut sets = CapabilitySets::new();
    match decl.kind {
        OutputType::Keyboard => {
            sets.add_keys(KEYBOARD_KEYS);
            sets.msc.insert(MiscCode::MSC_SCAN);
            sets.has_msc = true;
        }
        OutputType::Consumer => sets.add_keys(CONSUMER_KEYS),
        OutputType::Mouse => {
            sets.add_keys(MOUSE_BUTTONS);
            sets.add_rel(MOUSE_REL);
        }
        OutputType::Gamepad => {
            sets.add_keys(GAMEPAD_BUTTONS);
            sets.add_abs(GAMEPAD_ABS);
            sets.add_ff(GAMEPAD_FF);
        }
        OutputType::Touchpad => {
            sets.add_keys(TOUCHPAD_BUTTONS);
            sets.add_rel(TOUCHPAD_REL);
            sets.add_abs(TOUCHPAD_ABS);
            sets.add_prop(PropType::POINTER);
        }
        OutputType::TouchpadMt => {
            sets.add_keys(TOUCHPAD_MT_BUTTONS);
            sets.add_abs(TOUCHPAD_MT_ABS);
            sets.add_prop(PropType::POINTER);
        }
        OutputType::Touchscreen => {
            sets.add_keys(TOUCHSCREEN_KEYS);
            sets.add_abs(TOUCHSCREEN_ABS);
            sets.add_prop(PropType::DIRECT);
        }
        OutputType::Digitizer => {
            sets.add_keys(DIGITIZER_KEYS);
            sets.add_abs(DIGITIZER_ABS);
            sets.add_prop(PropType::DIRECT);
        }
    }

    for token in &decl.capabilities {
        sets.add_token(token);
    }
    sets
}

fn create_output(decl: &OutputDecl) -> std::io::Result<(VirtualDevice, RawFd, bool)> {
    let sets = profile_sets(decl);
    let name = if decl.name.is_empty() {
        decl.id.clone()
    } else {
        decl.name.clone()
    };
    let id = InputId::new(
        BusType(decl.bustype()),
        decl.vendor,
        decl.product,
        decl.version,
    );

    let mut builder = VirtualDeviceBuilder::new()?.name(name.as_str()).input_id(id);
    if sets.has_keys {
        builder = builder.with_keys(&sets.keys)?;
    }
    if sets.has_rel {
        builder = builder.with_relative_axes(&sets.rel)?;
    }
    for code in &sets.abs {
        let setup = UinputAbsSetup::new(*code, default_abs_info(decl.kind, *code));
        builder = builder.with_absolute_axis(&setup)?;
    }
    if sets.has_msc {
        builder = builder.with_msc(&sets.msc)?;
    }
    if sets.has_switches {
        builder = builder.with_switches(&sets.switches)?;
    }
    if sets.has_props {
        builder = builder.with_properties(&sets.props)?;
    }
    if sets.has_ff {
        builder = builder
            .with_ff(&sets.ff)?
            .with_ff_effects_max(FF_EFFECTS_MAX);
    }

    let device = builder.build()?;

    // Non-blocking so the haptics dispatcher can drain FF requests from
    // the reactor.
    let fd = device.as_raw_fd();
    nix::fcntl::fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;

    Ok((device, fd, sets.has_ff))
}

/// Creates every declared output that does not exist yet. Virtual outputs
/// are created before inputs are attached so sinks can mirror uploads
/// immediately.
pub fn create_outputs(rt: &Rt) -> Result<(), String> {
    let decls: Vec<OutputDecl> = rt.state().output_decls.clone();
    for decl in decls {
        if decl.id.is_empty() || rt.state().outputs.contains_key(&decl.id) {
            continue;
        }

        match create_output(&decl) {
            Ok((device, fd, has_ff)) => {
                let mut state = rt.state_mut();
                let state = &mut *state;
                if has_ff {
                    if let Err(e) =
                        haptics::register_source(state, &decl.id, fd, &decl.on_haptics)
                    {
                        log::error!("register haptics source '{}': {e}", decl.id);
                    }
                }
                log::info!("created output '{}' ({:?})", decl.id, decl.kind);
                state
                    .outputs
                    .insert(decl.id.clone(), VirtualOutput { decl, device, fd });
            }
            Err(e) => log::error!("failed to create output '{}': {e}", decl.id),
        }
    }
    Ok(())
}

/// Writes one event to a virtual output. Without an explicit device the
/// event goes to the only output, or fails when that is ambiguous.
pub fn emit(
    rt: &Rt,
    device: Option<&str>,
    event_type: u16,
    code: u16,
    value: i32,
) -> Result<(), String> {
    let mut state = rt.state_mut();
    let event = InputEvent::new(event_type, code, value);

    let output = match device {
        Some(id) => state
            .outputs
            .get_mut(id)
            .ok_or_else(|| format!("unknown device id: {id}"))?,
        None => {
            if state.outputs.len() != 1 {
                return Err(
                    "emit requires 'device' when multiple output devices are present".into(),
                );
            }
            state.outputs.values_mut().next().unwrap()
        }
    };

    output.device.emit(&[event]).map_err(|e| e.to_string())
}

/// Writes a SYN_REPORT to one output, or to all of them.
pub fn syn_report(rt: &Rt, device: Option<&str>) -> Result<(), String> {
    let mut state = rt.state_mut();
    let syn = InputEvent::new(0, 0, 0);

    match device {
        Some(id) => {
            let output = state
                .outputs
                .get_mut(id)
                .ok_or_else(|| format!("unknown device id: {id}"))?;
            output.device.emit(&[syn]).map_err(|e| e.to_string())
        }
        None => {
            for output in state.outputs.values_mut() {
                if let Err(e) = output.device.emit(&[syn]) {
                    log::warn!("syn_report on '{}': {e}", output.decl.id);
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gamepad_sticks_are_signed() {
        let info = default_abs_info(OutputType::Gamepad, AbsoluteAxisCode::ABS_X);
        assert_eq!(info.minimum(), -32767);
        assert_eq!(info.maximum(), 32767);
        let info = default_abs_info(OutputType::Gamepad, AbsoluteAxisCode::ABS_RY);
        assert_eq!(info.minimum(), -32767);
    }

    #[test]
    fn touchscreen_positions_are_unsigned() {
        let info = default_abs_info(OutputType::Touchscreen, AbsoluteAxisCode::ABS_X);
        assert_eq!(info.minimum(), 0);
        assert_eq!(info.maximum(), 65535);
    }

    #[test]
    fn triggers_hats_and_slots() {
        let info = default_abs_info(OutputType::Gamepad, AbsoluteAxisCode::ABS_Z);
        assert_eq!((info.minimum(), info.maximum()), (0, 255));

        let info = default_abs_info(OutputType::Gamepad, AbsoluteAxisCode::ABS_HAT0X);
        assert_eq!((info.minimum(), info.maximum()), (-1, 1));

        let info = default_abs_info(OutputType::TouchpadMt, AbsoluteAxisCode::ABS_MT_SLOT);
        assert_eq!((info.minimum(), info.maximum()), (0, 4));

        let info = default_abs_info(OutputType::Digitizer, AbsoluteAxisCode::ABS_TILT_X);
        assert_eq!((info.minimum(), info.maximum()), (-90, 90));
    }

    #[test]
    fn capability_tokens_resolve_by_prefix() {
        let mut sets = CapabilitySets::new();
        sets.add_token("KEY_F13");
        sets.add_token("REL_WHEEL");
        sets.add_token("ABS_MISC");
        sets.add_token("FF_RUMBLE");
        assert!(sets.has_keys);
        assert!(sets.has_rel);
        assert!(sets.has_ff);
        assert_eq!(sets.abs, vec![AbsoluteAxisCode::ABS_MISC]);
    }

    #[test]
    fn gamepad_profile_is_ff_capable() {
        let decl = OutputDecl {
            id: "pad".into(),
            kind: OutputType::Gamepad,
            vendor: 0x1234,
            product: 0x5678,
            bus: None,
            version: 1,
            name: String::new(),
            capabilities: Vec::new(),
            on_haptics: String::new(),
        };
        let sets = profile_sets(&decl);
        assert!(sets.has_ff);
        assert!(!sets.has_rel);
        assert!(sets.abs.contains(&AbsoluteAxisCode::ABS_HAT0Y));
    }

    #[test]
    fn keyboard_profile_has_scan_codes() {
        let decl = OutputDecl {
            id: "kbd".into(),
            kind: OutputType::Keyboard,
            vendor: 0x1234,
            product: 0x5678,
            bus: None,
            version: 1,
            name: String::new(),
            capabilities: vec!["KEY_COFFEE".into()],
            on_haptics: String::new(),
        };
        let sets = profile_sets(&decl);
        assert!(sets.has_msc);
        assert!(sets.keys.contains(KeyCode::KEY_COFFEE));
        assert!(!sets.has_ff);
    }
}
