//! Symbolic names for kernel event types and codes.
//!
//! Declarations and the script surface refer to events by name ("EV_KEY",
//! "KEY_A"); the kernel speaks numeric pairs. Unknown names resolve to zero.

use std::str::FromStr;

use evdev::{
    AbsoluteAxisCode, EventType, FFEffectCode, KeyCode, LedCode, MiscCode, RelativeAxisCode,
    SoundCode, SwitchCode,
};

/// Resolves an "EV_*" name to an event type.
pub fn event_type_from_name(name: &str) -> Option<EventType> {
    match name {
        "EV_SYN" => Some(EventType::SYNCHRONIZATION),
        "EV_KEY" => Some(EventType::KEY),
        "EV_REL" => Some(EventType::RELATIVE),
        "EV_ABS" => Some(EventType::ABSOLUTE),
        "EV_MSC" => Some(EventType::MISC),
        "EV_SW" => Some(EventType::SWITCH),
        "EV_LED" => Some(EventType::LED),
        "EV_SND" => Some(EventType::SOUND),
        "EV_REP" => Some(EventType::REPEAT),
        "EV_FF" => Some(EventType::FORCEFEEDBACK),
        "EV_PWR" => Some(EventType::POWER),
        "EV_FF_STATUS" => Some(EventType::FORCEFEEDBACKSTATUS),
        _ => None,
    }
}

/// Returns the "EV_*" name of an event type.
pub fn event_type_name(ty: EventType) -> &'static str {
    match ty {
        EventType::SYNCHRONIZATION => "EV_SYN",
        EventType::KEY => "EV_KEY",
        EventType::RELATIVE => "EV_REL",
        EventType::ABSOLUTE => "EV_ABS",
        EventType::MISC => "EV_MSC",
        EventType::SWITCH => "EV_SW",
        EventType::LED => "EV_LED",
        EventType::SOUND => "EV_SND",
        EventType::REPEAT => "EV_REP",
        EventType::FORCEFEEDBACK => "EV_FF",
        EventType::POWER => "EV_PWR",
        EventType::FORCEFEEDBACKSTATUS => "EV_FF_STATUS",
        EventType::UINPUT => "EV_UINPUT",
        _ => "",
    }
}

/// Resolves a code name within the given event type. Unknown names are zero.
pub fn code_from_name(ty: EventType, name: &str) -> u16 {
    match ty {
        EventType::SYNCHRONIZATION => match name {
            "SYN_REPORT" => 0,
            "SYN_CONFIG" => 1,
            "SYN_MT_REPORT" => 2,
            "SYN_DROPPED" => 3,
            _ => 0,
        },
        EventType::KEY => KeyCode::from_str(name).map(|c| c.0).unwrap_or(0),
        EventType::RELATIVE => RelativeAxisCode::from_str(name).map(|c| c.0).unwrap_or(0),
        EventType::ABSOLUTE => AbsoluteAxisCode::from_str(name).map(|c| c.0).unwrap_or(0),
        EventType::MISC => MiscCode::from_str(name).map(|c| c.0).unwrap_or(0),
        EventType::SWITCH => SwitchCode::from_str(name).map(|c| c.0).unwrap_or(0),
        EventType::LED => LedCode::from_str(name).map(|c| c.0).unwrap_or(0),
        EventType::SOUND => SoundCode::from_str(name).map(|c| c.0).unwrap_or(0),
        EventType::FORCEFEEDBACK => FFEffectCode::from_str(name).map(|c| c.0).unwrap_or(0),
        _ => 0,
    }
}

/// Returns the symbolic name of a code within the given event type, falling
/// back to the decimal value for codes without one.
pub fn code_name(ty: EventType, code: u16) -> String {
    match ty {
        EventType::SYNCHRONIZATION => match code {
            0 => "SYN_REPORT".to_string(),
            1 => "SYN_CONFIG".to_string(),
            2 => "SYN_MT_REPORT".to_string(),
            3 => "SYN_DROPPED".to_string(),
            _ => code.to_string(),
        },
        EventType::KEY => format!("{:?}", KeyCode(code)),
        EventType::RELATIVE => format!("{:?}", RelativeAxisCode(code)),
        EventType::ABSOLUTE => format!("{:?}", AbsoluteAxisCode(code)),
        EventType::MISC => format!("{:?}", MiscCode(code)),
        EventType::SWITCH => format!("{:?}", SwitchCode(code)),
        EventType::LED => format!("{:?}", LedCode(code)),
        EventType::SOUND => format!("{:?}", SoundCode(code)),
        EventType::FORCEFEEDBACK => format!("{:?}", FFEffectCode(code)),
        _ => code.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names_round_trip() {
        for name in ["EV_SYN", "EV_KEY", "EV_REL", "EV_ABS", "EV_MSC", "EV_FF"] {
            let ty = event_type_from_name(name).unwrap();
            assert_eq!(event_type_name(ty), name);
        }
        assert!(event_type_from_name("EV_BOGUS").is_none());
    }

    #[test]
    fn key_codes_round_trip() {
        let code = code_from_name(EventType::KEY, "KEY_A");
        assert_eq!(code, KeyCode::KEY_A.0);
        assert_eq!(code_name(EventType::KEY, code), "KEY_A");

        let code = code_from_name(EventType::KEY, "BTN_SOUTH");
        assert_eq!(code, KeyCode::BTN_SOUTH.0);
    }

    #[test]
    fn unknown_code_names_resolve_to_zero() {
        assert_eq!(code_from_name(EventType::KEY, "KEY_NOT_A_KEY"), 0);
        assert_eq!(code_from_name(EventType::ABSOLUTE, "garbage"), 0);
    }

    #[test]
    fn syn_report_is_zero() {
        assert_eq!(code_from_name(EventType::SYNCHRONIZATION, "SYN_REPORT"), 0);
        assert_eq!(code_name(EventType::SYNCHRONIZATION, 0), "SYN_REPORT");
    }

    #[test]
    fn abs_and_rel_names() {
        assert_eq!(
            code_from_name(EventType::ABSOLUTE, "ABS_HAT0X"),
            AbsoluteAxisCode::ABS_HAT0X.0
        );
        assert_eq!(
            code_name(EventType::RELATIVE, RelativeAxisCode::REL_WHEEL.0),
            "REL_WHEEL"
        );
    }

    #[test]
    fn ff_effect_names() {
        assert_eq!(
            code_from_name(EventType::FORCEFEEDBACK, "FF_RUMBLE"),
            FFEffectCode::FF_RUMBLE.0
        );
        assert_eq!(
            code_name(EventType::FORCEFEEDBACK, FFEffectCode::FF_RUMBLE.0),
            "FF_RUMBLE"
        );
    }
}
