//! Kernel input-event devices.

use std::os::fd::{AsRawFd, RawFd};
use std::time::UNIX_EPOCH;

use evdev::{
    AbsoluteAxisCode, Device, EventType, FFEffectCode, KeyCode, LedCode, RelativeAxisCode,
    SoundCode, SwitchCode,
};
use nix::fcntl::{FcntlArg, OFlag};

use crate::config::{match_string, InputDecl};
use crate::input::codes;
use crate::input::manager;
use crate::input::{AttachError, BackendHandle, InputCtx, SinkHaptics};
use crate::runtime::reactor::{Owner, Readiness};
use crate::runtime::Rt;
use crate::script::{self, FrameEvent};

/// Checks the declaration's identity fields against evdev metadata.
pub fn ids_match(
    decl: &InputDecl,
    bustype: u16,
    vendor: u16,
    product: u16,
    name: &str,
    phys: &str,
    uniq: &str,
) -> bool {
    if let Some(bus) = decl.bus {
        if bus.bustype() != bustype {
            return false;
        }
    }
    if decl.vendor != 0 && decl.vendor != vendor {
        return false;
    }
    if decl.product != 0 && decl.product != product {
        return false;
    }
    if !decl.name.is_empty() && !match_string(&decl.name, name) {
        return false;
    }
    if !decl.phys.is_empty() && !match_string(&decl.phys, phys) {
        return false;
    }
    if !decl.uniq.is_empty() && !match_string(&decl.uniq, uniq) {
        return false;
    }
    true
}

fn has_code(device: &Device, ty: EventType, code: u16) -> bool {
    match ty {
        EventType::SYNCHRONIZATION => true,
        EventType::KEY => device
            .supported_keys()
            .map_or(false, |s| s.contains(KeyCode(code))),
        EventType::RELATIVE => device
            .supported_relative_axes()
            .map_or(false, |s| s.contains(RelativeAxisCode(code))),
        EventType::ABSOLUTE => device
            .supported_absolute_axes()
            .map_or(false, |s| s.contains(AbsoluteAxisCode(code))),
        EventType::SWITCH => device
            .supported_switches()
            .map_or(false, |s| s.contains(SwitchCode(code))),
        EventType::LED => device
            .supported_leds()
            .map_or(false, |s| s.contains(LedCode(code))),
        EventType::SOUND => device
            .supported_sounds()
            .map_or(false, |s| s.contains(SoundCode(code))),
        EventType::FORCEFEEDBACK => device
            .supported_ff()
            .map_or(false, |s| s.contains(FFEffectCode(code))),
        _ => false,
    }
}

fn device_matches(decl: &InputDecl, device: &Device) -> bool {
    let id = device.input_id();
    if !ids_match(
        decl,
        id.bus_type().0,
        id.vendor(),
        id.product(),
        device.name().unwrap_or(""),
        device.physical_path().unwrap_or(""),
        device.unique_name().unwrap_or(""),
    ) {
        return false;
    }

    // Every declared capability must be present.
    for cap in &decl.capabilities {
        let Some(ty) = codes::event_type_from_name(&cap.event_type) else {
            return false;
        };
        let code = codes::code_from_name(ty, &cap.code);
        if !has_code(device, ty, code) {
            return false;
        }
    }
    true
}

/// Enumerates the input subsystem and returns the first event node whose
/// metadata and capabilities satisfy the declaration.
pub fn match_device(decl: &InputDecl) -> Option<String> {
    crate::udev::enumerate_and_match("input", |dev| {
        let devnode = dev.devnode()?.to_string_lossy().to_string();
        if !devnode.contains("input/event") {
            return None;
        }
        let device = Device::open(&devnode).ok()?;
        if device_matches(decl, &device) {
            log::info!(
                "matched '{}' -> {devnode} ({})",
                decl.id,
                device.name().unwrap_or("")
            );
            Some(devnode)
        } else {
            None
        }
    })
}

/// Opens the node read-write non-blocking, records FF support, pends the
/// exclusive grab, and registers the fd with the reactor.
pub fn attach(rt: &Rt, devnode: &str, decl: InputDecl) -> Result<InputCtx, AttachError> {
    let mut device = Device::open(devnode)?;

    let raw_fd = device.as_raw_fd();
    nix::fcntl::fcntl(raw_fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .map_err(|e| AttachError::Failed(format!("set O_NONBLOCK on {devnode}: {e}")))?;

    let supported = device
        .supported_ff()
        .map(|ff| ff.iter().count() > 0)
        .unwrap_or(false);
    if supported {
        log::info!("haptics: sink '{}' supports FF", decl.id);
    }

    let mut grab_pending = false;
    if decl.grab {
        match device.grab() {
            Ok(()) => log::info!("grabbed {devnode} exclusively"),
            Err(e) => {
                log::debug!("grab {devnode} pending: {e}");
                grab_pending = true;
            }
        }
    }

    rt.state_mut().reactor.register(raw_fd, Owner::Evdev)?;
    log::info!("attached evdev '{}': {}", decl.id, device.name().unwrap_or(""));

    Ok(InputCtx {
        decl,
        fd: raw_fd,
        backend: BackendHandle::Evdev(device),
        active: true,
        grab_pending,
        haptics: SinkHaptics {
            supported,
            slots: Default::default(),
        },
    })
}

/// Ungrabs and unregisters. Dropping the context closes the device and
/// erases any sink effects still uploaded to it.
pub fn detach(rt: &Rt, ctx: &mut InputCtx) {
    if let BackendHandle::Evdev(device) = &mut ctx.backend {
        if ctx.decl.grab && !ctx.grab_pending {
            if let Err(e) = device.ungrab() {
                log::debug!("ungrab '{}': {e}", ctx.decl.id);
            }
        }
    }
    if ctx.fd >= 0 {
        rt.state_mut().reactor.unregister(ctx.fd);
    }
}

/// Reactor callback: drain events, accumulate frames, flush a batch to the
/// script on every SYN_REPORT.
pub fn handle_event(rt: &Rt, fd: RawFd, ready: Readiness) {
    if ready.is_gone() {
        if let Some(decl) = manager::detach_by_fd(rt, fd) {
            script::notify_state(rt, &decl, "remove");
        }
        return;
    }
    if !ready.readable {
        return;
    }

    let mut batches: Vec<(String, Vec<FrameEvent>)> = Vec::new();
    let mut failed = false;
    let id = {
        let mut state = rt.state_mut();
        let state = &mut *state;

        let Some(id) = state.fd_index.get(&fd).cloned() else {
            return;
        };
        let Some(ctx) = state.input_map.get_mut(&id) else {
            return;
        };
        let BackendHandle::Evdev(device) = &mut ctx.backend else {
            return;
        };

        // Grab is retried at the start of each readable wake until it
        // succeeds or the device goes away.
        if ctx.grab_pending {
            if device.grab().is_ok() {
                ctx.grab_pending = false;
                log::info!("grabbed '{}' exclusively", id);
            }
        }

        let mut drained: Vec<evdev::InputEvent> = Vec::new();
        loop {
            match device.fetch_events() {
                Ok(events) => {
                    let chunk: Vec<evdev::InputEvent> = events.collect();
                    if chunk.is_empty() {
                        break;
                    }
                    drained.extend(chunk);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("read '{}' failed: {e}", id);
                    failed = true;
                    break;
                }
            }
        }

        let on_event = ctx.decl.on_event.clone();
        let frame = state.frames.entry(id.clone()).or_default();
        for complete in accumulate(frame, drained) {
            if !on_event.is_empty() {
                batches.push((on_event.clone(), frame_payload(&id, &complete)));
            }
        }

        id
    };

    // Callbacks run with no registry borrow held. A callback may close the
    // device; remaining batches for it are then dropped.
    for (callback, batch) in batches {
        if !rt.state().input_map.contains_key(&id) {
            break;
        }
        script::call_with_payload(rt, &callback, &batch);
    }

    if failed {
        if let Some(decl) = manager::detach_by_fd(rt, fd) {
            script::notify_state(rt, &decl, "remove");
        }
    }
}

/// Appends drained events to the frame buffer and splits off one complete
/// frame per SYN_REPORT, each ending with its report marker. The buffer
/// retains only the events after the last report.
pub fn accumulate(
    frame: &mut Vec<evdev::InputEvent>,
    drained: Vec<evdev::InputEvent>,
) -> Vec<Vec<evdev::InputEvent>> {
    let mut complete = Vec::new();
    for event in drained {
        frame.push(event);
        if event.event_type() == EventType::SYNCHRONIZATION && event.code() == 0 {
            complete.push(std::mem::take(frame));
        }
    }
    complete
}

fn frame_payload(id: &str, frame: &[evdev::InputEvent]) -> Vec<FrameEvent> {
    frame
        .iter()
        .map(|event| {
            let ty = event.event_type();
            let (sec, usec) = match event.timestamp().duration_since(UNIX_EPOCH) {
                Ok(d) => (d.as_secs() as i64, d.subsec_micros() as i64),
                Err(_) => (0, 0),
            };
            FrameEvent {
                device: id.to_string(),
                event_type: codes::event_type_name(ty).to_string(),
                code: codes::code_name(ty, event.code()),
                value: event.value(),
                sec,
                usec,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeclType;

    fn decl() -> InputDecl {
        InputDecl {
            id: "kbd".into(),
            kind: DeclType::Evdev,
            vendor: 0,
            product: 0,
            bus: None,
            interface: -1,
            name: String::new(),
            phys: String::new(),
            uniq: String::new(),
            grab: false,
            capabilities: Vec::new(),
            service: 0,
            characteristic: 0,
            client: String::new(),
            port: String::new(),
            on_event: String::new(),
            on_state: String::new(),
            devnode: String::new(),
        }
    }

    #[test]
    fn wildcard_ids_match_anything() {
        let d = decl();
        assert!(ids_match(&d, 3, 0x046d, 0xc52b, "Some Device", "usb-1", ""));
    }

    #[test]
    fn vendor_product_filtering() {
        let mut d = decl();
        d.vendor = 0x046d;
        d.product = 0xc52b;
        assert!(ids_match(&d, 3, 0x046d, 0xc52b, "", "", ""));
        assert!(!ids_match(&d, 3, 0x046d, 0xc52c, "", "", ""));
        assert!(!ids_match(&d, 3, 0x1234, 0xc52b, "", "", ""));
    }

    #[test]
    fn bus_filtering() {
        let mut d = decl();
        d.bus = Some(crate::config::BusKind::Bluetooth);
        assert!(ids_match(&d, 5, 0, 0, "", "", ""));
        assert!(!ids_match(&d, 3, 0, 0, "", "", ""));
    }

    #[test]
    fn name_patterns_apply() {
        let mut d = decl();
        d.name = "^Logitech .*$".into();
        assert!(ids_match(&d, 3, 0, 0, "Logitech USB Receiver", "", ""));
        assert!(!ids_match(&d, 3, 0, 0, "Corsair Keyboard", "", ""));
    }

    fn key(code: u16, value: i32) -> evdev::InputEvent {
        evdev::InputEvent::new(EventType::KEY.0, code, value)
    }

    fn syn() -> evdev::InputEvent {
        evdev::InputEvent::new(EventType::SYNCHRONIZATION.0, 0, 0)
    }

    #[test]
    fn frames_flush_exactly_on_syn_report() {
        let mut frame = Vec::new();
        let complete = accumulate(&mut frame, vec![key(30, 1), syn()]);
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].len(), 2);
        assert_eq!(complete[0][1].event_type(), EventType::SYNCHRONIZATION);
        assert!(frame.is_empty());
    }

    #[test]
    fn partial_frames_stay_buffered() {
        let mut frame = Vec::new();
        assert!(accumulate(&mut frame, vec![key(30, 1), key(48, 1)]).is_empty());
        assert_eq!(frame.len(), 2);

        let complete = accumulate(&mut frame, vec![syn(), key(30, 0), syn()]);
        assert_eq!(complete.len(), 2);
        assert_eq!(complete[0].len(), 3);
        assert_eq!(complete[1].len(), 2);
        assert!(frame.is_empty());
    }

    #[test]
    fn no_syn_report_inside_a_flushed_frame_except_last() {
        let mut frame = Vec::new();
        let complete = accumulate(&mut frame, vec![key(30, 1), syn(), key(31, 1), syn()]);
        for batch in &complete {
            for event in &batch[..batch.len() - 1] {
                assert!(
                    !(event.event_type() == EventType::SYNCHRONIZATION && event.code() == 0)
                );
            }
        }
    }

    #[test]
    fn uniq_literal_match() {
        let mut d = decl();
        d.uniq = "aa:bb:cc:dd:ee:ff".into();
        assert!(ids_match(&d, 5, 0, 0, "", "", "aa:bb:cc:dd:ee:ff"));
        assert!(!ids_match(&d, 5, 0, 0, "", "", "11:22:33:44:55:66"));
    }
}
