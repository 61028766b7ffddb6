//! Force-feedback routing between virtual sources and physical sinks.
//!
//! Sources are FF-capable virtual outputs written by games. Uploads are
//! normalized, mirrored into the source record, and fanned out to every
//! active sink that supports FF; play/stop drives the mapped sink effects
//! and the source's script callback. Every sink slot holds the kernel
//! effect handle; dropping it erases the effect.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;

use evdev::{EventSummary, FFEffectData, FFEffectKind, UInputCode};
use serde::Serialize;

use crate::input::{BackendHandle, InputCtx, SlotKey};
use crate::runtime::reactor::{Owner, Readiness};
use crate::runtime::{Rt, State};
use crate::script;

/// Virtual output acting as an FF source.
pub struct HapticsSource {
    pub id: String,
    pub fd: RawFd,
    /// Script global invoked on play/stop, optional.
    pub callback: String,
    /// Normalized effects uploaded by the writer, keyed by virtual id.
    pub effects: HashMap<i16, FFEffectData>,
}

/// Effect snapshot delivered to the script.
#[derive(Debug, Serialize)]
pub struct EffectPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub length: u16,
    pub delay: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strong: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weak: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waveform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub magnitude: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<i16>,
}

#[derive(Debug, Serialize)]
pub struct HapticsEventPayload {
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: i16,
    pub value: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect: Option<EffectPayload>,
}

/// Registers a virtual output's fd as an FF source.
pub fn register_source(
    state: &mut State,
    id: &str,
    fd: RawFd,
    callback: &str,
) -> io::Result<()> {
    state.reactor.register(fd, Owner::Haptics)?;
    state.sources.insert(
        id.to_string(),
        HapticsSource {
            id: id.to_string(),
            fd,
            callback: callback.to_string(),
            effects: HashMap::new(),
        },
    );
    log::info!("haptics: registered source '{id}' (fd={fd})");
    Ok(())
}

/// Normalizes an uploaded effect. Rumble, periodic and constant pass
/// through; anything else becomes a mid-magnitude rumble. A zero replay
/// length defaults to 250 ms.
pub fn normalize_effect(effect: FFEffectData) -> FFEffectData {
    let mut normalized = effect;
    match normalized.kind {
        FFEffectKind::Rumble { .. }
        | FFEffectKind::Periodic { .. }
        | FFEffectKind::Constant { .. } => {}
        _ => {
            normalized.kind = FFEffectKind::Rumble {
                strong_magnitude: 0x4000,
                weak_magnitude: 0x4000,
            };
        }
    }
    if normalized.replay.length == 0 {
        normalized.replay.length = 250;
    }
    normalized
}

/// Builds the script-facing snapshot of a normalized effect.
pub fn effect_payload(effect: &FFEffectData) -> EffectPayload {
    let mut payload = EffectPayload {
        kind: String::new(),
        length: effect.replay.length,
        delay: effect.replay.delay,
        strong: None,
        weak: None,
        waveform: None,
        magnitude: None,
        offset: None,
        phase: None,
        period: None,
        level: None,
    };

    match effect.kind {
        FFEffectKind::Rumble {
            strong_magnitude,
            weak_magnitude,
        } => {
            payload.kind = "rumble".to_string();
            payload.strong = Some(strong_magnitude);
            payload.weak = Some(weak_magnitude);
        }
        FFEffectKind::Periodic {
            waveform,
            period,
            magnitude,
            offset,
            phase,
            ..
        } => {
            payload.kind = "periodic".to_string();
            payload.waveform = Some(format!("{waveform:?}").to_lowercase());
            payload.period = Some(period);
            payload.magnitude = Some(magnitude);
            payload.offset = Some(offset);
            payload.phase = Some(phase);
        }
        FFEffectKind::Constant { level, .. } => {
            payload.kind = "constant".to_string();
            payload.level = Some(level);
        }
        _ => {
            payload.kind = "rumble".to_string();
        }
    }
    payload
}

/// Uploads a sink-local copy of the effect and records the slot. A full
/// sink has its slots purged wholesale and the upload retried once; a
/// second failure drops the effect on that sink only.
fn upload_to_sink(ctx: &mut InputCtx, key: SlotKey, data: FFEffectData) {
    let InputCtx {
        backend, haptics, ..
    } = ctx;
    let BackendHandle::Evdev(device) = backend else {
        return;
    };

    match device.upload_ff_effect(data) {
        Ok(effect) => {
            haptics.slots.insert(key, effect);
        }
        Err(e) if e.raw_os_error() == Some(libc::ENOSPC) => {
            log::debug!("haptics: sink full, purging {} slots", haptics.slots.len());
            haptics.slots.clear();
            match device.upload_ff_effect(data) {
                Ok(effect) => {
                    haptics.slots.insert(key, effect);
                }
                Err(e) => log::warn!("haptics: upload retry failed: {e}"),
            }
        }
        Err(e) => log::warn!("haptics: upload failed: {e}"),
    }
}

fn upload_to_sinks(
    input_map: &mut HashMap<String, InputCtx>,
    source_id: &str,
    virt_id: i16,
    data: FFEffectData,
) {
    for ctx in input_map.values_mut() {
        if !ctx.active || !ctx.haptics.supported {
            continue;
        }
        upload_to_sink(ctx, (source_id.to_string(), virt_id), data);
    }
}

/// Removes the slot from every sink; dropping the handle issues the
/// kernel-side erase.
fn erase_slots(input_map: &mut HashMap<String, InputCtx>, source_id: &str, virt_id: i16) {
    let key: SlotKey = (source_id.to_string(), virt_id);
    for ctx in input_map.values_mut() {
        ctx.haptics.slots.remove(&key);
    }
}

fn play_on_sinks(
    input_map: &mut HashMap<String, InputCtx>,
    source_id: &str,
    virt_id: i16,
    value: i32,
) {
    let key: SlotKey = (source_id.to_string(), virt_id);
    for ctx in input_map.values_mut() {
        let Some(effect) = ctx.haptics.slots.get_mut(&key) else {
            continue;
        };
        let result = if value > 0 {
            effect.play(value)
        } else {
            effect.stop()
        };
        if let Err(e) = result {
            log::debug!("haptics: play on '{}': {e}", ctx.decl.id);
        }
    }
}

/// Reactor callback for a source fd: consume FF upload/erase requests and
/// play events from the virtual device, propagate to sinks, and invoke the
/// source callback.
pub fn handle_event(rt: &Rt, fd: RawFd, ready: Readiness) {
    if !ready.readable {
        return;
    }

    let mut callbacks: Vec<(String, HapticsEventPayload)> = Vec::new();
    {
        let mut state = rt.state_mut();
        let state = &mut *state;
        let Some(source_id) = state.source_id_by_fd(fd) else {
            return;
        };
        let State {
            outputs,
            sources,
            input_map,
            ..
        } = state;
        let Some(output) = outputs.get_mut(&source_id) else {
            return;
        };

        let events: Vec<evdev::InputEvent> = match output.device.fetch_events() {
            Ok(events) => events.collect(),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Vec::new(),
            Err(e) => {
                log::warn!("haptics: fetch on '{source_id}': {e}");
                Vec::new()
            }
        };

        for event in events {
            match event.destructure() {
                EventSummary::UInput(uinput, UInputCode::UI_FF_UPLOAD, ..) => {
                    let mut upload = match output.device.process_ff_upload(uinput) {
                        Ok(upload) => upload,
                        Err(e) => {
                            log::warn!("haptics: FF upload on '{source_id}': {e}");
                            continue;
                        }
                    };
                    let virt_id = upload.effect_id() as i16;
                    let normalized = normalize_effect(upload.effect());
                    upload.set_retval(0);
                    drop(upload);

                    log::debug!("haptics: upload effect {virt_id} on '{source_id}'");
                    if let Some(source) = sources.get_mut(&source_id) {
                        source.effects.insert(virt_id, normalized);
                    }
                    // Replace any stale sink copies before re-uploading.
                    erase_slots(input_map, &source_id, virt_id);
                    upload_to_sinks(input_map, &source_id, virt_id, normalized);
                }
                EventSummary::UInput(uinput, UInputCode::UI_FF_ERASE, ..) => {
                    let erase = match output.device.process_ff_erase(uinput) {
                        Ok(erase) => erase,
                        Err(e) => {
                            log::warn!("haptics: FF erase on '{source_id}': {e}");
                            continue;
                        }
                    };
                    let virt_id = erase.effect_id() as i16;
                    drop(erase);

                    log::debug!("haptics: erase effect {virt_id} on '{source_id}'");
                    if let Some(source) = sources.get_mut(&source_id) {
                        source.effects.remove(&virt_id);
                    }
                    erase_slots(input_map, &source_id, virt_id);
                }
                EventSummary::ForceFeedback(_, code, value) => {
                    let virt_id = code.0 as i16;
                    play_on_sinks(input_map, &source_id, virt_id, value);

                    if let Some(source) = sources.get(&source_id) {
                        if !source.callback.is_empty() {
                            let payload = HapticsEventPayload {
                                source: source_id.clone(),
                                kind: if value > 0 { "play" } else { "stop" }.to_string(),
                                id: virt_id,
                                value,
                                effect: source.effects.get(&virt_id).map(effect_payload),
                            };
                            callbacks.push((source.callback.clone(), payload));
                        }
                    }
                }
                _ => {
                    log::trace!("haptics: unhandled event on '{source_id}': {event:?}");
                }
            }
        }
    }

    for (callback, payload) in callbacks {
        script::call_with_payload(rt, &callback, &payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evdev::{FFEnvelope, FFReplay, FFTrigger};

    fn flat_envelope() -> FFEnvelope {
        FFEnvelope {
            attack_length: 0,
            attack_level: 0,
            fade_length: 0,
            fade_level: 0,
        }
    }

    fn base(kind: FFEffectKind, length: u16) -> FFEffectData {
        FFEffectData {
            direction: 0,
            trigger: FFTrigger {
                button: 0,
                interval: 0,
            },
            replay: FFReplay { length, delay: 0 },
            kind,
        }
    }

    #[test]
    fn rumble_passes_through() {
        let effect = normalize_effect(base(
            FFEffectKind::Rumble {
                strong_magnitude: 0x1111,
                weak_magnitude: 0x2222,
            },
            250,
        ));
        match effect.kind {
            FFEffectKind::Rumble {
                strong_magnitude,
                weak_magnitude,
            } => {
                assert_eq!(strong_magnitude, 0x1111);
                assert_eq!(weak_magnitude, 0x2222);
            }
            _ => panic!("expected rumble"),
        }
        assert_eq!(effect.replay.length, 250);
    }

    #[test]
    fn unknown_kinds_become_mid_rumble() {
        let effect = normalize_effect(base(FFEffectKind::Damper, 0));
        match effect.kind {
            FFEffectKind::Rumble {
                strong_magnitude,
                weak_magnitude,
            } => {
                assert_eq!(strong_magnitude, 0x4000);
                assert_eq!(weak_magnitude, 0x4000);
            }
            _ => panic!("expected rumble"),
        }
        assert_eq!(effect.replay.length, 250);
    }

    #[test]
    fn zero_length_defaults_to_250ms() {
        let effect = normalize_effect(base(
            FFEffectKind::Rumble {
                strong_magnitude: 1,
                weak_magnitude: 1,
            },
            0,
        ));
        assert_eq!(effect.replay.length, 250);

        let effect = normalize_effect(base(
            FFEffectKind::Rumble {
                strong_magnitude: 1,
                weak_magnitude: 1,
            },
            100,
        ));
        assert_eq!(effect.replay.length, 100);
    }

    #[test]
    fn constant_keeps_its_level() {
        let effect = normalize_effect(base(
            FFEffectKind::Constant {
                level: -500,
                envelope: flat_envelope(),
            },
            250,
        ));
        let payload = effect_payload(&effect);
        assert_eq!(payload.kind, "constant");
        assert_eq!(payload.level, Some(-500));
        assert!(payload.strong.is_none());
    }

    #[test]
    fn rumble_payload_shape() {
        let effect = base(
            FFEffectKind::Rumble {
                strong_magnitude: 0x4000,
                weak_magnitude: 0x4000,
            },
            250,
        );
        let payload = effect_payload(&effect);
        assert_eq!(payload.kind, "rumble");
        assert_eq!(payload.strong, Some(0x4000));
        assert_eq!(payload.weak, Some(0x4000));
        assert_eq!(payload.length, 250);
    }
}
