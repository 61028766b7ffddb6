//! MIDI inputs through the system MIDI client library.
//!
//! The backend delivers each connection's messages on its own real-time
//! thread; the only legal exchange with the reactor is a bounded SPSC byte
//! ring per connection. Messages are framed, dropped on overflow, and
//! drained by a repeating scheduler tick.

use midir::{Ignore, MidiInput, MidiInputConnection};
use mio::Token;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::config::{match_string, InputDecl};
use crate::constants::{MIDI_DRAIN_MS, MIDI_RING_BYTES, PROGRAM};
use crate::input::{AttachError, BackendHandle, InputCtx, SinkHaptics};
use crate::runtime::tick::{TickCallback, TickCb};
use crate::runtime::Rt;
use crate::script;

const DEVNODE_PREFIX: &str = "midi:";

#[derive(Default)]
pub struct MidiState {
    pub client_name: Option<String>,
    pub drain_token: Option<Token>,
}

type RingWriter = (Vec<u8>, HeapProd<u8>);

pub struct MidiHandle {
    pub connection: Option<MidiInputConnection<RingWriter>>,
    pub consumer: HeapCons<u8>,
}

/// Serializes one message as `[u32 size][u32 id_len][id][payload]` into
/// the ring. Returns false (dropping the message) when space is
/// insufficient.
pub fn push_frame(producer: &mut HeapProd<u8>, id: &[u8], payload: &[u8]) -> bool {
    let total = 8 + id.len() + payload.len();
    if producer.vacant_len() < total {
        return false;
    }
    producer.push_slice(&(payload.len() as u32).to_ne_bytes());
    producer.push_slice(&(id.len() as u32).to_ne_bytes());
    producer.push_slice(id);
    producer.push_slice(payload);
    true
}

/// Deserializes one framed message, or `None` when the ring is empty. A
/// partial frame cannot occur: the producer only writes whole frames.
pub fn pop_frame(consumer: &mut HeapCons<u8>) -> Option<(String, Vec<u8>)> {
    if consumer.occupied_len() < 8 {
        return None;
    }

    let mut header = [0u8; 8];
    consumer.pop_slice(&mut header);
    let size = u32::from_ne_bytes(header[0..4].try_into().unwrap()) as usize;
    let id_len = u32::from_ne_bytes(header[4..8].try_into().unwrap()) as usize;

    if consumer.occupied_len() < id_len + size {
        // Corrupt; discard what remains.
        consumer.clear();
        return None;
    }

    let mut id = vec![0u8; id_len];
    consumer.pop_slice(&mut id);
    let mut payload = vec![0u8; size];
    consumer.pop_slice(&mut payload);

    Some((String::from_utf8_lossy(&id).to_string(), payload))
}

/// Port names are restricted to `[A-Za-z0-9_-]`; everything else becomes
/// an underscore.
pub fn sanitize_port_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn default_port_name(decl: &InputDecl) -> String {
    sanitize_port_name(&format!("midi_{}", decl.id))
}

/// The client name is fixed by the first attachment: the declared client
/// name, or `<program>_<pid>`.
fn client_name(rt: &Rt, decl: &InputDecl) -> String {
    let mut state = rt.state_mut();
    state
        .midi
        .client_name
        .get_or_insert_with(|| {
            if decl.client.is_empty() {
                format!("{PROGRAM}_{}", std::process::id())
            } else {
                decl.client.clone()
            }
        })
        .clone()
}

/// Enumerates MIDI source ports and returns the first whose
/// `Client:Port` name matches the declaration.
pub fn match_device(rt: &Rt, decl: &InputDecl) -> Option<String> {
    if decl.name.is_empty() {
        return None;
    }

    let mut midi_in = match MidiInput::new(&client_name(rt, decl)) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("midi client unavailable: {e}");
            return None;
        }
    };
    midi_in.ignore(Ignore::None);

    for port in midi_in.ports() {
        let Ok(name) = midi_in.port_name(&port) else {
            continue;
        };
        if match_string(&decl.name, &name) {
            log::info!("matched '{}' -> {name}", decl.id);
            return Some(format!("{DEVNODE_PREFIX}{name}"));
        }
    }
    None
}

/// Registers an input port connected to the matched source port and starts
/// the drain tick if this is the first MIDI attachment.
pub fn attach(rt: &Rt, devnode: &str, decl: InputDecl) -> Result<InputCtx, AttachError> {
    let source = devnode
        .strip_prefix(DEVNODE_PREFIX)
        .ok_or_else(|| AttachError::Midi(format!("invalid devnode '{devnode}'")))?
        .to_string();

    let mut midi_in = MidiInput::new(&client_name(rt, &decl))
        .map_err(|e| AttachError::Midi(e.to_string()))?;
    midi_in.ignore(Ignore::None);

    let port = midi_in
        .ports()
        .into_iter()
        .find(|p| midi_in.port_name(p).map(|n| n == source).unwrap_or(false))
        .ok_or_else(|| AttachError::Midi(format!("port '{source}' is gone")))?;

    let port_name = if decl.port.is_empty() {
        default_port_name(&decl)
    } else {
        sanitize_port_name(&decl.port)
    };

    let (producer, consumer) = HeapRb::<u8>::new(MIDI_RING_BYTES).split();
    let writer: RingWriter = (decl.id.clone().into_bytes(), producer);

    let connection = midi_in
        .connect(
            &port,
            &port_name,
            |_timestamp, message, writer: &mut RingWriter| {
                push_frame(&mut writer.1, &writer.0, message);
            },
            writer,
        )
        .map_err(|e| AttachError::Midi(e.to_string()))?;

    ensure_drain_tick(rt)?;
    log::info!("attached midi '{}' <- {source} (port {port_name})", decl.id);

    Ok(InputCtx {
        decl,
        fd: -1,
        backend: BackendHandle::Midi(MidiHandle {
            connection: Some(connection),
            consumer,
        }),
        active: true,
        grab_pending: false,
        haptics: SinkHaptics::default(),
    })
}

/// Closes the connection; the last MIDI detach cancels the drain tick.
pub fn detach(rt: &Rt, ctx: &mut InputCtx) {
    if let BackendHandle::Midi(handle) = &mut ctx.backend {
        if let Some(connection) = handle.connection.take() {
            connection.close();
        }
    }

    let mut state = rt.state_mut();
    let state = &mut *state;
    let remaining = state
        .input_map
        .values()
        .filter(|c| matches!(c.backend, BackendHandle::Midi(_)))
        .count();
    if remaining == 0 {
        if let Some(token) = state.midi.drain_token.take() {
            state.ticks.cancel(&mut state.reactor, token);
        }
    }
}

fn ensure_drain_tick(rt: &Rt) -> Result<(), AttachError> {
    let mut state = rt.state_mut();
    let state = &mut *state;
    if state.midi.drain_token.is_some() {
        return Ok(());
    }

    let cb = TickCb {
        callback: TickCallback::Native(std::rc::Rc::new(drain)),
        oneshot: false,
    };
    let token = state
        .ticks
        .schedule(&mut state.reactor, MIDI_DRAIN_MS, cb)
        .map_err(|e| AttachError::Midi(format!("drain tick: {e}")))?;
    state.midi.drain_token = Some(token);
    Ok(())
}

/// Tick-driven drain: deserialize every pending message and deliver it.
pub fn drain(rt: &Rt) {
    let mut pending: Vec<(String, String, Vec<u8>)> = Vec::new();
    {
        let mut state = rt.state_mut();
        for ctx in state.input_map.values_mut() {
            let BackendHandle::Midi(handle) = &mut ctx.backend else {
                continue;
            };
            let on_event = ctx.decl.on_event.clone();
            while let Some((id, payload)) = pop_frame(&mut handle.consumer) {
                if !on_event.is_empty() {
                    pending.push((on_event.clone(), id, payload));
                }
            }
        }
    }

    for (callback, id, payload) in pending {
        // A callback may have closed the device meanwhile.
        if !rt.state().input_map.contains_key(&id) {
            continue;
        }
        script::call_with_io_event(rt, &callback, &id, &payload, "ok");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_names_are_sanitized() {
        assert_eq!(sanitize_port_name("midi_pad"), "midi_pad");
        assert_eq!(sanitize_port_name("nanoKEY2 KEYBOARD"), "nanoKEY2_KEYBOARD");
        assert_eq!(sanitize_port_name("a:b/c d-e"), "a_b_c_d-e");
    }

    #[test]
    fn frames_round_trip_through_the_ring() {
        let (mut producer, mut consumer) = HeapRb::<u8>::new(256).split();

        assert!(push_frame(&mut producer, b"pad", &[0x90, 0x3c, 0x7f]));
        assert!(push_frame(&mut producer, b"pad", &[0x80, 0x3c, 0x00]));

        let (id, payload) = pop_frame(&mut consumer).unwrap();
        assert_eq!(id, "pad");
        assert_eq!(payload, vec![0x90, 0x3c, 0x7f]);

        let (_, payload) = pop_frame(&mut consumer).unwrap();
        assert_eq!(payload, vec![0x80, 0x3c, 0x00]);

        assert!(pop_frame(&mut consumer).is_none());
    }

    #[test]
    fn overflow_drops_whole_messages() {
        let (mut producer, mut consumer) = HeapRb::<u8>::new(16).split();

        // 8-byte header + 3 + 3 = 14 bytes fits; a second frame does not.
        assert!(push_frame(&mut producer, b"pad", &[1, 2, 3]));
        assert!(!push_frame(&mut producer, b"pad", &[4, 5, 6]));

        let (_, payload) = pop_frame(&mut consumer).unwrap();
        assert_eq!(payload, vec![1, 2, 3]);
        assert!(pop_frame(&mut consumer).is_none());
    }

    #[test]
    fn empty_payloads_are_legal() {
        let (mut producer, mut consumer) = HeapRb::<u8>::new(64).split();
        assert!(push_frame(&mut producer, b"x", &[]));
        let (id, payload) = pop_frame(&mut consumer).unwrap();
        assert_eq!(id, "x");
        assert!(payload.is_empty());
    }
}
