//! The embedded Lua host and the `aelkey` module.
//!
//! Declarations come from the script-level `inputs` / `outputs` tables,
//! deserialized with serde. Callbacks are globals resolved by name at each
//! call and always invoked as protected calls: a failing callback is
//! logged, never propagated into the reactor. Byte payloads cross into Lua
//! as strings.

use mlua::{Lua, LuaSerdeExt, Table, Value};
use serde::Serialize;
use thiserror::Error;

use crate::config::{InputDecl, OutputDecl};
use crate::input::source::{gatt, hidraw, usb};
use crate::input::{codes, manager, target, BackendHandle};
use crate::runtime::tick::{TickCallback, TickCb, TickKey};
use crate::runtime::Rt;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("duplicate device id '{0}'")]
    DuplicateId(String),
    #[error("declaration error: {0}")]
    Parse(String),
    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

/// One event of an evdev frame batch.
#[derive(Debug, Clone, Serialize)]
pub struct FrameEvent {
    pub device: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub code: String,
    pub value: i32,
    pub sec: i64,
    pub usec: i64,
}

#[derive(Debug, Serialize)]
struct StateEvent<'a> {
    device: &'a str,
    state: &'a str,
}

fn lua_str(value: &mlua::String) -> String {
    String::from_utf8_lossy(&value.as_bytes()).to_string()
}

/// Registers the `aelkey` module loader so scripts can `require("aelkey")`.
pub fn register(rt: &Rt) -> Result<(), ScriptError> {
    let lua = rt.lua();
    let preload: Table = lua
        .globals()
        .get::<Table>("package")?
        .get::<Table>("preload")?;

    let rt_for_loader = rt.clone();
    preload.set(
        "aelkey",
        lua.create_function(move |lua, ()| build_module(lua, &rt_for_loader))?,
    )?;
    Ok(())
}

/// Loads and executes the user script. The script usually declares
/// `inputs` / `outputs` and ends with `aelkey.start()`.
pub fn run_file(rt: &Rt, path: &std::path::Path) -> Result<(), ScriptError> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| ScriptError::Parse(format!("{}: {e}", path.display())))?;
    rt.lua()
        .load(&source)
        .set_name(path.to_string_lossy().to_string())
        .exec()?;
    Ok(())
}

/// Parses the script-level `inputs` and `outputs` tables into the
/// registry. A malformed or duplicate declaration fails the whole call;
/// declarations parsed earlier remain untouched elsewhere.
pub fn parse_declarations(rt: &Rt) -> Result<(), ScriptError> {
    let lua = rt.lua();

    let mut input_decls: Vec<InputDecl> = Vec::new();
    if let Ok(Some(inputs)) = lua.globals().get::<Option<Table>>("inputs") {
        for (index, entry) in inputs.sequence_values::<Value>().enumerate() {
            let value = entry?;
            if !matches!(value, Value::Table(_)) {
                continue;
            }
            let decl: InputDecl = lua
                .from_value(value)
                .map_err(|e| ScriptError::Parse(format!("inputs[{}]: {e}", index + 1)))?;
            if decl.id.is_empty() {
                continue;
            }
            if input_decls.iter().any(|d| d.id == decl.id) {
                return Err(ScriptError::DuplicateId(decl.id));
            }
            for cap in &decl.capabilities {
                if codes::event_type_from_name(&cap.event_type).is_none() {
                    return Err(ScriptError::Parse(format!(
                        "inputs[{}]: unknown event type '{}'",
                        index + 1,
                        cap.event_type
                    )));
                }
            }
            input_decls.push(decl);
        }
    }

    let mut output_decls: Vec<OutputDecl> = Vec::new();
    if let Ok(Some(outputs)) = lua.globals().get::<Option<Table>>("outputs") {
        for (index, entry) in outputs.sequence_values::<Value>().enumerate() {
            let value = entry?;
            if !matches!(value, Value::Table(_)) {
                continue;
            }
            let decl: OutputDecl = lua
                .from_value(value)
                .map_err(|e| ScriptError::Parse(format!("outputs[{}]: {e}", index + 1)))?;
            if decl.id.is_empty() {
                continue;
            }
            if output_decls.iter().any(|d| d.id == decl.id)
                || input_decls.iter().any(|d| d.id == decl.id)
            {
                return Err(ScriptError::DuplicateId(decl.id));
            }
            output_decls.push(decl);
        }
    }

    let mut state = rt.state_mut();
    state.input_decls = input_decls;
    state.output_decls = output_decls;
    Ok(())
}

/// Delivers an `on_state` lifecycle notification.
pub fn notify_state(rt: &Rt, decl: &InputDecl, state: &str) {
    if decl.on_state.is_empty() {
        return;
    }
    call_with_payload(
        rt,
        &decl.on_state,
        &StateEvent {
            device: &decl.id,
            state,
        },
    );
}

/// Serializes a payload into a Lua value and dispatches the callback.
pub fn call_with_payload<T: Serialize>(rt: &Rt, name: &str, payload: &T) {
    if name.is_empty() {
        return;
    }
    match rt.lua().to_value(payload) {
        Ok(value) => rt.call_global(name, value),
        Err(e) => log::warn!("payload for '{name}': {e}"),
    }
}

/// `{device, data, size, status}` delivery for byte-oriented transports.
/// Data and size are present only on an ok read.
pub fn call_with_io_event(rt: &Rt, name: &str, id: &str, data: &[u8], status: &str) {
    if name.is_empty() {
        return;
    }
    let lua = rt.lua();
    let table = (|| -> mlua::Result<Table> {
        let table = lua.create_table()?;
        table.set("device", id)?;
        if status == "ok" {
            table.set("data", lua.create_string(data)?)?;
            table.set("size", data.len())?;
        }
        table.set("status", status)?;
        Ok(table)
    })();
    match table {
        Ok(table) => rt.call_global(name, table),
        Err(e) => log::warn!("payload for '{name}': {e}"),
    }
}

/// GATT notification delivery: `{device, path, data, size, status}`.
pub fn call_with_gatt_event(rt: &Rt, name: &str, id: &str, path: &str, data: &[u8]) {
    let lua = rt.lua();
    let table = (|| -> mlua::Result<Table> {
        let table = lua.create_table()?;
        table.set("device", id)?;
        table.set("path", path)?;
        table.set("data", lua.create_string(data)?)?;
        table.set("size", data.len())?;
        table.set("status", "ok")?;
        Ok(table)
    })();
    match table {
        Ok(table) => rt.call_global(name, table),
        Err(e) => log::warn!("payload for '{name}': {e}"),
    }
}

/// USB transfer completion delivery:
/// `{device, data, size, endpoint, transfer, status}`.
pub fn call_with_usb_event(
    rt: &Rt,
    name: &str,
    id: &str,
    data: &[u8],
    endpoint: u8,
    transfer: &str,
    status: &str,
) {
    let lua = rt.lua();
    let table = (|| -> mlua::Result<Table> {
        let table = lua.create_table()?;
        table.set("device", id)?;
        table.set("data", lua.create_string(data)?)?;
        table.set("size", data.len())?;
        table.set("endpoint", endpoint)?;
        table.set("transfer", transfer)?;
        table.set("status", status)?;
        Ok(table)
    })();
    match table {
        Ok(table) => rt.call_global(name, table),
        Err(e) => log::warn!("payload for '{name}': {e}"),
    }
}

fn event_type_arg(value: &Value) -> u16 {
    match value {
        Value::Integer(n) => *n as u16,
        Value::Number(n) => *n as u16,
        Value::String(s) => codes::event_type_from_name(&lua_str(s))
            .map(|t| t.0)
            .unwrap_or(0),
        _ => 0,
    }
}

fn event_code_arg(event_type: u16, value: &Value) -> u16 {
    match value {
        Value::Integer(n) => *n as u16,
        Value::Number(n) => *n as u16,
        Value::String(s) => codes::code_from_name(evdev::EventType(event_type), &lua_str(s)),
        _ => 0,
    }
}

fn build_module(lua: &Lua, rt: &Rt) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    // emit{device?, type, code, value}
    let rt_ = rt.clone();
    module.set(
        "emit",
        lua.create_function(move |_, opts: Table| {
            let device: Option<String> = opts.get("device")?;
            let event_type = event_type_arg(&opts.get::<Value>("type")?);
            let code = event_code_arg(event_type, &opts.get::<Value>("code")?);
            let value: i32 = opts.get("value")?;
            target::emit(&rt_, device.as_deref(), event_type, code, value)
                .map_err(mlua::Error::RuntimeError)
        })?,
    )?;

    // syn_report([device])
    let rt_ = rt.clone();
    module.set(
        "syn_report",
        lua.create_function(move |_, device: Option<String>| {
            target::syn_report(&rt_, device.as_deref()).map_err(mlua::Error::RuntimeError)
        })?,
    )?;

    // tick(ms, cb)
    let rt_ = rt.clone();
    module.set(
        "tick",
        lua.create_function(move |_, (ms, cb): (i64, Value)| script_tick(&rt_, ms, cb))?,
    )?;

    // start() / stop()
    let rt_ = rt.clone();
    module.set(
        "start",
        lua.create_function(move |_, ()| {
            rt_.run().map_err(mlua::Error::external)?;
            Ok(true)
        })?,
    )?;
    let rt_ = rt.clone();
    module.set(
        "stop",
        lua.create_function(move |_, ()| {
            rt_.request_stop();
            Ok(())
        })?,
    )?;

    // open_device([id]) / close_device(id) / get_device_info(id)
    let rt_ = rt.clone();
    module.set(
        "open_device",
        lua.create_function(move |_, id: Option<String>| match id {
            None => manager::open_all(&rt_)
                .map(|_| true)
                .map_err(mlua::Error::RuntimeError),
            Some(id) => manager::open_one(&rt_, &id).map_err(mlua::Error::RuntimeError),
        })?,
    )?;
    let rt_ = rt.clone();
    module.set(
        "close_device",
        lua.create_function(move |_, id: String| Ok(manager::detach(&rt_, &id).is_some()))?,
    )?;
    let rt_ = rt.clone();
    module.set(
        "get_device_info",
        lua.create_function(move |lua, id: String| {
            let decl = rt_
                .state()
                .input_map
                .get(&id)
                .map(|ctx| ctx.decl.clone());
            match decl {
                Some(decl) => lua.to_value(&decl),
                None => Ok(Value::Nil),
            }
        })?,
    )?;

    // watch(ref, decls) / unwatch(ref) / watchlist()
    let rt_ = rt.clone();
    module.set(
        "watch",
        lua.create_function(move |lua, (watch_ref, decls): (String, Table)| {
            let mut parsed = Vec::new();
            for entry in decls.sequence_values::<Value>() {
                let value = entry?;
                if !matches!(value, Value::Table(_)) {
                    continue;
                }
                let decl: InputDecl = lua.from_value(value)?;
                if !decl.id.is_empty() {
                    parsed.push(decl);
                }
            }
            rt_.state_mut().watch_map.insert(watch_ref, parsed);
            Ok(())
        })?,
    )?;
    let rt_ = rt.clone();
    module.set(
        "unwatch",
        lua.create_function(move |_, watch_ref: String| {
            rt_.state_mut().watch_map.remove(&watch_ref);
            Ok(())
        })?,
    )?;
    let rt_ = rt.clone();
    module.set(
        "watchlist",
        lua.create_function(move |_, ()| {
            let refs: Vec<String> = rt_.state().watch_map.keys().cloned().collect();
            Ok(refs)
        })?,
    )?;

    module.set("hid", build_hid_module(lua, rt)?)?;
    module.set("gatt", build_gatt_module(lua, rt)?)?;
    module.set("usb", build_usb_module(lua, rt)?)?;

    Ok(module)
}

/// `tick(0)` cancels everything, `tick(0, cb)` cancels that key, anything
/// else replaces the key's timer with a repeating one.
fn script_tick(rt: &Rt, ms: i64, cb: Value) -> mlua::Result<()> {
    if ms <= 0 && cb.is_nil() {
        let mut state = rt.state_mut();
        let state = &mut *state;
        state.ticks.cancel_all(&mut state.reactor);
        return Ok(());
    }

    let key = match cb {
        Value::String(s) => TickKey::Global(lua_str(&s)),
        Value::Function(f) => TickKey::Function(f),
        _ => {
            return Err(mlua::Error::RuntimeError(
                "tick callback must be a string or a function".into(),
            ))
        }
    };

    {
        let mut state = rt.state_mut();
        let state = &mut *state;
        state.ticks.cancel_matching(&mut state.reactor, &key);
    }

    if ms <= 0 {
        return Ok(());
    }

    let callback = match key {
        TickKey::Global(name) => TickCallback::Global(name),
        TickKey::Function(f) => TickCallback::Function(f),
    };

    let mut state = rt.state_mut();
    let state = &mut *state;
    state
        .ticks
        .schedule(
            &mut state.reactor,
            ms as u64,
            TickCb {
                callback,
                oneshot: false,
            },
        )
        .map_err(mlua::Error::external)?;
    Ok(())
}

fn build_hid_module(lua: &Lua, rt: &Rt) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    let rt_ = rt.clone();
    module.set(
        "get_feature_report",
        lua.create_function(move |lua, (id, report_id): (String, u8)| {
            let data = hidraw::get_feature_report(&rt_, &id, report_id).unwrap_or_default();
            lua.create_string(&data)
        })?,
    )?;

    let rt_ = rt.clone();
    module.set(
        "get_report_descriptor",
        lua.create_function(move |lua, id: String| {
            let data = hidraw::get_report_descriptor(&rt_, &id).unwrap_or_default();
            lua.create_string(&data)
        })?,
    )?;

    let rt_ = rt.clone();
    module.set(
        "read_input_report",
        lua.create_function(move |lua, id: String| {
            let data = hidraw::read_input_report(&rt_, &id).unwrap_or_default();
            lua.create_string(&data)
        })?,
    )?;

    let rt_ = rt.clone();
    module.set(
        "send_feature_report",
        lua.create_function(move |_, (id, data): (String, mlua::String)| {
            Ok(hidraw::send_feature_report(&rt_, &id, &data.as_bytes()))
        })?,
    )?;

    let rt_ = rt.clone();
    module.set(
        "send_output_report",
        lua.create_function(move |_, (id, data): (String, mlua::String)| {
            Ok(hidraw::send_output_report(&rt_, &id, &data.as_bytes()))
        })?,
    )?;

    Ok(module)
}

/// Resolves the characteristic path for a gatt.read/gatt.write call:
/// explicit service+characteristic overrides, or the context's path.
fn gatt_char_path(rt: &Rt, opts: &Table) -> mlua::Result<String> {
    let device: String = opts.get("device")?;
    let service: i32 = opts.get::<Option<i32>>("service")?.unwrap_or(-1);
    let characteristic: i32 = opts.get::<Option<i32>>("characteristic")?.unwrap_or(-1);

    let state = rt.state();
    let ctx = state
        .input_map
        .get(&device)
        .ok_or_else(|| mlua::Error::RuntimeError(format!("unknown device id '{device}'")))?;
    let BackendHandle::Gatt(handle) = &ctx.backend else {
        return Err(mlua::Error::RuntimeError(format!(
            "'{device}' is not a gatt device"
        )));
    };

    gatt::resolve_char_path(handle, service, characteristic).ok_or_else(|| {
        mlua::Error::RuntimeError(
            "both 'service' and 'characteristic' must be provided for override".into(),
        )
    })
}

fn build_gatt_module(lua: &Lua, rt: &Rt) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    let rt_ = rt.clone();
    module.set(
        "read",
        lua.create_function(move |lua, opts: Table| {
            let char_path = gatt_char_path(&rt_, &opts)?;
            let data = gatt::read_characteristic(&rt_, &char_path)
                .map_err(|e| mlua::Error::RuntimeError(format!("GATT read failed: {e}")))?;
            lua.create_string(&data)
        })?,
    )?;

    let rt_ = rt.clone();
    module.set(
        "write",
        lua.create_function(move |_, opts: Table| {
            let char_path = gatt_char_path(&rt_, &opts)?;
            let data: mlua::String = opts.get("data")?;
            let with_resp: bool = opts.get::<Option<bool>>("response")?.unwrap_or(false);
            match gatt::write_characteristic(&rt_, &char_path, &data.as_bytes(), with_resp) {
                Ok(()) => Ok(true),
                Err(e) => {
                    log::warn!("GATT write {char_path}: {e}");
                    Ok(false)
                }
            }
        })?,
    )?;

    Ok(module)
}

fn sync_result_table(
    lua: &Lua,
    device: &str,
    result: usb::SyncResult,
) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set("device", device)?;
    table.set("data", lua.create_string(&result.data)?)?;
    table.set("size", result.size)?;
    table.set("status", result.status)?;
    Ok(table)
}

fn build_usb_module(lua: &Lua, rt: &Rt) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    // bulk_transfer{device, endpoint, size, data?, timeout?}
    let rt_ = rt.clone();
    module.set(
        "bulk_transfer",
        lua.create_function(move |lua, opts: Table| {
            let device: String = opts.get("device")?;
            let endpoint: u8 = opts.get("endpoint")?;
            let size: usize = opts.get("size")?;
            let timeout: u32 = opts.get::<Option<u32>>("timeout")?.unwrap_or(0);
            let data = opts
                .get::<Option<mlua::String>>("data")?
                .map(|s| s.as_bytes().to_vec());
            let result = usb::bulk_transfer(&rt_, &device, endpoint, size, data, timeout);
            sync_result_table(lua, &device, result)
        })?,
    )?;

    // control_transfer{device, request_type, request, value, index, length,
    // data?, timeout?}
    let rt_ = rt.clone();
    module.set(
        "control_transfer",
        lua.create_function(move |lua, opts: Table| {
            let device: String = opts.get("device")?;
            let request_type: u8 = opts.get("request_type")?;
            let request: u8 = opts.get("request")?;
            let value: u16 = opts.get("value")?;
            let index: u16 = opts.get("index")?;
            let length: u16 = opts.get("length")?;
            let timeout: u32 = opts.get::<Option<u32>>("timeout")?.unwrap_or(0);
            let data = opts
                .get::<Option<mlua::String>>("data")?
                .map(|s| s.as_bytes().to_vec());
            let result = usb::control_transfer(
                &rt_,
                &device,
                request_type,
                request,
                value,
                index,
                length,
                data,
                timeout,
            );
            sync_result_table(lua, &device, result)
        })?,
    )?;

    // interrupt_transfer{device, endpoint, size, data?, timeout?}
    let rt_ = rt.clone();
    module.set(
        "interrupt_transfer",
        lua.create_function(move |lua, opts: Table| {
            let device: String = opts.get("device")?;
            let endpoint: u8 = opts.get("endpoint")?;
            let size: usize = opts.get("size")?;
            let timeout: u32 = opts.get::<Option<u32>>("timeout")?.unwrap_or(0);
            let data = opts
                .get::<Option<mlua::String>>("data")?
                .map(|s| s.as_bytes().to_vec());
            let result = usb::interrupt_transfer(&rt_, &device, endpoint, size, data, timeout);
            sync_result_table(lua, &device, result)
        })?,
    )?;

    // submit_transfer{device, endpoint, type, size, timeout?}
    // Returns a handle table with cancel() and resubmit().
    let rt_ = rt.clone();
    module.set(
        "submit_transfer",
        lua.create_function(move |lua, opts: Table| {
            let device: String = opts.get("device")?;
            let endpoint: u8 = opts.get("endpoint")?;
            let size: usize = opts.get("size")?;
            let timeout: u32 = opts.get::<Option<u32>>("timeout")?.unwrap_or(0);
            let type_name: String = opts
                .get::<Option<String>>("type")?
                .unwrap_or_else(|| "interrupt".to_string());
            let transfer_type = usb::transfer_type_from_str(&type_name);

            let table = lua.create_table()?;
            table.set("device", device.clone())?;
            table.set("endpoint", endpoint)?;

            match usb::submit_transfer(&rt_, &device, endpoint, transfer_type, size, timeout) {
                Ok(transfer) => {
                    table.set("_xfer", transfer)?;
                    table.set("status", 0)?;

                    let rt_cancel = rt_.clone();
                    let device_cancel = device.clone();
                    table.set(
                        "cancel",
                        lua.create_function(move |_, ()| {
                            Ok(usb::cancel_transfer(&rt_cancel, &device_cancel, transfer))
                        })?,
                    )?;

                    let rt_resubmit = rt_.clone();
                    let device_resubmit = device.clone();
                    table.set(
                        "resubmit",
                        lua.create_function(move |_, ()| {
                            Ok(usb::resubmit_transfer(&rt_resubmit, &device_resubmit, transfer))
                        })?,
                    )?;
                }
                Err(status) => {
                    table.set("transfer", Value::Nil)?;
                    table.set("status", status)?;
                }
            }
            Ok(table)
        })?,
    )?;

    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeclType, OutputType};
    use crate::runtime::tick::TickKey;

    fn runtime() -> Rt {
        // Tests may run as root in CI containers.
        std::env::set_var(crate::constants::ALLOW_ROOT_ENV, "1");
        let rt = Rt::new().unwrap();
        register(&rt).unwrap();
        rt
    }

    #[test]
    fn declarations_parse_from_lua_tables() {
        let rt = runtime();
        rt.lua()
            .load(
                r#"
                inputs = {
                    {
                        id = "kbd1",
                        type = "evdev",
                        name = "^Logitech .*$",
                        grab = true,
                        capabilities = {{type = "EV_KEY", code = "KEY_A"}},
                        on_event = "on_kbd",
                        on_state = "on_kbd_state",
                    },
                    {
                        id = "ble",
                        type = "gatt",
                        uniq = "AA:BB:CC:DD:EE:FF",
                        service = 0x0021,
                        characteristic = 0x0036,
                    },
                }
                outputs = {
                    { id = "okbd", type = "keyboard", name = "Virtual Keyboard" },
                    { id = "pad", type = "gamepad", on_haptics = "on_rumble" },
                }
                "#,
            )
            .exec()
            .unwrap();

        parse_declarations(&rt).unwrap();

        let state = rt.state();
        assert_eq!(state.input_decls.len(), 2);
        let kbd = &state.input_decls[0];
        assert_eq!(kbd.id, "kbd1");
        assert_eq!(kbd.kind, DeclType::Evdev);
        assert!(kbd.grab);
        assert_eq!(kbd.capabilities.len(), 1);
        assert_eq!(kbd.capabilities[0].event_type, "EV_KEY");
        assert_eq!(kbd.capabilities[0].code, "KEY_A");
        assert_eq!(kbd.on_event, "on_kbd");

        let ble = &state.input_decls[1];
        assert_eq!(ble.kind, DeclType::Gatt);
        assert_eq!(ble.service, 0x0021);
        assert_eq!(ble.characteristic, 0x0036);
        assert_eq!(ble.interface, -1);

        assert_eq!(state.output_decls.len(), 2);
        assert_eq!(state.output_decls[0].kind, OutputType::Keyboard);
        assert_eq!(state.output_decls[0].vendor, 0x1234);
        assert_eq!(state.output_decls[1].kind, OutputType::Gamepad);
        assert_eq!(state.output_decls[1].on_haptics, "on_rumble");
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let rt = runtime();
        rt.lua()
            .load(
                r#"
                inputs = {
                    { id = "dup", type = "evdev" },
                    { id = "dup", type = "hidraw" },
                }
                "#,
            )
            .exec()
            .unwrap();

        let err = parse_declarations(&rt).unwrap_err();
        assert!(matches!(err, ScriptError::DuplicateId(id) if id == "dup"));
    }

    #[test]
    fn unknown_type_is_a_declaration_error() {
        let rt = runtime();
        rt.lua()
            .load(r#"inputs = {{ id = "x", type = "serial" }}"#)
            .exec()
            .unwrap();
        assert!(matches!(
            parse_declarations(&rt),
            Err(ScriptError::Parse(_))
        ));
    }

    #[test]
    fn tick_is_idempotent_on_key() {
        let rt = runtime();
        rt.lua()
            .load(
                r#"
                local aelkey = require("aelkey")
                aelkey.tick(100, "foo")
                aelkey.tick(50, "foo")
                aelkey.tick(200, "bar")
                "#,
            )
            .exec()
            .unwrap();

        {
            let state = rt.state();
            assert_eq!(state.ticks.count_matching(&TickKey::Global("foo".into())), 1);
            assert_eq!(state.ticks.count_matching(&TickKey::Global("bar".into())), 1);
            assert_eq!(state.ticks.len(), 2);
        }

        rt.lua()
            .load(r#"require("aelkey").tick(0, "foo")"#)
            .exec()
            .unwrap();
        {
            let state = rt.state();
            assert_eq!(state.ticks.count_matching(&TickKey::Global("foo".into())), 0);
            assert_eq!(state.ticks.len(), 1);
        }

        rt.lua().load(r#"require("aelkey").tick(0)"#).exec().unwrap();
        assert!(rt.state().ticks.is_empty());
    }

    #[test]
    fn tick_function_keys_use_identity() {
        let rt = runtime();
        rt.lua()
            .load(
                r#"
                local aelkey = require("aelkey")
                local cb = function() end
                aelkey.tick(100, cb)
                aelkey.tick(50, cb)
                aelkey.tick(25, function() end)
                "#,
            )
            .exec()
            .unwrap();
        // Same function replaced its timer; the anonymous one is distinct.
        assert_eq!(rt.state().ticks.len(), 2);
    }

    #[test]
    fn watch_map_tracks_references() {
        let rt = runtime();
        rt.lua()
            .load(
                r#"
                local aelkey = require("aelkey")
                aelkey.watch("usbwatch", {
                    { id = "w1", type = "evdev", vendor = 0x046d, on_state = "on_plug" },
                })
                "#,
            )
            .exec()
            .unwrap();

        {
            let state = rt.state();
            let decls = state.watch_map.get("usbwatch").unwrap();
            assert_eq!(decls.len(), 1);
            assert_eq!(decls[0].vendor, 0x046d);
            assert_eq!(decls[0].on_state, "on_plug");
        }

        let refs: Vec<String> = rt
            .lua()
            .load(r#"return require("aelkey").watchlist()"#)
            .eval()
            .unwrap();
        assert_eq!(refs, vec!["usbwatch".to_string()]);

        rt.lua()
            .load(r#"require("aelkey").unwatch("usbwatch")"#)
            .exec()
            .unwrap();
        assert!(rt.state().watch_map.is_empty());
    }

    #[test]
    fn io_event_payloads_carry_binary_data() {
        let rt = runtime();
        rt.lua()
            .load(
                r#"
                captured = nil
                function on_report(ev) captured = ev end
                "#,
            )
            .exec()
            .unwrap();

        call_with_io_event(&rt, "on_report", "hid1", &[0x01, 0x00, 0xff], "ok");

        let (device, size, byte3): (String, usize, u8) = rt
            .lua()
            .load(
                r#"
                return captured.device, captured.size,
                    string.byte(captured.data, 3)
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!(device, "hid1");
        assert_eq!(size, 3);
        assert_eq!(byte3, 0xff);
    }

    #[test]
    fn callback_errors_do_not_propagate() {
        let rt = runtime();
        rt.lua()
            .load(r#"function bad() error("boom") end"#)
            .exec()
            .unwrap();
        // Must not panic or propagate.
        rt.call_global("bad", ());
        rt.call_global("missing_global", ());
    }

    #[test]
    fn frame_batches_reach_the_script_in_order() {
        let rt = runtime();
        rt.lua()
            .load(
                r#"
                batches = {}
                function on_kbd(events) batches[#batches + 1] = events end
                "#,
            )
            .exec()
            .unwrap();

        let batch = vec![
            FrameEvent {
                device: "kbd1".into(),
                event_type: "EV_KEY".into(),
                code: "KEY_A".into(),
                value: 1,
                sec: 1,
                usec: 2,
            },
            FrameEvent {
                device: "kbd1".into(),
                event_type: "EV_SYN".into(),
                code: "SYN_REPORT".into(),
                value: 0,
                sec: 1,
                usec: 3,
            },
        ];
        call_with_payload(&rt, "on_kbd", &batch);

        let (count, code1, code2, value1): (usize, String, String, i32) = rt
            .lua()
            .load(
                r#"
                local b = batches[1]
                return #batches, b[1].code, b[2].code, b[1].value
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(code1, "KEY_A");
        assert_eq!(code2, "SYN_REPORT");
        assert_eq!(value1, 1);
    }
}
