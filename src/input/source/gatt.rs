//! Bluetooth LE GATT characteristics over the system bus.
//!
//! One bus connection serves every GATT input. Its socket is registered
//! with the reactor; readiness drains all pending messages. Matching walks
//! the BlueZ object tree from `GetManagedObjects`: devices by MAC or name,
//! then `…/serviceXXXX` and `…/charXXXX` by their 16-bit handles.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::Duration;

use dbus::arg::{prop_cast, PropMap, RefArg, Variant};
use dbus::blocking::Connection;
use dbus::Path;

use crate::config::{match_string, InputDecl};
use crate::constants::BUS_CALL_TIMEOUT_MS;
use crate::input::{AttachError, BackendHandle, InputCtx, SinkHaptics};
use crate::runtime::reactor::Owner;
use crate::runtime::{Rt, State};
use crate::script;

const BLUEZ: &str = "org.bluez";
const IFACE_DEVICE: &str = "org.bluez.Device1";
const IFACE_SERVICE: &str = "org.bluez.GattService1";
const IFACE_CHARACTERISTIC: &str = "org.bluez.GattCharacteristic1";
const IFACE_PROPERTIES: &str = "org.freedesktop.DBus.Properties";

fn call_timeout() -> Duration {
    Duration::from_millis(BUS_CALL_TIMEOUT_MS)
}

pub struct GattState {
    pub conn: Option<Connection>,
    pub fd: RawFd,
}

impl Default for GattState {
    fn default() -> Self {
        Self { conn: None, fd: -1 }
    }
}

/// Per-input GATT handle: the resolved object path, the device root it
/// hangs off, and the characteristics subscribed for notification.
pub struct GattHandle {
    pub path: String,
    pub device_path: String,
    pub subscribed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattPathType {
    Device,
    Service,
    Characteristic,
}

/// Classifies a BlueZ object path by its deepest component.
pub fn classify_path(path: &str) -> GattPathType {
    if path.contains("/char") {
        GattPathType::Characteristic
    } else if path.contains("/service") {
        GattPathType::Service
    } else {
        GattPathType::Device
    }
}

/// Chops a characteristic or service path down to the device object path.
pub fn device_root(path: &str) -> Option<String> {
    path.find("/service").map(|pos| path[..pos].to_string())
}

/// Extracts the 16-bit handle embedded after `marker` in an object path,
/// e.g. `parse_handle("…/service0021/char0036", "char")` → `0x0036`.
pub fn parse_handle(path: &str, marker: &str) -> Option<u16> {
    let start = path.rfind(marker)? + marker.len();
    let hex = path.get(start..start + 4)?;
    u16::from_str_radix(hex, 16).ok()
}

/// Snapshot of the BlueZ object tree, reduced to what matching needs.
#[derive(Debug, Default)]
pub struct GattObjects {
    pub devices: Vec<GattDeviceProps>,
    pub services: Vec<String>,
    pub characteristics: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GattDeviceProps {
    pub path: String,
    pub name: String,
    pub alias: String,
    pub address: String,
}

/// Device-stage predicate: `uniq` against the MAC address, `name` against
/// name or alias, both pattern-aware.
pub fn device_matches(decl: &InputDecl, props: &GattDeviceProps) -> bool {
    if !decl.uniq.is_empty() && match_string(&decl.uniq, &props.address) {
        return true;
    }
    if !decl.name.is_empty()
        && (match_string(&decl.name, &props.name) || match_string(&decl.name, &props.alias))
    {
        return true;
    }
    false
}

/// Three-stage resolution over an object snapshot. Returns the most
/// specific path the declaration asks for, plus (when `collect_chars`) all
/// characteristics under the matching services.
pub fn resolve_paths(
    decl: &InputDecl,
    objects: &GattObjects,
    collect_chars: bool,
) -> (Option<String>, Vec<String>) {
    let mut devices: Vec<String> = objects
        .devices
        .iter()
        .filter(|d| device_matches(decl, d))
        .map(|d| d.path.clone())
        .collect();
    devices.sort();
    if devices.is_empty() {
        return (None, Vec::new());
    }

    if decl.service == 0 && !collect_chars {
        return (Some(devices[0].clone()), Vec::new());
    }

    let mut services: Vec<String> = objects
        .services
        .iter()
        .filter(|path| {
            devices.iter().any(|d| path.starts_with(d.as_str()))
                && match parse_handle(path, "service") {
                    Some(handle) => decl.service == 0 || handle == decl.service,
                    None => false,
                }
        })
        .cloned()
        .collect();
    services.sort();
    if services.is_empty() {
        return (None, Vec::new());
    }

    let mut characteristics: Vec<String> = objects
        .characteristics
        .iter()
        .filter(|path| {
            services.iter().any(|s| path.starts_with(s.as_str()))
                && match parse_handle(path, "char") {
                    Some(handle) => decl.characteristic == 0 || handle == decl.characteristic,
                    None => false,
                }
        })
        .cloned()
        .collect();
    characteristics.sort();

    let found = if collect_chars {
        characteristics.clone()
    } else {
        Vec::new()
    };

    if decl.service == 0 {
        return (Some(devices[0].clone()), found);
    }
    if decl.characteristic == 0 {
        return (Some(services[0].clone()), found);
    }
    if characteristics.is_empty() {
        log::debug!("gatt match '{}': no matching characteristic", decl.id);
        return (None, found);
    }
    (Some(characteristics[0].clone()), found)
}

/// Picks the GATT input owning a notification path: the context with the
/// longest recorded path that prefixes the signal path.
pub fn route_notification(contexts: &[(String, String)], signal_path: &str) -> Option<String> {
    contexts
        .iter()
        .filter(|(_, recorded)| !recorded.is_empty() && signal_path.starts_with(recorded.as_str()))
        .max_by_key(|(_, recorded)| recorded.len())
        .map(|(id, _)| id.clone())
}

/// Connects to the system bus once and registers the socket with the
/// reactor.
pub fn ensure_connection(rt: &Rt) -> Result<(), dbus::Error> {
    if rt.state().gatt.conn.is_some() {
        return Ok(());
    }

    let conn = Connection::new_system()?;
    let fd = conn.channel().watch().fd;

    let mut state = rt.state_mut();
    if let Err(e) = state.reactor.register(fd, Owner::Gatt) {
        log::error!("register bus fd: {e}");
    }
    state.gatt.conn = Some(conn);
    state.gatt.fd = fd;
    log::debug!("connected to system bus (fd={fd})");
    Ok(())
}

pub fn teardown(state: &mut State) {
    if state.gatt.fd >= 0 {
        state.reactor.unregister(state.gatt.fd);
        state.gatt.fd = -1;
    }
    state.gatt.conn = None;
}

fn collect_objects(conn: &Connection) -> Result<GattObjects, dbus::Error> {
    let proxy = conn.with_proxy(BLUEZ, "/", call_timeout());
    let (managed,): (HashMap<Path<'static>, HashMap<String, PropMap>>,) = proxy.method_call(
        "org.freedesktop.DBus.ObjectManager",
        "GetManagedObjects",
        (),
    )?;

    let mut objects = GattObjects::default();
    for (path, interfaces) in &managed {
        let path_str = path.to_string();
        if let Some(props) = interfaces.get(IFACE_DEVICE) {
            objects.devices.push(GattDeviceProps {
                path: path_str.clone(),
                name: prop_cast::<String>(props, "Name").cloned().unwrap_or_default(),
                alias: prop_cast::<String>(props, "Alias").cloned().unwrap_or_default(),
                address: prop_cast::<String>(props, "Address")
                    .cloned()
                    .unwrap_or_default(),
            });
        }
        if interfaces.contains_key(IFACE_SERVICE) {
            objects.services.push(path_str.clone());
        }
        if interfaces.contains_key(IFACE_CHARACTERISTIC) {
            objects.characteristics.push(path_str);
        }
    }
    Ok(objects)
}

/// Resolves the declaration against the managed-object tree.
pub fn match_device(rt: &Rt, decl: &InputDecl) -> Option<String> {
    if let Err(e) = ensure_connection(rt) {
        log::warn!("system bus unavailable: {e}");
        return None;
    }

    let state = rt.state();
    let conn = state.gatt.conn.as_ref()?;
    let objects = match collect_objects(conn) {
        Ok(objects) => objects,
        Err(e) => {
            log::warn!("GetManagedObjects: {e}");
            return None;
        }
    };
    resolve_paths(decl, &objects, false).0
}

fn characteristic_flags(conn: &Connection, char_path: &str) -> Vec<String> {
    let proxy = conn.with_proxy(BLUEZ, char_path.to_string(), call_timeout());
    let result: Result<(Variant<Vec<String>>,), dbus::Error> =
        proxy.method_call(IFACE_PROPERTIES, "Get", (IFACE_CHARACTERISTIC, "Flags"));
    match result {
        Ok((flags,)) => flags.0,
        Err(_) => Vec::new(),
    }
}

fn characteristic_uuid(conn: &Connection, char_path: &str) -> String {
    let proxy = conn.with_proxy(BLUEZ, char_path.to_string(), call_timeout());
    let result: Result<(Variant<String>,), dbus::Error> =
        proxy.method_call(IFACE_PROPERTIES, "Get", (IFACE_CHARACTERISTIC, "UUID"));
    match result {
        Ok((uuid,)) => uuid.0,
        Err(_) => String::new(),
    }
}

fn log_characteristic(conn: &Connection, char_path: &str, flags: &[String]) {
    let service = parse_handle(char_path, "service").unwrap_or(0);
    let ch = parse_handle(char_path, "char").unwrap_or(0);
    let uuid = characteristic_uuid(conn, char_path);
    let uuid_tail = if uuid.len() >= 4 {
        &uuid[uuid.len() - 4..]
    } else {
        uuid.as_str()
    };
    log::info!(
        "gatt characteristic service=0x{service:04x} char=0x{ch:04x} uuid={uuid_tail} flags={flags:?}"
    );
}

fn start_notify(conn: &Connection, char_path: &str) -> Result<(), dbus::Error> {
    let proxy = conn.with_proxy(BLUEZ, char_path.to_string(), call_timeout());
    proxy.method_call::<(), _, _, _>(IFACE_CHARACTERISTIC, "StartNotify", ())
}

fn stop_notify(conn: &Connection, char_path: &str) {
    let proxy = conn.with_proxy(BLUEZ, char_path.to_string(), call_timeout());
    if let Err(e) = proxy.method_call::<(), _, _, _>(IFACE_CHARACTERISTIC, "StopNotify", ()) {
        log::debug!("StopNotify {char_path}: {e}");
    }
}

fn properties_changed_rule(path: &str) -> String {
    format!(
        "type='signal',interface='{IFACE_PROPERTIES}',member='PropertiesChanged',path='{path}'"
    )
}

/// Subscribes every notify-capable resolved characteristic and records the
/// paths on the context.
pub fn attach(rt: &Rt, devnode: &str, decl: InputDecl) -> Result<InputCtx, AttachError> {
    ensure_connection(rt)?;

    if devnode.is_empty() {
        return Err(AttachError::Failed(format!(
            "no GATT path resolved for '{}'",
            decl.id
        )));
    }

    let path_type = classify_path(devnode);
    let device_path = match path_type {
        GattPathType::Characteristic => device_root(devnode).ok_or_else(|| {
            AttachError::Failed(format!("cannot derive device path from {devnode}"))
        })?,
        _ => devnode.to_string(),
    };

    let state = rt.state();
    let conn = state
        .gatt
        .conn
        .as_ref()
        .ok_or_else(|| AttachError::Failed("no bus connection".into()))?;

    let candidates = match path_type {
        GattPathType::Characteristic => vec![devnode.to_string()],
        _ => {
            let objects = collect_objects(conn)?;
            resolve_paths(&decl, &objects, true).1
        }
    };

    let mut subscribed = Vec::new();
    for char_path in candidates {
        let flags = characteristic_flags(conn, &char_path);
        log_characteristic(conn, &char_path, &flags);
        if !flags.iter().any(|f| f == "notify") {
            continue;
        }
        conn.add_match_no_cb(&properties_changed_rule(&char_path))?;
        start_notify(conn, &char_path)?;
        subscribed.push(char_path);
    }
    drop(state);

    log::info!("attached gatt '{}' at {devnode}", decl.id);
    Ok(InputCtx {
        decl,
        fd: -1,
        backend: BackendHandle::Gatt(GattHandle {
            path: devnode.to_string(),
            device_path,
            subscribed,
        }),
        active: true,
        grab_pending: false,
        haptics: SinkHaptics::default(),
    })
}

pub fn detach(rt: &Rt, ctx: &mut InputCtx) {
    let BackendHandle::Gatt(handle) = &ctx.backend else {
        return;
    };
    let state = rt.state();
    let Some(conn) = state.gatt.conn.as_ref() else {
        return;
    };
    for char_path in &handle.subscribed {
        stop_notify(conn, char_path);
    }
}

struct Notification {
    path: String,
    data: Vec<u8>,
}

/// Reactor callback: read the connection, then drain all pending messages.
pub fn handle_event(rt: &Rt) {
    let notifications: Vec<Notification> = {
        let state = rt.state();
        let Some(conn) = state.gatt.conn.as_ref() else {
            return;
        };
        let channel = conn.channel();
        let _ = channel.read_write(Some(Duration::from_millis(0)));

        let mut out = Vec::new();
        while let Some(message) = channel.pop_message() {
            if let Some(n) = parse_notification(&message) {
                out.push(n);
            }
        }
        out
    };

    for notification in notifications {
        deliver(rt, notification);
    }
}

fn parse_notification(message: &dbus::Message) -> Option<Notification> {
    if message.member()?.to_string() != "PropertiesChanged" {
        return None;
    }
    let path = message.path()?.to_string();

    let (iface, changed): (String, PropMap) = message.read2().ok()?;
    if iface != IFACE_CHARACTERISTIC {
        return None;
    }
    let data: Vec<u8> = prop_cast::<Vec<u8>>(&changed, "Value")?.clone();
    Some(Notification { path, data })
}

fn deliver(rt: &Rt, notification: Notification) {
    let (id, on_event) = {
        let state = rt.state();
        let contexts: Vec<(String, String)> = state
            .input_map
            .values()
            .filter_map(|ctx| match &ctx.backend {
                BackendHandle::Gatt(handle) => {
                    Some((ctx.decl.id.clone(), handle.path.clone()))
                }
                _ => None,
            })
            .collect();

        let id = route_notification(&contexts, &notification.path)
            .or_else(|| contexts.first().map(|(id, _)| id.clone()));
        let Some(id) = id else {
            return;
        };
        let on_event = state
            .input_map
            .get(&id)
            .map(|ctx| ctx.decl.on_event.clone())
            .unwrap_or_default();
        (id, on_event)
    };

    if on_event.is_empty() {
        return;
    }
    script::call_with_gatt_event(rt, &on_event, &id, &notification.path, &notification.data);
}

/// Builds an explicit characteristic path from handle overrides, or falls
/// back to the context's resolved path.
pub fn resolve_char_path(handle: &GattHandle, service: i32, characteristic: i32) -> Option<String> {
    if service <= 0 && characteristic <= 0 {
        return Some(handle.path.clone());
    }
    if service <= 0 || characteristic <= 0 {
        return None;
    }
    Some(format!(
        "{}/service{:04X}/char{:04X}",
        handle.device_path, service, characteristic
    ))
}

/// Synchronous blocking ReadValue.
pub fn read_characteristic(rt: &Rt, char_path: &str) -> Result<Vec<u8>, dbus::Error> {
    let state = rt.state();
    let conn = state
        .gatt
        .conn
        .as_ref()
        .ok_or_else(|| dbus::Error::new_custom("aelkey.gatt", "no bus connection"))?;
    let proxy = conn.with_proxy(BLUEZ, char_path.to_string(), call_timeout());
    let (data,): (Vec<u8>,) =
        proxy.method_call(IFACE_CHARACTERISTIC, "ReadValue", (PropMap::new(),))?;
    Ok(data)
}

/// Synchronous blocking WriteValue. `with_resp` sets the `type=request`
/// option.
pub fn write_characteristic(
    rt: &Rt,
    char_path: &str,
    data: &[u8],
    with_resp: bool,
) -> Result<(), dbus::Error> {
    let state = rt.state();
    let conn = state
        .gatt
        .conn
        .as_ref()
        .ok_or_else(|| dbus::Error::new_custom("aelkey.gatt", "no bus connection"))?;
    let proxy = conn.with_proxy(BLUEZ, char_path.to_string(), call_timeout());

    let mut options = PropMap::new();
    if with_resp {
        options.insert(
            "type".to_string(),
            Variant(Box::new("request".to_string()) as Box<dyn RefArg>),
        );
    }
    proxy.method_call::<(), _, _, _>(
        IFACE_CHARACTERISTIC,
        "WriteValue",
        (data.to_vec(), options),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeclType;

    fn decl(uniq: &str, name: &str, service: u16, characteristic: u16) -> InputDecl {
        InputDecl {
            id: "ble".into(),
            kind: DeclType::Gatt,
            vendor: 0,
            product: 0,
            bus: None,
            interface: -1,
            name: name.into(),
            phys: String::new(),
            uniq: uniq.into(),
            grab: false,
            capabilities: Vec::new(),
            service,
            characteristic,
            client: String::new(),
            port: String::new(),
            on_event: String::new(),
            on_state: String::new(),
            devnode: String::new(),
        }
    }

    const DEV: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF";

    fn objects() -> GattObjects {
        GattObjects {
            devices: vec![GattDeviceProps {
                path: DEV.into(),
                name: "Thermo Sensor".into(),
                alias: "thermo".into(),
                address: "AA:BB:CC:DD:EE:FF".into(),
            }],
            services: vec![
                format!("{DEV}/service0021"),
                format!("{DEV}/service0040"),
            ],
            characteristics: vec![
                format!("{DEV}/service0021/char0036"),
                format!("{DEV}/service0021/char0039"),
                format!("{DEV}/service0040/char0041"),
            ],
        }
    }

    #[test]
    fn path_classification() {
        assert_eq!(classify_path(DEV), GattPathType::Device);
        assert_eq!(
            classify_path(&format!("{DEV}/service0021")),
            GattPathType::Service
        );
        assert_eq!(
            classify_path(&format!("{DEV}/service0021/char0036")),
            GattPathType::Characteristic
        );
    }

    #[test]
    fn device_root_derivation() {
        assert_eq!(
            device_root(&format!("{DEV}/service0021/char0036")),
            Some(DEV.to_string())
        );
        assert_eq!(device_root(DEV), None);
    }

    #[test]
    fn handle_parsing() {
        let path = format!("{DEV}/service0021/char0036");
        assert_eq!(parse_handle(&path, "service"), Some(0x0021));
        assert_eq!(parse_handle(&path, "char"), Some(0x0036));
        assert_eq!(parse_handle(DEV, "char"), None);
    }

    #[test]
    fn resolves_most_specific_requested_path() {
        let objects = objects();

        // Device only.
        let (path, _) = resolve_paths(&decl("AA:BB:CC:DD:EE:FF", "", 0, 0), &objects, false);
        assert_eq!(path.as_deref(), Some(DEV));

        // Device + service.
        let (path, _) = resolve_paths(&decl("AA:BB:CC:DD:EE:FF", "", 0x21, 0), &objects, false);
        assert_eq!(path, Some(format!("{DEV}/service0021")));

        // Fully specified.
        let (path, _) = resolve_paths(
            &decl("AA:BB:CC:DD:EE:FF", "", 0x21, 0x36),
            &objects,
            false,
        );
        assert_eq!(path, Some(format!("{DEV}/service0021/char0036")));
    }

    #[test]
    fn name_and_alias_match_with_patterns() {
        let objects = objects();
        let (path, _) = resolve_paths(&decl("", "^Thermo .*$", 0, 0), &objects, false);
        assert_eq!(path.as_deref(), Some(DEV));

        let (path, _) = resolve_paths(&decl("", "thermo", 0, 0), &objects, false);
        assert_eq!(path.as_deref(), Some(DEV));

        let (path, _) = resolve_paths(&decl("", "other", 0, 0), &objects, false);
        assert_eq!(path, None);
    }

    #[test]
    fn unmatched_handles_resolve_nothing() {
        let objects = objects();
        let (path, _) = resolve_paths(&decl("AA:BB:CC:DD:EE:FF", "", 0x99, 0), &objects, false);
        assert_eq!(path, None);

        let (path, _) = resolve_paths(
            &decl("AA:BB:CC:DD:EE:FF", "", 0x21, 0x99),
            &objects,
            false,
        );
        assert_eq!(path, None);
    }

    #[test]
    fn collect_returns_all_characteristics_under_matching_services() {
        let objects = objects();
        let (_, chars) = resolve_paths(&decl("AA:BB:CC:DD:EE:FF", "", 0x21, 0), &objects, true);
        assert_eq!(chars.len(), 2);
        assert!(chars.iter().all(|c| c.contains("service0021")));
    }

    #[test]
    fn notifications_route_by_longest_prefix() {
        let contexts = vec![
            ("dev".to_string(), DEV.to_string()),
            (
                "char".to_string(),
                format!("{DEV}/service0021/char0036"),
            ),
        ];
        let routed = route_notification(&contexts, &format!("{DEV}/service0021/char0036"));
        assert_eq!(routed.as_deref(), Some("char"));

        let routed = route_notification(&contexts, &format!("{DEV}/service0040/char0041"));
        assert_eq!(routed.as_deref(), Some("dev"));

        let routed = route_notification(&contexts, "/org/bluez/hci0/dev_other");
        assert_eq!(routed, None);
    }

    #[test]
    fn char_path_overrides() {
        let handle = GattHandle {
            path: format!("{DEV}/service0021/char0036"),
            device_path: DEV.into(),
            subscribed: Vec::new(),
        };
        assert_eq!(
            resolve_char_path(&handle, -1, -1),
            Some(format!("{DEV}/service0021/char0036"))
        );
        assert_eq!(
            resolve_char_path(&handle, 0x21, 0x39),
            Some(format!("{DEV}/service0021/char0039"))
        );
        assert_eq!(resolve_char_path(&handle, 0x21, -1), None);
    }
}
