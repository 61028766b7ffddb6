//! Hot-plug source of truth: a netlink monitor over the input, hidraw and
//! usb subsystems, plus the enumeration entry point backends use for
//! initial matching.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use thiserror::Error;
use udev::{Enumerator, EventType, MonitorBuilder, MonitorSocket};

use crate::config::{DeclType, InputDecl};
use crate::input::manager;
use crate::runtime::reactor::Owner;
use crate::runtime::Rt;
use crate::script;

#[derive(Debug, Error)]
pub enum UdevError {
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct UdevMonitor {
    socket: MonitorSocket,
}

impl UdevMonitor {
    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// Creates the netlink monitor and registers it with the reactor.
/// Idempotent.
pub fn ensure_monitor(rt: &Rt) -> Result<(), UdevError> {
    if rt.state().udev.is_some() {
        return Ok(());
    }

    let socket = MonitorBuilder::new()?
        .match_subsystem("input")?
        .match_subsystem("hidraw")?
        .match_subsystem("usb")?
        .listen()?;

    let mut state = rt.state_mut();
    let fd = socket.as_raw_fd();
    state.reactor.register(fd, Owner::Udev)?;
    state.udev = Some(UdevMonitor { socket });
    log::debug!("udev monitor listening (fd={fd})");
    Ok(())
}

/// Enumerates the given subsystem and returns the first devnode the
/// predicate accepts.
pub fn enumerate_and_match<F>(subsystem: &str, predicate: F) -> Option<String>
where
    F: Fn(&udev::Device) -> Option<String>,
{
    let mut enumerator = match Enumerator::new() {
        Ok(e) => e,
        Err(e) => {
            log::warn!("udev enumerator: {e}");
            return None;
        }
    };
    if let Err(e) = enumerator.match_subsystem(subsystem) {
        log::warn!("udev match_subsystem {subsystem}: {e}");
        return None;
    }

    let devices = match enumerator.scan_devices() {
        Ok(devices) => devices,
        Err(e) => {
            log::warn!("udev scan_devices: {e}");
            return None;
        }
    };

    for device in devices {
        if let Some(devnode) = predicate(&device) {
            return Some(devnode);
        }
    }
    None
}

struct HotplugEvent {
    event_type: EventType,
    subsystem: String,
    devnode: Option<String>,
    syspath: String,
}

/// Reactor callback for the monitor fd: drain all pending events, then act
/// on each add/remove.
pub fn handle_event(rt: &Rt) {
    let events: Vec<HotplugEvent> = {
        let mut state = rt.state_mut();
        let Some(monitor) = &mut state.udev else {
            return;
        };
        monitor
            .socket
            .iter()
            .map(|event| {
                let device = event.device();
                HotplugEvent {
                    event_type: event.event_type(),
                    subsystem: device
                        .subsystem()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_default(),
                    devnode: device
                        .devnode()
                        .map(|n| n.to_string_lossy().to_string()),
                    syspath: device.syspath().to_string_lossy().to_string(),
                }
            })
            .collect()
    };

    for event in events {
        match event.event_type {
            EventType::Add => handle_add(rt, &event),
            EventType::Remove => handle_remove(rt, &event),
            _ => (),
        }
    }
}

/// The node a declaration of this type is identified by in hot-plug
/// traffic: USB declarations track the syspath, fd-backed ones the devnode.
fn hotplug_node(kind: DeclType, event: &HotplugEvent) -> Option<String> {
    match kind {
        DeclType::Libusb => Some(event.syspath.clone()),
        _ => event.devnode.clone(),
    }
}

fn subsystem_matches(kind: DeclType, subsystem: &str) -> bool {
    kind.subsystem() == Some(subsystem)
}

fn handle_add(rt: &Rt, event: &HotplugEvent) {
    // Lifecycle-only observers first.
    let watch_entries: Vec<(String, usize, InputDecl)> = {
        let state = rt.state();
        state
            .watch_map
            .iter()
            .flat_map(|(r, decls)| {
                decls
                    .iter()
                    .enumerate()
                    .map(move |(i, d)| (r.clone(), i, d.clone()))
            })
            .collect()
    };
    for (watch_ref, index, decl) in watch_entries {
        if !subsystem_matches(decl.kind, &event.subsystem) {
            continue;
        }
        let Some(node) = hotplug_node(decl.kind, event) else {
            continue;
        };
        let Some(matched) = manager::match_decl(rt, &decl) else {
            continue;
        };
        if matched != node {
            continue;
        }

        {
            let mut state = rt.state_mut();
            if let Some(entry) = state
                .watch_map
                .get_mut(&watch_ref)
                .and_then(|v| v.get_mut(index))
            {
                entry.devnode = node.clone();
            }
        }
        script::notify_state(rt, &decl, "add");
    }

    // Declared inputs.
    let decls: Vec<InputDecl> = rt.state().input_decls.clone();
    for decl in decls {
        if !subsystem_matches(decl.kind, &event.subsystem) {
            continue;
        }
        let Some(node) = hotplug_node(decl.kind, event) else {
            continue;
        };
        if rt.state().input_map.contains_key(&decl.id) {
            continue;
        }
        let Some(matched) = manager::match_decl(rt, &decl) else {
            continue;
        };
        if matched != node {
            continue;
        }

        if manager::attach(rt, &node, &decl).is_ok() {
            let mut state = rt.state_mut();
            if let Some(d) = state.input_decls.iter_mut().find(|d| d.id == decl.id) {
                d.devnode = node.clone();
            }
            drop(state);
            log::info!("hotplug attached '{}' at {node}", decl.id);
            script::notify_state(rt, &decl, "add");
        }
        break;
    }
}

fn handle_remove(rt: &Rt, event: &HotplugEvent) {
    // Watch entries.
    let watch_entries: Vec<(String, usize, InputDecl)> = {
        let state = rt.state();
        state
            .watch_map
            .iter()
            .flat_map(|(r, decls)| {
                decls
                    .iter()
                    .enumerate()
                    .map(move |(i, d)| (r.clone(), i, d.clone()))
            })
            .collect()
    };
    for (watch_ref, index, decl) in watch_entries {
        if !subsystem_matches(decl.kind, &event.subsystem) {
            continue;
        }
        let Some(node) = hotplug_node(decl.kind, event) else {
            continue;
        };
        if decl.devnode.is_empty() || decl.devnode != node {
            continue;
        }

        {
            let mut state = rt.state_mut();
            if let Some(entry) = state
                .watch_map
                .get_mut(&watch_ref)
                .and_then(|v| v.get_mut(index))
            {
                entry.devnode.clear();
            }
        }
        script::notify_state(rt, &decl, "remove");
    }

    // Attached inputs.
    let removed_id: Option<String> = {
        let state = rt.state();
        state
            .input_map
            .values()
            .find(|ctx| {
                subsystem_matches(ctx.decl.kind, &event.subsystem)
                    && hotplug_node(ctx.decl.kind, event)
                        .map(|n| n == ctx.decl.devnode)
                        .unwrap_or(false)
            })
            .map(|ctx| ctx.decl.id.clone())
    };

    if let Some(id) = removed_id {
        if let Some(decl) = manager::detach(rt, &id) {
            let mut state = rt.state_mut();
            if let Some(d) = state.input_decls.iter_mut().find(|d| d.id == id) {
                d.devnode.clear();
            }
            drop(state);
            log::info!("hotplug removed '{id}'");
            script::notify_state(rt, &decl, "remove");
        }
    }
}
