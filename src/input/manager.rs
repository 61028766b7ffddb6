//! Declaration `type` → backend routing and the attach/detach lifecycle.

use std::os::fd::RawFd;

use crate::config::{DeclType, InputDecl};
use crate::input::source::{evdev, gatt, hidraw, midi, usb};
use crate::input::{AttachError, InputCtx};
use crate::runtime::Rt;
use crate::script;

/// Asks the backend for this declaration type to find a matching device.
/// Returns the resolved devnode (a /dev node, sysfs path, object path or
/// MIDI locator). A miss is silent; the declaration stays eligible for
/// hot-plug.
pub fn match_decl(rt: &Rt, decl: &InputDecl) -> Option<String> {
    match decl.kind {
        DeclType::Evdev => evdev::match_device(decl),
        DeclType::Hidraw => hidraw::match_device(decl),
        DeclType::Libusb => usb::match_device(decl),
        DeclType::Gatt => gatt::match_device(rt, decl),
        DeclType::Midi => midi::match_device(rt, decl),
    }
}

/// Attaches the device at `devnode` for `decl`. Lazily initializes the
/// transport, refuses duplicate ids, and registers the resulting context
/// and an empty frame buffer.
pub fn attach(rt: &Rt, devnode: &str, decl: &InputDecl) -> Result<(), AttachError> {
    if rt.state().input_map.contains_key(&decl.id) {
        return Err(AttachError::Duplicate(decl.id.clone()));
    }

    let mut decl = decl.clone();
    decl.devnode = devnode.to_string();

    let ctx = match decl.kind {
        DeclType::Evdev => evdev::attach(rt, devnode, decl)?,
        DeclType::Hidraw => hidraw::attach(rt, devnode, decl)?,
        DeclType::Libusb => usb::attach(rt, devnode, decl)?,
        DeclType::Gatt => gatt::attach(rt, devnode, decl)?,
        DeclType::Midi => midi::attach(rt, devnode, decl)?,
    };

    let mut state = rt.state_mut();
    let id = ctx.decl.id.clone();
    if ctx.fd >= 0 {
        state.fd_index.insert(ctx.fd, id.clone());
    }
    state.frames.insert(id.clone(), Vec::new());
    state.input_map.insert(id, ctx);
    Ok(())
}

/// Detaches the input with the given id. Returns its declaration so the
/// caller can deliver `on_state`. On return no further callbacks for this
/// id will fire.
pub fn detach(rt: &Rt, id: &str) -> Option<InputDecl> {
    let mut ctx = {
        let mut state = rt.state_mut();
        let ctx = state.input_map.remove(id)?;
        state.frames.remove(id);
        if ctx.fd >= 0 {
            state.fd_index.remove(&ctx.fd);
        }
        ctx
    };

    match ctx.decl.kind {
        DeclType::Evdev => evdev::detach(rt, &mut ctx),
        DeclType::Hidraw => hidraw::detach(rt, &mut ctx),
        DeclType::Libusb => usb::detach(rt, &mut ctx),
        DeclType::Gatt => gatt::detach(rt, &mut ctx),
        DeclType::Midi => midi::detach(rt, &mut ctx),
    }

    ctx.active = false;
    log::info!("detached input '{id}'");
    Some(ctx.decl)
}

/// Detaches by fd, for dispatchers reacting to hang-up/error readiness.
pub fn detach_by_fd(rt: &Rt, fd: RawFd) -> Option<InputDecl> {
    let id = rt.state().fd_index.get(&fd).cloned()?;
    detach(rt, &id)
}

/// Opens everything: parses declarations from the script environment,
/// creates the virtual outputs, then matches and attaches every declared
/// input. Errors are declaration-level; match misses and attach failures
/// are logged and leave the declaration eligible for hot-plug.
pub fn open_all(rt: &Rt) -> Result<(), String> {
    {
        let state = rt.state();
        if state.opened && (!state.input_map.is_empty() || !state.outputs.is_empty()) {
            return Ok(());
        }
    }

    crate::udev::ensure_monitor(rt).map_err(|e| e.to_string())?;
    script::parse_declarations(rt).map_err(|e| e.to_string())?;
    crate::input::target::create_outputs(rt).map_err(|e| e.to_string())?;

    let decls: Vec<InputDecl> = rt.state().input_decls.clone();
    for decl in decls {
        attach_declared(rt, &decl);
    }

    rt.state_mut().opened = true;
    Ok(())
}

/// Opens one declared input by id. Parses declarations first if this is
/// the first open.
pub fn open_one(rt: &Rt, id: &str) -> Result<bool, String> {
    crate::udev::ensure_monitor(rt).map_err(|e| e.to_string())?;

    let parsed = {
        let state = rt.state();
        !state.input_decls.is_empty() || !state.output_decls.is_empty()
    };
    if !parsed {
        script::parse_declarations(rt).map_err(|e| e.to_string())?;
        crate::input::target::create_outputs(rt).map_err(|e| e.to_string())?;
    }

    let decl = rt
        .state()
        .input_decls
        .iter()
        .find(|d| d.id == id)
        .cloned();
    let Some(decl) = decl else {
        return Err(format!("unknown device id '{id}'"));
    };

    Ok(attach_declared(rt, &decl))
}

/// Match + attach + notify for one declaration. Returns true when the
/// device ended up attached.
pub fn attach_declared(rt: &Rt, decl: &InputDecl) -> bool {
    let Some(devnode) = match_decl(rt, decl) else {
        return false;
    };

    match attach(rt, &devnode, decl) {
        Ok(()) => {
            // Record the resolved node on the declaration for hot-plug
            // removal matching.
            let mut state = rt.state_mut();
            if let Some(d) = state.input_decls.iter_mut().find(|d| d.id == decl.id) {
                d.devnode = devnode.clone();
            }
            drop(state);
            script::notify_state(rt, decl, "add");
            true
        }
        Err(AttachError::Duplicate(_)) => false,
        Err(e) => {
            log::warn!("failed to attach '{}' at {devnode}: {e}", decl.id);
            false
        }
    }
}
