pub mod reactor;
pub mod tick;

use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mio::{Events, Token};
use mlua::Lua;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use thiserror::Error;

use crate::config::{InputDecl, OutputDecl};
use crate::constants::ALLOW_ROOT_ENV;
use crate::input::haptics::HapticsSource;
use crate::input::source::{evdev, gatt, hidraw, midi, usb};
use crate::input::{haptics, InputCtx};
use crate::input::target::VirtualOutput;
use crate::runtime::reactor::{Owner, Reactor, Readiness};
use crate::runtime::tick::TickScheduler;
use crate::udev::UdevMonitor;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("refusing to run as root; set {} to override", ALLOW_ROOT_ENV)]
    RootRefused,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("script: {0}")]
    Script(String),
}

/// Process-wide registry. Owned by the reactor thread and mutated only from
/// dispatcher callbacks, the script bridge, or the shutdown path.
pub struct State {
    pub reactor: Reactor,
    pub ticks: TickScheduler,

    pub input_decls: Vec<InputDecl>,
    pub output_decls: Vec<OutputDecl>,

    /// Attached inputs keyed by stable declaration id.
    pub input_map: HashMap<String, InputCtx>,
    /// fd → input id, for dispatchers whose inputs own a single fd.
    pub fd_index: HashMap<RawFd, String>,
    /// Per-input evdev frame buffers, flushed on SYN_REPORT.
    pub frames: HashMap<String, Vec<::evdev::InputEvent>>,

    /// Virtual uinput outputs keyed by id.
    pub outputs: HashMap<String, VirtualOutput>,
    /// Haptics sources (FF-capable outputs) keyed by output id.
    pub sources: HashMap<String, HapticsSource>,

    /// Lifecycle-only observers keyed by watch reference.
    pub watch_map: HashMap<String, Vec<InputDecl>>,

    pub udev: Option<UdevMonitor>,
    pub usb: usb::UsbState,
    pub gatt: gatt::GattState,
    pub midi: midi::MidiState,

    /// Declarations have been parsed and devices opened at least once.
    pub opened: bool,
    pub stop: bool,
}

impl State {
    fn new() -> io::Result<Self> {
        Ok(Self {
            reactor: Reactor::new()?,
            ticks: TickScheduler::new(),
            input_decls: Vec::new(),
            output_decls: Vec::new(),
            input_map: HashMap::new(),
            fd_index: HashMap::new(),
            frames: HashMap::new(),
            outputs: HashMap::new(),
            sources: HashMap::new(),
            watch_map: HashMap::new(),
            udev: None,
            usb: usb::UsbState::default(),
            gatt: gatt::GattState::default(),
            midi: midi::MidiState::default(),
            opened: false,
            stop: false,
        })
    }

    pub fn source_id_by_fd(&self, fd: RawFd) -> Option<String> {
        self.sources
            .values()
            .find(|s| s.fd == fd)
            .map(|s| s.id.clone())
    }
}

struct RtInner {
    state: RefCell<State>,
    lua: Lua,
    /// Terminating signal number, 0 = none. Written from signal handlers.
    signal: Arc<AtomicUsize>,
    /// libusb pollfd notifier queue. Kept outside `state` so the notifier
    /// callbacks never contend with a held registry borrow.
    usb_fd_events: RefCell<Vec<usb::UsbFdEvent>>,
}

/// Handle to the runtime: the registry, the script interpreter, and the
/// signal cell, shared between the reactor loop and the Lua bridge.
#[derive(Clone)]
pub struct Rt {
    inner: Rc<RtInner>,
}

impl Rt {
    pub fn new() -> Result<Self, RuntimeError> {
        ensure_not_root()?;
        Ok(Self {
            inner: Rc::new(RtInner {
                state: RefCell::new(State::new()?),
                lua: Lua::new(),
                signal: Arc::new(AtomicUsize::new(0)),
                usb_fd_events: RefCell::new(Vec::new()),
            }),
        })
    }

    pub fn lua(&self) -> &Lua {
        &self.inner.lua
    }

    pub fn state(&self) -> Ref<'_, State> {
        self.inner.state.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, State> {
        self.inner.state.borrow_mut()
    }

    pub fn push_usb_fd_event(&self, ev: usb::UsbFdEvent) {
        self.inner.usb_fd_events.borrow_mut().push(ev);
    }

    pub fn take_usb_fd_events(&self) -> Vec<usb::UsbFdEvent> {
        std::mem::take(&mut *self.inner.usb_fd_events.borrow_mut())
    }

    /// Invokes the script global `name` as a protected call. Missing
    /// globals and non-function values are skipped; errors are logged and
    /// never propagate into the reactor.
    ///
    /// Callers must not hold a registry borrow across this call.
    pub fn call_global<A: mlua::IntoLuaMulti>(&self, name: &str, args: A) {
        if name.is_empty() {
            return;
        }
        let func: Option<mlua::Function> = self.inner.lua.globals().get(name).unwrap_or(None);
        let Some(func) = func else {
            return;
        };
        if let Err(e) = func.call::<()>(args) {
            log::warn!("script callback '{name}' error: {e}");
        }
    }

    pub fn call_global_nullary(&self, name: &str) {
        self.call_global(name, ());
    }

    /// Requests loop termination; the current dispatch completes first.
    pub fn request_stop(&self) {
        self.state_mut().stop = true;
    }

    fn should_stop(&self) -> bool {
        self.state().stop || self.inner.signal.load(Ordering::Relaxed) != 0
    }

    /// Installs signal handlers, opens all declared devices, and blocks in
    /// the readiness loop until stopped. Cleanup is synchronous; a recorded
    /// terminating signal is re-raised with the default handler afterwards.
    pub fn run(&self) -> Result<(), RuntimeError> {
        for sig in [SIGHUP, SIGINT, SIGTERM] {
            signal_hook::flag::register_usize(
                sig,
                Arc::clone(&self.inner.signal),
                sig as usize,
            )?;
        }

        crate::input::manager::open_all(self).map_err(RuntimeError::Script)?;

        let mut events = Events::with_capacity(64);
        while !self.should_stop() {
            let res = self.state_mut().reactor.poll(&mut events, None);
            if let Err(e) = res {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("reactor poll failed: {e}");
                break;
            }

            for event in events.iter() {
                let token = event.token();
                let Some((owner, fd)) = self.state().reactor.lookup(token) else {
                    continue;
                };
                self.dispatch(owner, token, fd, Readiness::from_event(event));
                if self.should_stop() {
                    break;
                }
            }

            self.state_mut().reactor.compact();
        }

        self.shutdown();

        let sig = self.inner.signal.load(Ordering::Relaxed);
        if sig != 0 {
            log::info!("re-raising signal {sig}");
            let _ = signal_hook::low_level::emulate_default_handler(sig as i32);
        }

        Ok(())
    }

    fn dispatch(&self, owner: Owner, token: Token, fd: RawFd, ready: Readiness) {
        match owner {
            Owner::Udev => crate::udev::handle_event(self),
            Owner::Evdev => evdev::handle_event(self, fd, ready),
            Owner::Hidraw => hidraw::handle_event(self, fd, ready),
            Owner::Usb => usb::handle_event(self, fd, ready),
            Owner::Gatt => gatt::handle_event(self),
            Owner::Haptics => haptics::handle_event(self, fd, ready),
            Owner::Tick => tick::handle_event(self, token),
        }
    }

    /// Releases every resource in reverse dependency order: inputs first
    /// (ungrab where applicable), then timers, haptics sources and virtual
    /// outputs, then the transport contexts and the monitor.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.state().input_map.keys().cloned().collect();
        for id in ids {
            crate::input::manager::detach(self, &id);
        }

        let mut state = self.state_mut();
        let state = &mut *state;

        state.ticks.cancel_all(&mut state.reactor);

        for (_, source) in state.sources.drain() {
            state.reactor.unregister(source.fd);
        }
        state.outputs.clear();

        if let Some(monitor) = state.udev.take() {
            state.reactor.unregister(monitor.raw_fd());
        }

        gatt::teardown(state);
        usb::teardown(state);

        state.reactor.clear();
        state.frames.clear();
        state.fd_index.clear();
        state.opened = false;
    }
}

fn ensure_not_root() -> Result<(), RuntimeError> {
    let allow = std::env::var(ALLOW_ROOT_ENV).ok();
    check_root_gate(nix::unistd::Uid::effective().is_root(), allow.as_deref())
}

/// Running as the superuser is refused unless the override variable is set
/// to a non-empty string.
pub fn check_root_gate(euid_is_root: bool, allow: Option<&str>) -> Result<(), RuntimeError> {
    if euid_is_root && allow.map(|v| v.is_empty()).unwrap_or(true) {
        return Err(RuntimeError::RootRefused);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_gate_refuses_root_without_override() {
        assert!(check_root_gate(true, None).is_err());
        assert!(check_root_gate(true, Some("")).is_err());
    }

    #[test]
    fn root_gate_allows_root_with_override() {
        assert!(check_root_gate(true, Some("1")).is_ok());
        assert!(check_root_gate(true, Some("yes")).is_ok());
    }

    #[test]
    fn root_gate_ignores_override_for_normal_users() {
        assert!(check_root_gate(false, None).is_ok());
        assert!(check_root_gate(false, Some("")).is_ok());
    }
}
