//! Periodic timers sharing the reactor.
//!
//! Each scheduled tick owns a timer fd registered under [`Owner::Tick`].
//! Callbacks are a native closure, a Lua function value, or a Lua global
//! resolved by name at fire time. One-shot timers remove themselves after
//! dispatch.

use std::collections::HashMap;
use std::io;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::Duration;

use mio::Token;
use mio_timerfd::{ClockId, TimerFd};

use crate::runtime::reactor::{Owner, Reactor};
use crate::runtime::Rt;

/// What to invoke when a tick fires. Native closures take priority over Lua
/// function values, which take priority over globals resolved by name.
#[derive(Clone)]
pub enum TickCallback {
    Native(Rc<dyn Fn(&Rt)>),
    Function(mlua::Function),
    Global(String),
}

#[derive(Clone)]
pub struct TickCb {
    pub callback: TickCallback,
    pub oneshot: bool,
}

/// Cancellation key: Lua function identity or global name equality.
pub enum TickKey {
    Function(mlua::Function),
    Global(String),
}

impl TickKey {
    fn matches(&self, cb: &TickCallback) -> bool {
        match (self, cb) {
            (TickKey::Function(a), TickCallback::Function(b)) => {
                a.to_pointer() == b.to_pointer()
            }
            (TickKey::Global(a), TickCallback::Global(b)) => a == b,
            _ => false,
        }
    }
}

struct TickEntry {
    timer: TimerFd,
    cb: TickCb,
}

#[derive(Default)]
pub struct TickScheduler {
    timers: HashMap<Token, TickEntry>,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a timer fd firing after (and, unless one-shot, every) `ms`
    /// milliseconds and registers it with the reactor.
    pub fn schedule(
        &mut self,
        reactor: &mut Reactor,
        ms: u64,
        cb: TickCb,
    ) -> io::Result<Token> {
        let mut timer = TimerFd::new(ClockId::Monotonic)?;
        let interval = Duration::from_millis(ms);
        if cb.oneshot {
            timer.set_timeout(&interval)?;
        } else {
            timer.set_timeout_interval(&interval)?;
        }

        let token = reactor.register(timer.as_raw_fd(), Owner::Tick)?;
        self.timers.insert(token, TickEntry { timer, cb });
        Ok(token)
    }

    /// Cancels one timer by token. Closing the timer fd happens when the
    /// entry drops.
    pub fn cancel(&mut self, reactor: &mut Reactor, token: Token) {
        if let Some(entry) = self.timers.remove(&token) {
            reactor.unregister(entry.timer.as_raw_fd());
        }
    }

    /// Cancels every timer whose callback matches the given key. Returns the
    /// number of timers removed.
    pub fn cancel_matching(&mut self, reactor: &mut Reactor, key: &TickKey) -> usize {
        let matching: Vec<Token> = self
            .timers
            .iter()
            .filter(|(_, e)| key.matches(&e.cb.callback))
            .map(|(t, _)| *t)
            .collect();
        for token in &matching {
            self.cancel(reactor, *token);
        }
        matching.len()
    }

    pub fn cancel_all(&mut self, reactor: &mut Reactor) {
        let tokens: Vec<Token> = self.timers.keys().copied().collect();
        for token in tokens {
            self.cancel(reactor, token);
        }
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn count_matching(&self, key: &TickKey) -> usize {
        self.timers
            .values()
            .filter(|e| key.matches(&e.cb.callback))
            .count()
    }

    /// Reads the expiration counter and returns a copy of the callback, or
    /// `None` if the token no longer names a timer.
    fn take_fire(&mut self, token: Token) -> Option<TickCb> {
        let entry = self.timers.get_mut(&token)?;
        match entry.timer.read() {
            Ok(_expirations) => Some(entry.cb.clone()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                log::debug!("tick timer read: {e}");
                None
            }
        }
    }
}

/// Reactor callback for [`Owner::Tick`] tokens.
pub fn handle_event(rt: &Rt, token: Token) {
    let cb = {
        let mut state = rt.state_mut();
        match state.ticks.take_fire(token) {
            Some(cb) => cb,
            None => return,
        }
    };

    match &cb.callback {
        TickCallback::Native(f) => f(rt),
        TickCallback::Function(f) => {
            if let Err(e) = f.call::<()>(()) {
                log::warn!("tick callback error: {e}");
            }
        }
        TickCallback::Global(name) => rt.call_global_nullary(name),
    }

    if cb.oneshot {
        let mut state = rt.state_mut();
        let state = &mut *state;
        state.ticks.cancel(&mut state.reactor, token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native(tag: &'static str) -> TickCb {
        // The tag keeps closures distinct without capturing state.
        TickCb {
            callback: TickCallback::Native(Rc::new(move |_| {
                let _ = tag;
            })),
            oneshot: false,
        }
    }

    fn global(name: &str) -> TickCb {
        TickCb {
            callback: TickCallback::Global(name.to_string()),
            oneshot: false,
        }
    }

    #[test]
    fn schedule_and_cancel_by_key() {
        let mut reactor = Reactor::new().unwrap();
        let mut ticks = TickScheduler::new();

        ticks.schedule(&mut reactor, 100, global("foo")).unwrap();
        ticks.schedule(&mut reactor, 200, global("bar")).unwrap();
        assert_eq!(ticks.len(), 2);
        assert_eq!(reactor.len(), 2);

        let removed = ticks.cancel_matching(&mut reactor, &TickKey::Global("foo".into()));
        assert_eq!(removed, 1);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks.count_matching(&TickKey::Global("foo".into())), 0);
        assert_eq!(ticks.count_matching(&TickKey::Global("bar".into())), 1);
    }

    #[test]
    fn rescheduling_same_key_leaves_one_timer() {
        let mut reactor = Reactor::new().unwrap();
        let mut ticks = TickScheduler::new();

        // tick(100, "foo"); tick(50, "foo"): the bridge cancels before
        // scheduling, modelled here.
        ticks.schedule(&mut reactor, 100, global("foo")).unwrap();
        ticks.cancel_matching(&mut reactor, &TickKey::Global("foo".into()));
        ticks.schedule(&mut reactor, 50, global("foo")).unwrap();

        assert_eq!(ticks.count_matching(&TickKey::Global("foo".into())), 1);
        assert_eq!(ticks.len(), 1);
    }

    #[test]
    fn cancel_all_unregisters_every_timer() {
        let mut reactor = Reactor::new().unwrap();
        let mut ticks = TickScheduler::new();

        ticks.schedule(&mut reactor, 10, global("a")).unwrap();
        ticks.schedule(&mut reactor, 20, global("b")).unwrap();
        ticks.schedule(&mut reactor, 30, native("c")).unwrap();

        ticks.cancel_all(&mut reactor);
        reactor.compact();
        assert!(ticks.is_empty());
        assert!(reactor.is_empty());
    }

    #[test]
    fn native_callbacks_never_match_script_keys() {
        let mut reactor = Reactor::new().unwrap();
        let mut ticks = TickScheduler::new();

        ticks.schedule(&mut reactor, 8, native("drain")).unwrap();
        let removed = ticks.cancel_matching(&mut reactor, &TickKey::Global("drain".into()));
        assert_eq!(removed, 0);
        assert_eq!(ticks.len(), 1);
    }

    #[test]
    fn timer_fires_through_reactor() {
        let mut reactor = Reactor::new().unwrap();
        let mut ticks = TickScheduler::new();
        let token = ticks.schedule(&mut reactor, 5, global("t")).unwrap();

        let mut events = mio::Events::with_capacity(4);
        reactor
            .poll(&mut events, Some(Duration::from_secs(2)))
            .unwrap();

        let fired: Vec<Token> = events.iter().map(|e| e.token()).collect();
        assert!(fired.contains(&token));
        assert!(ticks.take_fire(token).is_some());
    }
}
