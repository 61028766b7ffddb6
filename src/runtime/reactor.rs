//! fd readiness demultiplexer.
//!
//! Every registered fd carries an owner tag so the run loop can route
//! readiness to the right dispatcher in O(1). Unregistering marks the entry
//! dead and defers removal to the end of the poll cycle, which makes it safe
//! for a dispatcher to unregister fds (its own or another's) from inside a
//! readiness callback.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

/// The dispatcher that owns a registered fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Udev,
    Evdev,
    Hidraw,
    Usb,
    Gatt,
    Haptics,
    Tick,
}

/// Decoded readiness of one poll event.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

impl Readiness {
    pub fn from_event(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            hangup: event.is_read_closed(),
            error: event.is_error(),
        }
    }

    /// A hang-up or error ends the device's life rather than issuing
    /// further reads.
    pub fn is_gone(&self) -> bool {
        self.hangup || self.error
    }
}

#[derive(Debug)]
struct Entry {
    owner: Owner,
    fd: RawFd,
    dead: bool,
}

pub struct Reactor {
    poll: Poll,
    entries: HashMap<Token, Entry>,
    by_fd: HashMap<RawFd, Token>,
    dead: Vec<Token>,
    next_token: usize,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            entries: HashMap::new(),
            by_fd: HashMap::new(),
            dead: Vec::new(),
            next_token: 0,
        })
    }

    /// Registers an fd with readable interest under the given owner.
    pub fn register(&mut self, fd: RawFd, owner: Owner) -> io::Result<Token> {
        self.register_interest(fd, owner, Interest::READABLE)
    }

    /// Registers an fd with readable and writable interest.
    pub fn register_rw(&mut self, fd: RawFd, owner: Owner) -> io::Result<Token> {
        self.register_interest(fd, owner, Interest::READABLE | Interest::WRITABLE)
    }

    fn register_interest(
        &mut self,
        fd: RawFd,
        owner: Owner,
        interest: Interest,
    ) -> io::Result<Token> {
        if self.by_fd.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("fd {fd} is already registered"),
            ));
        }

        let token = Token(self.next_token);
        self.next_token += 1;

        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest)?;

        self.entries.insert(token, Entry { owner, fd, dead: false });
        self.by_fd.insert(fd, token);
        Ok(token)
    }

    /// Removes an fd from the poll set and marks its entry dead. The entry
    /// itself survives until [`Reactor::compact`] so a lookup during the
    /// current cycle resolves to nothing instead of a recycled token.
    pub fn unregister(&mut self, fd: RawFd) {
        let Some(token) = self.by_fd.remove(&fd) else {
            return;
        };
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            log::debug!("deregister fd {fd}: {e}");
        }
        if let Some(entry) = self.entries.get_mut(&token) {
            entry.dead = true;
            self.dead.push(token);
        }
    }

    /// Resolves a token to its owner and fd. Dead entries yield `None`.
    pub fn lookup(&self, token: Token) -> Option<(Owner, RawFd)> {
        self.entries
            .get(&token)
            .filter(|e| !e.dead)
            .map(|e| (e.owner, e.fd))
    }

    pub fn token_for(&self, fd: RawFd) -> Option<Token> {
        self.by_fd.get(&fd).copied()
    }

    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(events, timeout)
    }

    /// Drops entries unregistered during the cycle that just finished.
    pub fn compact(&mut self) {
        for token in self.dead.drain(..) {
            self.entries.remove(&token);
        }
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| !e.dead).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deregisters every remaining fd. Used on shutdown.
    pub fn clear(&mut self) {
        let fds: Vec<RawFd> = self.by_fd.keys().copied().collect();
        for fd in fds {
            self.unregister(fd);
        }
        self.compact();
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("entries", &self.entries)
            .field("pending_dead", &self.dead.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn every_fd_has_exactly_one_owner() {
        let mut reactor = Reactor::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        let token = reactor.register(fd, Owner::Evdev).unwrap();
        assert_eq!(reactor.lookup(token), Some((Owner::Evdev, fd)));

        // Re-registering the same fd under another owner is refused.
        assert!(reactor.register(fd, Owner::Hidraw).is_err());
        assert_eq!(reactor.len(), 1);
    }

    #[test]
    fn unregister_removes_ownership_before_compaction() {
        let mut reactor = Reactor::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        let token = reactor.register(fd, Owner::Hidraw).unwrap();
        reactor.unregister(fd);

        // Dead entries must not resolve even before compaction runs.
        assert_eq!(reactor.lookup(token), None);
        assert_eq!(reactor.len(), 0);

        reactor.compact();
        assert_eq!(reactor.lookup(token), None);
    }

    #[test]
    fn fd_can_be_reregistered_immediately_after_unregister() {
        let mut reactor = Reactor::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        let old = reactor.register(fd, Owner::Evdev).unwrap();
        reactor.unregister(fd);

        // The kernel may hand the same fd number right back.
        let new = reactor.register(fd, Owner::Tick).unwrap();
        assert_ne!(old, new);
        assert_eq!(reactor.lookup(new), Some((Owner::Tick, fd)));
        assert_eq!(reactor.lookup(old), None);
    }

    #[test]
    fn readiness_delivered_to_registered_owner() {
        let mut reactor = Reactor::new().unwrap();
        let (reader, mut writer) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        let fd = reader.as_raw_fd();

        reactor.register(fd, Owner::Gatt).unwrap();
        writer.write_all(b"x").unwrap();

        let mut events = Events::with_capacity(8);
        reactor
            .poll(&mut events, Some(Duration::from_secs(2)))
            .unwrap();

        let mut seen = 0;
        for event in events.iter() {
            let (owner, efd) = reactor.lookup(event.token()).unwrap();
            assert_eq!(owner, Owner::Gatt);
            assert_eq!(efd, fd);
            assert!(Readiness::from_event(event).readable);
            seen += 1;
        }
        assert_eq!(seen, 1);
    }

    #[test]
    fn clear_empties_the_reactor() {
        let mut reactor = Reactor::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let (c, _d) = UnixStream::pair().unwrap();
        reactor.register(a.as_raw_fd(), Owner::Udev).unwrap();
        reactor.register(c.as_raw_fd(), Owner::Usb).unwrap();

        reactor.clear();
        assert!(reactor.is_empty());
        assert!(reactor.token_for(a.as_raw_fd()).is_none());
    }
}
