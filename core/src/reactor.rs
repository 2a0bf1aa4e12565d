//! Readiness notifications for the sockets of one event loop.
//!
//! # Design
//! A `Reactor` wraps a `mio::Poll`. Every socket a transport opens is
//! registered for read and write readiness under its own token; nothing is
//! ever read or written here, the reactor only reports that a socket may have
//! made progress.
//!
//! Two kinds of wait exist:
//! - `wait_for` parks a blocking `poll` until one socket is ready or a
//!   deadline passes. Readiness seen for other sockets is remembered.
//! - `wait` parks the event loop until any socket is ready, any timer fires
//!   or something was remembered since the last wait.
//!
//! Timers are plain deadlines registered with `wake_at`; they only bound how
//! long `wait` may sleep. Registrations are edge-triggered, so callers drain a
//! socket until it would block before waiting on it.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashSet};
use std::io;
use std::time::Instant;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use tracing::trace;

const EVENTS_CAPACITY: usize = 256;

/// Reserved for readiness that does not come from a socket.
const NOTIFY: Token = Token(0);

pub struct Reactor {
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    next_token: Cell<usize>,
    ready: RefCell<HashSet<Token>>,
    timers: RefCell<BTreeSet<Instant>>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: RefCell::new(Poll::new()?),
            events: RefCell::new(Events::with_capacity(EVENTS_CAPACITY)),
            next_token: Cell::new(NOTIFY.0 + 1),
            ready: RefCell::new(HashSet::new()),
            timers: RefCell::new(BTreeSet::new()),
        })
    }

    pub(crate) fn register<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<Token> {
        let token = Token(self.next_token.get());
        self.next_token.set(token.0 + 1);
        self.poll
            .borrow()
            .registry()
            .register(source, token, Interest::READABLE | Interest::WRITABLE)?;
        trace!(token = token.0, "source registered");
        Ok(token)
    }

    pub(crate) fn deregister<S: Source + ?Sized>(&self, source: &mut S, token: Token) {
        if let Err(error) = self.poll.borrow().registry().deregister(source) {
            trace!(token = token.0, %error, "deregister failed");
        }
        self.ready.borrow_mut().remove(&token);
    }

    /// Make sure `wait` returns no later than `deadline`.
    pub(crate) fn wake_at(&self, deadline: Instant) {
        self.timers.borrow_mut().insert(deadline);
    }

    /// Make the next `wait` return at once.
    pub(crate) fn notify(&self) {
        self.ready.borrow_mut().insert(NOTIFY);
    }

    /// Block until `token` is ready. Returns `false` once `deadline` passed.
    pub(crate) fn wait_for(&self, token: Token, deadline: Option<Instant>) -> io::Result<bool> {
        loop {
            if self.ready.borrow_mut().remove(&token) {
                return Ok(true);
            }
            let timeout = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(false);
                    }
                    Some(remaining)
                }
                None => None,
            };
            self.poll_once(timeout)?;
        }
    }

    /// Block until any registered socket is ready or the earliest timer is
    /// due. Returns at once if readiness was recorded since the last call.
    pub fn wait(&self) -> io::Result<()> {
        if self.ready.borrow().is_empty() {
            let now = Instant::now();
            let timeout = self
                .timers
                .borrow()
                .first()
                .map(|at| at.saturating_duration_since(now));
            self.poll_once(timeout)?;
        }
        self.ready.borrow_mut().clear();
        let now = Instant::now();
        self.timers.borrow_mut().retain(|at| *at > now);
        Ok(())
    }

    fn poll_once(&self, timeout: Option<std::time::Duration>) -> io::Result<()> {
        let mut poll = self.poll.borrow_mut();
        let mut events = self.events.borrow_mut();
        match poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(error) => return Err(error),
        }
        let mut ready = self.ready.borrow_mut();
        for event in events.iter() {
            ready.insert(event.token());
        }
        Ok(())
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("registered", &(self.next_token.get() - 1))
            .field("timers", &self.timers.borrow().len())
            .finish()
    }
}
