//! Cooperative scheduler for connections.
//!
//! # Design
//! An `EventLoop` is an explicit object, not process-global state. Each
//! `Connection` registers with the loop it was built against and leaves the
//! registry when it is closed or dropped. The registry holds weak references
//! only, so the caller's `Connection` value alone decides how long a
//! connection lives.
//!
//! A round visits every registered connection with queued work, in
//! registration order, and performs one non-blocking unit of progress on its
//! head item. `run` repeats rounds until no connection has work left; `poll`
//! performs one round. After a round that delivered nothing, `run` parks in
//! the loop's `Reactor` until a socket becomes ready or a deadline is due.
//!
//! A connection whose callback is being delivered is not stepped, so calling
//! `run` or `poll` from inside a callback never nests callbacks.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use crate::connection::{advance, ConnectionInner, Progress};
use crate::reactor::Reactor;
use crate::transport::Wait;

#[derive(Default)]
struct Registry {
    next_id: u64,
    connections: BTreeMap<u64, Weak<RefCell<ConnectionInner>>>,
}

/// A connection's entry in an event loop registry.
pub(crate) struct Registration {
    id: u64,
    registry: Weak<RefCell<Registry>>,
}

impl Registration {
    /// Leave the registry. Safe to call more than once, or after the loop is gone.
    pub(crate) fn release(&self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.borrow_mut().connections.remove(&self.id).is_some() {
                trace!(connection = self.id, "connection deregistered");
            }
        }
    }
}

/// Counts from one round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundSummary {
    /// Callbacks fired during the round.
    pub delivered: usize,
    /// Connections that still have queued work.
    pub running: usize,
}

/// Drives every registered connection to completion, round-robin.
pub struct EventLoop {
    registry: Rc<RefCell<Registry>>,
    reactor: Rc<Reactor>,
}

impl EventLoop {
    /// Fails only if the OS refuses a readiness selector.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            registry: Rc::new(RefCell::new(Registry::default())),
            reactor: Rc::new(Reactor::new()?),
        })
    }

    /// The readiness source shared by every transport built against this loop.
    pub fn reactor(&self) -> Rc<Reactor> {
        Rc::clone(&self.reactor)
    }

    pub(crate) fn register(&self, inner: Weak<RefCell<ConnectionInner>>) -> Registration {
        let mut registry = self.registry.borrow_mut();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.connections.insert(id, inner);
        trace!(connection = id, "connection registered");
        Registration {
            id,
            registry: Rc::downgrade(&self.registry),
        }
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        let mut registry = self.registry.borrow_mut();
        registry.connections.retain(|_, inner| inner.strong_count() > 0);
        registry.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any registered connection has queued work that can be
    /// stepped, i.e. is not waiting for its own callback to return.
    pub fn is_running(&self) -> bool {
        self.live()
            .iter()
            .any(|inner| inner.try_borrow().is_ok_and(|inner| inner.has_work()))
    }

    /// One round: a single unit of progress on every connection with work.
    pub fn poll(&self) -> RoundSummary {
        let mut summary = RoundSummary::default();
        for inner in self.live() {
            let has_work = inner.try_borrow().is_ok_and(|inner| inner.has_work());
            if !has_work {
                continue;
            }
            if advance(&inner, Wait::Step) == Progress::Delivered {
                summary.delivered += 1;
            }
            if inner.try_borrow().is_ok_and(|inner| inner.has_work()) {
                summary.running += 1;
            }
        }
        summary
    }

    /// Repeat rounds until no registered connection has queued work.
    ///
    /// Work submitted by callbacks while the loop runs is drained too.
    pub fn run(&self) {
        debug!(connections = self.len(), "event loop running");
        let mut rounds = 0u64;
        loop {
            let summary = self.poll();
            rounds += 1;
            if summary.running == 0 && !self.is_running() {
                break;
            }
            if summary.delivered == 0 {
                if let Err(error) = self.reactor.wait() {
                    warn!(%error, "readiness wait failed");
                }
            }
        }
        debug!(rounds, "event loop drained");
    }

    /// Snapshot of live connections; the registry is not borrowed while
    /// they are stepped, so callbacks may create or drop connections.
    fn live(&self) -> Vec<Rc<RefCell<ConnectionInner>>> {
        let mut registry = self.registry.borrow_mut();
        registry.connections.retain(|_, inner| inner.strong_count() > 0);
        registry.connections.values().filter_map(Weak::upgrade).collect()
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("connections", &self.registry.borrow().connections.len())
            .field("reactor", &self.reactor)
            .finish()
    }
}
