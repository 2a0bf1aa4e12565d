//! Test doubles shared by unit tests.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Instant;

use crate::builder::Endpoint;
use crate::connection::{Connection, ConnectionSettings};
use crate::error::{ErrorKind, TransportError};
use crate::event_loop::EventLoop;
use crate::message::{Request, Response};
use crate::reactor::Reactor;
use crate::transport::{Handle, Poll, Stage, Token, Transport, Wait};
use crate::types::TransportKind;

/// Number of pending polls before the scripted result, and that result.
pub(crate) type Step = (usize, Result<u16, ErrorKind>);

/// Transport that answers each request after a scripted number of pending
/// polls. Unscripted requests answer 200 at once. A blocking poll never
/// returns pending. A pending step notifies the reactor, standing in for the
/// socket readiness a real transport would wait on.
#[derive(Default)]
pub(crate) struct Scripted {
    script: VecDeque<Step>,
    live: HashMap<u64, Step>,
    next: u64,
    open: bool,
    reactor: Option<Rc<Reactor>>,
    pub(crate) connects: Rc<RefCell<usize>>,
    pub(crate) polled_with: Rc<RefCell<Vec<Wait>>>,
}

impl Scripted {
    pub(crate) fn answering(script: Vec<Step>) -> Self {
        Self {
            script: script.into(),
            ..Self::default()
        }
    }
}

impl Transport for Scripted {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn connect(&mut self, _endpoint: &Endpoint) -> Handle {
        *self.connects.borrow_mut() += 1;
        self.open = true;
        Handle(1)
    }

    fn is_open(&self, _handle: Handle) -> bool {
        self.open
    }

    fn send(&mut self, _handle: Handle, _request: &Request, _deadline: Option<Instant>) -> Token {
        self.next += 1;
        let step = self.script.pop_front().unwrap_or((0, Ok(200)));
        self.live.insert(self.next, step);
        Token(self.next)
    }

    fn poll(&mut self, token: Token, wait: Wait) -> Poll {
        self.polled_with.borrow_mut().push(wait);
        let Some((remaining, result)) = self.live.get_mut(&token.0) else {
            return Poll::Failed(TransportError::new(ErrorKind::Cancelled, "unknown token"));
        };
        if *remaining > 0 && wait == Wait::Step {
            *remaining -= 1;
            if let Some(reactor) = &self.reactor {
                reactor.notify();
            }
            return Poll::Pending(Stage::AwaitingResponse);
        }
        let result = *result;
        self.live.remove(&token.0);
        match result {
            Ok(status) => Poll::Complete(Response::new(status, "text/plain", format!("#{}", token.0))),
            Err(kind) => Poll::Failed(TransportError::new(kind, "scripted failure")),
        }
    }

    fn cancel(&mut self, token: Token) {
        self.live.remove(&token.0);
    }

    fn close(&mut self, _handle: Handle) {
        self.open = false;
    }

    fn in_flight(&self) -> usize {
        self.live.len()
    }
}

pub(crate) fn scripted_connection(mut transport: Scripted, event_loop: &EventLoop) -> Connection {
    transport.reactor = Some(event_loop.reactor());
    let endpoint = Endpoint::parse("http://127.0.0.1:8529").unwrap();
    Connection::new(endpoint, Box::new(transport), ConnectionSettings::default(), event_loop)
}
