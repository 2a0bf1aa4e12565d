//! One endpoint, one transport, one FIFO queue of work items.
//!
//! # Design
//! A work item is a cloned `Request` plus its two callbacks. Only the head of
//! the queue is ever handed to the transport, so requests on one connection
//! are strictly serialized and callbacks fire in submission order.
//!
//! State lives in an `Rc<RefCell<ConnectionInner>>` shared with the
//! `EventLoop` registry (which only holds a `Weak`). The cell is never
//! borrowed while a callback runs: an item is popped and its outcome recorded
//! first, then the borrow is released and the callback invoked. Callbacks may
//! therefore submit more work to the same connection.
//!
//! ```text
//! Idle -> Connecting -> Sending -> AwaitingResponse -> Completed -> Idle | Drained
//!            \______________\_____________\___________-> Failed ----^
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::builder::Endpoint;
use crate::error::{ConfigError, ErrorKind};
use crate::event_loop::{EventLoop, Registration};
use crate::message::{Outcome, Request, Response};
use crate::transport::{Handle, Poll, Stage, Token, Transport, Wait};
use crate::types::TransportKind;

pub type ErrorCallback = Box<dyn FnOnce(ErrorKind, &Request, Option<&Response>)>;
pub type SuccessCallback = Box<dyn FnOnce(&Request, &Response)>;

/// Where a connection is in its per-item cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Sending,
    AwaitingResponse,
    Completed,
    Failed,
    /// The queue ran empty after at least one item.
    Drained,
    Closed,
}

/// Per-connection settings fixed at build time.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConnectionSettings {
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) database: Option<String>,
    pub(crate) asynchronous: bool,
}

/// Result of one unit of progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    /// Nothing queued.
    Idle,
    /// The head item is still in flight.
    Pending,
    /// The head item finished and its callback fired.
    Delivered,
}

struct WorkItem {
    id: u64,
    request: Request,
    on_error: ErrorCallback,
    on_success: SuccessCallback,
    token: Option<Token>,
}

/// An item that left the queue, waiting for its callback.
struct Completion {
    item: WorkItem,
    outcome: Outcome,
}

impl Completion {
    fn deliver(self) {
        let WorkItem {
            request,
            on_error,
            on_success,
            ..
        } = self.item;
        match self.outcome {
            Outcome::Success(response) => on_success(&request, &response),
            Outcome::Failure(kind, partial) => on_error(kind, &request, partial.as_ref()),
        }
    }
}

pub(crate) struct ConnectionInner {
    endpoint: Endpoint,
    transport: Box<dyn Transport>,
    handle: Option<Handle>,
    settings: ConnectionSettings,
    queue: VecDeque<WorkItem>,
    state: ConnectionState,
    pending_mode: Option<bool>,
    delivering: bool,
    last: Option<Outcome>,
    next_item: u64,
    closed: bool,
}

impl ConnectionInner {
    pub(crate) fn is_running(&self) -> bool {
        !self.queue.is_empty() || self.delivering
    }

    /// Queued items that may be stepped now. Nothing is stepped while a
    /// callback of this connection is being delivered.
    pub(crate) fn has_work(&self) -> bool {
        !self.queue.is_empty() && !self.delivering
    }

    fn in_flight(&self) -> bool {
        self.queue.front().is_some_and(|item| item.token.is_some())
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            trace!(endpoint = %self.endpoint, from = ?self.state, to = ?state, "state change");
            self.state = state;
        }
    }

    /// Hand the head item to the transport, connecting first if needed.
    fn start_head(&mut self) -> Option<Token> {
        let head = self.queue.front()?;
        if let Some(token) = head.token {
            return Some(token);
        }
        let (item, mut request) = (head.id, head.request.clone());

        let handle = match self.handle {
            Some(handle) if self.transport.is_open(handle) => handle,
            _ => {
                self.set_state(ConnectionState::Connecting);
                let handle = self.transport.connect(&self.endpoint);
                self.handle = Some(handle);
                handle
            }
        };

        if request.database().is_none() {
            if let Some(database) = &self.settings.database {
                request.set_database(database.clone());
            }
        }
        let deadline = request
            .timeout()
            .or(self.settings.request_timeout)
            .map(|timeout| Instant::now() + timeout);

        let token = self.transport.send(handle, &request, deadline);
        debug!(endpoint = %self.endpoint, item, token = token.id(), "item sent");
        self.set_state(ConnectionState::Sending);
        if let Some(head) = self.queue.front_mut() {
            head.token = Some(token);
        }
        Some(token)
    }

    /// Advance the head item; returns it once it has finished.
    fn drive(&mut self, wait: Wait) -> Option<Completion> {
        let token = self.start_head()?;
        let outcome = match self.transport.poll(token, wait) {
            Poll::Pending(Stage::Sending) => {
                self.set_state(ConnectionState::Sending);
                return None;
            }
            Poll::Pending(Stage::AwaitingResponse) => {
                self.set_state(ConnectionState::AwaitingResponse);
                return None;
            }
            Poll::Complete(response) => {
                self.set_state(ConnectionState::Completed);
                Outcome::Success(response)
            }
            Poll::Failed(error) => {
                debug!(endpoint = %self.endpoint, %error, "item failed");
                self.set_state(ConnectionState::Failed);
                // The next item reconnects.
                if let Some(handle) = self.handle.take() {
                    self.transport.close(handle);
                }
                Outcome::Failure(error.kind, error.partial)
            }
        };

        let item = self.queue.pop_front()?;
        self.last = Some(outcome.clone());
        self.delivering = true;
        Some(Completion { item, outcome })
    }

    /// Called after a callback returned.
    fn settle(&mut self) {
        self.delivering = false;
        if let Some(asynchronous) = self.pending_mode.take() {
            debug!(endpoint = %self.endpoint, asynchronous, "applying buffered mode change");
            self.settings.asynchronous = asynchronous;
        }
        if self.closed {
            return;
        }
        let next = if self.queue.is_empty() {
            ConnectionState::Drained
        } else {
            ConnectionState::Idle
        };
        self.set_state(next);
    }
}

/// Make one unit of progress on `cell`'s head item.
pub(crate) fn advance(cell: &RefCell<ConnectionInner>, wait: Wait) -> Progress {
    let completion = {
        let mut inner = cell.borrow_mut();
        if !inner.has_work() {
            return Progress::Idle;
        }
        inner.drive(wait)
    };
    match completion {
        None => Progress::Pending,
        Some(completion) => {
            completion.deliver();
            cell.borrow_mut().settle();
            Progress::Delivered
        }
    }
}

/// A queue of requests to one endpoint.
///
/// Not `Clone`: the caller owns the connection. Dropping it closes it.
pub struct Connection {
    inner: Rc<RefCell<ConnectionInner>>,
    endpoint: Endpoint,
    kind: TransportKind,
    registration: Registration,
}

impl Connection {
    pub(crate) fn new(
        endpoint: Endpoint,
        transport: Box<dyn Transport>,
        settings: ConnectionSettings,
        event_loop: &EventLoop,
    ) -> Self {
        let kind = transport.kind();
        let inner = Rc::new(RefCell::new(ConnectionInner {
            endpoint: endpoint.clone(),
            transport,
            handle: None,
            settings,
            queue: VecDeque::new(),
            state: ConnectionState::Idle,
            pending_mode: None,
            delivering: false,
            last: None,
            next_item: 1,
            closed: false,
        }));
        let registration = event_loop.register(Rc::downgrade(&inner));
        debug!(%endpoint, %kind, "connection created");
        Self {
            inner,
            endpoint,
            kind,
            registration,
        }
    }

    /// Queue `request`. Never blocks; fails only for an invalid request or
    /// a closed connection. Returns the item id.
    pub fn submit<E, S>(&self, request: &Request, on_error: E, on_success: S) -> Result<u64, ConfigError>
    where
        E: FnOnce(ErrorKind, &Request, Option<&Response>) + 'static,
        S: FnOnce(&Request, &Response) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err(ConfigError::ConnectionClosed);
        }
        request.validate()?;

        let id = inner.next_item;
        inner.next_item += 1;
        inner.queue.push_back(WorkItem {
            id,
            request: request.clone(),
            on_error: Box::new(on_error),
            on_success: Box::new(on_success),
            token: None,
        });
        trace!(endpoint = %self.endpoint, item = id, queued = inner.queue.len(), "item queued");
        Ok(id)
    }

    /// Switch between blocking and cooperative `run`. While an item is in
    /// flight the change is held back until its callback has fired.
    pub fn set_asynchronous(&self, asynchronous: bool) {
        let mut inner = self.inner.borrow_mut();
        if inner.in_flight() || inner.delivering {
            inner.pending_mode = Some(asynchronous);
        } else {
            inner.pending_mode = None;
            inner.settings.asynchronous = asynchronous;
        }
    }

    pub fn is_asynchronous(&self) -> bool {
        self.inner.borrow().settings.asynchronous
    }

    /// Drive the head item.
    ///
    /// Synchronous mode blocks until that item's callback has fired.
    /// Asynchronous mode performs one non-blocking unit of progress. An
    /// empty queue returns immediately in both modes, as does a call made
    /// from one of this connection's own callbacks.
    pub fn run(&self) {
        if self.is_asynchronous() {
            advance(&self.inner, Wait::Step);
            return;
        }
        while advance(&self.inner, Wait::Block) == Progress::Pending {}
    }

    /// True while work is queued or a callback is being delivered.
    pub fn is_running(&self) -> bool {
        self.inner.borrow().is_running()
    }

    /// Outcome of the most recently finished item.
    pub fn result(&self) -> Option<Outcome> {
        self.inner.borrow().last.clone()
    }

    /// Status code of the most recent response, if one arrived.
    pub fn response_code(&self) -> Option<u16> {
        self.inner
            .borrow()
            .last
            .as_ref()
            .and_then(Outcome::response)
            .map(Response::status)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.borrow().state
    }

    pub fn requests_left(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    /// Cancel all remaining work, release the socket and leave the event
    /// loop. Each remaining item's error callback fires with `Cancelled`, in
    /// submission order. Idempotent.
    pub fn close(&self) {
        let cancelled: Vec<WorkItem> = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.pending_mode = None;
            let items: Vec<WorkItem> = inner.queue.drain(..).collect();
            for token in items.iter().filter_map(|item| item.token) {
                inner.transport.cancel(token);
            }
            if !items.is_empty() {
                inner.last = Some(Outcome::Failure(ErrorKind::Cancelled, None));
            }
            inner.set_state(ConnectionState::Closed);
            items
        };

        if !cancelled.is_empty() {
            debug!(endpoint = %self.endpoint, count = cancelled.len(), "cancelling queued items");
        }
        for item in cancelled {
            (item.on_error)(ErrorKind::Cancelled, &item.request, None);
        }

        {
            let mut inner = self.inner.borrow_mut();
            if let Some(handle) = inner.handle.take() {
                inner.transport.close(handle);
            }
            inner.set_state(ConnectionState::Closed);
        }
        self.registration.release();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("requests_left", &self.requests_left())
            .finish()
    }
}
