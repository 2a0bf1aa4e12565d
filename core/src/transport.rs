//! The protocol abstraction between a connection and the network.
//!
//! # Design
//! A transport owns at most one socket to one endpoint and exposes four
//! operations: `connect` opens the socket and returns a `Handle`, `send`
//! queues a request and returns a `Token`, `poll` advances a token, and
//! `close` tears the socket down. Nothing escapes `poll` except a `Poll`
//! value; a failed connect shows up as a token that polls to `Failed`.
//!
//! `poll` takes a `Wait`. With `Wait::Step` it only does I/O that cannot
//! block, including finishing a non-blocking connect, and returns as soon as
//! the socket would block. With `Wait::Block` it parks the calling thread in
//! the event loop's `Reactor` until the socket is ready again, repeating
//! until the token completes, fails or its deadline expires.
//!
//! The two implementations share the `Link`/`Socket` plumbing below but no
//! state; each transport owns its own link. Sockets are registered with the
//! reactor of the event loop the connection was built against.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use tracing::{debug, trace};

use crate::builder::Endpoint;
use crate::error::TransportError;
use crate::http::HttpTransport;
use crate::message::{Request, Response};
use crate::reactor::Reactor;
use crate::types::{TransportKind, VstVersion};
use crate::vst::VstTransport;

const READ_CHUNK: usize = 16 * 1024;

/// Identifies one opened socket of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub(crate) u64);

/// Identifies one request handed to `Transport::send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub(crate) u64);

impl Token {
    pub fn id(self) -> u64 {
        self.0
    }
}

/// How long `poll` may hold the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Step,
    Block,
}

/// Where a pending token currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Sending,
    AwaitingResponse,
}

/// Result of polling a token.
#[derive(Debug)]
pub enum Poll {
    Pending(Stage),
    Complete(Response),
    Failed(TransportError),
}

/// Wire protocol operations used by `Connection`.
pub trait Transport {
    fn kind(&self) -> TransportKind;

    /// Open a socket to `endpoint`, replacing any socket already open.
    fn connect(&mut self, endpoint: &Endpoint) -> Handle;

    /// Whether `handle` still names a usable socket.
    fn is_open(&self, handle: Handle) -> bool;

    fn send(&mut self, handle: Handle, request: &Request, deadline: Option<Instant>) -> Token;

    fn poll(&mut self, token: Token, wait: Wait) -> Poll;

    /// Forget a token without waiting for its response.
    fn cancel(&mut self, token: Token);

    fn close(&mut self, handle: Handle);

    /// Number of tokens sent but not yet resolved.
    fn in_flight(&self) -> usize;
}

/// Settings shared by both transports.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub vst_version: VstVersion,
    pub max_chunk_size: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            vst_version: VstVersion::default(),
            max_chunk_size: crate::vst::DEFAULT_MAX_CHUNK_SIZE,
        }
    }
}

/// Build the transport selected by the endpoint scheme.
pub fn for_kind(kind: TransportKind, options: &TransportOptions, reactor: Rc<Reactor>) -> Box<dyn Transport> {
    match kind {
        TransportKind::Vst => Box::new(VstTransport::new(options, reactor)),
        TransportKind::Http => Box::new(HttpTransport::new(options, reactor)),
    }
}

/// Outcome of one read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fill {
    Data(usize),
    WouldBlock,
    Eof,
}

/// A non-blocking TCP stream with an outbound queue and an inbound buffer.
///
/// The connect is started by `open` and finished by the first `flush` or
/// `fill`; until then both report no progress in step mode.
pub(crate) struct Socket {
    stream: TcpStream,
    reactor: Rc<Reactor>,
    token: mio::Token,
    authority: String,
    fallback: Vec<SocketAddr>,
    connect_deadline: Instant,
    connected: bool,
    outbound: BytesMut,
    inbound: BytesMut,
    queued_total: u64,
    flushed_total: u64,
}

impl Socket {
    pub(crate) fn open(endpoint: &Endpoint, timeout: Duration, reactor: Rc<Reactor>) -> Result<Self, TransportError> {
        let authority = endpoint.authority();
        let mut addrs: Vec<SocketAddr> = (endpoint.host(), endpoint.port())
            .to_socket_addrs()
            .map_err(|e| TransportError::connect(format!("cannot resolve {authority}: {e}")))?
            .collect();
        addrs.reverse();

        let (mut stream, addr) = start_connect(&authority, &mut addrs, None)?;
        let token = reactor.register(&mut stream)?;
        let connect_deadline = Instant::now() + timeout;
        trace!(%addr, token = token.0, "connect started");
        Ok(Self {
            stream,
            reactor,
            token,
            authority,
            fallback: addrs,
            connect_deadline,
            connected: false,
            outbound: BytesMut::new(),
            inbound: BytesMut::with_capacity(READ_CHUNK),
            queued_total: 0,
            flushed_total: 0,
        })
    }

    /// Queue bytes for writing and return the stream offset at which they end.
    pub(crate) fn enqueue(&mut self, bytes: &[u8]) -> u64 {
        self.outbound.extend_from_slice(bytes);
        self.queued_total += bytes.len() as u64;
        self.queued_total
    }

    /// Total number of bytes handed to the kernel so far.
    pub(crate) fn flushed(&self) -> u64 {
        self.flushed_total
    }

    pub(crate) fn inbound(&mut self) -> &mut BytesMut {
        &mut self.inbound
    }

    /// Received bytes not yet consumed by a parser.
    pub(crate) fn buffered(&self) -> usize {
        self.inbound.len()
    }

    /// Write queued bytes. Returns `true` once the queue is empty.
    pub(crate) fn flush(&mut self, wait: Wait, deadline: Option<Instant>) -> Result<bool, TransportError> {
        if !self.ensure_connected(wait, deadline)? {
            return Ok(false);
        }
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(TransportError::connect("socket closed while writing")),
                Ok(n) => {
                    self.outbound.advance(n);
                    self.flushed_total += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !self.park(wait, deadline)? {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Read everything the kernel has buffered into the inbound buffer.
    pub(crate) fn fill(&mut self, wait: Wait, deadline: Option<Instant>) -> Result<Fill, TransportError> {
        if !self.ensure_connected(wait, deadline)? {
            return Ok(Fill::WouldBlock);
        }
        let mut chunk = [0u8; READ_CHUNK];
        let mut total = 0;
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) if total == 0 => return Ok(Fill::Eof),
                Ok(0) => return Ok(Fill::Data(total)),
                Ok(n) => {
                    self.inbound.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if total > 0 {
                        return Ok(Fill::Data(total));
                    }
                    if !self.park(wait, deadline)? {
                        return Ok(Fill::WouldBlock);
                    }
                }
                // The error resurfaces on the next read.
                Err(_) if total > 0 => return Ok(Fill::Data(total)),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Finish a pending connect, falling back to the next resolved address
    /// when one is refused.
    fn ensure_connected(&mut self, wait: Wait, deadline: Option<Instant>) -> Result<bool, TransportError> {
        loop {
            if self.connected {
                return Ok(true);
            }
            match connect_status(&self.stream) {
                Ok(true) => {
                    self.stream.set_nodelay(true)?;
                    self.connected = true;
                    debug!(authority = %self.authority, "socket connected");
                    return Ok(true);
                }
                Ok(false) => {}
                Err(error) => {
                    self.reconnect(error)?;
                    continue;
                }
            }

            if expired(deadline) {
                return Err(TransportError::timeout("deadline expired while connecting"));
            }
            if Instant::now() >= self.connect_deadline {
                return Err(TransportError::connect(format!(
                    "cannot connect to {}: timed out",
                    self.authority
                )));
            }
            let until = match deadline {
                Some(deadline) => deadline.min(self.connect_deadline),
                None => self.connect_deadline,
            };
            match wait {
                Wait::Step => {
                    self.reactor.wake_at(until);
                    return Ok(false);
                }
                Wait::Block => {
                    self.reactor.wait_for(self.token, Some(until))?;
                }
            }
        }
    }

    /// Replace a refused stream with one to the next address.
    fn reconnect(&mut self, error: io::Error) -> Result<(), TransportError> {
        trace!(authority = %self.authority, %error, "connect attempt failed");
        let (mut stream, addr) = start_connect(&self.authority, &mut self.fallback, Some(error))?;
        let token = self.reactor.register(&mut stream)?;
        self.reactor.deregister(&mut self.stream, self.token);
        self.stream = stream;
        self.token = token;
        trace!(%addr, token = token.0, "connect started");
        Ok(())
    }

    /// Wait for readiness in block mode. Returns `false` in step mode, after
    /// arming a wake-up for `deadline`.
    fn park(&self, wait: Wait, deadline: Option<Instant>) -> Result<bool, TransportError> {
        match wait {
            Wait::Step => {
                if let Some(deadline) = deadline {
                    self.reactor.wake_at(deadline);
                }
                Ok(false)
            }
            Wait::Block => {
                if self.reactor.wait_for(self.token, deadline)? {
                    Ok(true)
                } else {
                    Err(TransportError::timeout("deadline expired"))
                }
            }
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.reactor.deregister(&mut self.stream, self.token);
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("authority", &self.authority)
            .field("token", &self.token.0)
            .field("connected", &self.connected)
            .field("queued", &self.queued_total)
            .field("flushed", &self.flushed_total)
            .finish()
    }
}

/// Start a non-blocking connect to the next address in `addrs` (popped from
/// the back) that does not fail outright.
fn start_connect(
    authority: &str,
    addrs: &mut Vec<SocketAddr>,
    mut last_error: Option<io::Error>,
) -> Result<(TcpStream, SocketAddr), TransportError> {
    while let Some(addr) = addrs.pop() {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok((stream, addr)),
            Err(e) => {
                trace!(%addr, error = %e, "connect attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err(match last_error {
        Some(e) => TransportError::connect(format!("cannot connect to {authority}: {e}")),
        None => TransportError::connect(format!("no address found for {authority}")),
    })
}

/// `Ok(false)` while the handshake is still in progress.
fn connect_status(stream: &TcpStream) -> io::Result<bool> {
    if let Some(error) = stream.take_error()? {
        return Err(error);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}

#[derive(Debug)]
enum LinkState {
    Closed,
    Open(Handle, Socket),
    Broken(Handle, TransportError),
}

/// The socket slot of a transport, versioned by `Handle`.
#[derive(Debug)]
pub(crate) struct Link {
    reactor: Rc<Reactor>,
    next_handle: u64,
    state: LinkState,
}

impl Link {
    pub(crate) fn new(reactor: Rc<Reactor>) -> Self {
        Self {
            reactor,
            next_handle: 1,
            state: LinkState::Closed,
        }
    }

    pub(crate) fn connect(&mut self, endpoint: &Endpoint, timeout: Duration) -> Handle {
        let handle = Handle(self.next_handle);
        self.next_handle += 1;
        self.open_as(handle, endpoint, timeout);
        handle
    }

    /// Replace the socket behind `handle` with a fresh one.
    pub(crate) fn reopen(&mut self, handle: Handle, endpoint: &Endpoint, timeout: Duration) {
        self.state = LinkState::Closed;
        self.open_as(handle, endpoint, timeout);
    }

    fn open_as(&mut self, handle: Handle, endpoint: &Endpoint, timeout: Duration) {
        self.state = match Socket::open(endpoint, timeout, Rc::clone(&self.reactor)) {
            Ok(socket) => LinkState::Open(handle, socket),
            Err(error) => {
                debug!(endpoint = %endpoint, %error, "connect failed");
                LinkState::Broken(handle, error)
            }
        };
    }

    pub(crate) fn is_open(&self, handle: Handle) -> bool {
        matches!(&self.state, LinkState::Open(current, _) if *current == handle)
    }

    pub(crate) fn socket(&mut self, handle: Handle) -> Result<&mut Socket, TransportError> {
        match &mut self.state {
            LinkState::Open(current, socket) if *current == handle => Ok(socket),
            LinkState::Broken(current, error) if *current == handle => Err(error.clone()),
            _ => Err(TransportError::connect("socket is closed")),
        }
    }

    pub(crate) fn close(&mut self, handle: Handle) {
        let matches = match &self.state {
            LinkState::Open(current, _) | LinkState::Broken(current, _) => *current == handle,
            LinkState::Closed => false,
        };
        if matches {
            self.state = LinkState::Closed;
        }
    }

    /// Drop the socket after an I/O failure; the next item reconnects.
    pub(crate) fn fail(&mut self, handle: Handle, error: &TransportError) {
        if self.is_open(handle) {
            debug!(%error, "closing socket after failure");
            self.state = LinkState::Closed;
        }
    }
}

pub(crate) fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::net::TcpListener;

    fn endpoint_for(listener: &TcpListener) -> Endpoint {
        let port = listener.local_addr().unwrap().port();
        Endpoint::parse(&format!("http://127.0.0.1:{port}")).unwrap()
    }

    fn reactor() -> Rc<Reactor> {
        Rc::new(Reactor::new().unwrap())
    }

    #[test]
    fn refused_connect_surfaces_on_first_io() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = endpoint_for(&listener);
        drop(listener);

        let mut link = Link::new(reactor());
        let handle = link.connect(&endpoint, Duration::from_secs(1));
        let err = match link.socket(handle) {
            Ok(socket) => {
                socket.enqueue(b"GET / HTTP/1.1\r\n\r\n");
                socket.flush(Wait::Block, None).unwrap_err()
            }
            Err(err) => err,
        };
        assert_eq!(err.kind, ErrorKind::Connect);
    }

    #[test]
    fn connect_does_not_block_the_step() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = endpoint_for(&listener);
        let mut socket = Socket::open(&endpoint, Duration::from_secs(1), reactor()).unwrap();

        // Nobody has accepted yet; a step never waits for the handshake.
        assert_eq!(socket.fill(Wait::Step, None).unwrap(), Fill::WouldBlock);
        let (_peer, _) = listener.accept().unwrap();
        assert_eq!(socket.fill(Wait::Step, None).unwrap(), Fill::WouldBlock);
    }

    #[test]
    fn stale_handle_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = endpoint_for(&listener);

        let mut link = Link::new(reactor());
        let first = link.connect(&endpoint, Duration::from_secs(1));
        let second = link.connect(&endpoint, Duration::from_secs(1));
        assert_ne!(first, second);
        assert!(link.is_open(second));
        assert!(link.socket(first).is_err());

        link.close(second);
        assert!(!link.is_open(second));
    }

    #[test]
    fn reopen_keeps_the_handle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = endpoint_for(&listener);

        let mut link = Link::new(reactor());
        let handle = link.connect(&endpoint, Duration::from_secs(1));
        link.socket(handle).unwrap().enqueue(b"old");
        link.reopen(handle, &endpoint, Duration::from_secs(1));
        assert!(link.is_open(handle));
        assert_eq!(link.socket(handle).unwrap().enqueue(b"new"), 3);
    }

    #[test]
    fn flush_tracks_stream_offsets() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = endpoint_for(&listener);
        let mut socket = Socket::open(&endpoint, Duration::from_secs(1), reactor()).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        assert_eq!(socket.enqueue(b"hello"), 5);
        assert_eq!(socket.enqueue(b" world"), 11);
        assert!(socket.flush(Wait::Block, None).unwrap());
        assert_eq!(socket.flushed(), 11);

        let mut buf = [0u8; 11];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn blocking_read_waits_for_data() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = endpoint_for(&listener);
        let mut socket = Socket::open(&endpoint, Duration::from_secs(1), reactor()).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            peer.write_all(b"late").unwrap();
            peer
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(socket.fill(Wait::Block, Some(deadline)).unwrap(), Fill::Data(4));
        assert_eq!(&socket.inbound()[..], b"late");
        drop(writer.join().unwrap());
    }

    #[test]
    fn blocking_read_reports_timeout_at_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = endpoint_for(&listener);
        let mut socket = Socket::open(&endpoint, Duration::from_secs(1), reactor()).unwrap();
        let (_peer, _) = listener.accept().unwrap();

        let deadline = Instant::now() + Duration::from_millis(50);
        let err = socket.fill(Wait::Block, Some(deadline)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[test]
    fn peer_close_reads_as_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = endpoint_for(&listener);
        let mut socket = Socket::open(&endpoint, Duration::from_secs(1), reactor()).unwrap();
        let (peer, _) = listener.accept().unwrap();
        drop(peer);

        assert_eq!(socket.fill(Wait::Block, None).unwrap(), Fill::Eof);
    }
}
