//! HTTP/1.1 transport.
//!
//! # Design
//! Requests are encoded by hand into a byte buffer and responses are decoded
//! by `ResponseParser`, an incremental parser fed from the socket's inbound
//! buffer. Bodies framed by `Content-Length`, by chunked transfer encoding or
//! by the server closing the socket are all supported; interim `1xx`
//! responses are skipped.
//!
//! Exchanges are strictly sequential: only the oldest exchange reads from
//! the socket. The socket is reused between exchanges unless the server asks
//! to close it or an exchange fails part-way, in which case the next send
//! opens a fresh one. A server may also drop an idle kept-alive socket; an
//! exchange on such a socket that fails before any response byte arrived is
//! sent once more on a fresh socket.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::builder::Endpoint;
use crate::error::{ErrorKind, TransportError};
use crate::message::{Request, Response};
use crate::reactor::Reactor;
use crate::transport::{
    expired, Fill, Handle, Link, Poll, Stage, Token, Transport, TransportOptions, Wait,
};
use crate::types::{RestVerb, TransportKind};

/// Upper bound on status line plus headers.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Percent-encode everything except RFC 3986 unreserved characters.
pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Request target: optional database prefix, path and query string.
pub fn request_target(request: &Request) -> String {
    let mut target = String::new();
    if let Some(database) = request.database() {
        target.push_str("/_db/");
        target.push_str(&percent_encode(database));
    }
    if !request.path().starts_with('/') {
        target.push('/');
    }
    target.push_str(request.path());

    let mut separator = if request.path().contains('?') { '&' } else { '?' };
    for (key, value) in request.parameters() {
        target.push(separator);
        target.push_str(&percent_encode(key));
        target.push('=');
        target.push_str(&percent_encode(value));
        separator = '&';
    }
    target
}

/// Serialize `request` as an HTTP/1.1 message.
pub fn encode_request(request: &Request, host: &str) -> Result<Vec<u8>, TransportError> {
    let verb = request
        .validate()
        .map_err(|e| TransportError::new(ErrorKind::Configuration, e.to_string()))?;

    let mut head = format!("{} {} HTTP/1.1\r\nHost: {host}\r\n", verb, request_target(request));
    if let Some(content_type) = request.content_type() {
        head.push_str(&format!("Content-Type: {content_type}\r\n"));
    }
    if let Some(accept) = request.accept_type() {
        head.push_str(&format!("Accept: {accept}\r\n"));
    }
    for (key, value) in request.meta() {
        if is_reserved_header(key, request) {
            continue;
        }
        head.push_str(&format!("{key}: {value}\r\n"));
    }
    let needs_length = matches!(verb, RestVerb::Post | RestVerb::Put | RestVerb::Patch);
    if request.has_payload() || needs_length {
        head.push_str(&format!("Content-Length: {}\r\n", request.payload().len()));
    }
    head.push_str("\r\n");

    let mut out = head.into_bytes();
    out.extend_from_slice(request.payload());
    Ok(out)
}

/// Headers written from dedicated request fields, never from meta.
fn is_reserved_header(key: &str, request: &Request) -> bool {
    let framed = ["host", "content-length", "transfer-encoding"];
    if framed.iter().any(|name| key.eq_ignore_ascii_case(name)) {
        return true;
    }
    (request.content_type().is_some() && key.eq_ignore_ascii_case("content-type"))
        || (request.accept_type().is_some() && key.eq_ignore_ascii_case("accept"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(usize),
    Chunked(ChunkState),
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailers,
}

#[derive(Debug)]
struct Head {
    status: u16,
    headers: BTreeMap<String, String>,
    keep_alive: bool,
    framing: Framing,
}

/// Incremental HTTP/1.x response decoder.
#[derive(Debug)]
pub struct ResponseParser {
    head_request: bool,
    head: Option<Head>,
    body: BytesMut,
}

impl ResponseParser {
    /// `head_request` suppresses the body, which a HEAD response never has.
    pub fn new(head_request: bool) -> Self {
        Self {
            head_request,
            head: None,
            body: BytesMut::new(),
        }
    }

    /// Consume bytes from `buf`; returns the response once it is complete.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Response>, TransportError> {
        while self.head.is_none() {
            let Some(end) = find_head_end(buf) else {
                if buf.len() > MAX_HEAD_SIZE {
                    return Err(TransportError::protocol("response head too large"));
                }
                return Ok(None);
            };
            let raw = buf.split_to(end + 4);
            let head = parse_head(&raw[..end], self.head_request)?;
            if (100..200).contains(&head.status) {
                trace!(status = head.status, "skipping interim response");
                continue;
            }
            self.head = Some(head);
        }

        if self.read_body(buf)? {
            Ok(self.response())
        } else {
            Ok(None)
        }
    }

    /// The peer closed the socket; settle what was received.
    pub fn finish(&mut self) -> Result<Response, TransportError> {
        match &self.head {
            None => Err(TransportError::connect("connection closed before a response arrived")),
            Some(head) if matches!(head.framing, Framing::UntilClose | Framing::Empty) => self
                .response()
                .ok_or_else(|| TransportError::protocol("response head missing")),
            Some(_) => {
                let error = TransportError::protocol("connection closed mid-body");
                Err(match self.response() {
                    Some(partial) => error.with_partial(partial),
                    None => error,
                })
            }
        }
    }

    /// Status and headers plus whatever body arrived, once the head is known.
    pub fn partial(&self) -> Option<Response> {
        self.response()
    }

    /// Nothing of a response has been decoded yet.
    fn is_untouched(&self) -> bool {
        self.head.is_none() && self.body.is_empty()
    }

    /// Whether the socket can carry another exchange after this one.
    pub fn keep_alive(&self) -> bool {
        self.head.as_ref().is_some_and(|head| head.keep_alive)
    }

    fn response(&self) -> Option<Response> {
        let head = self.head.as_ref()?;
        let content_type = head.headers.get("content-type").cloned().unwrap_or_default();
        Some(
            Response::new(head.status, content_type, Bytes::copy_from_slice(&self.body))
                .with_meta(head.headers.clone()),
        )
    }

    /// Returns `true` once the body is complete.
    fn read_body(&mut self, buf: &mut BytesMut) -> Result<bool, TransportError> {
        let Some(head) = self.head.as_mut() else {
            return Ok(false);
        };
        loop {
            match head.framing {
                Framing::Empty => return Ok(true),
                Framing::UntilClose => {
                    self.body.extend_from_slice(buf);
                    buf.clear();
                    return Ok(false);
                }
                Framing::Length(remaining) => {
                    let take = remaining.min(buf.len());
                    self.body.extend_from_slice(&buf[..take]);
                    buf.advance(take);
                    head.framing = Framing::Length(remaining - take);
                    return Ok(remaining == take);
                }
                Framing::Chunked(ChunkState::Size) => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(false);
                    };
                    let size = line.split(';').next().unwrap_or_default().trim();
                    let size = usize::from_str_radix(size, 16)
                        .map_err(|_| TransportError::protocol(format!("invalid chunk size: {size:?}")))?;
                    head.framing = Framing::Chunked(if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data(size)
                    });
                }
                Framing::Chunked(ChunkState::Data(remaining)) => {
                    if buf.is_empty() {
                        return Ok(false);
                    }
                    let take = remaining.min(buf.len());
                    self.body.extend_from_slice(&buf[..take]);
                    buf.advance(take);
                    head.framing = Framing::Chunked(if remaining == take {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(remaining - take)
                    });
                }
                Framing::Chunked(ChunkState::DataEnd) => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(false);
                    };
                    if !line.is_empty() {
                        return Err(TransportError::protocol("missing CRLF after chunk data"));
                    }
                    head.framing = Framing::Chunked(ChunkState::Size);
                }
                Framing::Chunked(ChunkState::Trailers) => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(false);
                    };
                    if line.is_empty() {
                        head.framing = Framing::Empty;
                    }
                }
            }
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn take_line(buf: &mut BytesMut) -> Result<Option<String>, TransportError> {
    let Some(end) = buf.windows(2).position(|w| w == b"\r\n") else {
        if buf.len() > MAX_HEAD_SIZE {
            return Err(TransportError::protocol("line too long"));
        }
        return Ok(None);
    };
    let line = buf.split_to(end + 2);
    String::from_utf8(line[..end].to_vec())
        .map(Some)
        .map_err(|_| TransportError::protocol("line is not utf-8"))
}

fn parse_head(raw: &[u8], head_request: bool) -> Result<Head, TransportError> {
    let text = std::str::from_utf8(raw).map_err(|_| TransportError::protocol("response head is not utf-8"))?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();

    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let http10 = match version {
        "HTTP/1.1" => false,
        "HTTP/1.0" => true,
        _ => {
            return Err(TransportError::protocol(format!(
                "invalid status line: {status_line:?}"
            )))
        }
    };
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..1000).contains(code))
        .ok_or_else(|| TransportError::protocol(format!("invalid status line: {status_line:?}")))?;

    let mut headers = BTreeMap::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return Err(TransportError::protocol(format!("invalid header line: {line:?}")));
        };
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    let connection = headers.get("connection").map(|v| v.to_ascii_lowercase());
    let mut keep_alive = match connection.as_deref() {
        Some(value) if value.contains("close") => false,
        Some(value) if value.contains("keep-alive") => true,
        _ => !http10,
    };

    let chunked = headers
        .get("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
    let framing = if head_request || status == 204 || status == 304 || status < 200 {
        Framing::Empty
    } else if chunked {
        Framing::Chunked(ChunkState::Size)
    } else if let Some(length) = headers.get("content-length") {
        let length = length
            .parse::<usize>()
            .map_err(|_| TransportError::protocol(format!("invalid content-length: {length:?}")))?;
        if length == 0 {
            Framing::Empty
        } else {
            Framing::Length(length)
        }
    } else {
        keep_alive = false;
        Framing::UntilClose
    };

    Ok(Head {
        status,
        headers,
        keep_alive,
        framing,
    })
}

#[derive(Debug)]
struct Exchange {
    token: u64,
    handle: Handle,
    deadline: Option<Instant>,
    written_at: u64,
    parser: ResponseParser,
    bytes: Bytes,
    /// Queued on a socket that had already answered an earlier exchange.
    reused: bool,
    resent: bool,
}

impl Exchange {
    /// A kept-alive socket the server closed while idle fails before any
    /// response byte arrives. Such an exchange is sent once more.
    fn may_resend(&self, buffered: usize) -> bool {
        self.reused && !self.resent && self.parser.is_untouched() && buffered == 0
    }
}

/// Sequential HTTP/1.1 transport over one reusable socket.
pub struct HttpTransport {
    link: Link,
    options: TransportOptions,
    endpoint: Option<Endpoint>,
    host: String,
    next_token: u64,
    /// Socket that completed an exchange and was kept open.
    kept_alive: Option<Handle>,
    exchanges: VecDeque<Exchange>,
    finished: HashMap<u64, Poll>,
}

impl HttpTransport {
    pub fn new(options: &TransportOptions, reactor: Rc<Reactor>) -> Self {
        Self {
            link: Link::new(reactor),
            options: options.clone(),
            endpoint: None,
            host: String::new(),
            next_token: 1,
            kept_alive: None,
            exchanges: VecDeque::new(),
            finished: HashMap::new(),
        }
    }

    /// Open a fresh socket under the head exchange's handle and queue every
    /// exchange of that handle on it again.
    fn resend_head(&mut self, error: TransportError) {
        let Some((token, handle)) = self.exchanges.front().map(|e| (e.token, e.handle)) else {
            return;
        };
        let Some(endpoint) = self.endpoint.clone() else {
            self.fail_head(error);
            return;
        };
        debug!(token, %error, "kept-alive socket went stale, resending");
        self.kept_alive = None;
        self.link.reopen(handle, &endpoint, self.options.connect_timeout);
        let socket = match self.link.socket(handle) {
            Ok(socket) => socket,
            Err(error) => {
                self.fail_head(error);
                return;
            }
        };
        for exchange in self.exchanges.iter_mut().filter(|e| e.handle == handle) {
            exchange.written_at = socket.enqueue(&exchange.bytes);
            exchange.parser = ResponseParser::new(exchange.parser.head_request);
            exchange.reused = false;
            exchange.resent = true;
        }
    }

    /// Resolve the oldest exchange and drop the socket it left in an
    /// unknown state.
    fn fail_head(&mut self, error: TransportError) {
        if let Some(exchange) = self.exchanges.pop_front() {
            self.link.fail(exchange.handle, &error);
            self.finished.insert(exchange.token, Poll::Failed(error));
            self.fail_handle(exchange.handle);
        }
    }

    /// Exchanges queued behind a failed one cannot be answered.
    fn fail_handle(&mut self, handle: Handle) {
        let (dead, alive): (Vec<_>, Vec<_>) =
            self.exchanges.drain(..).partition(|exchange| exchange.handle == handle);
        self.exchanges = alive.into();
        for exchange in dead {
            self.finished.insert(
                exchange.token,
                Poll::Failed(TransportError::connect("socket closed before the request was answered")),
            );
        }
    }

    /// Advance the oldest exchange. Returns a stage when it cannot progress.
    fn drive_head(&mut self, wait: Wait) -> Option<Stage> {
        let exchange = self.exchanges.front_mut()?;
        let (token, handle, deadline, written_at) =
            (exchange.token, exchange.handle, exchange.deadline, exchange.written_at);

        if expired(deadline) {
            let mut error = TransportError::timeout(format!("request {token} timed out"));
            if let Some(partial) = exchange.parser.partial() {
                error = error.with_partial(partial);
            }
            self.fail_head(error);
            return None;
        }

        let socket = match self.link.socket(handle) {
            Ok(socket) => socket,
            Err(error) => {
                self.fail_head(error);
                return None;
            }
        };
        if let Err(error) = socket.flush(wait, deadline) {
            if error.kind != ErrorKind::Timeout && exchange.may_resend(socket.buffered()) {
                self.resend_head(error);
            } else {
                self.fail_head(error);
            }
            return None;
        }
        if socket.flushed() < written_at {
            return Some(Stage::Sending);
        }

        let parsed = exchange.parser.parse(socket.inbound());
        match parsed {
            Ok(Some(response)) => {
                let keep_alive = exchange.parser.keep_alive();
                trace!(token, status = response.status(), keep_alive, "http response complete");
                self.exchanges.pop_front();
                self.finished.insert(token, Poll::Complete(response));
                if keep_alive {
                    self.kept_alive = Some(handle);
                } else {
                    self.link.close(handle);
                    self.fail_handle(handle);
                }
                return None;
            }
            Ok(None) => {}
            Err(error) => {
                self.fail_head(error);
                return None;
            }
        }

        match socket.fill(wait, deadline) {
            Ok(Fill::Data(_)) => None,
            Ok(Fill::WouldBlock) => Some(Stage::AwaitingResponse),
            Ok(Fill::Eof) if exchange.may_resend(socket.buffered()) => {
                self.resend_head(TransportError::connect("connection closed by peer"));
                None
            }
            Ok(Fill::Eof) => {
                let settled = exchange.parser.finish();
                self.link.close(handle);
                match settled {
                    Ok(response) => {
                        self.exchanges.pop_front();
                        self.finished.insert(token, Poll::Complete(response));
                        self.fail_handle(handle);
                    }
                    Err(error) => self.fail_head(error),
                }
                None
            }
            Err(error) if error.kind != ErrorKind::Timeout && exchange.may_resend(socket.buffered()) => {
                self.resend_head(error);
                None
            }
            Err(mut error) => {
                if let Some(partial) = exchange.parser.partial() {
                    error = error.with_partial(partial);
                }
                self.fail_head(error);
                None
            }
        }
    }
}

impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn connect(&mut self, endpoint: &Endpoint) -> Handle {
        self.host = endpoint.authority();
        self.endpoint = Some(endpoint.clone());
        self.kept_alive = None;
        let handle = self.link.connect(endpoint, self.options.connect_timeout);
        debug!(endpoint = %endpoint, open = self.link.is_open(handle), "http connect");
        handle
    }

    fn is_open(&self, handle: Handle) -> bool {
        self.link.is_open(handle)
    }

    fn send(&mut self, handle: Handle, request: &Request, deadline: Option<Instant>) -> Token {
        let token = self.next_token;
        self.next_token += 1;

        let bytes = match encode_request(request, &self.host) {
            Ok(bytes) => bytes,
            Err(error) => {
                self.finished.insert(token, Poll::Failed(error));
                return Token(token);
            }
        };
        let socket = match self.link.socket(handle) {
            Ok(socket) => socket,
            Err(error) => {
                self.finished.insert(token, Poll::Failed(error));
                return Token(token);
            }
        };
        let written_at = socket.enqueue(&bytes);
        trace!(token, bytes = bytes.len(), "http request queued");

        self.exchanges.push_back(Exchange {
            token,
            handle,
            deadline,
            written_at,
            parser: ResponseParser::new(request.verb() == Some(RestVerb::Head)),
            bytes: Bytes::from(bytes),
            reused: self.kept_alive == Some(handle),
            resent: false,
        });
        Token(token)
    }

    fn poll(&mut self, token: Token, wait: Wait) -> Poll {
        loop {
            if let Some(result) = self.finished.remove(&token.0) {
                return result;
            }
            if !self.exchanges.iter().any(|exchange| exchange.token == token.0) {
                return Poll::Failed(TransportError::new(
                    ErrorKind::Cancelled,
                    format!("request {} is not in flight", token.0),
                ));
            }
            if let Some(stage) = self.drive_head(wait) {
                let head_is_token = self.exchanges.front().is_some_and(|e| e.token == token.0);
                return Poll::Pending(if head_is_token { stage } else { Stage::Sending });
            }
        }
    }

    fn cancel(&mut self, token: Token) {
        self.finished.remove(&token.0);
        if let Some(position) = self.exchanges.iter().position(|e| e.token == token.0) {
            if let Some(exchange) = self.exchanges.remove(position) {
                // Its response may still arrive and would be read by the next exchange.
                self.link.close(exchange.handle);
                self.fail_handle(exchange.handle);
            }
        }
    }

    fn close(&mut self, handle: Handle) {
        self.link.close(handle);
        self.exchanges.retain(|exchange| exchange.handle != handle);
    }

    fn in_flight(&self) -> usize {
        self.exchanges.len() + self.finished.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    fn feed(parser: &mut ResponseParser, bytes: &[u8]) -> Option<Response> {
        let mut buf = BytesMut::from(bytes);
        parser.parse(&mut buf).unwrap()
    }

    #[test]
    fn target_includes_database_and_query() {
        let mut request = Request::new(RestVerb::Get, "/_api/document/users/1");
        request
            .set_database("my db")
            .add_parameter("rev", "a&b")
            .add_parameter("details", "true");
        assert_eq!(
            request_target(&request),
            "/_db/my%20db/_api/document/users/1?details=true&rev=a%26b"
        );
    }

    #[test]
    fn target_without_database_has_no_prefix() {
        let request = Request::new(RestVerb::Get, "/_api/version");
        assert_eq!(request_target(&request), "/_api/version");
    }

    #[test]
    fn encodes_request_head_and_body() {
        let mut request = Request::new(RestVerb::Post, "/_api/cursor");
        request
            .set_payload(&b"{\"query\":1}"[..])
            .set_content_type("application/json")
            .set_accept_type("application/json")
            .add_meta("X-Trace", "abc");
        let bytes = encode_request(&request, "localhost:8529").unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            "POST /_api/cursor HTTP/1.1\r\n\
             Host: localhost:8529\r\n\
             Content-Type: application/json\r\n\
             Accept: application/json\r\n\
             x-trace: abc\r\n\
             Content-Length: 11\r\n\
             \r\n\
             {\"query\":1}"
        );
    }

    #[test]
    fn typed_headers_win_over_meta() {
        let mut request = Request::new(RestVerb::Get, "/_api/version");
        request
            .set_content_type("application/json")
            .set_accept_type("application/json")
            .add_meta("Content-Type", "text/plain")
            .add_meta("ACCEPT", "text/html")
            .add_meta("Content-Length", "99");
        let text = String::from_utf8(encode_request(&request, "h").unwrap()).unwrap();
        assert_eq!(text.to_ascii_lowercase().matches("content-type:").count(), 1);
        assert_eq!(text.to_ascii_lowercase().matches("accept:").count(), 1);
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Accept: application/json\r\n"));
        assert!(!text.to_ascii_lowercase().contains("content-length"));
    }

    #[test]
    fn meta_content_type_is_sent_without_typed_field() {
        let mut request = Request::new(RestVerb::Get, "/_api/version");
        request.add_meta("content-type", "text/plain");
        let text = String::from_utf8(encode_request(&request, "h").unwrap()).unwrap();
        assert!(text.contains("content-type: text/plain\r\n"));
    }

    #[test]
    fn get_without_payload_has_no_content_length() {
        let request = Request::new(RestVerb::Get, "/x");
        let text = String::from_utf8(encode_request(&request, "h").unwrap()).unwrap();
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn parses_response_split_across_reads() {
        let mut parser = ResponseParser::new(false);
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nCont"[..]);
        assert!(parser.parse(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"ent-Length: 4\r\n\r\nab");
        assert!(parser.parse(&mut buf).unwrap().is_none());
        assert_eq!(parser.partial().unwrap().payload().as_ref(), b"ab");
        buf.extend_from_slice(b"cd");
        let response = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.content_type(), "application/json");
        assert_eq!(response.payload().as_ref(), b"abcd");
        assert!(parser.keep_alive());
    }

    #[test]
    fn parses_chunked_body() {
        let mut parser = ResponseParser::new(false);
        let response = feed(
            &mut parser,
            b"HTTP/1.1 201 Created\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Trailer: y\r\n\r\n",
        )
        .unwrap();
        assert_eq!(response.status(), 201);
        assert_eq!(response.payload().as_ref(), b"Wikipedia");
    }

    #[test]
    fn skips_interim_responses() {
        let mut parser = ResponseParser::new(false);
        let response = feed(
            &mut parser,
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 404 Not Found\r\nContent-Length: 2\r\n\r\n{}",
        )
        .unwrap();
        assert_eq!(response.status(), 404);
    }

    #[test]
    fn head_response_has_no_body() {
        let mut parser = ResponseParser::new(true);
        let response = feed(&mut parser, b"HTTP/1.1 200 OK\r\nContent-Length: 120\r\n\r\n").unwrap();
        assert!(response.payload().is_empty());
    }

    #[test]
    fn body_until_close_completes_at_eof() {
        let mut parser = ResponseParser::new(false);
        assert!(feed(&mut parser, b"HTTP/1.0 200 OK\r\n\r\nhello").is_none());
        assert!(!parser.keep_alive());
        let response = parser.finish().unwrap();
        assert_eq!(response.payload().as_ref(), b"hello");
    }

    #[test]
    fn truncated_body_yields_partial_response() {
        let mut parser = ResponseParser::new(false);
        assert!(feed(&mut parser, b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc").is_none());
        let error = parser.finish().unwrap_err();
        assert_eq!(error.kind, ErrorKind::Protocol);
        assert_eq!(error.partial.unwrap().payload().as_ref(), b"abc");
    }

    #[test]
    fn eof_before_head_is_connect_error() {
        let mut parser = ResponseParser::new(false);
        let error = parser.finish().unwrap_err();
        assert_eq!(error.kind, ErrorKind::Connect);
        assert!(error.partial.is_none());
    }

    #[test]
    fn rejects_garbage_status_line() {
        let mut parser = ResponseParser::new(false);
        let mut buf = BytesMut::from(&b"SMTP ready\r\n\r\n"[..]);
        assert_eq!(parser.parse(&mut buf).unwrap_err().kind, ErrorKind::Protocol);
    }

    #[test]
    fn connection_close_disables_reuse() {
        let mut parser = ResponseParser::new(false);
        feed(&mut parser, b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!parser.keep_alive());
    }

    #[test]
    fn transport_round_trip_against_raw_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while find_head_end(&received).is_none() {
                let n = stream.read(&mut buf).unwrap();
                received.extend_from_slice(&buf[..n]);
            }
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nok")
                .unwrap();
            String::from_utf8(received).unwrap()
        });

        let endpoint = Endpoint::parse(&format!("http://127.0.0.1:{port}")).unwrap();
        let mut transport = HttpTransport::new(&TransportOptions::default(), Rc::new(Reactor::new().unwrap()));
        let handle = transport.connect(&endpoint);
        assert!(transport.is_open(handle));

        let request = Request::new(RestVerb::Get, "/_api/version");
        let deadline = Instant::now() + Duration::from_secs(5);
        let token = transport.send(handle, &request, Some(deadline));
        let response = match transport.poll(token, Wait::Block) {
            Poll::Complete(response) => response,
            other => panic!("unexpected poll result: {other:?}"),
        };
        assert_eq!(response.status(), 200);
        assert_eq!(response.payload().as_ref(), b"ok");
        assert_eq!(transport.in_flight(), 0);
        assert!(transport.is_open(handle));

        let head = server.join().unwrap();
        assert!(head.starts_with("GET /_api/version HTTP/1.1\r\n"));
        assert!(head.contains(&format!("Host: 127.0.0.1:{port}\r\n")));
    }

    fn read_head(stream: &mut std::net::TcpStream) -> String {
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while find_head_end(&received).is_none() {
            let n = stream.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        String::from_utf8(received).unwrap()
    }

    #[test]
    fn stale_kept_alive_socket_is_resent_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut first, _) = listener.accept().unwrap();
            read_head(&mut first);
            first
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .unwrap();
            drop(first);
            let (mut second, _) = listener.accept().unwrap();
            let head = read_head(&mut second);
            second
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nagain")
                .unwrap();
            head
        });

        let endpoint = Endpoint::parse(&format!("http://127.0.0.1:{port}")).unwrap();
        let mut transport = HttpTransport::new(&TransportOptions::default(), Rc::new(Reactor::new().unwrap()));
        let handle = transport.connect(&endpoint);
        let deadline = Instant::now() + Duration::from_secs(5);

        let first = transport.send(handle, &Request::new(RestVerb::Get, "/first"), Some(deadline));
        assert!(matches!(transport.poll(first, Wait::Block), Poll::Complete(_)));
        assert!(transport.is_open(handle));
        std::thread::sleep(Duration::from_millis(100));

        let second = transport.send(handle, &Request::new(RestVerb::Get, "/second"), Some(deadline));
        let response = match transport.poll(second, Wait::Block) {
            Poll::Complete(response) => response,
            other => panic!("unexpected poll result: {other:?}"),
        };
        assert_eq!(response.payload().as_ref(), b"again");
        assert!(server.join().unwrap().starts_with("GET /second HTTP/1.1\r\n"));
    }

    #[test]
    fn unknown_token_polls_as_cancelled() {
        let mut transport = HttpTransport::new(&TransportOptions::default(), Rc::new(Reactor::new().unwrap()));
        match transport.poll(Token(99), Wait::Step) {
            Poll::Failed(error) => assert_eq!(error.kind, ErrorKind::Cancelled),
            other => panic!("unexpected poll result: {other:?}"),
        }
    }
}
