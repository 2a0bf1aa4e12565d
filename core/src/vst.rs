//! Framed binary transport (VelocyStream-style chunks).
//!
//! # Wire format
//! After opening the socket the client writes a handshake line,
//! `VST/1.0\r\n\r\n` or `VST/1.1\r\n\r\n`. Every message is then split into
//! chunks, each prefixed by a little-endian header:
//!
//! ```text
//! [chunk_length:4][chunk_x:4][message_id:8][message_length:8][data:N]
//! ```
//!
//! - **chunk_length**: header plus data
//! - **chunk_x**: `(count << 1) | 1` on the first chunk, `index << 1` after it
//! - **message_id**: matches replies to requests
//! - **message_length**: total message size. VST 1.1 always sends it; VST 1.0
//!   only on the first chunk of a multi-chunk message.
//!
//! A message is `[header_length:4][header:json][payload]`. Request headers are
//! `[1, 1, database, verb, path, {parameters}, {meta}]`, response headers are
//! `[1, 2, status, {meta}]`. The payload is never inspected.
//!
//! Requests are pipelined: several messages can be on the wire at once and
//! replies are routed by message id.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::time::Instant;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::builder::Endpoint;
use crate::error::{ErrorKind, TransportError};
use crate::message::{Request, Response};
use crate::reactor::Reactor;
use crate::transport::{
    expired, Fill, Handle, Link, Poll, Stage, Token, Transport, TransportOptions, Wait,
};
use crate::types::{ContentType, TransportKind, VstVersion};

pub const MIN_CHUNK_HEADER_SIZE: usize = 16;
pub const MAX_CHUNK_HEADER_SIZE: usize = 24;
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 30000;

/// Upper bound on a single chunk we are willing to buffer.
pub const MAX_CHUNK_LENGTH: u32 = 64 * 1024 * 1024;

const MESSAGE_VERSION: u32 = 1;
const TYPE_REQUEST: u32 = 1;
const TYPE_RESPONSE: u32 = 2;
const DEFAULT_DATABASE: &str = "_system";

/// Parsed chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_length: u32,
    pub chunk_x: u32,
    pub message_id: u64,
    pub message_length: u64,
}

impl ChunkHeader {
    pub fn is_first(&self) -> bool {
        self.chunk_x & 1 == 1
    }

    pub fn index(&self) -> u32 {
        if self.is_first() {
            0
        } else {
            self.chunk_x >> 1
        }
    }

    /// Only known on the first chunk; zero otherwise.
    pub fn number_of_chunks(&self) -> u32 {
        if self.is_first() {
            self.chunk_x >> 1
        } else {
            0
        }
    }

    pub fn header_length(&self, version: VstVersion) -> usize {
        match version {
            VstVersion::V1_1 => MAX_CHUNK_HEADER_SIZE,
            VstVersion::V1_0 if self.is_first() && self.number_of_chunks() > 1 => {
                MAX_CHUNK_HEADER_SIZE
            }
            VstVersion::V1_0 => MIN_CHUNK_HEADER_SIZE,
        }
    }

    pub fn write(&self, version: VstVersion, buf: &mut BytesMut) {
        buf.put_u32_le(self.chunk_length);
        buf.put_u32_le(self.chunk_x);
        buf.put_u64_le(self.message_id);
        if self.header_length(version) == MAX_CHUNK_HEADER_SIZE {
            buf.put_u64_le(self.message_length);
        }
    }
}

/// Length of the chunk starting at `buf`, if all of it has arrived.
pub fn complete_chunk_length(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    (buf.len() >= length).then_some(length)
}

/// Decode the chunk at the start of `buf`, which must hold the whole chunk.
pub fn read_chunk(version: VstVersion, buf: &[u8]) -> Result<(ChunkHeader, &[u8]), TransportError> {
    if buf.len() < MIN_CHUNK_HEADER_SIZE {
        return Err(TransportError::protocol(format!(
            "chunk too short: {} bytes",
            buf.len()
        )));
    }
    let mut cursor = buf;
    let chunk_length = cursor.get_u32_le();
    let chunk_x = cursor.get_u32_le();
    let message_id = cursor.get_u64_le();
    let mut header = ChunkHeader {
        chunk_length,
        chunk_x,
        message_id,
        message_length: 0,
    };

    let header_length = header.header_length(version);
    if (chunk_length as usize) < header_length || buf.len() < chunk_length as usize {
        return Err(TransportError::protocol(format!(
            "invalid chunk length: {chunk_length}"
        )));
    }
    if header_length == MAX_CHUNK_HEADER_SIZE {
        header.message_length = cursor.get_u64_le();
    }
    let data = &buf[header_length..chunk_length as usize];
    if header_length == MIN_CHUNK_HEADER_SIZE && header.is_first() {
        header.message_length = data.len() as u64;
    }
    if header.is_first() && header.number_of_chunks() == 0 {
        return Err(TransportError::protocol("first chunk announces zero chunks"));
    }
    Ok((header, data))
}

/// Split `message` into encoded chunks of at most `max_chunk_size` bytes.
pub fn build_chunks(
    version: VstVersion,
    message_id: u64,
    max_chunk_size: usize,
    message: &[u8],
) -> BytesMut {
    let max_data = max_chunk_size.saturating_sub(MAX_CHUNK_HEADER_SIZE).max(1);
    let pieces: Vec<&[u8]> = if message.is_empty() {
        vec![message]
    } else {
        message.chunks(max_data).collect()
    };
    let count = pieces.len() as u32;

    let mut out = BytesMut::with_capacity(message.len() + pieces.len() * MAX_CHUNK_HEADER_SIZE);
    for (index, data) in pieces.into_iter().enumerate() {
        let chunk_x = if index == 0 {
            (count << 1) | 1
        } else {
            (index as u32) << 1
        };
        let mut header = ChunkHeader {
            chunk_length: 0,
            chunk_x,
            message_id,
            message_length: message.len() as u64,
        };
        header.chunk_length = (header.header_length(version) + data.len()) as u32;
        header.write(version, &mut out);
        out.extend_from_slice(data);
    }
    out
}

#[derive(Serialize)]
struct RequestHeader<'a>(
    u32,
    u32,
    &'a str,
    u32,
    &'a str,
    &'a BTreeMap<String, String>,
    &'a BTreeMap<String, String>,
);

/// Encode a request as a message body: header length, header, payload.
pub fn encode_request(request: &Request) -> Result<Vec<u8>, TransportError> {
    let verb = request
        .validate()
        .map_err(|e| TransportError::new(ErrorKind::Configuration, e.to_string()))?;

    let mut meta = request.meta().clone();
    if let Some(content_type) = request.content_type() {
        meta.insert("content-type".to_string(), content_type.to_string());
    }
    if let Some(accept) = request.accept_type() {
        meta.insert("accept".to_string(), accept.to_string());
    }

    let header = RequestHeader(
        MESSAGE_VERSION,
        TYPE_REQUEST,
        request.database().unwrap_or(DEFAULT_DATABASE),
        verb.code(),
        request.path(),
        request.parameters(),
        &meta,
    );
    let header = serde_json::to_vec(&header)
        .map_err(|e| TransportError::protocol(format!("cannot encode message header: {e}")))?;

    let payload = request.payload();
    let mut body = Vec::with_capacity(4 + header.len() + payload.len());
    body.extend_from_slice(&(header.len() as u32).to_le_bytes());
    body.extend_from_slice(&header);
    body.extend_from_slice(payload);
    Ok(body)
}

/// Decode a reassembled response message.
pub fn decode_response(message: &[u8]) -> Result<Response, TransportError> {
    if message.len() < 4 {
        return Err(TransportError::protocol("message shorter than its header length"));
    }
    let header_length = u32::from_le_bytes([message[0], message[1], message[2], message[3]]) as usize;
    let rest = &message[4..];
    if rest.len() < header_length {
        return Err(TransportError::protocol(format!(
            "message header length {header_length} exceeds message"
        )));
    }
    let (header, payload) = rest.split_at(header_length);

    let header: serde_json::Value = serde_json::from_slice(header)
        .map_err(|e| TransportError::protocol(format!("invalid message header: {e}")))?;
    let fields = header
        .as_array()
        .ok_or_else(|| TransportError::protocol("message header is not an array"))?;

    let message_type = fields.get(1).and_then(|v| v.as_u64());
    if message_type != Some(u64::from(TYPE_RESPONSE)) {
        return Err(TransportError::protocol(format!(
            "unexpected message type: {message_type:?}"
        )));
    }
    let status = fields
        .get(2)
        .and_then(|v| v.as_u64())
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| TransportError::protocol("response header has no status"))?;

    let meta: BTreeMap<String, String> = match fields.get(3) {
        Some(serde_json::Value::Object(map)) => map
            .iter()
            .map(|(k, v)| {
                let value = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                (k.to_ascii_lowercase(), value)
            })
            .collect(),
        _ => BTreeMap::new(),
    };
    let content_type = meta
        .get("content-type")
        .cloned()
        .or_else(|| ContentType::VPack.media_type().map(str::to_string))
        .unwrap_or_default();

    Ok(Response::new(status, content_type, Bytes::copy_from_slice(payload)).with_meta(meta))
}

/// Collects the chunks of one message until all have arrived.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    chunks: Vec<(u32, Bytes)>,
    expected: Option<u32>,
}

impl MessageAssembler {
    /// Add a chunk; returns the full message once the last one arrived.
    pub fn add(&mut self, header: &ChunkHeader, data: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        if header.is_first() {
            if self.expected.is_some() {
                return Err(TransportError::protocol(format!(
                    "duplicate first chunk for message {}",
                    header.message_id
                )));
            }
            self.expected = Some(header.number_of_chunks());
        }
        let index = header.index();
        if self.chunks.iter().any(|(i, _)| *i == index) {
            return Err(TransportError::protocol(format!(
                "duplicate chunk {index} for message {}",
                header.message_id
            )));
        }
        self.chunks.push((index, Bytes::copy_from_slice(data)));

        let Some(expected) = self.expected else {
            return Ok(None);
        };
        if (self.chunks.len() as u32) < expected {
            return Ok(None);
        }
        self.chunks.sort_by_key(|(i, _)| *i);
        if self.chunks.iter().enumerate().any(|(pos, (i, _))| pos as u32 != *i) {
            return Err(TransportError::protocol(format!(
                "chunk indices out of range for message {}",
                header.message_id
            )));
        }
        let total = self.chunks.iter().map(|(_, d)| d.len()).sum();
        let mut message = Vec::with_capacity(total);
        for (_, data) in self.chunks.drain(..) {
            message.extend_from_slice(&data);
        }
        Ok(Some(message))
    }
}

#[derive(Debug)]
struct Inflight {
    handle: Handle,
    deadline: Option<Instant>,
    written_at: u64,
    assembler: MessageAssembler,
}

/// Pipelining transport over one persistent socket.
pub struct VstTransport {
    link: Link,
    options: TransportOptions,
    next_message_id: u64,
    inflight: HashMap<u64, Inflight>,
    finished: HashMap<u64, Poll>,
}

impl VstTransport {
    pub fn new(options: &TransportOptions, reactor: Rc<Reactor>) -> Self {
        Self {
            link: Link::new(reactor),
            options: options.clone(),
            next_message_id: 1,
            inflight: HashMap::new(),
            finished: HashMap::new(),
        }
    }

    /// Resolve every in-flight message on `handle` with `error`.
    fn fail_handle(&mut self, handle: Handle, error: TransportError) {
        self.link.fail(handle, &error);
        let ids: Vec<u64> = self
            .inflight
            .iter()
            .filter(|(_, item)| item.handle == handle)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.inflight.remove(&id);
            self.finished.insert(id, Poll::Failed(error.clone()));
        }
    }
}

/// Route every complete chunk in `inbound` to its message.
fn dispatch_chunks(
    version: VstVersion,
    inbound: &mut BytesMut,
    inflight: &mut HashMap<u64, Inflight>,
    finished: &mut HashMap<u64, Poll>,
) -> Result<(), TransportError> {
    while let Some(length) = complete_chunk_length(&inbound[..]) {
        if length as u32 > MAX_CHUNK_LENGTH {
            return Err(TransportError::protocol(format!("chunk too large: {length} bytes")));
        }
        let chunk = inbound.split_to(length);
        let (header, data) = read_chunk(version, &chunk)?;
        trace!(
            message_id = header.message_id,
            index = header.index(),
            bytes = data.len(),
            "chunk received"
        );

        let Some(item) = inflight.get_mut(&header.message_id) else {
            warn!(message_id = header.message_id, "discarding chunk for unknown message");
            continue;
        };
        if let Some(message) = item.assembler.add(&header, data)? {
            inflight.remove(&header.message_id);
            let result = match decode_response(&message) {
                Ok(response) => Poll::Complete(response),
                Err(error) => Poll::Failed(error),
            };
            finished.insert(header.message_id, result);
        }
    }
    // A length prefix beyond the cap would otherwise wait forever.
    if inbound.len() >= 4 {
        let length = u32::from_le_bytes([inbound[0], inbound[1], inbound[2], inbound[3]]);
        if length > MAX_CHUNK_LENGTH {
            return Err(TransportError::protocol(format!("chunk too large: {length} bytes")));
        }
    }
    Ok(())
}

impl Transport for VstTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Vst
    }

    fn connect(&mut self, endpoint: &Endpoint) -> Handle {
        let handle = self.link.connect(endpoint, self.options.connect_timeout);
        if let Ok(socket) = self.link.socket(handle) {
            socket.enqueue(self.options.vst_version.handshake());
            debug!(endpoint = %endpoint, version = ?self.options.vst_version, "vst handshake queued");
        }
        handle
    }

    fn is_open(&self, handle: Handle) -> bool {
        self.link.is_open(handle)
    }

    fn send(&mut self, handle: Handle, request: &Request, deadline: Option<Instant>) -> Token {
        let id = self.next_message_id;
        self.next_message_id += 1;
        let token = Token(id);

        let message = match encode_request(request) {
            Ok(message) => message,
            Err(error) => {
                self.finished.insert(id, Poll::Failed(error));
                return token;
            }
        };
        let socket = match self.link.socket(handle) {
            Ok(socket) => socket,
            Err(error) => {
                self.finished.insert(id, Poll::Failed(error));
                return token;
            }
        };
        let chunks = build_chunks(self.options.vst_version, id, self.options.max_chunk_size, &message);
        let written_at = socket.enqueue(&chunks);
        trace!(message_id = id, bytes = chunks.len(), "message queued");

        self.inflight.insert(
            id,
            Inflight {
                handle,
                deadline,
                written_at,
                assembler: MessageAssembler::default(),
            },
        );
        token
    }

    fn poll(&mut self, token: Token, wait: Wait) -> Poll {
        let id = token.0;
        loop {
            if let Some(result) = self.finished.remove(&id) {
                return result;
            }
            let Some(item) = self.inflight.get(&id) else {
                return Poll::Failed(TransportError::new(
                    ErrorKind::Cancelled,
                    format!("message {id} is not in flight"),
                ));
            };
            let (handle, deadline, written_at) = (item.handle, item.deadline, item.written_at);

            if expired(deadline) {
                // Late chunks for this id are discarded by dispatch_chunks.
                self.inflight.remove(&id);
                return Poll::Failed(TransportError::timeout(format!("message {id} timed out")));
            }

            let socket = match self.link.socket(handle) {
                Ok(socket) => socket,
                Err(error) => {
                    self.fail_handle(handle, error);
                    continue;
                }
            };

            if let Err(error) = socket.flush(wait, deadline) {
                if error.kind == ErrorKind::Timeout {
                    self.inflight.remove(&id);
                    return Poll::Failed(error);
                }
                self.fail_handle(handle, error);
                continue;
            }
            if socket.flushed() < written_at {
                return Poll::Pending(Stage::Sending);
            }

            if let Err(error) = dispatch_chunks(
                self.options.vst_version,
                socket.inbound(),
                &mut self.inflight,
                &mut self.finished,
            ) {
                self.fail_handle(handle, error);
                continue;
            }
            if self.finished.contains_key(&id) {
                continue;
            }

            match socket.fill(wait, deadline) {
                Ok(Fill::Data(_)) => continue,
                Ok(Fill::WouldBlock) => return Poll::Pending(Stage::AwaitingResponse),
                Ok(Fill::Eof) => {
                    self.fail_handle(handle, TransportError::connect("connection closed by peer"));
                }
                Err(error) if error.kind == ErrorKind::Timeout => {
                    self.inflight.remove(&id);
                    return Poll::Failed(error);
                }
                Err(error) => self.fail_handle(handle, error),
            }
        }
    }

    fn cancel(&mut self, token: Token) {
        self.inflight.remove(&token.0);
        self.finished.remove(&token.0);
    }

    fn close(&mut self, handle: Handle) {
        self.link.close(handle);
        self.inflight.retain(|_, item| item.handle != handle);
    }

    fn in_flight(&self) -> usize {
        self.inflight.len() + self.finished.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RestVerb;

    fn chunk_bytes(length: u32, chunk_x: u32, id: u64, message_length: u64, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(&chunk_x.to_le_bytes());
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&message_length.to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn reads_single_chunk_v1_1() {
        let chunk = chunk_bytes(28, 3, 1, 4, &[0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(complete_chunk_length(&chunk), Some(28));

        let (header, data) = read_chunk(VstVersion::V1_1, &chunk).unwrap();
        assert_eq!(header.chunk_length, 28);
        assert_eq!(header.message_id, 1);
        assert_eq!(header.message_length, 4);
        assert!(header.is_first());
        assert_eq!(header.index(), 0);
        assert_eq!(header.number_of_chunks(), 1);
        assert_eq!(data, &[0x0a, 0x0b, 0x0c, 0x0d]);

        let mut written = BytesMut::new();
        header.write(VstVersion::V1_1, &mut written);
        assert_eq!(&written[..], &chunk[..MAX_CHUNK_HEADER_SIZE]);
    }

    #[test]
    fn reads_follow_up_chunks() {
        let id = (1u64 << 56) + 1;
        let first = chunk_bytes(28, 7, id, 12, b"abcd");
        let second = chunk_bytes(28, 2, id, 12, b"efgh");
        let third = chunk_bytes(28, 4, id, 12, b"ijkl");

        let (h0, _) = read_chunk(VstVersion::V1_1, &first).unwrap();
        assert_eq!(h0.number_of_chunks(), 3);
        assert_eq!(h0.message_id, id);
        let (h1, _) = read_chunk(VstVersion::V1_1, &second).unwrap();
        assert!(!h1.is_first());
        assert_eq!(h1.index(), 1);
        assert_eq!(h1.number_of_chunks(), 0);
        let (h2, _) = read_chunk(VstVersion::V1_1, &third).unwrap();
        assert_eq!(h2.index(), 2);
    }

    #[test]
    fn incomplete_chunk_is_not_ready() {
        let chunk = chunk_bytes(28, 3, 1, 4, b"abcd");
        assert_eq!(complete_chunk_length(&chunk[..27]), None);
        assert_eq!(complete_chunk_length(&chunk[..3]), None);
    }

    #[test]
    fn v1_0_single_chunk_uses_short_header() {
        let out = build_chunks(VstVersion::V1_0, 9, DEFAULT_MAX_CHUNK_SIZE, b"payload");
        assert_eq!(out.len(), MIN_CHUNK_HEADER_SIZE + 7);
        let (header, data) = read_chunk(VstVersion::V1_0, &out).unwrap();
        assert_eq!(header.chunk_x, 3);
        assert_eq!(header.message_length, 7);
        assert_eq!(data, b"payload");
    }

    #[test]
    fn splits_and_reassembles_large_messages() {
        let message: Vec<u8> = (0..100u8).collect();
        for version in [VstVersion::V1_0, VstVersion::V1_1] {
            let mut wire = build_chunks(version, 5, MAX_CHUNK_HEADER_SIZE + 30, &message);
            let mut assembler = MessageAssembler::default();
            let mut result = None;
            let mut chunks = 0;
            while let Some(length) = complete_chunk_length(&wire) {
                let chunk = wire.split_to(length);
                let (header, data) = read_chunk(version, &chunk).unwrap();
                assert_eq!(header.message_id, 5);
                chunks += 1;
                result = assembler.add(&header, data).unwrap();
            }
            assert_eq!(chunks, 4);
            assert_eq!(result.unwrap(), message);
        }
    }

    #[test]
    fn assembler_accepts_out_of_order_chunks() {
        let id = 3;
        let first = ChunkHeader { chunk_length: 0, chunk_x: (2 << 1) | 1, message_id: id, message_length: 4 };
        let second = ChunkHeader { chunk_length: 0, chunk_x: 1 << 1, message_id: id, message_length: 4 };
        let mut assembler = MessageAssembler::default();
        assert_eq!(assembler.add(&second, b"cd").unwrap(), None);
        assert_eq!(assembler.add(&first, b"ab").unwrap(), Some(b"abcd".to_vec()));
    }

    #[test]
    fn assembler_rejects_duplicate_chunk() {
        let header = ChunkHeader { chunk_length: 0, chunk_x: 2, message_id: 1, message_length: 0 };
        let mut assembler = MessageAssembler::default();
        assembler.add(&header, b"x").unwrap();
        assert_eq!(assembler.add(&header, b"x").unwrap_err().kind, ErrorKind::Protocol);
    }

    #[test]
    fn request_header_layout() {
        let mut request = Request::new(RestVerb::Post, "/_api/cursor");
        request
            .set_payload(&b"PAYLOAD"[..])
            .set_content_type("application/json")
            .add_parameter("waitForSync", "true");
        let body = encode_request(&request).unwrap();

        let header_length = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
        let header: serde_json::Value = serde_json::from_slice(&body[4..4 + header_length]).unwrap();
        assert_eq!(
            header,
            serde_json::json!([1, 1, "_system", 2, "/_api/cursor",
                {"waitForSync": "true"}, {"content-type": "application/json"}])
        );
        assert_eq!(&body[4 + header_length..], b"PAYLOAD");
    }

    #[test]
    fn encode_rejects_invalid_request() {
        let err = encode_request(&Request::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
    }

    #[test]
    fn decodes_response_message() {
        let header = br#"[1,2,201,{"Content-Type":"application/json","x-id":7}]"#;
        let mut message = (header.len() as u32).to_le_bytes().to_vec();
        message.extend_from_slice(header);
        message.extend_from_slice(b"{\"ok\":true}");

        let response = decode_response(&message).unwrap();
        assert_eq!(response.status(), 201);
        assert_eq!(response.content_type(), "application/json");
        assert_eq!(response.meta().get("x-id").map(String::as_str), Some("7"));
        assert_eq!(&response.payload()[..], b"{\"ok\":true}");
    }

    #[test]
    fn response_without_meta_defaults_to_vpack() {
        let header = br#"[1,2,200]"#;
        let mut message = (header.len() as u32).to_le_bytes().to_vec();
        message.extend_from_slice(header);
        let response = decode_response(&message).unwrap();
        assert_eq!(response.content_type(), "application/x-velocypack");
        assert!(response.payload().is_empty());
    }

    #[test]
    fn rejects_request_typed_reply() {
        let header = br#"[1,1,"_system",1,"/"]"#;
        let mut message = (header.len() as u32).to_le_bytes().to_vec();
        message.extend_from_slice(header);
        assert_eq!(decode_response(&message).unwrap_err().kind, ErrorKind::Protocol);
    }

    #[test]
    fn dispatch_discards_unknown_message_ids() {
        let mut inbound = BytesMut::new();
        inbound.extend_from_slice(&build_chunks(VstVersion::V1_1, 42, DEFAULT_MAX_CHUNK_SIZE, b"late"));
        let mut inflight = HashMap::new();
        let mut finished = HashMap::new();
        dispatch_chunks(VstVersion::V1_1, &mut inbound, &mut inflight, &mut finished).unwrap();
        assert!(inbound.is_empty());
        assert!(finished.is_empty());
    }
}
