//! Binary-protocol front end for the mock router.
//!
//! Each accepted socket starts with a `VST/1.0` or `VST/1.1` handshake line,
//! followed by little-endian chunks:
//!
//! ```text
//! [chunk_length:4][chunk_x:4][message_id:8][message_length:8?][data]
//! ```
//!
//! Complete messages are dispatched concurrently, so replies leave in
//! completion order and clients must match them by message id.

use std::collections::{BTreeMap, HashMap};
use std::io;

use axum::{
    body::Body,
    http::{self, Method, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tower::ServiceExt;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_CHUNK_SIZE: usize = 30000;

const SHORT_HEADER: usize = 16;
const LONG_HEADER: usize = 24;
const MAX_CHUNK_LENGTH: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V1_0,
    V1_1,
}

impl Version {
    fn from_handshake(line: &[u8]) -> Option<Self> {
        match line {
            b"VST/1.0\r\n\r\n" => Some(Version::V1_0),
            b"VST/1.1\r\n\r\n" => Some(Version::V1_1),
            _ => None,
        }
    }

    fn header_len(self, first: bool, chunks: u32) -> usize {
        match self {
            Version::V1_1 => LONG_HEADER,
            Version::V1_0 if first && chunks > 1 => LONG_HEADER,
            Version::V1_0 => SHORT_HEADER,
        }
    }
}

/// Accept binary-protocol clients until the listener fails.
pub async fn serve(listener: TcpListener, app: Router, max_chunk_size: usize) -> io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "binary protocol listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, app, max_chunk_size).await {
                debug!(%peer, error = %e, "binary connection ended with error");
            }
        });
    }
}

#[derive(Default)]
struct Partial {
    expected: Option<u32>,
    parts: BTreeMap<u32, Vec<u8>>,
}

async fn handle_connection(stream: TcpStream, app: Router, max_chunk_size: usize) -> io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let mut handshake = [0u8; 11];
    reader.read_exact(&mut handshake).await?;
    let version = Version::from_handshake(&handshake)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad handshake"))?;
    debug!(?version, "binary handshake");

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            writer.write_all(&bytes).await?;
        }
        Ok::<_, io::Error>(())
    });

    let mut partial: HashMap<u64, Partial> = HashMap::new();
    loop {
        let mut prefix = [0u8; 4];
        match reader.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let length = u32::from_le_bytes(prefix) as usize;
        if !(SHORT_HEADER..=MAX_CHUNK_LENGTH).contains(&length) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, format!("bad chunk length {length}")));
        }
        let mut chunk = vec![0u8; length];
        chunk[..4].copy_from_slice(&prefix);
        reader.read_exact(&mut chunk[4..]).await?;

        let Some((id, message)) = assemble(version, &chunk, &mut partial)? else {
            continue;
        };
        let app = app.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let reply = dispatch(app, &message).await;
            // The reader may already be gone.
            let _ = tx.send(encode_chunks(version, id, max_chunk_size, &reply));
        });
    }

    drop(tx);
    writer_task
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

fn assemble(
    version: Version,
    chunk: &[u8],
    partial: &mut HashMap<u64, Partial>,
) -> io::Result<Option<(u64, Vec<u8>)>> {
    let chunk_x = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&chunk[8..16]);
    let id = u64::from_le_bytes(id_bytes);

    let first = chunk_x & 1 == 1;
    let count = if first { chunk_x >> 1 } else { 0 };
    let index = if first { 0 } else { chunk_x >> 1 };
    let header_len = version.header_len(first, count);
    if chunk.len() < header_len {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "chunk shorter than its header"));
    }
    let data = chunk[header_len..].to_vec();

    if first && count == 1 {
        return Ok(Some((id, data)));
    }
    let entry = partial.entry(id).or_default();
    if first {
        entry.expected = Some(count);
    }
    entry.parts.insert(index, data);
    match entry.expected {
        Some(expected) if entry.parts.len() as u32 >= expected => {
            let entry = partial.remove(&id).unwrap_or_default();
            Ok(Some((id, entry.parts.into_values().flatten().collect())))
        }
        _ => Ok(None),
    }
}

fn encode_chunks(version: Version, id: u64, max_chunk_size: usize, message: &[u8]) -> Vec<u8> {
    let max_data = max_chunk_size.saturating_sub(LONG_HEADER).max(1);
    let pieces: Vec<&[u8]> = if message.is_empty() {
        vec![message]
    } else {
        message.chunks(max_data).collect()
    };
    let count = pieces.len() as u32;

    let mut out = Vec::with_capacity(message.len() + pieces.len() * LONG_HEADER);
    for (index, data) in pieces.into_iter().enumerate() {
        let first = index == 0;
        let chunk_x = if first { (count << 1) | 1 } else { (index as u32) << 1 };
        let header_len = version.header_len(first, count);
        out.extend_from_slice(&((header_len + data.len()) as u32).to_le_bytes());
        out.extend_from_slice(&chunk_x.to_le_bytes());
        out.extend_from_slice(&id.to_le_bytes());
        if header_len == LONG_HEADER {
            out.extend_from_slice(&(message.len() as u64).to_le_bytes());
        }
        out.extend_from_slice(data);
    }
    out
}

fn method_for(verb: u64) -> Option<Method> {
    Some(match verb {
        0 => Method::DELETE,
        1 => Method::GET,
        2 => Method::POST,
        3 => Method::PUT,
        4 => Method::HEAD,
        5 => Method::PATCH,
        6 => Method::OPTIONS,
        _ => return None,
    })
}

fn encode_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn string_map(value: Option<&Value>) -> Vec<(String, String)> {
    match value {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| (k.clone(), v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())))
            .collect(),
        _ => Vec::new(),
    }
}

/// Turn a request message into an `http::Request` for the router.
fn decode_request(message: &[u8]) -> Result<http::Request<Body>, String> {
    if message.len() < 4 {
        return Err("message too short".into());
    }
    let header_len = u32::from_le_bytes([message[0], message[1], message[2], message[3]]) as usize;
    let rest = &message[4..];
    if rest.len() < header_len {
        return Err("header length exceeds message".into());
    }
    let (header, payload) = rest.split_at(header_len);
    let header: Value = serde_json::from_slice(header).map_err(|e| e.to_string())?;
    let fields = header.as_array().ok_or("header is not an array")?;

    if fields.get(1).and_then(Value::as_u64) != Some(1) {
        return Err("not a request message".into());
    }
    let database = fields.get(2).and_then(Value::as_str).unwrap_or(crate::DEFAULT_DATABASE);
    let method = fields
        .get(3)
        .and_then(Value::as_u64)
        .and_then(method_for)
        .ok_or("unknown verb")?;
    let path = fields.get(4).and_then(Value::as_str).ok_or("missing path")?;

    let mut uri = format!("/_db/{}{}", encode_component(database), path);
    let params = string_map(fields.get(5));
    for (i, (key, value)) in params.iter().enumerate() {
        uri.push(if i == 0 && !path.contains('?') { '?' } else { '&' });
        uri.push_str(&encode_component(key));
        uri.push('=');
        uri.push_str(&encode_component(value));
    }

    let mut builder = http::Request::builder().method(method).uri(uri);
    for (key, value) in string_map(fields.get(6)) {
        builder = builder.header(key, value);
    }
    builder
        .body(Body::from(payload.to_vec()))
        .map_err(|e| e.to_string())
}

fn response_message(status: u16, content_type: Option<&str>, body: &[u8]) -> Vec<u8> {
    let mut meta = serde_json::Map::new();
    if let Some(content_type) = content_type {
        meta.insert("content-type".into(), Value::String(content_type.to_string()));
    }
    let header = json!([1, 2, status, meta]).to_string().into_bytes();
    let mut out = Vec::with_capacity(4 + header.len() + body.len());
    out.extend_from_slice(&(header.len() as u32).to_le_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(body);
    out
}

async fn dispatch(app: Router, message: &[u8]) -> Vec<u8> {
    let request = match decode_request(message) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "undecodable binary request");
            let body = json!({ "error": true, "code": 400, "errorMessage": e }).to_string();
            return response_message(400, Some("application/json"), body.as_bytes());
        }
    };
    debug!(method = %request.method(), uri = %request.uri(), "binary request");

    let response = match app.oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };
    let status = response.status();
    let content_type = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    match response.into_body().collect().await {
        Ok(collected) => response_message(status.as_u16(), content_type.as_deref(), &collected.to_bytes()),
        Err(e) => {
            warn!(error = %e, "failed to collect response body");
            response_message(StatusCode::INTERNAL_SERVER_ERROR.as_u16(), None, &[])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_message(header: Value, payload: &[u8]) -> Vec<u8> {
        let header = header.to_string().into_bytes();
        let mut out = (header.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(&header);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn single_chunk_is_returned_directly() {
        let chunks = encode_chunks(Version::V1_1, 7, DEFAULT_MAX_CHUNK_SIZE, b"hello");
        assert_eq!(chunks.len(), LONG_HEADER + 5);
        assert_eq!(u32::from_le_bytes([chunks[4], chunks[5], chunks[6], chunks[7]]), 3);

        let mut partial = HashMap::new();
        let (id, message) = assemble(Version::V1_1, &chunks, &mut partial).unwrap().unwrap();
        assert_eq!(id, 7);
        assert_eq!(message, b"hello");
    }

    #[test]
    fn multi_chunk_messages_reassemble() {
        let message: Vec<u8> = (0..=255u8).collect();
        for version in [Version::V1_0, Version::V1_1] {
            let wire = encode_chunks(version, 9, LONG_HEADER + 100, &message);
            let mut partial = HashMap::new();
            let mut offset = 0;
            let mut result = None;
            while offset < wire.len() {
                let length = u32::from_le_bytes([wire[offset], wire[offset + 1], wire[offset + 2], wire[offset + 3]]) as usize;
                result = assemble(version, &wire[offset..offset + length], &mut partial).unwrap();
                offset += length;
            }
            assert_eq!(result, Some((9, message.clone())));
            assert!(partial.is_empty());
        }
    }

    #[test]
    fn decodes_request_header_into_http_request() {
        let message = request_message(
            json!([1, 1, "_system", 2, "/_api/cursor", {"batch size": "5"}, {"content-type": "application/json"}]),
            b"{}",
        );
        let request = decode_request(&message).unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri(), "/_db/_system/_api/cursor?batch%20size=5");
        assert_eq!(request.headers()["content-type"], "application/json");
    }

    #[test]
    fn rejects_response_typed_message() {
        let message = request_message(json!([1, 2, 200, {}]), b"");
        assert!(decode_request(&message).is_err());
    }

    #[test]
    fn response_header_is_json_array() {
        let message = response_message(404, Some("application/json"), b"{}");
        let header_len = u32::from_le_bytes([message[0], message[1], message[2], message[3]]) as usize;
        let header: Value = serde_json::from_slice(&message[4..4 + header_len]).unwrap();
        assert_eq!(header, json!([1, 2, 404, {"content-type": "application/json"}]));
        assert_eq!(&message[4 + header_len..], b"{}");
    }
}
