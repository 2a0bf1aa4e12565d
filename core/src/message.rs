//! Request and response values.
//!
//! # Design
//! A `Request` is assembled incrementally through setters and is only
//! validated when it is submitted to a connection, so a half-built request is
//! not an error. Submission clones the request into the work item; the same
//! value can be submitted again and again.
//!
//! A `Response` exists only once bytes came back from the server. "No
//! response" is `Option::None` at every API boundary, which keeps it distinct
//! from a response carrying an error status.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{ConfigError, ErrorKind};
use crate::types::{ContentType, RestVerb};

/// An outbound call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    verb: Option<RestVerb>,
    path: String,
    database: Option<String>,
    parameters: BTreeMap<String, String>,
    meta: BTreeMap<String, String>,
    payload: Option<Bytes>,
    content_type: Option<String>,
    accept_type: Option<String>,
    timeout: Option<Duration>,
}

impl Request {
    pub fn new(verb: RestVerb, path: impl Into<String>) -> Self {
        Self {
            verb: Some(verb),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn set_verb(&mut self, verb: RestVerb) -> &mut Self {
        self.verb = Some(verb);
        self
    }

    /// Set the verb from its name (`"get"`, `"POST"`, ...).
    pub fn set_verb_str(&mut self, verb: &str) -> Result<&mut Self, ConfigError> {
        self.verb = Some(verb.parse()?);
        Ok(self)
    }

    pub fn set_path(&mut self, path: impl Into<String>) -> &mut Self {
        self.path = path.into();
        self
    }

    pub fn set_database(&mut self, database: impl Into<String>) -> &mut Self {
        self.database = Some(database.into());
        self
    }

    pub fn add_parameter(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Extra header sent along with the request.
    pub fn add_meta(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.meta.insert(key.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Attach an opaque payload. The engine never looks inside it.
    pub fn set_payload(&mut self, payload: impl Into<Bytes>) -> &mut Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn set_content_type(&mut self, media_type: impl Into<String>) -> &mut Self {
        self.content_type = Some(media_type.into());
        self
    }

    pub fn set_accept_type(&mut self, media_type: impl Into<String>) -> &mut Self {
        self.accept_type = Some(media_type.into());
        self
    }

    /// Deadline for one submission, counted from the moment the item starts
    /// being driven.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn verb(&self) -> Option<RestVerb> {
        self.verb
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn meta(&self) -> &BTreeMap<String, String> {
        &self.meta
    }

    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn accept_type(&self) -> Option<&str> {
        self.accept_type.as_deref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Check the fields a transport cannot do without. Header-like values
    /// must not contain line breaks.
    pub fn validate(&self) -> Result<RestVerb, ConfigError> {
        let verb = self.verb.ok_or(ConfigError::MissingVerb)?;
        if self.path.is_empty() {
            return Err(ConfigError::EmptyPath);
        }
        let typed = [
            ("content-type", self.content_type.as_deref()),
            ("accept", self.accept_type.as_deref()),
        ];
        let headers = self
            .meta
            .iter()
            .map(|(key, value)| (key.as_str(), Some(value.as_str())))
            .chain(typed);
        for (key, value) in headers {
            if has_line_break(key) || value.is_some_and(has_line_break) {
                return Err(ConfigError::InvalidMeta(key.escape_debug().to_string()));
            }
        }
        Ok(verb)
    }
}

fn has_line_break(text: &str) -> bool {
    text.contains(['\r', '\n'])
}

/// The result of an exchange that produced bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: u16,
    content_type: String,
    meta: BTreeMap<String, String>,
    payload: Bytes,
}

impl Response {
    pub fn new(status: u16, content_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: content_type.into(),
            meta: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    pub fn with_meta(mut self, meta: BTreeMap<String, String>) -> Self {
        self.meta = meta;
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn content_kind(&self) -> ContentType {
        ContentType::classify(&self.content_type)
    }

    /// Response headers, keys lower-cased.
    pub fn meta(&self) -> &BTreeMap<String, String> {
        &self.meta
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// How a work item ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A response arrived, whatever its status code.
    Success(Response),
    /// No complete response; the response is present only if some bytes
    /// were decoded before the failure.
    Failure(ErrorKind, Option<Response>),
}

impl Outcome {
    pub fn response(&self) -> Option<&Response> {
        match self {
            Outcome::Success(response) => Some(response),
            Outcome::Failure(_, partial) => partial.as_ref(),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(kind, _) => Some(*kind),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}
