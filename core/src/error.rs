//! Error types for the dispatch engine.
//!
//! # Design
//! Failures come in two flavors. Configuration mistakes (bad endpoint URL,
//! a request without a verb, submitting to a closed connection) are reported
//! synchronously as `ConfigError` and never reach a callback. I/O failures
//! happen while a work item is being driven; transports report them as
//! `TransportError`, and the connection turns them into an error callback
//! carrying an `ErrorKind`.

use crate::message::Response;

/// Classification handed to error callbacks.
///
/// The numeric codes are fixed and stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad scheme, missing endpoint or an invalid request.
    Configuration,

    /// DNS failure, refused connection, or the socket failed mid-exchange.
    Connect,

    /// The item's deadline expired before a response arrived.
    Timeout,

    /// The peer sent a malformed frame or response.
    Protocol,

    /// The connection was closed while the item was still queued.
    Cancelled,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 5] = [
        ErrorKind::Configuration,
        ErrorKind::Connect,
        ErrorKind::Timeout,
        ErrorKind::Protocol,
        ErrorKind::Cancelled,
    ];

    pub fn code(self) -> u32 {
        match self {
            ErrorKind::Connect => 1001,
            ErrorKind::Timeout => 1002,
            ErrorKind::Protocol => 1102,
            ErrorKind::Cancelled => 1104,
            ErrorKind::Configuration => 1105,
        }
    }

    pub fn from_code(code: u32) -> Option<ErrorKind> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Connect => "unable to connect",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Protocol => "protocol error",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// Errors reported synchronously by `host()`, `connect()` and `submit()`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The URL scheme selects no known transport.
    #[error("unknown scheme: {0}")]
    UnknownScheme(String),

    /// The URL does not have the `scheme://host:port` shape.
    #[error("malformed endpoint url: {0}")]
    MalformedUrl(String),

    #[error("endpoint has no host")]
    MissingHost,

    #[error("invalid port: {0}")]
    InvalidPort(String),

    /// `connect()` was called before `host()`.
    #[error("no endpoint configured")]
    MissingEndpoint,

    /// Encrypted schemes parse, but opening them is not supported.
    #[error("tls endpoints are not supported: {0}")]
    TlsUnsupported(String),

    #[error("request has no verb")]
    MissingVerb,

    #[error("unknown verb: {0}")]
    InvalidVerb(String),

    #[error("request path is empty")]
    EmptyPath,

    /// A header name or value contains a line break.
    #[error("invalid header: {0}")]
    InvalidMeta(String),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

/// A failed exchange, as reported by a transport's `poll`.
///
/// `partial` holds whatever response was decoded before the failure, e.g. the
/// status line and headers of an HTTP response whose body was cut short.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: ErrorKind,
    pub message: String,
    pub partial: Option<Response>,
}

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            partial: None,
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connect, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn with_partial(mut self, response: Response) -> Self {
        self.partial = Some(response);
        self
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransportError::timeout(err.to_string())
            }
            _ => TransportError::connect(err.to_string()),
        }
    }
}
