//! Client-side request/response dispatch engine.
//!
//! # Overview
//! Callers build a `Connection` to one endpoint with `ConnectionBuilder`,
//! submit `Request`s paired with an error and a success callback, and drive
//! the queue either directly (`Connection::run`) or through an `EventLoop`
//! that steps every registered connection cooperatively.
//!
//! Two wire protocols sit behind the `Transport` trait: a framed binary
//! protocol with pipelined, id-matched messages (`vst://`) and HTTP/1.1
//! (`http://`). Both report completion identically, so the connection layer
//! never knows which one it drives.
//!
//! # Design
//! - Single-threaded: no caller-visible threads, callbacks run on the thread
//!   that called `run`. Use separate connections for concurrency.
//! - Sockets are non-blocking and driven by readiness from the event loop's
//!   `Reactor`; an idle loop sleeps in the OS selector, not on a timer.
//! - One work item in flight per connection; callbacks fire in FIFO order.
//! - A response with an error status still goes to the success callback. The
//!   error callback receives `None` when no response bytes were decoded.
//! - Configuration mistakes are returned synchronously as `ConfigError`;
//!   I/O failures reach the error callback as an `ErrorKind`.
//! - Payloads are opaque bytes tagged with a content type.
//!
//! ```no_run
//! use courier_core::{ConnectionBuilder, EventLoop, Request, RestVerb};
//!
//! let event_loop = EventLoop::new()?;
//! let mut builder = ConnectionBuilder::new();
//! builder.host("http://127.0.0.1:8529")?;
//! let connection = builder.connect(&event_loop)?;
//!
//! connection.submit(
//!     &Request::new(RestVerb::Get, "/_api/version"),
//!     |kind, _req, _res| eprintln!("failed: {kind}"),
//!     |_req, res| println!("status {}", res.status()),
//! )?;
//! connection.run();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod builder;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod http;
pub mod message;
pub mod reactor;
pub mod transport;
pub mod types;
pub mod vst;

#[cfg(test)]
mod testing;

pub use builder::{ConnectionBuilder, ConnectionConfig, Endpoint, Server};
pub use connection::{Connection, ConnectionState, ErrorCallback, SuccessCallback};
pub use error::{ConfigError, ErrorKind, TransportError};
pub use event_loop::{EventLoop, RoundSummary};
pub use message::{Outcome, Request, Response};
pub use reactor::Reactor;
pub use transport::{Poll, Stage, Token, Transport, TransportOptions, Wait};
pub use types::{ContentType, EnumValues, RestVerb, TransportKind, VstVersion};
