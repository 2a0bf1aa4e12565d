//! Endpoint parsing, configuration and connection construction.
//!
//! # Design
//! `ConnectionBuilder::host` parses the endpoint URL eagerly so a bad scheme
//! is reported at the call that introduced it. `connect` only validates and
//! assembles: no socket is opened until the first work item is driven.
//!
//! Recognized schemes:
//!
//! | scheme                 | transport | tls |
//! |------------------------|-----------|-----|
//! | `vst`, `tcp`           | binary    | no  |
//! | `vsts`, `ssl`          | binary    | yes |
//! | `http`, `http+tcp`     | HTTP      | no  |
//! | `https`, `http+ssl`    | HTTP      | yes |
//!
//! Encrypted endpoints parse but are refused by `connect`.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::connection::{Connection, ConnectionSettings};
use crate::error::ConfigError;
use crate::event_loop::EventLoop;
use crate::transport::{for_kind, TransportOptions};
use crate::types::{TransportKind, VstVersion};
use crate::vst::{DEFAULT_MAX_CHUNK_SIZE, MAX_CHUNK_HEADER_SIZE};

pub const DEFAULT_PORT: u16 = 8529;

/// A parsed `scheme://host:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    kind: TransportKind,
    tls: bool,
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let url = url.trim();
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| ConfigError::MalformedUrl(url.to_string()))?;

        let (kind, tls) = match scheme.to_ascii_lowercase().as_str() {
            "vst" | "tcp" => (TransportKind::Vst, false),
            "vsts" | "ssl" => (TransportKind::Vst, true),
            "http" | "http+tcp" => (TransportKind::Http, false),
            "https" | "http+ssl" => (TransportKind::Http, true),
            _ => return Err(ConfigError::UnknownScheme(scheme.to_string())),
        };

        let authority = rest.split('/').next().unwrap_or_default();
        if authority.contains('@') {
            return Err(ConfigError::MalformedUrl(url.to_string()));
        }
        let (host, port) = split_authority(authority, url)?;
        if host.is_empty() {
            return Err(ConfigError::MissingHost);
        }
        let port = match port {
            None => DEFAULT_PORT,
            Some(port) => port
                .parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| ConfigError::InvalidPort(port.to_string()))?,
        };

        Ok(Self {
            kind,
            tls,
            host: host.to_string(),
            port,
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn scheme(&self) -> &'static str {
        match (self.kind, self.tls) {
            (TransportKind::Vst, false) => "vst",
            (TransportKind::Vst, true) => "vsts",
            (TransportKind::Http, false) => "http",
            (TransportKind::Http, true) => "https",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme(), self.authority())
    }
}

/// Split `host[:port]` or `[v6]:port`.
fn split_authority<'a>(authority: &'a str, url: &str) -> Result<(&'a str, Option<&'a str>), ConfigError> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ConfigError::MalformedUrl(url.to_string()))?;
        return match tail {
            "" => Ok((host, None)),
            _ => tail
                .strip_prefix(':')
                .map(|port| (host, Some(port)))
                .ok_or_else(|| ConfigError::MalformedUrl(url.to_string())),
        };
    }
    Ok(match authority.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (authority, None),
    })
}

/// Connection settings as loaded from JSON.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    pub endpoint: Option<String>,
    pub vst_version: VstVersion,
    pub max_chunk_size: usize,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: Option<u64>,
    pub database: Option<String>,
    pub asynchronous: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            vst_version: VstVersion::default(),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            connect_timeout_ms: 5000,
            request_timeout_ms: None,
            database: None,
            asynchronous: false,
        }
    }
}

impl ConnectionConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::InvalidConfig(e.to_string()))
    }
}

/// Validates settings and produces `Connection`s.
#[derive(Debug, Clone, Default)]
pub struct ConnectionBuilder {
    endpoint: Option<Endpoint>,
    options: TransportOptions,
    request_timeout: Option<Duration>,
    database: Option<String>,
    asynchronous: bool,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ConnectionConfig) -> Result<Self, ConfigError> {
        let mut builder = Self::new();
        if let Some(url) = &config.endpoint {
            builder.host(url)?;
        }
        builder
            .vst_version(config.vst_version)
            .max_chunk_size(config.max_chunk_size)
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .asynchronous(config.asynchronous);
        if let Some(ms) = config.request_timeout_ms {
            builder.request_timeout(Duration::from_millis(ms));
        }
        if let Some(database) = &config.database {
            builder.database(database.clone());
        }
        builder.validate_options()?;
        Ok(builder)
    }

    /// Parse and store the endpoint; the scheme selects the transport.
    pub fn host(&mut self, url: &str) -> Result<&mut Self, ConfigError> {
        self.endpoint = Some(Endpoint::parse(url)?);
        Ok(self)
    }

    pub fn vst_version(&mut self, version: VstVersion) -> &mut Self {
        self.options.vst_version = version;
        self
    }

    /// Largest chunk the binary transport writes, header included.
    pub fn max_chunk_size(&mut self, size: usize) -> &mut Self {
        self.options.max_chunk_size = size;
        self
    }

    pub fn connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Deadline applied to requests that carry no timeout of their own.
    pub fn request_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Database used by requests that name none.
    pub fn database(&mut self, name: impl Into<String>) -> &mut Self {
        self.database = Some(name.into());
        self
    }

    pub fn asynchronous(&mut self, asynchronous: bool) -> &mut Self {
        self.asynchronous = asynchronous;
        self
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Produce an idle connection registered with `event_loop`. The socket is
    /// opened lazily by the first `run`.
    pub fn connect(&self, event_loop: &EventLoop) -> Result<Connection, ConfigError> {
        let endpoint = self.validate()?;
        let transport = for_kind(endpoint.kind(), &self.options, event_loop.reactor());
        let settings = ConnectionSettings {
            request_timeout: self.request_timeout,
            database: self.database.clone(),
            asynchronous: self.asynchronous,
        };
        Ok(Connection::new(endpoint.clone(), transport, settings, event_loop))
    }

    fn validate(&self) -> Result<&Endpoint, ConfigError> {
        let endpoint = self.endpoint.as_ref().ok_or(ConfigError::MissingEndpoint)?;
        if endpoint.is_tls() {
            return Err(ConfigError::TlsUnsupported(endpoint.to_string()));
        }
        self.validate_options()?;
        Ok(endpoint)
    }

    fn validate_options(&self) -> Result<(), ConfigError> {
        if self.options.max_chunk_size <= MAX_CHUNK_HEADER_SIZE {
            return Err(ConfigError::InvalidConfig(format!(
                "max_chunk_size must exceed {MAX_CHUNK_HEADER_SIZE}, got {}",
                self.options.max_chunk_size
            )));
        }
        if self.options.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidConfig("connect timeout must be positive".into()));
        }
        if self.request_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::InvalidConfig("request timeout must be positive".into()));
        }
        Ok(())
    }
}

/// A validated default configuration that hands out fresh connections.
#[derive(Debug, Clone)]
pub struct Server {
    builder: ConnectionBuilder,
}

impl Server {
    pub fn new(builder: ConnectionBuilder) -> Result<Self, ConfigError> {
        builder.validate()?;
        Ok(Self { builder })
    }

    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let mut builder = ConnectionBuilder::new();
        builder.host(url)?;
        Self::new(builder)
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.builder.endpoint()
    }

    pub fn connection(&self, event_loop: &EventLoop) -> Result<Connection, ConfigError> {
        self.builder.connect(event_loop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_schemes_and_aliases() {
        let cases = [
            ("vst://db:8530", TransportKind::Vst, false),
            ("tcp://db:8530", TransportKind::Vst, false),
            ("vsts://db:8530", TransportKind::Vst, true),
            ("http://db:8530", TransportKind::Http, false),
            ("http+tcp://db:8530", TransportKind::Http, false),
            ("HTTPS://db:8530", TransportKind::Http, true),
        ];
        for (url, kind, tls) in cases {
            let endpoint = Endpoint::parse(url).unwrap();
            assert_eq!(endpoint.kind(), kind, "{url}");
            assert_eq!(endpoint.is_tls(), tls, "{url}");
            assert_eq!(endpoint.host(), "db");
            assert_eq!(endpoint.port(), 8530);
        }
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert_eq!(
            Endpoint::parse("ftp://db:21").unwrap_err(),
            ConfigError::UnknownScheme("ftp".into())
        );
        assert!(matches!(
            Endpoint::parse("localhost:8529").unwrap_err(),
            ConfigError::MalformedUrl(_)
        ));
    }

    #[test]
    fn port_defaults_and_validation() {
        assert_eq!(Endpoint::parse("http://db").unwrap().port(), DEFAULT_PORT);
        assert_eq!(Endpoint::parse("http://db:8529/").unwrap().port(), 8529);
        assert_eq!(
            Endpoint::parse("http://db:http").unwrap_err(),
            ConfigError::InvalidPort("http".into())
        );
        assert_eq!(Endpoint::parse("http://:8529").unwrap_err(), ConfigError::MissingHost);
    }

    #[test]
    fn ipv6_host_is_bracketed_in_authority() {
        let endpoint = Endpoint::parse("vst://[::1]:8529").unwrap();
        assert_eq!(endpoint.host(), "::1");
        assert_eq!(endpoint.authority(), "[::1]:8529");
        assert_eq!(endpoint.to_string(), "vst://[::1]:8529");
    }

    #[test]
    fn display_uses_canonical_scheme() {
        let endpoint = Endpoint::parse("http+tcp://localhost:8529").unwrap();
        assert_eq!(endpoint.to_string(), "http://localhost:8529");
    }

    #[test]
    fn connect_requires_endpoint() {
        let event_loop = EventLoop::new().unwrap();
        let err = ConnectionBuilder::new().connect(&event_loop).unwrap_err();
        assert_eq!(err, ConfigError::MissingEndpoint);
    }

    #[test]
    fn connect_refuses_tls() {
        let event_loop = EventLoop::new().unwrap();
        let mut builder = ConnectionBuilder::new();
        builder.host("https://localhost:8529").unwrap();
        assert!(matches!(
            builder.connect(&event_loop).unwrap_err(),
            ConfigError::TlsUnsupported(_)
        ));
    }

    #[test]
    fn connect_is_lazy() {
        // Nothing listens on port 1; building must still succeed.
        let event_loop = EventLoop::new().unwrap();
        let mut builder = ConnectionBuilder::new();
        builder.host("vst://127.0.0.1:1").unwrap();
        let connection = builder.connect(&event_loop).unwrap();
        assert!(!connection.is_running());
        assert_eq!(connection.transport_kind(), TransportKind::Vst);
    }

    #[test]
    fn config_from_json_applies_defaults() {
        let config = ConnectionConfig::from_json(r#"{"endpoint":"vst://localhost:8529","vst_version":"1.0"}"#)
            .unwrap();
        assert_eq!(config.vst_version, VstVersion::V1_0);
        assert_eq!(config.max_chunk_size, DEFAULT_MAX_CHUNK_SIZE);
        assert_eq!(config.connect_timeout_ms, 5000);
        assert!(!config.asynchronous);

        let builder = ConnectionBuilder::from_config(&config).unwrap();
        assert_eq!(builder.endpoint().unwrap().kind(), TransportKind::Vst);
    }

    #[test]
    fn config_rejects_bad_values() {
        assert!(matches!(
            ConnectionConfig::from_json(r#"{"vst_version":"2.0"}"#).unwrap_err(),
            ConfigError::InvalidConfig(_)
        ));
        assert!(matches!(
            ConnectionConfig::from_json(r#"{"colour":"blue"}"#).unwrap_err(),
            ConfigError::InvalidConfig(_)
        ));
        let config = ConnectionConfig::from_json(r#"{"max_chunk_size":10}"#).unwrap();
        assert!(matches!(
            ConnectionBuilder::from_config(&config).unwrap_err(),
            ConfigError::InvalidConfig(_)
        ));
    }

    #[test]
    fn server_validates_up_front() {
        assert!(Server::from_url("vsts://localhost:8529").is_err());
        let server = Server::from_url("http://localhost:8529").unwrap();
        let event_loop = EventLoop::new().unwrap();
        let first = server.connection(&event_loop).unwrap();
        let second = server.connection(&event_loop).unwrap();
        assert_eq!(first.endpoint(), second.endpoint());
        assert_eq!(event_loop.len(), 2);
    }
}
