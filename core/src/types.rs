//! Enumerations shared by requests, responses and both wire protocols.
//!
//! # Design
//! Every enum here has a fixed integer value that goes on the wire (verbs in
//! the binary protocol's message header) or is handed to callers selecting
//! formats. `EnumValues` exposes those tables by value: each call builds a
//! fresh copy from the constant table, so editing a copy can never change
//! what the next caller sees.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// HTTP-style request verb. The discriminants are the binary-protocol codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestVerb {
    Delete = 0,
    Get = 1,
    Post = 2,
    Put = 3,
    Head = 4,
    Patch = 5,
    Options = 6,
}

impl RestVerb {
    pub const ALL: [RestVerb; 7] = [
        RestVerb::Delete,
        RestVerb::Get,
        RestVerb::Post,
        RestVerb::Put,
        RestVerb::Head,
        RestVerb::Patch,
        RestVerb::Options,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<RestVerb> {
        Self::ALL.into_iter().find(|verb| verb.code() == code)
    }

    /// Method token used on the text protocol.
    pub fn as_str(self) -> &'static str {
        match self {
            RestVerb::Delete => "DELETE",
            RestVerb::Get => "GET",
            RestVerb::Post => "POST",
            RestVerb::Put => "PUT",
            RestVerb::Head => "HEAD",
            RestVerb::Patch => "PATCH",
            RestVerb::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for RestVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestVerb {
    type Err = ConfigError;

    /// Case-insensitive, so `"get"` and `"GET"` both parse.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|verb| verb.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConfigError::InvalidVerb(s.to_string()))
    }
}

const MEDIA_VPACK: &str = "application/x-velocypack";
const MEDIA_DUMP: &str = "application/x-arango-dump";
const MEDIA_JSON: &str = "application/json";
const MEDIA_HTML: &str = "text/html";
const MEDIA_TEXT: &str = "text/plain";

/// Classification of a content-type string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Unset = 0,
    Custom = 1,
    VPack = 2,
    Dump = 3,
    Json = 4,
    Html = 5,
    Text = 6,
}

impl ContentType {
    pub const ALL: [ContentType; 7] = [
        ContentType::Unset,
        ContentType::Custom,
        ContentType::VPack,
        ContentType::Dump,
        ContentType::Json,
        ContentType::Html,
        ContentType::Text,
    ];

    pub fn value(self) -> u32 {
        self as u32
    }

    pub fn from_value(value: u32) -> Option<ContentType> {
        Self::ALL.into_iter().find(|ty| ty.value() == value)
    }

    /// The canonical media type, if this classification has exactly one.
    pub fn media_type(self) -> Option<&'static str> {
        match self {
            ContentType::VPack => Some(MEDIA_VPACK),
            ContentType::Dump => Some(MEDIA_DUMP),
            ContentType::Json => Some(MEDIA_JSON),
            ContentType::Html => Some(MEDIA_HTML),
            ContentType::Text => Some(MEDIA_TEXT),
            ContentType::Unset | ContentType::Custom => None,
        }
    }

    /// Classify a header value. Parameters such as `; charset=utf-8` are
    /// ignored; anything unrecognized is `Custom`.
    pub fn classify(value: &str) -> ContentType {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("unset") {
            return ContentType::Unset;
        }
        let lower = value.to_ascii_lowercase();
        [
            ContentType::VPack,
            ContentType::Json,
            ContentType::Html,
            ContentType::Text,
            ContentType::Dump,
        ]
        .into_iter()
        .find(|ty| ty.media_type().is_some_and(|media| lower.contains(media)))
        .unwrap_or(ContentType::Custom)
    }
}

/// Wire protocol selected by the endpoint scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Length-prefixed binary chunks over a persistent socket.
    Vst,
    /// HTTP/1.1, one exchange in flight at a time.
    Http,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Vst => f.write_str("vst"),
            TransportKind::Http => f.write_str("http"),
        }
    }
}

/// Version of the binary chunk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VstVersion {
    #[serde(rename = "1.0")]
    V1_0,
    #[default]
    #[serde(rename = "1.1")]
    V1_1,
}

impl VstVersion {
    /// Bytes written once, right after the socket is opened.
    pub fn handshake(self) -> &'static [u8] {
        match self {
            VstVersion::V1_0 => b"VST/1.0\r\n\r\n",
            VstVersion::V1_1 => b"VST/1.1\r\n\r\n",
        }
    }
}

const CONTENT_TYPE_TABLE: [(&str, u32); 7] = [
    ("Unset", ContentType::Unset as u32),
    ("Custom", ContentType::Custom as u32),
    ("VPack", ContentType::VPack as u32),
    ("Dump", ContentType::Dump as u32),
    ("Json", ContentType::Json as u32),
    ("Html", ContentType::Html as u32),
    ("Text", ContentType::Text as u32),
];

const REST_VERB_TABLE: [(&str, u32); 7] = [
    ("Delete", RestVerb::Delete as u32),
    ("Get", RestVerb::Get as u32),
    ("Post", RestVerb::Post as u32),
    ("Put", RestVerb::Put as u32),
    ("Head", RestVerb::Head as u32),
    ("Patch", RestVerb::Patch as u32),
    ("Options", RestVerb::Options as u32),
];

/// A named-constant to integer mapping, handed out by value.
///
/// Mutating a returned value only changes that copy; the canonical tables
/// are compile-time constants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnumValues {
    entries: BTreeMap<String, u32>,
}

impl EnumValues {
    fn from_table(table: &[(&str, u32)]) -> Self {
        Self {
            entries: table
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
        }
    }

    /// Accepted payload and accept types.
    pub fn content_types() -> Self {
        Self::from_table(&CONTENT_TYPE_TABLE)
    }

    pub fn rest_verbs() -> Self {
        Self::from_table(&REST_VERB_TABLE)
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.entries.get(name).copied()
    }

    pub fn name_of(&self, value: u32) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, v)| **v == value)
            .map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), *value))
    }

    /// Changes this copy only.
    pub fn insert(&mut self, name: impl Into<String>, value: u32) -> Option<u32> {
        self.entries.insert(name.into(), value)
    }
}
