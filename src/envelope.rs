//! Application message envelope and its wire codec.
//!
//! A [`MessageEnvelope`] is the unit carried through the relay mesh and the
//! light-push protocol: an optional payload, an optional content topic used
//! for observer filtering, and an optional version. All three fields are
//! independently optional on the wire; absent fields are encoded as absent,
//! never as sentinel values.
//!
//! Encoding is bounded bincode (see [`crate::messages`]). Trailing bytes and
//! structurally invalid input are rejected with
//! [`CodecError::MalformedEnvelope`]; unknown data is never silently
//! ignored.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::messages;

/// Content topic used when the caller does not provide one.
pub const DEFAULT_CONTENT_TOPIC: &str = "/waku/2/default-content/proto";

/// Envelope version used when the caller does not provide one.
pub const DEFAULT_VERSION: u32 = 0;

/// Codec failures for the envelope and push RPC wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Bytes did not parse as a valid encoding: wrong field types,
    /// truncation, or unknown trailing bytes.
    MalformedEnvelope,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedEnvelope => write!(f, "bytes do not decode as a valid envelope"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Wire-level application message. Immutable once constructed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    payload: Option<Vec<u8>>,
    content_topic: Option<String>,
    version: Option<u32>,
}

impl MessageEnvelope {
    /// Wrap raw bytes as the payload, with the default content topic and
    /// version. Use [`with_content_topic`](Self::with_content_topic) /
    /// [`with_version`](Self::with_version) to override either.
    pub fn from_bytes(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: Some(payload.into()),
            content_topic: Some(DEFAULT_CONTENT_TOPIC.to_string()),
            version: Some(DEFAULT_VERSION),
        }
    }

    /// Wrap a UTF-8 string's bytes as the payload.
    pub fn from_utf8_text(text: &str) -> Self {
        Self::from_bytes(text.as_bytes().to_vec())
    }

    pub fn with_content_topic(mut self, content_topic: impl Into<String>) -> Self {
        self.content_topic = Some(content_topic.into());
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    /// Deterministic binary serialization.
    pub fn encode(&self) -> Vec<u8> {
        messages::serialize(self)
    }

    /// Parse wire bytes. Fails on anything that is not exactly one valid
    /// encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        messages::deserialize_bounded(bytes).map_err(|_| CodecError::MalformedEnvelope)
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn content_topic(&self) -> Option<&str> {
        self.content_topic.as_deref()
    }

    pub fn version(&self) -> Option<u32> {
        self.version
    }

    /// Render the payload with each byte mapped to one code unit.
    ///
    /// This is byte-for-byte parity with the original behavior and is only
    /// faithful for ASCII-range text; it is NOT UTF-8 decoding. An absent
    /// payload renders as the empty string.
    pub fn payload_as_code_units(&self) -> String {
        match &self.payload {
            Some(payload) => payload.iter().map(|b| *b as char).collect(),
            None => String::new(),
        }
    }
}
