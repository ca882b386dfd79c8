//! # Wire Types
//!
//! Serialization types for the overlay protocol. Everything on the wire is
//! JSON (`serde_json`), so browser peers can speak it without a codec.
//!
//! ## Envelope
//!
//! ```text
//! {
//!   "body":         "<JSON string, signed by the origin>",
//!   "body_sig":     "<b64 signature over body>",
//!   "back_path":    ["<identity>.<b64 sig>", ...],      most recent hop first
//!   "forward_path": "<identity>,<identity>,...",         destination first (optional)
//!   "forward_sig":  "<b64 origin signature over forward_path>"  (optional)
//! }
//! ```
//!
//! ## Body
//!
//! The body is a JSON object tagged by `type`. Each [`MessageKind`] knows how
//! it may travel ([`RouteClass`]):
//!
//! | Class | Kinds | Requirements |
//! |-------|-------|--------------|
//! | Routable | `lookup`, `request_connect`, `data` | `target`, `expiration` |
//! | Forwardable | `lookup_result`, `connect`, `broken_path` | `expiration` |
//! | Direct | `ping`, `pong` | exactly one back-path entry, no forward path |
//!
//! `expiration` is unix seconds in hex. A body may also carry `encrypted`, a
//! sealed token whose plaintext is a JSON object merged into the body.
//!
//! ## Security Limits
//!
//! - `MAX_ENVELOPE_SIZE`: received envelopes above this are dropped unparsed
//! - `MAX_BACK_PATH_LEN` / `MAX_FORWARD_PATH_LEN`: bound per-hop verification work

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::identity::KadId;

/// Upper bound on a serialized envelope (one data-channel message).
pub const MAX_ENVELOPE_SIZE: usize = 256 * 1024;

/// Upper bound on back-path entries. Each entry costs one signature check.
pub const MAX_BACK_PATH_LEN: usize = 64;

/// Upper bound on forward-path identities.
pub const MAX_FORWARD_PATH_LEN: usize = 64;

/// Default lifetime written into originated bodies.
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(5 * 60);

/// Body field holding sealed extra fields.
pub const ENCRYPTED_FIELD: &str = "encrypted";

/// Separator between a back-path entry's identity and its signature.
pub const BACK_PATH_SEPARATOR: char = '.';

/// Separator between forward-path identities.
pub const FORWARD_PATH_SEPARATOR: char = ',';

// ============================================================================
// Envelope
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub body: String,
    pub body_sig: String,
    pub back_path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_sig: Option<String>,
}

impl WireEnvelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse, refusing oversized input before touching the JSON parser.
    pub fn from_bytes(bytes: &[u8], max_size: usize) -> Result<Self, WireError> {
        if bytes.len() > max_size {
            return Err(WireError::TooLarge {
                size: bytes.len(),
                max: max_size,
            });
        }
        serde_json::from_slice(bytes).map_err(|e| WireError::Json(e.to_string()))
    }

    /// The destination named by the forward path, if any.
    pub fn forward_destination(&self) -> Option<&str> {
        self.forward_path
            .as_deref()
            .and_then(|fp| fp.split(FORWARD_PATH_SEPARATOR).next())
    }

    pub fn strip_forward_path(&mut self) {
        self.forward_path = None;
        self.forward_sig = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    TooLarge { size: usize, max: usize },
    Json(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::TooLarge { size, max } => {
                write!(f, "envelope of {size} bytes exceeds limit of {max}")
            }
            WireError::Json(e) => write!(f, "invalid JSON: {e}"),
        }
    }
}

impl std::error::Error for WireError {}

// ============================================================================
// Expiration
// ============================================================================

/// Absolute expiry in whole unix seconds, hex-encoded on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Expiration(u64);

impl Expiration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    pub fn after(ttl: Duration, now_secs: u64) -> Self {
        Self(now_secs.saturating_add(ttl.as_secs()))
    }

    pub const fn as_secs(&self) -> u64 {
        self.0
    }

    /// Live strictly before the expiry second: equal to `now` is already expired.
    #[inline]
    pub fn is_live_at(&self, now_secs: u64) -> bool {
        self.0 > now_secs
    }
}

impl Serialize for Expiration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:x}", self.0))
    }
}

impl<'de> Deserialize<'de> for Expiration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        // `from_str_radix` alone would also take a leading sign.
        if s.is_empty() || s.len() > 16 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(serde::de::Error::custom("expiration must be 1-16 hex digits"));
        }
        u64::from_str_radix(&s, 16)
            .map(Expiration)
            .map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Session Descriptions
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An offer or answer as produced by the transport, mirroring the browser's
/// `RTCSessionDescriptionInit`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

// ============================================================================
// Body
// ============================================================================

/// How a message kind is allowed to travel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteClass {
    /// Distance-routed toward `target`, hop by hop.
    Routable,
    /// Source-routed only, along a forward path.
    Forwardable,
    /// Single hop between direct neighbors.
    Direct,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    /// Find the node responsible for `target`.
    Lookup { target: KadId },
    /// Ask the node responsible for `target` to open a connection back to the origin.
    RequestConnect {
        target: KadId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bucket: Option<u16>,
    },
    /// Application payload for the identity `to`, routed toward its kad id.
    Data {
        target: KadId,
        to: String,
        /// Base64 payload. Absent on the wire when sealed to `to`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    /// Answer to a `lookup`: the responder and its siblings.
    LookupResult {
        target: KadId,
        request: String,
        closest: String,
        #[serde(default)]
        siblings: Vec<String>,
    },
    /// Offer or answer exchanged over the overlay.
    Connect { sdp: SessionDescription },
    /// A forwarding hop could not continue the source route of `request`.
    BrokenPath { request: String },
    Ping { nonce: u64 },
    Pong { nonce: u64 },
}

impl MessageKind {
    pub fn class(&self) -> RouteClass {
        match self {
            MessageKind::Lookup { .. }
            | MessageKind::RequestConnect { .. }
            | MessageKind::Data { .. } => RouteClass::Routable,
            MessageKind::LookupResult { .. }
            | MessageKind::Connect { .. }
            | MessageKind::BrokenPath { .. } => RouteClass::Forwardable,
            MessageKind::Ping { .. } | MessageKind::Pong { .. } => RouteClass::Direct,
        }
    }

    /// Routing target for routable kinds.
    pub fn target(&self) -> Option<KadId> {
        match self {
            MessageKind::Lookup { target }
            | MessageKind::RequestConnect { target, .. }
            | MessageKind::Data { target, .. } => Some(*target),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            MessageKind::Lookup { .. } => "lookup",
            MessageKind::RequestConnect { .. } => "request_connect",
            MessageKind::Data { .. } => "data",
            MessageKind::LookupResult { .. } => "lookup_result",
            MessageKind::Connect { .. } => "connect",
            MessageKind::BrokenPath { .. } => "broken_path",
            MessageKind::Ping { .. } => "ping",
            MessageKind::Pong { .. } => "pong",
        }
    }
}

/// The signed payload. Serialized as one flat JSON object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    #[serde(flatten)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<Expiration>,
}

impl Body {
    /// Body for `kind`, stamped with an expiration unless it is direct-only.
    pub fn new(kind: MessageKind, ttl: Duration, now_secs: u64) -> Self {
        let expiration = match kind.class() {
            RouteClass::Direct => None,
            _ => Some(Expiration::after(ttl, now_secs)),
        };
        Self { kind, expiration }
    }

    pub fn class(&self) -> RouteClass {
        self.kind.class()
    }
}
