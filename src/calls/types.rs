//! Identifiers and small enums shared across the call subsystem.

use serde::Serialize;
use std::fmt;

/// Unique call identifier (32 uppercase hex chars on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CallId(String);

impl CallId {
    /// Generate a fresh random call id.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(hex::encode_upper(bytes))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque reference to a remote peer, resolved by the peer transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PeerRef(String);

impl PeerRef {
    pub fn new(peer: impl Into<String>) -> Self {
        Self(peer.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

impl CallDirection {
    /// Which end of the shared media key this side uses.
    pub fn role(self) -> CallRole {
        match self {
            Self::Outgoing => CallRole::Initiator,
            Self::Incoming => CallRole::Responder,
        }
    }
}

/// Media kind negotiated in the call request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum CallMediaType {
    #[default]
    Audio,
    Video,
}

/// Role in the key exchange. Both directions share one key, so the role
/// selects distinct nonce salts for each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Initiator,
    Responder,
}

/// Why a call ended. Carried as a UTF-8 string in call-end packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndCallReason {
    /// Either side hung up.
    HungUp,
    /// The callee declined.
    Declined,
    /// Nobody answered before the ring timeout.
    NoAnswer,
    /// Signaling could not be delivered.
    NetworkError,
    /// The peer went away without a clean hang-up.
    PeerDisconnected,
    /// No inbound audio for longer than the hard timeout.
    ConnectionLost,
    /// Another device of ours took the call.
    AnsweredElsewhere,
}

impl EndCallReason {
    pub const ALL: [EndCallReason; 7] = [
        Self::HungUp,
        Self::Declined,
        Self::NoAnswer,
        Self::NetworkError,
        Self::PeerDisconnected,
        Self::ConnectionLost,
        Self::AnsweredElsewhere,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::HungUp => "hung-up",
            Self::Declined => "declined",
            Self::NoAnswer => "no-answer",
            Self::NetworkError => "network-error",
            Self::PeerDisconnected => "peer-disconnected",
            Self::ConnectionLost => "connection-lost",
            Self::AnsweredElsewhere => "answered-elsewhere",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == s)
    }
}

impl fmt::Display for EndCallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
