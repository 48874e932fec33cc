//! Call-related error types.

use thiserror::Error;

use super::signaling::SignalingError;
use super::transport::TransportError;

/// Errors surfaced at the call-lifecycle boundary.
///
/// Packet-level problems never reach this type; they are concealed in the
/// media pipeline.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("a call is already in progress")]
    AlreadyInCall,

    #[error("no incoming call to answer")]
    NoIncomingCall,

    #[error("no active call")]
    NoActiveCall,

    #[error("invalid peer key: {0}")]
    InvalidPeerKey(String),

    #[error("network error: {0}")]
    Network(#[from] TransportError),

    #[error("peer is blocked")]
    PeerBlocked,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("encryption error: {0}")]
    Encryption(String),
}
