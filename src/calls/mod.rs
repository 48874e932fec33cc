//! End-to-end encrypted calls.
//!
//! This module owns the lifecycle of a single call with one peer and the
//! media engine that carries its audio.
//!
//! # Architecture
//!
//! - [`CallManager`]: the call state machine; applies local actions and inbound signals
//! - [`CallState`] & [`CallInfo`]: lifecycle states and the current session record
//! - [`SignalingPacket`]: timestamped call-request/ringing/accept/decline/end packets
//! - [`KeyAgreement`]: per-peer key for the encrypted signaling envelope
//! - [`PeerTransport`] & [`TransportRoutes`]: opaque delivery to a peer, relay or direct
//! - [`RelayDelivery`]: relay socket with mailbox fallback and concurrent receive loops
//! - [`LivenessTracker`]: audio silence detection, backoff reconnection, forced end
//! - [`media`]: codec, encryption and loss-recovery pipeline
//!
//! # Lifecycle
//!
//! ```text
//! idle ─startCall─▶ connecting ─ringing ack─▶ ringing ─accept─▶ inCall ─▶ ended ─1s─▶ idle
//! idle ─request──▶ ringing ─accept_call─▶ inCall
//! ```
//!
//! Any pending or connected state may end (hang-up, decline, no answer,
//! network error, connection lost). State changes are published as
//! [`CallEvent`]s.

mod encryption;
mod error;
mod events;
mod manager;
pub mod media;
mod monitor;
mod relay;
mod signaling;
mod state;
mod transport;
mod types;

pub use encryption::{
    KeyAgreement, PresharedKeyAgreement, SessionKeyMaterial, SignalingKey, X25519KeyAgreement,
};
pub use error::CallError;
pub use events::CallEvent;
pub use manager::{CallManager, CallManagerConfig};
pub use monitor::{ConnectionMonitorConfig, LivenessTracker, MonitorAction};
pub use relay::{RelayConfig, RelayDelivery, RelayMailbox, RelaySocket, UdpRelaySocket};
pub use signaling::{
    ConnectedAt, Signal, SignalingConfig, SignalingError, SignalingPacket, SignalingType,
    check_freshness, end_signal_applies, now_ms,
};
pub use state::{CallInfo, CallState, CallTransition, InvalidTransition};
pub use transport::{DeliveryPath, InboundHandler, PeerTransport, TransportError, TransportRoutes};
pub use types::{CallDirection, CallId, CallMediaType, CallRole, EndCallReason, PeerRef};
