//! Typed notifications published by the call manager.

use std::time::Duration;

use super::media::QualityLevel;
use super::state::CallState;
use super::types::{CallId, CallMediaType, EndCallReason, PeerRef};

/// Events delivered to subscribers of [`CallManager::subscribe`].
///
/// [`CallManager::subscribe`]: super::CallManager::subscribe
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Every lifecycle transition, including the return to idle.
    StateChanged {
        call_id: Option<CallId>,
        state: CallState,
    },
    /// A new call is ringing locally. Published once per coalesced request.
    IncomingCall {
        call_id: CallId,
        peer: PeerRef,
        media_type: CallMediaType,
    },
    /// No inbound audio for a while; reconnection has started.
    ConnectionDegraded {
        call_id: CallId,
        silent_for: Duration,
    },
    /// A reconnection attempt on the locked path.
    Reconnecting { call_id: CallId, attempt: u32 },
    /// Audio resumed after a degraded period.
    ConnectionRestored { call_id: CallId },
    QualityChanged {
        call_id: CallId,
        level: QualityLevel,
    },
    CallEnded {
        call_id: CallId,
        peer: PeerRef,
        reason: EndCallReason,
        duration_secs: Option<i64>,
    },
}

impl CallEvent {
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::StateChanged { call_id, .. } => call_id.as_ref(),
            Self::IncomingCall { call_id, .. }
            | Self::ConnectionDegraded { call_id, .. }
            | Self::Reconnecting { call_id, .. }
            | Self::ConnectionRestored { call_id }
            | Self::QualityChanged { call_id, .. }
            | Self::CallEnded { call_id, .. } => Some(call_id),
        }
    }
}
