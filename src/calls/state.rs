//! Call state machine implementation.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::transport::DeliveryPath;
use super::types::{CallDirection, CallId, CallMediaType, EndCallReason, PeerRef};

/// Current state of a call.
#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub enum CallState {
    /// No session.
    #[default]
    Idle,
    /// Outgoing call: request being delivered.
    Connecting { started_at: DateTime<Utc> },
    /// Ringing on either side.
    Ringing { since: DateTime<Utc> },
    /// Media flowing.
    InCall { connected_at: DateTime<Utc> },
    /// Terminal. The session is dropped shortly after.
    Ended {
        reason: EndCallReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_in_call(&self) -> bool {
        matches!(self, Self::InCall { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    /// Waiting for the peer or the local user to answer.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Connecting { .. } | Self::Ringing { .. })
    }

    pub fn end_reason(&self) -> Option<EndCallReason> {
        match self {
            Self::Ended { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Local user placed a call.
    LocalStart,
    /// A valid call request arrived.
    RequestReceived,
    /// The callee acknowledged our request.
    RingingAcknowledged,
    /// The callee accepted our request.
    RemoteAccepted,
    /// The local user accepted an incoming call.
    LocalAccepted,
    Terminated { reason: EndCallReason },
}

/// Full call session information.
#[derive(Debug, Clone, Serialize)]
pub struct CallInfo {
    pub call_id: CallId,
    pub peer: PeerRef,
    pub direction: CallDirection,
    pub media_type: CallMediaType,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    delivery_path: Option<DeliveryPath>,
}

impl CallInfo {
    pub fn new_outgoing(call_id: CallId, peer: PeerRef, media_type: CallMediaType) -> Self {
        Self::new(call_id, peer, CallDirection::Outgoing, media_type)
    }

    pub fn new_incoming(call_id: CallId, peer: PeerRef, media_type: CallMediaType) -> Self {
        Self::new(call_id, peer, CallDirection::Incoming, media_type)
    }

    fn new(
        call_id: CallId,
        peer: PeerRef,
        direction: CallDirection,
        media_type: CallMediaType,
    ) -> Self {
        Self {
            call_id,
            peer,
            direction,
            media_type,
            state: CallState::Idle,
            created_at: Utc::now(),
            connected_at: None,
            delivery_path: None,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.direction == CallDirection::Outgoing
    }

    pub fn delivery_path(&self) -> Option<DeliveryPath> {
        self.delivery_path
    }

    /// Pin the delivery path for the rest of the session.
    ///
    /// The first choice wins; later calls return it unchanged.
    pub fn lock_delivery_path(&mut self, path: DeliveryPath) -> DeliveryPath {
        *self.delivery_path.get_or_insert(path)
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let outgoing = self.is_initiator();
        let new_state = match (&self.state, transition) {
            (CallState::Idle, CallTransition::LocalStart) if outgoing => CallState::Connecting {
                started_at: Utc::now(),
            },
            (CallState::Idle, CallTransition::RequestReceived) if !outgoing => {
                CallState::Ringing { since: Utc::now() }
            }
            (CallState::Connecting { .. }, CallTransition::RingingAcknowledged) => {
                CallState::Ringing { since: Utc::now() }
            }
            (
                CallState::Connecting { .. } | CallState::Ringing { .. },
                CallTransition::RemoteAccepted,
            ) if outgoing => CallState::InCall {
                connected_at: Utc::now(),
            },
            (CallState::Ringing { .. }, CallTransition::LocalAccepted) if !outgoing => {
                CallState::InCall {
                    connected_at: Utc::now(),
                }
            }
            (
                CallState::Connecting { .. } | CallState::Ringing { .. },
                CallTransition::Terminated { reason },
            ) => CallState::Ended {
                reason,
                ended_at: Utc::now(),
                duration_secs: None,
            },
            (CallState::InCall { connected_at }, CallTransition::Terminated { reason }) => {
                let duration = Utc::now()
                    .signed_duration_since(*connected_at)
                    .num_seconds();
                CallState::Ended {
                    reason,
                    ended_at: Utc::now(),
                    duration_secs: Some(duration),
                }
            }
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        if let CallState::InCall { connected_at } = &new_state {
            self.connected_at = Some(*connected_at);
        }
        self.state = new_state;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_outgoing_call() -> CallInfo {
        CallInfo::new_outgoing(
            CallId::new("AC90CFD09DF712D981142B172706F9F2"),
            PeerRef::from("bob"),
            CallMediaType::Audio,
        )
    }

    fn make_incoming_call() -> CallInfo {
        CallInfo::new_incoming(
            CallId::new("BC5BD1EDE9BBE601F408EF3795479E93"),
            PeerRef::from("alice"),
            CallMediaType::Video,
        )
    }

    /// Flow: Idle → Connecting → Ringing → InCall → Ended
    #[test]
    fn test_outgoing_call_flow() {
        let mut call = make_outgoing_call();
        assert!(call.state.is_idle());

        call.apply_transition(CallTransition::LocalStart).unwrap();
        assert!(matches!(call.state, CallState::Connecting { .. }));

        call.apply_transition(CallTransition::RingingAcknowledged)
            .unwrap();
        assert!(call.state.is_ringing());

        call.apply_transition(CallTransition::RemoteAccepted)
            .unwrap();
        assert!(call.state.is_in_call());
        assert!(call.connected_at.is_some());

        call.apply_transition(CallTransition::Terminated {
            reason: EndCallReason::HungUp,
        })
        .unwrap();
        assert_eq!(call.state.end_reason(), Some(EndCallReason::HungUp));
        assert!(matches!(
            call.state,
            CallState::Ended {
                duration_secs: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn test_accept_without_ringing_ack() {
        let mut call = make_outgoing_call();
        call.apply_transition(CallTransition::LocalStart).unwrap();
        call.apply_transition(CallTransition::RemoteAccepted)
            .unwrap();
        assert!(call.state.is_in_call());
    }

    /// Flow: Idle → Ringing → InCall
    #[test]
    fn test_incoming_call_flow() {
        let mut call = make_incoming_call();
        call.apply_transition(CallTransition::RequestReceived)
            .unwrap();
        assert!(call.state.is_ringing());

        call.apply_transition(CallTransition::LocalAccepted).unwrap();
        assert!(call.state.is_in_call());
    }

    #[test]
    fn test_declined_call_has_no_duration() {
        let mut call = make_incoming_call();
        call.apply_transition(CallTransition::RequestReceived)
            .unwrap();
        call.apply_transition(CallTransition::Terminated {
            reason: EndCallReason::Declined,
        })
        .unwrap();
        assert!(matches!(
            call.state,
            CallState::Ended {
                reason: EndCallReason::Declined,
                duration_secs: None,
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_transitions() {
        let mut call = make_incoming_call();
        // Only the caller starts calls.
        assert!(call.apply_transition(CallTransition::LocalStart).is_err());
        call.apply_transition(CallTransition::RequestReceived)
            .unwrap();
        // The callee never sees a remote accept.
        assert!(
            call.apply_transition(CallTransition::RemoteAccepted)
                .is_err()
        );

        let mut call = make_outgoing_call();
        call.apply_transition(CallTransition::LocalStart).unwrap();
        assert!(call.apply_transition(CallTransition::LocalAccepted).is_err());

        call.apply_transition(CallTransition::Terminated {
            reason: EndCallReason::NoAnswer,
        })
        .unwrap();
        let err = call
            .apply_transition(CallTransition::Terminated {
                reason: EndCallReason::HungUp,
            })
            .unwrap_err();
        assert!(err.to_string().contains("Ended"));
    }

    #[test]
    fn test_delivery_path_locks_once() {
        let mut call = make_outgoing_call();
        assert_eq!(call.delivery_path(), None);
        assert_eq!(
            call.lock_delivery_path(DeliveryPath::Relay),
            DeliveryPath::Relay
        );
        assert_eq!(
            call.lock_delivery_path(DeliveryPath::Direct),
            DeliveryPath::Relay
        );
        assert_eq!(call.delivery_path(), Some(DeliveryPath::Relay));
    }
}
