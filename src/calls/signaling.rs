//! Call signaling packets and the freshness guards applied to them.
//!
//! Wire format (inside the encrypted signaling envelope):
//!
//! ```text
//! [type: u8][created_at: u64 ms since epoch, BE][payload]
//! ```
//!
//! | Type | Payload |
//! |------|---------|
//! | `CallRequest` / `VideoCallRequest` | `[32 key][4 salt][call-id utf8?]` |
//! | `CallRinging` / `CallAccept` | `[call-id utf8?]` |
//! | `CallDecline` / `CallEnd` | `[reason utf8]` |
//!
//! A 37-byte call request without a timestamp is accepted from older peers.
//! End and decline packets must always carry a timestamp.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::encryption::{SALT_LEN, SESSION_KEY_LEN, SessionKeyMaterial};
use super::types::{CallId, CallMediaType, EndCallReason};

/// Length of the creation timestamp.
pub const TIMESTAMP_LEN: usize = 8;

/// Size of a pre-timestamp call request: type byte, key, salt.
pub const LEGACY_REQUEST_LEN: usize = 1 + SESSION_KEY_LEN + SALT_LEN;

const MIN_TIMESTAMPED_LEN: usize = 1 + TIMESTAMP_LEN;

/// Signaling packet type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SignalingType {
    CallRequest = 1,
    CallRinging = 2,
    CallAccept = 3,
    CallDecline = 4,
    CallEnd = 5,
    VideoCallRequest = 6,
}

impl SignalingType {
    pub const ALL: [SignalingType; 6] = [
        Self::CallRequest,
        Self::CallRinging,
        Self::CallAccept,
        Self::CallDecline,
        Self::CallEnd,
        Self::VideoCallRequest,
    ];

    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::CallRequest => "call-request",
            Self::CallRinging => "call-ringing",
            Self::CallAccept => "call-accept",
            Self::CallDecline => "call-decline",
            Self::CallEnd => "call-end",
            Self::VideoCallRequest => "video-call-request",
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| *t as u8 == value)
    }

    /// Whether packets of this type are only trusted with a timestamp.
    pub const fn requires_timestamp(&self) -> bool {
        !matches!(self, Self::CallRequest)
    }
}

impl fmt::Display for SignalingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag_name())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("signaling packet too short: {0} bytes")]
    TooShort(usize),

    #[error("unknown signaling type: {0:#04x}")]
    UnknownType(u8),

    #[error("signaling packet is {age_ms} ms old")]
    Stale { age_ms: u64 },

    #[error("signaling packet is dated {ahead_ms} ms in the future")]
    FutureDated { ahead_ms: u64 },

    #[error("{0} packet without timestamp")]
    MissingTimestamp(SignalingType),

    #[error("call request carries a malformed session key")]
    BadKeyLength,

    #[error("signaling payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("failed to seal signaling envelope")]
    Seal,

    #[error("failed to open signaling envelope")]
    Open,
}

/// Freshness and ordering limits for inbound signaling.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Packets older than this are dropped.
    pub max_age: Duration,
    /// Packets dated further than this in the future are dropped.
    pub max_future_skew: Duration,
    /// After connecting, end signals dated before the connect time are
    /// ignored for this long.
    pub end_grace: Duration,
    /// Repeated requests from the same peer within this window ring once.
    pub duplicate_request_window: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(30),
            max_future_skew: Duration::from_secs(5),
            end_grace: Duration::from_secs(3),
            duplicate_request_window: Duration::from_secs(5),
        }
    }
}

/// Decoded signaling payload.
#[derive(Debug, Clone)]
pub enum Signal {
    CallRequest {
        key: SessionKeyMaterial,
        call_id: Option<CallId>,
        media_type: CallMediaType,
    },
    CallRinging {
        call_id: Option<CallId>,
    },
    CallAccept {
        call_id: Option<CallId>,
    },
    CallDecline {
        reason: EndCallReason,
    },
    CallEnd {
        reason: EndCallReason,
    },
}

impl Signal {
    pub fn signaling_type(&self) -> SignalingType {
        match self {
            Self::CallRequest {
                media_type: CallMediaType::Audio,
                ..
            } => SignalingType::CallRequest,
            Self::CallRequest {
                media_type: CallMediaType::Video,
                ..
            } => SignalingType::VideoCallRequest,
            Self::CallRinging { .. } => SignalingType::CallRinging,
            Self::CallAccept { .. } => SignalingType::CallAccept,
            Self::CallDecline { .. } => SignalingType::CallDecline,
            Self::CallEnd { .. } => SignalingType::CallEnd,
        }
    }

    /// Call id carried by the packet, if the type has one.
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::CallRequest { call_id, .. }
            | Self::CallRinging { call_id }
            | Self::CallAccept { call_id } => call_id.as_ref(),
            Self::CallDecline { .. } | Self::CallEnd { .. } => None,
        }
    }
}

/// A signaling packet with its creation time.
#[derive(Debug, Clone)]
pub struct SignalingPacket {
    pub signal: Signal,
    /// Milliseconds since the Unix epoch. `None` only for legacy requests.
    pub created_at_ms: Option<u64>,
}

impl SignalingPacket {
    pub fn new(signal: Signal, created_at_ms: u64) -> Self {
        Self {
            signal,
            created_at_ms: Some(created_at_ms),
        }
    }

    /// Stamp a packet with the current wall clock.
    pub fn now(signal: Signal) -> Self {
        Self::new(signal, now_ms())
    }

    pub fn encode(&self) -> Vec<u8> {
        let kind = self.signal.signaling_type();
        let mut out = Vec::with_capacity(MIN_TIMESTAMPED_LEN + SESSION_KEY_LEN + SALT_LEN + 32);
        out.push(kind as u8);
        if let Some(ts) = self.created_at_ms {
            out.extend_from_slice(&ts.to_be_bytes());
        }
        match &self.signal {
            Signal::CallRequest { key, call_id, .. } => {
                out.extend_from_slice(key.key());
                out.extend_from_slice(key.salt());
                if let Some(id) = call_id {
                    out.extend_from_slice(id.as_str().as_bytes());
                }
            }
            Signal::CallRinging { call_id } | Signal::CallAccept { call_id } => {
                if let Some(id) = call_id {
                    out.extend_from_slice(id.as_str().as_bytes());
                }
            }
            Signal::CallDecline { reason } | Signal::CallEnd { reason } => {
                out.extend_from_slice(reason.as_str().as_bytes());
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, SignalingError> {
        let Some(&tag) = data.first() else {
            return Err(SignalingError::TooShort(0));
        };
        let kind = SignalingType::from_u8(tag).ok_or(SignalingError::UnknownType(tag))?;

        if kind == SignalingType::CallRequest && data.len() == LEGACY_REQUEST_LEN {
            let key = parse_key(&data[1..])?;
            return Ok(Self {
                signal: Signal::CallRequest {
                    key,
                    call_id: None,
                    media_type: CallMediaType::Audio,
                },
                created_at_ms: None,
            });
        }

        if data.len() < MIN_TIMESTAMPED_LEN {
            return Err(if kind.requires_timestamp() {
                SignalingError::MissingTimestamp(kind)
            } else {
                SignalingError::TooShort(data.len())
            });
        }

        let mut ts = [0u8; TIMESTAMP_LEN];
        ts.copy_from_slice(&data[1..MIN_TIMESTAMPED_LEN]);
        let created_at_ms = u64::from_be_bytes(ts);
        let payload = &data[MIN_TIMESTAMPED_LEN..];

        let signal = match kind {
            SignalingType::CallRequest | SignalingType::VideoCallRequest => {
                let key = parse_key(payload)?;
                let call_id = parse_call_id(&payload[SESSION_KEY_LEN + SALT_LEN..])?;
                let media_type = if kind == SignalingType::VideoCallRequest {
                    CallMediaType::Video
                } else {
                    CallMediaType::Audio
                };
                Signal::CallRequest {
                    key,
                    call_id,
                    media_type,
                }
            }
            SignalingType::CallRinging => Signal::CallRinging {
                call_id: parse_call_id(payload)?,
            },
            SignalingType::CallAccept => Signal::CallAccept {
                call_id: parse_call_id(payload)?,
            },
            SignalingType::CallDecline => Signal::CallDecline {
                reason: parse_reason(payload, EndCallReason::Declined)?,
            },
            SignalingType::CallEnd => Signal::CallEnd {
                reason: parse_reason(payload, EndCallReason::HungUp)?,
            },
        };

        Ok(Self {
            signal,
            created_at_ms: Some(created_at_ms),
        })
    }
}

fn parse_key(payload: &[u8]) -> Result<SessionKeyMaterial, SignalingError> {
    if payload.len() < SESSION_KEY_LEN + SALT_LEN {
        return Err(SignalingError::BadKeyLength);
    }
    let mut key = [0u8; SESSION_KEY_LEN];
    let mut salt = [0u8; SALT_LEN];
    key.copy_from_slice(&payload[..SESSION_KEY_LEN]);
    salt.copy_from_slice(&payload[SESSION_KEY_LEN..SESSION_KEY_LEN + SALT_LEN]);
    let material = SessionKeyMaterial::from_parts(key, salt);
    zeroize::Zeroize::zeroize(&mut key);
    Ok(material)
}

fn parse_call_id(bytes: &[u8]) -> Result<Option<CallId>, SignalingError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    let id = std::str::from_utf8(bytes).map_err(|_| SignalingError::InvalidUtf8)?;
    Ok(Some(CallId::new(id)))
}

/// Unknown reasons fall back to `default` so newer peers can add reasons.
fn parse_reason(bytes: &[u8], default: EndCallReason) -> Result<EndCallReason, SignalingError> {
    let text = std::str::from_utf8(bytes).map_err(|_| SignalingError::InvalidUtf8)?;
    Ok(EndCallReason::from_wire(text).unwrap_or(default))
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Reject packets that are too old or dated too far ahead.
///
/// Untimestamped packets pass; [`SignalingPacket::decode`] only produces them
/// for legacy call requests.
pub fn check_freshness(
    created_at_ms: Option<u64>,
    now_ms: u64,
    config: &SignalingConfig,
) -> Result<(), SignalingError> {
    let Some(created) = created_at_ms else {
        return Ok(());
    };
    if created > now_ms {
        let ahead_ms = created - now_ms;
        if ahead_ms > config.max_future_skew.as_millis() as u64 {
            return Err(SignalingError::FutureDated { ahead_ms });
        }
        return Ok(());
    }
    let age_ms = now_ms - created;
    if age_ms > config.max_age.as_millis() as u64 {
        return Err(SignalingError::Stale { age_ms });
    }
    Ok(())
}

/// Connection timing of the current session, as seen by the end-signal guard.
#[derive(Debug, Clone, Copy)]
pub struct ConnectedAt {
    /// Wall clock at connect, ms since epoch.
    pub wall_ms: u64,
    /// Time spent connected so far.
    pub elapsed: Duration,
}

/// Whether a call-end or decline dated `created_at_ms` may end the session.
pub fn end_signal_applies(
    created_at_ms: u64,
    session_started_ms: u64,
    connected: Option<ConnectedAt>,
    config: &SignalingConfig,
) -> bool {
    // Delayed retries from an earlier attempt.
    if created_at_ms < session_started_ms {
        return false;
    }
    match connected {
        Some(c) if c.elapsed < config.end_grace => created_at_ms >= c.wall_ms,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(call_id: Option<&str>) -> Signal {
        Signal::CallRequest {
            key: SessionKeyMaterial::from_parts([9u8; 32], [1, 2, 3, 4]),
            call_id: call_id.map(CallId::new),
            media_type: CallMediaType::Audio,
        }
    }

    #[test]
    fn test_request_layout() {
        let packet = SignalingPacket::new(request(Some("ABC")), 0x0102_0304_0506_0708);
        let bytes = packet.encode();
        assert_eq!(bytes[0], SignalingType::CallRequest as u8);
        assert_eq!(&bytes[1..9], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[9..41], &[9u8; 32]);
        assert_eq!(&bytes[41..45], &[1, 2, 3, 4]);
        assert_eq!(&bytes[45..], b"ABC");

        let decoded = SignalingPacket::decode(&bytes).unwrap();
        assert_eq!(decoded.created_at_ms, Some(0x0102_0304_0506_0708));
        match decoded.signal {
            Signal::CallRequest {
                key,
                call_id,
                media_type,
            } => {
                assert_eq!(key.key(), &[9u8; 32]);
                assert_eq!(key.salt(), &[1, 2, 3, 4]);
                assert_eq!(call_id, Some(CallId::new("ABC")));
                assert_eq!(media_type, CallMediaType::Audio);
            }
            other => panic!("unexpected signal {:?}", other),
        }
    }

    #[test]
    fn test_legacy_request_accepted() {
        let mut bytes = vec![SignalingType::CallRequest as u8];
        bytes.extend_from_slice(&[5u8; 32]);
        bytes.extend_from_slice(&[6u8; 4]);
        assert_eq!(bytes.len(), LEGACY_REQUEST_LEN);

        let decoded = SignalingPacket::decode(&bytes).unwrap();
        assert_eq!(decoded.created_at_ms, None);
        assert!(matches!(
            decoded.signal,
            Signal::CallRequest { call_id: None, .. }
        ));
        assert!(check_freshness(decoded.created_at_ms, now_ms(), &SignalingConfig::default()).is_ok());
    }

    #[test]
    fn test_end_without_timestamp_rejected() {
        let bytes = [SignalingType::CallEnd as u8, b'h', b'u'];
        assert_eq!(
            SignalingPacket::decode(&bytes).unwrap_err(),
            SignalingError::MissingTimestamp(SignalingType::CallEnd)
        );
        assert_eq!(
            SignalingPacket::decode(&[SignalingType::CallDecline as u8]).unwrap_err(),
            SignalingError::MissingTimestamp(SignalingType::CallDecline)
        );
        assert_eq!(
            SignalingPacket::decode(&[SignalingType::CallRequest as u8, 0]).unwrap_err(),
            SignalingError::TooShort(2)
        );
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            SignalingPacket::decode(&[]).unwrap_err(),
            SignalingError::TooShort(0)
        );
        assert_eq!(
            SignalingPacket::decode(&[0x7f; 12]).unwrap_err(),
            SignalingError::UnknownType(0x7f)
        );

        let mut short_key = vec![SignalingType::CallRequest as u8];
        short_key.extend_from_slice(&[0u8; 8]);
        short_key.extend_from_slice(&[1u8; 20]);
        assert_eq!(
            SignalingPacket::decode(&short_key).unwrap_err(),
            SignalingError::BadKeyLength
        );

        let mut bad_reason = vec![SignalingType::CallEnd as u8];
        bad_reason.extend_from_slice(&[0u8; 8]);
        bad_reason.extend_from_slice(&[0xff, 0xfe]);
        assert_eq!(
            SignalingPacket::decode(&bad_reason).unwrap_err(),
            SignalingError::InvalidUtf8
        );
    }

    #[test]
    fn test_end_reason_parsing() {
        let packet = SignalingPacket::new(
            Signal::CallEnd {
                reason: EndCallReason::ConnectionLost,
            },
            1,
        );
        let decoded = SignalingPacket::decode(&packet.encode()).unwrap();
        assert!(matches!(
            decoded.signal,
            Signal::CallEnd {
                reason: EndCallReason::ConnectionLost
            }
        ));

        let mut unknown = vec![SignalingType::CallEnd as u8];
        unknown.extend_from_slice(&1u64.to_be_bytes());
        unknown.extend_from_slice(b"went-fishing");
        let decoded = SignalingPacket::decode(&unknown).unwrap();
        assert!(matches!(
            decoded.signal,
            Signal::CallEnd {
                reason: EndCallReason::HungUp
            }
        ));
    }

    #[test]
    fn test_video_request_type() {
        let packet = SignalingPacket::new(
            Signal::CallRequest {
                key: SessionKeyMaterial::generate(),
                call_id: None,
                media_type: CallMediaType::Video,
            },
            42,
        );
        let bytes = packet.encode();
        assert_eq!(bytes[0], SignalingType::VideoCallRequest as u8);
        let decoded = SignalingPacket::decode(&bytes).unwrap();
        assert!(matches!(
            decoded.signal,
            Signal::CallRequest {
                media_type: CallMediaType::Video,
                ..
            }
        ));
    }

    #[test]
    fn test_stale_request_rejected() {
        let config = SignalingConfig::default();
        let now = 1_700_000_000_000;
        assert_eq!(
            check_freshness(Some(now - 40_000), now, &config),
            Err(SignalingError::Stale { age_ms: 40_000 })
        );
        assert!(check_freshness(Some(now - 29_000), now, &config).is_ok());
    }

    #[test]
    fn test_future_skew() {
        let config = SignalingConfig::default();
        let now = 1_700_000_000_000;
        assert!(check_freshness(Some(now + 4_000), now, &config).is_ok());
        assert_eq!(
            check_freshness(Some(now + 6_000), now, &config),
            Err(SignalingError::FutureDated { ahead_ms: 6_000 })
        );
    }

    #[test]
    fn test_end_signal_guards() {
        let config = SignalingConfig::default();
        let started = 10_000;
        let connected = ConnectedAt {
            wall_ms: 12_000,
            elapsed: Duration::from_millis(500),
        };

        // Predates the session.
        assert!(!end_signal_applies(9_000, started, None, &config));
        assert!(end_signal_applies(10_500, started, None, &config));

        // Inside the grace window, only ends dated after connect count.
        assert!(!end_signal_applies(11_000, started, Some(connected), &config));
        assert!(end_signal_applies(12_001, started, Some(connected), &config));

        let settled = ConnectedAt {
            elapsed: Duration::from_secs(4),
            ..connected
        };
        assert!(end_signal_applies(11_000, started, Some(settled), &config));
    }
}
