//! Media engine for encrypted calls.
//!
//! This module turns captured PCM into encrypted, loss-tolerant packets and
//! turns an unordered, lossy packet stream back into continuous audio.
//!
//! # Architecture
//!
//! - [`MediaSession`]: per-call composition of everything below
//! - [`SecurePacketTransport`]: AES-256-GCM sealing with nonce counters and replay window
//! - [`codec`]: pre-emphasis / decimation / DTX / ADPCM speech codec
//! - [`FecEncoder`], [`FecDecoder`]: XOR redundancy over groups of audio frames
//! - [`JitterBuffer`]: reordering with forward jump on large gaps
//! - [`PacketLossConcealer`]: faded replay then comfort noise
//! - [`BitrateController`]: loss/RTT → quality level with asymmetric hysteresis
//! - [`StunClient`]: best-effort public address discovery
//!
//! # Packet flow
//!
//! 1. Capture PCM is accumulated to the current samples-per-packet
//! 2. Each frame is encoded, sealed with the header as AAD, and framed
//! 3. Every full FEC group adds one sealed redundancy packet
//! 4. Inbound packets are opened; failures fall back to FEC recovery
//! 5. Payloads go through the jitter buffer to the decoder
//! 6. Underruns are filled by FEC if possible, otherwise concealed

pub mod bitrate;
pub mod codec;
pub mod fec;
pub mod jitter;
pub mod packet;
pub mod plc;
pub mod secure;
mod session;
pub mod stun;

pub use bitrate::{BitrateConfig, BitrateController, QualityLevel, QualitySample, SendLossTracker};
pub use codec::{AudioDecoder, AudioEncoder, CodecConfig};
pub use fec::{FecConfig, FecDecoder, FecEncoder, Redundancy};
pub use jitter::{JitterBuffer, JitterBufferConfig, JitterStats, Playout, PushOutcome};
pub use packet::{HEADER_LEN, MediaHeader, MediaPacket, PacketType};
pub use plc::{PacketLossConcealer, PlcConfig};
pub use secure::{CryptoError, SealedPayload, SecurePacketTransport, SecureTransportConfig};
pub use session::{IngestOutcome, MediaSession, MediaSessionConfig, MediaSessionStats};
pub use stun::{StunClient, StunConfig, StunError, StunMessage, StunMessageType};
