//! Media session: the per-call send and receive pipelines.
//!
//! Send: PCM → accumulate to the current packet size → codec → seal → frame,
//! with FEC redundancy emitted after every full group.
//!
//! Receive: frame → open → FEC store → jitter buffer; playout pulls in
//! sequence order and falls back to FEC recovery and then concealment.
//!
//! All state sits behind short-held `std::sync::Mutex`es and every method is
//! synchronous, so the audio callback can drive it directly.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use log::{debug, info, trace};
use serde::Serialize;

use super::bitrate::{
    BitrateConfig, BitrateController, LatencyTracker, QualityLevel, QualitySample,
    SendLossTracker,
};
use super::codec::{AudioDecoder, AudioEncoder, CodecConfig};
use super::fec::{FecConfig, FecDecoder, FecEncoder, Redundancy};
use super::jitter::{JitterBuffer, JitterBufferConfig, JitterStats, Playout, PushOutcome};
use super::packet::{self, MediaHeader, MediaPacket, PacketType, StreamSequencer};
use super::plc::{PacketLossConcealer, PlcConfig};
use super::secure::{CryptoError, SecurePacketTransport, SecureTransportConfig};
use crate::calls::encryption::SessionKeyMaterial;
use crate::calls::types::CallRole;

const KEEPALIVE_PING: u8 = 0;
const KEEPALIVE_PONG: u8 = 1;
const KEEPALIVE_BODY_LEN: usize = 9;

/// Configuration for media session.
#[derive(Debug, Clone)]
pub struct MediaSessionConfig {
    pub codec: CodecConfig,
    pub secure: SecureTransportConfig,
    pub fec: FecConfig,
    pub jitter: JitterBufferConfig,
    pub plc: PlcConfig,
    pub bitrate: BitrateConfig,
    /// Send attempts considered for the loss ratio.
    pub loss_window: usize,
    /// Undelivered video frames kept for the decoder.
    pub max_pending_video: usize,
}

impl Default for MediaSessionConfig {
    fn default() -> Self {
        Self {
            codec: CodecConfig::default(),
            secure: SecureTransportConfig::default(),
            fec: FecConfig::default(),
            jitter: JitterBufferConfig::default(),
            plc: PlcConfig::default(),
            bitrate: BitrateConfig::default(),
            loss_window: 50,
            max_pending_video: 30,
        }
    }
}

/// Statistics for the media session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MediaSessionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub decrypt_failures: u64,
    pub fec_recovered: u64,
    pub frames_concealed: u64,
    pub last_send_counter: u64,
    pub quality: Option<QualityLevel>,
    pub average_rtt_ms: u32,
    #[serde(skip)]
    pub jitter: JitterStats,
}

/// What happened to one inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// An authenticated audio payload reached the jitter buffer.
    Audio { sequence: u64 },
    /// An audio payload was rebuilt from FEC.
    Recovered { sequence: u64 },
    /// Redundancy stored without recovering anything.
    Redundancy,
    /// A ping; the pong must be sent back to the peer.
    Ping { reply: Vec<u8> },
    /// A pong completed an RTT measurement.
    Pong { rtt_ms: u32 },
    /// A video frame was queued.
    Video,
    /// Late, duplicate, forged, malformed or unrecoverable. Treated as loss.
    Dropped,
}

struct SendPipeline {
    encoder: AudioEncoder,
    fec: FecEncoder,
    pending: Vec<i16>,
    samples_per_packet: usize,
    audio_seq: StreamSequencer,
    keepalive_seq: StreamSequencer,
    video_seq: StreamSequencer,
}

struct ReceivePipeline {
    fec: FecDecoder,
    jitter: JitterBuffer,
    decoder: AudioDecoder,
    plc: PacketLossConcealer,
}

impl ReceivePipeline {
    /// Store an obtained payload for FEC and playout.
    fn accept(&mut self, sequence: u64, payload: Vec<u8>) -> bool {
        self.fec.record(sequence, &payload);
        self.jitter.push(sequence, payload) == PushOutcome::Buffered
    }

    fn decode_or_conceal(&mut self, payload: &[u8]) -> Vec<i16> {
        match self.decoder.decode(payload) {
            Some(pcm) => {
                self.plc.on_packet(&pcm);
                pcm
            }
            None => {
                trace!("undecodable frame, concealing");
                self.plc.conceal(self.decoder.last_frame_len())
            }
        }
    }
}

struct QualityState {
    controller: BitrateController,
    send_loss: SendLossTracker,
    latency: LatencyTracker,
}

/// Per-call media engine.
pub struct MediaSession {
    config: MediaSessionConfig,
    secure: SecurePacketTransport,
    send: Mutex<SendPipeline>,
    recv: Mutex<ReceivePipeline>,
    quality: Mutex<QualityState>,
    video: Mutex<VecDeque<Vec<u8>>>,
    stats: Mutex<MediaSessionStats>,
    epoch: Instant,
}

impl MediaSession {
    pub fn new(
        config: MediaSessionConfig,
        material: &SessionKeyMaterial,
        role: CallRole,
    ) -> Result<Self, CryptoError> {
        let secure = SecurePacketTransport::new(material, role, &config.secure)?;
        let controller = BitrateController::new(config.bitrate.clone());
        let samples_per_packet = controller.samples_per_packet();

        Ok(Self {
            secure,
            send: Mutex::new(SendPipeline {
                encoder: AudioEncoder::new(config.codec.clone()),
                fec: FecEncoder::new(&config.fec),
                pending: Vec::with_capacity(samples_per_packet * 2),
                samples_per_packet,
                audio_seq: StreamSequencer::starting_at(config.jitter.initial_sequence),
                keepalive_seq: StreamSequencer::default(),
                video_seq: StreamSequencer::default(),
            }),
            recv: Mutex::new(ReceivePipeline {
                fec: FecDecoder::new(&config.fec),
                jitter: JitterBuffer::new(config.jitter.clone()),
                decoder: AudioDecoder::new(config.codec.clone()),
                plc: PacketLossConcealer::new(config.plc.clone()),
            }),
            quality: Mutex::new(QualityState {
                controller,
                send_loss: SendLossTracker::new(config.loss_window),
                latency: LatencyTracker::new(config.bitrate.window),
            }),
            video: Mutex::new(VecDeque::new()),
            stats: Mutex::new(MediaSessionStats::default()),
            epoch: Instant::now(),
            config,
        })
    }

    fn seal_packet(
        &self,
        packet_type: PacketType,
        sequence: u64,
        body: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let header = MediaHeader::new(packet_type, sequence).encode();
        let sealed = self.secure.seal(body, &header)?;
        if let Ok(mut stats) = self.stats.lock() {
            stats.packets_sent += 1;
            stats.last_send_counter = sealed.counter;
        }
        Ok(packet::assemble(&header, &sealed.bytes))
    }

    /// Feed captured PCM. Returns every packet that became ready, in send order.
    pub fn process_capture(&self, pcm: &[i16]) -> Result<Vec<Vec<u8>>, CryptoError> {
        let mut guard = self.send.lock().map_err(|_| CryptoError::NoSessionKey)?;
        let send = &mut *guard;
        send.pending.extend_from_slice(pcm);

        let frame_len = send.samples_per_packet;
        let mut packets = Vec::new();
        let mut consumed = 0;
        while send.pending.len() - consumed >= frame_len {
            let frame = &send.pending[consumed..consumed + frame_len];
            consumed += frame_len;
            let encoded = send.encoder.encode(frame);
            let sequence = send.audio_seq.next_sequence();
            packets.push(self.seal_packet(PacketType::Audio, sequence, &encoded)?);

            if let Some(redundancy) = send.fec.push(sequence, &encoded) {
                packets.push(self.seal_packet(
                    PacketType::FecRedundancy,
                    redundancy.group_start,
                    &redundancy.encode(),
                )?);
            }
        }
        send.pending.drain(..consumed);
        Ok(packets)
    }

    /// Handle one inbound media packet.
    pub fn ingest(&self, bytes: &[u8]) -> IngestOutcome {
        let Some(packet) = MediaPacket::parse(bytes) else {
            return IngestOutcome::Dropped;
        };
        let sequence = packet.header.sequence;
        let opened = self.secure.open(packet.sealed, packet.header_bytes);

        if let Ok(mut stats) = self.stats.lock() {
            if opened.is_some() {
                stats.packets_received += 1;
            } else {
                stats.decrypt_failures += 1;
            }
        }

        match (packet.header.packet_type, opened) {
            (PacketType::Audio, Some(payload)) => {
                let Ok(mut recv) = self.recv.lock() else {
                    return IngestOutcome::Dropped;
                };
                if recv.accept(sequence, payload) {
                    IngestOutcome::Audio { sequence }
                } else {
                    IngestOutcome::Dropped
                }
            }
            (PacketType::Audio, None) => self.recover(sequence),
            (PacketType::FecRedundancy, Some(payload)) => {
                let Some(redundancy) = Redundancy::decode(&payload) else {
                    return IngestOutcome::Dropped;
                };
                let missing = {
                    let Ok(mut recv) = self.recv.lock() else {
                        return IngestOutcome::Dropped;
                    };
                    let start = recv.fec.add_redundancy(redundancy);
                    recv.fec
                        .missing_member(start)
                        .filter(|&m| m >= recv.jitter.cursor())
                };
                match missing {
                    Some(missing) => match self.recover(missing) {
                        IngestOutcome::Dropped => IngestOutcome::Redundancy,
                        outcome => outcome,
                    },
                    None => IngestOutcome::Redundancy,
                }
            }
            (PacketType::Keepalive, Some(body)) => self.handle_keepalive(&body),
            (PacketType::Video, Some(frame)) => {
                let Ok(mut video) = self.video.lock() else {
                    return IngestOutcome::Dropped;
                };
                if video.len() >= self.config.max_pending_video {
                    video.pop_front();
                }
                video.push_back(frame);
                IngestOutcome::Video
            }
            _ => IngestOutcome::Dropped,
        }
    }

    fn recover(&self, sequence: u64) -> IngestOutcome {
        let Ok(mut recv) = self.recv.lock() else {
            return IngestOutcome::Dropped;
        };
        let Some(payload) = recv.fec.try_recover(sequence) else {
            return IngestOutcome::Dropped;
        };
        if !recv.accept(sequence, payload) {
            return IngestOutcome::Dropped;
        }
        drop(recv);
        if let Ok(mut stats) = self.stats.lock() {
            stats.fec_recovered += 1;
        }
        IngestOutcome::Recovered { sequence }
    }

    fn handle_keepalive(&self, body: &[u8]) -> IngestOutcome {
        if body.len() < KEEPALIVE_BODY_LEN {
            return IngestOutcome::Dropped;
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&body[1..KEEPALIVE_BODY_LEN]);
        let sent_at = u64::from_be_bytes(ts);

        match body[0] {
            KEEPALIVE_PING => match self.keepalive(KEEPALIVE_PONG, sent_at) {
                Ok(reply) => IngestOutcome::Ping { reply },
                Err(_) => IngestOutcome::Dropped,
            },
            KEEPALIVE_PONG => {
                let rtt_ms = self.elapsed_ms().saturating_sub(sent_at) as u32;
                if let Ok(mut quality) = self.quality.lock() {
                    quality.latency.record(rtt_ms);
                }
                IngestOutcome::Pong { rtt_ms }
            }
            _ => IngestOutcome::Dropped,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn keepalive(&self, kind: u8, timestamp: u64) -> Result<Vec<u8>, CryptoError> {
        let mut body = [0u8; KEEPALIVE_BODY_LEN];
        body[0] = kind;
        body[1..].copy_from_slice(&timestamp.to_be_bytes());
        let sequence = {
            let mut send = self.send.lock().map_err(|_| CryptoError::NoSessionKey)?;
            send.keepalive_seq.next_sequence()
        };
        self.seal_packet(PacketType::Keepalive, sequence, &body)
    }

    /// Build a keepalive ping stamped with the local clock.
    pub fn keepalive_packet(&self) -> Result<Vec<u8>, CryptoError> {
        self.keepalive(KEEPALIVE_PING, self.elapsed_ms())
    }

    /// Wrap an already encoded video frame.
    pub fn send_video(&self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let sequence = {
            let mut send = self.send.lock().map_err(|_| CryptoError::NoSessionKey)?;
            send.video_seq.next_sequence()
        };
        self.seal_packet(PacketType::Video, sequence, frame)
    }

    /// Drain received video frames.
    pub fn take_video_frames(&self) -> Vec<Vec<u8>> {
        self.video
            .lock()
            .map(|mut q| q.drain(..).collect())
            .unwrap_or_default()
    }

    /// Produce the next playout frame. Never fails: gaps are concealed.
    pub fn next_playout_frame(&self) -> Vec<i16> {
        let Ok(mut recv) = self.recv.lock() else {
            return Vec::new();
        };

        let pcm = match recv.jitter.pull() {
            Playout::Frame { payload, .. } => recv.decode_or_conceal(&payload),
            Playout::Underrun { expected } => match recv.fec.try_recover(expected) {
                Some(payload) => {
                    debug!("FEC filled underrun at {expected}");
                    recv.fec.record(expected, &payload);
                    recv.jitter.mark_recovered(expected);
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.fec_recovered += 1;
                    }
                    recv.decode_or_conceal(&payload)
                }
                None => {
                    let len = recv.decoder.last_frame_len();
                    recv.plc.conceal(len)
                }
            },
        };

        if let Ok(mut stats) = self.stats.lock() {
            stats.frames_concealed = recv.plc.frames_concealed();
            stats.jitter = recv.jitter.stats();
        }
        pcm
    }

    /// Record whether an outbound send reached the transport.
    pub fn record_send_result(&self, delivered: bool) {
        if let Ok(mut quality) = self.quality.lock() {
            quality.send_loss.record(delivered);
        }
    }

    /// Feed the current loss/RTT into the bitrate controller and apply any
    /// level change to the packetizer.
    pub fn evaluate_quality(&self) -> Option<QualityLevel> {
        let changed = {
            let mut quality = self.quality.lock().ok()?;
            let sample = QualitySample {
                loss_ratio: quality.send_loss.loss_ratio(),
                rtt_ms: quality.latency.average_ms(),
            };
            quality.controller.observe(sample);
            quality.controller.evaluate()?
        };
        if let Ok(mut send) = self.send.lock() {
            send.samples_per_packet = changed.samples_per_packet();
        }
        info!(
            "Media quality now {:?} ({} samples/packet)",
            changed,
            changed.samples_per_packet()
        );
        Some(changed)
    }

    pub fn quality_level(&self) -> Option<QualityLevel> {
        self.quality.lock().ok().map(|q| q.controller.level())
    }

    pub fn stats(&self) -> MediaSessionStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        if let Ok(quality) = self.quality.lock() {
            stats.quality = Some(quality.controller.level());
            stats.average_rtt_ms = quality.latency.average_ms();
        }
        stats
    }

    pub fn is_open(&self) -> bool {
        self.secure.is_open()
    }

    /// Zero the key and clear all per-call codec and buffer state.
    pub fn close(&self) {
        self.secure.close();
        if let Ok(mut send) = self.send.lock() {
            send.encoder.reset();
            send.fec.reset();
            send.pending.clear();
        }
        if let Ok(mut recv) = self.recv.lock() {
            recv.fec.reset();
            recv.jitter.reset();
            recv.decoder.reset();
            recv.plc.reset();
        }
        if let Ok(mut video) = self.video.lock() {
            video.clear();
        }
    }
}

impl std::fmt::Debug for MediaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSession")
            .field("secure", &self.secure)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (MediaSession, MediaSession) {
        let material = SessionKeyMaterial::generate();
        (
            MediaSession::new(MediaSessionConfig::default(), &material, CallRole::Initiator)
                .unwrap(),
            MediaSession::new(MediaSessionConfig::default(), &material, CallRole::Responder)
                .unwrap(),
        )
    }

    fn tone(len: usize) -> Vec<i16> {
        (0..len)
            .map(|n| ((n as f32 * 0.17).sin() * 6000.0) as i16)
            .collect()
    }

    fn packets_of(packets: &[Vec<u8>], kind: PacketType) -> Vec<Vec<u8>> {
        packets
            .iter()
            .filter(|p| p[0] == kind as u8)
            .cloned()
            .collect()
    }

    #[test]
    fn test_capture_packetizes_and_adds_redundancy() {
        let (alice, _) = pair();
        assert!(alice.process_capture(&tone(200)).unwrap().is_empty());
        let packets = alice.process_capture(&tone(1200)).unwrap();
        // 1400 samples → 4 audio frames of 320 + one redundancy.
        assert_eq!(packets_of(&packets, PacketType::Audio).len(), 4);
        assert_eq!(packets_of(&packets, PacketType::FecRedundancy).len(), 1);
        let first = MediaHeader::decode(&packets[0]).unwrap();
        assert_eq!(first.sequence, 1);
    }

    #[test]
    fn test_end_to_end_playout() {
        let (alice, bob) = pair();
        let packets = alice.process_capture(&tone(640)).unwrap();
        for p in &packets {
            assert!(matches!(bob.ingest(p), IngestOutcome::Audio { .. }));
        }
        let frame = bob.next_playout_frame();
        assert_eq!(frame.len(), 320);
        assert!(frame.iter().any(|s| s.unsigned_abs() > 1000));
        assert_eq!(bob.stats().packets_received, 2);
    }

    #[test]
    fn test_lost_packet_rebuilt_by_redundancy() {
        let (alice, bob) = pair();
        let packets = alice.process_capture(&tone(1280)).unwrap();
        let audio = packets_of(&packets, PacketType::Audio);
        let redundancy = packets_of(&packets, PacketType::FecRedundancy);

        for (i, p) in audio.iter().enumerate() {
            if i != 2 {
                bob.ingest(p);
            }
        }
        assert_eq!(
            bob.ingest(&redundancy[0]),
            IngestOutcome::Recovered { sequence: 3 }
        );
        for _ in 0..4 {
            bob.next_playout_frame();
        }
        let stats = bob.stats();
        assert_eq!(stats.fec_recovered, 1);
        assert_eq!(stats.frames_concealed, 0);
    }

    #[test]
    fn test_tampered_packet_is_dropped() {
        let (alice, bob) = pair();
        let mut packets = alice.process_capture(&tone(320)).unwrap();
        let last = packets[0].len() - 1;
        packets[0][last] ^= 0xFF;
        assert_eq!(bob.ingest(&packets[0]), IngestOutcome::Dropped);
        assert_eq!(bob.stats().decrypt_failures, 1);
        // Missing audio is concealed, never an error.
        assert_eq!(bob.next_playout_frame().len(), 320);
    }

    #[test]
    fn test_keepalive_round_trip_measures_rtt() {
        let (alice, bob) = pair();
        let ping = alice.keepalive_packet().unwrap();
        let IngestOutcome::Ping { reply } = bob.ingest(&ping) else {
            panic!("expected ping");
        };
        assert!(matches!(alice.ingest(&reply), IngestOutcome::Pong { .. }));
    }

    #[test]
    fn test_video_is_queued() {
        let (alice, bob) = pair();
        let packet = alice.send_video(b"keyframe").unwrap();
        assert_eq!(bob.ingest(&packet), IngestOutcome::Video);
        assert_eq!(bob.take_video_frames(), vec![b"keyframe".to_vec()]);
    }

    #[test]
    fn test_quality_downgrade_changes_packet_size() {
        let (alice, _) = pair();
        for _ in 0..5 {
            alice.record_send_result(false);
        }
        assert_eq!(alice.evaluate_quality(), Some(QualityLevel::Minimal));
        let packets = alice.process_capture(&tone(960)).unwrap();
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn test_closed_session_rejects_everything() {
        let (alice, bob) = pair();
        let packets = alice.process_capture(&tone(320)).unwrap();
        bob.close();
        assert!(!bob.is_open());
        assert_eq!(bob.ingest(&packets[0]), IngestOutcome::Dropped);
        alice.close();
        assert!(alice.process_capture(&tone(320)).is_err());
    }
}
