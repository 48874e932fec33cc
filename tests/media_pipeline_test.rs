//! Integration tests for the media pipeline.
//!
//! These tests verify the complete path a call's audio takes:
//! - capture, codec and encryption on one side
//! - authentication, replay rejection and reordering on the other
//! - FEC recovery and concealment of lost packets
//! - audio flowing between two connected managers

use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use call_engine::calls::media::{
    IngestOutcome, MediaPacket, MediaSession, MediaSessionConfig, PacketType,
};
use call_engine::calls::{
    CallEvent, CallManager, CallManagerConfig, CallMediaType, CallRole, InboundHandler, PeerRef,
    SessionKeyMaterial, TransportRoutes, X25519KeyAgreement,
};
use call_engine::test_utils::LoopbackNetwork;

const FRAME: usize = 320;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn session_pair() -> (MediaSession, MediaSession) {
    let key = SessionKeyMaterial::generate();
    let caller = MediaSession::new(MediaSessionConfig::default(), &key, CallRole::Initiator)
        .expect("caller session");
    let callee = MediaSession::new(MediaSessionConfig::default(), &key, CallRole::Responder)
        .expect("callee session");
    (caller, callee)
}

/// A 440 Hz tone at 16 kHz, `frames` frames long.
fn tone(frames: usize) -> Vec<i16> {
    let step = TAU * 440.0 / 16_000.0;
    (0..frames * FRAME)
        .map(|i| ((i as f32 * step).sin() * 8_000.0) as i16)
        .collect()
}

fn peak(pcm: &[i16]) -> i16 {
    pcm.iter().map(|s| s.saturating_abs()).max().unwrap_or(0)
}

fn packet_kind(bytes: &[u8]) -> (PacketType, u64) {
    let packet = MediaPacket::parse(bytes).expect("media packet");
    (packet.header.packet_type, packet.header.sequence)
}

#[test]
fn test_clean_delivery_plays_every_frame() {
    let (caller, callee) = session_pair();
    let packets = caller.process_capture(&tone(8)).expect("capture");

    let audio = packets
        .iter()
        .filter(|p| packet_kind(p).0 == PacketType::Audio)
        .count();
    let redundancy = packets
        .iter()
        .filter(|p| packet_kind(p).0 == PacketType::FecRedundancy)
        .count();
    assert_eq!(audio, 8);
    assert_eq!(redundancy, 2, "one redundancy packet per group of four");

    for packet in &packets {
        assert_ne!(callee.ingest(packet), IngestOutcome::Dropped);
    }
    for _ in 0..8 {
        let frame = callee.next_playout_frame();
        assert_eq!(frame.len(), FRAME);
        assert!(peak(&frame) > 1_000, "tone should survive the codec");
    }

    let stats = callee.stats();
    assert_eq!(stats.packets_received, 10);
    assert_eq!(stats.decrypt_failures, 0);
    assert_eq!(stats.frames_concealed, 0);
    assert_eq!(stats.jitter.packets_played, 8);
}

#[test]
fn test_reordered_group_with_one_loss_is_recovered() {
    let (caller, callee) = session_pair();
    let packets = caller.process_capture(&tone(4)).expect("capture");
    assert_eq!(packets.len(), 5);

    // Redundancy first, audio backwards, sequence 2 lost.
    let mut arrival: Vec<&Vec<u8>> = packets
        .iter()
        .filter(|p| packet_kind(p) != (PacketType::Audio, 2))
        .collect();
    arrival.reverse();
    for packet in arrival {
        callee.ingest(packet);
    }

    for _ in 0..4 {
        let frame = callee.next_playout_frame();
        assert!(peak(&frame) > 1_000);
    }
    let stats = callee.stats();
    assert_eq!(stats.fec_recovered, 1);
    assert_eq!(stats.frames_concealed, 0);
    // Rebuilt at playout time: counted as recovered, not as skipped.
    assert_eq!(stats.jitter.packets_recovered, 1);
    assert_eq!(stats.jitter.packets_skipped, 0);
}

#[test]
fn test_unrecoverable_loss_is_concealed() {
    let (caller, callee) = session_pair();
    let packets = caller.process_capture(&tone(4)).expect("capture");

    // Two losses in one group defeat single-parity FEC.
    for packet in &packets {
        let kind = packet_kind(packet);
        if kind == (PacketType::Audio, 2) || kind == (PacketType::Audio, 3) {
            continue;
        }
        callee.ingest(packet);
    }

    let frames: Vec<Vec<i16>> = (0..4).map(|_| callee.next_playout_frame()).collect();
    assert!(frames.iter().all(|f| f.len() == FRAME));
    assert!(peak(&frames[0]) > 1_000);
    // Playout holds at the gap until later audio pushes it forward.
    let stats = callee.stats();
    assert_eq!(stats.frames_concealed, 3);
    assert_eq!(stats.fec_recovered, 0);

    for packet in caller.process_capture(&tone(4)).expect("capture") {
        callee.ingest(&packet);
    }
    assert!(peak(&callee.next_playout_frame()) > 1_000);
    assert_eq!(callee.stats().jitter.packets_skipped, 2);
}

#[test]
fn test_tampered_and_replayed_packets_are_dropped() {
    let (caller, callee) = session_pair();
    let packets = caller.process_capture(&tone(1)).expect("capture");
    let original = &packets[0];

    let mut tampered = original.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    assert_eq!(callee.ingest(&tampered), IngestOutcome::Dropped);

    let mut relabelled = original.clone();
    relabelled[8] ^= 0x01;
    assert_eq!(
        callee.ingest(&relabelled),
        IngestOutcome::Dropped,
        "header is authenticated"
    );

    assert_eq!(
        callee.ingest(original),
        IngestOutcome::Audio { sequence: 1 }
    );
    assert_eq!(callee.ingest(original), IngestOutcome::Dropped);

    let stats = callee.stats();
    assert_eq!(stats.decrypt_failures, 3);
    assert_eq!(stats.packets_received, 1);
}

#[test]
fn test_own_packets_do_not_open_as_peer_packets() {
    let (caller, _callee) = session_pair();
    let packets = caller.process_capture(&tone(1)).expect("capture");
    assert_eq!(caller.ingest(&packets[0]), IngestOutcome::Dropped);
}

#[test]
fn test_other_call_key_is_rejected() {
    let (caller, _) = session_pair();
    let (_, stranger) = session_pair();
    let packets = caller.process_capture(&tone(1)).expect("capture");
    assert_eq!(stranger.ingest(&packets[0]), IngestOutcome::Dropped);
    assert_eq!(stranger.stats().decrypt_failures, 1);
}

#[test]
fn test_keepalive_measures_round_trip() {
    let (caller, callee) = session_pair();
    let ping = caller.keepalive_packet().expect("ping");
    let reply = match callee.ingest(&ping) {
        IngestOutcome::Ping { reply } => reply,
        other => panic!("expected ping, got {other:?}"),
    };
    assert!(matches!(caller.ingest(&reply), IngestOutcome::Pong { .. }));
}

#[test]
fn test_video_frames_are_queued_for_the_application() {
    let (caller, callee) = session_pair();
    let packet = caller.send_video(b"keyframe").expect("video");
    assert_eq!(callee.ingest(&packet), IngestOutcome::Video);
    assert_eq!(callee.take_video_frames(), vec![b"keyframe".to_vec()]);
    assert!(callee.take_video_frames().is_empty());
}

#[test]
fn test_closed_session_stops_sending() {
    let (caller, _) = session_pair();
    caller.close();
    assert!(!caller.is_open());
    assert!(caller.process_capture(&tone(1)).is_err());
}

#[tokio::test]
async fn test_audio_flows_between_connected_managers() {
    init_logging();
    let alice_id = PeerRef::from("alice");
    let bob_id = PeerRef::from("bob");
    let network = LoopbackNetwork::new();

    let alice_keys = Arc::new(X25519KeyAgreement::generate());
    let bob_keys = Arc::new(X25519KeyAgreement::generate());
    alice_keys
        .register_peer(bob_id.clone(), &bob_keys.public_key())
        .expect("register bob");
    bob_keys
        .register_peer(alice_id.clone(), &alice_keys.public_key())
        .expect("register alice");

    let alice = CallManager::new(
        CallManagerConfig::default(),
        TransportRoutes::relay_only(network.endpoint(alice_id.clone())),
        alice_keys,
    );
    let bob = CallManager::new(
        CallManagerConfig::default(),
        TransportRoutes::relay_only(network.endpoint(bob_id.clone())),
        bob_keys,
    );
    let alice_inbound: Arc<dyn InboundHandler> = alice.clone();
    let bob_inbound: Arc<dyn InboundHandler> = bob.clone();
    network.register(alice_id.clone(), &alice_inbound);
    network.register(bob_id.clone(), &bob_inbound);

    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    alice
        .start_call(bob_id.clone(), CallMediaType::Audio)
        .await
        .expect("start call");
    tokio::time::timeout(Duration::from_secs(5), async {
        while !matches!(bob_events.recv().await, Ok(CallEvent::IncomingCall { .. })) {}
    })
    .await
    .expect("bob rings");
    assert!(alice.capture_audio(&tone(1)).is_err(), "no media before connect");

    bob.accept_call().await.expect("accept");
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(CallEvent::StateChanged { state, .. }) = alice_events.recv().await
                && state.is_in_call()
            {
                break;
            }
        }
    })
    .await
    .expect("alice connects");

    let sent = alice.capture_audio(&tone(20)).expect("capture");
    assert_eq!(sent, 25, "twenty audio packets and five redundancy packets");

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let received = bob.media_stats().map(|s| s.packets_received).unwrap_or(0);
            if received >= 25 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bob receives all packets");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let played: Vec<Vec<i16>> = (0..20).filter_map(|_| bob.playout_audio()).collect();
    assert_eq!(played.len(), 20);
    assert!(played.iter().all(|frame| peak(frame) > 1_000));

    let stats = bob.media_stats().expect("bob in call");
    assert_eq!(stats.decrypt_failures, 0);
    assert_eq!(stats.frames_concealed, 0);

    alice.end_call().await.expect("hang up");
    tokio::time::timeout(Duration::from_secs(5), async {
        while !matches!(bob_events.recv().await, Ok(CallEvent::CallEnded { .. })) {}
    })
    .await
    .expect("bob sees the hang-up");
    assert!(bob.playout_audio().is_none(), "no playout after the call");
}
