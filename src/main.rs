use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use call_engine::calls::{
    CallEvent, CallManager, CallManagerConfig, CallMediaType, InboundHandler, PeerRef,
    TransportRoutes, X25519KeyAgreement,
};
use call_engine::test_utils::LoopbackNetwork;
use chrono::Local;
use clap::Parser;
use log::{info, warn};
use tokio::sync::broadcast;

// Two engines on an in-memory network: Alice calls Bob, streams a tone for a
// few seconds through a lossy link, prints what Bob's pipeline saw, hangs up.
//
// Usage:
//   cargo run                                 # 3s call, 5% media loss
//   cargo run -- --seconds 10 --loss 0.15     # longer call, worse network
//   RUST_LOG=debug cargo run                  # signaling and guard decisions

#[derive(Parser, Debug)]
#[command(name = "call-engine-demo", about = "Loopback call between two engines")]
struct Args {
    /// Length of the audio stream in seconds.
    #[arg(short, long, default_value_t = 3)]
    seconds: u64,

    /// Fraction of media packets lost in transit.
    #[arg(short, long, default_value_t = 0.05)]
    loss: f32,

    /// Frequency of the test tone in Hz.
    #[arg(long, default_value_t = 440.0)]
    tone_hz: f32,
}

const SAMPLE_RATE: f32 = 16_000.0;
const FRAME_SAMPLES: usize = 320;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let alice = PeerRef::from("alice");
    let bob = PeerRef::from("bob");

    let network = LoopbackNetwork::new();
    network.set_media_loss(args.loss);

    let alice_keys = Arc::new(X25519KeyAgreement::generate());
    let bob_keys = Arc::new(X25519KeyAgreement::generate());
    alice_keys.register_peer(bob.clone(), &bob_keys.public_key())?;
    bob_keys.register_peer(alice.clone(), &alice_keys.public_key())?;

    let alice_manager = CallManager::new(
        CallManagerConfig::default(),
        TransportRoutes::relay_only(network.endpoint(alice.clone())),
        alice_keys,
    );
    let bob_manager = CallManager::new(
        CallManagerConfig::default(),
        TransportRoutes::relay_only(network.endpoint(bob.clone())),
        bob_keys,
    );
    let alice_inbound: Arc<dyn InboundHandler> = alice_manager.clone();
    let bob_inbound: Arc<dyn InboundHandler> = bob_manager.clone();
    network.register(alice.clone(), &alice_inbound);
    network.register(bob.clone(), &bob_inbound);

    let mut alice_events = alice_manager.subscribe();
    let mut bob_events = bob_manager.subscribe();

    let call_id = alice_manager
        .start_call(bob.clone(), CallMediaType::Audio)
        .await?;
    info!("Alice placed call {}", call_id);

    wait_for(&mut bob_events, "incoming call", |e| {
        matches!(e, CallEvent::IncomingCall { .. })
    })
    .await?;
    bob_manager.accept_call().await?;
    wait_for(&mut alice_events, "call connected", |e| {
        matches!(e, CallEvent::StateChanged { state, .. } if state.is_in_call())
    })
    .await?;

    let frames = args.seconds * 50;
    let mut ticker = tokio::time::interval(Duration::from_millis(20));
    let mut phase = 0.0f32;
    let step = TAU * args.tone_hz / SAMPLE_RATE;
    let mut played = 0usize;
    let mut peak = 0i16;

    for _ in 0..frames {
        ticker.tick().await;
        let pcm: Vec<i16> = (0..FRAME_SAMPLES)
            .map(|_| {
                let sample = (phase.sin() * 8_000.0) as i16;
                phase = (phase + step) % TAU;
                sample
            })
            .collect();
        alice_manager.capture_audio(&pcm)?;

        if let Some(out) = bob_manager.playout_audio() {
            played += out.len();
            peak = peak.max(out.iter().map(|s| s.saturating_abs()).max().unwrap_or(0));
        }
    }

    match bob_manager.media_stats() {
        Some(stats) => {
            info!(
                "Bob received {} packets, {} FEC-recovered, {} concealed, {} decrypt failures",
                stats.packets_received,
                stats.fec_recovered,
                stats.frames_concealed,
                stats.decrypt_failures
            );
            info!(
                "Jitter buffer: {} played, {} late, {} skipped, {} underruns",
                stats.jitter.packets_played,
                stats.jitter.packets_late,
                stats.jitter.packets_skipped,
                stats.jitter.underruns
            );
        }
        None => warn!("Bob has no media session"),
    }
    if let Some(stats) = alice_manager.media_stats() {
        info!(
            "Alice sent {} packets at {:?}, RTT {} ms",
            stats.packets_sent, stats.quality, stats.average_rtt_ms
        );
    }
    info!(
        "Bob played {} samples (peak {}); network delivered {} and dropped {}",
        played,
        peak,
        network.delivered(),
        network.dropped()
    );

    alice_manager.end_call().await?;
    wait_for(&mut bob_events, "hang-up", |e| {
        matches!(e, CallEvent::CallEnded { .. })
    })
    .await?;
    info!("Call finished");
    Ok(())
}

async fn wait_for(
    events: &mut broadcast::Receiver<CallEvent>,
    what: &str,
    mut pred: impl FnMut(&CallEvent) -> bool,
) -> anyhow::Result<CallEvent> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) if pred(&event) => return Ok(event),
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                warn!("Missed {} events while waiting for {}", n, what);
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => bail!("event channel closed"),
            Err(_) => bail!("timed out waiting for {}", what),
        }
    }
}
