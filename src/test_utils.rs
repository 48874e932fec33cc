//! In-memory transports for tests and the demo binary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use log::trace;
use rand::Rng;

use crate::calls::media::packet;
use crate::calls::{InboundHandler, PeerRef, PeerTransport, TransportError};

/// A shared medium connecting any number of named endpoints.
///
/// Delivery is asynchronous (each packet is handed to the receiver on its own
/// task), so packets may arrive out of order. Media packets can be dropped at
/// random; signaling is never dropped unless the network is partitioned.
#[derive(Default)]
pub struct LoopbackNetwork {
    peers: Mutex<HashMap<PeerRef, Weak<dyn InboundHandler>>>,
    media_loss: Mutex<f32>,
    partitioned: AtomicBool,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route packets addressed to `peer` into `handler`.
    pub fn register(&self, peer: PeerRef, handler: &Arc<dyn InboundHandler>) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(peer, Arc::downgrade(handler));
        }
    }

    /// A transport that sends as `local`.
    pub fn endpoint(self: &Arc<Self>, local: PeerRef) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            network: self.clone(),
            local,
        })
    }

    /// Fraction of media packets to drop, 0.0 to 1.0.
    pub fn set_media_loss(&self, ratio: f32) {
        if let Ok(mut loss) = self.media_loss.lock() {
            *loss = ratio.clamp(0.0, 1.0);
        }
    }

    /// Drop everything, signaling included.
    pub fn set_partitioned(&self, partitioned: bool) {
        self.partitioned.store(partitioned, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn should_drop(&self, bytes: &[u8]) -> bool {
        if self.partitioned.load(Ordering::SeqCst) {
            return true;
        }
        if packet::is_signaling(bytes) {
            return false;
        }
        let loss = self.media_loss.lock().map(|l| *l).unwrap_or(0.0);
        loss > 0.0 && rand::rng().random::<f32>() < loss
    }

    fn handler(&self, peer: &PeerRef) -> Option<Arc<dyn InboundHandler>> {
        self.peers.lock().ok()?.get(peer)?.upgrade()
    }
}

/// One endpoint on a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    local: PeerRef,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn send(&self, peer: &PeerRef, bytes: &[u8]) -> Result<(), TransportError> {
        let handler = self
            .network
            .handler(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))?;

        // Lost packets still look sent, as on a datagram network.
        if self.network.should_drop(bytes) {
            self.network.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("Loopback dropped {} bytes {} -> {}", bytes.len(), self.local, peer);
            return Ok(());
        }

        self.network.delivered.fetch_add(1, Ordering::Relaxed);
        let from = self.local.clone();
        let bytes = bytes.to_vec();
        tokio::spawn(async move {
            handler.on_receive(&from, bytes).await;
        });
        Ok(())
    }

    async fn is_reachable(&self, peer: &PeerRef) -> bool {
        !self.network.partitioned.load(Ordering::SeqCst) && self.network.handler(peer).is_some()
    }
}

/// Transport that records everything sent through it.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(PeerRef, Vec<u8>)>>,
    failing: AtomicBool,
    reconnects: AtomicU32,
}

impl RecordingTransport {
    /// A transport whose sends all fail.
    pub fn failing() -> Self {
        let transport = Self::default();
        transport.set_failing(true);
        transport
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(PeerRef, Vec<u8>)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_to(&self, peer: &PeerRef) -> Vec<Vec<u8>> {
        self.sent()
            .into_iter()
            .filter(|(to, _)| to == peer)
            .map(|(_, bytes)| bytes)
            .collect()
    }

    /// Signaling envelopes sent to `peer`.
    pub fn signals_to(&self, peer: &PeerRef) -> Vec<Vec<u8>> {
        self.sent_to(peer)
            .into_iter()
            .filter(|bytes| packet::is_signaling(bytes))
            .collect()
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.clear();
        }
    }
}

#[async_trait]
impl PeerTransport for RecordingTransport {
    async fn send(&self, peer: &PeerRef, bytes: &[u8]) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((peer.clone(), bytes.to_vec()));
        }
        Ok(())
    }

    async fn reconnect(&self, _peer: &PeerRef) -> Result<(), TransportError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
