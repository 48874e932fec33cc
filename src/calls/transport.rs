//! Peer transport collaborators.
//!
//! The engine only sees opaque byte blobs addressed to a [`PeerRef`]. How they
//! travel (relay server, direct mesh link) is up to the [`PeerTransport`]
//! implementation. Inbound bytes come back through an [`InboundHandler`],
//! which the call manager implements.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;

use super::types::PeerRef;

/// Errors from a peer transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport not connected")]
    NotConnected,
    #[error("Send timed out")]
    Timeout,
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerRef),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sends bytes to a peer.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(&self, peer: &PeerRef, bytes: &[u8]) -> Result<(), TransportError>;

    /// Whether the peer can currently be reached on this transport.
    async fn is_reachable(&self, _peer: &PeerRef) -> bool {
        true
    }

    /// Re-establish the link to `peer`. Used by the connection monitor.
    async fn reconnect(&self, _peer: &PeerRef) -> Result<(), TransportError> {
        Ok(())
    }

    /// Start receive tasks for the duration of a call.
    ///
    /// The call manager aborts the returned handles when the call ends.
    fn start_call_tasks(
        &self,
        _peer: &PeerRef,
        _inbound: Arc<dyn InboundHandler>,
    ) -> Vec<JoinHandle<()>> {
        Vec::new()
    }
}

/// Receives bytes from peers.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_receive(&self, from: &PeerRef, bytes: Vec<u8>);
}

/// Route chosen for a call's packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeliveryPath {
    /// Peer-to-peer link.
    Direct,
    /// Through the relay server.
    Relay,
}

/// The transports available to the call manager.
///
/// The relay is always present. A direct transport is preferred when the
/// peer is reachable on it at connect time.
#[derive(Clone)]
pub struct TransportRoutes {
    relay: Arc<dyn PeerTransport>,
    direct: Option<Arc<dyn PeerTransport>>,
}

impl TransportRoutes {
    pub fn relay_only(relay: Arc<dyn PeerTransport>) -> Self {
        Self {
            relay,
            direct: None,
        }
    }

    pub fn with_direct(relay: Arc<dyn PeerTransport>, direct: Arc<dyn PeerTransport>) -> Self {
        Self {
            relay,
            direct: Some(direct),
        }
    }

    /// Pick the best path to `peer` right now.
    pub async fn choose(&self, peer: &PeerRef) -> DeliveryPath {
        match &self.direct {
            Some(direct) if direct.is_reachable(peer).await => DeliveryPath::Direct,
            _ => DeliveryPath::Relay,
        }
    }

    pub fn get(&self, path: DeliveryPath) -> Arc<dyn PeerTransport> {
        match (path, &self.direct) {
            (DeliveryPath::Direct, Some(direct)) => direct.clone(),
            _ => self.relay.clone(),
        }
    }
}

impl std::fmt::Debug for TransportRoutes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRoutes")
            .field("direct", &self.direct.is_some())
            .finish()
    }
}
