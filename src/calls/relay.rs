//! Relay delivery.
//!
//! Packets to a peer go through the relay server, preferably over a
//! persistent socket. When the socket is down or slow, sends fall back to the
//! relay's request/response mailbox. During a call both the socket receive
//! loop and the mailbox poll loop run at once; whichever delivers a packet
//! first wins and the media pipeline drops the duplicate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use super::transport::{InboundHandler, PeerTransport, TransportError};
use super::types::PeerRef;

/// Largest datagram accepted from the relay.
const MAX_DATAGRAM: usize = 2048;

/// Configuration for relay delivery.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Budget for a send over the persistent socket before falling back.
    pub socket_send_timeout: Duration,
    /// Budget for a mailbox post or poll.
    pub mailbox_timeout: Duration,
    /// Interval between mailbox polls during a call.
    pub poll_interval: Duration,
    /// Pause after a socket receive error before retrying.
    pub receive_backoff: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            socket_send_timeout: Duration::from_millis(300),
            mailbox_timeout: Duration::from_millis(1500),
            poll_interval: Duration::from_millis(250),
            receive_backoff: Duration::from_millis(500),
        }
    }
}

/// Persistent connection to the relay server.
#[async_trait]
pub trait RelaySocket: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn send(&self, peer: &PeerRef, bytes: &[u8]) -> Result<(), TransportError>;

    /// Wait for the next packet relayed to us.
    async fn recv(&self) -> Result<(PeerRef, Vec<u8>), TransportError>;

    async fn reconnect(&self) -> Result<(), TransportError>;
}

/// Request/response mailbox on the relay server.
#[async_trait]
pub trait RelayMailbox: Send + Sync {
    async fn post(&self, peer: &PeerRef, bytes: &[u8]) -> Result<(), TransportError>;

    /// Fetch and clear everything queued for us.
    async fn poll(&self) -> Result<Vec<(PeerRef, Vec<u8>)>, TransportError>;
}

/// [`PeerTransport`] over a relay socket with mailbox fallback.
pub struct RelayDelivery {
    socket: Arc<dyn RelaySocket>,
    mailbox: Option<Arc<dyn RelayMailbox>>,
    config: RelayConfig,
}

impl RelayDelivery {
    pub fn new(socket: Arc<dyn RelaySocket>, config: RelayConfig) -> Self {
        Self {
            socket,
            mailbox: None,
            config,
        }
    }

    pub fn with_mailbox(mut self, mailbox: Arc<dyn RelayMailbox>) -> Self {
        self.mailbox = Some(mailbox);
        self
    }

    async fn post_to_mailbox(&self, peer: &PeerRef, bytes: &[u8]) -> Result<(), TransportError> {
        let Some(mailbox) = &self.mailbox else {
            return Err(TransportError::NotConnected);
        };
        match tokio::time::timeout(self.config.mailbox_timeout, mailbox.post(peer, bytes)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

#[async_trait]
impl PeerTransport for RelayDelivery {
    async fn send(&self, peer: &PeerRef, bytes: &[u8]) -> Result<(), TransportError> {
        if self.socket.is_connected() {
            match tokio::time::timeout(
                self.config.socket_send_timeout,
                self.socket.send(peer, bytes),
            )
            .await
            {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => debug!("Relay socket send failed, using mailbox: {}", e),
                Err(_) => debug!("Relay socket send timed out, using mailbox"),
            }
        }
        self.post_to_mailbox(peer, bytes).await
    }

    async fn is_reachable(&self, _peer: &PeerRef) -> bool {
        self.socket.is_connected() || self.mailbox.is_some()
    }

    async fn reconnect(&self, _peer: &PeerRef) -> Result<(), TransportError> {
        self.socket.reconnect().await
    }

    fn start_call_tasks(
        &self,
        peer: &PeerRef,
        inbound: Arc<dyn InboundHandler>,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::with_capacity(2);

        let socket = self.socket.clone();
        let handler = inbound.clone();
        let backoff = self.config.receive_backoff;
        tasks.push(tokio::spawn(async move {
            loop {
                match socket.recv().await {
                    Ok((from, bytes)) => handler.on_receive(&from, bytes).await,
                    Err(e) => {
                        debug!("Relay socket receive failed: {}", e);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }));

        if let Some(mailbox) = self.mailbox.clone() {
            let interval = self.config.poll_interval;
            let timeout = self.config.mailbox_timeout;
            let peer = peer.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    match tokio::time::timeout(timeout, mailbox.poll()).await {
                        Ok(Ok(batch)) => {
                            for (from, bytes) in batch {
                                inbound.on_receive(&from, bytes).await;
                            }
                        }
                        Ok(Err(e)) => debug!("Mailbox poll during call with {} failed: {}", peer, e),
                        Err(_) => debug!("Mailbox poll during call with {} timed out", peer),
                    }
                }
            }));
        }

        tasks
    }
}

/// Relay socket over UDP.
///
/// Datagrams are framed as `[peer-len u8][peer utf8][payload]` in both
/// directions; the relay rewrites the peer field to the sender on delivery.
pub struct UdpRelaySocket {
    socket: UdpSocket,
    relay_addr: SocketAddr,
    connected: AtomicBool,
}

impl UdpRelaySocket {
    pub async fn connect(relay_addr: SocketAddr) -> Result<Self, TransportError> {
        let bind_addr: SocketAddr = if relay_addr.is_ipv6() {
            "[::]:0".parse().map_err(|_| TransportError::NotConnected)?
        } else {
            "0.0.0.0:0".parse().map_err(|_| TransportError::NotConnected)?
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(relay_addr).await?;
        info!(
            "Relay socket {} -> {}",
            socket.local_addr()?,
            relay_addr
        );
        Ok(Self {
            socket,
            relay_addr,
            connected: AtomicBool::new(true),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }
}

fn frame(peer: &PeerRef, bytes: &[u8]) -> Result<Vec<u8>, TransportError> {
    let name = peer.as_str().as_bytes();
    let len = u8::try_from(name.len()).map_err(|_| TransportError::UnknownPeer(peer.clone()))?;
    let mut out = Vec::with_capacity(1 + name.len() + bytes.len());
    out.push(len);
    out.extend_from_slice(name);
    out.extend_from_slice(bytes);
    Ok(out)
}

fn unframe(datagram: &[u8]) -> Option<(PeerRef, Vec<u8>)> {
    let (&len, rest) = datagram.split_first()?;
    let len = len as usize;
    if rest.len() < len {
        return None;
    }
    let peer = std::str::from_utf8(&rest[..len]).ok()?;
    Some((PeerRef::new(peer), rest[len..].to_vec()))
}

#[async_trait]
impl RelaySocket for UdpRelaySocket {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn send(&self, peer: &PeerRef, bytes: &[u8]) -> Result<(), TransportError> {
        let datagram = frame(peer, bytes)?;
        match self.socket.send(&datagram).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.connected.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    async fn recv(&self) -> Result<(PeerRef, Vec<u8>), TransportError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let len = self.socket.recv(&mut buf).await?;
            match unframe(&buf[..len]) {
                Some(packet) => return Ok(packet),
                None => debug!("Dropping malformed relay datagram ({} bytes)", len),
            }
        }
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        match self.socket.connect(self.relay_addr).await {
            Ok(()) => {
                self.connected.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                warn!("Relay reconnect to {} failed: {}", self.relay_addr, e);
                Err(e.into())
            }
        }
    }
}
