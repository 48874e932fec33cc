//! Call manager for orchestrating call lifecycle.
//!
//! At most one call exists at a time. The manager owns it, applies inbound
//! signals to it under the freshness and ordering guards, starts the media
//! session when the call connects, and runs the periodic call tasks
//! (keepalive, quality evaluation, connection monitor) until it ends.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::encryption::{KeyAgreement, SessionKeyMaterial};
use super::error::CallError;
use super::events::CallEvent;
use super::media::packet;
use super::media::{IngestOutcome, MediaSession, MediaSessionConfig, MediaSessionStats};
use super::monitor::{ConnectionMonitorConfig, LivenessTracker, MonitorAction};
use super::signaling::{
    ConnectedAt, Signal, SignalingConfig, SignalingPacket, check_freshness, end_signal_applies,
    now_ms,
};
use super::state::{CallInfo, CallState, CallTransition};
use super::transport::{DeliveryPath, InboundHandler, TransportError, TransportRoutes};
use super::types::{CallId, CallMediaType, EndCallReason, PeerRef};

/// Configuration for the call manager.
#[derive(Debug, Clone)]
pub struct CallManagerConfig {
    pub media: MediaSessionConfig,
    pub signaling: SignalingConfig,
    pub monitor: ConnectionMonitorConfig,
    /// Unanswered calls end with `no-answer` after this long.
    pub ring_timeout: Duration,
    /// How long an ended call stays observable before the manager is idle.
    pub reset_delay: Duration,
    /// Per-attempt budget for a signaling send.
    pub signal_send_timeout: Duration,
    /// Extra attempts after a failed signaling send.
    pub signal_retries: u32,
    /// Budget for a single media packet send.
    pub media_send_timeout: Duration,
    pub keepalive_interval: Duration,
    pub quality_interval: Duration,
    /// Capacity of the event channel.
    pub event_capacity: usize,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            media: MediaSessionConfig::default(),
            signaling: SignalingConfig::default(),
            monitor: ConnectionMonitorConfig::default(),
            ring_timeout: Duration::from_secs(45),
            reset_delay: Duration::from_secs(1),
            signal_send_timeout: Duration::from_millis(1500),
            signal_retries: 2,
            media_send_timeout: Duration::from_millis(300),
            keepalive_interval: Duration::from_secs(2),
            quality_interval: Duration::from_secs(1),
            event_capacity: 64,
        }
    }
}

struct Connection {
    /// Wall clock at connect, ms since epoch.
    wall_ms: u64,
    at: Instant,
    last_audio: Option<Instant>,
}

/// Everything the manager holds for the current call.
struct CallContext {
    info: CallInfo,
    /// Handed to the media session on connect, dropped (and zeroed) there.
    key: Option<SessionKeyMaterial>,
    /// Start of this session in the timebase of its signals.
    session_started_ms: u64,
    connection: Option<Connection>,
    media: Option<Arc<MediaSession>>,
    liveness: LivenessTracker,
    ring_timer: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl CallContext {
    fn new(
        info: CallInfo,
        key: SessionKeyMaterial,
        session_started_ms: u64,
        monitor: ConnectionMonitorConfig,
    ) -> Self {
        Self {
            info,
            key: Some(key),
            session_started_ms,
            connection: None,
            media: None,
            liveness: LivenessTracker::new(monitor),
            ring_timer: None,
            tasks: Vec::new(),
        }
    }

    fn is(&self, call_id: &CallId) -> bool {
        self.info.call_id == *call_id
    }

    /// Whether a signal from `peer` naming `call_id` belongs to this call.
    fn matches(&self, peer: &PeerRef, call_id: Option<&CallId>) -> bool {
        self.info.peer == *peer && call_id.is_none_or(|id| *id == self.info.call_id)
    }

    /// Stop everything the call runs and discard its key material.
    fn teardown(&mut self) {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(media) = self.media.take() {
            media.close();
        }
        self.key = None;
    }
}

/// Manages the current call and its state transitions.
pub struct CallManager {
    config: CallManagerConfig,
    routes: TransportRoutes,
    keys: Arc<dyn KeyAgreement>,
    session: Mutex<Option<CallContext>>,
    accept_in_flight: AtomicBool,
    blocked: Mutex<HashSet<PeerRef>>,
    /// Requests seen recently, keyed by peer and the call id they carried.
    recent_requests: Mutex<HashMap<(PeerRef, Option<CallId>), Instant>>,
    events: broadcast::Sender<CallEvent>,
    runtime: Option<Handle>,
    this: Weak<CallManager>,
}

impl CallManager {
    /// Create a new call manager.
    ///
    /// When created inside a tokio runtime, that runtime also runs the sends
    /// issued from non-runtime threads such as an audio callback.
    pub fn new(
        config: CallManagerConfig,
        routes: TransportRoutes,
        keys: Arc<dyn KeyAgreement>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Arc::new_cyclic(|this| Self {
            config,
            routes,
            keys,
            session: Mutex::new(None),
            accept_in_flight: AtomicBool::new(false),
            blocked: Mutex::new(HashSet::new()),
            recent_requests: Mutex::new(HashMap::new()),
            events,
            runtime: Handle::try_current().ok(),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &CallManagerConfig {
        &self.config
    }

    /// Subscribe to call events.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Current lifecycle state. `Idle` when there is no call.
    pub fn state(&self) -> CallState {
        self.session()
            .as_ref()
            .map(|ctx| ctx.info.state.clone())
            .unwrap_or_default()
    }

    pub fn current_call(&self) -> Option<CallInfo> {
        self.session().as_ref().map(|ctx| ctx.info.clone())
    }

    pub fn media_stats(&self) -> Option<MediaSessionStats> {
        self.session()
            .as_ref()
            .and_then(|ctx| ctx.media.as_ref())
            .map(|media| media.stats())
    }

    pub fn block_peer(&self, peer: PeerRef) {
        info!("Blocking {}", peer);
        lock(&self.blocked).insert(peer.clone());

        let ringing = self
            .session()
            .as_ref()
            .filter(|ctx| {
                ctx.info.peer == peer && !ctx.info.is_initiator() && ctx.info.state.is_ringing()
            })
            .map(|ctx| ctx.info.call_id.clone());
        if let Some(call_id) = ringing {
            self.end_session(&call_id, EndCallReason::Declined);
            self.notify_peer(
                peer,
                Signal::CallDecline {
                    reason: EndCallReason::Declined,
                },
            );
        }
    }

    pub fn unblock_peer(&self, peer: &PeerRef) {
        lock(&self.blocked).remove(peer);
    }

    pub fn is_blocked(&self, peer: &PeerRef) -> bool {
        lock(&self.blocked).contains(peer)
    }

    /// Start an outgoing call.
    pub async fn start_call(
        &self,
        peer: PeerRef,
        media_type: CallMediaType,
    ) -> Result<CallId, CallError> {
        if self.is_blocked(&peer) {
            return Err(CallError::PeerBlocked);
        }
        // Fail before touching state if we cannot talk to this peer.
        self.keys.signaling_key(&peer)?;

        let call_id = CallId::generate();
        let key = SessionKeyMaterial::generate();
        let request = Signal::CallRequest {
            key: key.clone(),
            call_id: Some(call_id.clone()),
            media_type,
        };

        let state = {
            let mut session = self.session();
            if session.is_some() {
                return Err(CallError::AlreadyInCall);
            }
            let mut info = CallInfo::new_outgoing(call_id.clone(), peer.clone(), media_type);
            info.apply_transition(CallTransition::LocalStart)?;
            let state = info.state.clone();
            *session = Some(CallContext::new(
                info,
                key,
                now_ms(),
                self.config.monitor.clone(),
            ));
            state
        };
        info!("Calling {} (call {})", peer, call_id);
        self.emit(CallEvent::StateChanged {
            call_id: Some(call_id.clone()),
            state,
        });

        if let Err(e) = self.send_signal(&peer, SignalingPacket::now(request)).await {
            warn!("Failed to deliver call request {}: {}", call_id, e);
            self.end_session(&call_id, EndCallReason::NetworkError);
            return Err(e);
        }
        self.arm_ring_timer(&call_id);
        Ok(call_id)
    }

    /// Accept the ringing incoming call.
    ///
    /// A second accept while one is in progress, or once the call is
    /// connected, is a no-op.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        if self.accept_in_flight.swap(true, Ordering::SeqCst) {
            debug!("Accept already in progress");
            return Ok(());
        }
        let _guard = scopeguard::guard((), |_| {
            self.accept_in_flight.store(false, Ordering::SeqCst);
        });

        let (call_id, peer) = {
            let session = self.session();
            match session.as_ref() {
                Some(ctx) if !ctx.info.is_initiator() && ctx.info.state.is_ringing() => {
                    (ctx.info.call_id.clone(), ctx.info.peer.clone())
                }
                Some(ctx) if !ctx.info.is_initiator() && ctx.info.state.is_in_call() => {
                    return Ok(());
                }
                _ => return Err(CallError::NoIncomingCall),
            }
        };

        self.connect(&call_id, CallTransition::LocalAccepted).await?;

        let accept = Signal::CallAccept {
            call_id: Some(call_id.clone()),
        };
        if let Err(e) = self.send_signal(&peer, SignalingPacket::now(accept)).await {
            warn!("Failed to deliver accept for {}: {}", call_id, e);
            self.end_session(&call_id, EndCallReason::NetworkError);
            return Err(e);
        }
        Ok(())
    }

    /// Decline the ringing incoming call.
    pub async fn decline_call(&self) -> Result<(), CallError> {
        let (call_id, peer) = {
            let session = self.session();
            match session.as_ref() {
                Some(ctx) if !ctx.info.is_initiator() && ctx.info.state.is_ringing() => {
                    (ctx.info.call_id.clone(), ctx.info.peer.clone())
                }
                _ => return Err(CallError::NoIncomingCall),
            }
        };

        self.end_session(&call_id, EndCallReason::Declined);
        let decline = Signal::CallDecline {
            reason: EndCallReason::Declined,
        };
        if let Err(e) = self.send_signal(&peer, SignalingPacket::now(decline)).await {
            debug!("Decline for {} not delivered: {}", call_id, e);
        }
        Ok(())
    }

    /// Hang up the current call, whatever its state.
    pub async fn end_call(&self) -> Result<(), CallError> {
        let (call_id, peer) = {
            let session = self.session();
            match session.as_ref() {
                Some(ctx) if !ctx.info.state.is_ended() => {
                    (ctx.info.call_id.clone(), ctx.info.peer.clone())
                }
                _ => return Err(CallError::NoActiveCall),
            }
        };

        self.end_session(&call_id, EndCallReason::HungUp);
        let end = Signal::CallEnd {
            reason: EndCallReason::HungUp,
        };
        if let Err(e) = self.send_signal(&peer, SignalingPacket::now(end)).await {
            debug!("Hang-up for {} not delivered: {}", call_id, e);
        }
        Ok(())
    }

    /// Feed captured PCM into the call. Returns the number of packets sent.
    pub fn capture_audio(&self, pcm: &[i16]) -> Result<usize, CallError> {
        let media = self.in_call_media().ok_or(CallError::NoActiveCall)?;
        let packets = media
            .process_capture(pcm)
            .map_err(|e| CallError::Encryption(e.to_string()))?;
        let count = packets.len();
        for packet in packets {
            self.send_media(packet);
        }
        Ok(count)
    }

    /// Next frame for the speaker, or `None` when not in a call.
    pub fn playout_audio(&self) -> Option<Vec<i16>> {
        self.in_call_media().map(|media| media.next_playout_frame())
    }

    /// Send an already encoded video frame.
    pub fn send_video(&self, frame: &[u8]) -> Result<(), CallError> {
        let media = self.in_call_media().ok_or(CallError::NoActiveCall)?;
        let packet = media
            .send_video(frame)
            .map_err(|e| CallError::Encryption(e.to_string()))?;
        self.send_media(packet);
        Ok(())
    }

    /// Drain video frames received from the peer.
    pub fn take_video_frames(&self) -> Vec<Vec<u8>> {
        self.in_call_media()
            .map(|media| media.take_video_frames())
            .unwrap_or_default()
    }

    /// Entry point for every blob a transport receives.
    pub async fn handle_inbound(&self, from: &PeerRef, bytes: &[u8]) {
        if packet::is_signaling(bytes) {
            self.handle_signal(from, bytes).await;
        } else {
            self.handle_media(from, bytes);
        }
    }

    fn handle_media(&self, from: &PeerRef, bytes: &[u8]) {
        let media = {
            let session = self.session();
            session
                .as_ref()
                .filter(|ctx| ctx.info.peer == *from && ctx.info.state.is_in_call())
                .and_then(|ctx| ctx.media.clone())
        };
        let Some(media) = media else {
            trace!("Dropping media packet from {} outside a call", from);
            return;
        };

        match media.ingest(bytes) {
            IngestOutcome::Audio { .. } => self.on_audio_received(),
            IngestOutcome::Ping { reply } => self.send_media(reply),
            IngestOutcome::Pong { rtt_ms } => trace!("Keepalive RTT {} ms", rtt_ms),
            IngestOutcome::Recovered { sequence } => trace!("Recovered audio {}", sequence),
            IngestOutcome::Redundancy | IngestOutcome::Video | IngestOutcome::Dropped => {}
        }
    }

    fn on_audio_received(&self) {
        let restored = {
            let mut session = self.session();
            let Some(ctx) = session.as_mut() else {
                return;
            };
            if let Some(connection) = ctx.connection.as_mut() {
                connection.last_audio = Some(Instant::now());
            }
            ctx.liveness
                .on_audio()
                .then(|| ctx.info.call_id.clone())
        };
        if let Some(call_id) = restored {
            info!("Audio resumed on call {}", call_id);
            self.emit(CallEvent::ConnectionRestored { call_id });
        }
    }

    async fn handle_signal(&self, from: &PeerRef, bytes: &[u8]) {
        let packet = match self.open_signal(from, bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping signal from {}: {}", from, e);
                return;
            }
        };
        let signal_type = packet.signal.signaling_type();
        if let Err(e) = check_freshness(packet.created_at_ms, now_ms(), &self.config.signaling) {
            warn!("Rejected {} from {}: {}", signal_type, from, e);
            return;
        }
        debug!("Received {} from {}", signal_type, from);

        let created_at_ms = packet.created_at_ms;
        match packet.signal {
            Signal::CallRequest {
                key,
                call_id,
                media_type,
            } => self.on_call_request(from, key, call_id, media_type, created_at_ms),
            Signal::CallRinging { call_id } => self.on_ringing(from, call_id.as_ref()),
            Signal::CallAccept { call_id } => self.on_remote_accept(from, call_id.as_ref()).await,
            Signal::CallDecline { reason } | Signal::CallEnd { reason } => {
                // Decoding guarantees a timestamp on these.
                if let Some(created) = created_at_ms {
                    self.on_remote_end(from, reason, created);
                }
            }
        }
    }

    fn open_signal(&self, from: &PeerRef, bytes: &[u8]) -> Result<SignalingPacket, CallError> {
        let key = self.keys.signaling_key(from)?;
        let plaintext = key.open(bytes)?;
        Ok(SignalingPacket::decode(&plaintext)?)
    }

    fn on_call_request(
        &self,
        from: &PeerRef,
        key: SessionKeyMaterial,
        call_id: Option<CallId>,
        media_type: CallMediaType,
        created_at_ms: Option<u64>,
    ) {
        if self.is_blocked(from) {
            info!("Ignoring call from blocked peer {}", from);
            return;
        }
        if self.is_duplicate_request(from, call_id.as_ref()) {
            debug!("Coalescing repeated call request from {}", from);
            return;
        }

        let call_id = call_id.unwrap_or_else(CallId::generate);
        let state = {
            let mut session = self.session();
            if let Some(ctx) = session.as_ref() {
                info!(
                    "Ignoring call request from {} during call {}",
                    from, ctx.info.call_id
                );
                return;
            }
            let mut info = CallInfo::new_incoming(call_id.clone(), from.clone(), media_type);
            if let Err(e) = info.apply_transition(CallTransition::RequestReceived) {
                warn!("Cannot ring for {}: {}", call_id, e);
                return;
            }
            let state = info.state.clone();
            let started = created_at_ms.unwrap_or_else(now_ms);
            *session = Some(CallContext::new(
                info,
                key,
                started,
                self.config.monitor.clone(),
            ));
            state
        };

        info!("Incoming {:?} call {} from {}", media_type, call_id, from);
        self.emit(CallEvent::StateChanged {
            call_id: Some(call_id.clone()),
            state,
        });
        self.emit(CallEvent::IncomingCall {
            call_id: call_id.clone(),
            peer: from.clone(),
            media_type,
        });
        self.notify_peer(
            from.clone(),
            Signal::CallRinging {
                call_id: Some(call_id.clone()),
            },
        );
        self.arm_ring_timer(&call_id);
    }

    /// A request repeating one seen within the window. Requests carrying a
    /// different call id are new calls, not repeats.
    fn is_duplicate_request(&self, from: &PeerRef, call_id: Option<&CallId>) -> bool {
        let now = Instant::now();
        let window = self.config.signaling.duplicate_request_window;
        let mut recent = lock(&self.recent_requests);
        recent.retain(|_, seen| now.duration_since(*seen) < window);
        let key = (from.clone(), call_id.cloned());
        if recent.contains_key(&key) {
            return true;
        }
        recent.insert(key, now);
        false
    }

    /// Legacy requests carry no call id, so once their call is over the
    /// next one from the same peer must ring again.
    fn forget_untagged_request(&self, peer: &PeerRef) {
        lock(&self.recent_requests).remove(&(peer.clone(), None));
    }

    fn on_ringing(&self, from: &PeerRef, call_id: Option<&CallId>) {
        let changed = {
            let mut session = self.session();
            let Some(ctx) = session.as_mut() else {
                return;
            };
            if !ctx.matches(from, call_id)
                || !ctx.info.is_initiator()
                || !matches!(ctx.info.state, CallState::Connecting { .. })
            {
                return;
            }
            match ctx.info.apply_transition(CallTransition::RingingAcknowledged) {
                Ok(()) => Some((ctx.info.call_id.clone(), ctx.info.state.clone())),
                Err(e) => {
                    debug!("Ignoring ringing ack: {}", e);
                    None
                }
            }
        };
        if let Some((call_id, state)) = changed {
            debug!("Peer {} is ringing for {}", from, call_id);
            self.emit(CallEvent::StateChanged {
                call_id: Some(call_id),
                state,
            });
        }
    }

    async fn on_remote_accept(&self, from: &PeerRef, call_id: Option<&CallId>) {
        if self.accept_in_flight.swap(true, Ordering::SeqCst) {
            debug!("Ignoring accept from {}: already processing one", from);
            return;
        }
        let _guard = scopeguard::guard((), |_| {
            self.accept_in_flight.store(false, Ordering::SeqCst);
        });

        let target = {
            let session = self.session();
            match session.as_ref() {
                Some(ctx)
                    if ctx.matches(from, call_id)
                        && ctx.info.is_initiator()
                        && ctx.info.state.is_pending() =>
                {
                    ctx.info.call_id.clone()
                }
                Some(ctx) if ctx.info.state.is_in_call() => {
                    debug!("Ignoring duplicate accept for {}", ctx.info.call_id);
                    return;
                }
                _ => {
                    debug!("Ignoring accept from {} with no matching call", from);
                    return;
                }
            }
        };

        if let Err(e) = self.connect(&target, CallTransition::RemoteAccepted).await {
            warn!("Failed to connect call {}: {}", target, e);
            self.end_session(&target, EndCallReason::NetworkError);
        }
    }

    fn on_remote_end(&self, from: &PeerRef, reason: EndCallReason, created_at_ms: u64) {
        let call_id = {
            let session = self.session();
            let Some(ctx) = session
                .as_ref()
                .filter(|ctx| ctx.info.peer == *from && !ctx.info.state.is_ended())
            else {
                debug!("Ignoring {} from {} with no matching call", reason, from);
                return;
            };
            let connected = ctx.connection.as_ref().map(|c| ConnectedAt {
                wall_ms: c.wall_ms,
                elapsed: c.at.elapsed(),
            });
            if !end_signal_applies(
                created_at_ms,
                ctx.session_started_ms,
                connected,
                &self.config.signaling,
            ) {
                warn!(
                    "Ignoring stale {} from {} for call {}",
                    reason, from, ctx.info.call_id
                );
                return;
            }
            ctx.info.call_id.clone()
        };
        info!("Call {} ended by {}: {}", call_id, from, reason);
        self.end_session(&call_id, reason);
    }

    /// Move a pending call to `InCall`: lock its path, start media and the
    /// call tasks.
    async fn connect(&self, call_id: &CallId, transition: CallTransition) -> Result<(), CallError> {
        let peer = {
            let session = self.session();
            session
                .as_ref()
                .filter(|ctx| ctx.is(call_id))
                .map(|ctx| ctx.info.peer.clone())
                .ok_or(CallError::NoActiveCall)?
        };
        let preferred = self.routes.choose(&peer).await;

        let (state, path) = {
            let mut session = self.session();
            let ctx = session
                .as_mut()
                .filter(|ctx| ctx.is(call_id) && ctx.info.state.is_pending())
                .ok_or(CallError::NoActiveCall)?;
            let key = ctx
                .key
                .take()
                .ok_or_else(|| CallError::Encryption("session key already discarded".into()))?;
            let media = MediaSession::new(
                self.config.media.clone(),
                &key,
                ctx.info.direction.role(),
            )
            .map_err(|e| CallError::Encryption(e.to_string()))?;
            drop(key);

            ctx.info.apply_transition(transition)?;
            let path = ctx.info.lock_delivery_path(preferred);
            if let Some(timer) = ctx.ring_timer.take() {
                timer.abort();
            }
            ctx.media = Some(Arc::new(media));
            ctx.connection = Some(Connection {
                wall_ms: now_ms(),
                at: Instant::now(),
                last_audio: None,
            });
            ctx.tasks = self.spawn_call_tasks(call_id, &peer, path);
            (ctx.info.state.clone(), path)
        };

        info!("Call {} connected with {} via {:?}", call_id, peer, path);
        self.emit(CallEvent::StateChanged {
            call_id: Some(call_id.clone()),
            state,
        });
        Ok(())
    }

    fn spawn_call_tasks(
        &self,
        call_id: &CallId,
        peer: &PeerRef,
        path: DeliveryPath,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks: Vec<JoinHandle<()>> = [
            self.spawn_ticker(call_id, self.config.keepalive_interval, Self::keepalive_tick),
            self.spawn_ticker(call_id, self.config.quality_interval, Self::quality_tick),
            self.spawn_ticker(call_id, self.config.monitor.period, Self::monitor_tick),
        ]
        .into_iter()
        .flatten()
        .collect();

        if let Some(this) = self.this.upgrade() {
            let inbound: Arc<dyn InboundHandler> = this;
            tasks.extend(self.routes.get(path).start_call_tasks(peer, inbound));
        }
        tasks
    }

    /// Run `tick` every `period` until it returns false or the manager is dropped.
    fn spawn_ticker(
        &self,
        call_id: &CallId,
        period: Duration,
        tick: fn(&CallManager, &CallId) -> bool,
    ) -> Option<JoinHandle<()>> {
        let this = self.this.clone();
        let call_id = call_id.clone();
        self.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = this.upgrade() else {
                    break;
                };
                if !tick(&manager, &call_id) {
                    break;
                }
            }
        })
    }

    fn keepalive_tick(&self, call_id: &CallId) -> bool {
        let Some(media) = self.media_for(call_id) else {
            return false;
        };
        match media.keepalive_packet() {
            Ok(packet) => self.send_media(packet),
            Err(e) => debug!("Keepalive for {} not sealed: {}", call_id, e),
        }
        true
    }

    fn quality_tick(&self, call_id: &CallId) -> bool {
        let Some(media) = self.media_for(call_id) else {
            return false;
        };
        if let Some(level) = media.evaluate_quality() {
            info!("Call {} quality now {:?}", call_id, level);
            self.emit(CallEvent::QualityChanged {
                call_id: call_id.clone(),
                level,
            });
        }
        true
    }

    fn monitor_tick(&self, call_id: &CallId) -> bool {
        let (action, peer, path) = {
            let mut session = self.session();
            let Some(ctx) = session
                .as_mut()
                .filter(|ctx| ctx.is(call_id) && ctx.info.state.is_in_call())
            else {
                return false;
            };
            let Some(connection) = ctx.connection.as_ref() else {
                return false;
            };
            let since_connect = connection.at.elapsed();
            let since_audio = connection.last_audio.unwrap_or(connection.at).elapsed();
            let action = ctx.liveness.evaluate(since_connect, since_audio);
            let path = ctx.info.delivery_path().unwrap_or(DeliveryPath::Relay);
            (action, ctx.info.peer.clone(), path)
        };

        match action {
            MonitorAction::Idle => {}
            MonitorAction::Degraded { silent_for } => {
                warn!(
                    "No audio on call {} for {:.1}s",
                    call_id,
                    silent_for.as_secs_f32()
                );
                self.emit(CallEvent::ConnectionDegraded {
                    call_id: call_id.clone(),
                    silent_for,
                });
            }
            MonitorAction::Reconnect { attempt } => {
                info!(
                    "Reconnecting call {} via {:?} (attempt {})",
                    call_id, path, attempt
                );
                self.emit(CallEvent::Reconnecting {
                    call_id: call_id.clone(),
                    attempt,
                });
                self.spawn_reconnect(call_id, peer, path);
            }
            MonitorAction::ForceEnd(reason) => {
                warn!("Call {} lost: no audio", call_id);
                self.end_session(call_id, reason);
                self.notify_peer(peer, Signal::CallEnd { reason });
                return false;
            }
        }
        true
    }

    /// Reconnect the locked path only; never switch to the other one.
    fn spawn_reconnect(&self, call_id: &CallId, peer: PeerRef, path: DeliveryPath) {
        let this = self.this.clone();
        let id = call_id.clone();
        let transport = self.routes.get(path);
        let budget = self.config.signal_send_timeout;
        let Some(handle) = self.spawn(async move {
            let still_current = this
                .upgrade()
                .is_some_and(|manager| manager.media_for(&id).is_some());
            if !still_current {
                return;
            }
            match tokio::time::timeout(budget, transport.reconnect(&peer)).await {
                Ok(Ok(())) => debug!("Reconnected {:?} path to {}", path, peer),
                Ok(Err(e)) => debug!("Reconnect to {} failed: {}", peer, e),
                Err(_) => debug!("Reconnect to {} timed out", peer),
            }
        }) else {
            return;
        };

        let mut session = self.session();
        match session.as_mut().filter(|ctx| ctx.is(call_id)) {
            Some(ctx) if ctx.info.state.is_in_call() => ctx.tasks.push(handle),
            _ => handle.abort(),
        }
    }

    fn arm_ring_timer(&self, call_id: &CallId) {
        let this = self.this.clone();
        let id = call_id.clone();
        let timeout = self.config.ring_timeout;
        let Some(handle) = self.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = this.upgrade() {
                manager.on_ring_timeout(&id);
            }
        }) else {
            return;
        };

        let mut session = self.session();
        match session.as_mut().filter(|ctx| ctx.is(call_id)) {
            Some(ctx) if ctx.info.state.is_pending() => {
                if let Some(previous) = ctx.ring_timer.replace(handle) {
                    previous.abort();
                }
            }
            _ => handle.abort(),
        }
    }

    fn on_ring_timeout(&self, call_id: &CallId) {
        let peer = {
            let session = self.session();
            match session.as_ref() {
                Some(ctx) if ctx.is(call_id) && ctx.info.state.is_pending() => {
                    ctx.info.peer.clone()
                }
                _ => return,
            }
        };
        info!("Call {} was not answered", call_id);
        self.end_session(call_id, EndCallReason::NoAnswer);
        self.notify_peer(
            peer,
            Signal::CallEnd {
                reason: EndCallReason::NoAnswer,
            },
        );
    }

    /// End the call: stop its tasks, close media, drop the key, then report.
    ///
    /// Returns false if `call_id` is not the live call.
    fn end_session(&self, call_id: &CallId, reason: EndCallReason) -> bool {
        let (state, peer, duration_secs) = {
            let mut session = self.session();
            let Some(ctx) = session
                .as_mut()
                .filter(|ctx| ctx.is(call_id) && !ctx.info.state.is_ended())
            else {
                return false;
            };
            ctx.teardown();
            if let Err(e) = ctx
                .info
                .apply_transition(CallTransition::Terminated { reason })
            {
                warn!("Cannot end call {}: {}", call_id, e);
                return false;
            }
            let duration_secs = match &ctx.info.state {
                CallState::Ended { duration_secs, .. } => *duration_secs,
                _ => None,
            };
            (ctx.info.state.clone(), ctx.info.peer.clone(), duration_secs)
        };

        self.forget_untagged_request(&peer);
        info!("Call {} ended: {}", call_id, reason);
        self.emit(CallEvent::StateChanged {
            call_id: Some(call_id.clone()),
            state,
        });
        self.emit(CallEvent::CallEnded {
            call_id: call_id.clone(),
            peer,
            reason,
            duration_secs,
        });
        self.schedule_reset(call_id);
        true
    }

    fn schedule_reset(&self, call_id: &CallId) {
        let this = self.this.clone();
        let id = call_id.clone();
        let delay = self.config.reset_delay;
        let spawned = self.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = this.upgrade() {
                manager.reset_session(&id);
            }
        });
        if spawned.is_none() {
            self.reset_session(call_id);
        }
    }

    fn reset_session(&self, call_id: &CallId) {
        {
            let mut session = self.session();
            match session.as_ref() {
                Some(ctx) if ctx.is(call_id) && ctx.info.state.is_ended() => *session = None,
                _ => return,
            }
        }
        debug!("Call {} cleared", call_id);
        self.emit(CallEvent::StateChanged {
            call_id: None,
            state: CallState::Idle,
        });
    }

    async fn send_signal(&self, peer: &PeerRef, packet: SignalingPacket) -> Result<(), CallError> {
        let key = self.keys.signaling_key(peer)?;
        let envelope = key.seal(&packet.encode())?;
        let path = match self.locked_path(peer) {
            Some(path) => path,
            None => self.routes.choose(peer).await,
        };
        let transport = self.routes.get(path);
        let signal_type = packet.signal.signaling_type();

        let mut last_error = TransportError::Timeout;
        for attempt in 0..=self.config.signal_retries {
            match tokio::time::timeout(
                self.config.signal_send_timeout,
                transport.send(peer, &envelope),
            )
            .await
            {
                Ok(Ok(())) => {
                    debug!("Sent {} to {} via {:?}", signal_type, peer, path);
                    return Ok(());
                }
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = TransportError::Timeout,
            }
            debug!(
                "Sending {} to {} failed (attempt {}): {}",
                signal_type,
                peer,
                attempt + 1,
                last_error
            );
        }
        Err(CallError::Network(last_error))
    }

    /// Fire-and-forget signal.
    fn notify_peer(&self, peer: PeerRef, signal: Signal) {
        let this = self.this.clone();
        self.spawn(async move {
            let Some(manager) = this.upgrade() else {
                return;
            };
            let signal_type = signal.signaling_type();
            if let Err(e) = manager
                .send_signal(&peer, SignalingPacket::now(signal))
                .await
            {
                debug!("{} to {} not delivered: {}", signal_type, peer, e);
            }
        });
    }

    /// Send one media packet on the locked path and feed the outcome to the
    /// bitrate controller.
    fn send_media(&self, bytes: Vec<u8>) {
        let route = {
            let session = self.session();
            session
                .as_ref()
                .filter(|ctx| ctx.info.state.is_in_call())
                .and_then(|ctx| {
                    let media = ctx.media.clone()?;
                    let path = ctx.info.delivery_path()?;
                    Some((ctx.info.peer.clone(), self.routes.get(path), media))
                })
        };
        let Some((peer, transport, media)) = route else {
            return;
        };
        let budget = self.config.media_send_timeout;
        self.spawn(async move {
            let delivered = matches!(
                tokio::time::timeout(budget, transport.send(&peer, &bytes)).await,
                Ok(Ok(()))
            );
            media.record_send_result(delivered);
        });
    }

    fn locked_path(&self, peer: &PeerRef) -> Option<DeliveryPath> {
        self.session()
            .as_ref()
            .filter(|ctx| ctx.info.peer == *peer)
            .and_then(|ctx| ctx.info.delivery_path())
    }

    fn in_call_media(&self) -> Option<Arc<MediaSession>> {
        self.session()
            .as_ref()
            .filter(|ctx| ctx.info.state.is_in_call())
            .and_then(|ctx| ctx.media.clone())
    }

    fn media_for(&self, call_id: &CallId) -> Option<Arc<MediaSession>> {
        self.session()
            .as_ref()
            .filter(|ctx| ctx.is(call_id) && ctx.info.state.is_in_call())
            .and_then(|ctx| ctx.media.clone())
    }

    fn session(&self) -> MutexGuard<'_, Option<CallContext>> {
        lock(&self.session)
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn spawn<F>(&self, future: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match Handle::try_current().ok().or_else(|| self.runtime.clone()) {
            Some(handle) => Some(handle.spawn(future)),
            None => {
                warn!("No async runtime available; background work skipped");
                None
            }
        }
    }
}

#[async_trait]
impl InboundHandler for CallManager {
    async fn on_receive(&self, from: &PeerRef, bytes: Vec<u8>) {
        self.handle_inbound(from, &bytes).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
