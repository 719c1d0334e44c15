//! Call orchestrator
//!
//! One orchestrator per call attempt. `start()` walks the setup sequence
//! (media, peer connection, signaling, offer or answer) and `end()` tears
//! every piece down again; both sides of the call run the same type with a
//! different [`CallRole`].

use crate::error::CallError;
use crate::media::{MediaAcquirer, MediaBackend};
use crate::peer::{PeerEvent, PeerManager};
use crate::realtime::Realtime;
use crate::signaling::{SignalEnvelope, SignalEvent, SignalingChannel};
use crate::store::{CallKind, CallSession, CallStatus, CallStore, NewCallSession, StoreError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;
use webrtc::ice_transport::ice_server::RTCIceServer;

const EVENT_CAPACITY: usize = 100;

/// How long a started call may sit in [`CallPhase::Connecting`] before it
/// is reported as failed.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// ROLES, PHASES, EVENTS
// ============================================================================

/// Which side of the negotiation this orchestrator plays.
///
/// The initiator sends the offer; the receiver answers. The roles are
/// exclusive: an initiator ignores incoming offers and a receiver ignores
/// incoming answers, so a glare of crossed envelopes cannot corrupt the
/// negotiation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Initiator,
    Receiver,
}

/// Lifecycle of one call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    AcquiringMedia,
    Connecting,
    Connected,
    Ended,
}

/// Events emitted while a call runs.
#[derive(Debug, Clone)]
pub enum CallEvent {
    PhaseChanged(CallPhase),
    /// At least one remote track has arrived and can be rendered.
    RemoteStream,
    Error(CallError),
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub session_id: Uuid,
    pub role: CallRole,
    pub want_audio: bool,
    pub want_video: bool,
    pub ice_servers: Vec<RTCIceServer>,
    pub connect_timeout: Duration,
}

impl CallConfig {
    pub fn new(session_id: Uuid, role: CallRole) -> Self {
        Self {
            session_id,
            role,
            want_audio: true,
            want_video: true,
            ice_servers: crate::peer::default_ice_servers(),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Audio calls skip the camera; video calls request both devices.
    pub fn for_kind(session_id: Uuid, role: CallRole, kind: CallKind) -> Self {
        let mut config = Self::new(session_id, role);
        config.want_video = kind == CallKind::Video;
        config
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Records a new outgoing call and returns the session row together with
/// the initiator-side config to start it.
pub fn initiate_call(
    store: &CallStore,
    booking_id: Uuid,
    caller_id: Uuid,
    callee_id: Uuid,
    kind: CallKind,
) -> Result<(CallSession, CallConfig), StoreError> {
    let session = store.initiate(NewCallSession {
        booking_id,
        caller_id,
        callee_id,
        call_type: kind,
    })?;
    let config = CallConfig::for_kind(session.id, CallRole::Initiator, kind);
    Ok((session, config))
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Drives one call attempt from setup to teardown.
pub struct CallOrchestrator {
    config: CallConfig,
    realtime: Arc<dyn Realtime>,
    media: Arc<MediaAcquirer>,
    peer: Arc<PeerManager>,
    store: Option<Arc<CallStore>>,
    channel: Mutex<Option<Arc<SignalingChannel>>>,
    phase: Arc<Mutex<CallPhase>>,
    event_tx: broadcast::Sender<CallEvent>,
    started: AtomicBool,
    start_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    was_connected: Arc<AtomicBool>,
}

impl CallOrchestrator {
    /// Creates an orchestrator with the platform capture backend.
    pub fn new(realtime: Arc<dyn Realtime>, config: CallConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let peer = Arc::new(PeerManager::with_ice_servers(config.ice_servers.clone()));
        Self {
            config,
            realtime,
            media: Arc::new(MediaAcquirer::with_default_backend()),
            peer,
            store: None,
            channel: Mutex::new(None),
            phase: Arc::new(Mutex::new(CallPhase::Idle)),
            event_tx,
            started: AtomicBool::new(false),
            start_lock: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
            was_connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Swaps in a different capture backend. Must be called before `start`.
    pub fn with_media_backend(mut self, backend: Arc<dyn MediaBackend>) -> Self {
        self.media = Arc::new(MediaAcquirer::new(backend));
        self
    }

    /// Attaches the session store so the call's status is recorded.
    pub fn with_store(mut self, store: Arc<CallStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    pub fn phase(&self) -> CallPhase {
        *self.phase.lock()
    }

    pub fn session_id(&self) -> Uuid {
        self.config.session_id
    }

    pub fn role(&self) -> CallRole {
        self.config.role
    }

    /// Microphone level for UI metering.
    pub fn input_level(&self) -> f32 {
        self.media.input_level()
    }

    /// Mutes or unmutes the microphone without renegotiating.
    pub fn toggle_audio(&self, enabled: bool) {
        self.media.toggle_audio(enabled);
    }

    /// Pauses or resumes the camera without renegotiating.
    pub fn toggle_video(&self, enabled: bool) {
        self.media.toggle_video(enabled);
    }

    fn set_phase(&self, phase: CallPhase) {
        let changed = {
            let mut current = self.phase.lock();
            if *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        };
        if changed {
            tracing::info!("call {} phase: {:?}", self.config.session_id, phase);
            let _ = self.event_tx.send(CallEvent::PhaseChanged(phase));
        }
    }

    /// Starts the call. A second call while one is running is a no-op.
    ///
    /// On failure every resource acquired so far is released again, the
    /// phase returns to [`CallPhase::Idle`], and the session's stored
    /// status is left untouched so the user can retry.
    pub async fn start(&self) -> Result<(), CallError> {
        let _running = self.start_lock.lock().await;

        if self.started.load(Ordering::SeqCst) {
            tracing::debug!("call {} already started", self.config.session_id);
            return Ok(());
        }

        self.was_connected.store(false, Ordering::SeqCst);

        match self.run_start().await {
            Ok(()) => {
                self.started.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("call {} failed to start: {}", self.config.session_id, e);
                self.release_partial_start();
                let _ = self.event_tx.send(CallEvent::Error(e.clone()));
                Err(e)
            }
        }
    }

    async fn run_start(&self) -> Result<(), CallError> {
        self.set_phase(CallPhase::AcquiringMedia);

        let stream = self
            .media
            .acquire(self.config.want_audio, self.config.want_video)?;

        self.peer.create().await?;
        self.peer.attach_local_tracks(&stream).await?;

        // A leftover channel from a previous attempt must be gone before
        // the new subscription, otherwise both would decode the topic.
        if let Some(previous) = self.channel.lock().take() {
            previous.close();
        }
        let channel = Arc::new(SignalingChannel::open(
            Arc::clone(&self.realtime),
            self.config.session_id,
        )?);
        *self.channel.lock() = Some(Arc::clone(&channel));

        self.spawn_signal_dispatch(Arc::clone(&channel));
        self.spawn_peer_dispatch(Arc::clone(&channel));
        self.spawn_connect_timeout(Arc::clone(&channel));

        if self.config.role == CallRole::Initiator {
            let sdp = self.peer.create_offer().await?;
            channel.send(&SignalEnvelope::Offer {
                session_id: self.config.session_id,
                sdp,
            })?;
        }

        self.set_phase(CallPhase::Connecting);
        Ok(())
    }

    /// Routes decoded signaling events into the peer connection.
    fn spawn_signal_dispatch(&self, channel: Arc<SignalingChannel>) {
        let mut events = channel.events();
        let peer = Arc::clone(&self.peer);
        let role = self.config.role;
        let session_id = self.config.session_id;
        let event_tx = self.event_tx.clone();

        let task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("signal dispatch for {} lagged by {}", session_id, n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                match event {
                    SignalEvent::Offer { sdp } => {
                        if role == CallRole::Initiator {
                            tracing::warn!(
                                "call {}: ignoring offer, this side is initiating",
                                session_id
                            );
                            continue;
                        }
                        // The offer can land while this side's own start
                        // path is still finishing; creation is idempotent.
                        if let Err(e) = peer.create().await {
                            tracing::warn!("failed to ensure peer connection: {}", e);
                            let _ = event_tx.send(CallEvent::Error(e.into()));
                            continue;
                        }
                        match peer.apply_remote_offer(sdp).await {
                            Ok(answer_sdp) => {
                                let envelope = SignalEnvelope::Answer {
                                    session_id,
                                    sdp: answer_sdp,
                                };
                                if let Err(e) = channel.send(&envelope) {
                                    tracing::warn!("failed to send answer: {}", e);
                                    let _ = event_tx.send(CallEvent::Error(e.into()));
                                }
                            }
                            Err(e) => {
                                tracing::warn!("failed to answer offer: {}", e);
                                let _ = event_tx.send(CallEvent::Error(e.into()));
                            }
                        }
                    }
                    SignalEvent::Answer { sdp } => {
                        if role == CallRole::Receiver {
                            tracing::warn!(
                                "call {}: ignoring answer, this side is receiving",
                                session_id
                            );
                            continue;
                        }
                        if let Err(e) = peer.apply_remote_answer(sdp).await {
                            tracing::warn!("failed to apply answer: {}", e);
                            let _ = event_tx.send(CallEvent::Error(e.into()));
                        }
                    }
                    SignalEvent::Candidate { candidate } => {
                        if let Err(e) = peer.add_remote_candidate(&candidate).await {
                            // A bad candidate is not fatal; others may work.
                            tracing::warn!("rejected remote candidate: {}", e);
                        }
                    }
                }
            }
        });

        self.tasks.lock().push(task);
    }

    /// Relays peer connection events outward and local candidates to the
    /// signaling channel.
    fn spawn_peer_dispatch(&self, channel: Arc<SignalingChannel>) {
        let mut events = self.peer.subscribe();
        let session_id = self.config.session_id;
        let event_tx = self.event_tx.clone();
        let phase = Arc::clone(&self.phase);
        let was_connected = Arc::clone(&self.was_connected);
        let store = self.store.clone();

        let task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("peer dispatch for {} lagged by {}", session_id, n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                match event {
                    PeerEvent::LocalCandidate { candidate } => {
                        let envelope = SignalEnvelope::IceCandidate {
                            session_id,
                            candidate,
                        };
                        if let Err(e) = channel.send(&envelope) {
                            tracing::warn!("failed to relay local candidate: {}", e);
                        }
                    }
                    PeerEvent::Connected => {
                        was_connected.store(true, Ordering::SeqCst);
                        {
                            let mut current = phase.lock();
                            if *current != CallPhase::Connected {
                                *current = CallPhase::Connected;
                                let _ = event_tx
                                    .send(CallEvent::PhaseChanged(CallPhase::Connected));
                            }
                        }
                        if let Some(store) = &store {
                            match store.mark_ongoing(session_id) {
                                Ok(_) => {}
                                // The other side may have stamped it first.
                                Err(StoreError::InvalidTransition { .. }) => {}
                                Err(e) => {
                                    tracing::warn!("failed to mark call ongoing: {}", e)
                                }
                            }
                        }
                    }
                    PeerEvent::ConnectionLost => {
                        tracing::warn!("call {}: connection lost", session_id);
                        let _ = event_tx.send(CallEvent::Error(CallError::ConnectionLost));
                    }
                    PeerEvent::RemoteTrack => {
                        let _ = event_tx.send(CallEvent::RemoteStream);
                    }
                }
            }
        });

        self.tasks.lock().push(task);
    }

    /// Reports the call as failed if it never leaves the connecting phase.
    fn spawn_connect_timeout(&self, channel: Arc<SignalingChannel>) {
        let timeout = self.config.connect_timeout;
        let session_id = self.config.session_id;
        let phase = Arc::clone(&self.phase);
        let event_tx = self.event_tx.clone();
        let peer = Arc::clone(&self.peer);
        let media = Arc::clone(&self.media);

        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if *phase.lock() != CallPhase::Connecting {
                return;
            }
            tracing::warn!(
                "call {}: no connection after {:?}, giving up",
                session_id,
                timeout
            );
            let _ = event_tx.send(CallEvent::Error(CallError::ConnectionLost));
            channel.close();
            peer.close().await;
            media.release();
        });

        self.tasks.lock().push(task);
    }

    /// Undoes a failed `start` without touching the stored session status.
    fn release_partial_start(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(channel) = self.channel.lock().take() {
            channel.close();
        }
        self.close_peer_detached();
        self.media.release();
        self.set_phase(CallPhase::Idle);
    }

    fn close_peer_detached(&self) {
        // Detach synchronously so a retry that follows immediately gets a
        // fresh connection instead of one a pending close is about to take.
        if let Some(pc) = self.peer.detach() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = pc.close().await {
                        tracing::warn!("error closing peer connection: {}", e);
                    }
                });
            }
        }
    }

    /// Ends the call and releases everything: tasks, signaling, the peer
    /// connection, and the capture devices. Safe to call repeatedly and
    /// before `start` ever ran.
    ///
    /// When a store is attached and the call had started, the session is
    /// closed as completed (if it ever connected) or failed.
    pub fn end(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(channel) = self.channel.lock().take() {
            channel.close();
        }
        self.close_peer_detached();
        self.media.release();

        if self.started.swap(false, Ordering::SeqCst) {
            if let Some(store) = &self.store {
                let status = if self.was_connected.load(Ordering::SeqCst) {
                    CallStatus::Completed
                } else {
                    CallStatus::Failed
                };
                match store.finish(self.config.session_id, status) {
                    Ok(session) => tracing::info!(
                        "call {} recorded as {} ({:?}s)",
                        session.id,
                        session.status,
                        session.duration_seconds
                    ),
                    Err(StoreError::InvalidTransition { .. }) => {}
                    Err(e) => tracing::warn!("failed to record call end: {}", e),
                }
            }
            self.set_phase(CallPhase::Ended);
        }
    }
}

impl Drop for CallOrchestrator {
    fn drop(&mut self) {
        self.end();
    }
}

// ============================================================================
// TESTS
// ============================================================================
