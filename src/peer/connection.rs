//! WebRTC peer connection wrapper.

use crate::media::LocalMediaStream;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const EVENT_CAPACITY: usize = 100;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("no active peer connection")]
    NoConnection,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Notifications from the underlying connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A locally gathered ICE candidate to relay to the peer, serialized
    /// candidate-init JSON. Fired for every candidate, trickled ones
    /// included.
    LocalCandidate { candidate: String },

    /// A remote track arrived; fetch it via [`PeerManager::remote_tracks`].
    RemoteTrack,

    /// First transition into the connected state. Fired at most once per
    /// connection.
    Connected,

    /// The connection failed or disconnected after negotiation began.
    ConnectionLost,
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Public STUN servers; enough for the large majority of home networks.
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}

// ============================================================================
// PEER MANAGER
// ============================================================================

/// Owns at most one peer connection for one call attempt.
pub struct PeerManager {
    ice_servers: Vec<RTCIceServer>,
    pc: Mutex<Option<Arc<RTCPeerConnection>>>,
    create_lock: tokio::sync::Mutex<()>,
    /// Candidates received before the remote description was set.
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    remote_description_set: AtomicBool,
    connected_once: Arc<AtomicBool>,
    remote_tracks: Arc<Mutex<Vec<Arc<TrackRemote>>>>,
    event_tx: broadcast::Sender<PeerEvent>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::with_ice_servers(default_ice_servers())
    }

    pub fn with_ice_servers(ice_servers: Vec<RTCIceServer>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            ice_servers,
            pc: Mutex::new(None),
            create_lock: tokio::sync::Mutex::new(()),
            pending_candidates: Mutex::new(Vec::new()),
            remote_description_set: AtomicBool::new(false),
            connected_once: Arc::new(AtomicBool::new(false)),
            remote_tracks: Arc::new(Mutex::new(Vec::new())),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.event_tx.subscribe()
    }

    pub fn has_connection(&self) -> bool {
        self.pc.lock().is_some()
    }

    pub fn connection(&self) -> Option<Arc<RTCPeerConnection>> {
        self.pc.lock().clone()
    }

    /// Tracks received from the remote peer so far.
    pub fn remote_tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.remote_tracks.lock().clone()
    }

    #[cfg(test)]
    pub(crate) fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.lock().len()
    }

    /// Creates the peer connection, or returns the existing one.
    ///
    /// Idempotent so re-entrant calls into the creation path (a rapid
    /// double start, an offer racing the local start) cannot produce two
    /// connections for one call attempt.
    pub async fn create(&self) -> Result<Arc<RTCPeerConnection>, PeerError> {
        let _creating = self.create_lock.lock().await;

        if let Some(pc) = self.pc.lock().clone() {
            tracing::debug!("reusing existing peer connection");
            return Ok(pc);
        }

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| PeerError::WebRtc(e.to_string()))?,
        );

        self.install_handlers(&pc);
        *self.pc.lock() = Some(Arc::clone(&pc));

        tracing::info!("peer connection created");
        Ok(pc)
    }

    /// Adds every track of the local stream to the connection.
    pub async fn attach_local_tracks(&self, stream: &LocalMediaStream) -> Result<(), PeerError> {
        let pc = self.connection().ok_or(PeerError::NoConnection)?;
        for track in stream.rtp_tracks() {
            pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| PeerError::WebRtc(e.to_string()))?;
        }
        Ok(())
    }

    /// Creates the SDP offer and sets it as the local description before
    /// handing it back for relay.
    pub async fn create_offer(&self) -> Result<String, PeerError> {
        let pc = self.connection().ok_or(PeerError::NoConnection)?;

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        Ok(offer.sdp)
    }

    /// Applies the peer's offer and produces the answer, local description
    /// already set.
    pub async fn apply_remote_offer(&self, offer_sdp: String) -> Result<String, PeerError> {
        let pc = self.connection().ok_or(PeerError::NoConnection)?;

        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| PeerError::InvalidSdp(e.to_string()))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;
        self.remote_description_set.store(true, Ordering::SeqCst);
        self.flush_pending_candidates(&pc).await;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        Ok(answer.sdp)
    }

    /// Applies the peer's answer to our outstanding offer.
    pub async fn apply_remote_answer(&self, answer_sdp: String) -> Result<(), PeerError> {
        let pc = self.connection().ok_or(PeerError::NoConnection)?;

        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| PeerError::InvalidSdp(e.to_string()))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;
        self.remote_description_set.store(true, Ordering::SeqCst);
        self.flush_pending_candidates(&pc).await;

        Ok(())
    }

    /// Adds a relayed ICE candidate. Candidates arriving before the remote
    /// description are queued and applied once it lands, never dropped.
    pub async fn add_remote_candidate(&self, candidate_json: &str) -> Result<(), PeerError> {
        let candidate: RTCIceCandidateInit = serde_json::from_str(candidate_json)
            .map_err(|e| PeerError::InvalidCandidate(e.to_string()))?;

        match self.connection() {
            Some(pc) if self.remote_description_set.load(Ordering::SeqCst) => pc
                .add_ice_candidate(candidate)
                .await
                .map_err(|e| PeerError::WebRtc(e.to_string())),
            _ => {
                tracing::debug!("queueing ICE candidate until remote description is set");
                self.pending_candidates.lock().push(candidate);
                Ok(())
            }
        }
    }

    async fn flush_pending_candidates(&self, pc: &Arc<RTCPeerConnection>) {
        let queued: Vec<RTCIceCandidateInit> = self.pending_candidates.lock().drain(..).collect();
        if queued.is_empty() {
            return;
        }
        tracing::debug!("applying {} queued ICE candidate(s)", queued.len());
        for candidate in queued {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::warn!("failed to apply queued ICE candidate: {}", e);
            }
        }
    }

    /// Takes the connection out and clears all negotiation state, without
    /// awaiting anything. Once this returns, `create` builds a fresh
    /// connection; the caller is responsible for closing the returned one.
    pub fn detach(&self) -> Option<Arc<RTCPeerConnection>> {
        self.remote_tracks.lock().clear();
        self.pending_candidates.lock().clear();
        self.remote_description_set.store(false, Ordering::SeqCst);
        self.connected_once.store(false, Ordering::SeqCst);
        self.pc.lock().take()
    }

    /// Closes and releases the connection. Safe to call repeatedly.
    pub async fn close(&self) {
        if let Some(pc) = self.detach() {
            if let Err(e) = pc.close().await {
                tracing::warn!("error closing peer connection: {}", e);
            }
            tracing::info!("peer connection closed");
        }
    }

    fn install_handlers(&self, pc: &Arc<RTCPeerConnection>) {
        // Connection state: report Connected exactly once, losses always.
        let event_tx = self.event_tx.clone();
        let connected_once = Arc::clone(&self.connected_once);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::info!("peer connection state: {:?}", state);
            match state {
                RTCPeerConnectionState::Connected => {
                    if !connected_once.swap(true, Ordering::SeqCst) {
                        let _ = event_tx.send(PeerEvent::Connected);
                    }
                }
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                    let _ = event_tx.send(PeerEvent::ConnectionLost);
                }
                _ => {}
            }
            Box::pin(async {})
        }));

        // Local ICE candidates: forward every one for relay.
        let event_tx = self.event_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => match serde_json::to_string(&init) {
                        Ok(candidate) => {
                            let _ = event_tx.send(PeerEvent::LocalCandidate { candidate });
                        }
                        Err(e) => tracing::warn!("failed to serialize ICE candidate: {}", e),
                    },
                    Err(e) => tracing::warn!("failed to read ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        // Remote tracks.
        let event_tx = self.event_tx.clone();
        let remote_tracks = Arc::clone(&self.remote_tracks);
        pc.on_track(Box::new(move |track, _, _| {
            let event_tx = event_tx.clone();
            let remote_tracks = remote_tracks.clone();
            Box::pin(async move {
                tracing::info!("received remote track: {:?}", track.codec());
                remote_tracks.lock().push(track);
                let _ = event_tx.send(PeerEvent::RemoteTrack);
            })
        }));
    }
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerManager")
            .field("has_connection", &self.has_connection())
            .field("remote_tracks", &self.remote_tracks.lock().len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::FakeBackend;
    use crate::media::MediaAcquirer;

    #[tokio::test]
    async fn create_returns_the_same_connection() {
        let manager = PeerManager::new();
        let first = manager.create().await.unwrap();
        let second = manager.create().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let manager = PeerManager::new();
        manager.create().await.unwrap();
        assert!(manager.has_connection());

        manager.close().await;
        manager.close().await;
        assert!(!manager.has_connection());
        assert!(manager.remote_tracks().is_empty());
    }

    #[tokio::test]
    async fn detach_frees_the_slot_before_the_old_connection_closes() {
        let manager = PeerManager::new();
        let first = manager.create().await.unwrap();

        let taken = manager.detach().unwrap();
        assert!(Arc::ptr_eq(&first, &taken));
        assert!(!manager.has_connection());

        // A create racing the old connection's close must get a fresh one.
        let second = manager.create().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        taken.close().await.unwrap();
        manager.close().await;
    }

    #[tokio::test]
    async fn close_without_create_is_a_no_op() {
        let manager = PeerManager::new();
        manager.close().await;
        assert!(!manager.has_connection());
    }

    #[tokio::test]
    async fn sdp_ops_require_a_connection() {
        let manager = PeerManager::new();
        assert!(matches!(
            manager.create_offer().await,
            Err(PeerError::NoConnection)
        ));
    }

    #[tokio::test]
    async fn offer_answer_exchange_sets_descriptions() {
        let caller = PeerManager::new();
        let callee = PeerManager::new();

        let media = MediaAcquirer::new(FakeBackend::new());
        let stream = media.acquire(true, false).unwrap();

        caller.create().await.unwrap();
        caller.attach_local_tracks(&stream).await.unwrap();
        let offer = caller.create_offer().await.unwrap();
        assert!(offer.contains("v=0"));

        callee.create().await.unwrap();
        let answer = callee.apply_remote_offer(offer).await.unwrap();
        assert!(answer.contains("v=0"));

        caller.apply_remote_answer(answer).await.unwrap();

        caller.close().await;
        callee.close().await;
    }

    #[tokio::test]
    async fn early_candidates_are_queued_and_flushed() {
        let caller = PeerManager::new();
        let callee = PeerManager::new();

        let media = MediaAcquirer::new(FakeBackend::new());
        let stream = media.acquire(true, false).unwrap();

        caller.create().await.unwrap();
        caller.attach_local_tracks(&stream).await.unwrap();
        let offer = caller.create_offer().await.unwrap();

        // Candidate arrives before the remote description: must be queued,
        // not dropped and not an error.
        let early = serde_json::json!({
            "candidate": "candidate:1 1 udp 2130706431 127.0.0.1 54321 typ host"
        })
        .to_string();
        caller.add_remote_candidate(&early).await.unwrap();
        assert_eq!(caller.pending_candidate_count(), 1);

        callee.create().await.unwrap();
        let answer = callee.apply_remote_offer(offer).await.unwrap();
        caller.apply_remote_answer(answer).await.unwrap();
        assert_eq!(caller.pending_candidate_count(), 0);

        caller.close().await;
        callee.close().await;
    }

    #[tokio::test]
    async fn malformed_candidate_json_is_rejected() {
        let manager = PeerManager::new();
        manager.create().await.unwrap();
        let result = manager.add_remote_candidate("not json").await;
        assert!(matches!(result, Err(PeerError::InvalidCandidate(_))));
        manager.close().await;
    }
}
