//! Local media stream and track ownership.

use super::capture::FrameReader;
use super::{AudioSource, DeviceSource};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// Stream id shared by every local track of a call.
const STREAM_ID: &str = "mentorlink";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// One locally captured track: the RTP-facing half handed to the peer
/// connection, plus the exclusive device handle behind it.
pub struct LocalTrack {
    kind: TrackKind,
    rtp: Arc<TrackLocalStaticRTP>,
    enabled: Arc<AtomicBool>,
    frames: Option<FrameReader>,
    source: Mutex<Option<Box<dyn DeviceSource>>>,
}

impl LocalTrack {
    pub(crate) fn audio(enabled: Arc<AtomicBool>, source: AudioSource) -> Self {
        let rtp = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: super::SAMPLE_RATE,
                channels: super::CHANNELS,
                ..Default::default()
            },
            "audio".to_string(),
            STREAM_ID.to_string(),
        ));
        Self {
            kind: TrackKind::Audio,
            rtp,
            enabled,
            frames: Some(source.frames),
            source: Mutex::new(Some(source.handle)),
        }
    }

    pub(crate) fn video(enabled: Arc<AtomicBool>, handle: Box<dyn DeviceSource>) -> Self {
        let rtp = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90_000,
                ..Default::default()
            },
            "video".to_string(),
            STREAM_ID.to_string(),
        ));
        Self {
            kind: TrackKind::Video,
            rtp,
            enabled,
            frames: None,
            source: Mutex::new(Some(handle)),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// The RTP half attached to the peer connection.
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticRTP> {
        Arc::clone(&self.rtp)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        tracing::debug!("{} track enabled: {}", self.kind, enabled);
    }

    /// PCM frame reader for the encoder stage; audio tracks only.
    pub fn frames(&self) -> Option<&FrameReader> {
        self.frames.as_ref()
    }

    /// Releases the underlying device. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(mut source) = self.source.lock().take() {
            source.stop();
            tracing::debug!("stopped local {} track", self.kind);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.source.lock().is_none()
    }
}

/// The set of tracks acquired for one call. Cheap to clone; all clones
/// share the same tracks, mirroring how a rendered stream and the
/// negotiation core see the same devices.
#[derive(Clone)]
pub struct LocalMediaStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    tracks: Vec<LocalTrack>,
    stopped: AtomicBool,
}

impl LocalMediaStream {
    pub(crate) fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                tracks,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.inner.tracks
    }

    pub fn rtp_tracks(&self) -> Vec<Arc<TrackLocalStaticRTP>> {
        self.inner.tracks.iter().map(|t| t.rtp_track()).collect()
    }

    pub fn has_track(&self, kind: TrackKind) -> bool {
        self.inner.tracks.iter().any(|t| t.kind() == kind)
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.inner.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
    }

    /// Stops every track, releasing the devices. Runs once; later calls
    /// are no-ops.
    pub fn stop_all(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for track in &self.inner.tracks {
            track.stop();
        }
        tracing::info!("local media stream stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Microphone input level (RMS, 0.0 - 1.0).
    pub fn input_level(&self) -> f32 {
        self.inner
            .tracks
            .iter()
            .find_map(|t| t.frames())
            .map(|f| f.level())
            .unwrap_or(0.0)
    }
}

impl std::fmt::Debug for LocalMediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMediaStream")
            .field("tracks", &self.inner.tracks.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
