//! Media acquisition
//!
//! Exclusive owner of the local capture devices for a call. Device IO sits
//! behind [`MediaBackend`] so the negotiation core stays testable; the
//! default backend captures microphone audio with cpal and reserves the
//! video track for the external capture/encode stage.

mod capture;
mod stream;

pub use capture::{CpalBackend, FrameReader};
pub use stream::{LocalMediaStream, LocalTrack, TrackKind};

use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Capture sample rate (48kHz, the opus native rate).
pub const SAMPLE_RATE: u32 = 48_000;

/// Capture channels (mono for voice).
pub const CHANNELS: u16 = 1;

/// Frame size in samples (20ms @ 48kHz).
pub const FRAME_SIZE: usize = 960;

/// Target video resolution.
pub const VIDEO_WIDTH: u32 = 1280;
pub const VIDEO_HEIGHT: u32 = 720;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MediaError {
    /// The device is missing, disconnected, or held by another application.
    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The OS denied access to the device.
    #[error("media permission denied: {0}")]
    PermissionDenied(String),

    #[error("unsupported media configuration: {0}")]
    UnsupportedConfig(String),
}

// ============================================================================
// CONSTRAINTS
// ============================================================================

#[derive(Debug, Clone)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: VIDEO_WIDTH,
            height: VIDEO_HEIGHT,
        }
    }
}

// ============================================================================
// BACKEND SEAM
// ============================================================================

/// An exclusive OS device handle. Stopping it releases the device.
pub trait DeviceSource: Send {
    fn stop(&mut self);
}

/// An opened audio device: the handle that releases it plus the reader the
/// encoder stage pulls PCM frames from.
pub struct AudioSource {
    pub handle: Box<dyn DeviceSource>,
    pub frames: FrameReader,
}

/// Opens capture devices. The `enabled` flag is shared with the track: a
/// disabled track's capture callback drops its samples (cheap mute, no
/// renegotiation).
pub trait MediaBackend: Send + Sync {
    fn open_audio(
        &self,
        constraints: &AudioConstraints,
        enabled: Arc<AtomicBool>,
    ) -> Result<AudioSource, MediaError>;

    fn open_video(
        &self,
        constraints: &VideoConstraints,
    ) -> Result<Box<dyn DeviceSource>, MediaError>;
}

// ============================================================================
// MEDIA ACQUIRER
// ============================================================================

/// Acquires and releases the local media stream for a call.
///
/// At most one stream is live per acquirer; acquiring again first stops
/// every track of the previous stream, since device handles are exclusive
/// OS resources and re-requesting a held device fails as busy.
pub struct MediaAcquirer {
    backend: Arc<dyn MediaBackend>,
    current: Mutex<Option<LocalMediaStream>>,
}

impl MediaAcquirer {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            current: Mutex::new(None),
        }
    }

    pub fn with_default_backend() -> Self {
        Self::new(Arc::new(CpalBackend::new()))
    }

    /// Acquires local capture devices and returns the stream that owns
    /// their tracks.
    pub fn acquire(
        &self,
        want_audio: bool,
        want_video: bool,
    ) -> Result<LocalMediaStream, MediaError> {
        if let Some(previous) = self.current.lock().take() {
            tracing::info!("stopping existing local stream before reacquiring");
            previous.stop_all();
        }

        let mut tracks = Vec::new();

        if want_audio {
            let enabled = Arc::new(AtomicBool::new(true));
            let source = self
                .backend
                .open_audio(&AudioConstraints::default(), Arc::clone(&enabled))?;
            tracks.push(LocalTrack::audio(enabled, source));
        }

        if want_video {
            let enabled = Arc::new(AtomicBool::new(true));
            match self.backend.open_video(&VideoConstraints::default()) {
                Ok(handle) => tracks.push(LocalTrack::video(enabled, handle)),
                Err(e) => {
                    // Release whatever was already opened for this attempt.
                    for track in &tracks {
                        track.stop();
                    }
                    return Err(e);
                }
            }
        }

        let stream = LocalMediaStream::new(tracks);
        *self.current.lock() = Some(stream.clone());

        tracing::info!("media acquired: audio={}, video={}", want_audio, want_video);
        Ok(stream)
    }

    /// Flips the enabled flag of the local audio tracks. No renegotiation.
    pub fn toggle_audio(&self, enabled: bool) {
        if let Some(stream) = self.current.lock().as_ref() {
            stream.set_enabled(TrackKind::Audio, enabled);
        }
    }

    /// Flips the enabled flag of the local video tracks. No renegotiation.
    pub fn toggle_video(&self, enabled: bool) {
        if let Some(stream) = self.current.lock().as_ref() {
            stream.set_enabled(TrackKind::Video, enabled);
        }
    }

    /// Stops every track of the current stream and forgets it.
    pub fn release(&self) {
        if let Some(stream) = self.current.lock().take() {
            stream.stop_all();
        }
    }

    pub fn current(&self) -> Option<LocalMediaStream> {
        self.current.lock().clone()
    }

    /// Microphone input level (RMS, 0.0 - 1.0) for UI metering.
    pub fn input_level(&self) -> f32 {
        self.current
            .lock()
            .as_ref()
            .map(|s| s.input_level())
            .unwrap_or(0.0)
    }
}

// ============================================================================
// TEST SUPPORT
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::media::capture::FrameReader;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records device opens and stops; can be armed to fail the next audio
    /// open (a busy camera/microphone).
    pub(crate) struct FakeBackend {
        next_audio_error: Mutex<Option<MediaError>>,
        pub opened: AtomicUsize,
        pub stopped: Arc<AtomicUsize>,
    }

    impl FakeBackend {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                next_audio_error: Mutex::new(None),
                opened: AtomicUsize::new(0),
                stopped: Arc::new(AtomicUsize::new(0)),
            })
        }

        /// The next `open_audio` fails with this error; later opens succeed.
        pub fn fail_next_audio(&self, error: MediaError) {
            *self.next_audio_error.lock() = Some(error);
        }

        pub fn open_count(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }

        pub fn stop_count(&self) -> usize {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    struct FakeSource {
        stopped: Arc<AtomicUsize>,
        done: bool,
    }

    impl DeviceSource for FakeSource {
        fn stop(&mut self) {
            if !self.done {
                self.done = true;
                self.stopped.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl MediaBackend for FakeBackend {
        fn open_audio(
            &self,
            _constraints: &AudioConstraints,
            _enabled: Arc<AtomicBool>,
        ) -> Result<AudioSource, MediaError> {
            if let Some(error) = self.next_audio_error.lock().take() {
                return Err(error);
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(AudioSource {
                handle: Box::new(FakeSource {
                    stopped: Arc::clone(&self.stopped),
                    done: false,
                }),
                frames: FrameReader::idle(),
            })
        }

        fn open_video(
            &self,
            _constraints: &VideoConstraints,
        ) -> Result<Box<dyn DeviceSource>, MediaError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSource {
                stopped: Arc::clone(&self.stopped),
                done: false,
            }))
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
