//! cpal-backed capture devices.
//!
//! Microphone capture resamples to 48kHz mono into a ring buffer that the
//! encoder stage drains in 20ms frames. Actual camera IO lives with the
//! external capture stage; the default backend only reserves the video
//! track's device slot so acquisition and release stay symmetrical.

use super::{
    AudioConstraints, AudioSource, DeviceSource, MediaBackend, MediaError, VideoConstraints,
    FRAME_SIZE,
};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Ring buffer headroom: ten frames of captured audio.
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// FRAME READER
// ============================================================================

/// Consumer handle onto the capture ring buffer.
#[derive(Clone)]
pub struct FrameReader {
    buffer: Arc<Mutex<HeapRb<f32>>>,
    level: Arc<Mutex<f32>>,
}

impl FrameReader {
    pub(crate) fn new(buffer: Arc<Mutex<HeapRb<f32>>>, level: Arc<Mutex<f32>>) -> Self {
        Self { buffer, level }
    }

    /// A reader with no producer behind it; used by test backends.
    #[cfg(test)]
    pub(crate) fn idle() -> Self {
        Self::new(
            Arc::new(Mutex::new(HeapRb::new(FRAME_SIZE))),
            Arc::new(Mutex::new(0.0)),
        )
    }

    /// Reads one 20ms frame of captured PCM, if enough samples are buffered.
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.buffer.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }
        let mut frame = Vec::with_capacity(FRAME_SIZE);
        for _ in 0..FRAME_SIZE {
            if let Some(sample) = buffer.try_pop() {
                frame.push(sample);
            }
        }
        Some(frame)
    }

    /// Input level (RMS, 0.0 - 1.0) of the latest capture callback.
    pub fn level(&self) -> f32 {
        *self.level.lock()
    }
}

// ============================================================================
// DEVICE HANDLES
// ============================================================================

/// Holds the live cpal input stream; dropping it releases the microphone.
struct AudioCapture {
    stream: Option<Stream>,
}

// cpal::Stream is not Send; the stream is only ever dropped through this
// handle, never driven from another thread.
unsafe impl Send for AudioCapture {}

impl DeviceSource for AudioCapture {
    fn stop(&mut self) {
        self.stream = None;
        tracing::info!("audio capture stopped");
    }
}

/// Exclusive claim on the camera slot. Frame production is the capture
/// stage's job; stopping releases the claim.
struct VideoSlot {
    width: u32,
    height: u32,
    held: bool,
}

impl DeviceSource for VideoSlot {
    fn stop(&mut self) {
        if self.held {
            self.held = false;
            tracing::info!("video capture slot {}x{} released", self.width, self.height);
        }
    }
}

// ============================================================================
// CPAL BACKEND
// ============================================================================

/// Default [`MediaBackend`] over the host's audio devices.
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    fn find_best_input_config(
        device: &Device,
        target_rate: u32,
    ) -> Result<StreamConfig, MediaError> {
        let configs: Vec<SupportedStreamConfigRange> = device
            .supported_input_configs()
            .map_err(|e| MediaError::UnsupportedConfig(e.to_string()))?
            .collect();

        let target = cpal::SampleRate(target_rate);

        // Prefer exactly the target rate in f32.
        for config in &configs {
            if config.min_sample_rate() <= target
                && config.max_sample_rate() >= target
                && config.sample_format() == SampleFormat::F32
            {
                return Ok(config.with_sample_rate(target).into());
            }
        }

        // Any f32 config; capture resamples.
        for config in &configs {
            if config.sample_format() == SampleFormat::F32 {
                return Ok(config.with_max_sample_rate().into());
            }
        }

        if let Some(config) = configs.first() {
            return Ok(config.with_max_sample_rate().into());
        }

        Err(MediaError::UnsupportedConfig(
            "no suitable audio input configuration found".to_string(),
        ))
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaBackend for CpalBackend {
    fn open_audio(
        &self,
        constraints: &AudioConstraints,
        enabled: Arc<AtomicBool>,
    ) -> Result<AudioSource, MediaError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or_else(|| {
            MediaError::DeviceUnavailable("no audio input device found".to_string())
        })?;

        let config = Self::find_best_input_config(&device, constraints.sample_rate)?;

        tracing::info!(
            "starting audio capture: {} Hz, {} channels (echo_cancellation={}, noise_suppression={})",
            config.sample_rate.0,
            config.channels,
            constraints.echo_cancellation,
            constraints.noise_suppression,
        );

        let buffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));
        let level = Arc::new(Mutex::new(0.0f32));

        let capture_buffer = Arc::clone(&buffer);
        let input_level = Arc::clone(&level);
        let target_sample_rate = constraints.sample_rate;
        let source_sample_rate = config.sample_rate.0;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let rms: f32 =
                        (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    *input_level.lock() = rms.min(1.0);

                    // Disabled track: keep metering, drop the samples.
                    if !enabled.load(Ordering::SeqCst) {
                        return;
                    }

                    let samples: Vec<f32> = if source_sample_rate != target_sample_rate {
                        // Linear resampling to the target rate.
                        let ratio = target_sample_rate as f32 / source_sample_rate as f32;
                        let new_len = (data.len() as f32 * ratio) as usize;
                        (0..new_len)
                            .map(|i| {
                                let src_idx = i as f32 / ratio;
                                let idx = src_idx as usize;
                                let frac = src_idx - idx as f32;
                                let s1 = data.get(idx).copied().unwrap_or(0.0);
                                let s2 = data.get(idx + 1).copied().unwrap_or(s1);
                                s1 + (s2 - s1) * frac
                            })
                            .collect()
                    } else {
                        data.to_vec()
                    };

                    let mut buffer = capture_buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("audio capture error: {}", err);
                },
                None,
            )
            .map_err(classify_build_error)?;

        stream.play().map_err(classify_play_error)?;

        Ok(AudioSource {
            handle: Box::new(AudioCapture {
                stream: Some(stream),
            }),
            frames: FrameReader::new(buffer, level),
        })
    }

    fn open_video(
        &self,
        constraints: &VideoConstraints,
    ) -> Result<Box<dyn DeviceSource>, MediaError> {
        tracing::info!(
            "reserving video capture slot: {}x{}",
            constraints.width,
            constraints.height
        );
        Ok(Box::new(VideoSlot {
            width: constraints.width,
            height: constraints.height,
            held: true,
        }))
    }
}

// ============================================================================
// ERROR CLASSIFICATION
// ============================================================================

/// Splits backend failures into the two user-actionable kinds: a device
/// held elsewhere ("close the other app") vs. a denied OS permission
/// ("grant access").
fn classify_build_error(error: cpal::BuildStreamError) -> MediaError {
    match error {
        cpal::BuildStreamError::DeviceNotAvailable => MediaError::DeviceUnavailable(
            "audio device is already in use or was disconnected".to_string(),
        ),
        cpal::BuildStreamError::StreamConfigNotSupported => {
            MediaError::UnsupportedConfig("stream configuration not supported".to_string())
        }
        cpal::BuildStreamError::BackendSpecific { err } => classify_backend_message(err.description),
        other => MediaError::DeviceUnavailable(other.to_string()),
    }
}

fn classify_play_error(error: cpal::PlayStreamError) -> MediaError {
    match error {
        cpal::PlayStreamError::DeviceNotAvailable => MediaError::DeviceUnavailable(
            "audio device is already in use or was disconnected".to_string(),
        ),
        cpal::PlayStreamError::BackendSpecific { err } => classify_backend_message(err.description),
    }
}

fn classify_backend_message(description: String) -> MediaError {
    let lower = description.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not permitted") {
        MediaError::PermissionDenied(description)
    } else {
        MediaError::DeviceUnavailable(description)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_not_available_maps_to_unavailable() {
        let error = classify_build_error(cpal::BuildStreamError::DeviceNotAvailable);
        assert!(matches!(error, MediaError::DeviceUnavailable(_)));
    }

    #[test]
    fn permission_messages_map_to_permission_denied() {
        let error = classify_build_error(cpal::BuildStreamError::BackendSpecific {
            err: cpal::BackendSpecificError {
                description: "Access denied: microphone permission not granted".to_string(),
            },
        });
        assert!(matches!(error, MediaError::PermissionDenied(_)));
    }

    #[test]
    fn other_backend_messages_map_to_unavailable() {
        let error = classify_build_error(cpal::BuildStreamError::BackendSpecific {
            err: cpal::BackendSpecificError {
                description: "device disappeared".to_string(),
            },
        });
        assert!(matches!(error, MediaError::DeviceUnavailable(_)));
    }

    #[test]
    fn frame_reader_needs_a_full_frame() {
        let buffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));
        let reader = FrameReader::new(Arc::clone(&buffer), Arc::new(Mutex::new(0.0)));

        assert!(reader.read_frame().is_none());

        {
            let mut b = buffer.lock();
            for i in 0..FRAME_SIZE {
                let _ = b.try_push(i as f32);
            }
        }
        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.len(), FRAME_SIZE);
        assert!(reader.read_frame().is_none());
    }
}
