use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::webrtc_utils::opus_capability;
use crate::error::{Result, SignalError};

/// Capture processing requested from the microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl AudioConstraints {
    /// Settings for a two-way voice call.
    pub fn voice() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// The participant's own microphone, exposed as an Opus sample track.
#[derive(Clone)]
pub struct LocalAudio {
    track: Arc<TrackLocalStaticSample>,
    constraints: AudioConstraints,
    live: Arc<AtomicBool>,
}

impl LocalAudio {
    pub fn new(track: Arc<TrackLocalStaticSample>, constraints: AudioConstraints) -> Self {
        Self {
            track,
            constraints,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    pub fn constraints(&self) -> AudioConstraints {
        self.constraints
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Push one encoded frame. Fails once the audio has been stopped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if !self.is_live() {
            return Err(SignalError::MediaAccessDenied(
                "local audio has been stopped".to_string(),
            ));
        }
        self.track.write_sample(sample).await?;
        Ok(())
    }

    pub fn stop(&self) {
        if self.live.swap(false, Ordering::AcqRel) {
            tracing::debug!(track_id = %self.track.id(), "Local audio stopped");
        }
    }
}

impl std::fmt::Debug for LocalAudio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAudio")
            .field("track_id", &self.track.id())
            .field("constraints", &self.constraints)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Platform access to the microphone.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Fails with `MediaAccessDenied` when the platform refuses the microphone.
    async fn acquire(&self, constraints: AudioConstraints) -> Result<LocalAudio>;
}

/// Hands out an Opus sample track that the embedding application feeds with
/// encoded frames through [`LocalAudio::write_sample`].
pub struct SampleTrackSource {
    stream_id: String,
    permitted: AtomicBool,
}

impl SampleTrackSource {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            permitted: AtomicBool::new(true),
        }
    }

    /// Record the platform's answer to the microphone permission prompt.
    pub fn set_permission(&self, granted: bool) {
        self.permitted.store(granted, Ordering::Release);
    }
}

#[async_trait]
impl AudioSource for SampleTrackSource {
    async fn acquire(&self, constraints: AudioConstraints) -> Result<LocalAudio> {
        if !self.permitted.load(Ordering::Acquire) {
            return Err(SignalError::MediaAccessDenied(
                "permission to use the microphone was refused".to_string(),
            ));
        }

        let track = Arc::new(TrackLocalStaticSample::new(
            opus_capability(),
            "audio".to_string(),
            self.stream_id.clone(),
        ));

        tracing::debug!(stream_id = %self.stream_id, ?constraints, "Local audio acquired");
        Ok(LocalAudio::new(track, constraints))
    }
}
