//! Local media acquisition with a quality fallback ladder
//!
//! Camera and microphone permission and device capability vary widely, so a
//! single constraint set would make call setup fragile. Acquisition walks a
//! ladder instead: high-quality constraints, then medium, then bare minimum,
//! and for video calls a final audio-only fallback. The first rung that
//! yields a usable stream wins; anything a failed rung opened is stopped
//! before the next rung is tried.

use crate::types::CallType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Device-level capture errors reported by a [`MediaSource`]
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The user or platform denied access to the device
    #[error("capture permission denied: {0}")]
    PermissionDenied(String),

    /// No device satisfies the requested constraints
    #[error("no matching capture device: {0}")]
    NoDevice(String),

    /// The device exists but could not be started
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
}

/// Media acquisition errors surfaced to the call manager
#[derive(Error, Debug)]
pub enum MediaError {
    /// Every rung of the ladder failed, including the audio-only fallback
    #[error("no camera or microphone access")]
    NoDeviceAccess {
        /// Device error from the last rung attempted
        #[source]
        cause: CaptureError,
    },
}

/// Kind of a single captured track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    /// Microphone track
    Audio,
    /// Camera track
    Video,
}

/// One captured device track.
///
/// Stopping is idempotent; the first call releases the device, later calls
/// are no-ops.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: Uuid,
    kind: TrackKind,
    stopped: Arc<AtomicBool>,
}

impl MediaTrack {
    /// Create a new live track
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Track identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Track kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Stop the track. Returns `true` if this call performed the stop.
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    /// Check whether the track has been stopped
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// A captured local stream: a bundle of tracks with shared ownership.
///
/// Clones share the same underlying tracks; stopping through any clone stops
/// them for all.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: Uuid,
    tracks: Arc<Vec<MediaTrack>>,
}

impl MediaStream {
    /// Create a stream from captured tracks
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tracks: Arc::new(tracks),
        }
    }

    /// Stream identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The tracks in this stream
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// Check for a live or stopped audio track
    pub fn has_audio(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Audio)
    }

    /// Check for a live or stopped video track
    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Video)
    }

    /// Stop every track individually. Returns how many this call stopped.
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }

    /// Check whether every track has been stopped
    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(MediaTrack::is_stopped)
    }
}

/// Audio processing features requested from the capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioProcessing {
    /// Acoustic echo cancellation
    pub echo_cancellation: bool,
    /// Background noise suppression
    pub noise_suppression: bool,
    /// Automatic gain control
    pub auto_gain_control: bool,
}

impl AudioProcessing {
    /// Full processing chain
    pub fn full() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }

    /// Echo cancellation only
    pub fn reduced() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: false,
            auto_gain_control: false,
        }
    }
}

/// Video portion of a constraint set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoRequest {
    /// No video track
    Off,
    /// Any available camera, no resolution preference
    Any,
    /// A resolution target with an upper bound
    Bounded {
        /// Preferred width in pixels
        ideal_width: u32,
        /// Preferred height in pixels
        ideal_height: u32,
        /// Maximum accepted width
        max_width: u32,
        /// Maximum accepted height
        max_height: u32,
    },
}

impl VideoRequest {
    /// Check whether video is requested at all
    pub fn wants_video(&self) -> bool {
        !matches!(self, VideoRequest::Off)
    }
}

/// One rung's worth of capture constraints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Request a microphone track
    pub audio: bool,
    /// Audio processing features; `None` means plain boolean audio
    pub audio_processing: Option<AudioProcessing>,
    /// Video request for this rung
    pub video: VideoRequest,
}

impl MediaConstraints {
    /// Plain audio-only constraints
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            audio_processing: None,
            video: VideoRequest::Off,
        }
    }
}

/// Quality level the ladder ended up acquiring at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityTier {
    /// Full processing and bounded high-resolution video
    High,
    /// Reduced processing and low-resolution video
    Medium,
    /// Boolean constraints only
    Minimum,
    /// Video was requested but only audio could be captured
    AudioFallback,
}

/// Result of a successful walk down the ladder
#[derive(Debug, Clone)]
pub struct AcquiredMedia {
    /// The captured stream, exclusively owned by the caller
    pub stream: MediaStream,
    /// Which rung produced it
    pub tier: QualityTier,
}

impl AcquiredMedia {
    /// Check whether a video call was degraded to audio only
    pub fn is_degraded(&self) -> bool {
        self.tier == QualityTier::AudioFallback
    }
}

/// Constraint values for each rung of the ladder.
///
/// Defaults match common practice: 640×480 ideal capped at 1280×720 for the
/// high rung, 320×240 capped at 640×480 for the medium rung.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaLadder {
    /// High rung ideal resolution (width, height)
    pub high_ideal: (u32, u32),
    /// High rung resolution cap
    pub high_max: (u32, u32),
    /// Medium rung ideal resolution
    pub medium_ideal: (u32, u32),
    /// Medium rung resolution cap
    pub medium_max: (u32, u32),
}

impl Default for MediaLadder {
    fn default() -> Self {
        Self {
            high_ideal: (640, 480),
            high_max: (1280, 720),
            medium_ideal: (320, 240),
            medium_max: (640, 480),
        }
    }
}

impl MediaLadder {
    /// The rungs to attempt for a call type, in order.
    ///
    /// Video calls get a trailing audio-only fallback rung; audio calls stop
    /// at the minimum rung.
    pub fn rungs(&self, call_type: CallType) -> Vec<(QualityTier, MediaConstraints)> {
        let video = call_type.has_video();
        let bounded = |ideal: (u32, u32), max: (u32, u32)| VideoRequest::Bounded {
            ideal_width: ideal.0,
            ideal_height: ideal.1,
            max_width: max.0,
            max_height: max.1,
        };

        let mut rungs = vec![
            (
                QualityTier::High,
                MediaConstraints {
                    audio: true,
                    audio_processing: Some(AudioProcessing::full()),
                    video: if video {
                        bounded(self.high_ideal, self.high_max)
                    } else {
                        VideoRequest::Off
                    },
                },
            ),
            (
                QualityTier::Medium,
                MediaConstraints {
                    audio: true,
                    audio_processing: Some(AudioProcessing::reduced()),
                    video: if video {
                        bounded(self.medium_ideal, self.medium_max)
                    } else {
                        VideoRequest::Off
                    },
                },
            ),
            (
                QualityTier::Minimum,
                MediaConstraints {
                    audio: true,
                    audio_processing: None,
                    video: if video { VideoRequest::Any } else { VideoRequest::Off },
                },
            ),
        ];

        if video {
            rungs.push((QualityTier::AudioFallback, MediaConstraints::audio_only()));
        }

        rungs
    }
}

/// Source of local capture devices.
///
/// Implement this for the platform's capture layer. `capture` either returns
/// a stream holding every track it opened, or an error having opened
/// nothing. A returned stream that does not satisfy the constraints is
/// treated as a failed rung by [`acquire`] and stopped.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Open local devices for the given constraints
    async fn capture(&self, constraints: &MediaConstraints) -> Result<MediaStream, CaptureError>;
}

/// Walk the quality ladder until a rung yields a satisfying stream.
///
/// # Errors
///
/// Returns [`MediaError::NoDeviceAccess`] when every rung failed, carrying
/// the last device error as its cause.
pub async fn acquire(
    source: &dyn MediaSource,
    call_type: CallType,
    ladder: &MediaLadder,
) -> Result<AcquiredMedia, MediaError> {
    let rungs = ladder.rungs(call_type);
    let mut last_err = CaptureError::NoDevice("no acquisition attempted".to_string());

    for (tier, constraints) in rungs {
        match source.capture(&constraints).await {
            Ok(stream) => {
                if satisfies(&stream, &constraints) {
                    tracing::info!(
                        tier = ?tier,
                        audio = stream.has_audio(),
                        video = stream.has_video(),
                        "local media acquired"
                    );
                    return Ok(AcquiredMedia { stream, tier });
                }
                // Partial capture: some tracks opened but the rung was not
                // satisfied. Stop them before trying the next rung.
                let stopped = stream.stop_all();
                tracing::debug!(
                    tier = ?tier,
                    stopped_tracks = stopped,
                    "partial capture discarded"
                );
                last_err = CaptureError::NoDevice(format!(
                    "capture did not satisfy {:?} constraints",
                    tier
                ));
            }
            Err(err) => {
                tracing::debug!(tier = ?tier, error = %err, "capture rung failed");
                last_err = err;
            }
        }
    }

    tracing::warn!(error = %last_err, "media acquisition exhausted the ladder");
    Err(MediaError::NoDeviceAccess { cause: last_err })
}

fn satisfies(stream: &MediaStream, constraints: &MediaConstraints) -> bool {
    if constraints.audio && !stream.has_audio() {
        return false;
    }
    if constraints.video.wants_video() && !stream.has_video() {
        return false;
    }
    true
}

/// Synthetic capture source producing silent/black tracks.
///
/// Useful for loopback runs and tests where no hardware is present. Can be
/// configured to refuse video or all capture, to exercise the ladder.
#[derive(Debug, Default)]
pub struct SyntheticSource {
    deny_video: bool,
    deny_all: bool,
}

impl SyntheticSource {
    /// A source where every capture succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// A source with a microphone but no working camera
    pub fn without_camera() -> Self {
        Self {
            deny_video: true,
            deny_all: false,
        }
    }

    /// A source where all capture is denied
    pub fn unavailable() -> Self {
        Self {
            deny_video: false,
            deny_all: true,
        }
    }
}

#[async_trait]
impl MediaSource for SyntheticSource {
    async fn capture(&self, constraints: &MediaConstraints) -> Result<MediaStream, CaptureError> {
        if self.deny_all {
            return Err(CaptureError::PermissionDenied(
                "synthetic source configured to deny capture".to_string(),
            ));
        }
        if constraints.video.wants_video() && self.deny_video {
            return Err(CaptureError::NoDevice(
                "synthetic source has no camera".to_string(),
            ));
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio));
        }
        if constraints.video.wants_video() {
            tracks.push(MediaTrack::new(TrackKind::Video));
        }
        Ok(MediaStream::new(tracks))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Capture source driven by a script of outcomes, one per rung attempt.
    struct ScriptedSource {
        script: Mutex<VecDeque<ScriptedOutcome>>,
        handed_out: Mutex<Vec<MediaStream>>,
    }

    enum ScriptedOutcome {
        Deny,
        AudioOnly,
        Full,
    }

    impl ScriptedSource {
        fn new(script: Vec<ScriptedOutcome>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                handed_out: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MediaSource for ScriptedSource {
        async fn capture(
            &self,
            constraints: &MediaConstraints,
        ) -> Result<MediaStream, CaptureError> {
            let outcome = self
                .script
                .lock()
                .pop_front()
                .unwrap_or(ScriptedOutcome::Deny);
            let stream = match outcome {
                ScriptedOutcome::Deny => {
                    return Err(CaptureError::PermissionDenied("scripted".to_string()))
                }
                ScriptedOutcome::AudioOnly => MediaStream::new(vec![MediaTrack::new(
                    TrackKind::Audio,
                )]),
                ScriptedOutcome::Full => {
                    let mut tracks = vec![MediaTrack::new(TrackKind::Audio)];
                    if constraints.video.wants_video() {
                        tracks.push(MediaTrack::new(TrackKind::Video));
                    }
                    MediaStream::new(tracks)
                }
            };
            self.handed_out.lock().push(stream.clone());
            Ok(stream)
        }
    }

    #[test]
    fn test_ladder_rungs_for_video_call() {
        let ladder = MediaLadder::default();
        let rungs = ladder.rungs(CallType::Video);
        assert_eq!(rungs.len(), 4);
        assert_eq!(rungs[0].0, QualityTier::High);
        assert_eq!(rungs[3].0, QualityTier::AudioFallback);
        assert!(!rungs[3].1.video.wants_video());
    }

    #[test]
    fn test_ladder_rungs_for_audio_call() {
        let ladder = MediaLadder::default();
        let rungs = ladder.rungs(CallType::Audio);
        assert_eq!(rungs.len(), 3);
        assert!(rungs.iter().all(|(_, c)| !c.video.wants_video()));
    }

    #[test]
    fn test_track_stop_is_idempotent() {
        let track = MediaTrack::new(TrackKind::Audio);
        assert!(track.stop());
        assert!(!track.stop());
        assert!(track.is_stopped());
    }

    #[tokio::test]
    async fn test_first_rung_success_returns_immediately() {
        let source = ScriptedSource::new(vec![ScriptedOutcome::Full]);
        let acquired = acquire(&source, CallType::Video, &MediaLadder::default())
            .await
            .unwrap();
        assert_eq!(acquired.tier, QualityTier::High);
        assert!(acquired.stream.has_video());
        assert_eq!(source.script.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_falls_through_to_minimum() {
        // High and medium denied, minimum succeeds.
        let source = ScriptedSource::new(vec![
            ScriptedOutcome::Deny,
            ScriptedOutcome::Deny,
            ScriptedOutcome::Full,
        ]);
        let acquired = acquire(&source, CallType::Video, &MediaLadder::default())
            .await
            .unwrap();
        assert_eq!(acquired.tier, QualityTier::Minimum);
        assert!(acquired.stream.has_audio());
        assert!(acquired.stream.has_video());
    }

    #[tokio::test]
    async fn test_partial_capture_is_stopped_before_next_rung() {
        // High returns audio-only for a video rung: a partial capture that
        // must be stopped before the ladder continues.
        let source = ScriptedSource::new(vec![
            ScriptedOutcome::AudioOnly,
            ScriptedOutcome::Full,
        ]);
        let acquired = acquire(&source, CallType::Video, &MediaLadder::default())
            .await
            .unwrap();
        assert_eq!(acquired.tier, QualityTier::Medium);

        let handed = source.handed_out.lock();
        assert_eq!(handed.len(), 2);
        assert!(handed[0].is_stopped(), "partial stream must be stopped");
        assert!(!handed[1].is_stopped());
    }

    #[tokio::test]
    async fn test_video_call_degrades_to_audio_fallback() {
        let source = SyntheticSource::without_camera();
        let acquired = acquire(&source, CallType::Video, &MediaLadder::default())
            .await
            .unwrap();
        assert_eq!(acquired.tier, QualityTier::AudioFallback);
        assert!(acquired.is_degraded());
        assert!(acquired.stream.has_audio());
        assert!(!acquired.stream.has_video());
    }

    #[tokio::test]
    async fn test_exhausted_ladder_is_typed_failure() {
        let source = SyntheticSource::unavailable();
        let err = acquire(&source, CallType::Video, &MediaLadder::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::NoDeviceAccess { .. }));
    }

    #[tokio::test]
    async fn test_audio_call_does_not_fall_back_past_minimum() {
        let source = SyntheticSource::unavailable();
        let result = acquire(&source, CallType::Audio, &MediaLadder::default()).await;
        assert!(result.is_err());
    }
}
