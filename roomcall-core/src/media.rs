//! Local media model: streams, tracks, acquisition and audio analysis
//!
//! Tracks and streams here are handles onto platform media objects.
//! The engine only needs identity, kind, the enabled flag and
//! lifecycle; actual capture and playout stay with the embedder.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Errors from media acquisition
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// The user denied access or no device was available
    #[error("failed to acquire user media: {0}")]
    UserMedia(String),

    /// Screen capture could not be started
    #[error("failed to acquire screen capture: {0}")]
    Screenshare(String),
}

/// Audio or video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// An audio track
    Audio,
    /// A video track
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

/// A single media track
#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MediaTrack {
    /// Create a new enabled track of the given kind
    pub fn new(kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }

    /// Track id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Audio or video
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Whether the track is producing media
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable the track. Disabled tracks keep their slot in
    /// the connection but send silence/black.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Permanently stop the track, releasing the device
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Whether the track has been stopped
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct StreamInner {
    id: String,
    tracks: Mutex<Vec<Arc<MediaTrack>>>,
}

/// A group of tracks travelling together. Cheap to clone; clones are
/// handles onto the same stream.
#[derive(Debug, Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl MediaStream {
    /// Create a stream with the given tracks
    pub fn new(tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), tracks)
    }

    /// Create a stream with a fixed id, for streams whose identity
    /// comes from the wire
    pub fn with_id(id: String, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id,
                tracks: Mutex::new(tracks),
            }),
        }
    }

    /// Stream id, matching the id used in stream metadata
    pub fn id(&self) -> String {
        self.inner.id.clone()
    }

    /// All tracks
    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.inner.tracks.lock().clone()
    }

    /// Audio tracks only
    pub fn audio_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks()
            .into_iter()
            .filter(|t| t.kind() == TrackKind::Audio)
            .collect()
    }

    /// Video tracks only
    pub fn video_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks()
            .into_iter()
            .filter(|t| t.kind() == TrackKind::Video)
            .collect()
    }

    /// Add a track
    pub fn add_track(&self, track: Arc<MediaTrack>) {
        self.inner.tracks.lock().push(track);
    }

    /// Remove a track by id
    pub fn remove_track(&self, track_id: &str) {
        self.inner.tracks.lock().retain(|t| t.id() != track_id);
    }

    /// Duplicate the stream: a new stream id with new track objects
    /// carrying the same kinds and enabled flags
    pub fn duplicate(&self) -> MediaStream {
        let tracks = self
            .tracks()
            .iter()
            .map(|t| {
                let copy = MediaTrack::new(t.kind());
                copy.set_enabled(t.enabled());
                copy
            })
            .collect();
        MediaStream::new(tracks)
    }
}

/// Acquires and releases local capture devices
#[async_trait]
pub trait MediaHandler: Send + Sync {
    /// Acquire microphone and/or camera
    async fn get_user_media_stream(
        &self,
        audio: bool,
        video: bool,
    ) -> Result<MediaStream, MediaError>;

    /// Acquire a screen-capture stream
    async fn get_screensharing_stream(&self) -> Result<MediaStream, MediaError>;

    /// Release a user-media stream and its devices
    fn stop_user_media_stream(&self, stream: &MediaStream);

    /// Release a screen-capture stream
    fn stop_screensharing_stream(&self, stream: &MediaStream);

    /// Whether any audio input device exists
    async fn has_audio_device(&self) -> bool;

    /// Whether any video input device exists
    async fn has_video_device(&self) -> bool;
}

/// Samples the current peak volume of an analysed stream, in dB
/// relative to full scale
pub trait VolumeSampler: Send + Sync {
    /// The most recent peak magnitude in dBFS
    fn sample(&self) -> f32;
}

/// Platform audio-analysis backend: builds samplers over streams
pub trait AudioAnalysisBackend: Send + Sync {
    /// Create a sampler attached to the given stream
    fn create_sampler(&self, stream: &MediaStream) -> Box<dyn VolumeSampler>;
}

struct AnalysisInner {
    backend: Box<dyn AudioAnalysisBackend>,
    active: AtomicUsize,
}

/// A shared, reference-counted audio analysis resource.
///
/// Feeds acquire an [`AnalyserHandle`] while measuring volume and drop
/// it when they stop; the context tracks how many analysers are live
/// so embedders can suspend the platform audio pipeline when the count
/// reaches zero.
#[derive(Clone)]
pub struct AudioAnalysisContext {
    inner: Arc<AnalysisInner>,
}

impl AudioAnalysisContext {
    /// Wrap a platform backend
    pub fn new(backend: Box<dyn AudioAnalysisBackend>) -> Self {
        Self {
            inner: Arc::new(AnalysisInner {
                backend,
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// Attach an analyser to a stream
    pub fn acquire(&self, stream: &MediaStream) -> AnalyserHandle {
        let sampler = self.inner.backend.create_sampler(stream);
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        AnalyserHandle {
            sampler,
            inner: Arc::clone(&self.inner),
        }
    }

    /// How many analysers are currently live
    pub fn active_analysers(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }
}

/// A live analyser; releases its reference on drop
pub struct AnalyserHandle {
    sampler: Box<dyn VolumeSampler>,
    inner: Arc<AnalysisInner>,
}

impl AnalyserHandle {
    /// The current peak volume in dBFS
    pub fn sample(&self) -> f32 {
        self.sampler.sample()
    }
}

impl Drop for AnalyserHandle {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct FixedSampler(f32);
    impl VolumeSampler for FixedSampler {
        fn sample(&self) -> f32 {
            self.0
        }
    }

    struct FixedBackend;
    impl AudioAnalysisBackend for FixedBackend {
        fn create_sampler(&self, _stream: &MediaStream) -> Box<dyn VolumeSampler> {
            Box::new(FixedSampler(-42.0))
        }
    }

    #[test]
    fn test_stream_track_partition() {
        let stream = MediaStream::new(vec![
            MediaTrack::new(TrackKind::Audio),
            MediaTrack::new(TrackKind::Video),
            MediaTrack::new(TrackKind::Video),
        ]);
        assert_eq!(stream.audio_tracks().len(), 1);
        assert_eq!(stream.video_tracks().len(), 2);
    }

    #[test]
    fn test_duplicate_gets_new_identity() {
        let stream = MediaStream::new(vec![MediaTrack::new(TrackKind::Audio)]);
        stream.audio_tracks()[0].set_enabled(false);
        let copy = stream.duplicate();
        assert_ne!(copy.id(), stream.id());
        assert_ne!(copy.audio_tracks()[0].id(), stream.audio_tracks()[0].id());
        assert!(!copy.audio_tracks()[0].enabled());
    }

    #[test]
    fn test_analysis_refcount() {
        let ctx = AudioAnalysisContext::new(Box::new(FixedBackend));
        assert_eq!(ctx.active_analysers(), 0);
        let stream = MediaStream::new(vec![MediaTrack::new(TrackKind::Audio)]);
        let a = ctx.acquire(&stream);
        let b = ctx.acquire(&stream);
        assert_eq!(ctx.active_analysers(), 2);
        assert_eq!(a.sample(), -42.0);
        drop(a);
        assert_eq!(ctx.active_analysers(), 1);
        drop(b);
        assert_eq!(ctx.active_analysers(), 0);
    }
}
