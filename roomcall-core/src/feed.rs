//! Call feeds: one audio/video stream within a call, with mute state
//! and speaking detection

use crate::media::{AnalyserHandle, AudioAnalysisContext, MediaStream};
use crate::types::StreamPurpose;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Volume above this, in dBFS, counts as speaking
pub const SPEAKING_THRESHOLD: f32 = -60.0;

/// How many recent volume samples feed the speaking decision
const SPEAKING_SAMPLE_COUNT: usize = 8;

/// How often the volume is sampled while measuring
const VOLUME_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Events emitted by a [`CallFeed`]
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Audio or video mute state changed
    MuteStateChanged {
        /// Current audio mute state
        audio_muted: bool,
        /// Current video mute state
        video_muted: bool,
    },
    /// A fresh volume sample arrived (dBFS)
    VolumeChanged(f32),
    /// The speaking state flipped
    Speaking(bool),
    /// Whether the parent call is delivering media for this feed
    ConnectedChanged(bool),
    /// The underlying stream was swapped; carries the new stream id
    NewStream(String),
}

/// Everything needed to construct a feed
pub struct FeedOpts {
    /// The user this feed belongs to
    pub user_id: String,
    /// The device this feed belongs to, when known
    pub device_id: Option<String>,
    /// What the stream is for
    pub purpose: StreamPurpose,
    /// The media itself
    pub stream: MediaStream,
    /// Initial audio mute state
    pub audio_muted: bool,
    /// Initial video mute state
    pub video_muted: bool,
    /// Whether this feed originates from our own user and device
    pub local: bool,
    /// Audio analysis, for speaking detection on playout
    pub analysis: Option<AudioAnalysisContext>,
}

struct FeedState {
    stream: MediaStream,
    purpose: StreamPurpose,
    /// samples start at -inf so silence never counts as speech
    speaking_samples: VecDeque<f32>,
    analyser: Option<AnalyserHandle>,
    poll_task: Option<tokio::task::JoinHandle<()>>,
}

/// One stream of a call: local capture or remote playout.
///
/// Mute flags here mirror what travels in stream metadata; actual
/// track enabling is the owning call's business.
pub struct CallFeed {
    /// self-reference handed to the volume polling task
    this: Weak<CallFeed>,
    user_id: String,
    device_id: Option<String>,
    local: bool,
    audio_muted: AtomicBool,
    video_muted: AtomicBool,
    speaking: AtomicBool,
    connected: AtomicBool,
    disposed: AtomicBool,
    analysis: Option<AudioAnalysisContext>,
    state: Mutex<FeedState>,
    events: broadcast::Sender<FeedEvent>,
}

impl CallFeed {
    /// Construct a feed
    pub fn new(opts: FeedOpts) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let mut samples = VecDeque::with_capacity(SPEAKING_SAMPLE_COUNT);
        samples.resize(SPEAKING_SAMPLE_COUNT, f32::NEG_INFINITY);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            user_id: opts.user_id,
            device_id: opts.device_id,
            local: opts.local,
            audio_muted: AtomicBool::new(opts.audio_muted),
            video_muted: AtomicBool::new(opts.video_muted),
            speaking: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            analysis: opts.analysis,
            state: Mutex::new(FeedState {
                stream: opts.stream,
                purpose: opts.purpose,
                speaking_samples: samples,
                analyser: None,
                poll_task: None,
            }),
            events,
        })
    }

    /// Subscribe to feed events
    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    /// The user this feed belongs to
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The device this feed belongs to, when known
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Whether this feed is our own capture
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// What the stream is for
    pub fn purpose(&self) -> StreamPurpose {
        self.state.lock().purpose
    }

    /// Reassign the purpose, e.g. when updated stream metadata arrives
    pub fn set_purpose(&self, purpose: StreamPurpose) {
        self.state.lock().purpose = purpose;
    }

    /// The underlying stream
    pub fn stream(&self) -> MediaStream {
        self.state.lock().stream.clone()
    }

    /// The id of the underlying stream
    pub fn stream_id(&self) -> String {
        self.state.lock().stream.id()
    }

    /// Audio is muted if flagged so or if there is no audio track at all
    pub fn is_audio_muted(&self) -> bool {
        let no_audio = self.state.lock().stream.audio_tracks().is_empty();
        self.audio_muted.load(Ordering::SeqCst) || no_audio
    }

    /// Video is muted if flagged so or if there is no video track at all
    pub fn is_video_muted(&self) -> bool {
        let no_video = self.state.lock().stream.video_tracks().is_empty();
        self.video_muted.load(Ordering::SeqCst) || no_video
    }

    /// Update mute flags; `None` leaves a flag unchanged. Toggling
    /// audio resets the speaking window so stale samples cannot keep
    /// the speaking indicator lit.
    pub fn set_audio_video_muted(&self, audio_muted: Option<bool>, video_muted: Option<bool>) {
        if let Some(muted) = audio_muted {
            let was = self.audio_muted.swap(muted, Ordering::SeqCst);
            if was != muted {
                let mut state = self.state.lock();
                for s in state.speaking_samples.iter_mut() {
                    *s = f32::NEG_INFINITY;
                }
            }
        }
        if let Some(muted) = video_muted {
            self.video_muted.store(muted, Ordering::SeqCst);
        }
        let _ = self.events.send(FeedEvent::MuteStateChanged {
            audio_muted: self.is_audio_muted(),
            video_muted: self.is_video_muted(),
        });
    }

    /// Whether the feed currently registers speech
    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    /// The recent volume sample window, newest last
    pub fn speaking_volume_samples(&self) -> Vec<f32> {
        self.state.lock().speaking_samples.iter().copied().collect()
    }

    /// Whether the parent call is delivering media for this feed
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Set by the owning call as its state changes
    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if was != connected {
            let _ = self.events.send(FeedEvent::ConnectedChanged(connected));
        }
    }

    /// Swap the underlying stream, e.g. after a device change
    pub fn set_new_stream(&self, stream: MediaStream) {
        let id = stream.id();
        self.state.lock().stream = stream;
        let _ = self.events.send(FeedEvent::NewStream(id));
    }

    /// Start or stop volume measurement.
    ///
    /// While enabled, a background task samples the analyser every
    /// 200 ms, maintains the speaking window and emits
    /// [`FeedEvent::VolumeChanged`] and [`FeedEvent::Speaking`].
    pub fn measure_volume_activity(&self, enable: bool) {
        let mut state = self.state.lock();
        if enable {
            if state.poll_task.is_some() || self.disposed.load(Ordering::SeqCst) {
                return;
            }
            let Some(ctx) = &self.analysis else {
                debug!(user_id = %self.user_id, "no audio analysis available for feed");
                return;
            };
            state.analyser = Some(ctx.acquire(&state.stream));
            let weak = self.this.clone();
            state.poll_task = Some(tokio::spawn(async move {
                let mut interval = tokio::time::interval(VOLUME_POLL_INTERVAL);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    let Some(feed) = weak.upgrade() else { return };
                    feed.poll_volume();
                }
            }));
        } else {
            if let Some(task) = state.poll_task.take() {
                task.abort();
            }
            state.analyser = None;
            for s in state.speaking_samples.iter_mut() {
                *s = f32::NEG_INFINITY;
            }
            drop(state);
            self.update_speaking(false);
        }
    }

    fn poll_volume(&self) {
        let volume = {
            let state = self.state.lock();
            let Some(analyser) = &state.analyser else { return };
            analyser.sample()
        };
        let effective = if self.is_audio_muted() {
            f32::NEG_INFINITY
        } else {
            volume
        };
        let speaking = {
            let mut state = self.state.lock();
            state.speaking_samples.pop_front();
            state.speaking_samples.push_back(effective);
            state.speaking_samples.iter().any(|&s| s > SPEAKING_THRESHOLD)
        };
        let _ = self.events.send(FeedEvent::VolumeChanged(effective));
        self.update_speaking(speaking);
    }

    fn update_speaking(&self, speaking: bool) {
        let was = self.speaking.swap(speaking, Ordering::SeqCst);
        if was != speaking {
            let _ = self.events.send(FeedEvent::Speaking(speaking));
        }
    }

    /// Duplicate this feed: the stream is duplicated, mute and
    /// purpose are carried over. Used when handing feeds to a
    /// replacement call.
    pub fn duplicate(&self) -> Arc<CallFeed> {
        let state = self.state.lock();
        CallFeed::new(FeedOpts {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            purpose: state.purpose,
            stream: state.stream.duplicate(),
            audio_muted: self.audio_muted.load(Ordering::SeqCst),
            video_muted: self.video_muted.load(Ordering::SeqCst),
            local: self.local,
            analysis: self.analysis.clone(),
        })
    }

    /// Tear the feed down: stops measurement and releases the
    /// analyser. Idempotent; a disposed feed emits no further events.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock();
        if let Some(task) = state.poll_task.take() {
            task.abort();
        }
        state.analyser = None;
    }

    /// Whether the feed has been disposed
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for CallFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallFeed")
            .field("user_id", &self.user_id)
            .field("purpose", &self.purpose())
            .field("local", &self.local)
            .field("stream_id", &self.stream_id())
            .finish()
    }
}
