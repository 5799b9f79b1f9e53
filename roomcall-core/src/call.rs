//! The call state machine
//!
//! One [`Call`] drives one peer-to-peer call: media acquisition, the
//! offer/answer exchange, trickled ICE, glare resolution, mid-call
//! renegotiation (hold, mute, screenshare, upgrades), ICE recovery and
//! termination. Signalling is assumed unreliable and only partially
//! ordered; every handler tolerates loss, duplication and reordering.
//!
//! Connection events from the platform WebRTC stack are delivered by
//! the embedder through the `on_*` methods.

use crate::feed::{CallFeed, FeedOpts};
use crate::media::{AudioAnalysisContext, MediaHandler, MediaStream, TrackKind};
use crate::peer::{
    DataChannel, IceCandidate, IceConnectionState, IceGatheringState, PeerConnection,
    PeerConnectionConfig, PeerConnectionFactory, SdpType, SessionDescription, SignalingState,
    TransceiverDirection, TransceiverId,
};
use crate::sdp;
use crate::signaling::{
    CallClient, IncomingSignal, SignalEnvelope, SignalingError, SignalingMessage, TransferTarget,
};
use crate::types::{
    AssertedIdentity, CallCapabilities, CallConfig, CallDirection, CallError, CallEvent, CallId,
    CallParty, CallState, CallType, HangupReason, OpponentCrypto, PartyId, StreamMetadataMap,
    StreamPurpose, TurnServer, FALLBACK_ICE_SERVER, VOIP_PROTO_VERSION,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Which sender slot a transceiver occupies: one per purpose and kind
type TransceiverKey = (StreamPurpose, TrackKind);

/// Parameters for constructing a [`Call`]
#[derive(Debug, Clone)]
pub struct CallOpts {
    /// The room the call signalling happens in
    pub room_id: String,
    /// Adopt this call id instead of generating one (inbound calls
    /// take theirs from the invite)
    pub call_id: Option<CallId>,
    /// Restrict the call to this user
    pub invitee: Option<String>,
    /// The opponent device, when signalling goes over to-device messages
    pub opponent_device_id: Option<String>,
    /// The opponent session, when known
    pub opponent_session_id: Option<String>,
    /// TURN servers to use instead of the client's
    pub turn_servers: Vec<TurnServer>,
    /// Tunables
    pub config: CallConfig,
}

impl CallOpts {
    /// Options for a call in the given room, everything else default
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            call_id: None,
            invitee: None,
            opponent_device_id: None,
            opponent_session_id: None,
            turn_servers: Vec::new(),
            config: CallConfig::default(),
        }
    }
}

#[derive(Default)]
struct Timers {
    invite: Option<JoinHandle<()>>,
    ringing: Option<JoinHandle<()>>,
    ice_disconnected: Option<JoinHandle<()>>,
    ice_reconnect: Option<JoinHandle<()>>,
    stop_video: Option<JoinHandle<()>>,
    call_length: Option<JoinHandle<()>>,
    candidate: Vec<JoinHandle<()>>,
}

impl Timers {
    fn abort_all(&mut self) {
        for handle in [
            self.invite.take(),
            self.ringing.take(),
            self.ice_disconnected.take(),
            self.ice_reconnect.take(),
            self.stop_video.take(),
            self.call_length.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        for handle in self.candidate.drain(..) {
            handle.abort();
        }
    }
}

struct CallShared {
    state: CallState,
    direction: Option<CallDirection>,
    peer: Option<Arc<dyn PeerConnection>>,
    feeds: Vec<Arc<CallFeed>>,
    transceivers: HashMap<TransceiverKey, TransceiverId>,
    /// outer None = opponent not yet chosen; inner None = chosen, but
    /// the opponent sent no party id (version 0)
    opponent_party_id: Option<Option<PartyId>>,
    opponent_version: Option<u32>,
    opponent_caps: Option<CallCapabilities>,
    opponent_user_id: Option<String>,
    opponent_crypto: OpponentCrypto,
    remote_metadata: Option<StreamMetadataMap>,
    remote_candidate_buffer: HashMap<Option<PartyId>, Vec<IceCandidate>>,
    remote_asserted_identity: Option<AssertedIdentity>,
    tracked_remote_streams: HashSet<String>,
    candidate_send_queue: Vec<IceCandidate>,
    candidate_send_tries: u32,
    candidates_ended: bool,
    invite_or_answer_sent: bool,
    wait_for_local_media: bool,
    remote_on_hold: bool,
    making_offer: bool,
    ignore_offer: bool,
    setting_remote_answer: bool,
    hangup_party: Option<CallParty>,
    hangup_reason: Option<HangupReason>,
    to_device_seq: u64,
    call_start: Option<Instant>,
    stats_at_end: Option<Vec<serde_json::Value>>,
    successor: Option<Arc<Call>>,
    timers: Timers,
}

/// A single peer-to-peer call
pub struct Call {
    /// self-reference handed to timer tasks
    this: Weak<Call>,
    call_id: CallId,
    room_id: String,
    our_party_id: PartyId,
    invitee: Option<String>,
    config: CallConfig,
    turn_servers: Vec<TurnServer>,
    client: Arc<dyn CallClient>,
    media: Arc<dyn MediaHandler>,
    peer_factory: Arc<dyn PeerConnectionFactory>,
    analysis: Option<AudioAnalysisContext>,
    events: broadcast::Sender<CallEvent>,
    /// one "apply remote description / produce response" sequence at a
    /// time; waiters wake in FIFO order
    negotiation_lock: tokio::sync::Mutex<()>,
    shared: Mutex<CallShared>,
}

impl Call {
    /// Construct a call. Outbound calls follow up with
    /// [`Call::place_call`]; inbound calls with [`Call::init_with_invite`].
    pub fn new(
        client: Arc<dyn CallClient>,
        media: Arc<dyn MediaHandler>,
        peer_factory: Arc<dyn PeerConnectionFactory>,
        analysis: Option<AudioAnalysisContext>,
        opts: CallOpts,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let opponent_crypto = match (opts.opponent_device_id, opts.opponent_session_id) {
            (Some(device_id), Some(session_id)) => OpponentCrypto::Full {
                device_id,
                session_id,
            },
            (Some(device_id), None) => OpponentCrypto::DeviceOnly { device_id },
            (None, _) => OpponentCrypto::Unknown,
        };
        let call_id = opts.call_id.unwrap_or_default();
        info!(call_id = %call_id, room_id = %opts.room_id, "created call");
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            call_id,
            room_id: opts.room_id,
            our_party_id: PartyId::new(client.device_id()),
            invitee: opts.invitee,
            config: opts.config,
            turn_servers: opts.turn_servers,
            client,
            media,
            peer_factory,
            analysis,
            events,
            negotiation_lock: tokio::sync::Mutex::new(()),
            shared: Mutex::new(CallShared {
                state: CallState::Fledgling,
                direction: None,
                peer: None,
                feeds: Vec::new(),
                transceivers: HashMap::new(),
                opponent_party_id: None,
                opponent_version: None,
                opponent_caps: None,
                opponent_user_id: None,
                opponent_crypto,
                remote_metadata: None,
                remote_candidate_buffer: HashMap::new(),
                remote_asserted_identity: None,
                tracked_remote_streams: HashSet::new(),
                candidate_send_queue: Vec::new(),
                candidate_send_tries: 0,
                candidates_ended: false,
                invite_or_answer_sent: false,
                wait_for_local_media: false,
                remote_on_hold: false,
                making_offer: false,
                ignore_offer: false,
                setting_remote_answer: false,
                hangup_party: None,
                hangup_reason: None,
                to_device_seq: 0,
                call_start: None,
                stats_at_end: None,
                successor: None,
                timers: Timers::default(),
            }),
        })
    }

    // ------------------------------------------------------------------
    // Accessors

    /// Subscribe to call events
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// This call's id
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// The room the call lives in
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Our own party id (our device id)
    pub fn our_party_id(&self) -> &PartyId {
        &self.our_party_id
    }

    /// Current state
    pub fn state(&self) -> CallState {
        self.shared.lock().state
    }

    /// Whether the call has reached its terminal state
    pub fn call_has_ended(&self) -> bool {
        self.state() == CallState::Ended
    }

    /// Inbound or outbound, once known
    pub fn direction(&self) -> Option<CallDirection> {
        self.shared.lock().direction
    }

    /// Voice or video, judged from the media currently in flight
    pub fn call_type(&self) -> CallType {
        if self.has_local_usermedia_video_track() || self.has_remote_usermedia_video_track() {
            CallType::Video
        } else {
            CallType::Voice
        }
    }

    /// Whether a peer connection has been created yet
    pub fn has_peer_connection(&self) -> bool {
        self.shared.lock().peer.is_some()
    }

    /// The chosen opponent party id: outer `None` until an opponent is
    /// chosen, inner `None` when the opponent sent no party id
    pub fn opponent_party_id(&self) -> Option<Option<PartyId>> {
        self.shared.lock().opponent_party_id.clone()
    }

    /// The signalling protocol version of the chosen opponent
    pub fn opponent_version(&self) -> Option<u32> {
        self.shared.lock().opponent_version
    }

    /// The chosen opponent's user id
    pub fn opponent_user_id(&self) -> Option<String> {
        self.shared.lock().opponent_user_id.clone()
    }

    /// The opponent device id, when signalling is device-pinned
    pub fn opponent_device_id(&self) -> Option<String> {
        self.shared.lock().opponent_crypto.device_id().map(str::to_owned)
    }

    /// Whether the opponent advertises stream metadata support
    pub fn opponent_supports_sdp_stream_metadata(&self) -> bool {
        self.shared.lock().remote_metadata.is_some()
    }

    /// Whether the opponent can be transferred to another user
    pub fn opponent_can_be_transferred(&self) -> bool {
        self.shared
            .lock()
            .opponent_caps
            .map(|c| c.transferee)
            .unwrap_or(false)
    }

    /// Whether the opponent accepts DTMF digits
    pub fn opponent_supports_dtmf(&self) -> bool {
        self.shared
            .lock()
            .opponent_caps
            .map(|c| c.dtmf)
            .unwrap_or(false)
    }

    /// The latest asserted identity for the remote party, if any
    pub fn remote_asserted_identity(&self) -> Option<AssertedIdentity> {
        self.shared.lock().remote_asserted_identity.clone()
    }

    /// Which side hung up, once ended
    pub fn hangup_party(&self) -> Option<CallParty> {
        self.shared.lock().hangup_party
    }

    /// Why the call ended, once ended
    pub fn hangup_reason(&self) -> Option<HangupReason> {
        self.shared.lock().hangup_reason
    }

    /// All feeds, local and remote
    pub fn feeds(&self) -> Vec<Arc<CallFeed>> {
        self.shared.lock().feeds.clone()
    }

    /// Our own feeds
    pub fn local_feeds(&self) -> Vec<Arc<CallFeed>> {
        self.feeds().into_iter().filter(|f| f.is_local()).collect()
    }

    /// The opponent's feeds
    pub fn remote_feeds(&self) -> Vec<Arc<CallFeed>> {
        self.feeds().into_iter().filter(|f| !f.is_local()).collect()
    }

    /// Our camera+microphone feed, if present
    pub fn local_usermedia_feed(&self) -> Option<Arc<CallFeed>> {
        self.local_feeds()
            .into_iter()
            .find(|f| f.purpose() == StreamPurpose::Usermedia)
    }

    /// Our screenshare feed, if present
    pub fn local_screensharing_feed(&self) -> Option<Arc<CallFeed>> {
        self.local_feeds()
            .into_iter()
            .find(|f| f.purpose() == StreamPurpose::Screenshare)
    }

    /// The opponent's camera+microphone feed, if present
    pub fn remote_usermedia_feed(&self) -> Option<Arc<CallFeed>> {
        self.remote_feeds()
            .into_iter()
            .find(|f| f.purpose() == StreamPurpose::Usermedia)
    }

    /// Whether we are currently sharing our screen
    pub fn is_screensharing(&self) -> bool {
        self.local_screensharing_feed().is_some()
    }

    /// Whether our microphone is muted
    pub fn is_microphone_muted(&self) -> bool {
        self.local_usermedia_feed()
            .map(|f| f.is_audio_muted())
            .unwrap_or(false)
    }

    /// Whether our camera is muted
    pub fn is_local_video_muted(&self) -> bool {
        self.local_usermedia_feed()
            .map(|f| f.is_video_muted())
            .unwrap_or(false)
    }

    /// Whether we have put the opponent on hold
    pub fn is_remote_on_hold(&self) -> bool {
        self.shared.lock().remote_on_hold
    }

    /// Whether the opponent has put us on hold: connected, and every
    /// negotiated transceiver stopped sending to us
    pub fn is_local_on_hold(&self) -> bool {
        if self.state() != CallState::Connected {
            return false;
        }
        let Some(peer) = self.peer() else {
            return false;
        };
        let mut on_hold = true;
        for id in peer.transceivers() {
            let track_on_hold = matches!(
                peer.current_direction(id),
                Some(TransceiverDirection::Inactive | TransceiverDirection::RecvOnly)
            );
            if !track_on_hold {
                on_hold = false;
            }
        }
        on_hold
    }

    /// Whether our usermedia stream currently has a live audio track
    pub fn has_local_usermedia_audio_track(&self) -> bool {
        self.local_usermedia_feed()
            .map(|f| !f.stream().audio_tracks().is_empty())
            .unwrap_or(false)
    }

    /// Whether our usermedia stream currently has a live video track
    pub fn has_local_usermedia_video_track(&self) -> bool {
        self.local_usermedia_feed()
            .map(|f| !f.stream().video_tracks().is_empty())
            .unwrap_or(false)
    }

    /// Whether the opponent is sending us audio
    pub fn has_remote_usermedia_audio_track(&self) -> bool {
        self.remote_usermedia_feed()
            .map(|f| !f.stream().audio_tracks().is_empty())
            .unwrap_or(false)
    }

    /// Whether the opponent is sending us video
    pub fn has_remote_usermedia_video_track(&self) -> bool {
        self.remote_usermedia_feed()
            .map(|f| !f.stream().video_tracks().is_empty())
            .unwrap_or(false)
    }

    fn peer(&self) -> Option<Arc<dyn PeerConnection>> {
        self.shared.lock().peer.clone()
    }

    fn capabilities(&self) -> CallCapabilities {
        CallCapabilities {
            transferee: self.config.supports_call_transfer,
            dtmf: true,
        }
    }

    fn has_usermedia_sender(&self, kind: TrackKind) -> bool {
        self.shared
            .lock()
            .transceivers
            .contains_key(&(StreamPurpose::Usermedia, kind))
    }

    // ------------------------------------------------------------------
    // Placing and answering

    /// Place a voice-only call
    pub async fn place_voice_call(&self) -> Result<(), CallError> {
        self.place_call(true, false).await
    }

    /// Place a video call
    pub async fn place_video_call(&self) -> Result<(), CallError> {
        self.place_call(true, true).await
    }

    /// Place a call, acquiring local media first
    pub async fn place_call(&self, audio: bool, video: bool) -> Result<(), CallError> {
        if !audio {
            return Err(CallError::Unsupported(
                "cannot place a call without audio".to_owned(),
            ));
        }
        info!(call_id = %self.call_id, audio, video, "placing call");
        self.set_state(CallState::WaitLocalMedia);
        match self.media.get_user_media_stream(audio, video).await {
            Ok(stream) => {
                for track in stream.tracks() {
                    track.set_enabled(true);
                }
                let feed = CallFeed::new(FeedOpts {
                    user_id: self.client.user_id(),
                    device_id: Some(self.client.device_id()),
                    purpose: StreamPurpose::Usermedia,
                    stream,
                    audio_muted: false,
                    video_muted: false,
                    local: true,
                    analysis: self.analysis.clone(),
                });
                self.place_call_with_feeds(vec![feed], false).await
            }
            Err(err) => {
                self.user_media_failed(&err.to_string()).await;
                Err(err.into())
            }
        }
    }

    /// Place a call with already-acquired feeds. When
    /// `request_screenshare` is set, a receive-only video transceiver
    /// is added so the opponent can share their screen immediately.
    pub async fn place_call_with_feeds(
        &self,
        feeds: Vec<Arc<CallFeed>>,
        request_screenshare: bool,
    ) -> Result<(), CallError> {
        self.shared.lock().direction = Some(CallDirection::Outbound);
        if let Err(err) = self.resolve_opponent_crypto().await {
            self.emit(CallEvent::Error(CallError::terminal(
                HangupReason::UnknownDevices,
                err.to_string(),
            )));
            self.terminate(CallParty::Local, HangupReason::UnknownDevices, false)
                .await;
            return Err(err.into());
        }
        if !self.client.check_turn_servers().await {
            warn!(call_id = %self.call_id, "no TURN credentials, continuing with STUN only");
        }
        let peer = self.create_peer_connection().map_err(CallError::from)?;
        self.emit(CallEvent::PeerConnectionCreated);
        self.got_call_feeds_for_invite(feeds, request_screenshare, &peer)
            .await;
        Ok(())
    }

    async fn got_call_feeds_for_invite(
        &self,
        feeds: Vec<Arc<CallFeed>>,
        request_screenshare: bool,
        peer: &Arc<dyn PeerConnection>,
    ) {
        let successor = self.shared.lock().successor.clone();
        if let Some(successor) = successor {
            successor.queue_got_call_feeds_for_answer(feeds).await;
            return;
        }
        if self.call_has_ended() {
            self.stop_media_of(&feeds);
            return;
        }
        for feed in feeds {
            self.push_local_feed(feed, true);
        }
        if request_screenshare {
            if let Err(err) = peer.add_recv_only_transceiver(TrackKind::Video) {
                warn!(call_id = %self.call_id, error = %err, "failed to add screenshare recv transceiver");
            }
        }
        self.set_state(CallState::CreateOffer);
        // the platform fires negotiation-needed next, which produces
        // and sends the offer
    }

    /// Answer a ringing call. `None` follows whatever media the caller
    /// is sending.
    pub async fn answer(
        &self,
        audio: Option<bool>,
        video: Option<bool>,
    ) -> Result<(), CallError> {
        if self.shared.lock().invite_or_answer_sent {
            return Ok(());
        }
        if audio == Some(false) && video == Some(false) {
            return Err(CallError::Unsupported(
                "cannot answer a call without media".to_owned(),
            ));
        }
        if self.local_usermedia_feed().is_some() {
            let feeds = self.local_feeds();
            self.answer_with_feeds(feeds).await;
            return Ok(());
        }
        if self.shared.lock().wait_for_local_media {
            // a replaced call is acquiring media on our behalf
            self.set_state(CallState::WaitLocalMedia);
            return Ok(());
        }

        let prev_state = self.state();
        let want_audio =
            self.should_answer_with(audio, self.has_remote_usermedia_audio_track(), TrackKind::Audio);
        let mut want_video =
            self.should_answer_with(video, self.has_remote_usermedia_video_track(), TrackKind::Video);
        self.set_state(CallState::WaitLocalMedia);
        self.shared.lock().wait_for_local_media = true;
        loop {
            match self.media.get_user_media_stream(want_audio, want_video).await {
                Ok(stream) => {
                    self.shared.lock().wait_for_local_media = false;
                    let feed = CallFeed::new(FeedOpts {
                        user_id: self.client.user_id(),
                        device_id: Some(self.client.device_id()),
                        purpose: StreamPurpose::Usermedia,
                        stream,
                        audio_muted: false,
                        video_muted: false,
                        local: true,
                        analysis: self.analysis.clone(),
                    });
                    let mut feeds = vec![feed];
                    if let Some(screenshare) = self.local_screensharing_feed() {
                        feeds.push(screenshare);
                    }
                    self.answer_with_feeds(feeds).await;
                    return Ok(());
                }
                Err(err) if want_video => {
                    // camera may be missing or busy: retry voice-only
                    warn!(
                        call_id = %self.call_id, error = %err,
                        "failed to get camera, answering with audio only"
                    );
                    want_video = false;
                    self.set_state(prev_state);
                    self.set_state(CallState::WaitLocalMedia);
                }
                Err(err) => {
                    self.shared.lock().wait_for_local_media = false;
                    self.user_media_failed(&err.to_string()).await;
                    return Err(err.into());
                }
            }
        }
    }

    /// Answer with already-acquired feeds
    pub async fn answer_with_feeds(&self, feeds: Vec<Arc<CallFeed>>) {
        if self.shared.lock().invite_or_answer_sent {
            return;
        }
        info!(call_id = %self.call_id, "answering call");
        self.queue_got_call_feeds_for_answer(feeds).await;
    }

    /// Decide what media to answer with: never offer media the other
    /// side is not sending, and without stream metadata support we
    /// cannot diverge from the other side at all.
    fn should_answer_with(&self, wanted: Option<bool>, other_side: bool, kind: TrackKind) -> bool {
        match wanted {
            Some(true) if !other_side => {
                warn!(
                    call_id = %self.call_id, %kind,
                    "the other side is not sending this kind of media, not answering with it"
                );
                false
            }
            Some(w) if w != other_side && !self.opponent_supports_sdp_stream_metadata() => {
                warn!(
                    call_id = %self.call_id, %kind, value = other_side,
                    "opponent does not support stream metadata, following their media"
                );
                other_side
            }
            Some(w) => w,
            None => other_side,
        }
    }

    async fn queue_got_call_feeds_for_answer(&self, feeds: Vec<Arc<CallFeed>>) {
        let _guard = self.negotiation_lock.lock().await;
        self.got_call_feeds_for_answer(feeds).await;
    }

    async fn got_call_feeds_for_answer(&self, feeds: Vec<Arc<CallFeed>>) {
        if self.call_has_ended() {
            self.stop_media_of(&feeds);
            return;
        }
        self.shared.lock().wait_for_local_media = false;
        for feed in feeds {
            self.push_local_feed(feed, true);
        }
        self.set_state(CallState::CreateAnswer);

        let Some(peer) = self.peer() else { return };
        let answer = match peer.create_answer().await {
            Ok(answer) => answer,
            Err(err) => {
                debug!(call_id = %self.call_id, error = %err, "failed to create answer");
                self.terminate(CallParty::Local, HangupReason::CreateAnswer, true)
                    .await;
                return;
            }
        };
        let munged = self.munge_description(answer);
        if let Err(err) = peer.set_local_description(munged).await {
            debug!(call_id = %self.call_id, error = %err, "failed to set local description");
            self.terminate(CallParty::Local, HangupReason::SetLocalDescription, true)
                .await;
            return;
        }
        if self.call_has_ended() {
            return;
        }
        self.set_state(CallState::Connecting);
        // brief pause so early candidates ride along inside the answer
        tokio::time::sleep(self.config.gather_grace).await;
        if self.call_has_ended() {
            return;
        }
        self.send_answer().await;
    }

    async fn send_answer(&self) {
        let Some(peer) = self.peer() else { return };
        let Some(description) = peer.local_description() else {
            return;
        };
        let message = SignalingMessage::Answer {
            answer: description,
            capabilities: self.capabilities(),
            metadata: Some(self.local_stream_metadata()),
        };
        let discarded = self.discard_duplicate_candidates();
        if discarded > 0 {
            info!(
                call_id = %self.call_id, count = discarded,
                "discarded candidates already present in the answer"
            );
        }
        match self.send_voip_event(message).await {
            Err(err) => {
                // back to ringing so the user can retry or reject
                self.set_state(CallState::Ringing);
                let code = match &err {
                    SignalingError::UnknownDevices { .. } => HangupReason::UnknownDevices,
                    _ => HangupReason::SendAnswer,
                };
                error!(call_id = %self.call_id, error = %err, "failed to send answer");
                self.emit(CallEvent::Error(CallError::terminal(code, err.to_string())));
            }
            Ok(()) => {
                self.shared.lock().invite_or_answer_sent = true;
                self.send_candidate_queue().await;
            }
        }
    }

    /// Seed an inbound call from a received invite
    pub async fn init_with_invite(
        &self,
        signal: IncomingSignal,
    ) -> Result<(), CallError> {
        let SignalingMessage::Invite {
            offer,
            lifetime,
            metadata,
            ..
        } = signal.envelope.message.clone()
        else {
            return Err(CallError::Unsupported(
                "init_with_invite needs an invite".to_owned(),
            ));
        };
        self.shared.lock().direction = Some(CallDirection::Inbound);
        // candidates arriving during the awaits below are buffered and
        // replayed once the offer has been applied
        self.choose_opponent(&signal);
        if let Err(err) = self.resolve_opponent_crypto().await {
            self.emit(CallEvent::Error(CallError::terminal(
                HangupReason::UnknownDevices,
                err.to_string(),
            )));
            self.terminate(CallParty::Local, HangupReason::UnknownDevices, false)
                .await;
            return Err(err.into());
        }
        if !self.client.check_turn_servers().await {
            warn!(call_id = %self.call_id, "no TURN credentials, continuing with STUN only");
        }
        match metadata {
            Some(m) => self.update_remote_stream_metadata(m),
            None => debug!(call_id = %self.call_id, "invite carried no stream metadata"),
        }
        let peer = self.create_peer_connection().map_err(CallError::from)?;
        self.emit(CallEvent::PeerConnectionCreated);

        if let Err(err) = peer.set_remote_description(offer).await {
            debug!(call_id = %self.call_id, error = %err, "failed to set remote description");
            self.terminate(CallParty::Local, HangupReason::SetRemoteDescription, false)
                .await;
            return Err(err.into());
        }
        for stream in peer.remote_streams() {
            self.on_remote_track(stream);
        }
        self.add_buffered_ice_candidates().await;
        if self.call_has_ended() {
            return Ok(());
        }

        let has_remote_media = self
            .remote_feeds()
            .iter()
            .any(|f| !f.stream().tracks().is_empty());
        if !has_remote_media && !self.config.allow_no_media {
            debug!(call_id = %self.call_id, "no remote media after applying the offer");
            self.terminate(CallParty::Local, HangupReason::SetRemoteDescription, false)
                .await;
            return Err(CallError::terminal(
                HangupReason::SetRemoteDescription,
                "the remote party sent no usable media",
            ));
        }

        self.set_state(CallState::Ringing);

        // ring for whatever is left of the invite's lifetime
        let age = signal.age.unwrap_or_default();
        let remaining = Duration::from_millis(lifetime).saturating_sub(age);
        let weak = self.this.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            if let Some(call) = weak.upgrade() {
                if call.state() == CallState::Ringing {
                    info!(call_id = %call.call_id, "invite expired while ringing");
                    call.terminate(CallParty::Remote, HangupReason::InviteTimeout, true)
                        .await;
                }
            }
        });
        self.shared.lock().timers.ringing = Some(handle);
        Ok(())
    }

    /// Seed a call object straight into Ended; used when room history
    /// is replayed in reverse and the hangup is seen before the invite
    pub fn init_with_hangup(&self) {
        self.set_state(CallState::Ended);
    }

    // ------------------------------------------------------------------
    // Offer production (perfect negotiation, our side)

    /// Connection event: the platform wants a (re)negotiation
    pub async fn on_negotiation_needed(&self) {
        info!(call_id = %self.call_id, "negotiation needed");
        if self.state() != CallState::CreateOffer && self.opponent_version() == Some(0) {
            debug!(call_id = %self.call_id, "opponent does not support renegotiation");
            return;
        }
        let _guard = self.negotiation_lock.lock().await;
        if self.call_has_ended() {
            return;
        }
        self.shared.lock().making_offer = true;
        let result = self.got_local_offer().await;
        self.shared.lock().making_offer = false;
        if let Err(err) = result {
            self.local_offer_failed(err).await;
        }
    }

    async fn local_offer_failed(&self, err: CallError) {
        error!(call_id = %self.call_id, error = %err, "failed to produce local offer");
        self.emit(CallEvent::Error(CallError::terminal(
            HangupReason::LocalOfferFailed,
            err.to_string(),
        )));
        self.terminate(CallParty::Local, HangupReason::LocalOfferFailed, false)
            .await;
    }

    async fn got_local_offer(&self) -> Result<(), CallError> {
        debug!(call_id = %self.call_id, "creating local offer");
        if self.call_has_ended() {
            debug!(call_id = %self.call_id, "ignoring negotiation on ended call");
            return Ok(());
        }
        let Some(peer) = self.peer() else {
            return Err(CallError::Peer("no peer connection".to_owned()));
        };
        let offer = peer.create_offer().await.map_err(CallError::from)?;
        let munged = self.munge_description(offer);
        peer.set_local_description(munged.clone())
            .await
            .map_err(CallError::from)?;

        if peer.ice_gathering_state() == IceGatheringState::Gathering {
            // let some candidates arrive so they ship inside the offer
            tokio::time::sleep(self.config.gather_grace).await;
        }
        if self.call_has_ended() {
            return Ok(());
        }

        let description = peer.local_description().unwrap_or(munged);
        let initial = self.state() == CallState::CreateOffer;
        let message = if initial {
            SignalingMessage::Invite {
                offer: description,
                lifetime: self.config.invite_lifetime.as_millis() as u64,
                invitee: self.invitee.clone(),
                capabilities: self.capabilities(),
                metadata: Some(self.local_stream_metadata()),
            }
        } else {
            SignalingMessage::Negotiate {
                description,
                metadata: Some(self.local_stream_metadata()),
            }
        };
        let discarded = self.discard_duplicate_candidates();
        if discarded > 0 {
            info!(
                call_id = %self.call_id, count = discarded,
                "discarded candidates already present in the description"
            );
        }
        if let Err(err) = self.send_voip_event(message).await {
            let code = if initial {
                match &err {
                    SignalingError::UnknownDevices { .. } => HangupReason::UnknownDevices,
                    _ => HangupReason::SendInvite,
                }
            } else {
                HangupReason::SignallingFailed
            };
            error!(call_id = %self.call_id, error = %err, "failed to send local description");
            self.emit(CallEvent::Error(CallError::terminal(code, err.to_string())));
            self.terminate(CallParty::Local, code, false).await;
            return Ok(());
        }

        self.send_candidate_queue().await;
        if initial {
            {
                let mut s = self.shared.lock();
                if s.state == CallState::Ended {
                    return Ok(());
                }
                s.invite_or_answer_sent = true;
            }
            self.set_state(CallState::InviteSent);

            let weak = self.this.clone();
            let lifetime = self.config.invite_lifetime;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(lifetime).await;
                if let Some(call) = weak.upgrade() {
                    if call.state() == CallState::InviteSent {
                        info!(call_id = %call.call_id, "invite timed out");
                        call.hangup(HangupReason::InviteTimeout, false).await;
                    }
                }
            });
            self.shared.lock().timers.invite = Some(handle);
        }
        Ok(())
    }

    fn munge_description(&self, desc: SessionDescription) -> SessionDescription {
        let mods = sdp::default_codec_mods(self.config.push_to_talk);
        SessionDescription {
            sdp_type: desc.sdp_type,
            sdp: sdp::apply_codec_mods(&desc.sdp, &mods),
        }
    }

    // ------------------------------------------------------------------
    // Inbound signalling handlers

    /// An answer arrived for our invite
    pub async fn on_answer_received(&self, signal: IncomingSignal) {
        info!(call_id = %self.call_id, "got answer");
        if self.call_has_ended() {
            debug!(call_id = %self.call_id, "ignoring answer: call has ended");
            return;
        }
        if self.shared.lock().opponent_party_id.is_some() {
            info!(
                call_id = %self.call_id, party = ?signal.party_id(),
                "ignoring answer: we already chose an opponent"
            );
            return;
        }
        let SignalingMessage::Answer { answer, metadata, .. } = signal.envelope.message.clone()
        else {
            return;
        };

        self.choose_opponent(&signal);
        self.add_buffered_ice_candidates().await;
        self.set_state(CallState::Connecting);
        match metadata {
            Some(m) => self.update_remote_stream_metadata(m),
            None => debug!(call_id = %self.call_id, "answer carried no stream metadata"),
        }

        let Some(peer) = self.peer() else { return };
        self.shared.lock().setting_remote_answer = true;
        let result = peer.set_remote_description(answer).await;
        self.shared.lock().setting_remote_answer = false;
        if let Err(err) = result {
            debug!(call_id = %self.call_id, error = %err, "failed to set remote description");
            self.terminate(CallParty::Local, HangupReason::SetRemoteDescription, false)
                .await;
            return;
        }
        for stream in peer.remote_streams() {
            self.on_remote_track(stream);
        }

        // tell the other answering devices which answer we picked, so
        // they stop ringing
        let selected = self.shared.lock().opponent_party_id.clone().flatten();
        if let Some(party) = selected {
            if let Err(err) = self
                .send_voip_event(SignalingMessage::SelectAnswer {
                    selected_party_id: party,
                })
                .await
            {
                // other devices will stop ringing on their own timeout
                warn!(call_id = %self.call_id, error = %err, "failed to send select_answer");
            }
        }
    }

    /// The caller announced which answer it selected
    pub async fn on_select_answer_received(&self, signal: IncomingSignal) {
        if self.direction() != Some(CallDirection::Inbound) {
            warn!(call_id = %self.call_id, "got select_answer for an outbound call, ignoring");
            return;
        }
        let SignalingMessage::SelectAnswer { selected_party_id } = &signal.envelope.message else {
            return;
        };
        if *selected_party_id != self.our_party_id {
            info!(
                call_id = %self.call_id, selected = %selected_party_id,
                "caller selected a different answer, ending call"
            );
            self.terminate(CallParty::Remote, HangupReason::AnsweredElsewhere, true)
                .await;
        }
    }

    /// A renegotiation description arrived (perfect negotiation,
    /// their side)
    pub async fn on_negotiate_received(&self, signal: IncomingSignal) {
        let SignalingMessage::Negotiate {
            description,
            metadata,
        } = signal.envelope.message.clone()
        else {
            return;
        };
        if self.call_has_ended() {
            return;
        }
        let Some(peer) = self.peer() else { return };

        // we are polite iff we are the callee
        let polite = self.direction() == Some(CallDirection::Inbound);
        let offer_collision = {
            let s = self.shared.lock();
            let ready_for_offer = !s.making_offer
                && (peer.signaling_state() == SignalingState::Stable || s.setting_remote_answer);
            description.sdp_type == SdpType::Offer && !ready_for_offer
        };
        if !polite && offer_collision {
            self.shared.lock().ignore_offer = true;
            info!(call_id = %self.call_id, "glare detected: ignoring colliding offer (impolite)");
            return;
        }
        self.shared.lock().ignore_offer = false;

        let was_local_on_hold = self.is_local_on_hold();
        if let Some(m) = metadata {
            self.update_remote_stream_metadata(m);
        }

        let _guard = self.negotiation_lock.lock().await;
        if self.call_has_ended() {
            return;
        }
        self.shared.lock().setting_remote_answer = description.sdp_type == SdpType::Answer;
        let result = peer.set_remote_description(description.clone()).await;
        self.shared.lock().setting_remote_answer = false;
        if let Err(err) = result {
            // renegotiation failures are not fatal to the call
            warn!(call_id = %self.call_id, error = %err, "failed to set remote description");
            return;
        }
        for stream in peer.remote_streams() {
            self.on_remote_track(stream);
        }

        if description.sdp_type == SdpType::Offer {
            let answer = match peer.create_answer().await {
                Ok(answer) => answer,
                Err(err) => {
                    warn!(call_id = %self.call_id, error = %err, "failed to create negotiation answer");
                    return;
                }
            };
            let munged = self.munge_description(answer);
            if let Err(err) = peer.set_local_description(munged.clone()).await {
                warn!(call_id = %self.call_id, error = %err, "failed to set local description");
                return;
            }
            let description = peer.local_description().unwrap_or(munged);
            if let Err(err) = self
                .send_voip_event(SignalingMessage::Negotiate {
                    description,
                    metadata: Some(self.local_stream_metadata()),
                })
                .await
            {
                warn!(call_id = %self.call_id, error = %err, "failed to send negotiation answer");
            }
        }

        let now_local_on_hold = self.is_local_on_hold();
        if now_local_on_hold != was_local_on_hold {
            self.emit(CallEvent::LocalHoldUnhold(now_local_on_hold));
        }
    }

    /// Updated stream metadata arrived without renegotiation
    pub fn on_sdp_stream_metadata_changed_received(&self, signal: IncomingSignal) {
        if let SignalingMessage::SdpStreamMetadataChanged { metadata } =
            signal.envelope.message.clone()
        {
            self.update_remote_stream_metadata(metadata);
        }
    }

    /// An asserted identity arrived for the remote party
    pub fn on_asserted_identity_received(&self, signal: IncomingSignal) {
        let SignalingMessage::AssertedIdentity { asserted_identity } =
            signal.envelope.message.clone()
        else {
            return;
        };
        info!(call_id = %self.call_id, identity = %asserted_identity.id, "got asserted identity");
        self.shared.lock().remote_asserted_identity = Some(asserted_identity.clone());
        self.emit(CallEvent::AssertedIdentityChanged(asserted_identity));
    }

    /// A hangup arrived
    pub async fn on_hangup_received(&self, signal: IncomingSignal) {
        debug!(call_id = %self.call_id, "hangup received");
        let SignalingMessage::Hangup { reason } = &signal.envelope.message else {
            return;
        };
        let reason = reason.unwrap_or(HangupReason::UserHangup);
        // always honour hangups while ringing: no opponent has been
        // chosen yet, so there is no party id to match
        if self.party_id_matches(&signal) || self.state() == CallState::Ringing {
            self.terminate(CallParty::Remote, reason, true).await;
        } else {
            info!(call_id = %self.call_id, "ignoring hangup from a party that is not our opponent");
        }
    }

    /// A reject arrived for our invite
    pub async fn on_reject_received(&self, signal: IncomingSignal) {
        debug!(call_id = %self.call_id, "reject received");
        let SignalingMessage::Reject { reason } = &signal.envelope.message else {
            return;
        };
        let reason = reason.unwrap_or(HangupReason::UserHangup);
        let state = self.state();
        // no party check needed: if we had an answer or reject already
        // we would no longer be in these states
        let should_terminate = matches!(state, CallState::InviteSent | CallState::Ringing)
            || (state == CallState::Fledgling && self.direction() == Some(CallDirection::Inbound));
        if should_terminate {
            self.terminate(CallParty::Remote, reason, true).await;
        } else {
            debug!(call_id = %self.call_id, ?state, "ignoring reject in current state");
        }
    }

    /// Another of our own devices answered this call
    pub async fn on_answered_elsewhere(&self) {
        debug!(call_id = %self.call_id, "answered elsewhere");
        self.terminate(CallParty::Remote, HangupReason::AnsweredElsewhere, true)
            .await;
    }

    // ------------------------------------------------------------------
    // Opponent selection

    fn choose_opponent(&self, signal: &IncomingSignal) {
        let party = signal.party_id();
        info!(
            call_id = %self.call_id,
            version = signal.envelope.version,
            party = ?party,
            "choosing opponent"
        );
        let mut s = self.shared.lock();
        s.opponent_version = Some(signal.envelope.version);
        // party id may legitimately be absent: version-0 opponents are
        // chosen without one, and then all party ids match
        s.opponent_party_id = Some(party);
        s.opponent_user_id = Some(signal.sender.clone());
        if let SignalingMessage::Invite { capabilities, .. }
        | SignalingMessage::Answer { capabilities, .. } = &signal.envelope.message
        {
            s.opponent_caps = Some(*capabilities);
        }
        if s.opponent_crypto.device_id().is_none() {
            if let Some(device_id) = &signal.envelope.device_id {
                s.opponent_crypto = match &signal.envelope.sender_session_id {
                    Some(session_id) => OpponentCrypto::Full {
                        device_id: device_id.clone(),
                        session_id: session_id.clone(),
                    },
                    None => OpponentCrypto::DeviceOnly {
                        device_id: device_id.clone(),
                    },
                };
            }
        }
    }

    fn party_id_matches(&self, signal: &IncomingSignal) -> bool {
        let msg_party = signal.party_id();
        matches!(&self.shared.lock().opponent_party_id, Some(chosen) if *chosen == msg_party)
    }

    async fn resolve_opponent_crypto(&self) -> Result<(), SignalingError> {
        let (user_id, device_id) = {
            let s = self.shared.lock();
            let user = s
                .opponent_user_id
                .clone()
                .or_else(|| self.invitee.clone());
            (user, s.opponent_crypto.device_id().map(str::to_owned))
        };
        let (Some(user_id), Some(device_id)) = (user_id, device_id) else {
            return Ok(());
        };
        self.client
            .resolve_opponent_device(&user_id, &device_id)
            .await
    }

    // ------------------------------------------------------------------
    // ICE

    /// Connection event: the platform produced a local candidate. An
    /// empty candidate string marks the end of gathering.
    pub fn on_local_ice_candidate(&self, candidate: IceCandidate) {
        if self.call_has_ended() {
            return;
        }
        if self.shared.lock().candidates_ended {
            warn!(call_id = %self.call_id, "got local candidate after candidates ended");
        }
        if candidate.candidate.is_empty() {
            self.queue_candidate(None);
        } else {
            debug!(call_id = %self.call_id, candidate = %candidate.candidate, "got local ICE candidate");
            self.queue_candidate(Some(candidate));
        }
    }

    /// Connection event: gathering state changed
    pub fn on_ice_gathering_state_change(&self) {
        let Some(peer) = self.peer() else { return };
        let state = peer.ice_gathering_state();
        debug!(call_id = %self.call_id, ?state, "ICE gathering state changed");
        if state == IceGatheringState::Complete {
            self.queue_candidate(None);
        }
    }

    /// Queue a candidate for batched sending; `None` queues the
    /// end-of-candidates sentinel.
    pub(crate) fn queue_candidate(&self, candidate: Option<IceCandidate>) {
        let mut s = self.shared.lock();
        match candidate {
            Some(c) => s.candidate_send_queue.push(c),
            None => {
                if s.candidates_ended {
                    return;
                }
                s.candidates_ended = true;
                s.candidate_send_queue.push(IceCandidate::end_of_candidates());
            }
        }
        // candidates generated before the invite or answer is sent
        // wait for it; the send path flushes the queue afterwards
        if s.state == CallState::Ringing || !s.invite_or_answer_sent {
            return;
        }
        // a send attempt or backoff in flight will pick these up
        if s.candidate_send_tries != 0 {
            return;
        }
        let delay = if s.direction == Some(CallDirection::Inbound) {
            self.config.candidate_delay_inbound
        } else {
            // the callee needs longer before it can do anything with them
            self.config.candidate_delay_outbound
        };
        let weak = self.this.clone();
        s.timers.candidate.retain(|h| !h.is_finished());
        s.timers.candidate.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(call) = weak.upgrade() {
                call.send_candidate_queue().await;
            }
        }));
    }

    /// Drop queued candidates that are now redundant because they ship
    /// inside the description about to be sent. The end-of-candidates
    /// sentinel is kept. Returns how many were dropped.
    fn discard_duplicate_candidates(&self) -> usize {
        let mut s = self.shared.lock();
        let before = s.candidate_send_queue.len();
        s.candidate_send_queue.retain(|c| c.candidate.is_empty());
        before - s.candidate_send_queue.len()
    }

    // boxed: the retry task spawned below awaits this same function,
    // which would otherwise make the future's Send inference cyclic
    fn send_candidate_queue(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            loop {
                let candidates = {
                    let mut s = self.shared.lock();
                    if s.candidate_send_queue.is_empty() || s.state == CallState::Ended {
                        return;
                    }
                    s.candidate_send_tries += 1;
                    std::mem::take(&mut s.candidate_send_queue)
                };
                debug!(call_id = %self.call_id, count = candidates.len(), "sending candidate batch");
                match self
                    .send_voip_event(SignalingMessage::Candidates {
                        candidates: candidates.clone(),
                    })
                    .await
                {
                    Ok(()) => {
                        self.shared.lock().candidate_send_tries = 0;
                        // go round again for anything queued while sending
                    }
                    Err(err) => {
                        let tries = {
                            let mut s = self.shared.lock();
                            // put them back at the front for the retry
                            let mut requeued = candidates;
                            requeued.append(&mut s.candidate_send_queue);
                            s.candidate_send_queue = requeued;
                            s.candidate_send_tries
                        };
                        if tries > self.config.candidate_send_retry_limit {
                            error!(
                                call_id = %self.call_id, error = %err, tries,
                                "failed to send candidates, giving up on the call"
                            );
                            self.emit(CallEvent::Error(CallError::terminal(
                                HangupReason::SignallingFailed,
                                "signalling stopped responding",
                            )));
                            self.hangup(HangupReason::SignallingFailed, false).await;
                            return;
                        }
                        let delay =
                            Duration::from_millis(500u64.saturating_mul(1 << tries.min(16)));
                        warn!(
                            call_id = %self.call_id, error = %err, tries, ?delay,
                            "failed to send candidates, will retry"
                        );
                        let weak = self.this.clone();
                        let handle = tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            if let Some(call) = weak.upgrade() {
                                call.send_candidate_queue().await;
                            }
                        });
                        self.shared.lock().timers.candidate.push(handle);
                        return;
                    }
                }
            }
        })
    }

    /// Remote candidates arrived
    pub async fn on_remote_ice_candidates_received(&self, signal: IncomingSignal) {
        if self.call_has_ended() {
            debug!(call_id = %self.call_id, "ignoring remote candidates: call has ended");
            return;
        }
        let SignalingMessage::Candidates { candidates } = signal.envelope.message.clone() else {
            return;
        };
        if candidates.is_empty() {
            debug!(call_id = %self.call_id, "ignoring candidates message with no candidates");
            return;
        }
        let from_party = signal.party_id();
        if self.shared.lock().opponent_party_id.is_none() {
            // no opponent yet: park them until the answer chooses one
            info!(
                call_id = %self.call_id, party = ?from_party, count = candidates.len(),
                "buffering candidates until an opponent is chosen"
            );
            self.shared
                .lock()
                .remote_candidate_buffer
                .entry(from_party)
                .or_default()
                .extend(candidates);
            return;
        }
        if !self.party_id_matches(&signal) {
            info!(
                call_id = %self.call_id, party = ?from_party,
                "ignoring candidates from a party that is not our opponent"
            );
            return;
        }
        if !self.has_peer_connection() {
            // inbound setup resolves crypto and TURN before the
            // connection exists; park them for replay after the offer
            info!(
                call_id = %self.call_id, count = candidates.len(),
                "buffering candidates until the peer connection exists"
            );
            self.shared
                .lock()
                .remote_candidate_buffer
                .entry(from_party)
                .or_default()
                .extend(candidates);
            return;
        }
        self.add_ice_candidates(&candidates).await;
    }

    async fn add_buffered_ice_candidates(&self) {
        let buffered = {
            let mut s = self.shared.lock();
            let Some(chosen) = s.opponent_party_id.clone() else {
                return;
            };
            let list = s.remote_candidate_buffer.remove(&chosen);
            // everything else was for losers of the answer race
            s.remote_candidate_buffer.clear();
            list
        };
        if let Some(candidates) = buffered {
            info!(
                call_id = %self.call_id, count = candidates.len(),
                "adding buffered candidates from chosen opponent"
            );
            self.add_ice_candidates(&candidates).await;
        }
    }

    async fn add_ice_candidates(&self, candidates: &[IceCandidate]) {
        let Some(peer) = self.peer() else { return };
        for candidate in candidates {
            if candidate.is_end_of_candidates() {
                debug!(call_id = %self.call_id, "got remote end-of-candidates");
            } else {
                debug!(
                    call_id = %self.call_id, candidate = %candidate.candidate,
                    "adding remote ICE candidate"
                );
            }
            if let Err(err) = peer.add_ice_candidate(candidate.clone()).await {
                if !self.shared.lock().ignore_offer {
                    info!(call_id = %self.call_id, error = %err, "failed to add remote candidate");
                }
            }
        }
    }

    /// Connection event: ICE connection state changed
    pub async fn on_ice_connection_state_change(&self) {
        if self.call_has_ended() {
            return;
        }
        let Some(peer) = self.peer() else { return };
        let ice_state = peer.ice_connection_state();
        debug!(call_id = %self.call_id, ?ice_state, "ICE connection state changed");
        match ice_state {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                let start_clock = {
                    let mut s = self.shared.lock();
                    if let Some(t) = s.timers.ice_disconnected.take() {
                        t.abort();
                    }
                    if let Some(t) = s.timers.ice_reconnect.take() {
                        t.abort();
                    }
                    if s.call_start.is_none() {
                        s.call_start = Some(Instant::now());
                    }
                    s.timers.call_length.is_none()
                };
                self.set_state(CallState::Connected);
                if start_clock {
                    let weak = self.this.clone();
                    let tick = self.config.call_length_tick;
                    let handle = tokio::spawn(async move {
                        let mut interval = tokio::time::interval(tick);
                        interval.tick().await; // the immediate first tick
                        loop {
                            interval.tick().await;
                            let Some(call) = weak.upgrade() else { return };
                            let start = call.shared.lock().call_start;
                            if let Some(start) = start {
                                call.emit(CallEvent::LengthChanged(start.elapsed().as_secs()));
                            }
                        }
                    });
                    self.shared.lock().timers.call_length = Some(handle);
                }
            }
            IceConnectionState::Failed => {
                // a restart gathers fresh candidates
                self.shared.lock().candidates_ended = false;
                if peer.can_restart_ice() {
                    info!(call_id = %self.call_id, "ICE failed, restarting");
                    peer.restart_ice();
                } else {
                    info!(call_id = %self.call_id, "ICE failed and cannot restart, ending call");
                    self.hangup(HangupReason::IceFailed, false).await;
                }
            }
            IceConnectionState::Disconnected => {
                self.shared.lock().candidates_ended = false;

                let weak = self.this.clone();
                let reconnect_delay = self.config.ice_reconnect_delay;
                let reconnect = tokio::spawn(async move {
                    tokio::time::sleep(reconnect_delay).await;
                    let Some(call) = weak.upgrade() else { return };
                    if call.call_has_ended() {
                        return;
                    }
                    let Some(peer) = call.peer() else { return };
                    if peer.ice_connection_state() == IceConnectionState::Disconnected
                        && peer.can_restart_ice()
                    {
                        info!(call_id = %call.call_id, "still disconnected, restarting ICE");
                        peer.restart_ice();
                    }
                });

                let weak = self.this.clone();
                let hangup_delay = self.config.ice_disconnected_timeout;
                let disconnected = tokio::spawn(async move {
                    tokio::time::sleep(hangup_delay).await;
                    if let Some(call) = weak.upgrade() {
                        info!(call_id = %call.call_id, "ICE disconnected for too long, ending call");
                        call.hangup(HangupReason::IceFailed, false).await;
                    }
                });

                {
                    let mut s = self.shared.lock();
                    if let Some(t) = s.timers.ice_reconnect.replace(reconnect) {
                        t.abort();
                    }
                    if let Some(t) = s.timers.ice_disconnected.replace(disconnected) {
                        t.abort();
                    }
                }
                self.set_state(CallState::Connecting);
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Feeds

    /// Connection event: a remote track arrived, grouped into `stream`
    pub fn on_remote_track(&self, stream: MediaStream) {
        if self.call_has_ended() {
            return;
        }
        if stream.tracks().is_empty() {
            warn!(call_id = %self.call_id, stream = %stream.id(), "ignoring remote stream with no tracks");
            return;
        }
        if self.opponent_supports_sdp_stream_metadata() {
            self.push_remote_feed(stream);
        } else {
            self.push_remote_feed_without_metadata(stream);
        }
    }

    /// Connection event: a remote stream lost its last track
    pub fn on_remote_stream_ended(&self, stream_id: &str) {
        let feed = self
            .remote_feeds()
            .into_iter()
            .find(|f| f.stream_id() == stream_id);
        if let Some(feed) = feed {
            if feed.stream().tracks().is_empty() {
                info!(call_id = %self.call_id, stream = %stream_id, "remote stream ended");
                self.delete_feed(&feed);
            }
        }
    }

    fn push_remote_feed(&self, stream: MediaStream) {
        let meta = {
            let s = self.shared.lock();
            s.remote_metadata
                .as_ref()
                .and_then(|m| m.get(&stream.id()).cloned())
        };
        let Some(meta) = meta else {
            warn!(
                call_id = %self.call_id, stream = %stream.id(),
                "ignoring remote stream we have no metadata for"
            );
            return;
        };
        if self.feeds().iter().any(|f| f.stream_id() == stream.id()) {
            debug!(call_id = %self.call_id, stream = %stream.id(), "already have a feed for this stream");
            return;
        }
        let (user_id, device_id) = {
            let s = self.shared.lock();
            (
                s.opponent_user_id.clone().unwrap_or_default(),
                s.opponent_crypto.device_id().map(str::to_owned),
            )
        };
        let feed = CallFeed::new(FeedOpts {
            user_id,
            device_id,
            purpose: meta.purpose,
            stream: stream.clone(),
            audio_muted: meta.audio_muted,
            video_muted: meta.video_muted,
            local: false,
            analysis: self.analysis.clone(),
        });
        feed.set_connected(self.state() == CallState::Connected);
        {
            let mut s = self.shared.lock();
            s.feeds.push(feed);
            s.tracked_remote_streams.insert(stream.id());
        }
        info!(
            call_id = %self.call_id, stream = %stream.id(), purpose = ?meta.purpose,
            "pushed remote feed"
        );
        self.emit(CallEvent::FeedsChanged);
    }

    /// Version-0 compatibility: a single remote stream with no
    /// metadata is assumed to be usermedia
    fn push_remote_feed_without_metadata(&self, stream: MediaStream) {
        let existing = self.remote_feeds().into_iter().next();
        if let Some(existing) = existing {
            if existing.stream_id() == stream.id() {
                debug!(call_id = %self.call_id, stream = %stream.id(), "already have a feed for this stream");
            } else {
                warn!(
                    call_id = %self.call_id, stream = %stream.id(),
                    "ignoring second remote stream from a peer without metadata support"
                );
            }
            return;
        }
        let (user_id, device_id) = {
            let s = self.shared.lock();
            (
                s.opponent_user_id.clone().unwrap_or_default(),
                s.opponent_crypto.device_id().map(str::to_owned),
            )
        };
        let feed = CallFeed::new(FeedOpts {
            user_id,
            device_id,
            purpose: StreamPurpose::Usermedia,
            stream: stream.clone(),
            audio_muted: false,
            video_muted: false,
            local: false,
            analysis: self.analysis.clone(),
        });
        feed.set_connected(self.state() == CallState::Connected);
        {
            let mut s = self.shared.lock();
            s.feeds.push(feed);
            s.tracked_remote_streams.insert(stream.id());
        }
        info!(call_id = %self.call_id, stream = %stream.id(), "pushed remote feed (no metadata)");
        self.emit(CallEvent::FeedsChanged);
    }

    fn push_local_feed(&self, feed: Arc<CallFeed>, add_to_peer: bool) {
        if self.feeds().iter().any(|f| f.stream_id() == feed.stream_id()) {
            info!(
                call_id = %self.call_id, stream = %feed.stream_id(),
                "ignoring duplicate local stream"
            );
            return;
        }
        self.shared.lock().feeds.push(feed.clone());
        if add_to_peer {
            if let Some(peer) = self.peer() {
                for track in feed.stream().tracks() {
                    let key = (feed.purpose(), track.kind());
                    let existing = self.shared.lock().transceivers.get(&key).copied();
                    match existing {
                        Some(id) => {
                            if let Err(err) = peer.replace_track(id, Some(track.clone())) {
                                warn!(call_id = %self.call_id, error = %err, "failed to replace track");
                                continue;
                            }
                            // reactivate a sender parked by an earlier removal
                            match peer.direction(id) {
                                Some(TransceiverDirection::Inactive) => {
                                    peer.set_direction(id, TransceiverDirection::SendOnly);
                                }
                                Some(TransceiverDirection::RecvOnly) => {
                                    peer.set_direction(id, TransceiverDirection::SendRecv);
                                }
                                _ => {}
                            }
                        }
                        None => match peer.add_track(track.clone(), &feed.stream_id()) {
                            Ok(id) => {
                                self.shared.lock().transceivers.insert(key, id);
                            }
                            Err(err) => {
                                warn!(call_id = %self.call_id, error = %err, "failed to add track");
                            }
                        },
                    }
                }
            }
        }
        info!(
            call_id = %self.call_id, stream = %feed.stream_id(), purpose = ?feed.purpose(),
            "pushed local feed"
        );
        self.emit(CallEvent::FeedsChanged);
    }

    fn push_new_local_feed(&self, stream: MediaStream, purpose: StreamPurpose, add_to_peer: bool) {
        for track in stream.tracks() {
            track.set_enabled(true);
        }
        let feed = CallFeed::new(FeedOpts {
            user_id: self.client.user_id(),
            device_id: Some(self.client.device_id()),
            purpose,
            stream,
            audio_muted: false,
            video_muted: false,
            local: true,
            analysis: self.analysis.clone(),
        });
        self.push_local_feed(feed, add_to_peer);
    }

    fn delete_feed(&self, feed: &Arc<CallFeed>) {
        feed.dispose();
        {
            let mut s = self.shared.lock();
            let stream_id = feed.stream_id();
            s.feeds.retain(|f| f.stream_id() != stream_id);
            s.tracked_remote_streams.remove(&stream_id);
        }
        self.emit(CallEvent::FeedsChanged);
    }

    fn update_remote_stream_metadata(&self, metadata: StreamMetadataMap) {
        let feeds = {
            let mut s = self.shared.lock();
            // merge, not replace: updates may cover only some streams
            match &mut s.remote_metadata {
                Some(existing) => existing.extend(metadata.clone()),
                None => s.remote_metadata = Some(metadata.clone()),
            }
            s.feeds.clone()
        };
        for feed in feeds.iter().filter(|f| !f.is_local()) {
            if let Some(meta) = metadata.get(&feed.stream_id()) {
                feed.set_purpose(meta.purpose);
                feed.set_audio_video_muted(Some(meta.audio_muted), Some(meta.video_muted));
            }
        }
    }

    fn local_stream_metadata(&self) -> StreamMetadataMap {
        let mut map = StreamMetadataMap::new();
        for feed in self.local_feeds() {
            map.insert(
                feed.stream_id(),
                crate::types::StreamMetadata {
                    purpose: feed.purpose(),
                    audio_muted: feed.is_audio_muted(),
                    video_muted: feed.is_video_muted(),
                },
            );
        }
        map
    }

    // ------------------------------------------------------------------
    // Mute / hold / screenshare / upgrade

    /// Mute or unmute the microphone; returns the resulting state.
    /// Unmuting with no audio track at all upgrades the call.
    pub async fn set_microphone_muted(&self, muted: bool) -> bool {
        if !muted && !self.media.has_audio_device().await {
            return self.is_microphone_muted();
        }
        if !muted
            && (!self.has_usermedia_sender(TrackKind::Audio)
                || !self.has_local_usermedia_audio_track())
        {
            self.upgrade_call(true, false).await;
            return self.is_microphone_muted();
        }
        if let Some(feed) = self.local_usermedia_feed() {
            feed.set_audio_video_muted(Some(muted), None);
        }
        self.update_mute_status();
        if let Err(err) = self.send_metadata_update().await {
            warn!(call_id = %self.call_id, error = %err, "failed to send metadata update");
        }
        self.is_microphone_muted()
    }

    /// Mute or unmute the camera; returns the resulting state.
    /// Unmuting with no video sender upgrades the call; muting stops
    /// the camera track shortly afterwards so the device light goes off.
    pub async fn set_local_video_muted(&self, muted: bool) -> bool {
        if !muted {
            // cancel a pending track stop if the user flip-flops quickly
            if let Some(t) = self.shared.lock().timers.stop_video.take() {
                t.abort();
            }
        }
        if !muted && !self.media.has_video_device().await {
            return self.is_local_video_muted();
        }
        if !muted && !self.has_usermedia_sender(TrackKind::Video) {
            self.upgrade_call(false, true).await;
            return self.is_local_video_muted();
        }
        // the track was stopped while muted: re-acquire the camera
        if !muted && !self.has_local_usermedia_video_track() {
            match self.media.get_user_media_stream(true, true).await {
                Ok(stream) => {
                    if let Err(err) = self.update_local_usermedia_stream(stream, false, true).await
                    {
                        warn!(call_id = %self.call_id, error = %err, "failed to swap in new camera stream");
                    }
                }
                Err(err) => {
                    warn!(call_id = %self.call_id, error = %err, "failed to re-acquire camera");
                    return self.is_local_video_muted();
                }
            }
        }
        if let Some(feed) = self.local_usermedia_feed() {
            feed.set_audio_video_muted(None, Some(muted));
        }
        self.update_mute_status();
        if let Err(err) = self.send_metadata_update().await {
            warn!(call_id = %self.call_id, error = %err, "failed to send metadata update");
        }
        if muted {
            // leave time for the last frames to drain so the peer
            // freezes on black rather than a stale image
            let weak = self.this.clone();
            let delay = self.config.stop_video_track_delay;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Some(call) = weak.upgrade() else { return };
                let Some(feed) = call.local_usermedia_feed() else {
                    return;
                };
                if !feed.is_video_muted() {
                    return;
                }
                let stream = feed.stream();
                for track in stream.video_tracks() {
                    track.stop();
                    stream.remove_track(track.id());
                }
            });
            if let Some(t) = self.shared.lock().timers.stop_video.replace(handle) {
                t.abort();
            }
        }
        self.is_local_video_muted()
    }

    /// Apply mute and hold to the actual tracks
    fn update_mute_status(&self) {
        let Some(feed) = self.local_usermedia_feed() else {
            return;
        };
        let remote_on_hold = self.is_remote_on_hold();
        let stream = feed.stream();
        let mic_off = feed.is_audio_muted() || remote_on_hold;
        for track in stream.audio_tracks() {
            track.set_enabled(!mic_off);
        }
        let video_off = feed.is_video_muted() || remote_on_hold;
        for track in stream.video_tracks() {
            track.set_enabled(!video_off);
        }
    }

    async fn send_metadata_update(&self) -> Result<(), SignalingError> {
        if !self.opponent_supports_sdp_stream_metadata() {
            return Ok(());
        }
        self.send_voip_event(SignalingMessage::SdpStreamMetadataChanged {
            metadata: self.local_stream_metadata(),
        })
        .await
    }

    /// Put the opponent on hold or release them. Sets every
    /// transceiver to sendonly, which renegotiates.
    pub async fn set_remote_on_hold(&self, on_hold: bool) {
        if self.is_remote_on_hold() == on_hold {
            return;
        }
        info!(call_id = %self.call_id, on_hold, "setting remote hold");
        self.shared.lock().remote_on_hold = on_hold;
        if let Some(peer) = self.peer() {
            let direction = if on_hold {
                TransceiverDirection::SendOnly
            } else {
                TransceiverDirection::SendRecv
            };
            for id in peer.transceivers() {
                peer.set_direction(id, direction);
            }
        }
        self.update_mute_status();
        if let Err(err) = self.send_metadata_update().await {
            warn!(call_id = %self.call_id, error = %err, "failed to send metadata update");
        }
        self.emit(CallEvent::RemoteHoldUnhold(on_hold));
    }

    /// Start or stop screensharing; returns whether we are sharing
    /// afterwards
    pub async fn set_screensharing_enabled(&self, enabled: bool) -> bool {
        let current = self.is_screensharing();
        if enabled && current {
            warn!(call_id = %self.call_id, "there is already a screensharing stream");
            return true;
        }
        if !enabled && !current {
            warn!(call_id = %self.call_id, "no screensharing stream to disable");
            return false;
        }
        if !self.opponent_supports_sdp_stream_metadata() {
            return self.set_screensharing_without_metadata(enabled).await;
        }

        if enabled {
            match self.media.get_screensharing_stream().await {
                Ok(stream) => {
                    info!(call_id = %self.call_id, "starting screenshare");
                    self.push_new_local_feed(stream, StreamPurpose::Screenshare, true);
                    true
                }
                Err(err) => {
                    warn!(call_id = %self.call_id, error = %err, "failed to get screensharing stream");
                    false
                }
            }
        } else {
            info!(call_id = %self.call_id, "stopping screenshare");
            let Some(feed) = self.local_screensharing_feed() else {
                return false;
            };
            if let Some(peer) = self.peer() {
                for kind in [TrackKind::Audio, TrackKind::Video] {
                    let id = {
                        let s = self.shared.lock();
                        s.transceivers.get(&(StreamPurpose::Screenshare, kind)).copied()
                    };
                    if let Some(id) = id {
                        if let Err(err) = peer.remove_track(id) {
                            warn!(call_id = %self.call_id, error = %err, "failed to remove screenshare track");
                        }
                    }
                }
            }
            self.media.stop_screensharing_stream(&feed.stream());
            self.delete_feed(&feed);
            false
        }
    }

    /// Screensharing against a peer without metadata support: swap the
    /// screen track into the camera's sender so no renegotiation is
    /// needed
    async fn set_screensharing_without_metadata(&self, enabled: bool) -> bool {
        let sender = {
            let s = self.shared.lock();
            s.transceivers
                .get(&(StreamPurpose::Usermedia, TrackKind::Video))
                .copied()
        };
        if enabled {
            let stream = match self.media.get_screensharing_stream().await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(call_id = %self.call_id, error = %err, "failed to get screensharing stream");
                    return false;
                }
            };
            let Some(track) = stream.video_tracks().into_iter().next() else {
                warn!(call_id = %self.call_id, "screensharing stream has no video track");
                return false;
            };
            let Some(peer) = self.peer() else { return false };
            let Some(id) = sender else {
                warn!(call_id = %self.call_id, "no video sender to reuse for screensharing");
                return false;
            };
            if let Err(err) = peer.replace_track(id, Some(track)) {
                warn!(call_id = %self.call_id, error = %err, "failed to swap in screenshare track");
                return false;
            }
            self.push_new_local_feed(stream, StreamPurpose::Screenshare, false);
            true
        } else {
            let camera = self
                .local_usermedia_feed()
                .and_then(|f| f.stream().video_tracks().into_iter().next());
            if let (Some(peer), Some(id), Some(track)) = (self.peer(), sender, camera) {
                if let Err(err) = peer.replace_track(id, Some(track)) {
                    warn!(call_id = %self.call_id, error = %err, "failed to swap the camera back in");
                }
            }
            if let Some(feed) = self.local_screensharing_feed() {
                self.media.stop_screensharing_stream(&feed.stream());
                self.delete_feed(&feed);
            }
            false
        }
    }

    /// Add audio and/or video to a call that does not have it yet
    async fn upgrade_call(&self, audio: bool, video: bool) {
        if !audio && !video {
            return;
        }
        if !self.opponent_supports_sdp_stream_metadata() {
            debug!(call_id = %self.call_id, "cannot upgrade: opponent has no metadata support");
            return;
        }
        let want_audio = audio || self.has_local_usermedia_audio_track();
        let want_video = video || self.has_local_usermedia_video_track();
        info!(call_id = %self.call_id, audio = want_audio, video = want_video, "upgrading call");
        match self.media.get_user_media_stream(want_audio, want_video).await {
            Ok(stream) => {
                if let Err(err) = self.update_local_usermedia_stream(stream, audio, video).await {
                    error!(call_id = %self.call_id, error = %err, "failed to upgrade call");
                    self.emit(CallEvent::Error(CallError::terminal(
                        HangupReason::NoUserMedia,
                        err.to_string(),
                    )));
                }
            }
            Err(err) => {
                error!(call_id = %self.call_id, error = %err, "failed to get media for upgrade");
                self.emit(CallEvent::Error(CallError::terminal(
                    HangupReason::NoUserMedia,
                    err.to_string(),
                )));
            }
        }
    }

    /// Replace our usermedia stream, e.g. after a device switch. Force
    /// flags unmute the respective kind regardless of the current mute
    /// state.
    pub async fn update_local_usermedia_stream(
        &self,
        stream: MediaStream,
        force_audio: bool,
        force_video: bool,
    ) -> Result<(), CallError> {
        let Some(feed) = self.local_usermedia_feed() else {
            self.push_new_local_feed(stream, StreamPurpose::Usermedia, true);
            return Ok(());
        };
        let audio_enabled = force_audio || (!feed.is_audio_muted() && !self.is_remote_on_hold());
        let video_enabled = force_video || (!feed.is_video_muted() && !self.is_remote_on_hold());

        feed.set_new_stream(stream.clone());
        for track in stream.audio_tracks() {
            track.set_enabled(audio_enabled);
        }
        for track in stream.video_tracks() {
            track.set_enabled(video_enabled);
        }

        let Some(peer) = self.peer() else {
            return Ok(());
        };
        for track in stream.tracks() {
            let key = (StreamPurpose::Usermedia, track.kind());
            let existing = self.shared.lock().transceivers.get(&key).copied();
            match existing {
                Some(id) => {
                    peer.replace_track(id, Some(track.clone()))
                        .map_err(CallError::from)?;
                }
                None => {
                    let id = peer
                        .add_track(track.clone(), &stream.id())
                        .map_err(CallError::from)?;
                    self.shared.lock().transceivers.insert(key, id);
                }
            }
        }
        self.emit(CallEvent::FeedsChanged);
        Ok(())
    }

    // ------------------------------------------------------------------
    // DTMF, transfer, stats, data channels

    /// Send a DTMF digit through the usermedia audio sender
    pub fn send_dtmf_digit(&self, digit: char) -> Result<(), CallError> {
        let Some(peer) = self.peer() else {
            return Err(CallError::Peer("no peer connection".to_owned()));
        };
        let id = {
            let s = self.shared.lock();
            s.transceivers
                .get(&(StreamPurpose::Usermedia, TrackKind::Audio))
                .copied()
        };
        match id {
            Some(id) => peer
                .send_dtmf(id, &digit.to_string())
                .map_err(CallError::from),
            None => Err(CallError::Unsupported(
                "no audio track to send DTMF on".to_owned(),
            )),
        }
    }

    /// Transfer the call to another user
    pub async fn transfer(&self, target_user_id: &str) -> Result<(), CallError> {
        let profile = self
            .client
            .profile(target_user_id)
            .await
            .map_err(CallError::from)?;
        let message = SignalingMessage::Replaces {
            replacement_id: CallId::new(),
            target_user: TransferTarget {
                id: target_user_id.to_owned(),
                display_name: profile.display_name,
                avatar_url: profile.avatar_url,
            },
            create_call: Some(CallId::new()),
            await_call: None,
        };
        self.send_voip_event(message).await.map_err(CallError::from)?;
        self.terminate(CallParty::Local, HangupReason::Transferred, true)
            .await;
        Ok(())
    }

    /// Connect the opponents of two calls to each other and leave both
    pub async fn transfer_to_call(&self, other: &Arc<Call>) -> Result<(), CallError> {
        let target_user_id = other.opponent_user_id().ok_or_else(|| {
            CallError::Unsupported("transfer target call has no opponent".to_owned())
        })?;
        let transferee_user_id = self.opponent_user_id().ok_or_else(|| {
            CallError::Unsupported("this call has no opponent".to_owned())
        })?;
        let target_profile = self
            .client
            .profile(&target_user_id)
            .await
            .map_err(CallError::from)?;
        let transferee_profile = self
            .client
            .profile(&transferee_user_id)
            .await
            .map_err(CallError::from)?;

        let new_call_id = CallId::new();
        // the transfer target awaits the call the transferee creates
        other
            .send_voip_event(SignalingMessage::Replaces {
                replacement_id: new_call_id.clone(),
                target_user: TransferTarget {
                    id: transferee_user_id,
                    display_name: transferee_profile.display_name,
                    avatar_url: transferee_profile.avatar_url,
                },
                create_call: None,
                await_call: Some(new_call_id.clone()),
            })
            .await
            .map_err(CallError::from)?;
        self.send_voip_event(SignalingMessage::Replaces {
            replacement_id: new_call_id.clone(),
            target_user: TransferTarget {
                id: target_user_id,
                display_name: target_profile.display_name,
                avatar_url: target_profile.avatar_url,
            },
            create_call: Some(new_call_id),
            await_call: None,
        })
        .await
        .map_err(CallError::from)?;

        self.terminate(CallParty::Local, HangupReason::Transferred, true)
            .await;
        other
            .terminate(CallParty::Local, HangupReason::Transferred, true)
            .await;
        Ok(())
    }

    /// Stats reports for the connection: live while the call runs, the
    /// snapshot taken at termination afterwards
    pub async fn current_call_stats(&self) -> Option<Vec<serde_json::Value>> {
        if self.call_has_ended() {
            return self.shared.lock().stats_at_end.clone();
        }
        match self.peer() {
            Some(peer) => Some(peer.get_stats().await),
            None => None,
        }
    }

    /// Create a data channel on the call
    pub fn create_data_channel(&self, label: &str) -> Result<DataChannel, CallError> {
        let Some(peer) = self.peer() else {
            return Err(CallError::Peer("no peer connection".to_owned()));
        };
        let channel = peer.create_data_channel(label).map_err(CallError::from)?;
        self.emit(CallEvent::DataChannel {
            label: label.to_owned(),
        });
        Ok(channel)
    }

    /// Connection event: the peer announced a data channel
    pub fn on_data_channel(&self, channel: &DataChannel) {
        self.emit(CallEvent::DataChannel {
            label: channel.label.clone(),
        });
    }

    // ------------------------------------------------------------------
    // Replacement and termination

    /// Hand this call's role over to a replacement call
    pub async fn replaced_by(&self, new_call: &Arc<Call>) {
        info!(call_id = %self.call_id, new_call_id = %new_call.call_id, "call being replaced");
        let state = self.state();
        if state == CallState::WaitLocalMedia {
            debug!(call_id = %self.call_id, "telling replacement call to wait for local media");
            new_call.shared.lock().wait_for_local_media = true;
        } else if matches!(state, CallState::CreateOffer | CallState::InviteSent) {
            if new_call.direction() == Some(CallDirection::Outbound) {
                new_call.queue_got_call_feeds_for_answer(Vec::new()).await;
            } else {
                let feeds = self.local_feeds().iter().map(|f| f.duplicate()).collect();
                new_call.queue_got_call_feeds_for_answer(feeds).await;
            }
        }
        self.shared.lock().successor = Some(new_call.clone());
        self.emit(CallEvent::Replaced {
            new_call_id: new_call.call_id.clone(),
        });
        self.hangup(HangupReason::Replaced, true).await;
    }

    /// End the call from our side
    pub async fn hangup(&self, reason: HangupReason, suppress_event: bool) {
        let prev_state = self.state();
        if prev_state == CallState::Ended {
            return;
        }
        info!(call_id = %self.call_id, %reason, "hanging up");
        self.terminate(CallParty::Local, reason, !suppress_event)
            .await;
        // nothing to tell the other side if we never sent an invite
        if matches!(prev_state, CallState::Fledgling | CallState::WaitLocalMedia) {
            return;
        }
        // version-0 peers display any reason verbatim, so suppress the
        // normal-case one
        let send_reason = (reason != HangupReason::UserHangup
            || self.opponent_version() != Some(0))
        .then_some(reason);
        if let Err(err) = self
            .send_voip_event(SignalingMessage::Hangup { reason: send_reason })
            .await
        {
            warn!(call_id = %self.call_id, error = %err, "failed to send hangup");
        }
    }

    /// Decline a ringing call. Version-0 peers do not understand
    /// reject, so they get a hangup instead.
    pub async fn reject(&self) -> Result<(), CallError> {
        let state = self.state();
        if state != CallState::Ringing {
            return Err(CallError::InvalidState {
                state,
                message: "only a ringing call can be rejected".to_owned(),
            });
        }
        if self.opponent_version() == Some(0) {
            info!(call_id = %self.call_id, "opponent version 0, rejecting with hangup");
            self.hangup(HangupReason::UserHangup, true).await;
            return Ok(());
        }
        info!(call_id = %self.call_id, "rejecting call");
        self.terminate(CallParty::Local, HangupReason::UserHangup, true)
            .await;
        if let Err(err) = self
            .send_voip_event(SignalingMessage::Reject { reason: None })
            .await
        {
            warn!(call_id = %self.call_id, error = %err, "failed to send reject");
        }
        Ok(())
    }

    /// Drive the call into its terminal state. Idempotent: the first
    /// call wins, later calls are no-ops.
    pub(crate) async fn terminate(&self, party: CallParty, reason: HangupReason, should_emit: bool) {
        let (peer, feeds, old_state) = {
            let mut s = self.shared.lock();
            if s.state == CallState::Ended {
                return;
            }
            s.hangup_party = Some(party);
            s.hangup_reason = Some(reason);
            let old_state = s.state;
            s.state = CallState::Ended;
            s.timers.abort_all();
            s.remote_candidate_buffer.clear();
            s.tracked_remote_streams.clear();
            (s.peer.clone(), std::mem::take(&mut s.feeds), old_state)
        };
        info!(call_id = %self.call_id, ?party, %reason, "terminating call");
        self.emit(CallEvent::StateChanged {
            state: CallState::Ended,
            old_state,
        });

        // the connection is about to go away: keep a last stats snapshot
        if let Some(peer) = &peer {
            let stats = peer.get_stats().await;
            self.shared.lock().stats_at_end = Some(stats);
        }

        self.stop_media_of(&feeds);
        for feed in &feeds {
            feed.set_connected(false);
            feed.dispose();
        }
        if !feeds.is_empty() {
            self.emit(CallEvent::FeedsChanged);
        }

        if let Some(peer) = &peer {
            if !peer.is_closed() {
                peer.close();
            }
        }
        if should_emit {
            self.emit(CallEvent::Hangup { party, reason });
        }
    }

    fn stop_media_of(&self, feeds: &[Arc<CallFeed>]) {
        for feed in feeds {
            if feed.is_local() {
                match feed.purpose() {
                    StreamPurpose::Usermedia => self.media.stop_user_media_stream(&feed.stream()),
                    StreamPurpose::Screenshare => {
                        self.media.stop_screensharing_stream(&feed.stream());
                    }
                }
            } else {
                for track in feed.stream().tracks() {
                    track.stop();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Plumbing

    fn set_state(&self, new_state: CallState) {
        let old_state = {
            let mut s = self.shared.lock();
            // Ended is absorbing
            if s.state == CallState::Ended {
                return;
            }
            let old = s.state;
            s.state = new_state;
            old
        };
        debug!(call_id = %self.call_id, ?old_state, ?new_state, "call state changed");
        for feed in self.remote_feeds() {
            feed.set_connected(new_state == CallState::Connected);
        }
        self.emit(CallEvent::StateChanged {
            state: new_state,
            old_state,
        });
    }

    fn emit(&self, event: CallEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    fn create_peer_connection(&self) -> Result<Arc<dyn PeerConnection>, crate::peer::PeerError> {
        let mut ice_servers = self.turn_servers.clone();
        if ice_servers.is_empty() {
            ice_servers = self.client.turn_servers();
        }
        if ice_servers.is_empty() && self.config.allow_fallback_ice_server {
            info!(call_id = %self.call_id, "no TURN servers, using fallback STUN server");
            ice_servers.push(TurnServer {
                urls: vec![FALLBACK_ICE_SERVER.to_owned()],
                username: None,
                password: None,
                ttl: None,
            });
        }
        let peer = self.peer_factory.create(PeerConnectionConfig {
            ice_servers,
            force_turn: self.config.force_turn,
        })?;
        self.shared.lock().peer = Some(peer.clone());
        Ok(peer)
    }

    async fn send_voip_event(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let (device_id, user_id, dest_session_id, seq) = {
            let mut s = self.shared.lock();
            match s.opponent_crypto.device_id().map(str::to_owned) {
                None => (None, None, None, 0),
                Some(device_id) => {
                    let session = s.opponent_crypto.session_id().map(str::to_owned);
                    let user = s
                        .opponent_user_id
                        .clone()
                        .or_else(|| self.invitee.clone());
                    let seq = s.to_device_seq;
                    s.to_device_seq += 1;
                    (Some(device_id), user, session, seq)
                }
            }
        };

        if let Some(device_id) = device_id {
            let user_id = user_id
                .ok_or_else(|| SignalingError::Send("no opponent user id to send to".to_owned()))?;
            let envelope = SignalEnvelope {
                version: VOIP_PROTO_VERSION,
                call_id: self.call_id.clone(),
                party_id: Some(self.our_party_id.clone()),
                message,
                device_id: Some(self.client.device_id()),
                sender_session_id: Some(self.client.session_id()),
                dest_session_id,
                seq: Some(seq),
                message_id: Some(uuid::Uuid::new_v4().to_string()),
            };
            debug!(
                call_id = %self.call_id, kind = envelope.message.kind(),
                user_id = %user_id, device_id = %device_id,
                "sending to-device signal"
            );
            self.emit(CallEvent::OutgoingSignal {
                to_device: true,
                envelope: Box::new(envelope.clone()),
            });
            self.client
                .send_to_device(&user_id, &device_id, envelope)
                .await
        } else {
            let envelope = SignalEnvelope {
                version: VOIP_PROTO_VERSION,
                call_id: self.call_id.clone(),
                party_id: Some(self.our_party_id.clone()),
                message,
                device_id: None,
                sender_session_id: None,
                dest_session_id: None,
                seq: None,
                message_id: None,
            };
            debug!(
                call_id = %self.call_id, kind = envelope.message.kind(),
                "sending room signal"
            );
            self.emit(CallEvent::OutgoingSignal {
                to_device: false,
                envelope: Box::new(envelope.clone()),
            });
            self.client.send_event(&self.room_id, envelope).await
        }
    }

    async fn user_media_failed(&self, message: &str) {
        warn!(call_id = %self.call_id, error = %message, "failed to get user media, ending call");
        self.emit(CallEvent::Error(CallError::terminal(
            HangupReason::NoUserMedia,
            message,
        )));
        self.terminate(CallParty::Local, HangupReason::NoUserMedia, false)
            .await;
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("call_id", &self.call_id)
            .field("room_id", &self.room_id)
            .field("state", &self.state())
            .field("direction", &self.direction())
            .finish()
    }
}
