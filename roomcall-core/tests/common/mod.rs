//! Shared test doubles: a recording signalling client, a scriptable
//! peer connection and a canned media handler.

#![allow(dead_code, clippy::unwrap_used)]

use async_trait::async_trait;
use parking_lot::Mutex;
use roomcall_core::call::{Call, CallOpts};
use roomcall_core::media::{MediaError, MediaHandler, MediaStream, MediaTrack, TrackKind};
use roomcall_core::peer::{
    DataChannel, IceCandidate, IceConnectionState, IceGatheringState, PeerConnection,
    PeerConnectionConfig, PeerConnectionFactory, PeerError, SdpType, SessionDescription,
    SignalingState, TransceiverDirection, TransceiverId,
};
use roomcall_core::signaling::{
    CallClient, IncomingSignal, SignalEnvelope, SignalingError, SignalingMessage,
};
use roomcall_core::types::{
    CallCapabilities, CallConfig, CallId, PartyId, Profile, StreamMetadata, StreamMetadataMap,
    StreamPurpose, TurnServer,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub const LOCAL_USER: &str = "@alice:example.org";
pub const LOCAL_DEVICE: &str = "ALICEDEVICE";
pub const REMOTE_USER: &str = "@bob:example.org";
pub const REMOTE_PARTY: &str = "BOBDEVICE";
pub const ROOM: &str = "!call:example.org";

/// One message the call tried to send, with its routing
#[derive(Debug, Clone)]
pub struct SentSignal {
    pub to_device: bool,
    pub envelope: SignalEnvelope,
}

/// Records everything sent; can be told to fail the next N sends
pub struct MockClient {
    pub sent: Mutex<Vec<SentSignal>>,
    pub fail_next_sends: AtomicU32,
    pub turn: Mutex<Vec<TurnServer>>,
}

impl MockClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail_next_sends: AtomicU32::new(0),
            turn: Mutex::new(Vec::new()),
        })
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent
            .lock()
            .iter()
            .map(|s| s.envelope.message.kind())
            .collect()
    }

    pub fn last_of_kind(&self, kind: &str) -> Option<SentSignal> {
        self.sent
            .lock()
            .iter()
            .rev()
            .find(|s| s.envelope.message.kind() == kind)
            .cloned()
    }

    fn try_send(&self, to_device: bool, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        let remaining = self.fail_next_sends.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_sends.store(remaining - 1, Ordering::SeqCst);
            return Err(SignalingError::Send("injected failure".into()));
        }
        self.sent.lock().push(SentSignal { to_device, envelope });
        Ok(())
    }
}

#[async_trait]
impl CallClient for MockClient {
    fn user_id(&self) -> String {
        LOCAL_USER.to_owned()
    }

    fn device_id(&self) -> String {
        LOCAL_DEVICE.to_owned()
    }

    fn session_id(&self) -> String {
        "alice-session".to_owned()
    }

    async fn send_event(
        &self,
        _room_id: &str,
        envelope: SignalEnvelope,
    ) -> Result<(), SignalingError> {
        self.try_send(false, envelope)
    }

    async fn send_to_device(
        &self,
        _user_id: &str,
        _device_id: &str,
        envelope: SignalEnvelope,
    ) -> Result<(), SignalingError> {
        self.try_send(true, envelope)
    }

    async fn check_turn_servers(&self) -> bool {
        !self.turn.lock().is_empty()
    }

    fn turn_servers(&self) -> Vec<TurnServer> {
        self.turn.lock().clone()
    }

    async fn resolve_opponent_device(
        &self,
        _user_id: &str,
        _device_id: &str,
    ) -> Result<(), SignalingError> {
        Ok(())
    }

    async fn profile(&self, _user_id: &str) -> Result<Profile, SignalingError> {
        Ok(Profile {
            display_name: Some("Someone".to_owned()),
            avatar_url: None,
        })
    }
}

struct MockTransceiver {
    track: Option<Arc<MediaTrack>>,
    direction: TransceiverDirection,
    current_direction: Option<TransceiverDirection>,
}

struct PeerState {
    signaling: SignalingState,
    ice_connection: IceConnectionState,
    ice_gathering: IceGatheringState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_streams: Vec<MediaStream>,
    added_candidates: Vec<IceCandidate>,
    transceivers: Vec<MockTransceiver>,
    dtmf: Vec<(TransceiverId, String)>,
    closed: bool,
    fail_set_remote: bool,
    fail_create_answer: bool,
    can_restart_ice: bool,
    ice_restarts: u32,
}

/// Scriptable peer connection: descriptions are canned, state
/// transitions follow the usual offer/answer rules
pub struct MockPeer {
    state: Mutex<PeerState>,
}

impl MockPeer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PeerState {
                signaling: SignalingState::Stable,
                ice_connection: IceConnectionState::New,
                ice_gathering: IceGatheringState::New,
                local: None,
                remote: None,
                remote_streams: Vec::new(),
                added_candidates: Vec::new(),
                transceivers: Vec::new(),
                dtmf: Vec::new(),
                closed: false,
                fail_set_remote: false,
                fail_create_answer: false,
                can_restart_ice: true,
                ice_restarts: 0,
            }),
        })
    }

    pub fn set_remote_streams(&self, streams: Vec<MediaStream>) {
        self.state.lock().remote_streams = streams;
    }

    pub fn set_ice_connection_state(&self, state: IceConnectionState) {
        self.state.lock().ice_connection = state;
    }

    pub fn set_signaling_state(&self, state: SignalingState) {
        self.state.lock().signaling = state;
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn set_fail_set_remote(&self, fail: bool) {
        self.state.lock().fail_set_remote = fail;
    }

    pub fn set_fail_create_answer(&self, fail: bool) {
        self.state.lock().fail_create_answer = fail;
    }

    pub fn set_can_restart_ice(&self, can: bool) {
        self.state.lock().can_restart_ice = can;
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().added_candidates.clone()
    }

    pub fn dtmf_sent(&self) -> Vec<(TransceiverId, String)> {
        self.state.lock().dtmf.clone()
    }

    pub fn ice_restarts(&self) -> u32 {
        self.state.lock().ice_restarts
    }

    pub fn sending_track(&self, id: TransceiverId) -> Option<Arc<MediaTrack>> {
        self.state
            .lock()
            .transceivers
            .get(id.0)
            .and_then(|t| t.track.clone())
    }

    /// Mark every transceiver's negotiated direction, as a completed
    /// renegotiation would
    pub fn settle_directions(&self, direction: TransceiverDirection) {
        for t in self.state.lock().transceivers.iter_mut() {
            t.current_direction = Some(direction);
        }
    }
}

const MOCK_OFFER_SDP: &str = "v=0\r\n\
    o=- 1 1 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
    a=rtpmap:111 opus/48000/2\r\n\
    a=fmtp:111 minptime=10\r\n";

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: MOCK_OFFER_SDP.to_owned(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if self.state.lock().fail_create_answer {
            return Err(PeerError::CreateDescription {
                kind: "answer",
                reason: "injected failure".into(),
            });
        }
        Ok(SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: MOCK_OFFER_SDP.to_owned(),
        })
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut s = self.state.lock();
        s.signaling = match desc.sdp_type {
            SdpType::Offer => SignalingState::HaveLocalOffer,
            _ => SignalingState::Stable,
        };
        s.local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut s = self.state.lock();
        if s.fail_set_remote {
            return Err(PeerError::SetDescription {
                side: "remote",
                reason: "injected failure".into(),
            });
        }
        s.signaling = match desc.sdp_type {
            SdpType::Offer => SignalingState::HaveRemoteOffer,
            _ => SignalingState::Stable,
        };
        s.remote = Some(desc);
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.state.lock().added_candidates.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice_connection
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        self.state.lock().ice_gathering
    }

    fn remote_streams(&self) -> Vec<MediaStream> {
        self.state.lock().remote_streams.clone()
    }

    fn add_track(
        &self,
        track: Arc<MediaTrack>,
        _stream_id: &str,
    ) -> Result<TransceiverId, PeerError> {
        let mut s = self.state.lock();
        s.transceivers.push(MockTransceiver {
            track: Some(track),
            direction: TransceiverDirection::SendRecv,
            current_direction: None,
        });
        Ok(TransceiverId(s.transceivers.len() - 1))
    }

    fn add_recv_only_transceiver(&self, _kind: TrackKind) -> Result<TransceiverId, PeerError> {
        let mut s = self.state.lock();
        s.transceivers.push(MockTransceiver {
            track: None,
            direction: TransceiverDirection::RecvOnly,
            current_direction: None,
        });
        Ok(TransceiverId(s.transceivers.len() - 1))
    }

    fn remove_track(&self, id: TransceiverId) -> Result<(), PeerError> {
        let mut s = self.state.lock();
        match s.transceivers.get_mut(id.0) {
            Some(t) => {
                t.track = None;
                Ok(())
            }
            None => Err(PeerError::Transceiver("no such transceiver".into())),
        }
    }

    fn replace_track(
        &self,
        id: TransceiverId,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), PeerError> {
        let mut s = self.state.lock();
        match s.transceivers.get_mut(id.0) {
            Some(t) => {
                t.track = track;
                Ok(())
            }
            None => Err(PeerError::Transceiver("no such transceiver".into())),
        }
    }

    fn set_direction(&self, id: TransceiverId, direction: TransceiverDirection) {
        if let Some(t) = self.state.lock().transceivers.get_mut(id.0) {
            t.direction = direction;
        }
    }

    fn direction(&self, id: TransceiverId) -> Option<TransceiverDirection> {
        self.state.lock().transceivers.get(id.0).map(|t| t.direction)
    }

    fn current_direction(&self, id: TransceiverId) -> Option<TransceiverDirection> {
        self.state
            .lock()
            .transceivers
            .get(id.0)
            .and_then(|t| t.current_direction)
    }

    fn transceivers(&self) -> Vec<TransceiverId> {
        (0..self.state.lock().transceivers.len())
            .map(TransceiverId)
            .collect()
    }

    fn send_dtmf(&self, id: TransceiverId, digits: &str) -> Result<(), PeerError> {
        self.state.lock().dtmf.push((id, digits.to_owned()));
        Ok(())
    }

    fn can_restart_ice(&self) -> bool {
        self.state.lock().can_restart_ice
    }

    fn restart_ice(&self) {
        self.state.lock().ice_restarts += 1;
    }

    fn create_data_channel(&self, label: &str) -> Result<DataChannel, PeerError> {
        Ok(DataChannel {
            label: label.to_owned(),
        })
    }

    async fn get_stats(&self) -> Vec<serde_json::Value> {
        vec![serde_json::json!({"type": "transport"})]
    }

    fn close(&self) {
        self.state.lock().closed = true;
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

pub struct MockPeerFactory {
    pub peer: Arc<MockPeer>,
    pub configs: Mutex<Vec<PeerConnectionConfig>>,
}

impl MockPeerFactory {
    pub fn new(peer: Arc<MockPeer>) -> Arc<Self> {
        Arc::new(Self {
            peer,
            configs: Mutex::new(Vec::new()),
        })
    }
}

impl PeerConnectionFactory for MockPeerFactory {
    fn create(&self, config: PeerConnectionConfig) -> Result<Arc<dyn PeerConnection>, PeerError> {
        self.configs.lock().push(config);
        Ok(self.peer.clone())
    }
}

/// Hands out streams with exactly the requested tracks
pub struct MockMedia {
    pub fail_user_media: AtomicU32,
    pub fail_when_video: AtomicU32,
    pub stopped_streams: Mutex<Vec<String>>,
    pub has_audio: bool,
    pub has_video: bool,
}

impl MockMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_user_media: AtomicU32::new(0),
            fail_when_video: AtomicU32::new(0),
            stopped_streams: Mutex::new(Vec::new()),
            has_audio: true,
            has_video: true,
        })
    }
}

#[async_trait]
impl MediaHandler for MockMedia {
    async fn get_user_media_stream(
        &self,
        audio: bool,
        video: bool,
    ) -> Result<MediaStream, MediaError> {
        if self.fail_user_media.load(Ordering::SeqCst) > 0 {
            self.fail_user_media.fetch_sub(1, Ordering::SeqCst);
            return Err(MediaError::UserMedia("injected failure".into()));
        }
        if video && self.fail_when_video.load(Ordering::SeqCst) > 0 {
            self.fail_when_video.fetch_sub(1, Ordering::SeqCst);
            return Err(MediaError::UserMedia("no camera".into()));
        }
        let mut tracks = Vec::new();
        if audio {
            tracks.push(MediaTrack::new(TrackKind::Audio));
        }
        if video {
            tracks.push(MediaTrack::new(TrackKind::Video));
        }
        Ok(MediaStream::new(tracks))
    }

    async fn get_screensharing_stream(&self) -> Result<MediaStream, MediaError> {
        Ok(MediaStream::new(vec![MediaTrack::new(TrackKind::Video)]))
    }

    fn stop_user_media_stream(&self, stream: &MediaStream) {
        self.stopped_streams.lock().push(stream.id());
    }

    fn stop_screensharing_stream(&self, stream: &MediaStream) {
        self.stopped_streams.lock().push(stream.id());
    }

    async fn has_audio_device(&self) -> bool {
        self.has_audio
    }

    async fn has_video_device(&self) -> bool {
        self.has_video
    }
}

/// Everything a test needs to drive one call
pub struct Harness {
    pub client: Arc<MockClient>,
    pub media: Arc<MockMedia>,
    pub peer: Arc<MockPeer>,
    pub call: Arc<Call>,
}

/// Route engine logs through the test harness; safe to call repeatedly
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn harness_with(opts: CallOpts) -> Harness {
    init_tracing();
    let client = MockClient::new();
    let media = MockMedia::new();
    let peer = MockPeer::new();
    let factory = MockPeerFactory::new(peer.clone());
    let call = Call::new(client.clone(), media.clone(), factory, None, opts);
    Harness {
        client,
        media,
        peer,
        call,
    }
}

pub fn harness() -> Harness {
    harness_with(CallOpts::new(ROOM))
}

pub fn harness_with_config(config: CallConfig) -> Harness {
    let mut opts = CallOpts::new(ROOM);
    opts.config = config;
    harness_with(opts)
}

pub fn offer_description() -> SessionDescription {
    SessionDescription {
        sdp_type: SdpType::Offer,
        sdp: MOCK_OFFER_SDP.to_owned(),
    }
}

pub fn answer_description() -> SessionDescription {
    SessionDescription {
        sdp_type: SdpType::Answer,
        sdp: MOCK_OFFER_SDP.to_owned(),
    }
}

pub fn usermedia_metadata(stream_id: &str) -> StreamMetadataMap {
    let mut map = StreamMetadataMap::new();
    map.insert(
        stream_id.to_owned(),
        StreamMetadata {
            purpose: StreamPurpose::Usermedia,
            audio_muted: false,
            video_muted: false,
        },
    );
    map
}

pub fn signal_from(
    sender: &str,
    party: Option<&str>,
    version: u32,
    call_id: &CallId,
    message: SignalingMessage,
) -> IncomingSignal {
    IncomingSignal {
        sender: sender.to_owned(),
        age: None,
        envelope: SignalEnvelope {
            version,
            call_id: call_id.clone(),
            party_id: party.map(PartyId::new),
            message,
            device_id: None,
            sender_session_id: None,
            dest_session_id: None,
            seq: None,
            message_id: None,
        },
    }
}

pub fn invite_signal(call_id: &CallId, stream_id: &str) -> IncomingSignal {
    signal_from(
        REMOTE_USER,
        Some(REMOTE_PARTY),
        1,
        call_id,
        SignalingMessage::Invite {
            offer: offer_description(),
            lifetime: 60_000,
            invitee: None,
            capabilities: CallCapabilities::default(),
            metadata: Some(usermedia_metadata(stream_id)),
        },
    )
}

pub fn answer_signal(call_id: &CallId, party: &str, stream_id: &str) -> IncomingSignal {
    signal_from(
        REMOTE_USER,
        Some(party),
        1,
        call_id,
        SignalingMessage::Answer {
            answer: answer_description(),
            capabilities: CallCapabilities::default(),
            metadata: Some(usermedia_metadata(stream_id)),
        },
    )
}

pub fn remote_audio_stream(id: &str) -> MediaStream {
    MediaStream::with_id(id.to_owned(), vec![MediaTrack::new(TrackKind::Audio)])
}

/// Drive an outbound call all the way to invite-sent
pub async fn place_outbound(h: &Harness) {
    h.call.place_voice_call().await.unwrap();
    h.call.on_negotiation_needed().await;
}

/// Drive an outbound call to connected against a canned answer
pub async fn connect_outbound(h: &Harness, remote_stream_id: &str) {
    place_outbound(h).await;
    h.peer
        .set_remote_streams(vec![remote_audio_stream(remote_stream_id)]);
    h.call
        .on_answer_received(answer_signal(h.call.call_id(), REMOTE_PARTY, remote_stream_id))
        .await;
    h.peer
        .set_ice_connection_state(IceConnectionState::Connected);
    h.call.on_ice_connection_state_change().await;
}

/// Drive an inbound call to ringing from a canned invite
pub async fn ring_inbound(h: &Harness, remote_stream_id: &str) {
    h.peer
        .set_remote_streams(vec![remote_audio_stream(remote_stream_id)]);
    h.call
        .init_with_invite(invite_signal(h.call.call_id(), remote_stream_id))
        .await
        .unwrap();
}
