//! Core call types and data structures

use crate::signaling::SignalEnvelope;
use serde::{Deserialize, Serialize};

/// Protocol version advertised in every signalling message.
///
/// Version 0 peers predate per-party-id disambiguation and stream
/// metadata; the engine degrades to single-stream, unchecked-party-id
/// behaviour when talking to them.
pub const VOIP_PROTO_VERSION: u32 = 1;

/// The fallback ICE server to use for STUN when no TURN servers are configured.
pub const FALLBACK_ICE_SERVER: &str = "stun:turn.matrix.org";

/// Unique identifier for a call
///
/// Millisecond timestamp plus a random suffix, so ids sort roughly by
/// creation time while staying globally unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    /// Generate a new call ID
    pub fn new() -> Self {
        use rand::Rng;
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let suffix: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        Self(format!("{millis}{suffix}"))
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Party identifier: the device id of one endpoint of the call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartyId(pub String);

impl PartyId {
    /// Create a party ID from a device id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for PartyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Call state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Newly created, nothing has happened yet
    Fledgling,
    /// Waiting for local media acquisition
    WaitLocalMedia,
    /// Local feeds pushed, waiting to produce the initial offer
    CreateOffer,
    /// Invite sent, waiting for an answer
    InviteSent,
    /// Inbound call ringing, waiting for the user to answer
    Ringing,
    /// Producing an answer to an inbound invite
    CreateAnswer,
    /// Descriptions exchanged, waiting for media connectivity
    Connecting,
    /// Media is flowing
    Connected,
    /// Terminal and absorbing: nothing transitions out of here
    Ended,
}

/// Whether we placed or received the call. Fixed at creation; also
/// determines politeness during glare resolution (inbound is polite).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    /// We received this call
    Inbound,
    /// We placed this call
    Outbound,
}

/// Which side of the call initiated a hangup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallParty {
    /// Our side
    Local,
    /// The opponent's side
    Remote,
}

/// Voice or video call, derived from the media in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    /// Audio only
    Voice,
    /// Audio and video
    Video,
}

/// Reason codes carried on hangup/reject messages and terminal errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HangupReason {
    /// The user chose to end the call
    UserHangup,
    /// The local client failed to create an offer
    LocalOfferFailed,
    /// No local mic/camera to use: hardware missing or access denied
    NoUserMedia,
    /// Sending failed because unknown devices were present
    UnknownDevices,
    /// Failed to send the invite for some other reason
    SendInvite,
    /// An answer could not be created
    CreateAnswer,
    /// An offer could not be created
    CreateOffer,
    /// Failed to send the answer for some other reason
    SendAnswer,
    /// The opponent's session description could not be applied
    SetRemoteDescription,
    /// Our own session description could not be applied
    SetLocalDescription,
    /// A different device answered the call
    AnsweredElsewhere,
    /// No media connection could be established
    IceFailed,
    /// The invite timed out whilst waiting for an answer
    InviteTimeout,
    /// The call was replaced by another call
    Replaced,
    /// Signalling could not be sent, even with retries
    #[serde(rename = "signalling_timeout")]
    SignallingFailed,
    /// The remote party is busy
    UserBusy,
    /// We transferred the call off to somewhere else
    Transferred,
    /// A call from the same user arrived with a new session id
    NewSession,
}

impl std::fmt::Display for HangupReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // reuse the wire names
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// Errors surfaced by call operations and carried on error events
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CallError {
    /// An error that ends (or ended) the call, with its reason code
    #[error("{reason}: {message}")]
    Terminal {
        /// The machine-readable reason code
        reason: HangupReason,
        /// Human-readable context for logs and diagnostics
        message: String,
    },

    /// The call is in the wrong state for the requested operation
    #[error("call is in state {state:?}: {message}")]
    InvalidState {
        /// The state the call was actually in
        state: CallState,
        /// What was attempted
        message: String,
    },

    /// The requested operation is not possible on this call
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The signalling layer failed
    #[error("signalling failed: {0}")]
    Signaling(String),

    /// The peer connection failed
    #[error("peer connection error: {0}")]
    Peer(String),
}

impl CallError {
    /// Create a terminal call error
    pub fn terminal(reason: HangupReason, message: impl Into<String>) -> Self {
        Self::Terminal {
            reason,
            message: message.into(),
        }
    }
}

impl From<crate::signaling::SignalingError> for CallError {
    fn from(err: crate::signaling::SignalingError) -> Self {
        Self::Signaling(err.to_string())
    }
}

impl From<crate::peer::PeerError> for CallError {
    fn from(err: crate::peer::PeerError) -> Self {
        Self::Peer(err.to_string())
    }
}

impl From<crate::media::MediaError> for CallError {
    fn from(err: crate::media::MediaError) -> Self {
        Self::Terminal {
            reason: HangupReason::NoUserMedia,
            message: err.to_string(),
        }
    }
}

/// What a stream within a call is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamPurpose {
    /// Camera + microphone
    #[serde(rename = "m.usermedia")]
    Usermedia,
    /// Screen capture
    #[serde(rename = "m.screenshare")]
    Screenshare,
}

/// Per-stream metadata attached to invites/answers/negotiations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// What the stream is for
    pub purpose: StreamPurpose,
    /// Whether the sender has muted its audio
    #[serde(default)]
    pub audio_muted: bool,
    /// Whether the sender has muted its video
    #[serde(default)]
    pub video_muted: bool,
}

/// Map from stream id to its metadata
pub type StreamMetadataMap = std::collections::HashMap<String, StreamMetadata>;

/// Capabilities advertised in invites and answers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallCapabilities {
    /// Whether this side can be transferred to another user
    #[serde(rename = "m.call.transferee", default)]
    pub transferee: bool,
    /// Whether this side supports receiving DTMF digits
    #[serde(rename = "m.call.dtmf", default)]
    pub dtmf: bool,
}

/// A third-party asserted identity, e.g. from a PSTN gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertedIdentity {
    /// The asserted identifier
    pub id: String,
    /// Display name for the asserted identity
    pub display_name: String,
}

/// A TURN or STUN server for ICE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    /// Server URIs
    pub urls: Vec<String>,
    /// Optional username credential
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Optional password credential
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Credential lifetime in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

/// Global profile info for a user, used when transferring calls
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Avatar URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Everything we know about the opponent's device, for encrypted
/// to-device signalling. Crypto info without a device id is
/// unrepresentable by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpponentCrypto {
    /// Room-event signalling: no specific device
    Unknown,
    /// We know the device but have no session to pin messages to
    DeviceOnly {
        /// The opponent's device id
        device_id: String,
    },
    /// Full addressing: device and session
    Full {
        /// The opponent's device id
        device_id: String,
        /// The opponent's session id
        session_id: String,
    },
}

impl OpponentCrypto {
    /// The opponent device id, if one is known
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::Unknown => None,
            Self::DeviceOnly { device_id } | Self::Full { device_id, .. } => Some(device_id),
        }
    }

    /// The opponent session id, if one is known
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Full { session_id, .. } => Some(session_id),
            _ => None,
        }
    }
}

/// Tunable parameters for a call.
///
/// Defaults mirror the protocol recommendations; embedders mostly only
/// touch `allow_no_media` and `push_to_talk`.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How long an invite rings before we give up
    pub invite_lifetime: std::time::Duration,
    /// How long ICE may stay disconnected before we hang up
    pub ice_disconnected_timeout: std::time::Duration,
    /// How long after an ICE disconnect we attempt an ICE restart
    pub ice_reconnect_delay: std::time::Duration,
    /// Batching delay for outbound candidates on inbound calls
    pub candidate_delay_inbound: std::time::Duration,
    /// Batching delay for outbound candidates on outbound calls
    /// (longer, since the callee needs a while to answer)
    pub candidate_delay_outbound: std::time::Duration,
    /// Upper bound on candidate-send retries before abandoning the call
    pub candidate_send_retry_limit: u32,
    /// Grace period after setting a local description to let early
    /// candidates ride along in the same message
    pub gather_grace: std::time::Duration,
    /// Delay before stopping the camera track after muting video, so
    /// the frozen last frame the peer sees is black rather than stale
    pub stop_video_track_delay: std::time::Duration,
    /// Interval of the call-length clock once connected
    pub call_length_tick: std::time::Duration,
    /// Permit calls with no usable remote media (data-channel only)
    pub allow_no_media: bool,
    /// Cap the opus bitrate for push-to-talk style calls
    pub push_to_talk: bool,
    /// Force relaying through TURN
    pub force_turn: bool,
    /// Inject the fallback STUN server when no TURN servers are configured
    pub allow_fallback_ice_server: bool,
    /// Whether we advertise the transferee capability
    pub supports_call_transfer: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        use std::time::Duration;
        Self {
            invite_lifetime: Duration::from_secs(60),
            ice_disconnected_timeout: Duration::from_secs(30),
            ice_reconnect_delay: Duration::from_secs(2),
            candidate_delay_inbound: Duration::from_millis(500),
            candidate_delay_outbound: Duration::from_millis(2000),
            candidate_send_retry_limit: 5,
            gather_grace: Duration::from_millis(200),
            stop_video_track_delay: Duration::from_millis(120),
            call_length_tick: Duration::from_secs(1),
            allow_no_media: false,
            push_to_talk: false,
            force_turn: false,
            allow_fallback_ice_server: false,
            supports_call_transfer: false,
        }
    }
}

/// Call lifecycle events for embedder/telemetry consumption
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// The state machine moved
    StateChanged {
        /// The new state
        state: CallState,
        /// The state we left
        old_state: CallState,
    },
    /// The call ended; the terminal reason and which side ended it
    Hangup {
        /// Which side hung up
        party: CallParty,
        /// Why
        reason: HangupReason,
    },
    /// A terminal error occurred
    Error(CallError),
    /// This call was replaced by a successor
    Replaced {
        /// The id of the replacement call
        new_call_id: CallId,
    },
    /// The value of `is_local_on_hold` changed
    LocalHoldUnhold(bool),
    /// The value of `is_remote_on_hold` changed
    RemoteHoldUnhold(bool),
    /// The feed list changed
    FeedsChanged,
    /// A remote asserted identity arrived or changed
    AssertedIdentityChanged(AssertedIdentity),
    /// The call length clock ticked (seconds since connected)
    LengthChanged(u64),
    /// A data channel was created or announced by the peer
    DataChannel {
        /// The channel label
        label: String,
    },
    /// The call instantiated its peer connection
    PeerConnectionCreated,
    /// Mirror of every outgoing signalling message, for telemetry
    OutgoingSignal {
        /// Whether this went over to-device messaging
        to_device: bool,
        /// The full envelope as sent
        envelope: Box<SignalEnvelope>,
    },
}
