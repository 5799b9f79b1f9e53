//! Wire message shapes and the signalling client abstraction
//!
//! Messages are exchanged over an unreliable, partially-ordered
//! transport: any message may be lost, delayed, duplicated or arrive
//! before the message that logically precedes it. The [`Call`] state
//! machine is written to tolerate all of that; this module only
//! defines the shapes and the sending interface.
//!
//! [`Call`]: crate::call::Call

use crate::peer::{IceCandidate, SessionDescription};
use crate::types::{
    AssertedIdentity, CallCapabilities, CallId, HangupReason, PartyId, Profile,
    StreamMetadataMap, TurnServer,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors raised by the signalling client
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    /// The transport failed to deliver the message
    #[error("failed to send signalling message: {0}")]
    Send(String),

    /// Encrypted sending refused because the recipient has devices we
    /// have never seen keys for
    #[error("unknown devices present for {user_id}")]
    UnknownDevices {
        /// The user whose device list contains unknown devices
        user_id: String,
    },

    /// A profile lookup failed
    #[error("profile unavailable for {user_id}: {reason}")]
    ProfileUnavailable {
        /// The user whose profile was requested
        user_id: String,
        /// What went wrong
        reason: String,
    },
}

/// The body of a signalling message, tagged by `type` on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Start a call: the initial offer
    Invite {
        /// The caller's session description
        offer: SessionDescription,
        /// How long the invite is valid for, in milliseconds
        lifetime: u64,
        /// Restrict the call to this user (room signalling only)
        #[serde(skip_serializing_if = "Option::is_none")]
        invitee: Option<String>,
        /// What the caller supports
        #[serde(default)]
        capabilities: CallCapabilities,
        /// Metadata for the streams carried in the offer
        #[serde(rename = "sdp_stream_metadata", skip_serializing_if = "Option::is_none")]
        metadata: Option<StreamMetadataMap>,
    },

    /// Accept a call: the answering description
    Answer {
        /// The callee's session description
        answer: SessionDescription,
        /// What the callee supports
        #[serde(default)]
        capabilities: CallCapabilities,
        /// Metadata for the streams carried in the answer
        #[serde(rename = "sdp_stream_metadata", skip_serializing_if = "Option::is_none")]
        metadata: Option<StreamMetadataMap>,
    },

    /// A batch of ICE candidates, possibly ending with the
    /// end-of-candidates sentinel (empty candidate string)
    Candidates {
        /// The candidates, in gathering order
        candidates: Vec<IceCandidate>,
    },

    /// Mid-call renegotiation: a new offer or answer
    Negotiate {
        /// The new session description
        description: SessionDescription,
        /// Updated metadata for the streams in the description
        #[serde(rename = "sdp_stream_metadata", skip_serializing_if = "Option::is_none")]
        metadata: Option<StreamMetadataMap>,
    },

    /// The caller announces which answering device it picked
    SelectAnswer {
        /// The party id whose answer was selected
        selected_party_id: PartyId,
    },

    /// End an established or outgoing call
    Hangup {
        /// Why the call ended; absent means user hangup
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<HangupReason>,
    },

    /// Decline a ringing call without answering it
    Reject {
        /// Why the call was rejected
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<HangupReason>,
    },

    /// Mute state changed without renegotiation
    SdpStreamMetadataChanged {
        /// The updated metadata map
        #[serde(rename = "sdp_stream_metadata")]
        metadata: StreamMetadataMap,
    },

    /// A third party asserts the identity of the remote end
    AssertedIdentity {
        /// The asserted identity
        asserted_identity: AssertedIdentity,
    },

    /// Transfer this call to another user or call
    Replaces {
        /// The id the replacement call will use
        replacement_id: CallId,
        /// Who the call is being transferred to
        target_user: TransferTarget,
        /// The transferee should place a call with this id
        #[serde(skip_serializing_if = "Option::is_none")]
        create_call: Option<CallId>,
        /// The transferee should await a call with this id
        #[serde(skip_serializing_if = "Option::is_none")]
        await_call: Option<CallId>,
    },
}

impl SignalingMessage {
    /// The wire `type` of this message, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Invite { .. } => "invite",
            Self::Answer { .. } => "answer",
            Self::Candidates { .. } => "candidates",
            Self::Negotiate { .. } => "negotiate",
            Self::SelectAnswer { .. } => "select_answer",
            Self::Hangup { .. } => "hangup",
            Self::Reject { .. } => "reject",
            Self::SdpStreamMetadataChanged { .. } => "sdp_stream_metadata_changed",
            Self::AssertedIdentity { .. } => "asserted_identity",
            Self::Replaces { .. } => "replaces",
        }
    }
}

/// The target of a call transfer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferTarget {
    /// The target user id
    pub id: String,
    /// Display name, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Avatar URL, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// A complete signalling message as it travels on the wire: routing
/// fields plus the typed body.
///
/// The to-device fields are only populated when the message is pinned
/// to a specific opponent device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalEnvelope {
    /// Protocol version; 0 is the legacy degrade mode
    pub version: u32,
    /// Which call this belongs to
    pub call_id: CallId,
    /// The sender's party id; absent from version-0 peers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub party_id: Option<PartyId>,
    /// The message body
    #[serde(flatten)]
    pub message: SignalingMessage,
    /// Sending device id (to-device only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Sender session id (to-device only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_session_id: Option<String>,
    /// Destination session id (to-device only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_session_id: Option<String>,
    /// Per-call monotonically increasing sequence number (to-device only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Random id for deduplication (to-device only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// An inbound signalling message with its delivery context
#[derive(Debug, Clone)]
pub struct IncomingSignal {
    /// Who sent it
    pub sender: String,
    /// How long ago it was sent, when the transport knows
    pub age: Option<std::time::Duration>,
    /// The envelope as received
    pub envelope: SignalEnvelope,
}

impl IncomingSignal {
    /// The sender's party id, normalized for version: version-0 peers
    /// are treated as having sent no party id even if one is present.
    pub fn party_id(&self) -> Option<PartyId> {
        if self.envelope.version == 0 {
            None
        } else {
            self.envelope.party_id.clone()
        }
    }
}

/// The client-side services a call needs from its embedder: identity,
/// message delivery, TURN credentials and directory lookups.
///
/// Implementations own transport concerns entirely, including
/// encryption of to-device traffic.
#[async_trait]
pub trait CallClient: Send + Sync {
    /// Our own user id
    fn user_id(&self) -> String;

    /// Our own device id; doubles as our party id
    fn device_id(&self) -> String;

    /// Our own session id, advertised in to-device envelopes
    fn session_id(&self) -> String;

    /// Broadcast an envelope to the room
    async fn send_event(&self, room_id: &str, envelope: SignalEnvelope)
        -> Result<(), SignalingError>;

    /// Send an envelope to one specific device of one user
    async fn send_to_device(
        &self,
        user_id: &str,
        device_id: &str,
        envelope: SignalEnvelope,
    ) -> Result<(), SignalingError>;

    /// Ensure TURN credentials are fresh; returns false when no TURN
    /// servers could be obtained
    async fn check_turn_servers(&self) -> bool;

    /// The TURN servers currently known to the client
    fn turn_servers(&self) -> Vec<TurnServer>;

    /// Ensure we hold keys for the given device, so encrypted
    /// to-device sending will not be refused later
    async fn resolve_opponent_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<(), SignalingError>;

    /// Look up a user's global profile
    async fn profile(&self, user_id: &str) -> Result<Profile, SignalingError>;
}
