//! Control-plane abstraction over the platform WebRTC stack
//!
//! The engine never touches media packets. Everything it needs from
//! the underlying peer connection is expressed here: description
//! exchange, ICE, transceiver management, DTMF and stats. Embedders
//! implement [`PeerConnection`] over their platform stack and feed
//! connection events back into the owning call.

use crate::types::TurnServer;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Errors from the underlying peer connection
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Creating an offer or answer failed
    #[error("failed to create {kind}: {reason}")]
    CreateDescription {
        /// "offer" or "answer"
        kind: &'static str,
        /// What went wrong
        reason: String,
    },

    /// A description could not be applied
    #[error("failed to set {side} description: {reason}")]
    SetDescription {
        /// "local" or "remote"
        side: &'static str,
        /// What went wrong
        reason: String,
    },

    /// An ICE candidate was rejected
    #[error("failed to add ICE candidate: {0}")]
    AddCandidate(String),

    /// A transceiver operation failed
    #[error("transceiver operation failed: {0}")]
    Transceiver(String),

    /// The connection is closed
    #[error("peer connection is closed")]
    Closed,

    /// The platform failed to construct a connection
    #[error("failed to create peer connection: {0}")]
    Create(String),
}

/// The type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// An offer
    Offer,
    /// A final answer
    Answer,
    /// A provisional answer
    Pranswer,
    /// Roll back a pending offer
    Rollback,
}

/// An SDP session description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// The SDP text
    pub sdp: String,
}

/// A trickled ICE candidate.
///
/// The end-of-candidates sentinel is a candidate whose `candidate`
/// string is empty; legacy peers may instead omit both `sdp_mid` and
/// `sdp_m_line_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// The candidate line
    pub candidate: String,
    /// The media section this belongs to, by mid
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// The media section this belongs to, by index
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    /// The end-of-candidates sentinel as we send it
    pub fn end_of_candidates() -> Self {
        Self {
            candidate: String::new(),
            sdp_mid: Some("0".to_owned()),
            sdp_m_line_index: Some(0),
        }
    }

    /// True if this candidate marks the end of gathering, in either
    /// the modern (empty string) or legacy (no mid, no index) form
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.is_empty() || (self.sdp_mid.is_none() && self.sdp_m_line_index.is_none())
    }
}

/// WebRTC signalling state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No exchange in progress
    Stable,
    /// We applied a local offer
    HaveLocalOffer,
    /// We applied a remote offer
    HaveRemoteOffer,
    /// We applied a local provisional answer
    HaveLocalPranswer,
    /// We applied a remote provisional answer
    HaveRemotePranswer,
    /// The connection is closed
    Closed,
}

/// ICE connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    /// Not started
    New,
    /// Candidate pairs are being checked
    Checking,
    /// A usable pair was found
    Connected,
    /// Checking finished with a usable pair
    Completed,
    /// Connectivity was lost, may recover on its own
    Disconnected,
    /// Connectivity was lost and will not recover without a restart
    Failed,
    /// The connection is closed
    Closed,
}

/// ICE gathering state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    /// Not started
    New,
    /// Candidates are being gathered
    Gathering,
    /// Gathering has finished
    Complete,
}

/// Transceiver directionality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    /// Sending and receiving
    SendRecv,
    /// Sending only
    SendOnly,
    /// Receiving only
    RecvOnly,
    /// Neither
    Inactive,
}

/// Opaque handle to a transceiver on a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransceiverId(pub usize);

/// A data channel handle
#[derive(Debug, Clone)]
pub struct DataChannel {
    /// The channel label
    pub label: String,
}

/// Configuration for constructing a peer connection
#[derive(Debug, Clone)]
pub struct PeerConnectionConfig {
    /// ICE servers to use
    pub ice_servers: Vec<TurnServer>,
    /// Only use relay candidates
    pub force_turn: bool,
}

/// The control plane of one WebRTC peer connection.
///
/// Connection events (negotiation needed, local candidates, incoming
/// tracks, state changes) flow the other way: the embedder invokes the
/// corresponding `Call::on_*` methods when its platform stack fires
/// them.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an offer reflecting the current transceivers
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Create an answer to the currently applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply a local description
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply a remote description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// The currently applied local description, if any
    fn local_description(&self) -> Option<SessionDescription>;

    /// Add a remote ICE candidate (including end-of-candidates)
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Current signalling state
    fn signaling_state(&self) -> SignalingState;

    /// Current ICE connection state
    fn ice_connection_state(&self) -> IceConnectionState;

    /// Current ICE gathering state
    fn ice_gathering_state(&self) -> IceGatheringState;

    /// Streams constructed from the applied remote description
    fn remote_streams(&self) -> Vec<crate::media::MediaStream>;

    /// Attach a sending track, creating or reusing a transceiver
    fn add_track(
        &self,
        track: Arc<crate::media::MediaTrack>,
        stream_id: &str,
    ) -> Result<TransceiverId, PeerError>;

    /// Add a receive-only transceiver for the given kind
    fn add_recv_only_transceiver(
        &self,
        kind: crate::media::TrackKind,
    ) -> Result<TransceiverId, PeerError>;

    /// Detach the sending track of a transceiver
    fn remove_track(&self, id: TransceiverId) -> Result<(), PeerError>;

    /// Swap the sending track of a transceiver without renegotiating
    fn replace_track(
        &self,
        id: TransceiverId,
        track: Option<Arc<crate::media::MediaTrack>>,
    ) -> Result<(), PeerError>;

    /// Set the preferred direction of a transceiver
    fn set_direction(&self, id: TransceiverId, direction: TransceiverDirection);

    /// The preferred direction of a transceiver
    fn direction(&self, id: TransceiverId) -> Option<TransceiverDirection>;

    /// The negotiated direction of a transceiver, once negotiated
    fn current_direction(&self, id: TransceiverId) -> Option<TransceiverDirection>;

    /// All transceivers on this connection
    fn transceivers(&self) -> Vec<TransceiverId>;

    /// Queue DTMF digits on the given (audio) transceiver
    fn send_dtmf(&self, id: TransceiverId, digits: &str) -> Result<(), PeerError>;

    /// Whether the platform supports an in-place ICE restart
    fn can_restart_ice(&self) -> bool;

    /// Request an ICE restart; triggers negotiation-needed
    fn restart_ice(&self);

    /// Create a data channel
    fn create_data_channel(&self, label: &str) -> Result<DataChannel, PeerError>;

    /// A snapshot of the connection's stats reports
    async fn get_stats(&self) -> Vec<serde_json::Value>;

    /// Close the connection; idempotent
    fn close(&self);

    /// Whether the connection has been closed
    fn is_closed(&self) -> bool;
}

/// Constructs peer connections for new calls
pub trait PeerConnectionFactory: Send + Sync {
    /// Build a connection with the given ICE configuration
    fn create(&self, config: PeerConnectionConfig) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
