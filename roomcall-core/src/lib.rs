//! Peer-to-peer call engine: signalling state machine and media
//! negotiation for 1:1 VoIP calls.
//!
//! The engine owns the call lifecycle (offer/answer, trickled ICE,
//! glare resolution, hold, mute, screenshare, transfer, DTMF) while
//! staying independent of any particular WebRTC stack or transport.
//! Embedders implement three traits and wire platform events into the
//! call:
//!
//! - [`CallClient`](signaling::CallClient) delivers signalling messages
//!   and answers directory/TURN queries
//! - [`PeerConnection`](peer::PeerConnection) wraps one platform peer
//!   connection
//! - [`MediaHandler`](media::MediaHandler) acquires and releases
//!   capture devices
//!
//! ```no_run
//! use roomcall_core::call::{Call, CallOpts};
//! # async fn example(
//! #     client: std::sync::Arc<dyn roomcall_core::signaling::CallClient>,
//! #     media: std::sync::Arc<dyn roomcall_core::media::MediaHandler>,
//! #     peers: std::sync::Arc<dyn roomcall_core::peer::PeerConnectionFactory>,
//! # ) -> Result<(), roomcall_core::types::CallError> {
//! let call = Call::new(client, media, peers, None, CallOpts::new("!room:example.org"));
//! let mut events = call.subscribe();
//! call.place_voice_call().await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// The call state machine
pub mod call;
/// Per-stream feeds with mute state and speaking detection
pub mod feed;
/// Local media model and audio analysis
pub mod media;
/// Peer connection control-plane abstraction
pub mod peer;
/// SDP codec-parameter transforms
pub mod sdp;
/// Wire message shapes and the signalling client abstraction
pub mod signaling;
/// Core call types
pub mod types;

pub use call::{Call, CallOpts};
pub use feed::{CallFeed, FeedEvent, FeedOpts};
pub use media::{MediaHandler, MediaStream, MediaTrack, TrackKind};
pub use peer::{
    IceCandidate, PeerConnection, PeerConnectionConfig, PeerConnectionFactory, SessionDescription,
};
pub use signaling::{CallClient, IncomingSignal, SignalEnvelope, SignalingMessage};
pub use types::{
    CallConfig, CallDirection, CallError, CallEvent, CallId, CallState, CallType, HangupReason,
    PartyId, StreamPurpose,
};
