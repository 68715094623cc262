//! Transport engine capability
//!
//! The real-time engine (peer connections, ICE, DTLS, media) is an external
//! collaborator. This module defines the narrow seam the core talks through:
//! a factory that creates per-peer connections, a handle per connection, and
//! a single event stream the engine pushes callbacks into. The production
//! adapter over the `webrtc` crate lives in [`webrtc`]; tests substitute an
//! in-memory engine.

mod types;
pub mod webrtc;

pub use types::{IceCandidateInit, IceServer};

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connection lifecycle states reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportConnectionState {
    /// Wire representation used in `peer.state_update` messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }

    /// States that require the owning record to be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected)
    }
}

/// Kind of locally captured media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSource {
    Camera,
    Microphone,
    Screen,
}

/// Events pushed by the engine into the registry's event loop.
///
/// Every engine callback (candidate gathered, state change, channel open,
/// inbound message, remote track) becomes one of these, tagged with the peer
/// identity the connection was created for.
pub enum TransportEvent {
    /// A local ICE candidate was gathered and should be relayed to the peer
    IceCandidate {
        peer_id: String,
        candidate: IceCandidateInit,
    },
    /// The connection moved to a new lifecycle state
    ConnectionState {
        peer_id: String,
        state: TransportConnectionState,
    },
    /// A data channel (local or remote-initiated) is open for traffic
    DataChannelOpen {
        peer_id: String,
        channel: Arc<dyn DataChannel>,
    },
    /// A text message arrived on the peer's data channel
    DataChannelMessage { peer_id: String, payload: Bytes },
    /// The peer's data channel closed
    DataChannelClosed { peer_id: String },
    /// An inbound media stream was added by the remote peer
    TrackAdded { peer_id: String, stream_id: String },
    /// An inbound media stream went away
    TrackRemoved { peer_id: String, stream_id: String },
}

/// Opaque handle to a locally captured media track.
///
/// The engine adapter downcasts to its own concrete type; the core only
/// tracks which source a handle came from.
pub trait LocalTrack: Send + Sync {
    /// Which capture source produced this track
    fn source(&self) -> TrackSource;
    /// Downcast support for engine adapters
    fn as_any(&self) -> &dyn Any;
}

/// Device/display capture capability.
///
/// Acquisition failures surface from here and abort the enabling operation
/// before any track is attached or renegotiation triggered.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire a track from the given source.
    async fn acquire(&self, source: TrackSource) -> Result<Arc<dyn LocalTrack>>;
}

/// An ordered-reliable message channel riding on a peer connection.
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Channel label
    fn label(&self) -> &str;

    /// Whether the channel is currently open for traffic
    fn is_open(&self) -> bool;

    /// Send one text message; fails if the channel is not open.
    async fn send_text(&self, text: &str) -> Result<()>;

    /// Close the channel.
    async fn close(&self) -> Result<()>;
}

/// One engine-level peer connection.
///
/// Offer/answer helpers also install the matching local description, so the
/// returned SDP is ready to put on the wire.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an offer and set it as the local description.
    async fn create_offer(&self) -> Result<String>;

    /// Create an answer and set it as the local description.
    async fn create_answer(&self) -> Result<String>;

    /// Apply a remote offer.
    async fn set_remote_offer(&self, sdp: &str) -> Result<()>;

    /// Apply a remote answer.
    async fn set_remote_answer(&self, sdp: &str) -> Result<()>;

    /// Apply a remote ICE candidate. Requires a remote description.
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()>;

    /// Open a data channel with the given label.
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    /// Attach a local media track.
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<()>;

    /// Detach the local track for the given source, if attached.
    async fn remove_track(&self, source: TrackSource) -> Result<()>;

    /// Close the connection. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Factory for engine-level peer connections.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create a connection for `peer_id`, delivering engine callbacks into
    /// `events`.
    async fn create_peer(
        &self,
        peer_id: &str,
        ice_servers: &[IceServer],
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>>;
}
