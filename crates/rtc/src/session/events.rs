//! Outward event surface
//!
//! Everything the embedding UI needs to observe flows through
//! [`SessionEvent`]. Events are emitted by the orchestrator's single event
//! loop; the receiver half is handed out by [`super::RtcSession::spawn`].

use crate::channels::{ChatMessage, FileOffer, TransferDirection, TransferProgress};
use crate::signaling::PeerRole;
use crate::transport::TransportConnectionState;
use std::path::PathBuf;

/// Events surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Control connection opened (identity not yet assigned)
    SignalingConnected,
    /// Endpoint assigned identities; negotiation can begin
    SignalingEstablished {
        peer_id: String,
        session_id: String,
        is_reconnection: bool,
    },
    /// Control connection closed; peer links keep operating
    SignalingDisconnected {
        code: Option<u16>,
        will_retry: bool,
    },
    /// Authentication invalid: the user must log in again
    ForcedLogout,
    /// Permission denied: no further reconnect attempts
    ReconnectDisabled,

    /// A remote peer is visible and negotiation has started
    PeerDiscovered {
        peer_id: String,
        username: String,
        role: PeerRole,
    },
    /// A remote peer left the session
    PeerLeft { peer_id: String },
    /// Engine connection state toward a peer changed
    PeerStateChanged {
        peer_id: String,
        state: TransportConnectionState,
    },
    /// A peer's connection was torn down and removed
    PeerClosed { peer_id: String },
    /// A peer published its state and capability flags
    PeerCapabilities {
        peer_id: String,
        connection_state: String,
        has_video: bool,
        has_audio: bool,
        has_screen_share: bool,
    },
    /// The peer's data channel is ready for chat and transfers
    PeerChannelOpen { peer_id: String },
    /// An inbound media stream appeared for a peer
    PeerStreamAdded { peer_id: String, stream_id: String },
    /// The peer's inbound media stream went away
    PeerStreamRemoved { peer_id: String },

    /// Chat message received
    Chat {
        from_peer_id: String,
        message: ChatMessage,
    },

    /// A peer announced a downloadable file
    TransferOffered {
        from_peer_id: String,
        offer: FileOffer,
    },
    /// One chunk moved in either direction
    TransferProgress(TransferProgress),
    /// Transfer finished; `path` is where a received file landed
    TransferCompleted {
        transfer_id: String,
        direction: TransferDirection,
        path: Option<PathBuf>,
    },
    /// Transfer was cancelled or failed
    TransferFailed {
        transfer_id: String,
        direction: TransferDirection,
        reason: String,
    },
}

impl SessionEvent {
    /// Event name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SignalingConnected => "signaling_connected",
            Self::SignalingEstablished { .. } => "signaling_established",
            Self::SignalingDisconnected { .. } => "signaling_disconnected",
            Self::ForcedLogout => "forced_logout",
            Self::ReconnectDisabled => "reconnect_disabled",
            Self::PeerDiscovered { .. } => "peer_discovered",
            Self::PeerLeft { .. } => "peer_left",
            Self::PeerStateChanged { .. } => "peer_state_changed",
            Self::PeerClosed { .. } => "peer_closed",
            Self::PeerCapabilities { .. } => "peer_capabilities",
            Self::PeerChannelOpen { .. } => "peer_channel_open",
            Self::PeerStreamAdded { .. } => "peer_stream_added",
            Self::PeerStreamRemoved { .. } => "peer_stream_removed",
            Self::Chat { .. } => "chat",
            Self::TransferOffered { .. } => "transfer_offered",
            Self::TransferProgress(_) => "transfer_progress",
            Self::TransferCompleted { .. } => "transfer_completed",
            Self::TransferFailed { .. } => "transfer_failed",
        }
    }
}
