//! Per-peer negotiation record

use crate::signaling::PeerRole;
use crate::transport::{DataChannel, IceCandidateInit, PeerTransport};
use std::collections::VecDeque;
use std::sync::Arc;

/// Negotiation lifecycle for one remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Peer discovered, no description exchanged yet
    Discovered,
    /// We created and sent the offer (tie-break winner)
    Offering,
    /// Waiting for the remote side to offer (tie-break loser)
    AwaitingOffer,
    /// Descriptions are being exchanged
    Negotiating,
    /// Engine reports the link established
    Connected,
    Disconnected,
    Failed,
    /// Terminal cleanup state
    Closed,
}

/// Everything the registry tracks for one remote peer.
///
/// The engine connection is exclusively owned by this record and closed
/// exactly once: on peer-left, on a fatal engine state, or on session
/// teardown.
pub struct PeerConnection {
    pub peer_id: String,
    pub user_id: String,
    pub username: String,
    pub role: PeerRole,
    pub state: NegotiationState,
    /// We have sent an offer for the current negotiation round
    pub offered: bool,
    /// We have sent an answer for the current negotiation round
    pub answered: bool,
    /// Candidates that arrived before a remote description existed, in
    /// arrival order
    pending_candidates: VecDeque<IceCandidateInit>,
    remote_description_set: bool,
    pub transport: Arc<dyn PeerTransport>,
    pub data_channel: Option<Arc<dyn DataChannel>>,
    /// Inbound media stream reported by the engine, if any
    pub remote_stream: Option<String>,
}

impl PeerConnection {
    pub fn new(
        peer_id: String,
        user_id: String,
        username: String,
        role: PeerRole,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            peer_id,
            user_id,
            username,
            role,
            state: NegotiationState::Discovered,
            offered: false,
            answered: false,
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
            transport,
            data_channel: None,
            remote_stream: None,
        }
    }

    /// Whether a remote description has been applied.
    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    /// Record that a remote description was applied.
    pub fn mark_remote_description(&mut self) {
        self.remote_description_set = true;
    }

    /// Queue a candidate that arrived before the remote description.
    pub fn queue_candidate(&mut self, candidate: IceCandidateInit) {
        self.pending_candidates.push_back(candidate);
    }

    /// Drain queued candidates in their original arrival order.
    pub fn drain_candidates(&mut self) -> Vec<IceCandidateInit> {
        self.pending_candidates.drain(..).collect()
    }

    /// Number of candidates waiting for a remote description.
    pub fn queued_candidates(&self) -> usize {
        self.pending_candidates.len()
    }
}
