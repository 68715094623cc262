//! Peer connection registry
//!
//! Owns the per-peer negotiation state machine: initiation tie-breaks,
//! offer/answer handling, ICE candidate buffering, renegotiation on local
//! media changes, and teardown. The registry is owned exclusively by the
//! orchestrator's event loop; all mutation happens through the operations
//! here, one event at a time.

use super::connection::{NegotiationState, PeerConnection};
use crate::config::DATA_CHANNEL_LABEL;
use crate::error::{Error, Result};
use crate::signaling::{PeerCheck, SignalingSession};
use crate::transport::{
    IceCandidateInit, IceServer, LocalTrack, TrackSource, TransportConnectionState,
    TransportEvent, TransportFactory,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Registry outcomes the orchestrator reacts to.
#[derive(Debug)]
pub enum PeerNotice {
    /// Engine reported a new connection state for this peer
    StateChanged {
        peer_id: String,
        state: TransportConnectionState,
    },
    /// The peer's data channel is open for traffic
    ChannelOpen { peer_id: String },
    /// A text frame arrived on the peer's data channel
    ChannelMessage { peer_id: String, payload: Bytes },
    /// An inbound media stream appeared
    StreamAdded { peer_id: String, stream_id: String },
    /// The inbound media stream went away
    StreamRemoved { peer_id: String },
    /// The record was torn down and removed
    Removed { peer_id: String },
}

/// Registry of all live peer connections, keyed by peer identity.
pub struct PeerRegistry {
    local_peer_id: Option<String>,
    factory: Arc<dyn TransportFactory>,
    signaling: SignalingSession,
    transport_events: mpsc::Sender<TransportEvent>,
    peers: HashMap<String, PeerConnection>,
    local_tracks: HashMap<TrackSource, Arc<dyn LocalTrack>>,
    /// ICE servers from configuration, used until the endpoint supplies a list
    fallback_ice_servers: Vec<IceServer>,
    endpoint_ice_servers: Vec<IceServer>,
}

impl PeerRegistry {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        signaling: SignalingSession,
        transport_events: mpsc::Sender<TransportEvent>,
        fallback_ice_servers: Vec<IceServer>,
    ) -> Self {
        Self {
            local_peer_id: None,
            factory,
            signaling,
            transport_events,
            peers: HashMap::new(),
            local_tracks: HashMap::new(),
            fallback_ice_servers,
            endpoint_ice_servers: Vec::new(),
        }
    }

    /// Record the identity the endpoint assigned to this client.
    pub fn set_local_peer_id(&mut self, peer_id: String) {
        self.local_peer_id = Some(peer_id);
    }

    /// Record the ICE server list supplied by the endpoint.
    pub fn set_ice_servers(&mut self, servers: Vec<IceServer>) {
        if !servers.is_empty() {
            self.endpoint_ice_servers = servers;
        }
    }

    /// Local capability flags: (has_video, has_audio, has_screen_share).
    pub fn local_capabilities(&self) -> (bool, bool, bool) {
        (
            self.local_tracks.contains_key(&TrackSource::Camera),
            self.local_tracks.contains_key(&TrackSource::Microphone),
            self.local_tracks.contains_key(&TrackSource::Screen),
        )
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Negotiation state of a peer, if known.
    pub fn peer_state(&self, peer_id: &str) -> Option<NegotiationState> {
        self.peers.get(peer_id).map(|p| p.state)
    }

    /// Number of ICE candidates a peer has queued, if known.
    pub fn queued_candidates(&self, peer_id: &str) -> Option<usize> {
        self.peers.get(peer_id).map(|p| p.queued_candidates())
    }

    // ------------------------------------------------------------------
    // Discovery and negotiation
    // ------------------------------------------------------------------

    /// A peer is present and ready for negotiation.
    ///
    /// Creates the connection, attaches local media, opens the data channel,
    /// and applies the initiation tie-break: the side whose identity sorts
    /// lexicographically lower creates the offer, the other side waits. With
    /// unique identities exactly one side initiates, so no two offers are
    /// ever in flight for the same pair.
    pub async fn handle_peer_check(&mut self, check: PeerCheck) {
        let Some(local_id) = self.local_peer_id.clone() else {
            warn!("Ignoring peer discovery before identity assignment");
            return;
        };
        if self.peers.contains_key(&check.from_peer_id) {
            debug!("Already tracking peer {}", check.from_peer_id);
            return;
        }

        let peer_id = check.from_peer_id.clone();
        let transport = match self.create_transport(&peer_id).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Failed to create connection for {}: {}", peer_id, e);
                return;
            }
        };

        let mut peer = PeerConnection::new(
            peer_id.clone(),
            check.from_user_id,
            check.from_username,
            check.peer_role,
            transport,
        );

        for track in self.local_tracks.values() {
            if let Err(e) = peer.transport.add_track(Arc::clone(track)).await {
                warn!("Failed to attach local track for {}: {}", peer_id, e);
            }
        }

        match peer.transport.create_data_channel(DATA_CHANNEL_LABEL).await {
            Ok(channel) => peer.data_channel = Some(channel),
            Err(e) => {
                warn!("Failed to create data channel for {}: {}", peer_id, e);
                let _ = peer.transport.close().await;
                return;
            }
        }

        if local_id < peer_id {
            match peer.transport.create_offer().await {
                Ok(sdp) => {
                    peer.offered = true;
                    peer.state = NegotiationState::Offering;
                    self.signaling.send_offer(&peer_id, sdp).await;
                    info!("Initiating negotiation with {}", peer_id);
                }
                Err(e) => {
                    warn!("Failed to create offer for {}: {}", peer_id, e);
                    let _ = peer.transport.close().await;
                    return;
                }
            }
        } else {
            peer.state = NegotiationState::AwaitingOffer;
            debug!("Waiting for offer from {}", peer_id);
        }

        self.peers.insert(peer_id, peer);
    }

    /// Apply a remote offer and reply with an answer.
    ///
    /// An unknown sender gets a fresh record (role defaults to participant);
    /// a known sender is a renegotiation and reuses the existing record.
    pub async fn handle_offer(&mut self, from_peer_id: &str, sdp: String) {
        if !self.peers.contains_key(from_peer_id) {
            let transport = match self.create_transport(from_peer_id).await {
                Ok(transport) => transport,
                Err(e) => {
                    warn!("Failed to create connection for {}: {}", from_peer_id, e);
                    return;
                }
            };
            let peer = PeerConnection::new(
                from_peer_id.to_string(),
                String::new(),
                String::new(),
                Default::default(),
                transport,
            );
            for track in self.local_tracks.values() {
                if let Err(e) = peer.transport.add_track(Arc::clone(track)).await {
                    warn!("Failed to attach local track for {}: {}", from_peer_id, e);
                }
            }
            self.peers.insert(from_peer_id.to_string(), peer);
        }

        // Single mutable borrow for the whole description exchange
        let answer = {
            let Some(peer) = self.peers.get_mut(from_peer_id) else {
                return;
            };

            if let Err(e) = peer.transport.set_remote_offer(&sdp).await {
                warn!("Failed to apply offer from {}: {}", from_peer_id, e);
                return;
            }
            peer.mark_remote_description();
            Self::drain_queued_candidates(peer).await;

            match peer.transport.create_answer().await {
                Ok(answer) => {
                    peer.answered = true;
                    peer.state = NegotiationState::Negotiating;
                    answer
                }
                Err(e) => {
                    warn!("Failed to create answer for {}: {}", from_peer_id, e);
                    return;
                }
            }
        };
        self.signaling.send_answer(from_peer_id, answer).await;
        debug!("Answered offer from {}", from_peer_id);
    }

    /// Apply a remote answer. Never creates a record: an answer for an
    /// unknown peer is a negotiation fault, logged and dropped.
    pub async fn handle_answer(&mut self, from_peer_id: &str, sdp: String) {
        let Some(peer) = self.peers.get_mut(from_peer_id) else {
            warn!("Ignoring answer from unknown peer {}", from_peer_id);
            return;
        };
        if let Err(e) = peer.transport.set_remote_answer(&sdp).await {
            warn!("Failed to apply answer from {}: {}", from_peer_id, e);
            return;
        }
        peer.mark_remote_description();
        peer.state = NegotiationState::Negotiating;
        Self::drain_queued_candidates(peer).await;
        debug!("Applied answer from {}", from_peer_id);
    }

    /// Apply or buffer a remote ICE candidate.
    ///
    /// The engine rejects candidates applied before a remote description, so
    /// early arrivals are queued FIFO and replayed once a description is set.
    pub async fn handle_ice_candidate(&mut self, from_peer_id: &str, candidate: IceCandidateInit) {
        let Some(peer) = self.peers.get_mut(from_peer_id) else {
            warn!("Ignoring ICE candidate from unknown peer {}", from_peer_id);
            return;
        };
        if peer.has_remote_description() {
            if let Err(e) = peer.transport.add_ice_candidate(candidate).await {
                warn!("Failed to apply candidate from {}: {}", from_peer_id, e);
            }
        } else {
            peer.queue_candidate(candidate);
            debug!(
                "Queued candidate from {} ({} pending)",
                from_peer_id,
                peer.queued_candidates()
            );
        }
    }

    async fn drain_queued_candidates(peer: &mut PeerConnection) {
        let queued = peer.drain_candidates();
        if queued.is_empty() {
            return;
        }
        debug!(
            "Draining {} queued candidates for {}",
            queued.len(),
            peer.peer_id
        );
        for candidate in queued {
            if let Err(e) = peer.transport.add_ice_candidate(candidate).await {
                warn!("Failed to apply queued candidate for {}: {}", peer.peer_id, e);
            }
        }
    }

    /// The peer left the session: close and remove its record, if present.
    pub async fn handle_peer_left(&mut self, peer_id: &str) {
        if self.teardown_peer(peer_id).await {
            info!("Closed connection for departed peer {}", peer_id);
        }
    }

    // ------------------------------------------------------------------
    // Engine events
    // ------------------------------------------------------------------

    /// Process one engine event, returning the notices the orchestrator
    /// should surface. Teardown here affects only the single peer named by
    /// the event.
    pub async fn handle_transport_event(&mut self, event: TransportEvent) -> Vec<PeerNotice> {
        match event {
            TransportEvent::IceCandidate { peer_id, candidate } => {
                self.signaling.send_ice_candidate(&peer_id, candidate).await;
                Vec::new()
            }

            TransportEvent::ConnectionState { peer_id, state } => {
                if !self.peers.contains_key(&peer_id) {
                    debug!("State change for unknown peer {}: {:?}", peer_id, state);
                    return Vec::new();
                }

                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.state = match state {
                        TransportConnectionState::Connected => NegotiationState::Connected,
                        TransportConnectionState::Failed => NegotiationState::Failed,
                        TransportConnectionState::Disconnected => NegotiationState::Disconnected,
                        TransportConnectionState::Closed => NegotiationState::Closed,
                        _ => peer.state,
                    };
                }

                // Publish every transition so the remote side and any
                // listening UI can reflect it.
                let (has_video, has_audio, has_screen_share) = self.local_capabilities();
                self.signaling
                    .send_peer_state(state.as_str(), has_video, has_audio, has_screen_share)
                    .await;

                let mut notices = vec![PeerNotice::StateChanged {
                    peer_id: peer_id.clone(),
                    state,
                }];
                if state.is_fatal() {
                    info!("Connection to {} is {}; tearing down", peer_id, state.as_str());
                    self.teardown_peer(&peer_id).await;
                    notices.push(PeerNotice::Removed { peer_id });
                }
                notices
            }

            TransportEvent::DataChannelOpen { peer_id, channel } => {
                match self.peers.get_mut(&peer_id) {
                    Some(peer) => {
                        peer.data_channel = Some(channel);
                        debug!("Data channel open for {}", peer_id);
                        vec![PeerNotice::ChannelOpen { peer_id }]
                    }
                    None => {
                        warn!("Data channel opened for unknown peer {}", peer_id);
                        Vec::new()
                    }
                }
            }

            TransportEvent::DataChannelMessage { peer_id, payload } => {
                vec![PeerNotice::ChannelMessage { peer_id, payload }]
            }

            TransportEvent::DataChannelClosed { peer_id } => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.data_channel = None;
                }
                Vec::new()
            }

            TransportEvent::TrackAdded { peer_id, stream_id } => {
                match self.peers.get_mut(&peer_id) {
                    Some(peer) => {
                        peer.remote_stream = Some(stream_id.clone());
                        vec![PeerNotice::StreamAdded { peer_id, stream_id }]
                    }
                    None => Vec::new(),
                }
            }

            TransportEvent::TrackRemoved { peer_id, .. } => {
                match self.peers.get_mut(&peer_id) {
                    Some(peer) => {
                        peer.remote_stream = None;
                        vec![PeerNotice::StreamRemoved { peer_id }]
                    }
                    None => Vec::new(),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Local media
    // ------------------------------------------------------------------

    /// Attach an acquired local track to every connection and renegotiate
    /// established links.
    pub async fn enable_track(&mut self, track: Arc<dyn LocalTrack>) {
        let source = track.source();
        self.local_tracks.insert(source, Arc::clone(&track));
        for peer in self.peers.values() {
            if let Err(e) = peer.transport.add_track(Arc::clone(&track)).await {
                warn!("Failed to attach track for {}: {}", peer.peer_id, e);
            }
        }
        self.renegotiate_established().await;
    }

    /// Detach the local track for `source` everywhere and renegotiate
    /// established links.
    pub async fn disable_track(&mut self, source: TrackSource) {
        if self.local_tracks.remove(&source).is_none() {
            return;
        }
        for peer in self.peers.values() {
            if let Err(e) = peer.transport.remove_track(source).await {
                warn!("Failed to detach track for {}: {}", peer.peer_id, e);
            }
        }
        self.renegotiate_established().await;
    }

    /// Re-run the offer/answer exchange on established links after a local
    /// capability change. The existing record is reused; the counterpart's
    /// offer handling accepts the fresh offer uninterrupted.
    async fn renegotiate_established(&mut self) {
        let mut offers = Vec::new();
        for peer in self.peers.values_mut() {
            if peer.state != NegotiationState::Connected {
                continue;
            }
            match peer.transport.create_offer().await {
                Ok(sdp) => {
                    peer.offered = true;
                    offers.push((peer.peer_id.clone(), sdp));
                }
                Err(e) => warn!("Failed to renegotiate with {}: {}", peer.peer_id, e),
            }
        }
        for (peer_id, sdp) in offers {
            info!("Renegotiating with {}", peer_id);
            self.signaling.send_offer(&peer_id, sdp).await;
        }
    }

    // ------------------------------------------------------------------
    // Data channel fan-out
    // ------------------------------------------------------------------

    /// Send a text frame to every peer with an open channel. Returns how
    /// many peers received it.
    pub async fn broadcast_text(&self, text: &str) -> usize {
        let mut delivered = 0;
        for peer in self.peers.values() {
            let Some(channel) = peer.data_channel.as_ref() else {
                continue;
            };
            if !channel.is_open() {
                continue;
            }
            match channel.send_text(text).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Broadcast to {} failed: {}", peer.peer_id, e),
            }
        }
        delivered
    }

    /// Open data channel for a peer, if any.
    pub fn channel(&self, peer_id: &str) -> Option<Arc<dyn crate::transport::DataChannel>> {
        self.peers
            .get(peer_id)
            .and_then(|p| p.data_channel.clone())
            .filter(|c| c.is_open())
    }

    /// Send a text frame to one peer.
    pub async fn send_text_to(&self, peer_id: &str, text: &str) -> Result<()> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| Error::Negotiation(format!("unknown peer {}", peer_id)))?;
        let channel = peer
            .data_channel
            .as_ref()
            .ok_or_else(|| Error::DataChannel(format!("no channel for {}", peer_id)))?;
        channel.send_text(text).await
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Close and remove a single record: data channel first, then the engine
    /// connection, then bookkeeping. Returns whether a record existed.
    /// Other peers are never touched.
    pub async fn teardown_peer(&mut self, peer_id: &str) -> bool {
        let Some(mut peer) = self.peers.remove(peer_id) else {
            return false;
        };
        peer.state = NegotiationState::Closed;
        if let Some(channel) = peer.data_channel.take() {
            if let Err(e) = channel.close().await {
                debug!("Closing channel for {}: {}", peer_id, e);
            }
        }
        peer.remote_stream = None;
        if let Err(e) = peer.transport.close().await {
            warn!("Closing connection for {}: {}", peer_id, e);
        }
        true
    }

    /// Session teardown: close every record.
    pub async fn close_all(&mut self) {
        let peer_ids: Vec<String> = self.peers.keys().cloned().collect();
        for peer_id in peer_ids {
            self.teardown_peer(&peer_id).await;
        }
    }

    /// Event sender handed to the engine for new connections.
    pub fn transport_events(&self) -> mpsc::Sender<TransportEvent> {
        self.transport_events.clone()
    }

    async fn create_transport(&self, peer_id: &str) -> Result<Arc<dyn crate::transport::PeerTransport>> {
        let servers = if self.endpoint_ice_servers.is_empty() {
            &self.fallback_ice_servers
        } else {
            &self.endpoint_ice_servers
        };
        self.factory
            .create_peer(peer_id, servers, self.transport_events.clone())
            .await
    }
}
