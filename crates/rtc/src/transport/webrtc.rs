//! Engine adapter over the `webrtc` crate
//!
//! Binds the capability traits in [`super`] to real peer connections. Engine
//! callbacks (candidates, state changes, channels, tracks) are forwarded
//! into the registry's event channel; nothing here holds negotiation state.

use super::{
    DataChannel, IceCandidateInit, IceServer, LocalTrack, PeerTransport, TrackSource,
    TransportConnectionState, TransportEvent, TransportFactory,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

/// A local track backed by an engine `TrackLocal`.
///
/// Embedders capture media however they like (camera, screen grabber, test
/// source) and hand the resulting track in through [`super::MediaSource`].
pub struct WebRtcLocalTrack {
    source: TrackSource,
    track: Arc<dyn TrackLocal + Send + Sync>,
}

impl WebRtcLocalTrack {
    pub fn new(source: TrackSource, track: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        Self { source, track }
    }
}

impl LocalTrack for WebRtcLocalTrack {
    fn source(&self) -> TrackSource {
        self.source
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// [`TransportFactory`] producing `webrtc`-backed connections.
pub struct WebRtcEngine {
    api: API,
}

impl WebRtcEngine {
    /// Build the engine with default codecs and interceptors registered.
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::Transport(format!("codec registration: {}", e)))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::Transport(format!("interceptor registration: {}", e)))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl TransportFactory for WebRtcEngine {
    async fn create_peer(
        &self,
        peer_id: &str,
        ice_servers: &[IceServer],
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| Error::Transport(format!("peer connection: {}", e)))?,
        );

        let peer = WebRtcPeer {
            peer_id: peer_id.to_string(),
            pc: Arc::clone(&pc),
            senders: Mutex::new(HashMap::new()),
            events: events.clone(),
        };
        peer.install_callbacks();
        Ok(Arc::new(peer))
    }
}

struct WebRtcPeer {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackSource, Arc<RTCRtpSender>>>,
    events: mpsc::Sender<TransportEvent>,
}

impl WebRtcPeer {
    fn install_callbacks(&self) {
        let events = self.events.clone();
        let peer_id = self.peer_id.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        debug!("ICE gathering complete for {}", peer_id);
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events
                                .send(TransportEvent::IceCandidate {
                                    peer_id,
                                    candidate: IceCandidateInit {
                                        candidate: init.candidate,
                                        sdp_mid: init.sdp_mid,
                                        sdp_mline_index: init.sdp_mline_index,
                                    },
                                })
                                .await;
                        }
                        Err(e) => warn!("Serializing candidate for {}: {}", peer_id, e),
                    }
                })
            }));

        let events = self.events.clone();
        let peer_id = self.peer_id.clone();
        self.pc.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = events.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    let state = match state {
                        RTCPeerConnectionState::New => TransportConnectionState::New,
                        RTCPeerConnectionState::Connecting => TransportConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => TransportConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => {
                            TransportConnectionState::Disconnected
                        }
                        RTCPeerConnectionState::Failed => TransportConnectionState::Failed,
                        RTCPeerConnectionState::Closed => TransportConnectionState::Closed,
                        _ => return,
                    };
                    let _ = events
                        .send(TransportEvent::ConnectionState { peer_id, state })
                        .await;
                })
            },
        ));

        let events = self.events.clone();
        let peer_id = self.peer_id.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = events.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    debug!("Inbound data channel '{}' from {}", dc.label(), peer_id);
                    wire_channel(&peer_id, dc, &events);
                })
            }));

        let events = self.events.clone();
        let peer_id = self.peer_id.clone();
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = events.clone();
            let peer_id = peer_id.clone();
            Box::pin(async move {
                let stream_id = track.stream_id().to_string();
                debug!("Remote track for {}: stream {}", peer_id, stream_id);
                let _ = events
                    .send(TransportEvent::TrackAdded { peer_id, stream_id })
                    .await;
            })
        }));
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::Transport(format!("create offer: {}", e)))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::Transport(format!("local description: {}", e)))?;
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Transport(format!("create answer: {}", e)))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::Transport(format!("local description: {}", e)))?;
        Ok(sdp)
    }

    async fn set_remote_offer(&self, sdp: &str) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| Error::Transport(format!("invalid offer: {}", e)))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::Transport(format!("remote description: {}", e)))
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| Error::Transport(format!("invalid answer: {}", e)))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::Transport(format!("remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        let init = webrtc::ice_transport::ice_candidate::RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::Transport(format!("add candidate: {}", e)))
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(|e| Error::DataChannel(format!("create channel: {}", e)))?;
        Ok(wire_channel(&self.peer_id, dc, &self.events))
    }

    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<()> {
        let source = track.source();
        let engine_track = track
            .as_any()
            .downcast_ref::<WebRtcLocalTrack>()
            .ok_or_else(|| Error::Media("track was not produced for this engine".into()))?;
        let sender = self
            .pc
            .add_track(Arc::clone(&engine_track.track))
            .await
            .map_err(|e| Error::Transport(format!("add track: {}", e)))?;
        self.senders.lock().insert(source, sender);
        Ok(())
    }

    async fn remove_track(&self, source: TrackSource) -> Result<()> {
        let sender = self.senders.lock().remove(&source);
        if let Some(sender) = sender {
            self.pc
                .remove_track(&sender)
                .await
                .map_err(|e| Error::Transport(format!("remove track: {}", e)))?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| Error::Transport(format!("close: {}", e)))
    }
}

/// Wrap an engine channel, forwarding open/message/close into the event
/// stream, and return the handle used for sending.
fn wire_channel(
    peer_id: &str,
    dc: Arc<RTCDataChannel>,
    events: &mpsc::Sender<TransportEvent>,
) -> Arc<dyn DataChannel> {
    let handle: Arc<dyn DataChannel> = Arc::new(WebRtcChannel {
        label: dc.label().to_string(),
        dc: Arc::clone(&dc),
    });

    let open_events = events.clone();
    let open_peer = peer_id.to_string();
    let open_handle = Arc::clone(&handle);
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        let peer_id = open_peer.clone();
        let channel = Arc::clone(&open_handle);
        Box::pin(async move {
            debug!("Data channel open for {}", peer_id);
            let _ = events
                .send(TransportEvent::DataChannelOpen { peer_id, channel })
                .await;
        })
    }));

    let message_events = events.clone();
    let message_peer = peer_id.to_string();
    dc.on_message(Box::new(move |msg| {
        let events = message_events.clone();
        let peer_id = message_peer.clone();
        let payload = Bytes::from(msg.data.to_vec());
        Box::pin(async move {
            let _ = events
                .send(TransportEvent::DataChannelMessage { peer_id, payload })
                .await;
        })
    }));

    let close_events = events.clone();
    let close_peer = peer_id.to_string();
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        let peer_id = close_peer.clone();
        Box::pin(async move {
            let _ = events
                .send(TransportEvent::DataChannelClosed { peer_id })
                .await;
        })
    }));

    handle
}

struct WebRtcChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(Error::DataChannel(format!(
                "channel '{}' is not open",
                self.label
            )));
        }
        self.dc
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|e| Error::DataChannel(format!("send: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.dc
            .close()
            .await
            .map_err(|e| Error::DataChannel(format!("close: {}", e)))
    }
}
