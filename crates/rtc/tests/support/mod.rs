//! Shared test harness: an in-memory transport engine and media source.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use roomcast_rtc::error::{Error, Result};
use roomcast_rtc::signaling::{MemoryIdentityStore, SignalingSession};
use roomcast_rtc::transport::{
    DataChannel, IceCandidateInit, IceServer, LocalTrack, MediaSource, PeerTransport,
    TrackSource, TransportEvent, TransportFactory,
};
use roomcast_rtc::RtcConfig;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Records every frame "sent" over it; always open unless closed.
pub struct MockChannel {
    label: String,
    open: AtomicBool,
    pub sent: Mutex<Vec<String>>,
}

impl MockChannel {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DataChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(Error::DataChannel("channel closed".into()));
        }
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory engine connection recording every operation applied to it.
pub struct MockPeer {
    pub peer_id: String,
    pub events: mpsc::Sender<TransportEvent>,
    pub offers_created: AtomicUsize,
    pub answers_created: AtomicUsize,
    pub remote_offers: Mutex<Vec<String>>,
    pub remote_answers: Mutex<Vec<String>>,
    pub applied_candidates: Mutex<Vec<String>>,
    pub tracks: Mutex<Vec<TrackSource>>,
    pub close_calls: AtomicUsize,
    pub channel: Arc<MockChannel>,
}

impl MockPeer {
    fn new(peer_id: &str, events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            events,
            offers_created: AtomicUsize::new(0),
            answers_created: AtomicUsize::new(0),
            remote_offers: Mutex::new(Vec::new()),
            remote_answers: Mutex::new(Vec::new()),
            applied_candidates: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            channel: Arc::new(MockChannel::new("roomcast")),
        }
    }

    pub fn applied_candidate_order(&self) -> Vec<String> {
        self.applied_candidates.lock().clone()
    }
}

#[async_trait]
impl PeerTransport for MockPeer {
    async fn create_offer(&self) -> Result<String> {
        self.offers_created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("offer-from-{}", self.peer_id))
    }

    async fn create_answer(&self) -> Result<String> {
        self.answers_created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("answer-from-{}", self.peer_id))
    }

    async fn set_remote_offer(&self, sdp: &str) -> Result<()> {
        self.remote_offers.lock().push(sdp.to_string());
        Ok(())
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<()> {
        self.remote_answers.lock().push(sdp.to_string());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        self.applied_candidates.lock().push(candidate.candidate);
        Ok(())
    }

    async fn create_data_channel(&self, _label: &str) -> Result<Arc<dyn DataChannel>> {
        Ok(Arc::clone(&self.channel) as Arc<dyn DataChannel>)
    }

    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<()> {
        self.tracks.lock().push(track.source());
        Ok(())
    }

    async fn remove_track(&self, source: TrackSource) -> Result<()> {
        self.tracks.lock().retain(|s| *s != source);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`MockPeer`]s and remembering them by peer id.
#[derive(Default)]
pub struct MockEngine {
    pub peers: Mutex<HashMap<String, Arc<MockPeer>>>,
    pub created: AtomicUsize,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn peer(&self, peer_id: &str) -> Arc<MockPeer> {
        Arc::clone(
            self.peers
                .lock()
                .get(peer_id)
                .unwrap_or_else(|| panic!("no mock peer for {}", peer_id)),
        )
    }
}

#[async_trait]
impl TransportFactory for MockEngine {
    async fn create_peer(
        &self,
        peer_id: &str,
        _ice_servers: &[IceServer],
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let peer = Arc::new(MockPeer::new(peer_id, events));
        self.created.fetch_add(1, Ordering::SeqCst);
        self.peers.lock().insert(peer_id.to_string(), Arc::clone(&peer));
        Ok(peer)
    }
}

pub struct MockTrack {
    pub source: TrackSource,
}

impl LocalTrack for MockTrack {
    fn source(&self) -> TrackSource {
        self.source
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Media source that succeeds, or fails every acquisition when `fail` is set.
pub struct MockMedia {
    pub fail: bool,
}

#[async_trait]
impl MediaSource for MockMedia {
    async fn acquire(&self, source: TrackSource) -> Result<Arc<dyn LocalTrack>> {
        if self.fail {
            Err(Error::Media("device unavailable".into()))
        } else {
            Ok(Arc::new(MockTrack { source }))
        }
    }
}

/// Route test logs through the test harness writer. Safe to call from every
/// test; only the first call installs the subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Config pointing at a throwaway endpoint; suitable wherever no socket is
/// actually opened, or overridden with a live test server URL.
pub fn test_config(endpoint: &str) -> RtcConfig {
    RtcConfig {
        endpoint: endpoint.to_string(),
        auth_token: "test-token".into(),
        display_name: "tester".into(),
        reconnect_delay_ms: 50,
        chunk_delay_ms: 1,
        download_dir: std::env::temp_dir(),
        ..Default::default()
    }
}

/// A signalling session that is never connected; outbound sends are dropped
/// with a warning, which is exactly what registry unit tests need.
pub fn offline_signaling() -> (SignalingSession, mpsc::Receiver<roomcast_rtc::signaling::SignalingEvent>)
{
    let (tx, rx) = mpsc::channel(64);
    let session = SignalingSession::new(
        &test_config("ws://127.0.0.1:1/ws"),
        Arc::new(MemoryIdentityStore::new()),
        tx,
    );
    (session, rx)
}
