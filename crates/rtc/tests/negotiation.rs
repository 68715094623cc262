//! Registry negotiation state machine tests: tie-breaks, candidate
//! buffering, duplicate suppression, teardown isolation.

mod support;

use roomcast_rtc::peer::{NegotiationState, PeerRegistry};
use roomcast_rtc::signaling::{PeerCheck, PeerRole};
use roomcast_rtc::transport::{
    DataChannel, IceCandidateInit, MediaSource, TrackSource, TransportConnectionState,
    TransportEvent,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use support::{offline_signaling, MockEngine, MockMedia, MockTrack};
use tokio::sync::mpsc;

fn check(peer_id: &str) -> PeerCheck {
    PeerCheck {
        from_peer_id: peer_id.to_string(),
        from_user_id: format!("user-{}", peer_id),
        from_username: format!("name-{}", peer_id),
        peer_role: PeerRole::Participant,
    }
}

fn registry_with_local(local_id: &str) -> (PeerRegistry, Arc<MockEngine>) {
    let engine = MockEngine::new();
    let (signaling, signaling_rx) = offline_signaling();
    // The receiver is dropped deliberately: outbound sends are no-ops while
    // the session is disconnected, which these tests rely on.
    drop(signaling_rx);
    let (transport_tx, _transport_rx) = mpsc::channel(64);
    let mut registry = PeerRegistry::new(
        Arc::clone(&engine) as Arc<dyn roomcast_rtc::transport::TransportFactory>,
        signaling,
        transport_tx,
        Vec::new(),
    );
    registry.set_local_peer_id(local_id.to_string());
    (registry, engine)
}

#[tokio::test]
async fn test_lower_identity_initiates() {
    let (mut registry, engine) = registry_with_local("aaa");
    registry.handle_peer_check(check("bbb")).await;

    let peer = engine.peer("bbb");
    assert_eq!(peer.offers_created.load(Ordering::SeqCst), 1);
    assert_eq!(registry.peer_state("bbb"), Some(NegotiationState::Offering));
}

#[tokio::test]
async fn test_higher_identity_waits() {
    let (mut registry, engine) = registry_with_local("zzz");
    registry.handle_peer_check(check("bbb")).await;

    let peer = engine.peer("bbb");
    assert_eq!(peer.offers_created.load(Ordering::SeqCst), 0);
    assert_eq!(
        registry.peer_state("bbb"),
        Some(NegotiationState::AwaitingOffer)
    );
}

#[tokio::test]
async fn test_tie_break_is_exclusive_for_any_pair() {
    // For identities A != B exactly one side initiates, regardless of
    // discovery order.
    for (a, b) in [("p-1", "p-2"), ("p-2", "p-1"), ("alpha", "beta")] {
        let (mut reg_a, eng_a) = registry_with_local(a);
        let (mut reg_b, eng_b) = registry_with_local(b);
        reg_a.handle_peer_check(check(b)).await;
        reg_b.handle_peer_check(check(a)).await;

        let a_initiated = eng_a.peer(b).offers_created.load(Ordering::SeqCst);
        let b_initiated = eng_b.peer(a).offers_created.load(Ordering::SeqCst);
        assert_eq!(
            a_initiated + b_initiated,
            1,
            "exactly one of {} and {} must initiate",
            a,
            b
        );
        let initiator = if a_initiated == 1 { a } else { b };
        assert_eq!(initiator, std::cmp::min(a, b));
    }
}

#[tokio::test]
async fn test_duplicate_discovery_keeps_one_record() {
    let (mut registry, engine) = registry_with_local("aaa");
    registry.handle_peer_check(check("bbb")).await;
    registry.handle_peer_check(check("bbb")).await;
    registry.handle_peer_check(check("bbb")).await;

    assert_eq!(registry.len(), 1);
    assert_eq!(engine.created.load(Ordering::SeqCst), 1);
    assert_eq!(engine.peer("bbb").offers_created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_candidates_buffer_until_remote_description() {
    let (mut registry, engine) = registry_with_local("zzz");
    registry.handle_peer_check(check("bbb")).await;

    for i in 0..3 {
        registry
            .handle_ice_candidate(
                "bbb",
                IceCandidateInit {
                    candidate: format!("candidate:{}", i),
                    ..Default::default()
                },
            )
            .await;
    }

    let peer = engine.peer("bbb");
    assert!(peer.applied_candidate_order().is_empty());
    assert_eq!(registry.queued_candidates("bbb"), Some(3));

    registry.handle_offer("bbb", "v=0 remote".into()).await;

    assert_eq!(
        peer.applied_candidate_order(),
        vec!["candidate:0", "candidate:1", "candidate:2"]
    );
    assert_eq!(registry.queued_candidates("bbb"), Some(0));
    assert_eq!(peer.answers_created.load(Ordering::SeqCst), 1);

    // Once a description exists candidates apply immediately.
    registry
        .handle_ice_candidate(
            "bbb",
            IceCandidateInit {
                candidate: "candidate:late".into(),
                ..Default::default()
            },
        )
        .await;
    assert_eq!(peer.applied_candidate_order().last().map(String::as_str), Some("candidate:late"));
}

#[tokio::test]
async fn test_offer_for_unknown_peer_creates_record() {
    let (mut registry, engine) = registry_with_local("aaa");
    registry.handle_offer("mmm", "v=0 remote".into()).await;

    assert!(registry.contains("mmm"));
    assert_eq!(
        registry.peer_state("mmm"),
        Some(NegotiationState::Negotiating)
    );
    let peer = engine.peer("mmm");
    assert_eq!(peer.remote_offers.lock().len(), 1);
    assert_eq!(peer.answers_created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_renegotiation_reuses_record() {
    let (mut registry, engine) = registry_with_local("aaa");
    registry.handle_offer("mmm", "v=0 first".into()).await;
    registry.handle_offer("mmm", "v=0 second".into()).await;

    assert_eq!(registry.len(), 1);
    assert_eq!(engine.created.load(Ordering::SeqCst), 1);
    let peer = engine.peer("mmm");
    assert_eq!(peer.remote_offers.lock().len(), 2);
    assert_eq!(peer.answers_created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_answer_for_unknown_peer_is_dropped() {
    let (mut registry, engine) = registry_with_local("aaa");
    registry.handle_answer("ghost", "v=0".into()).await;

    assert!(!registry.contains("ghost"));
    assert_eq!(engine.created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fatal_state_tears_down_only_that_peer() {
    let (mut registry, engine) = registry_with_local("aaa");
    registry.handle_peer_check(check("bbb")).await;
    registry.handle_peer_check(check("ccc")).await;
    assert_eq!(registry.len(), 2);

    let notices = registry
        .handle_transport_event(TransportEvent::ConnectionState {
            peer_id: "bbb".into(),
            state: TransportConnectionState::Failed,
        })
        .await;

    assert_eq!(notices.len(), 2); // state change + removal
    assert!(!registry.contains("bbb"));
    assert!(registry.contains("ccc"));
    assert_eq!(engine.peer("bbb").close_calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.peer("ccc").close_calls.load(Ordering::SeqCst), 0);
    assert!(!engine.peer("bbb").channel.is_open());
}

#[tokio::test]
async fn test_peer_left_closes_connection_once() {
    let (mut registry, engine) = registry_with_local("aaa");
    registry.handle_peer_check(check("bbb")).await;

    registry.handle_peer_left("bbb").await;
    registry.handle_peer_left("bbb").await; // second notice is a no-op

    assert!(registry.is_empty());
    assert_eq!(engine.peer("bbb").close_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_media_enable_attaches_and_renegotiates_connected() {
    let (mut registry, engine) = registry_with_local("aaa");
    registry.handle_peer_check(check("bbb")).await;
    registry.handle_peer_check(check("ccc")).await;

    // Only bbb reaches the connected state.
    registry
        .handle_transport_event(TransportEvent::ConnectionState {
            peer_id: "bbb".into(),
            state: TransportConnectionState::Connected,
        })
        .await;

    let media = MockMedia { fail: false };
    let track = media.acquire(TrackSource::Camera).await.unwrap();
    registry.enable_track(track).await;

    let bbb = engine.peer("bbb");
    let ccc = engine.peer("ccc");
    assert_eq!(bbb.tracks.lock().len(), 1);
    assert_eq!(ccc.tracks.lock().len(), 1);
    // Initial offer + renegotiation offer for the connected peer only.
    assert_eq!(bbb.offers_created.load(Ordering::SeqCst), 2);
    assert_eq!(ccc.offers_created.load(Ordering::SeqCst), 1);
    assert_eq!(registry.local_capabilities(), (true, false, false));
}

#[tokio::test]
async fn test_tracks_attach_to_later_peers() {
    let (mut registry, engine) = registry_with_local("aaa");
    registry
        .enable_track(Arc::new(MockTrack {
            source: TrackSource::Microphone,
        }))
        .await;
    registry.handle_peer_check(check("bbb")).await;

    assert_eq!(engine.peer("bbb").tracks.lock().len(), 1);
}
