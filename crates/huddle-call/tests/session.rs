//! Media Session Manager against the loopback platform.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::sleep;

use huddle_call::{
    CallTarget, EndReason, Handshake, MediaSessionManager, SessionEvent, SessionPhase,
};
use huddle_common::{CallConfig, CallKind, SignalKind, SignalMessage};
use huddle_media::{
    ConnectionState, FacingMode, IceCandidate, LinkConfig, LoopbackCapture, LoopbackTransport,
    MediaTrack, PeerLink, PeerTransport, TrackKind,
};
use huddle_signal::paths::CALL_SIGNAL_FEED;
use huddle_signal::{MemoryStore, SharedStore, SignalChannel};

const ROOM: &str = "room";
const CALL: &str = "call-1";

struct Peer {
    sessions: MediaSessionManager,
    transport: Arc<LoopbackTransport>,
    capture: Arc<LoopbackCapture>,
}

fn peer(store: &Arc<MemoryStore>) -> Peer {
    let transport = Arc::new(LoopbackTransport::new());
    let capture = Arc::new(LoopbackCapture::new());
    let channel = SignalChannel::new(store.clone() as Arc<dyn SharedStore>, CALL_SIGNAL_FEED);
    let sessions = MediaSessionManager::new(
        channel,
        transport.clone(),
        capture.clone(),
        &CallConfig::default(),
    );
    Peer {
        sessions,
        transport,
        capture,
    }
}

fn target(local: &str, remote: &str, kind: CallKind) -> CallTarget {
    CallTarget {
        room: ROOM.to_string(),
        call_id: CALL.to_string(),
        local_id: local.to_string(),
        remote_id: remote.to_string(),
        kind,
    }
}

fn feed(store: &MemoryStore) -> Vec<Value> {
    store.dump()["rooms"][ROOM]["signals"][CALL]
        .as_object()
        .map(|messages| messages.values().cloned().collect())
        .unwrap_or_default()
}

fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn connected_pair(kind: CallKind) -> (Arc<MemoryStore>, Peer, Peer) {
    let store = Arc::new(MemoryStore::new());
    let alice = peer(&store);
    let bob = peer(&store);
    bob.sessions
        .answer_call(target("bob", "alice", kind))
        .await
        .unwrap();
    alice
        .sessions
        .start_call(target("alice", "bob", kind))
        .await
        .unwrap();
    eventually("both sides connected", || {
        alice.sessions.phase(CALL) == Some(SessionPhase::Connected)
            && bob.sessions.phase(CALL) == Some(SessionPhase::Connected)
    })
    .await;
    (store, alice, bob)
}

#[tokio::test]
async fn test_start_twice_opens_one_session_and_one_offer() {
    let store = Arc::new(MemoryStore::new());
    let alice = peer(&store);

    let (first, second) = tokio::join!(
        alice.sessions.start_call(target("alice", "bob", CallKind::Audio)),
        alice.sessions.start_call(target("alice", "bob", CallKind::Audio)),
    );
    assert_eq!(first.unwrap().id(), second.unwrap().id());

    assert_eq!(alice.sessions.active_sessions(), 1);
    assert_eq!(alice.transport.links().len(), 1);
    assert_eq!(alice.transport.links()[0].offers_created(), 1);
    assert_eq!(alice.capture.acquisitions(), 1);
    let offers = feed(&store)
        .iter()
        .filter(|m| m["type"] == "offer")
        .count();
    assert_eq!(offers, 1);
}

#[tokio::test]
async fn test_happy_path_connects_both_sides() {
    let store = Arc::new(MemoryStore::new());
    let alice = peer(&store);
    let bob = peer(&store);
    let mut alice_events = alice.sessions.events(CALL);
    let mut bob_events = bob.sessions.events(CALL);

    bob.sessions
        .answer_call(target("bob", "alice", CallKind::Audio))
        .await
        .unwrap();
    alice
        .sessions
        .start_call(target("alice", "bob", CallKind::Audio))
        .await
        .unwrap();

    eventually("both sides connected", || {
        alice.sessions.phase(CALL) == Some(SessionPhase::Connected)
            && bob.sessions.phase(CALL) == Some(SessionPhase::Connected)
    })
    .await;
    eventually("remote streams", || {
        alice.sessions.remote_stream(CALL).is_some() && bob.sessions.remote_stream(CALL).is_some()
    })
    .await;

    let alice_link = alice.transport.links()[0].clone();
    let bob_link = bob.transport.links()[0].clone();
    eventually("candidates applied", || {
        alice_link.applied_candidates().len() == 2 && bob_link.applied_candidates().len() == 2
    })
    .await;
    assert_eq!(alice_link.premature_candidates(), 0);
    assert_eq!(bob_link.premature_candidates(), 0);
    assert_eq!(alice_link.connection_state(), ConnectionState::Connected);
    assert_eq!(bob_link.connection_state(), ConnectionState::Connected);

    // Every addressed message was consumed by its recipient.
    eventually("signal feed drained", || feed(&store).is_empty()).await;

    let remote_streams = |events: Vec<SessionEvent>| {
        events
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::RemoteStream(_)))
            .count()
    };
    assert_eq!(remote_streams(drain(&mut alice_events)), 1);
    assert_eq!(remote_streams(drain(&mut bob_events)), 1);
}

#[tokio::test]
async fn test_candidates_before_offer_are_buffered_then_applied_in_order() {
    let store = Arc::new(MemoryStore::new());
    let bob = peer(&store);
    let channel: SignalChannel<SignalMessage> =
        SignalChannel::new(store.clone() as Arc<dyn SharedStore>, CALL_SIGNAL_FEED);

    // A real offer from a link outside any session manager.
    let remote = LoopbackTransport::new();
    let handle = remote.create_link(&LinkConfig::default()).await.unwrap();
    handle
        .link
        .add_track(MediaTrack::new(TrackKind::Audio, "mic", None), "alice-stream")
        .await
        .unwrap();
    let offer = handle.link.create_offer().await.unwrap();
    handle.link.set_local_description(offer.clone()).await.unwrap();

    bob.sessions
        .answer_call(target("bob", "alice", CallKind::Audio))
        .await
        .unwrap();
    for n in 0..3 {
        let candidate = IceCandidate::new(format!("candidate:{} 1 udp 1 192.0.2.9 5000 typ host", n));
        channel
            .publish(
                ROOM,
                CALL,
                &SignalMessage::new(
                    SignalKind::IceCandidate,
                    serde_json::to_value(&candidate).unwrap(),
                    "alice",
                    "bob",
                ),
            )
            .await
            .unwrap();
    }

    eventually("candidates buffered", || {
        bob.sessions
            .snapshot(CALL)
            .map(|s| s.pending_candidates)
            == Some(3)
    })
    .await;
    let bob_link = bob.transport.links()[0].clone();
    assert!(bob_link.applied_candidates().is_empty());

    channel
        .publish(
            ROOM,
            CALL,
            &SignalMessage::new(
                SignalKind::Offer,
                serde_json::to_value(&offer).unwrap(),
                "alice",
                "bob",
            ),
        )
        .await
        .unwrap();

    eventually("bob connected", || {
        bob.sessions.phase(CALL) == Some(SessionPhase::Connected)
    })
    .await;
    let applied: Vec<String> = bob_link
        .applied_candidates()
        .into_iter()
        .map(|c| c.candidate)
        .collect();
    assert_eq!(applied.len(), 3);
    for (n, candidate) in applied.iter().enumerate() {
        assert!(candidate.starts_with(&format!("candidate:{} ", n)));
    }
    assert_eq!(bob_link.premature_candidates(), 0);
    assert_eq!(bob.sessions.snapshot(CALL).unwrap().pending_candidates, 0);

    let answers = feed(&store)
        .into_iter()
        .filter(|m| m["type"] == "answer" && m["to"] == "alice")
        .count();
    assert_eq!(answers, 1);
}

#[tokio::test]
async fn test_stale_answer_and_glare_offer_are_ignored() {
    let (store, alice, _bob) = connected_pair(CallKind::Audio).await;
    let mut alice_events = alice.sessions.events(CALL);
    let channel: SignalChannel<SignalMessage> =
        SignalChannel::new(store.clone() as Arc<dyn SharedStore>, CALL_SIGNAL_FEED);

    channel
        .publish(
            ROOM,
            CALL,
            &SignalMessage::new(
                SignalKind::Answer,
                json!({"type": "answer", "sdp": "stale"}),
                "bob",
                "alice",
            ),
        )
        .await
        .unwrap();
    eventually("stale answer consumed", || feed(&store).is_empty()).await;
    sleep(Duration::from_millis(20)).await;

    assert_eq!(alice.sessions.phase(CALL), Some(SessionPhase::Connected));
    assert!(!drain(&mut alice_events)
        .iter()
        .any(|e| matches!(e, SessionEvent::Failed(_))));

    // A caller waiting for its answer drops a competing offer.
    let store = Arc::new(MemoryStore::new());
    let carol = peer(&store);
    let channel: SignalChannel<SignalMessage> =
        SignalChannel::new(store.clone() as Arc<dyn SharedStore>, CALL_SIGNAL_FEED);
    carol
        .sessions
        .start_call(target("carol", "dave", CallKind::Audio))
        .await
        .unwrap();
    channel
        .publish(
            ROOM,
            CALL,
            &SignalMessage::new(
                SignalKind::Offer,
                json!({"type": "offer", "sdp": "glare"}),
                "dave",
                "carol",
            ),
        )
        .await
        .unwrap();
    eventually("glare offer consumed", || {
        !feed(&store)
            .iter()
            .any(|m| m["type"] == "offer" && m["to"] == "carol")
    })
    .await;
    sleep(Duration::from_millis(20)).await;
    let snapshot = carol.sessions.snapshot(CALL).unwrap();
    assert_eq!(snapshot.handshake, Handshake::HaveLocalOffer);
    assert!(!snapshot.has_remote_description);
}

#[tokio::test]
async fn test_end_session_while_negotiating_releases_everything() {
    let store = Arc::new(MemoryStore::new());
    let alice = peer(&store);
    let mut events = alice.sessions.events(CALL);
    alice
        .sessions
        .start_call(target("alice", "bob", CallKind::Video))
        .await
        .unwrap();
    assert_eq!(alice.sessions.phase(CALL), Some(SessionPhase::Negotiating));
    assert_eq!(alice.capture.live_track_count(), 2);

    assert!(alice.sessions.end_session(CALL).await);
    assert!(!alice.sessions.end_session(CALL).await);
    assert_eq!(alice.sessions.active_sessions(), 0);
    assert_eq!(alice.transport.open_link_count(), 0);
    assert_eq!(alice.capture.live_track_count(), 0);
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        SessionEvent::PhaseChanged(SessionPhase::Ended(EndReason::Hangup))
    )));

    // Callee still waiting for an offer.
    let bob = peer(&store);
    bob.sessions
        .answer_call(target("bob", "alice", CallKind::Audio))
        .await
        .unwrap();
    assert!(bob.sessions.end_session(CALL).await);
    assert_eq!(bob.transport.open_link_count(), 0);
    assert_eq!(bob.capture.live_track_count(), 0);
}

#[tokio::test]
async fn test_end_session_while_connected_releases_everything() {
    let (_store, alice, bob) = connected_pair(CallKind::Video).await;
    eventually("remote stream", || alice.sessions.remote_stream(CALL).is_some()).await;
    let remote = alice.sessions.remote_stream(CALL).unwrap();

    assert!(alice.sessions.end_session(CALL).await);
    assert!(bob.sessions.end_session(CALL).await);

    for side in [&alice, &bob] {
        assert_eq!(side.sessions.active_sessions(), 0);
        assert_eq!(side.transport.open_link_count(), 0);
        assert_eq!(side.capture.live_track_count(), 0);
    }
    assert_eq!(remote.live_track_count(), 0);
}

#[tokio::test]
async fn test_setup_failures_release_partial_resources() {
    let store = Arc::new(MemoryStore::new());
    let alice = peer(&store);

    alice.capture.set_camera_busy(true);
    let err = alice
        .sessions
        .start_call(target("alice", "bob", CallKind::Video))
        .await
        .unwrap_err();
    assert!(err.is_setup_failure());
    assert_eq!(alice.capture.live_track_count(), 0);
    assert!(alice.transport.links().is_empty());
    alice.capture.set_camera_busy(false);

    alice.transport.fail_next_link();
    let err = alice
        .sessions
        .start_call(target("alice", "bob", CallKind::Video))
        .await
        .unwrap_err();
    assert!(err.is_setup_failure());
    assert_eq!(alice.capture.live_track_count(), 0);
    assert_eq!(alice.sessions.active_sessions(), 0);

    // Nothing was left behind, so a retry succeeds.
    alice
        .sessions
        .start_call(target("alice", "bob", CallKind::Video))
        .await
        .unwrap();
    assert_eq!(alice.sessions.active_sessions(), 1);
}

#[tokio::test]
async fn test_offer_publish_failure_is_signaling_failure() {
    let store = Arc::new(MemoryStore::new());
    let alice = peer(&store);
    store.set_fail_writes(true);

    let err = alice
        .sessions
        .start_call(target("alice", "bob", CallKind::Audio))
        .await
        .unwrap_err();
    assert!(err.is_signaling_failure());
    assert_eq!(alice.sessions.active_sessions(), 0);
    assert_eq!(alice.transport.open_link_count(), 0);
    assert_eq!(alice.capture.live_track_count(), 0);
}

#[tokio::test]
async fn test_camera_switch_replaces_track_on_same_link() {
    let (_store, alice, bob) = connected_pair(CallKind::Video).await;
    let link = alice.transport.links()[0].clone();
    let front = alice
        .sessions
        .local_stream(CALL)
        .and_then(|s| s.video_track().cloned())
        .unwrap();

    let stream = alice
        .sessions
        .switch_camera(CALL, FacingMode::Environment)
        .await
        .unwrap();
    let back = stream.video_track().cloned().unwrap();

    assert!(!front.is_live());
    assert!(back.is_live());
    assert_eq!(back.facing(), Some(FacingMode::Environment));
    assert_eq!(alice.transport.links().len(), 1);
    assert_eq!(link.offers_created(), 1);
    assert_eq!(link.replacements(), 1);
    assert!(link.sent_tracks().contains(&back));
    assert!(!link.sent_tracks().contains(&front));
    assert_eq!(bob.transport.links().len(), 1);
    assert_eq!(alice.sessions.phase(CALL), Some(SessionPhase::Connected));
    assert_eq!(
        alice.sessions.local_stream(CALL).unwrap().video_track(),
        Some(&back)
    );
}

#[tokio::test]
async fn test_camera_switch_failure_keeps_link_and_leaks_nothing() {
    let (_store, alice, _bob) = connected_pair(CallKind::Video).await;
    let link = alice.transport.links()[0].clone();
    let issued_before = alice.capture.issued_tracks().len();

    alice.capture.set_camera_busy(true);
    let err = alice
        .sessions
        .switch_camera(CALL, FacingMode::Environment)
        .await
        .unwrap_err();
    assert!(err.is_setup_failure());

    assert_eq!(alice.transport.links().len(), 1);
    assert_eq!(link.offers_created(), 1);
    assert_eq!(link.replacements(), 0);
    assert_eq!(alice.capture.issued_tracks().len(), issued_before);
    assert!(alice
        .capture
        .issued_tracks()
        .iter()
        .filter(|t| t.kind() == TrackKind::Video)
        .all(|t| !t.is_live()));
    let audio = alice
        .sessions
        .local_stream(CALL)
        .and_then(|s| s.audio_track().cloned())
        .unwrap();
    assert!(audio.is_live());
    assert_eq!(alice.sessions.phase(CALL), Some(SessionPhase::Connected));

    // The camera frees up and a retry still goes through the same sender.
    alice.capture.set_camera_busy(false);
    alice
        .sessions
        .switch_camera(CALL, FacingMode::Environment)
        .await
        .unwrap();
    assert_eq!(link.replacements(), 1);
    assert_eq!(link.offers_created(), 1);
}

#[tokio::test]
async fn test_unused_event_channels_are_dropped() {
    let store = Arc::new(MemoryStore::new());
    let alice = peer(&store);

    let ghost = alice.sessions.events("never-opened");
    assert_eq!(alice.sessions.watched_calls(), 1);
    drop(ghost);

    let _pending = alice.sessions.events(CALL);
    assert_eq!(alice.sessions.watched_calls(), 1);

    alice
        .sessions
        .start_call(target("alice", "bob", CallKind::Audio))
        .await
        .unwrap();
    assert_eq!(alice.sessions.watched_calls(), 1);
    assert!(alice.sessions.end_session(CALL).await);
    assert_eq!(alice.sessions.watched_calls(), 0);
}

#[tokio::test]
async fn test_transport_failure_is_reported_but_not_torn_down() {
    let (_store, alice, _bob) = connected_pair(CallKind::Audio).await;
    let mut events = alice.sessions.events(CALL);

    alice.transport.links()[0].simulate_failure();
    eventually("failure reported", || {
        alice.sessions.phase(CALL) == Some(SessionPhase::Ended(EndReason::TransportFailed))
    })
    .await;
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SessionEvent::Failed(_))));

    // The user decides; resources are still held until then.
    assert!(alice.sessions.has_session(CALL));
    assert!(alice.capture.live_track_count() > 0);
    assert!(alice.sessions.end_session(CALL).await);
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, SessionEvent::PhaseChanged(_))));
    assert_eq!(alice.capture.live_track_count(), 0);
    assert_eq!(alice.transport.open_link_count(), 0);
}

#[tokio::test]
async fn test_mute_keeps_track_live() {
    let (_store, alice, _bob) = connected_pair(CallKind::Video).await;
    alice
        .sessions
        .set_track_enabled(CALL, TrackKind::Audio, false)
        .unwrap();
    let audio = alice
        .sessions
        .local_stream(CALL)
        .and_then(|s| s.audio_track().cloned())
        .unwrap();
    assert!(!audio.is_enabled());
    assert!(audio.is_live());

    assert!(alice
        .sessions
        .set_track_enabled("other-call", TrackKind::Audio, false)
        .is_err());
}

#[tokio::test]
async fn test_shutdown_tears_down_and_refuses_new_calls() {
    let store = Arc::new(MemoryStore::new());
    let alice = peer(&store);
    alice
        .sessions
        .start_call(target("alice", "bob", CallKind::Audio))
        .await
        .unwrap();

    alice.sessions.shutdown();
    assert_eq!(alice.sessions.active_sessions(), 0);
    assert_eq!(alice.transport.open_link_count(), 0);
    assert_eq!(alice.capture.live_track_count(), 0);
    assert!(alice
        .sessions
        .start_call(target("alice", "bob", CallKind::Audio))
        .await
        .is_err());
}
