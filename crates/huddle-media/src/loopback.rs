//! In-process stand-in for the platform media engine.
//!
//! [`LoopbackTransport`] links negotiate for real: they enforce the
//! offer/answer state machine, reject candidates before a remote description
//! is set, gather a couple of synthetic candidates after each local
//! description, surface the remote side's tracks as a remote stream and
//! report `Connected` once both descriptions are applied. Descriptions are
//! JSON so two links in the same process understand each other.
//!
//! Everything is observable for tests: applied and premature candidates,
//! offers created, track replacements, open links and live captured tracks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use huddle_common::{Error, Result};

use crate::capture::{MediaCapture, MediaConstraints};
use crate::peer::{
    ConnectionState, IceCandidate, LinkConfig, PeerEvent, PeerLink, PeerLinkHandle,
    PeerTransport, SdpType, SenderId, SessionDescription, SignalingState, TrackSender,
};
use crate::stream::{MediaStream, MediaTrack, TrackKind};

const CANDIDATES_PER_DESCRIPTION: u32 = 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Serialize, Deserialize)]
struct LoopbackSdp {
    link: String,
    stream: Option<String>,
    tracks: Vec<LoopbackTrack>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LoopbackTrack {
    id: String,
    kind: TrackKind,
}

#[derive(Default)]
pub struct LoopbackTransport {
    links: Mutex<Vec<Arc<LoopbackLink>>>,
    fail_next: AtomicBool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `create_link` fail.
    pub fn fail_next_link(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Every link created so far, in creation order.
    pub fn links(&self) -> Vec<Arc<LoopbackLink>> {
        lock(&self.links).clone()
    }

    pub fn open_link_count(&self) -> usize {
        lock(&self.links).iter().filter(|l| !l.is_closed()).count()
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_link(&self, config: &LinkConfig) -> Result<PeerLinkHandle> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::setup("peer link creation refused"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(LoopbackLink::new(tx));
        debug!(
            "created loopback link {} with {} ice servers",
            link.id,
            config.ice_servers.len()
        );
        lock(&self.links).push(link.clone());
        Ok(PeerLinkHandle {
            link,
            events: rx,
        })
    }
}

struct LinkState {
    signaling: SignalingState,
    connection: ConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    senders: Vec<TrackSender>,
    stream_id: Option<String>,
    applied: Vec<IceCandidate>,
    premature: usize,
    offers_created: usize,
    replacements: usize,
    candidate_seq: u32,
}

pub struct LoopbackLink {
    id: String,
    state: Mutex<LinkState>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl LoopbackLink {
    fn new(events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: Mutex::new(LinkState {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                local: None,
                remote: None,
                senders: Vec::new(),
                stream_id: None,
                applied: Vec::new(),
                premature: 0,
                offers_created: 0,
                replacements: 0,
                candidate_seq: 0,
            }),
            events,
        }
    }

    fn emit(&self, event: PeerEvent) {
        // The receiver goes away when the owning session is torn down.
        let _ = self.events.send(event);
    }

    fn ensure_open(state: &LinkState) -> Result<()> {
        if state.signaling == SignalingState::Closed {
            return Err(Error::invalid_state("link is closed"));
        }
        Ok(())
    }

    fn describe(&self, state: &LinkState) -> Result<String> {
        let sdp = LoopbackSdp {
            link: self.id.clone(),
            stream: state.stream_id.clone(),
            tracks: state
                .senders
                .iter()
                .map(|s| LoopbackTrack {
                    id: s.track.as_ref().map(|t| t.id().to_string()).unwrap_or_default(),
                    kind: s.kind,
                })
                .collect(),
        };
        Ok(serde_json::to_string(&sdp)?)
    }

    fn gather(&self, state: &mut LinkState) {
        for _ in 0..CANDIDATES_PER_DESCRIPTION {
            state.candidate_seq += 1;
            let n = state.candidate_seq;
            self.emit(PeerEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:{} 1 udp {} 192.0.2.{} {} typ host",
                n,
                2_130_706_431u32.saturating_sub(n),
                n % 250 + 1,
                50_000 + n
            ))));
        }
        self.emit(PeerEvent::GatheringComplete);
    }

    fn maybe_connect(&self, state: &mut LinkState) {
        if state.local.is_some()
            && state.remote.is_some()
            && state.signaling == SignalingState::Stable
            && state.connection == ConnectionState::New
        {
            state.connection = ConnectionState::Connecting;
            self.emit(PeerEvent::ConnectionState(ConnectionState::Connecting));
            state.connection = ConnectionState::Connected;
            self.emit(PeerEvent::ConnectionState(ConnectionState::Connected));
        }
    }

    /// Report an unrecoverable transport failure.
    pub fn simulate_failure(&self) {
        let mut state = lock(&self.state);
        state.connection = ConnectionState::Failed;
        self.emit(PeerEvent::ConnectionState(ConnectionState::Failed));
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).applied.clone()
    }

    /// Candidates offered before any remote description was set.
    pub fn premature_candidates(&self) -> usize {
        lock(&self.state).premature
    }

    pub fn offers_created(&self) -> usize {
        lock(&self.state).offers_created
    }

    pub fn replacements(&self) -> usize {
        lock(&self.state).replacements
    }

    pub fn has_remote_description(&self) -> bool {
        lock(&self.state).remote.is_some()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).signaling == SignalingState::Closed
    }

    /// Tracks currently attached to senders.
    pub fn sent_tracks(&self) -> Vec<MediaTrack> {
        lock(&self.state)
            .senders
            .iter()
            .filter_map(|s| s.track.clone())
            .collect()
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn add_track(&self, track: MediaTrack, stream_id: &str) -> Result<SenderId> {
        let mut state = lock(&self.state);
        Self::ensure_open(&state)?;
        let id = SenderId(Uuid::new_v4().to_string());
        state.stream_id.get_or_insert_with(|| stream_id.to_string());
        state.senders.push(TrackSender {
            id: id.clone(),
            kind: track.kind(),
            track: Some(track),
        });
        Ok(id)
    }

    fn senders(&self) -> Vec<TrackSender> {
        lock(&self.state).senders.clone()
    }

    async fn replace_track(&self, sender: &SenderId, track: MediaTrack) -> Result<()> {
        let mut state = lock(&self.state);
        Self::ensure_open(&state)?;
        let slot = state
            .senders
            .iter_mut()
            .find(|s| &s.id == sender)
            .ok_or_else(|| Error::not_found(format!("sender {}", sender)))?;
        if slot.kind != track.kind() {
            return Err(Error::invalid_state(format!(
                "cannot put a {:?} track on a {:?} sender",
                track.kind(),
                slot.kind
            )));
        }
        slot.track = Some(track);
        state.replacements += 1;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = lock(&self.state);
        Self::ensure_open(&state)?;
        state.offers_created += 1;
        Ok(SessionDescription::offer(self.describe(&state)?))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = lock(&self.state);
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(Error::invalid_state(format!(
                "cannot answer in {:?}",
                state.signaling
            )));
        }
        Ok(SessionDescription::answer(self.describe(&state)?))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let mut state = lock(&self.state);
        let next = match (state.signaling, description.sdp_type) {
            (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveLocalOffer,
            (SignalingState::HaveRemoteOffer, SdpType::Answer) => SignalingState::Stable,
            (current, kind) => {
                return Err(Error::invalid_state(format!(
                    "cannot set local {:?} in {:?}",
                    kind, current
                )))
            }
        };
        state.signaling = next;
        state.local = Some(description);
        self.gather(&mut state);
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let parsed: LoopbackSdp = serde_json::from_str(&description.sdp)
            .map_err(|e| Error::transport(format!("unreadable session description: {}", e)))?;
        let mut state = lock(&self.state);
        let next = match (state.signaling, description.sdp_type) {
            (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveRemoteOffer,
            (SignalingState::HaveLocalOffer, SdpType::Answer) => SignalingState::Stable,
            (current, kind) => {
                return Err(Error::invalid_state(format!(
                    "cannot set remote {:?} in {:?}",
                    kind, current
                )))
            }
        };
        state.signaling = next;
        state.remote = Some(description);

        if !parsed.tracks.is_empty() {
            let tracks = parsed
                .tracks
                .iter()
                .map(|t| {
                    MediaTrack::with_id(t.id.clone(), t.kind, format!("remote {:?}", t.kind), None)
                })
                .collect();
            let stream_id = parsed
                .stream
                .unwrap_or_else(|| format!("{}-stream", parsed.link));
            self.emit(PeerEvent::RemoteStream(MediaStream::with_id(stream_id, tracks)));
        }
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = lock(&self.state);
        Self::ensure_open(&state)?;
        if state.remote.is_none() {
            state.premature += 1;
            return Err(Error::transport(
                "candidate applied before remote description",
            ));
        }
        state.applied.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        lock(&self.state).signaling
    }

    fn connection_state(&self) -> ConnectionState {
        lock(&self.state).connection
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        if state.signaling == SignalingState::Closed {
            return;
        }
        state.signaling = SignalingState::Closed;
        state.connection = ConnectionState::Closed;
        for sender in &mut state.senders {
            sender.track = None;
        }
        self.emit(PeerEvent::ConnectionState(ConnectionState::Closed));
    }
}

/// Fake camera and microphone.
#[derive(Default)]
pub struct LoopbackCapture {
    denied: AtomicBool,
    camera_busy: AtomicBool,
    acquisitions: AtomicUsize,
    issued: Mutex<Vec<MediaTrack>>,
}

impl LoopbackCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every acquisition, as if permission was denied.
    pub fn set_denied(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    /// Fail camera acquisition after the microphone was already opened.
    pub fn set_camera_busy(&self, busy: bool) {
        self.camera_busy.store(busy, Ordering::SeqCst);
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Tracks handed out and not yet stopped.
    pub fn live_track_count(&self) -> usize {
        lock(&self.issued).iter().filter(|t| t.is_live()).count()
    }

    pub fn issued_tracks(&self) -> Vec<MediaTrack> {
        lock(&self.issued).clone()
    }
}

#[async_trait]
impl MediaCapture for LoopbackCapture {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(Error::setup("permission denied for camera/microphone"));
        }
        if !constraints.audio && constraints.video.is_none() {
            return Err(Error::setup("no media requested"));
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, "loopback microphone", None));
        }
        if let Some(facing) = constraints.video {
            if self.camera_busy.load(Ordering::SeqCst) {
                for track in &tracks {
                    track.stop();
                }
                lock(&self.issued).extend(tracks);
                return Err(Error::setup("camera is busy"));
            }
            tracks.push(MediaTrack::new(
                TrackKind::Video,
                format!("loopback camera ({:?})", facing).to_lowercase(),
                Some(facing),
            ));
        }

        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        lock(&self.issued).extend(tracks.iter().cloned());
        Ok(MediaStream::new(tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::FacingMode;
    use huddle_common::CallKind;

    async fn link_pair() -> (
        LoopbackTransport,
        PeerLinkHandle,
        PeerLinkHandle,
    ) {
        let transport = LoopbackTransport::new();
        let a = transport.create_link(&LinkConfig::default()).await.unwrap();
        let b = transport.create_link(&LinkConfig::default()).await.unwrap();
        (transport, a, b)
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<PeerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_full_negotiation_connects_both_links() {
        let (_transport, mut a, mut b) = link_pair().await;
        let mic = MediaTrack::new(TrackKind::Audio, "mic", None);
        a.link.add_track(mic.clone(), "stream-a").await.unwrap();
        b.link
            .add_track(MediaTrack::new(TrackKind::Audio, "mic", None), "stream-b")
            .await
            .unwrap();

        let offer = a.link.create_offer().await.unwrap();
        a.link.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(a.link.signaling_state(), SignalingState::HaveLocalOffer);

        b.link.set_remote_description(offer).await.unwrap();
        let answer = b.link.create_answer().await.unwrap();
        b.link.set_local_description(answer.clone()).await.unwrap();
        a.link.set_remote_description(answer).await.unwrap();

        assert_eq!(a.link.signaling_state(), SignalingState::Stable);
        assert_eq!(a.link.connection_state(), ConnectionState::Connected);
        assert_eq!(b.link.connection_state(), ConnectionState::Connected);

        let b_events = drain(&mut b.events);
        let remote = b_events
            .iter()
            .find_map(|e| match e {
                PeerEvent::RemoteStream(stream) => Some(stream.clone()),
                _ => None,
            })
            .expect("remote stream");
        assert_eq!(remote.id(), "stream-a");
        assert_eq!(remote.tracks()[0].id(), mic.id());

        let a_candidates = drain(&mut a.events)
            .into_iter()
            .filter(|e| matches!(e, PeerEvent::LocalCandidate(_)))
            .count();
        assert_eq!(a_candidates, CANDIDATES_PER_DESCRIPTION as usize);
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_is_rejected() {
        let (transport, a, _b) = link_pair().await;
        let err = a
            .link
            .add_ice_candidate(IceCandidate::new("candidate:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(transport.links()[0].premature_candidates(), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_descriptions_are_rejected() {
        let (_transport, a, b) = link_pair().await;
        assert!(a.link.create_answer().await.is_err());
        let answer = SessionDescription::answer(
            serde_json::to_string(&LoopbackSdp {
                link: "x".into(),
                stream: None,
                tracks: vec![],
            })
            .unwrap(),
        );
        assert!(b.link.set_remote_description(answer).await.is_err());
    }

    #[tokio::test]
    async fn test_replace_track_keeps_sender_and_checks_kind() {
        let (transport, a, _b) = link_pair().await;
        let cam = MediaTrack::new(TrackKind::Video, "front", Some(FacingMode::User));
        let sender = a.link.add_track(cam, "s").await.unwrap();

        let back = MediaTrack::new(TrackKind::Video, "back", Some(FacingMode::Environment));
        a.link.replace_track(&sender, back.clone()).await.unwrap();
        assert_eq!(a.link.senders().len(), 1);
        assert_eq!(transport.links()[0].sent_tracks(), vec![back]);

        let mic = MediaTrack::new(TrackKind::Audio, "mic", None);
        assert!(a.link.replace_track(&sender, mic).await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (transport, a, _b) = link_pair().await;
        assert_eq!(transport.open_link_count(), 2);
        a.link.close();
        a.link.close();
        assert_eq!(transport.open_link_count(), 1);
        assert!(a.link.create_offer().await.is_err());
    }

    #[tokio::test]
    async fn test_transport_failure_injection() {
        let transport = LoopbackTransport::new();
        transport.fail_next_link();
        assert!(transport.create_link(&LinkConfig::default()).await.is_err());
        assert!(transport.create_link(&LinkConfig::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_capture_tracks_and_failures() {
        let capture = LoopbackCapture::new();
        let stream = capture
            .acquire(&MediaConstraints::for_call(CallKind::Video))
            .await
            .unwrap();
        assert_eq!(stream.tracks().len(), 2);
        assert_eq!(capture.live_track_count(), 2);
        capture.release(&stream);
        assert_eq!(capture.live_track_count(), 0);

        capture.set_camera_busy(true);
        let err = capture
            .acquire(&MediaConstraints::for_call(CallKind::Video))
            .await
            .unwrap_err();
        assert!(err.is_setup_failure());
        assert_eq!(capture.live_track_count(), 0);

        capture.set_denied(true);
        assert!(capture
            .acquire(&MediaConstraints::for_call(CallKind::Audio))
            .await
            .is_err());
    }
}
