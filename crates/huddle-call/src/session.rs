//! Media Session Manager.
//!
//! Owns one [`PeerSession`] per call id: the peer link, the local and remote
//! streams, the remote-candidate buffer and both negotiation state machines.
//! Everything about a call lives in that one record so teardown cannot miss a
//! piece.
//!
//! Each session runs two tasks:
//! - a link pump that publishes local candidates, reports remote streams and
//!   tracks connection state
//! - a signal pump that consumes the offer/answer/candidate messages addressed
//!   to the local participant, one at a time
//!
//! Start, answer, camera switch and teardown are serialized by a setup lock,
//! which is what makes start/answer idempotent under duplicate invocation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use huddle_common::{CallConfig, CallKind, Error, Result, SignalKind, SignalMessage};
use huddle_media::{
    ConnectionState, FacingMode, IceCandidate, LinkConfig, MediaCapture, MediaConstraints,
    MediaStream, PeerEvent, PeerLink, PeerLinkHandle, PeerTransport, SessionDescription,
    TrackKind,
};
use huddle_signal::{Inbox, SignalChannel};

use crate::state::{Handshake, HandshakeEvent, PhaseEvent, SessionPhase};

const EVENT_CAPACITY: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn into_setup(err: Error) -> Error {
    if err.is_setup_failure() {
        err
    } else {
        Error::setup(err)
    }
}

/// Who we are negotiating with, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTarget {
    pub room: String,
    pub call_id: String,
    pub local_id: String,
    pub remote_id: String,
    pub kind: CallKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the offer.
    Caller,
    /// Waits for the offer and answers it.
    Callee,
}

/// Per-call notifications for the UI.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PhaseChanged(SessionPhase),
    /// A remote stream was discovered. Sent once per stream.
    RemoteStream(MediaStream),
    ConnectionState(ConnectionState),
    /// The handshake or transport failed. The session stays until ended.
    Failed(String),
}

/// Diagnostic view of one session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub target: CallTarget,
    pub role: Role,
    pub link_id: String,
    pub phase: SessionPhase,
    pub handshake: Handshake,
    pub has_remote_description: bool,
    pub pending_candidates: usize,
    pub connection: ConnectionState,
    pub local_stream: MediaStream,
    pub remote_stream: Option<MediaStream>,
}

struct PeerSession {
    target: CallTarget,
    role: Role,
    link: Arc<dyn PeerLink>,
    local_stream: MediaStream,
    remote_stream: Option<MediaStream>,
    phase: SessionPhase,
    handshake: Handshake,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    connection: ConnectionState,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerSession {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            target: self.target.clone(),
            role: self.role,
            link_id: self.link.id().to_string(),
            phase: self.phase,
            handshake: self.handshake,
            has_remote_description: self.remote_description_set,
            pending_candidates: self.pending_candidates.len(),
            connection: self.connection,
            local_stream: self.local_stream.clone(),
            remote_stream: self.remote_stream.clone(),
        }
    }
}

struct Inner {
    channel: SignalChannel<SignalMessage>,
    transport: Arc<dyn PeerTransport>,
    capture: Arc<dyn MediaCapture>,
    link_config: LinkConfig,
    sessions: Mutex<HashMap<String, PeerSession>>,
    watchers: Mutex<HashMap<String, broadcast::Sender<SessionEvent>>>,
    setup: AsyncMutex<()>,
    closed: AtomicBool,
}

/// Drives one peer link per call through the offer/answer handshake.
#[derive(Clone)]
pub struct MediaSessionManager {
    inner: Arc<Inner>,
}

impl MediaSessionManager {
    pub fn new(
        channel: SignalChannel<SignalMessage>,
        transport: Arc<dyn PeerTransport>,
        capture: Arc<dyn MediaCapture>,
        config: &CallConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                channel,
                transport,
                capture,
                link_config: LinkConfig {
                    ice_servers: config.ice_servers.clone(),
                },
                sessions: Mutex::new(HashMap::new()),
                watchers: Mutex::new(HashMap::new()),
                setup: AsyncMutex::new(()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Caller side: acquire media, open a link and publish the offer.
    /// Returns the existing local stream if the call already has a session.
    pub async fn start_call(&self, target: CallTarget) -> Result<MediaStream> {
        self.open(target, Role::Caller).await
    }

    /// Callee side: acquire media, open a link and wait for the offer.
    /// Returns the existing local stream if the call already has a session.
    pub async fn answer_call(&self, target: CallTarget) -> Result<MediaStream> {
        self.open(target, Role::Callee).await
    }

    async fn open(&self, target: CallTarget, role: Role) -> Result<MediaStream> {
        let _setup = self.inner.setup.lock().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::invalid_state("media sessions are shut down"));
        }
        if let Some(existing) = self.local_stream(&target.call_id) {
            debug!("call {} already has a session", target.call_id);
            return Ok(existing);
        }

        let stream = self
            .inner
            .capture
            .acquire(&MediaConstraints::for_call(target.kind))
            .await
            .map_err(into_setup)?;

        let PeerLinkHandle { link, events } =
            match self.inner.transport.create_link(&self.inner.link_config).await {
                Ok(handle) => handle,
                Err(err) => {
                    self.inner.capture.release(&stream);
                    return Err(into_setup(err));
                }
            };

        for track in stream.tracks() {
            if let Err(err) = link.add_track(track.clone(), stream.id()).await {
                self.inner.capture.release(&stream);
                link.close();
                return Err(into_setup(err));
            }
        }

        let call_id = target.call_id.clone();
        let inbox = self
            .inner
            .channel
            .inbox(&target.room, &target.call_id, &target.local_id);
        {
            let mut sessions = lock(&self.inner.sessions);
            if self.inner.closed.load(Ordering::SeqCst) {
                drop(sessions);
                self.inner.capture.release(&stream);
                link.close();
                return Err(Error::invalid_state("media sessions are shut down"));
            }
            sessions.insert(
                call_id.clone(),
                PeerSession {
                    target: target.clone(),
                    role,
                    link: link.clone(),
                    local_stream: stream.clone(),
                    remote_stream: None,
                    phase: SessionPhase::Idle,
                    handshake: Handshake::Stable,
                    remote_description_set: false,
                    pending_candidates: Vec::new(),
                    connection: ConnectionState::New,
                    tasks: Vec::new(),
                },
            );
        }
        self.inner.watcher(&call_id);

        let weak = Arc::downgrade(&self.inner);
        let mut tasks = Some(vec![
            tokio::spawn(pump_link_events(weak.clone(), call_id.clone(), events)),
            tokio::spawn(pump_signals(weak, call_id.clone(), inbox)),
        ]);
        self.inner
            .with_session(&call_id, |s| s.tasks = tasks.take().unwrap_or_default());
        if let Some(orphaned) = tasks {
            // Shut down while we were spawning.
            for task in orphaned {
                task.abort();
            }
            return Err(Error::invalid_state("media sessions are shut down"));
        }
        self.inner.advance(&call_id, PhaseEvent::Begin);
        info!(
            "opened {:?} session for call {} with {} in room {}",
            role, call_id, target.remote_id, target.room
        );

        if role == Role::Caller {
            if let Err(err) = self.inner.send_offer(&target, &link).await {
                warn!("offer for call {} failed: {}", call_id, err);
                self.inner.teardown(&call_id);
                return Err(err);
            }
        }
        Ok(stream)
    }

    /// Replace the outgoing video with a camera facing `facing`, in place on
    /// the existing sender. The peer link is kept and nothing is renegotiated.
    pub async fn switch_camera(&self, call_id: &str, facing: FacingMode) -> Result<MediaStream> {
        let _setup = self.inner.setup.lock().await;
        let (link, stream_id, previous) = self
            .inner
            .with_session(call_id, |s| {
                (
                    s.link.clone(),
                    s.local_stream.id().to_string(),
                    s.local_stream.video_track().cloned(),
                )
            })
            .ok_or_else(|| Error::not_found(format!("no session for call {}", call_id)))?;

        if let Some(previous) = &previous {
            previous.stop();
        }
        let captured = self
            .inner
            .capture
            .acquire(&MediaConstraints::camera(facing))
            .await
            .map_err(into_setup)?;
        let Some(track) = captured.video_track().cloned() else {
            self.inner.capture.release(&captured);
            return Err(Error::setup("camera produced no video track"));
        };

        let sender = link
            .senders()
            .into_iter()
            .find(|s| s.kind == TrackKind::Video);
        let swapped = match sender {
            Some(sender) => link.replace_track(&sender.id, track.clone()).await,
            None => {
                debug!("call {} has no video sender, adding one", call_id);
                link.add_track(track.clone(), &stream_id).await.map(|_| ())
            }
        };
        if let Err(err) = swapped {
            track.stop();
            return Err(err);
        }

        let updated = self.inner.with_session(call_id, |s| {
            s.local_stream.replace_video(track.clone());
            s.local_stream.clone()
        });
        match updated {
            Some(stream) => {
                info!("switched call {} to {:?} camera", call_id, facing);
                Ok(stream)
            }
            None => {
                track.stop();
                Err(Error::not_found(format!("no session for call {}", call_id)))
            }
        }
    }

    /// Mute or unmute the local track of `kind`. The track stays live.
    pub fn set_track_enabled(&self, call_id: &str, kind: TrackKind, enabled: bool) -> Result<()> {
        let track = self
            .inner
            .with_session(call_id, |s| {
                s.local_stream
                    .tracks()
                    .iter()
                    .find(|t| t.kind() == kind)
                    .cloned()
            })
            .ok_or_else(|| Error::not_found(format!("no session for call {}", call_id)))?
            .ok_or_else(|| Error::not_found(format!("no {:?} track on call {}", kind, call_id)))?;
        track.set_enabled(enabled);
        debug!("{:?} on call {} enabled={}", kind, call_id, enabled);
        Ok(())
    }

    /// Close the link, stop every local and remote track and forget the
    /// session. Valid in every phase. Returns whether a session existed.
    pub async fn end_session(&self, call_id: &str) -> bool {
        let _setup = self.inner.setup.lock().await;
        self.inner.teardown(call_id)
    }

    /// Best-effort synchronous teardown of every session, for process exit.
    /// New sessions are refused afterwards.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let ids: Vec<String> = lock(&self.inner.sessions).keys().cloned().collect();
        for id in ids {
            self.inner.teardown(&id);
        }
    }

    /// Subscribe to the events of one call. May be called before the
    /// session exists; the channel is dropped once it has neither a session
    /// nor a receiver.
    pub fn events(&self, call_id: &str) -> broadcast::Receiver<SessionEvent> {
        self.inner.prune_watchers();
        self.inner.watcher(call_id).subscribe()
    }

    /// Calls with a live event channel.
    pub fn watched_calls(&self) -> usize {
        lock(&self.inner.watchers).len()
    }

    pub fn has_session(&self, call_id: &str) -> bool {
        lock(&self.inner.sessions).contains_key(call_id)
    }

    pub fn active_sessions(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    pub fn local_stream(&self, call_id: &str) -> Option<MediaStream> {
        self.inner.with_session(call_id, |s| s.local_stream.clone())
    }

    pub fn remote_stream(&self, call_id: &str) -> Option<MediaStream> {
        self.inner
            .with_session(call_id, |s| s.remote_stream.clone())
            .flatten()
    }

    pub fn phase(&self, call_id: &str) -> Option<SessionPhase> {
        self.inner.with_session(call_id, |s| s.phase)
    }

    pub fn snapshot(&self, call_id: &str) -> Option<SessionSnapshot> {
        self.inner.with_session(call_id, |s| s.snapshot())
    }
}

impl Inner {
    fn with_session<R>(&self, call_id: &str, f: impl FnOnce(&mut PeerSession) -> R) -> Option<R> {
        lock(&self.sessions).get_mut(call_id).map(f)
    }

    fn watcher(&self, call_id: &str) -> broadcast::Sender<SessionEvent> {
        lock(&self.watchers)
            .entry(call_id.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CAPACITY).0)
            .clone()
    }

    fn prune_watchers(&self) {
        let open: Vec<String> = lock(&self.sessions).keys().cloned().collect();
        lock(&self.watchers)
            .retain(|id, tx| tx.receiver_count() > 0 || open.contains(id));
    }

    fn emit(&self, call_id: &str, event: SessionEvent) {
        if let Some(tx) = lock(&self.watchers).get(call_id) {
            // No receivers is fine.
            let _ = tx.send(event);
        }
    }

    fn advance(&self, call_id: &str, event: PhaseEvent) {
        let changed = self
            .with_session(call_id, |s| {
                let next = s.phase.next(event)?;
                let changed = next != s.phase;
                s.phase = next;
                changed.then_some(next)
            })
            .flatten();
        if let Some(phase) = changed {
            info!("call {} is now {:?}", call_id, phase);
            self.emit(call_id, SessionEvent::PhaseChanged(phase));
        }
    }

    fn step_handshake(&self, call_id: &str, event: HandshakeEvent) {
        self.with_session(call_id, |s| match s.handshake.next(event) {
            Some(next) => s.handshake = next,
            None => debug!(
                "handshake on call {} ignored {:?} in {:?}",
                call_id, event, s.handshake
            ),
        });
    }

    fn teardown(&self, call_id: &str) -> bool {
        let Some(mut session) = lock(&self.sessions).remove(call_id) else {
            return false;
        };
        for task in session.tasks.drain(..) {
            task.abort();
        }
        self.capture.release(&session.local_stream);
        if let Some(remote) = session.remote_stream.take() {
            remote.stop_all();
        }
        session.link.close();

        if let Some(phase) = session.phase.next(PhaseEvent::Hangup) {
            if phase != session.phase {
                self.emit(call_id, SessionEvent::PhaseChanged(phase));
            }
        }
        lock(&self.watchers).remove(call_id);
        self.prune_watchers();
        info!(
            "tore down call {} ({} buffered candidates dropped)",
            call_id,
            session.pending_candidates.len()
        );
        true
    }

    async fn publish(&self, target: &CallTarget, kind: SignalKind, payload: Value) -> Result<()> {
        let message = SignalMessage::new(kind, payload, &target.local_id, &target.remote_id);
        self.channel
            .publish(&target.room, &target.call_id, &message)
            .await?;
        Ok(())
    }

    async fn send_offer(&self, target: &CallTarget, link: &Arc<dyn PeerLink>) -> Result<()> {
        let offer = link.create_offer().await?;
        link.set_local_description(offer.clone()).await?;
        self.step_handshake(&target.call_id, HandshakeEvent::LocalOffer);
        self.publish(target, SignalKind::Offer, serde_json::to_value(&offer)?)
            .await?;
        debug!("published offer for call {}", target.call_id);
        Ok(())
    }

    async fn on_link_event(&self, call_id: &str, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let Some(target) = self.with_session(call_id, |s| s.target.clone()) else {
                    return;
                };
                let payload = match serde_json::to_value(&candidate) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!("unencodable candidate on call {}: {}", call_id, err);
                        return;
                    }
                };
                // A lost candidate only degrades path selection.
                if let Err(err) = self.publish(&target, SignalKind::IceCandidate, payload).await {
                    warn!("dropping local candidate for call {}: {}", call_id, err);
                }
            }
            PeerEvent::GatheringComplete => {
                debug!("candidate gathering complete for call {}", call_id);
            }
            PeerEvent::RemoteStream(stream) => {
                let fresh = self
                    .with_session(call_id, |s| {
                        if s.remote_stream.as_ref().map(|r| r.id()) == Some(stream.id()) {
                            return false;
                        }
                        s.remote_stream = Some(stream.clone());
                        true
                    })
                    .unwrap_or(false);
                if fresh {
                    info!("remote stream {} available on call {}", stream.id(), call_id);
                    self.emit(call_id, SessionEvent::RemoteStream(stream));
                }
            }
            PeerEvent::ConnectionState(state) => {
                if self.with_session(call_id, |s| s.connection = state).is_none() {
                    return;
                }
                self.emit(call_id, SessionEvent::ConnectionState(state));
                if state == ConnectionState::Failed {
                    warn!("transport failed on call {}", call_id);
                    self.advance(call_id, PhaseEvent::TransportFailed);
                    self.emit(
                        call_id,
                        SessionEvent::Failed("peer transport failed".to_string()),
                    );
                }
            }
        }
    }

    async fn on_signal(&self, call_id: &str, message: SignalMessage) {
        let Some((target, link)) = self.with_session(call_id, |s| (s.target.clone(), s.link.clone()))
        else {
            return;
        };
        if message.from != target.remote_id {
            debug!(
                "ignoring {:?} from {} on call {}",
                message.kind, message.from, call_id
            );
            return;
        }

        let kind = message.kind;
        let result = match kind {
            SignalKind::Offer => self.apply_offer(&target, &link, message.payload).await,
            SignalKind::Answer => self.apply_answer(&target, &link, message.payload).await,
            SignalKind::IceCandidate => {
                self.apply_candidate(call_id, &link, message.payload).await
            }
        };
        if let Err(err) = result {
            if kind == SignalKind::IceCandidate {
                warn!("could not apply candidate on call {}: {}", call_id, err);
            } else {
                warn!("{:?} failed on call {}: {}", kind, call_id, err);
                self.emit(call_id, SessionEvent::Failed(err.to_string()));
            }
        }
    }

    async fn apply_offer(
        &self,
        target: &CallTarget,
        link: &Arc<dyn PeerLink>,
        payload: Value,
    ) -> Result<()> {
        let call_id = &target.call_id;
        let Some(handshake) = self.with_session(call_id, |s| s.handshake) else {
            return Ok(());
        };
        if handshake.next(HandshakeEvent::RemoteOffer).is_none() {
            debug!("ignoring offer on call {} in {:?}", call_id, handshake);
            return Ok(());
        }

        let offer: SessionDescription = serde_json::from_value(payload)?;
        link.set_remote_description(offer).await?;
        self.with_session(call_id, |s| s.remote_description_set = true);
        self.step_handshake(call_id, HandshakeEvent::RemoteOffer);
        self.flush_candidates(call_id, link).await;

        let answer = link.create_answer().await?;
        link.set_local_description(answer.clone()).await?;
        self.step_handshake(call_id, HandshakeEvent::LocalAnswer);
        self.publish(target, SignalKind::Answer, serde_json::to_value(&answer)?)
            .await?;
        debug!("published answer for call {}", call_id);

        self.advance(call_id, PhaseEvent::HandshakeComplete);
        self.flush_candidates(call_id, link).await;
        Ok(())
    }

    async fn apply_answer(
        &self,
        target: &CallTarget,
        link: &Arc<dyn PeerLink>,
        payload: Value,
    ) -> Result<()> {
        let call_id = &target.call_id;
        let Some((handshake, remote_set)) =
            self.with_session(call_id, |s| (s.handshake, s.remote_description_set))
        else {
            return Ok(());
        };
        if handshake.next(HandshakeEvent::RemoteAnswer).is_none() || remote_set {
            debug!(
                "ignoring stale answer on call {} in {:?} (remote set: {})",
                call_id, handshake, remote_set
            );
            return Ok(());
        }

        let answer: SessionDescription = serde_json::from_value(payload)?;
        link.set_remote_description(answer).await?;
        self.with_session(call_id, |s| s.remote_description_set = true);
        self.step_handshake(call_id, HandshakeEvent::RemoteAnswer);
        self.advance(call_id, PhaseEvent::HandshakeComplete);
        self.flush_candidates(call_id, link).await;
        Ok(())
    }

    async fn apply_candidate(
        &self,
        call_id: &str,
        link: &Arc<dyn PeerLink>,
        payload: Value,
    ) -> Result<()> {
        let candidate: IceCandidate = serde_json::from_value(payload)?;
        let buffered = self.with_session(call_id, |s| {
            if s.remote_description_set && s.handshake.is_stable() {
                None
            } else {
                s.pending_candidates.push(candidate.clone());
                Some(s.pending_candidates.len())
            }
        });
        match buffered {
            None => Ok(()),
            Some(Some(pending)) => {
                debug!("buffered candidate on call {} ({} pending)", call_id, pending);
                Ok(())
            }
            Some(None) => link.add_ice_candidate(candidate).await,
        }
    }

    async fn flush_candidates(&self, call_id: &str, link: &Arc<dyn PeerLink>) {
        let pending = self
            .with_session(call_id, |s| std::mem::take(&mut s.pending_candidates))
            .unwrap_or_default();
        if pending.is_empty() {
            return;
        }
        debug!("flushing {} candidates on call {}", pending.len(), call_id);
        for candidate in pending {
            if let Err(err) = link.add_ice_candidate(candidate).await {
                warn!("buffered candidate rejected on call {}: {}", call_id, err);
            }
        }
    }
}

async fn pump_link_events(
    weak: Weak<Inner>,
    call_id: String,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.on_link_event(&call_id, event).await;
    }
    debug!("link events for call {} finished", call_id);
}

async fn pump_signals(weak: Weak<Inner>, call_id: String, mut inbox: Inbox<SignalMessage>) {
    while let Some(batch) = inbox.next().await {
        for envelope in batch {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.on_signal(&call_id, envelope.message).await;
        }
    }
    debug!("signal feed for call {} finished", call_id);
}
