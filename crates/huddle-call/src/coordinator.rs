//! Call Lifecycle Coordinator.
//!
//! Maps start/answer/end/decline onto call record mutations in the shared
//! store and onto the local [`MediaSessionManager`]. A [`CallListener`]
//! follows every record in a room and turns mutations into [`CallEvent`]s,
//! starting the caller's handshake once the callee answers and tearing the
//! local session down when the other side hangs up.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use huddle_common::{
    now_millis, CallConfig, CallKind, CallRecord, CallStatus, Error, Result, SignalMessage,
};
use huddle_media::{MediaCapture, MediaStream, PeerTransport};
use huddle_signal::{
    children, paths, read_json, write_json, CleanupScheduler, SharedStore, SignalChannel,
};

use crate::presence::IncomingCallGate;
use crate::session::{CallTarget, MediaSessionManager};

fn ring_key(room: &str, call_id: &str) -> String {
    format!("ring:{}/{}", room, call_id)
}

fn removal_key(room: &str, call_id: &str) -> String {
    format!("remove:{}/{}", room, call_id)
}

fn dismiss_key(local_id: &str, room: &str, call_id: &str) -> String {
    format!("dismiss:{}:{}/{}", local_id, room, call_id)
}

/// What a room listener reports to the UI.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Someone else is calling and the call is ringing.
    Incoming(CallRecord),
    /// A previously announced incoming call stopped ringing for us: answered
    /// elsewhere, ended, or auto-dismissed locally.
    IncomingDismissed { call_id: String },
    /// A call we placed or joined changed.
    Updated(CallRecord),
    /// A record we knew about was deleted.
    Removed { call_id: String },
    /// The caller-side handshake started after the callee answered.
    MediaStarted {
        call_id: String,
        local_stream: MediaStream,
    },
    /// The caller-side handshake could not start.
    SetupFailed { call_id: String, error: String },
}

struct CoordinatorInner {
    store: Arc<dyn SharedStore>,
    channel: SignalChannel<SignalMessage>,
    sessions: MediaSessionManager,
    cleanup: CleanupScheduler,
    config: CallConfig,
}

#[derive(Clone)]
pub struct CallCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl CallCoordinator {
    pub fn new(
        store: Arc<dyn SharedStore>,
        sessions: MediaSessionManager,
        config: CallConfig,
    ) -> Self {
        let channel = SignalChannel::new(store.clone(), paths::CALL_SIGNAL_FEED);
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                channel,
                sessions,
                cleanup: CleanupScheduler::new(),
                config,
            }),
        }
    }

    /// Build the coordinator together with its media session manager.
    pub fn with_platform(
        store: Arc<dyn SharedStore>,
        transport: Arc<dyn PeerTransport>,
        capture: Arc<dyn MediaCapture>,
        config: CallConfig,
    ) -> Self {
        let channel = SignalChannel::new(store.clone(), paths::CALL_SIGNAL_FEED);
        let sessions = MediaSessionManager::new(channel, transport, capture, &config);
        Self::new(store, sessions, config)
    }

    pub fn sessions(&self) -> &MediaSessionManager {
        &self.inner.sessions
    }

    pub fn cleanup(&self) -> &CleanupScheduler {
        &self.inner.cleanup
    }

    pub fn config(&self) -> &CallConfig {
        &self.inner.config
    }

    /// Place a call: write a ringing record with the caller as sole
    /// participant and arm the missed-call timeout.
    pub async fn start_call(
        &self,
        room: &str,
        caller_name: &str,
        caller_id: &str,
        kind: CallKind,
    ) -> Result<String> {
        paths::validate_segment("room", room)?;
        paths::validate_segment("participant", caller_id)?;

        let call_id = self.inner.store.generate_key();
        let record = CallRecord::ringing(&call_id, room, caller_id, caller_name, kind);
        write_json(
            self.inner.store.as_ref(),
            &paths::call(room, &call_id),
            &record,
        )
        .await?;
        self.inner.schedule_ring_timeout(room, &call_id);
        info!("{} is calling in {} ({:?}), call {}", caller_id, room, kind, call_id);
        Ok(call_id)
    }

    /// Join a ringing call and start the callee side of the handshake.
    ///
    /// Returns `None` without error when the record is gone or no longer
    /// ringing.
    pub async fn answer_call(
        &self,
        room: &str,
        call_id: &str,
        answerer_id: &str,
    ) -> Result<Option<MediaStream>> {
        let path = paths::call(room, call_id);
        let Some(record) = read_json::<CallRecord>(self.inner.store.as_ref(), &path).await? else {
            debug!("call {} vanished before it was answered", call_id);
            return Ok(None);
        };
        if record.status != CallStatus::Ringing {
            debug!("call {} is already {:?}", call_id, record.status);
            return Ok(None);
        }
        if record.caller_id == answerer_id {
            return Err(Error::invalid_state("cannot answer your own call"));
        }

        let participants = record.participants_with(answerer_id);
        self.inner
            .store
            .update(
                &path,
                json!({ "status": CallStatus::Answered, "participants": participants }),
            )
            .await?;

        let remote_id = participants
            .iter()
            .find(|p| p.as_str() != answerer_id)
            .cloned()
            .unwrap_or(record.caller_id);
        let answered = self
            .inner
            .sessions
            .answer_call(CallTarget {
                room: room.to_string(),
                call_id: call_id.to_string(),
                local_id: answerer_id.to_string(),
                remote_id,
                kind: record.kind,
            })
            .await;
        let stream = match answered {
            Ok(stream) => stream,
            Err(err) => {
                // The caller is already negotiating against this record.
                warn!("{} could not join call {}: {}", answerer_id, call_id, err);
                self.inner.cleanup.cancel(&ring_key(room, call_id));
                if let Err(finish_err) = self.inner.finish(room, call_id, false).await {
                    warn!("could not end failed call {}: {}", call_id, finish_err);
                }
                self.inner.schedule_removal(room, call_id);
                return Err(err);
            }
        };
        info!("{} answered call {}", answerer_id, call_id);
        Ok(Some(stream))
    }

    /// Hang up. The local session is gone once this returns, whatever
    /// happens to the shared record afterwards.
    pub async fn end_call(&self, room: &str, call_id: &str) -> Result<()> {
        self.inner.cleanup.cancel(&ring_key(room, call_id));
        let had_session = self.inner.sessions.end_session(call_id).await;
        let marked = self.inner.finish(room, call_id, false).await;
        self.inner.schedule_removal(room, call_id);
        info!(
            "ended call {} (local session: {}, record updated: {})",
            call_id,
            had_session,
            matches!(marked, Ok(true))
        );
        marked.map(|_| ())
    }

    /// Reject a ringing call without any media.
    pub async fn decline_call(&self, room: &str, call_id: &str) -> Result<()> {
        if self.inner.finish(room, call_id, true).await? {
            self.inner.cleanup.cancel(&ring_key(room, call_id));
            self.inner.schedule_removal(room, call_id);
            info!("declined call {}", call_id);
        }
        Ok(())
    }

    /// Follow every call record in `room` on behalf of `local_id`.
    pub fn listen(&self, room: &str, local_id: &str) -> CallListener {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (dismiss_tx, dismiss_rx) = mpsc::unbounded_channel();
        let state = ListenerState {
            inner: self.inner.clone(),
            room: room.to_string(),
            local_id: local_id.to_string(),
            events: events_tx,
            dismiss_tx,
            gate: IncomingCallGate::new(local_id),
            known: HashMap::new(),
            started: HashSet::new(),
        };
        CallListener {
            events,
            task: tokio::spawn(run_listener(state, dismiss_rx)),
        }
    }

    /// Tear down every local session and drop pending timers. Shared records
    /// are left to the other participants' timeouts.
    pub fn shutdown(&self) {
        self.inner.sessions.shutdown();
        self.inner.cleanup.cancel_all();
    }
}

impl CoordinatorInner {
    /// Move a record to `ended`. Returns whether anything was written.
    async fn finish(&self, room: &str, call_id: &str, only_if_ringing: bool) -> Result<bool> {
        let path = paths::call(room, call_id);
        let Some(record) = read_json::<CallRecord>(self.store.as_ref(), &path).await? else {
            return Ok(false);
        };
        if record.status.is_terminal()
            || (only_if_ringing && record.status != CallStatus::Ringing)
        {
            return Ok(false);
        }
        self.store
            .update(
                &path,
                json!({ "status": CallStatus::Ended, "endedAt": now_millis() }),
            )
            .await?;
        Ok(true)
    }

    fn schedule_ring_timeout(self: &Arc<Self>, room: &str, call_id: &str) {
        let inner = self.clone();
        let (room_id, id) = (room.to_string(), call_id.to_string());
        self.cleanup
            .schedule(ring_key(room, call_id), self.config.ring_timeout, async move {
                match inner.finish(&room_id, &id, true).await {
                    Ok(true) => {
                        info!("call {} in {} was not answered", id, room_id);
                        inner.schedule_removal(&room_id, &id);
                    }
                    Ok(false) => debug!("ring timeout for call {} found it settled", id),
                    Err(err) => warn!("could not expire call {}: {}", id, err),
                }
            });
    }

    /// Delete the record and its signal feed after the grace period.
    fn schedule_removal(self: &Arc<Self>, room: &str, call_id: &str) {
        let inner = self.clone();
        let (room_id, id) = (room.to_string(), call_id.to_string());
        self.cleanup
            .schedule(removal_key(room, call_id), self.config.ended_grace, async move {
                if let Err(err) = inner.store.delete(&paths::call(&room_id, &id)).await {
                    warn!("could not delete call record {}: {}", id, err);
                }
                if let Err(err) = inner.channel.clear(&room_id, &id).await {
                    warn!("could not clear signals of call {}: {}", id, err);
                }
                debug!("removed call {} from {}", id, room_id);
            });
    }
}

/// Room subscription handle. Dropping it stops listening.
pub struct CallListener {
    events: mpsc::UnboundedReceiver<CallEvent>,
    task: JoinHandle<()>,
}

impl CallListener {
    pub async fn next(&mut self) -> Option<CallEvent> {
        self.events.recv().await
    }

    pub fn try_next(&mut self) -> Option<CallEvent> {
        self.events.try_recv().ok()
    }
}

impl Drop for CallListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct ListenerState {
    inner: Arc<CoordinatorInner>,
    room: String,
    local_id: String,
    events: mpsc::UnboundedSender<CallEvent>,
    dismiss_tx: mpsc::UnboundedSender<String>,
    gate: IncomingCallGate,
    known: HashMap<String, CallRecord>,
    started: HashSet<String>,
}

async fn run_listener(mut state: ListenerState, mut dismiss_rx: mpsc::UnboundedReceiver<String>) {
    let mut subscription = state.inner.store.subscribe(&paths::calls(&state.room));
    loop {
        tokio::select! {
            snapshot = subscription.next() => match snapshot {
                Some(snapshot) => state.on_snapshot(children::<CallRecord>(snapshot)).await,
                None => break,
            },
            Some(call_id) = dismiss_rx.recv() => state.on_dismiss_timer(&call_id),
        }
    }
    debug!("call listener for {} in {} stopped", state.local_id, state.room);
}

impl ListenerState {
    fn send(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    async fn on_snapshot(&mut self, records: Vec<(String, CallRecord)>) {
        let present: HashSet<String> = records.iter().map(|(key, _)| key.clone()).collect();
        for (key, record) in records {
            if let Some(previous) = self.known.get(&key) {
                if previous == &record {
                    continue;
                }
                if previous.status != record.status
                    && !previous.status.can_advance_to(record.status)
                {
                    debug!(
                        "ignoring stale {:?} for call {} already {:?}",
                        record.status, key, previous.status
                    );
                    continue;
                }
            }
            self.known.insert(key.clone(), record.clone());
            self.on_record(&key, record).await;
        }

        let gone: Vec<String> = self
            .known
            .keys()
            .filter(|key| !present.contains(*key))
            .cloned()
            .collect();
        for key in gone {
            self.on_removed(&key).await;
        }
    }

    async fn on_record(&mut self, key: &str, record: CallRecord) {
        let involved = record.involves(&self.local_id);
        match record.status {
            CallStatus::Ringing => {
                let timeout_ms = self.inner.config.ring_timeout.as_millis() as i64;
                if record.is_stale_ringing(now_millis(), timeout_ms) {
                    info!("call {} has been ringing too long, ending it", key);
                    self.expire(key).await;
                } else if self.gate.admit(&record) {
                    info!("incoming call {} from {}", key, record.caller_id);
                    self.schedule_dismiss(key);
                    self.send(CallEvent::Incoming(record));
                } else if involved {
                    self.send(CallEvent::Updated(record));
                }
            }
            CallStatus::Answered => {
                self.cancel_dismiss(key);
                if involved {
                    self.send(CallEvent::Updated(record.clone()));
                    if record.caller_id == self.local_id {
                        self.start_caller(key, &record).await;
                    }
                } else if self.gate.dismiss(key) {
                    self.send(CallEvent::IncomingDismissed {
                        call_id: key.to_string(),
                    });
                }
            }
            CallStatus::Ended => {
                self.cancel_dismiss(key);
                if involved {
                    if self.inner.sessions.end_session(key).await {
                        info!("call {} was ended by the other side", key);
                    }
                    self.send(CallEvent::Updated(record));
                } else if self.gate.dismiss(key) {
                    self.send(CallEvent::IncomingDismissed {
                        call_id: key.to_string(),
                    });
                }
            }
        }
    }

    async fn on_removed(&mut self, key: &str) {
        let record = self.known.remove(key);
        self.cancel_dismiss(key);
        self.started.remove(key);
        let announced = self.gate.is_announced(key);
        self.gate.forget(key);

        // The ended state may have been coalesced away.
        if self.inner.sessions.end_session(key).await {
            info!("call {} was deleted while active", key);
        }
        let involved = record
            .map(|r| r.involves(&self.local_id))
            .unwrap_or(false);
        if involved || announced {
            self.send(CallEvent::Removed {
                call_id: key.to_string(),
            });
        }
    }

    async fn start_caller(&mut self, key: &str, record: &CallRecord) {
        if !self.started.insert(key.to_string()) || self.inner.sessions.has_session(key) {
            return;
        }
        let Some(remote_id) = record.other_participant(&self.local_id) else {
            warn!("answered call {} has no other participant", key);
            return;
        };
        let target = CallTarget {
            room: self.room.clone(),
            call_id: key.to_string(),
            local_id: self.local_id.clone(),
            remote_id: remote_id.to_string(),
            kind: record.kind,
        };
        match self.inner.sessions.start_call(target).await {
            Ok(local_stream) => self.send(CallEvent::MediaStarted {
                call_id: key.to_string(),
                local_stream,
            }),
            Err(err) => {
                warn!("could not start call {}: {}", key, err);
                self.send(CallEvent::SetupFailed {
                    call_id: key.to_string(),
                    error: err.to_string(),
                });
            }
        }
    }

    async fn expire(&self, key: &str) {
        match self.inner.finish(&self.room, key, true).await {
            Ok(true) => self.inner.schedule_removal(&self.room, key),
            Ok(false) => {}
            Err(err) => warn!("could not end stale call {}: {}", key, err),
        }
    }

    fn schedule_dismiss(&self, key: &str) {
        let tx = self.dismiss_tx.clone();
        let call_id = key.to_string();
        self.inner.cleanup.schedule(
            dismiss_key(&self.local_id, &self.room, key),
            self.inner.config.incoming_dismiss,
            async move {
                let _ = tx.send(call_id);
            },
        );
    }

    fn cancel_dismiss(&self, key: &str) {
        self.inner
            .cleanup
            .cancel(&dismiss_key(&self.local_id, &self.room, key));
    }

    fn on_dismiss_timer(&mut self, call_id: &str) {
        let ringing = self
            .known
            .get(call_id)
            .map(|r| r.status == CallStatus::Ringing)
            .unwrap_or(false);
        if ringing && self.gate.dismiss(call_id) {
            info!("auto-dismissing incoming call {}", call_id);
            self.send(CallEvent::IncomingDismissed {
                call_id: call_id.to_string(),
            });
        }
    }
}
