//! Host-authoritative theater sessions.
//!
//! The session record in the shared store is the source of truth. Only the
//! host may play, pause, seek, advance the queue or end the session; every
//! such action is written as `lastAction` and appended to the room's action
//! feed. Viewers only read.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use huddle_common::{
    now_millis, Error, QueueVideo, Result, TheaterAction, TheaterActionKind, TheaterConfig,
    TheaterSession, TheaterStatus,
};
use huddle_signal::{
    children, paths, read_json, write_json, CleanupScheduler, Inbox, SharedStore, SignalChannel,
    Subscription,
};

fn removal_key(room: &str, session_id: &str) -> String {
    format!("theater:{}/{}", room, session_id)
}

fn check_position(current_time: f64) -> Result<()> {
    if current_time.is_finite() && current_time >= 0.0 {
        Ok(())
    } else {
        Err(Error::invalid_state(format!(
            "invalid playback position {}",
            current_time
        )))
    }
}

#[derive(Clone)]
pub struct TheaterCoordinator {
    store: Arc<dyn SharedStore>,
    actions: SignalChannel<TheaterAction>,
    cleanup: CleanupScheduler,
    config: TheaterConfig,
}

impl TheaterCoordinator {
    pub fn new(store: Arc<dyn SharedStore>, config: TheaterConfig) -> Self {
        let actions = SignalChannel::new(store.clone(), paths::THEATER_ACTION_FEED);
        Self {
            store,
            actions,
            cleanup: CleanupScheduler::new(),
            config,
        }
    }

    pub fn config(&self) -> &TheaterConfig {
        &self.config
    }

    pub fn cleanup(&self) -> &CleanupScheduler {
        &self.cleanup
    }

    async fn load(&self, room: &str, session_id: &str) -> Result<TheaterSession> {
        read_json::<TheaterSession>(self.store.as_ref(), &paths::theater(room, session_id))
            .await?
            .ok_or_else(|| Error::not_found(format!("theater session {}", session_id)))
    }

    async fn load_live(&self, room: &str, session_id: &str) -> Result<TheaterSession> {
        let session = self.load(room, session_id).await?;
        if session.status == TheaterStatus::Ended {
            return Err(Error::invalid_state(format!(
                "theater session {} has ended",
                session_id
            )));
        }
        Ok(session)
    }

    async fn load_for_host(
        &self,
        room: &str,
        session_id: &str,
        user_id: &str,
    ) -> Result<TheaterSession> {
        let session = self.load_live(room, session_id).await?;
        if !session.is_host(user_id) {
            return Err(Error::forbidden(format!(
                "{} is not the host of theater session {}",
                user_id, session_id
            )));
        }
        Ok(session)
    }

    /// Open a paused session on `url` with the host as only participant.
    pub async fn create_session(
        &self,
        room: &str,
        host_id: &str,
        host_name: &str,
        url: &str,
        title: &str,
    ) -> Result<TheaterSession> {
        paths::validate_segment("room", room)?;
        paths::validate_segment("participant", host_id)?;

        let now = now_millis();
        let session = TheaterSession {
            id: self.store.generate_key(),
            room_id: room.to_string(),
            host_id: host_id.to_string(),
            host_name: host_name.to_string(),
            video: Some(QueueVideo {
                id: self.store.generate_key(),
                url: url.to_string(),
                title: title.to_string(),
                added_by: host_id.to_string(),
                added_at: now,
            }),
            status: TheaterStatus::Paused,
            current_time: 0.0,
            last_action: None,
            participants: vec![host_id.to_string()],
            queue: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        write_json(
            self.store.as_ref(),
            &paths::theater(room, &session.id),
            &session,
        )
        .await?;
        info!("{} opened theater session {} in {}", host_id, session.id, room);
        Ok(session)
    }

    /// Sessions in `room` that have not ended.
    pub async fn active_sessions(&self, room: &str) -> Result<Vec<TheaterSession>> {
        let snapshot = self.store.read_once(&paths::theaters(room)).await?;
        Ok(children::<TheaterSession>(snapshot)
            .into_iter()
            .map(|(_, session)| session)
            .filter(|s| s.status != TheaterStatus::Ended)
            .collect())
    }

    pub async fn join(&self, room: &str, session_id: &str, user_id: &str) -> Result<TheaterSession> {
        let mut session = self.load_live(room, session_id).await?;
        if !session.participants.iter().any(|p| p == user_id) {
            session.participants.push(user_id.to_string());
            self.store
                .update(
                    &paths::theater(room, session_id),
                    json!({ "participants": session.participants }),
                )
                .await?;
            info!("{} joined theater session {}", user_id, session_id);
        }
        Ok(session)
    }

    /// Leave the session. The host leaving ends it for everyone.
    pub async fn leave(&self, room: &str, session_id: &str, user_id: &str) -> Result<()> {
        let session = self.load(room, session_id).await?;
        if session.is_host(user_id) {
            return self.end_session(room, session_id, user_id).await;
        }
        let participants: Vec<&String> = session
            .participants
            .iter()
            .filter(|p| p.as_str() != user_id)
            .collect();
        if participants.len() != session.participants.len() {
            self.store
                .update(
                    &paths::theater(room, session_id),
                    json!({ "participants": participants }),
                )
                .await?;
            debug!("{} left theater session {}", user_id, session_id);
        }
        Ok(())
    }

    pub async fn play(
        &self,
        room: &str,
        session_id: &str,
        user_id: &str,
        current_time: f64,
    ) -> Result<TheaterAction> {
        self.host_action(room, session_id, user_id, TheaterActionKind::Play, current_time)
            .await
    }

    pub async fn pause(
        &self,
        room: &str,
        session_id: &str,
        user_id: &str,
        current_time: f64,
    ) -> Result<TheaterAction> {
        self.host_action(room, session_id, user_id, TheaterActionKind::Pause, current_time)
            .await
    }

    pub async fn seek(
        &self,
        room: &str,
        session_id: &str,
        user_id: &str,
        current_time: f64,
    ) -> Result<TheaterAction> {
        self.host_action(room, session_id, user_id, TheaterActionKind::Seek, current_time)
            .await
    }

    async fn host_action(
        &self,
        room: &str,
        session_id: &str,
        user_id: &str,
        kind: TheaterActionKind,
        current_time: f64,
    ) -> Result<TheaterAction> {
        check_position(current_time)?;
        let session = self.load_for_host(room, session_id, user_id).await?;
        let status = match kind {
            TheaterActionKind::Play => TheaterStatus::Playing,
            TheaterActionKind::Pause => TheaterStatus::Paused,
            TheaterActionKind::Seek => session.status,
        };
        let action = TheaterAction::new(kind, current_time, user_id);
        self.store
            .update(
                &paths::theater(room, session_id),
                json!({
                    "status": status,
                    "currentTime": current_time,
                    "lastAction": action,
                    "updatedAt": action.timestamp,
                }),
            )
            .await?;
        self.log_action(room, session_id, &action).await;
        info!(
            "theater {} {:?} at {:.1}s by {}",
            session_id, kind, current_time, user_id
        );
        Ok(action)
    }

    async fn log_action(&self, room: &str, session_id: &str, action: &TheaterAction) {
        // The record already carries the action; the feed is a replica.
        if let Err(err) = self.actions.publish(room, session_id, action).await {
            warn!("could not log theater action on {}: {}", session_id, err);
        }
    }

    /// Host position report while playing. Does not touch `lastAction`.
    pub async fn heartbeat(
        &self,
        room: &str,
        session_id: &str,
        user_id: &str,
        current_time: f64,
    ) -> Result<()> {
        check_position(current_time)?;
        self.load_for_host(room, session_id, user_id).await?;
        self.store
            .update(
                &paths::theater(room, session_id),
                json!({ "currentTime": current_time, "updatedAt": now_millis() }),
            )
            .await
    }

    /// Queue a video. Any participant may add; the queue holds at most
    /// `max_queue` entries.
    pub async fn add_to_queue(
        &self,
        room: &str,
        session_id: &str,
        user_id: &str,
        url: &str,
        title: &str,
    ) -> Result<QueueVideo> {
        let mut session = self.load_live(room, session_id).await?;
        if !session.is_host(user_id) && !session.participants.iter().any(|p| p == user_id) {
            return Err(Error::forbidden(format!(
                "{} has not joined theater session {}",
                user_id, session_id
            )));
        }
        if session.queue.len() >= self.config.max_queue {
            return Err(Error::QueueFull(self.config.max_queue));
        }
        let video = QueueVideo {
            id: self.store.generate_key(),
            url: url.to_string(),
            title: title.to_string(),
            added_by: user_id.to_string(),
            added_at: now_millis(),
        };
        session.queue.push(video.clone());
        self.store
            .update(
                &paths::theater(room, session_id),
                json!({ "queue": session.queue, "updatedAt": now_millis() }),
            )
            .await?;
        debug!("{} queued {} in theater {}", user_id, video.url, session_id);
        Ok(video)
    }

    /// Drop a queued video. Allowed for the host and whoever added it.
    pub async fn remove_from_queue(
        &self,
        room: &str,
        session_id: &str,
        user_id: &str,
        video_id: &str,
    ) -> Result<bool> {
        let mut session = self.load_live(room, session_id).await?;
        let Some(index) = session.queue.iter().position(|v| v.id == video_id) else {
            return Ok(false);
        };
        if !session.is_host(user_id) && session.queue[index].added_by != user_id {
            return Err(Error::forbidden(format!(
                "{} cannot remove video {}",
                user_id, video_id
            )));
        }
        session.queue.remove(index);
        self.store
            .update(
                &paths::theater(room, session_id),
                json!({ "queue": session.queue, "updatedAt": now_millis() }),
            )
            .await?;
        Ok(true)
    }

    /// Promote the head of the queue and start it from the beginning.
    /// `None` when the queue is empty.
    pub async fn play_next(
        &self,
        room: &str,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<QueueVideo>> {
        let mut session = self.load_for_host(room, session_id, user_id).await?;
        if session.queue.is_empty() {
            return Ok(None);
        }
        let next = session.queue.remove(0);
        let action = TheaterAction::new(TheaterActionKind::Play, 0.0, user_id);
        self.store
            .update(
                &paths::theater(room, session_id),
                json!({
                    "video": next,
                    "queue": session.queue,
                    "status": TheaterStatus::Playing,
                    "currentTime": 0.0,
                    "lastAction": action,
                    "updatedAt": action.timestamp,
                }),
            )
            .await?;
        self.log_action(room, session_id, &action).await;
        info!("theater {} now playing {}", session_id, next.url);
        Ok(Some(next))
    }

    /// End the session and delete it after the grace period. Idempotent.
    pub async fn end_session(&self, room: &str, session_id: &str, user_id: &str) -> Result<()> {
        let session = self.load(room, session_id).await?;
        if !session.is_host(user_id) {
            return Err(Error::forbidden(format!(
                "{} is not the host of theater session {}",
                user_id, session_id
            )));
        }
        if session.status != TheaterStatus::Ended {
            self.store
                .update(
                    &paths::theater(room, session_id),
                    json!({ "status": TheaterStatus::Ended, "updatedAt": now_millis() }),
                )
                .await?;
            info!("theater session {} ended", session_id);
        }

        let store = self.store.clone();
        let actions = self.actions.clone();
        let (room_id, id) = (room.to_string(), session_id.to_string());
        self.cleanup.schedule(
            removal_key(room, session_id),
            self.config.ended_grace,
            async move {
                if let Err(err) = store.delete(&paths::theater(&room_id, &id)).await {
                    warn!("could not delete theater session {}: {}", id, err);
                }
                if let Err(err) = actions.clear(&room_id, &id).await {
                    warn!("could not clear theater actions of {}: {}", id, err);
                }
            },
        );
        Ok(())
    }

    /// Follow one session record.
    pub fn watch(&self, room: &str, session_id: &str) -> TheaterWatch {
        TheaterWatch {
            subscription: self.store.subscribe(&paths::theater(room, session_id)),
        }
    }

    /// The host action log of a session, as seen by `reader`.
    pub fn actions(&self, room: &str, session_id: &str, reader: &str) -> Inbox<TheaterAction> {
        self.actions.inbox(room, session_id, reader)
    }
}

/// Live view of one theater session record.
pub struct TheaterWatch {
    subscription: Subscription,
}

impl TheaterWatch {
    /// The next state of the session: `Some(None)` once it is deleted,
    /// `None` when the store goes away. Malformed snapshots are skipped.
    pub async fn next(&mut self) -> Option<Option<TheaterSession>> {
        loop {
            let Some(value) = self.subscription.next().await? else {
                return Some(None);
            };
            match serde_json::from_value(value) {
                Ok(session) => return Some(Some(session)),
                Err(err) => warn!(
                    "skipping malformed theater session at {}: {}",
                    self.subscription.path(),
                    err
                ),
            }
        }
    }
}
