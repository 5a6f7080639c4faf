//! Per-session message relay over the shared store.
//!
//! Messages are appended under `rooms/{room}/{feed}/{session}` and every
//! subscriber sees the full outstanding set after each change. Addressed
//! messages are consumed by their recipient with remove-then-act semantics;
//! broadcast messages stay in the feed until the feed is cleared.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use huddle_common::{Error, Result, SignalMessage, TheaterAction};

use crate::paths;
use crate::store::{children, SharedStore, Subscription};

/// A payload shape carried by a [`SignalChannel`].
pub trait ChannelMessage: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// The participant this message is for, or `None` for every reader.
    fn recipient(&self) -> Option<&str>;
}

impl ChannelMessage for SignalMessage {
    fn recipient(&self) -> Option<&str> {
        Some(&self.to)
    }
}

impl ChannelMessage for TheaterAction {
    fn recipient(&self) -> Option<&str> {
        None
    }
}

/// A message together with its store key.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<M> {
    pub key: String,
    pub message: M,
}

pub struct SignalChannel<M> {
    store: Arc<dyn SharedStore>,
    feed: &'static str,
    _message: PhantomData<fn() -> M>,
}

impl<M> Clone for SignalChannel<M> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            feed: self.feed,
            _message: PhantomData,
        }
    }
}

impl<M: ChannelMessage> SignalChannel<M> {
    pub fn new(store: Arc<dyn SharedStore>, feed: &'static str) -> Self {
        Self {
            store,
            feed,
            _message: PhantomData,
        }
    }

    fn feed_path(&self, room: &str, session: &str) -> String {
        paths::feed(self.feed, room, session)
    }

    /// Append a message. Rejections surface as signaling failures.
    pub async fn publish(&self, room: &str, session: &str, message: &M) -> Result<String> {
        let value = serde_json::to_value(message)?;
        self.store
            .push(&self.feed_path(room, session), value)
            .await
            .map_err(|err| Error::signaling(format!("publish on {} failed: {}", self.feed, err)))
    }

    /// Watch the outstanding message set of one session.
    pub fn subscribe(&self, room: &str, session: &str) -> ChannelSubscription<M> {
        ChannelSubscription {
            inner: self.store.subscribe(&self.feed_path(room, session)),
            _message: PhantomData,
        }
    }

    /// Remove one message from the feed.
    pub async fn consume(&self, room: &str, session: &str, key: &str) -> Result<()> {
        self.store
            .delete(&paths::join(&self.feed_path(room, session), key))
            .await
    }

    /// Remove the whole feed of a session.
    pub async fn clear(&self, room: &str, session: &str) -> Result<()> {
        self.store.delete(&self.feed_path(room, session)).await
    }

    /// Reader-side view that only yields messages for `reader`.
    pub fn inbox(&self, room: &str, session: &str, reader: &str) -> Inbox<M> {
        Inbox {
            channel: self.clone(),
            room: room.to_string(),
            session: session.to_string(),
            reader: reader.to_string(),
            subscription: self.subscribe(room, session),
            seen: HashSet::new(),
        }
    }
}

pub struct ChannelSubscription<M> {
    inner: Subscription,
    _message: PhantomData<fn() -> M>,
}

impl<M: ChannelMessage> ChannelSubscription<M> {
    /// The next full snapshot of outstanding messages, in store order.
    pub async fn next_batch(&mut self) -> Option<Vec<Envelope<M>>> {
        let snapshot = self.inner.next().await?;
        Some(
            children::<M>(snapshot)
                .into_iter()
                .map(|(key, message)| Envelope { key, message })
                .collect(),
        )
    }
}

/// Consumes the messages addressed to one reader.
///
/// Each addressed message is deleted from the store before it is handed to
/// the caller, so a crash while acting on it drops it rather than replaying
/// it. Messages for other participants are left untouched. Broadcast messages
/// are yielded once per reader.
pub struct Inbox<M> {
    channel: SignalChannel<M>,
    room: String,
    session: String,
    reader: String,
    subscription: ChannelSubscription<M>,
    seen: HashSet<String>,
}

impl<M: ChannelMessage> Inbox<M> {
    pub fn reader(&self) -> &str {
        &self.reader
    }

    /// The next non-empty group of fresh messages for this reader.
    pub async fn next(&mut self) -> Option<Vec<Envelope<M>>> {
        loop {
            let batch = self.subscription.next_batch().await?;
            let live: HashSet<&str> = batch.iter().map(|e| e.key.as_str()).collect();
            let mut fresh = Vec::new();
            for envelope in &batch {
                if self.seen.contains(&envelope.key) {
                    continue;
                }
                match envelope.message.recipient() {
                    Some(to) if to != self.reader => continue,
                    Some(_) => {
                        if let Err(err) = self
                            .channel
                            .consume(&self.room, &self.session, &envelope.key)
                            .await
                        {
                            warn!(
                                "failed to remove consumed message {} from {}/{}: {}",
                                envelope.key, self.room, self.session, err
                            );
                        }
                    }
                    None => {}
                }
                self.seen.insert(envelope.key.clone());
                fresh.push(envelope.clone());
            }
            // Addressed keys were deleted; broadcast keys stay seen while present.
            let before = self.seen.len();
            self.seen.retain(|key| {
                live.contains(key.as_str()) || fresh.iter().any(|e| &e.key == key)
            });
            if before != self.seen.len() {
                debug!(
                    "forgot {} consumed keys on {}/{}",
                    before - self.seen.len(),
                    self.room,
                    self.session
                );
            }
            if !fresh.is_empty() {
                return Some(fresh);
            }
        }
    }
}
