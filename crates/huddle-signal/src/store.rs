//! Shared real-time store contract.
//!
//! The store is a tree of JSON values addressed by `/`-separated paths. Every
//! subscriber receives the full current value at its path after each mutation
//! that touches it; intermediate states may be coalesced.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use huddle_common::{Error, Result};

use crate::paths;

/// Multi-writer hierarchical store shared by every participant in a room.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Replace the value at `path`.
    async fn write(&self, path: &str, value: Value) -> Result<()>;

    /// Shallow-merge the fields of `partial` (a JSON object) into the object at
    /// `path`. `null` fields are removed.
    async fn update(&self, path: &str, partial: Value) -> Result<()>;

    /// Remove the value at `path` and everything below it.
    async fn delete(&self, path: &str) -> Result<()>;

    async fn read_once(&self, path: &str) -> Result<Option<Value>>;

    /// A fresh child key. Keys sort in generation order.
    fn generate_key(&self) -> String;

    /// Watch the value at `path`. Dropping the subscription unsubscribes.
    fn subscribe(&self, path: &str) -> Subscription;

    /// Write `value` under a generated child key of `path`.
    async fn push(&self, path: &str, value: Value) -> Result<String> {
        let key = self.generate_key();
        self.write(&paths::join(path, &key), value).await?;
        Ok(key)
    }
}

/// Live view of one store path.
#[derive(Debug)]
pub struct Subscription {
    path: String,
    rx: watch::Receiver<Option<Value>>,
    primed: bool,
}

impl Subscription {
    pub fn new(path: impl Into<String>, rx: watch::Receiver<Option<Value>>) -> Self {
        Self {
            path: path.into(),
            rx,
            primed: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The value at the path right now, without waiting.
    pub fn current(&self) -> Option<Value> {
        self.rx.borrow().clone()
    }

    /// The next snapshot. The first call yields the current value
    /// immediately; `None` once the store is gone.
    pub async fn next(&mut self) -> Option<Option<Value>> {
        if !self.primed {
            self.primed = true;
            return Some(self.rx.borrow_and_update().clone());
        }
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

/// Read and decode the value at `path`.
pub async fn read_json<T: DeserializeOwned>(
    store: &dyn SharedStore,
    path: &str,
) -> Result<Option<T>> {
    match store.read_once(path).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Encode `value` and write it at `path`.
pub async fn write_json<T: Serialize + ?Sized>(
    store: &dyn SharedStore,
    path: &str,
    value: &T,
) -> Result<()> {
    let value = serde_json::to_value(value)?;
    store.write(path, value).await
}

/// Decode every child of an object snapshot, skipping malformed entries.
pub fn children<T: DeserializeOwned>(snapshot: Option<Value>) -> Vec<(String, T)> {
    let Some(Value::Object(map)) = snapshot else {
        return Vec::new();
    };
    map.into_iter()
        .filter_map(|(key, value)| match serde_json::from_value::<T>(value) {
            Ok(item) => Some((key, item)),
            Err(err) => {
                tracing::warn!("skipping malformed entry {}: {}", key, err);
                None
            }
        })
        .collect()
}

pub(crate) fn expect_object(path: &str, value: Value) -> Result<serde_json::Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::storage(format!(
            "update at {} expects an object, got {}",
            path, other
        ))),
    }
}
