//! In-process implementation of [`SharedStore`].
//!
//! Used by tests, the CLI simulation and any embedding that keeps every
//! participant in one process. Supports write/delete failure injection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::debug;

use huddle_common::{now_millis, Error, Result};

use crate::paths;
use crate::store::{expect_object, SharedStore, Subscription};

struct Watcher {
    segments: Vec<String>,
    tx: watch::Sender<Option<Value>>,
}

struct State {
    root: Value,
    watchers: Vec<Watcher>,
}

pub struct MemoryStore {
    state: Mutex<State>,
    key_seq: AtomicU64,
    last_key_millis: AtomicU64,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                root: Value::Object(Map::new()),
                watchers: Vec::new(),
            }),
            key_seq: AtomicU64::new(0),
            last_key_millis: AtomicU64::new(0),
            fail_writes: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    /// Reject every subsequent write, update and push.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Reject every subsequent delete.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Copy of the whole tree.
    pub fn dump(&self) -> Value {
        self.lock().root.clone()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.watchers.retain(|w| !w.tx.is_closed());
        state.watchers.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_write(&self, path: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::storage(format!("write rejected at {}", path)));
        }
        Ok(())
    }

    fn mutate<F>(&self, path: &str, apply: F)
    where
        F: FnOnce(&mut Value, &[String]),
    {
        let segments = paths::segments(path);
        let mut state = self.lock();
        apply(&mut state.root, &segments);
        notify(&mut state, &segments);
    }
}

fn get<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for segment in segments {
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

fn set(root: &mut Value, segments: &[String], value: Value) {
    if value.is_null() {
        remove(root, segments);
        return;
    }
    let Some((last, parents)) = segments.split_last() else {
        *root = match value {
            Value::Object(map) => Value::Object(map),
            _ => Value::Object(Map::new()),
        };
        return;
    };
    let mut node = root;
    for segment in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(last.clone(), value);
    }
}

/// Remove the node and prune parents left empty.
fn remove(node: &mut Value, segments: &[String]) {
    let Some((head, rest)) = segments.split_first() else {
        *node = Value::Object(Map::new());
        return;
    };
    let Value::Object(map) = node else {
        return;
    };
    if rest.is_empty() {
        map.remove(head);
        return;
    }
    if let Some(child) = map.get_mut(head) {
        remove(child, rest);
        if child.as_object().is_some_and(Map::is_empty) {
            map.remove(head);
        }
    }
}

fn related(a: &[String], b: &[String]) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

fn notify(state: &mut State, changed: &[String]) {
    state.watchers.retain(|w| !w.tx.is_closed());
    let State { root, watchers } = state;
    for watcher in watchers.iter() {
        if !related(&watcher.segments, changed) {
            continue;
        }
        let fresh = get(root, &watcher.segments).cloned();
        watcher.tx.send_if_modified(|current| {
            if *current != fresh {
                *current = fresh;
                true
            } else {
                false
            }
        });
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn write(&self, path: &str, value: Value) -> Result<()> {
        self.check_write(path)?;
        self.mutate(path, |root, segments| set(root, segments, value));
        Ok(())
    }

    async fn update(&self, path: &str, partial: Value) -> Result<()> {
        self.check_write(path)?;
        let fields = expect_object(path, partial)?;
        self.mutate(path, |root, segments| {
            let mut merged = match get(root, segments) {
                Some(Value::Object(existing)) => existing.clone(),
                _ => Map::new(),
            };
            for (key, value) in fields {
                if value.is_null() {
                    merged.remove(&key);
                } else {
                    merged.insert(key, value);
                }
            }
            if merged.is_empty() {
                remove(root, segments);
            } else {
                set(root, segments, Value::Object(merged));
            }
        });
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Error::storage(format!("delete rejected at {}", path)));
        }
        self.mutate(path, remove);
        debug!("deleted {}", path);
        Ok(())
    }

    async fn read_once(&self, path: &str) -> Result<Option<Value>> {
        let segments = paths::segments(path);
        Ok(get(&self.lock().root, &segments).cloned())
    }

    fn generate_key(&self) -> String {
        let now = u64::try_from(now_millis()).unwrap_or(0);
        let millis = self.last_key_millis.fetch_max(now, Ordering::SeqCst).max(now);
        let seq = self.key_seq.fetch_add(1, Ordering::SeqCst);
        format!("{:012x}{:08x}", millis, seq & 0xffff_ffff)
    }

    fn subscribe(&self, path: &str) -> Subscription {
        let segments = paths::segments(path);
        let mut state = self.lock();
        let current = get(&state.root, &segments).cloned();
        let (tx, rx) = watch::channel(current);
        state.watchers.push(Watcher { segments, tx });
        Subscription::new(path, rx)
    }
}
