//! Deferred, cancellable tasks keyed by name.
//!
//! Used for the missed-call timeout, delayed record deletion and local
//! auto-dismiss. Scheduling a key that is already pending replaces the old
//! task, so a superseded deletion never fires.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Default)]
struct Pending {
    tasks: HashMap<String, (u64, AbortHandle)>,
}

#[derive(Clone, Default)]
pub struct CleanupScheduler {
    pending: Arc<Mutex<Pending>>,
    generation: Arc<AtomicU64>,
}

impl CleanupScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `task` after `delay` unless cancelled or replaced first.
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, key: impl Into<String>, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let pending = self.pending.clone();
        let task_key = key.clone();

        // Hold the lock across spawn so the task cannot finish and clean up
        // before its own entry is recorded.
        let mut guard = self.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut guard = pending.lock().unwrap_or_else(PoisonError::into_inner);
                match guard.tasks.get(&task_key) {
                    Some((current, _)) if *current == generation => {
                        guard.tasks.remove(&task_key);
                    }
                    _ => return,
                }
            }
            debug!("running deferred task {}", task_key);
            task.await;
        });
        if let Some((_, previous)) = guard
            .tasks
            .insert(key.clone(), (generation, handle.abort_handle()))
        {
            debug!("replacing deferred task {}", key);
            previous.abort();
        }
    }

    /// Cancel a pending task. Returns whether one was pending.
    pub fn cancel(&self, key: &str) -> bool {
        match self.lock().tasks.remove(key) {
            Some((_, handle)) => {
                handle.abort();
                debug!("cancelled deferred task {}", key);
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        self.lock().tasks.contains_key(key)
    }

    pub fn pending(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.lock().tasks.drain().collect();
        for (_, (_, handle)) in drained {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_runs_after_delay() {
        let scheduler = CleanupScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule("delete:c1", Duration::from_secs(5), counter_task(&counter));
        assert!(scheduler.is_scheduled("delete:c1"));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_scheduled("delete:c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_run() {
        let scheduler = CleanupScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule("ring:c1", Duration::from_secs(60), counter_task(&counter));
        assert!(scheduler.cancel("ring:c1"));
        assert!(!scheduler.cancel("ring:c1"));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduling_replaces_previous_task() {
        let scheduler = CleanupScheduler::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        scheduler.schedule("delete:c1", Duration::from_secs(5), counter_task(&first));
        scheduler.schedule("delete:c1", Duration::from_secs(10), counter_task(&second));
        assert_eq!(scheduler.pending(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let scheduler = CleanupScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            scheduler.schedule(format!("k{}", i), Duration::from_secs(1), counter_task(&counter));
        }
        scheduler.cancel_all();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
