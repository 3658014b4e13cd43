use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// Keyed work queue with the semantics the reconciler workers rely on:
/// a key is queued at most once, a key being processed is held aside until
/// `done` so concurrent adds defer instead of running in parallel, and
/// `add_rate_limited` re-adds with per-key exponential backoff that
/// `forget` resets. Shutdown drains what is already queued.
pub struct WorkQueue {
    name: &'static str,
    inner: Mutex<Inner>,
    notify: Notify,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shut_down: bool,
}

impl WorkQueue {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        })
    }

    pub fn add(&self, key: &str) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.shut_down || inner.dirty.contains(key) {
            return;
        }
        inner.dirty.insert(key.to_string());
        if inner.processing.contains(key) {
            // re-queued by done() once the in-flight handler finishes
            return;
        }
        inner.queue.push_back(key.to_string());
        drop(inner);
        self.notify.notify_one();
    }

    /// Blocks until a key is available. Returns `None` once the queue is
    /// shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                if inner.shut_down {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn done(&self, key: &str) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.processing.remove(key);
        if inner.dirty.contains(key) {
            inner.queue.push_back(key.to_string());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Schedule a delayed re-add, backing off exponentially per key.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            let failures = inner.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            Self::backoff(*failures)
        };
        trace!("queue {} retries {} in {:?}", self.name, key, delay);
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    pub fn forget(&self, key: &str) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.failures.remove(key);
    }

    pub fn shut_down(&self) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.shut_down = true;
        drop(inner);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn backoff(failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(63);
        BASE_DELAY
            .saturating_mul(2u32.saturating_pow(exp))
            .min(MAX_DELAY)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_add_deduplicates_queued_keys() {
        let queue = WorkQueue::new("test");
        queue.add("s1");
        queue.add("s1");
        queue.add("s2");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.as_deref(), Some("s1"));
        assert_eq!(queue.get().await.as_deref(), Some("s2"));
    }

    #[tokio::test]
    async fn test_add_during_processing_defers_until_done() {
        let queue = WorkQueue::new("test");
        queue.add("s1");
        let key = queue.get().await.expect("queued key");
        queue.add("s1");
        // held aside while in flight
        assert_eq!(queue.len(), 0);
        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_stops() {
        let queue = WorkQueue::new("test");
        queue.add("s1");
        queue.shut_down();
        queue.add("s2");
        assert_eq!(queue.get().await.as_deref(), Some("s1"));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_add_lands_after_delay() {
        let queue = WorkQueue::new("test");
        queue.add_rate_limited("s1");
        // paused clock auto-advances through the backoff sleep
        assert_eq!(queue.get().await.as_deref(), Some("s1"));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(WorkQueue::backoff(1), Duration::from_millis(5));
        assert_eq!(WorkQueue::backoff(2), Duration::from_millis(10));
        assert_eq!(WorkQueue::backoff(3), Duration::from_millis(20));
        assert!(WorkQueue::backoff(4) > WorkQueue::backoff(3));
        assert_eq!(WorkQueue::backoff(63), MAX_DELAY);
    }
}
