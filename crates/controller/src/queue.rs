//! Deduplicating work queue.
//!
//! A key is in at most one of three places: waiting in the queue, being
//! processed by a worker, or both "processing and dirty" when it was
//! re-added mid-pass. A dirty key is re-queued exactly once when its pass
//! finishes, so any number of change notifications during a pass collapse
//! into a single follow-up pass.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

use warden_common::Backoff;

struct QueueState<K> {
    queue: VecDeque<K>,
    /// Keys that need a pass (queued, or re-added while processing)
    dirty: HashSet<K>,
    processing: HashSet<K>,
    /// Consecutive rate-limited requeues per key
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    backoff: Backoff,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + std::fmt::Display + Send + Sync + 'static,
{
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff,
        }
    }

    /// Mark `key` as needing a pass.
    pub fn add(&self, key: K) {
        {
            let mut state = self.state.lock();
            if state.shutting_down || !state.dirty.insert(key.clone()) {
                return;
            }
            if state.processing.contains(&key) {
                trace!(key = %key, "Key in flight, coalescing");
                return;
            }
            state.queue.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let queue = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                queue.add(key);
            }
        });
    }

    /// Add `key` after its per-key backoff delay. Returns the delay used.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) -> Duration {
        let attempt = {
            let mut state = self.state.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let attempt = *failures;
            *failures = failures.saturating_add(1);
            attempt
        };
        let delay = self.backoff.delay(attempt);
        trace!(key = %key, attempt, delay_ms = delay.as_millis() as u64, "Rate-limited requeue");
        self.add_after(key, delay);
        delay
    }

    /// Reset the backoff of `key`.
    pub fn forget(&self, key: &K) {
        self.state.lock().failures.remove(key);
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Finish the pass for `key`, re-queuing it if it was re-added meanwhile.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Keys waiting for a worker.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_common::ObjectKey;

    fn queue() -> Arc<WorkQueue<ObjectKey>> {
        Arc::new(WorkQueue::new(Backoff::new(
            Duration::from_millis(10),
            Duration::from_millis(40),
        )))
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("Challenge", "default", name)
    }

    #[tokio::test]
    async fn test_add_deduplicates() {
        let queue = queue();
        queue.add(key("a"));
        queue.add(key("a"));
        queue.add(key("b"));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_readd_during_processing_runs_once_more() {
        let queue = queue();
        queue.add(key("a"));

        let in_flight = queue.get().await.unwrap();
        queue.add(key("a"));
        queue.add(key("a"));
        queue.add(key("a"));
        assert_eq!(queue.len(), 0, "in-flight key must not be queued twice");

        queue.done(&in_flight);
        assert_eq!(queue.len(), 1);

        let again = queue.get().await.unwrap();
        queue.done(&again);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_delays_grow_and_reset() {
        let queue = queue();
        assert_eq!(queue.add_rate_limited(key("a")), Duration::from_millis(10));
        assert_eq!(queue.add_rate_limited(key("a")), Duration::from_millis(20));
        assert_eq!(queue.add_rate_limited(key("a")), Duration::from_millis(40));
        assert_eq!(queue.add_rate_limited(key("a")), Duration::from_millis(40));
        assert_eq!(queue.failures(&key("a")), 4);

        queue.forget(&key("a"));
        assert_eq!(queue.add_rate_limited(key("a")), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_add_after_delivers() {
        let queue = queue();
        queue.add_after(key("late"), Duration::from_millis(20));
        assert!(queue.is_empty());

        let got = tokio::time::timeout(Duration::from_secs(2), queue.get())
            .await
            .unwrap();
        assert_eq!(got, Some(key("late")));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let queue = queue();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
    }
}
