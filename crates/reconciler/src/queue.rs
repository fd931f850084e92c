//! Work queue with key deduplication, per-key serialization and per-key backoff.
//!
//! A key handed out by [`WorkQueue::get`] stays "processing" until [`WorkQueue::done`].
//! Adding it again meanwhile only marks it dirty; it is queued once the current
//! holder is done, so two workers never hold the same key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::counter;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exponential per-key backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self { Self { base: Duration::from_millis(5), max: Duration::from_secs(1000) } }
}

impl BackoffConfig {
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    backoff: BackoffConfig,
    /// Cancelled on shutdown; wakes pending delayed adds.
    stop: CancellationToken,
}

#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl WorkQueue {
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                backoff,
                stop: CancellationToken::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Every mutation is a single step, so a poisoned state is still consistent.
        self.shared.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, key: &str) {
        let mut st = self.lock();
        if st.shutting_down || st.dirty.contains(key) { return; }
        st.dirty.insert(key.to_string());
        counter!("queue_adds_total", 1u64);
        if st.processing.contains(key) { return; }
        st.queue.push_back(key.to_string());
        drop(st);
        self.shared.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed. Pending delays end early, dropping the key,
    /// when the queue shuts down.
    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() { return self.add(key); }
        if self.shared.stop.is_cancelled() { return; }
        let q = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = q.shared.stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => q.add(&key),
            }
        });
    }

    /// Add `key` after its current backoff delay and bump its failure count.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = {
            let mut st = self.lock();
            if st.shutting_down { return; }
            let n = st.failures.entry(key.to_string()).or_insert(0);
            let delay = self.shared.backoff.delay(*n);
            *n = n.saturating_add(1);
            delay
        };
        counter!("queue_retries_total", 1u64);
        debug!(key = %key, delay_ms = %delay.as_millis(), "requeue with backoff");
        self.add_after(key, delay);
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &str) { self.lock().failures.remove(key); }

    pub fn failures(&self, key: &str) -> u32 { self.lock().failures.get(key).copied().unwrap_or(0) }

    pub fn len(&self) -> usize { self.lock().queue.len() }
    pub fn is_empty(&self) -> bool { self.lock().queue.is_empty() }
    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Wait for the next key; `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.shutting_down { return None; }
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    let more = !st.queue.is_empty();
                    drop(st);
                    if more { self.shared.notify.notify_one(); }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release `key`; if it was added again while processing it is queued now.
    pub fn done(&self, key: &str) {
        let mut st = self.lock();
        st.processing.remove(key);
        if st.dirty.contains(key) && !st.shutting_down {
            st.queue.push_back(key.to_string());
            drop(st);
            self.shared.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.shared.stop.cancel();
        self.shared.notify.notify_waiters();
    }
}
