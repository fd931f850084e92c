//! Rekord store: coalescing ingest loop and the snapshot cache the reconcilers read from.
//!
//! Watch deltas are coalesced per `namespace/name` key, applied in batches to a
//! copy-on-write map and published through `ArcSwap`, so lookups never wait on the
//! ingest loop. Every key touched by a batch is sent to the notification channel
//! after the batch becomes visible.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use kube::{Resource, ResourceExt};
use metrics::counter;
use rekord_core::ResourceIdentity;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// A change observed by the watcher.
#[derive(Debug, Clone)]
pub enum Delta<K> {
    Applied(Arc<K>),
    Deleted(Arc<K>),
    /// Full relist; replaces everything known so far.
    Restarted(Vec<Arc<K>>),
}

/// Cache key of an object: `namespace/name`, or just `name` when cluster-scoped.
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("'{0}' not found")]
    NotFound(ResourceIdentity),
    #[error("cache has not completed its initial list")]
    NotSynced,
    #[error("cache ingest loop has stopped")]
    Closed,
    #[error("cache unavailable")]
    Unavailable(#[source] anyhow::Error),
}

impl LookupError {
    pub fn is_not_found(&self) -> bool { matches!(self, LookupError::NotFound(_)) }
}

/// Read access to cached objects of one kind.
#[async_trait::async_trait]
pub trait Lister<K>: Send + Sync {
    async fn get(&self, id: &ResourceIdentity) -> Result<Arc<K>, LookupError>;
}

/// Coalescing queue keyed by object key with FIFO order and fixed capacity.
pub struct Coalescer<K> {
    map: FxHashMap<String, Delta<K>>,
    order: VecDeque<String>,
    reset: Option<Vec<Arc<K>>>,
    cap: usize,
    dropped: u64,
}

/// What one drain hands to the builder: an optional relist followed by per-key deltas.
pub struct Batch<K> {
    pub reset: Option<Vec<Arc<K>>>,
    pub deltas: Vec<Delta<K>>,
}

impl<K> Batch<K> {
    pub fn is_empty(&self) -> bool { self.reset.is_none() && self.deltas.is_empty() }
}

impl<K: Resource> Coalescer<K> {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), reset: None, cap: cap.max(1), dropped: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() && self.reset.is_none() }
    pub fn dropped(&self) -> u64 { self.dropped }

    pub fn push(&mut self, d: Delta<K>) {
        let key = match &d {
            Delta::Applied(o) | Delta::Deleted(o) => object_key(o.as_ref()),
            Delta::Restarted(list) => {
                // A relist supersedes anything still pending.
                self.map.clear();
                self.order.clear();
                self.reset = Some(list.clone());
                return;
            }
        };
        if !self.map.contains_key(&key) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                    self.dropped += 1;
                    counter!("cache_dropped_total", 1u64);
                }
            }
            self.order.push_back(key.clone());
        }
        self.map.insert(key, d);
    }

    /// Drain everything currently pending.
    pub fn drain_ready(&mut self) -> Batch<K> {
        let mut deltas = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&key) {
                deltas.push(d);
            }
        }
        Batch { reset: self.reset.take(), deltas }
    }
}

/// Published view of the cache.
#[derive(Debug)]
pub struct CacheState<K> {
    pub epoch: u64,
    pub synced: bool,
    pub closed: bool,
    items: FxHashMap<String, Arc<K>>,
}

impl<K> Default for CacheState<K> {
    fn default() -> Self { Self { epoch: 0, synced: false, closed: false, items: FxHashMap::default() } }
}

impl<K> CacheState<K> {
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn get(&self, key: &str) -> Option<&Arc<K>> { self.items.get(key) }
    pub fn keys(&self) -> impl Iterator<Item = &String> { self.items.keys() }
}

/// Builds [`CacheState`] instances from batches.
pub struct CacheBuilder<K> {
    epoch: u64,
    synced: bool,
    items: FxHashMap<String, Arc<K>>,
}

impl<K: Resource> Default for CacheBuilder<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Resource> CacheBuilder<K> {
    pub fn new() -> Self { Self { epoch: 0, synced: false, items: FxHashMap::default() } }

    /// Apply a batch and return the keys it touched, in application order.
    pub fn apply(&mut self, batch: Batch<K>) -> Vec<String> {
        let mut touched = Vec::new();
        if let Some(list) = batch.reset {
            let mut next = FxHashMap::default();
            for o in list {
                next.insert(object_key(o.as_ref()), o);
            }
            // Keys that vanished during the relist must still be reconciled.
            touched.extend(self.items.keys().filter(|k| !next.contains_key(*k)).cloned());
            touched.extend(next.keys().cloned());
            self.items = next;
            self.synced = true;
        }
        for d in batch.deltas {
            match d {
                Delta::Applied(o) => {
                    let key = object_key(o.as_ref());
                    self.items.insert(key.clone(), o);
                    touched.push(key);
                }
                Delta::Deleted(o) => {
                    let key = object_key(o.as_ref());
                    self.items.remove(&key);
                    touched.push(key);
                }
                Delta::Restarted(_) => {}
            }
        }
        self.epoch = self.epoch.saturating_add(1);
        touched
    }

    pub fn freeze(&self) -> Arc<CacheState<K>> {
        Arc::new(CacheState { epoch: self.epoch, synced: self.synced, closed: false, items: self.items.clone() })
    }
}

/// Reader handle over the published state.
pub struct SnapshotCache<K> {
    state: Arc<ArcSwap<CacheState<K>>>,
    epoch_rx: watch::Receiver<u64>,
}

impl<K> Clone for SnapshotCache<K> {
    fn clone(&self) -> Self { Self { state: Arc::clone(&self.state), epoch_rx: self.epoch_rx.clone() } }
}

impl<K> SnapshotCache<K> {
    pub fn current(&self) -> Arc<CacheState<K>> { self.state.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// Wait until the initial list has been applied; false if the loop stopped first.
    pub async fn wait_synced(&self) -> bool {
        let mut rx = self.epoch_rx.clone();
        loop {
            let (synced, closed) = { let cur = self.state.load(); (cur.synced, cur.closed) };
            if synced { return true; }
            if closed { return false; }
            if rx.changed().await.is_err() { return self.state.load().synced; }
        }
    }

    fn lookup(&self, id: &ResourceIdentity) -> Result<Arc<K>, LookupError> {
        let cur = self.state.load();
        if cur.closed { return Err(LookupError::Closed); }
        if !cur.synced { return Err(LookupError::NotSynced); }
        cur.items.get(&id.key()).cloned().ok_or_else(|| LookupError::NotFound(id.clone()))
    }
}

#[async_trait::async_trait]
impl<K: Send + Sync + 'static> Lister<K> for SnapshotCache<K> {
    async fn get(&self, id: &ResourceIdentity) -> Result<Arc<K>, LookupError> { self.lookup(id) }
}

fn publish<K: Resource>(
    builder: &mut CacheBuilder<K>,
    batch: Batch<K>,
    state: &ArcSwap<CacheState<K>>,
    epoch_tx: &watch::Sender<u64>,
    notify: &mpsc::UnboundedSender<String>,
) {
    let touched = builder.apply(batch);
    let next = builder.freeze();
    let epoch = next.epoch;
    state.store(next);
    counter!("cache_swaps_total", 1u64);
    let _ = epoch_tx.send(epoch);
    for key in touched {
        if notify.send(key).is_err() {
            warn!("notification channel closed; dropping change keys");
            break;
        }
    }
}

/// Spawn an ingest loop consuming deltas and swapping snapshots. Returns a sender for
/// deltas and a cache handle for reads; touched keys go to `notify`.
pub fn spawn_ingest<K>(cap: usize, notify: mpsc::UnboundedSender<String>) -> (mpsc::Sender<Delta<K>>, SnapshotCache<K>)
where
    K: Resource + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Delta<K>>(cap.max(1));
    let state = Arc::new(ArcSwap::from_pointee(CacheState::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let state_clone = Arc::clone(&state);

    tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut builder = CacheBuilder::new();
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(8));
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(d) => coalescer.push(d),
                        None => {
                            debug!("delta channel closed; draining and exiting ingest loop");
                            let batch = coalescer.drain_ready();
                            if !batch.is_empty() {
                                publish(&mut builder, batch, &state_clone, &epoch_tx, &notify);
                            }
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let batch = coalescer.drain_ready();
                    if !batch.is_empty() {
                        publish(&mut builder, batch, &state_clone, &epoch_tx, &notify);
                    }
                }
            }
        }
        let mut last = builder.freeze();
        if let Some(s) = Arc::get_mut(&mut last) { s.closed = true; }
        let epoch = last.epoch;
        state_clone.store(last);
        let _ = epoch_tx.send(epoch);
        info!(dropped = coalescer.dropped(), "ingest loop stopped");
    });

    (tx, SnapshotCache { state, epoch_rx })
}
