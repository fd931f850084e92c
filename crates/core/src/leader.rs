//! Leadership gate: which replica reconciles which identity.
//!
//! Identities are spread over a fixed number of buckets; a replica reconciles an
//! identity only while it owns the identity's bucket. Ownership itself is decided
//! elsewhere (a static ordinal assignment or an external elector) and pushed in
//! through [`BucketGate::promote`] / [`BucketGate::demote`].

use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::ResourceIdentity;

/// Answers whether this replica currently owns reconciliation of an identity.
pub trait LeaderGate: Send + Sync {
    fn is_leader_for(&self, id: &ResourceIdentity) -> bool;
}

/// Gate for single-replica deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysLeader;

impl LeaderGate for AlwaysLeader {
    fn is_leader_for(&self, _id: &ResourceIdentity) -> bool { true }
}

/// Maps identities onto buckets using a 64-bit FNV-1a hash of `"namespace/name"`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketPlanner { buckets: u16 }

impl BucketPlanner {
    pub fn new(buckets: usize) -> Self {
        Self { buckets: buckets.max(1).min(u16::MAX as usize) as u16 }
    }

    pub fn buckets(&self) -> u16 { self.buckets }

    pub fn bucket_for(&self, id: &ResourceIdentity) -> u16 {
        if self.buckets <= 1 { return 0; }
        let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
        let bytes = id.namespace.as_bytes().iter().chain(b"/").chain(id.name.as_bytes());
        for b in bytes { h ^= *b as u64; h = h.wrapping_mul(0x100000001b3); }
        (h % self.buckets as u64) as u16
    }
}

/// Gate backed by a set of owned buckets. Reads are lock-free; ownership changes
/// swap in a new set.
#[derive(Debug)]
pub struct BucketGate {
    planner: BucketPlanner,
    owned: ArcSwap<BTreeSet<u16>>,
}

impl BucketGate {
    /// A gate that owns nothing until promoted.
    pub fn new(buckets: usize) -> Self {
        Self { planner: BucketPlanner::new(buckets), owned: ArcSwap::from_pointee(BTreeSet::new()) }
    }

    /// Static partitioning: replica `ordinal` of `replicas` owns every bucket `b`
    /// with `b % replicas == ordinal`.
    pub fn for_ordinal(ordinal: usize, replicas: usize, buckets: usize) -> Self {
        let gate = Self::new(buckets);
        let replicas = replicas.max(1);
        let owned: BTreeSet<u16> = (0..gate.planner.buckets()).filter(|b| *b as usize % replicas == ordinal).collect();
        gate.owned.store(Arc::new(owned));
        gate
    }

    pub fn planner(&self) -> BucketPlanner { self.planner }

    pub fn owned(&self) -> Arc<BTreeSet<u16>> { self.owned.load_full() }

    pub fn promote(&self, bucket: u16) {
        if bucket >= self.planner.buckets() { return; }
        self.owned.rcu(|cur| {
            let mut next = BTreeSet::clone(cur);
            next.insert(bucket);
            next
        });
    }

    pub fn demote(&self, bucket: u16) {
        self.owned.rcu(|cur| {
            let mut next = BTreeSet::clone(cur);
            next.remove(&bucket);
            next
        });
    }
}

impl LeaderGate for BucketGate {
    fn is_leader_for(&self, id: &ResourceIdentity) -> bool {
        self.owned.load().contains(&self.planner.bucket_for(id))
    }
}
