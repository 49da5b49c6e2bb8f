//! Two-tier bundle cache.
//!
//! The primary tier is a weak-reference map sharded into roughly one
//! segment per core, so the collector can reclaim bundles nobody pins while
//! concurrent lookups of one id still coalesce onto the same `Arc`. The
//! secondary tier holds strong references under a single guard, bounded in
//! bytes by each bundle's `memory_footprint()`, evicting FIFO with a
//! one-bit second chance. A fixed-capacity negative cache remembers ids
//! recently confirmed missing so `exists` probes skip the store.

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use tracing::{trace, warn};

use crate::bundle::NodePropBundle;
use crate::model::NodeId;

/// Invoked every `access_listener_interval` retrievals with the running
/// access count, so an adaptive cache manager can rebalance budgets without
/// being called in the hot loop.
pub type AccessListener = Box<dyn Fn(u64) + Send + Sync>;

struct SecondaryEntry {
    bundle: Arc<NodePropBundle>,
    footprint: usize,
    touched: bool,
}

struct Secondary {
    map: FxHashMap<NodeId, SecondaryEntry>,
    order: VecDeque<NodeId>,
    bytes: usize,
    max_bytes: usize,
}

impl Secondary {
    fn insert(&mut self, id: NodeId, bundle: Arc<NodePropBundle>) {
        let footprint = bundle.memory_footprint();
        if let Some(old) = self.map.insert(
            id,
            SecondaryEntry {
                bundle,
                footprint,
                touched: false,
            },
        ) {
            // The id keeps its place in the order queue.
            self.bytes -= old.footprint;
        } else {
            self.order.push_back(id);
        }
        self.bytes += footprint;
        self.shrink();
    }

    fn remove(&mut self, id: &NodeId) {
        if let Some(entry) = self.map.remove(id) {
            self.bytes -= entry.footprint;
            // The stale order entry is skipped when it surfaces.
        }
    }

    fn shrink(&mut self) {
        let mut second_chances = self.order.len();
        while self.bytes > self.max_bytes {
            let Some(id) = self.order.pop_front() else { break };
            let Some(entry) = self.map.get_mut(&id) else {
                continue;
            };
            if entry.touched && second_chances > 0 {
                entry.touched = false;
                second_chances -= 1;
                self.order.push_back(id);
                continue;
            }
            let entry = self.map.remove(&id).expect("entry just observed");
            self.bytes -= entry.footprint;
            trace!(id = %id, bytes = entry.footprint, "cache.bundle.evict");
        }
    }
}

/// Weak-primary / bounded-secondary bundle cache with a negative tier.
pub struct BundleCache {
    segments: Vec<Mutex<FxHashMap<NodeId, Weak<NodePropBundle>>>>,
    secondary: Mutex<Secondary>,
    negative: Mutex<LruCache<NodeId, ()>>,
    accesses: AtomicU64,
    listener_interval: u64,
    listeners: Mutex<Vec<AccessListener>>,
}

impl BundleCache {
    /// Builds a cache with a secondary byte budget and negative capacity.
    pub fn new(max_bytes: usize, negative_capacity: usize, listener_interval: u64) -> Self {
        let segment_count = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(4)
            .max(1);
        let segments = (0..segment_count)
            .map(|_| Mutex::new(FxHashMap::default()))
            .collect();
        Self {
            segments,
            secondary: Mutex::new(Secondary {
                map: FxHashMap::default(),
                order: VecDeque::new(),
                bytes: 0,
                max_bytes,
            }),
            negative: Mutex::new(LruCache::new(
                NonZeroUsize::new(negative_capacity.max(1)).expect("capacity >= 1"),
            )),
            accesses: AtomicU64::new(0),
            listener_interval: listener_interval.max(1),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn segment(&self, id: &NodeId) -> &Mutex<FxHashMap<NodeId, Weak<NodePropBundle>>> {
        let mut hasher = FxHasher::default();
        id.hash(&mut hasher);
        let index = ((hasher.finish() >> 1) % self.segments.len() as u64) as usize;
        &self.segments[index]
    }

    /// Looks up a bundle, refreshing secondary access stats on a hit.
    pub fn retrieve(&self, id: NodeId) -> Option<Arc<NodePropBundle>> {
        self.count_access();
        {
            let mut secondary = self.secondary.lock();
            if let Some(entry) = secondary.map.get_mut(&id) {
                entry.touched = true;
                return Some(Arc::clone(&entry.bundle));
            }
        }
        let segment = self.segment(&id).lock();
        segment.get(&id).and_then(Weak::upgrade)
    }

    /// Inserts a bundle into both tiers. Replacing a live same-id entry
    /// with a different instance usually indicates racing loaders and is
    /// logged.
    pub fn cache(&self, bundle: Arc<NodePropBundle>) {
        let id = bundle.id;
        {
            let mut segment = self.segment(&id).lock();
            if let Some(existing) = segment.get(&id).and_then(Weak::upgrade) {
                if !Arc::ptr_eq(&existing, &bundle) {
                    warn!(id = %id, "cache.bundle.instance_replaced");
                }
            }
            segment.insert(id, Arc::downgrade(&bundle));
        }
        self.secondary.lock().insert(id, bundle);
        self.negative.lock().pop(&id);
    }

    /// Drops `id` from both tiers.
    pub fn evict(&self, id: NodeId) {
        self.segment(&id).lock().remove(&id);
        self.secondary.lock().remove(&id);
    }

    /// Empties both tiers and the negative cache.
    pub fn evict_all(&self) {
        for segment in &self.segments {
            segment.lock().clear();
        }
        let mut secondary = self.secondary.lock();
        secondary.map.clear();
        secondary.order.clear();
        secondary.bytes = 0;
        drop(secondary);
        self.negative.lock().clear();
    }

    /// Records that `id` was confirmed missing in the store.
    pub fn note_missing(&self, id: NodeId) {
        self.negative.lock().put(id, ());
    }

    /// True when `id` was recently confirmed missing.
    pub fn is_known_missing(&self, id: NodeId) -> bool {
        self.negative.lock().get(&id).is_some()
    }

    /// Forgets a negative entry (the id is about to exist).
    pub fn forget_missing(&self, id: NodeId) {
        self.negative.lock().pop(&id);
    }

    /// Cache reaction to an externally replayed update: evict the touched
    /// bundles, forget negative entries for newly added ids.
    pub fn external_invalidate(&self, touched: &[NodeId], added: &[NodeId]) {
        for &id in touched {
            self.evict(id);
        }
        for &id in added {
            self.forget_missing(id);
        }
    }

    /// Adjusts the secondary byte budget at runtime; a smaller budget
    /// shrinks immediately, scanning entries in insertion order.
    pub fn set_max_bytes(&self, max_bytes: usize) {
        let mut secondary = self.secondary.lock();
        secondary.max_bytes = max_bytes;
        secondary.shrink();
    }

    /// Current secondary occupancy in bytes.
    pub fn secondary_bytes(&self) -> usize {
        self.secondary.lock().bytes
    }

    /// Registers an access listener.
    pub fn add_access_listener(&self, listener: AccessListener) {
        self.listeners.lock().push(listener);
    }

    fn count_access(&self) {
        let count = self.accesses.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.listener_interval == 0 {
            for listener in self.listeners.lock().iter() {
                listener(count);
            }
        }
    }
}
