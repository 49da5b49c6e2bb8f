//! The shared (process-wide) item-state manager.
//!
//! Authoritative in-memory view of persisted items. Reads flow through the
//! two-tier bundle cache into the store; writes arrive as a [`ChangeLog`]
//! under the exclusive [`IsmLocking`] writer and are applied atomically:
//! stale detection, reference-integrity validation and bundle assembly all
//! happen before the single `store_batch` call, and listener fan-out
//! happens after it, still under the write lock.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::bundle::cache::BundleCache;
use crate::bundle::store::{BundleStore, WriteBatch};
use crate::bundle::{NodePropBundle, NodeReferences};
use crate::error::{RepoError, Result};
use crate::model::{ItemId, Name, NodeId};
use crate::state::changelog::ChangeLog;
use crate::state::locking::IsmLocking;
use crate::state::{ItemState, ItemStatus, NodeState, PropertyState};

/// Observer over shared item-state transitions.
///
/// Notifications fire while the ISM write lock is still held; long-running
/// listeners must dispatch asynchronously themselves.
pub trait ItemStateListener: Send + Sync {
    /// An item graduated to EXISTING.
    fn state_created(&self, _state: &ItemState) {}
    /// A persisted item changed.
    fn state_modified(&self, _state: &ItemState) {}
    /// A persisted item was destroyed.
    fn state_destroyed(&self, _state: &ItemState) {}
    /// A cached state was dropped without a persistent change.
    fn state_discarded(&self, _state: &ItemState) {}
    /// A child entry appeared on `parent`.
    fn node_added(&self, _parent: NodeId, _name: &Name, _child: NodeId) {}
    /// A child entry disappeared from `parent`.
    fn node_removed(&self, _parent: NodeId, _name: &Name, _child: NodeId) {}
    /// A node record changed in place.
    fn node_modified(&self, _node: &NodeState) {}
}

/// The shared item-state manager.
pub struct SharedItemStateManager {
    store: Arc<dyn BundleStore>,
    cache: Arc<BundleCache>,
    locking: IsmLocking,
    listeners: Mutex<Vec<Weak<dyn ItemStateListener>>>,
}

impl SharedItemStateManager {
    /// Wires the manager over a store and cache.
    pub fn new(store: Arc<dyn BundleStore>, cache: Arc<BundleCache>) -> Self {
        Self {
            store,
            cache,
            locking: IsmLocking::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// The process-wide ISM lock.
    pub fn locking(&self) -> &IsmLocking {
        &self.locking
    }

    /// The bundle cache (exposed for adaptive sizing).
    pub fn cache(&self) -> &Arc<BundleCache> {
        &self.cache
    }

    /// Registers a listener. Weak registration: a dropped listener is
    /// pruned on the next fan-out and never pins its owner.
    pub fn register_listener(&self, listener: Weak<dyn ItemStateListener>) {
        self.listeners.lock().push(listener);
    }

    /// Loads the persisted state for `id`, absent on miss.
    pub fn item_state(&self, id: &ItemId) -> Result<Option<ItemState>> {
        match id {
            ItemId::Node(node_id) => Ok(self
                .bundle(*node_id)?
                .map(|bundle| ItemState::Node(NodeState::from_bundle(&bundle)))),
            ItemId::Property(prop_id) => {
                let Some(bundle) = self.bundle(prop_id.parent)? else {
                    return Ok(None);
                };
                if prop_id.name.is_synthesized() {
                    let node = NodeState::from_bundle(&bundle);
                    return Ok(node
                        .synthesized_property(&prop_id.name)
                        .map(ItemState::Property));
                }
                Ok(bundle.properties.get(&prop_id.name).map(|entry| {
                    ItemState::Property(PropertyState::from_entry(prop_id.clone(), entry))
                }))
            }
        }
    }

    /// True when a persisted state exists for `id`.
    pub fn has_item_state(&self, id: &ItemId) -> bool {
        match id {
            ItemId::Node(node_id) => self.node_exists(*node_id).unwrap_or(false),
            ItemId::Property(_) => matches!(self.item_state(id), Ok(Some(_))),
        }
    }

    /// The inverse reference index entry for `target` (empty when nothing
    /// references it).
    pub fn node_references(&self, target: NodeId) -> Result<NodeReferences> {
        Ok(self
            .store
            .load_refs(target)?
            .unwrap_or_else(|| NodeReferences::new(target)))
    }

    fn node_exists(&self, id: NodeId) -> Result<bool> {
        if self.cache.is_known_missing(id) {
            return Ok(false);
        }
        if self.cache.retrieve(id).is_some() {
            return Ok(true);
        }
        let exists = self.store.exists(id)?;
        if !exists {
            self.cache.note_missing(id);
        }
        Ok(exists)
    }

    fn bundle(&self, id: NodeId) -> Result<Option<Arc<NodePropBundle>>> {
        if let Some(bundle) = self.cache.retrieve(id) {
            trace!(id = %id, "sism.bundle.hit");
            return Ok(Some(bundle));
        }
        if self.cache.is_known_missing(id) {
            return Ok(None);
        }
        match self.store.load(id)? {
            Some(bundle) => {
                let bundle = Arc::new(bundle);
                self.cache.cache(Arc::clone(&bundle));
                Ok(Some(bundle))
            }
            None => {
                self.cache.note_missing(id);
                Ok(None)
            }
        }
    }

    /// Applies a session change log: the commit path of the save protocol.
    ///
    /// Under the exclusive write lock: detect stale states, validate
    /// reference integrity over the merged result, assemble bundles, write
    /// one atomic batch, update caches, fan out events. Either every state
    /// in the log is persisted or none is.
    pub fn update(&self, log: &ChangeLog, lock_timeout: Option<Duration>) -> Result<()> {
        if log.is_empty() {
            return Ok(());
        }
        let guard = self.locking.acquire_write(lock_timeout)?;

        self.check_stale(log)?;
        let ref_records = self.check_references(log)?;
        let batch = self.assemble(log, ref_records)?;

        let new_bundles: Vec<Arc<NodePropBundle>> = batch
            .bundles
            .iter()
            .cloned()
            .map(Arc::new)
            .collect();
        let deleted: Vec<NodeId> = batch.deleted.clone();

        if let Err(err) = self.store.store_batch(batch) {
            // Mid-commit transport failure: the on-disk batch never became
            // visible, but in-flight cache entries are no longer trusted.
            for id in log.touched_nodes() {
                self.cache.evict(id);
            }
            warn!(error = %err, "sism.update.aborted");
            drop(guard);
            return Err(err);
        }

        // Evict first so re-caching the rebuilt bundles never trips the
        // racing-loader diagnostics.
        for id in log.touched_nodes() {
            self.cache.evict(id);
        }
        for bundle in new_bundles {
            self.cache.cache(bundle);
        }
        for id in &deleted {
            self.cache.evict(*id);
            self.cache.note_missing(*id);
        }
        for state in log.added_states() {
            self.cache.forget_missing(state.hosting_node());
        }

        self.fan_out(log, true);
        debug!(changes = log.len(), "sism.update.applied");
        drop(guard);
        Ok(())
    }

    /// Applies a change log replayed from the cluster journal: no store
    /// writes, only cache invalidation and item-state listener fan-out.
    /// Replaying an already-applied log is a state-level no-op.
    pub fn external_update(&self, log: &ChangeLog) -> Result<()> {
        if log.is_empty() {
            return Ok(());
        }
        let guard = self.locking.acquire_write(None)?;
        for state in log.modified_states().chain(log.deleted_states()) {
            self.cache.evict(state.hosting_node());
            if let Some(parent) = state.overlayed_parent() {
                self.cache.evict(parent);
            }
        }
        for state in log.added_states() {
            self.cache.forget_missing(state.hosting_node());
            if let Some(parent) = state.parent_node() {
                self.cache.evict(parent);
            }
        }
        // Item-state events only: node-specific events are not re-fired on
        // replay, matching what the lock and query observers assume.
        self.fan_out(log, false);
        debug!(changes = log.len(), "sism.external_update.applied");
        drop(guard);
        Ok(())
    }

    fn check_stale(&self, log: &ChangeLog) -> Result<()> {
        for state in log.added_states() {
            if let ItemState::Node(node) = state {
                if self.node_exists(node.id)? {
                    return Err(RepoError::Stale(format!(
                        "node {} already exists",
                        node.id
                    )));
                }
            }
        }
        for state in log.modified_states().chain(log.deleted_states()) {
            match state {
                ItemState::Node(node) => {
                    let Some(bundle) = self.bundle(node.id)? else {
                        return Err(RepoError::Stale(format!(
                            "node {} was destroyed by another transaction",
                            node.id
                        )));
                    };
                    let overlay = node.overlay.as_ref().map(|o| o.mod_count);
                    if overlay != Some(bundle.mod_count) {
                        return Err(RepoError::Stale(format!(
                            "node {} was modified by another transaction",
                            node.id
                        )));
                    }
                }
                ItemState::Property(prop) => {
                    let Some(bundle) = self.bundle(prop.id.parent)? else {
                        return Err(RepoError::Stale(format!(
                            "node {} was destroyed by another transaction",
                            prop.id.parent
                        )));
                    };
                    match bundle.properties.get(&prop.id.name) {
                        Some(entry) => {
                            if prop.overlay_mod_count != Some(entry.mod_count) {
                                return Err(RepoError::Stale(format!(
                                    "property {} was modified by another transaction",
                                    prop.id
                                )));
                            }
                        }
                        None => {
                            return Err(RepoError::Stale(format!(
                                "property {} was destroyed by another transaction",
                                prop.id
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Validates reference integrity over the merged result and returns
    /// the reference-index records to persist alongside the batch.
    fn check_references(&self, log: &ChangeLog) -> Result<(Vec<NodeReferences>, Vec<NodeId>)> {
        let mut deltas: FxHashMap<NodeId, NodeReferences> = FxHashMap::default();

        // Collect reference deltas from property changes.
        for state in log.added_states().chain(log.modified_states()) {
            let ItemState::Property(prop) = state else { continue };
            let old_targets = self.persisted_reference_targets(prop)?;
            let new_targets: Vec<NodeId> = prop
                .values
                .iter()
                .filter_map(|v| v.reference_target())
                .collect();
            for target in &new_targets {
                if !deltas.contains_key(target) {
                    let loaded = self.node_references(*target)?;
                    deltas.insert(*target, loaded);
                }
                deltas
                    .get_mut(target)
                    .expect("entry present")
                    .referrers
                    .insert(prop.id.clone());
            }
            for target in &old_targets {
                if new_targets.contains(target) {
                    continue;
                }
                if !deltas.contains_key(target) {
                    let loaded = self.node_references(*target)?;
                    deltas.insert(*target, loaded);
                }
                deltas
                    .get_mut(target)
                    .expect("entry present")
                    .referrers
                    .remove(&prop.id);
            }
        }
        for state in log.deleted_states() {
            let ItemState::Property(prop) = state else { continue };
            for target in self.persisted_reference_targets(prop)? {
                if !deltas.contains_key(&target) {
                    let loaded = self.node_references(target)?;
                    deltas.insert(target, loaded);
                }
                deltas
                    .get_mut(&target)
                    .expect("entry present")
                    .referrers
                    .remove(&prop.id);
            }
        }

        // New strong references must point at referenceable, existing nodes.
        for state in log.added_states().chain(log.modified_states()) {
            let ItemState::Property(prop) = state else { continue };
            for target in prop.values.iter().filter_map(|v| v.reference_target()) {
                let merged = self.merged_node(log, target)?;
                match merged {
                    Some(node) if node.is_referenceable() => {}
                    Some(_) => {
                        return Err(RepoError::Constraint(format!(
                            "reference target {target} is not referenceable"
                        )))
                    }
                    None => {
                        return Err(RepoError::Constraint(format!(
                            "dangling reference to {target}"
                        )))
                    }
                }
            }
        }

        // A node may only be removed once nothing references it.
        for state in log.deleted_states() {
            let ItemState::Node(node) = state else { continue };
            let remaining = match deltas.get(&node.id) {
                Some(refs) => refs.referrers.len(),
                None => self.node_references(node.id)?.referrers.len(),
            };
            if remaining > 0 {
                return Err(RepoError::Constraint(format!(
                    "node {} is still referenced",
                    node.id
                )));
            }
        }

        let mut stores = Vec::new();
        let mut destroys = Vec::new();
        for (target, refs) in deltas {
            let target_deleted = log
                .deleted_states()
                .any(|s| matches!(s, ItemState::Node(n) if n.id == target));
            if refs.is_empty() || target_deleted {
                destroys.push(target);
            } else {
                stores.push(refs);
            }
        }
        Ok((stores, destroys))
    }

    fn persisted_reference_targets(&self, prop: &PropertyState) -> Result<Vec<NodeId>> {
        let Some(bundle) = self.bundle(prop.id.parent)? else {
            return Ok(Vec::new());
        };
        Ok(bundle
            .properties
            .get(&prop.id.name)
            .map(|entry| {
                entry
                    .values
                    .iter()
                    .filter_map(|v| v.reference_target())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// The node as it will exist after the log applies.
    fn merged_node(&self, log: &ChangeLog, id: NodeId) -> Result<Option<NodeState>> {
        let item = ItemId::Node(id);
        if let Some((op, state)) = log.get(&item) {
            use crate::state::changelog::ChangeOp;
            return Ok(match op {
                ChangeOp::Deleted => None,
                _ => Some(state.as_node()?.clone()),
            });
        }
        Ok(self
            .bundle(id)?
            .map(|bundle| NodeState::from_bundle(&bundle)))
    }

    fn assemble(
        &self,
        log: &ChangeLog,
        ref_records: (Vec<NodeReferences>, Vec<NodeId>),
    ) -> Result<WriteBatch> {
        let mut batch = WriteBatch {
            refs: ref_records.0,
            deleted_refs: ref_records.1,
            ..WriteBatch::default()
        };
        batch.modifications_from(log, self)?;
        Ok(batch)
    }

    fn live_listeners(&self) -> Vec<Arc<dyn ItemStateListener>> {
        let mut listeners = self.listeners.lock();
        listeners.retain(|weak| weak.upgrade().is_some());
        listeners.iter().filter_map(Weak::upgrade).collect()
    }

    // Ordering contract: destroyed (child before parent), then modified,
    // then created (parent before child).
    fn fan_out(&self, log: &ChangeLog, fire_node_events: bool) {
        use crate::state::changelog::ChangeOp;

        let live = self.live_listeners();
        if live.is_empty() {
            return;
        }

        for state in log.topo_order(log.deleted_states().collect(), false) {
            for listener in &live {
                listener.state_destroyed(state);
            }
        }
        for state in log.modified_states() {
            for listener in &live {
                listener.state_modified(state);
                if fire_node_events {
                    if let ItemState::Node(node) = state {
                        listener.node_modified(node);
                        for removed in &node.removed_child_entries {
                            listener.node_removed(node.id, &removed.entry.name, removed.entry.id);
                        }
                    }
                }
            }
        }
        for state in log.topo_order(log.added_states().collect(), true) {
            for listener in &live {
                listener.state_created(state);
            }
        }
        // Child-entry additions fire from the parent's perspective.
        if fire_node_events {
            for state in log.added_states().chain(log.modified_states()) {
                let ItemState::Node(node) = state else { continue };
                for entry in &node.child_entries {
                    let is_new = log
                        .get(&ItemId::Node(entry.id))
                        .map(|(op, _)| matches!(op, ChangeOp::Added))
                        .unwrap_or(false);
                    if is_new {
                        for listener in &live {
                            listener.node_added(node.id, &entry.name, entry.id);
                        }
                    }
                }
            }
        }
    }

    /// Notifies listeners that a transient state was discarded without a
    /// persistent effect.
    pub fn discarded(&self, state: &ItemState) {
        for listener in self.live_listeners() {
            listener.state_discarded(state);
        }
    }
}

impl WriteBatch {
    /// Builds bundle puts/deletes for every node the log touches.
    fn modifications_from(
        &mut self,
        log: &ChangeLog,
        sism: &SharedItemStateManager,
    ) -> Result<()> {
        use crate::state::changelog::ChangeOp;

        for node_id in log.touched_nodes() {
            let node_item = ItemId::Node(node_id);
            let node_entry = log.get(&node_item);

            if let Some((ChangeOp::Deleted, _)) = node_entry {
                self.deleted.push(node_id);
                continue;
            }

            let mut bundle = match node_entry {
                Some((_, state)) => {
                    let node = state.as_node()?;
                    let mut bundle = match sism.bundle(node_id)? {
                        Some(existing) => (*existing).clone(),
                        None => NodePropBundle::new(
                            node.id,
                            node.parent_id,
                            node.primary_type.clone(),
                        ),
                    };
                    bundle.parent_id = node.parent_id;
                    bundle.primary_type = node.primary_type.clone();
                    bundle.mixins = node.mixins.clone();
                    bundle.child_entries = node.child_entries.clone();
                    bundle.shared_set = node.shared_set.clone();
                    bundle.mod_count = match node.status {
                        ItemStatus::New => 0,
                        _ => bundle.mod_count.wrapping_add(1),
                    };
                    bundle
                }
                None => match sism.bundle(node_id)? {
                    Some(existing) => (*existing).clone(),
                    None => {
                        return Err(RepoError::Stale(format!(
                            "node {node_id} vanished during commit"
                        )))
                    }
                },
            };

            // Fold the node's property changes into the bundle.
            for (op, state) in log.iter() {
                let ItemState::Property(prop) = state else { continue };
                if prop.id.parent != node_id {
                    continue;
                }
                match op {
                    ChangeOp::Deleted => {
                        bundle.properties.remove(&prop.id.name);
                    }
                    _ => {
                        let mut entry = prop.to_entry();
                        entry.mod_count = bundle
                            .properties
                            .get(&prop.id.name)
                            .map(|old| old.mod_count.wrapping_add(1))
                            .unwrap_or(0);
                        bundle.properties.insert(prop.id.name.clone(), entry);
                    }
                }
            }

            self.bundles.push(bundle);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::codec::BundleCodec;
    use crate::bundle::store::FsBundleStore;
    use crate::interner::StringIndex;
    use crate::model::PropertyId;
    use crate::value::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn manager(dir: &std::path::Path) -> SharedItemStateManager {
        let codec = Arc::new(BundleCodec::new(
            Arc::new(StringIndex::open(dir.join("namespaces.properties")).expect("ns")),
            Arc::new(StringIndex::open(dir.join("names.properties")).expect("names")),
        ));
        let store = Arc::new(FsBundleStore::open(dir.join("store"), codec).expect("store"));
        let cache = Arc::new(BundleCache::new(1 << 20, 64, 1024));
        SharedItemStateManager::new(store, cache)
    }

    fn added_node(id: NodeId, parent: Option<NodeId>) -> ItemState {
        ItemState::Node(NodeState::new(id, parent, Name::nt_unstructured()))
    }

    #[test]
    fn commit_then_read_through() {
        let dir = tempdir().expect("tempdir");
        let sism = manager(dir.path());
        let id = NodeId::fresh();

        let mut log = ChangeLog::new();
        log.added(added_node(id, None));
        sism.update(&log, None).expect("commit");

        let state = sism
            .item_state(&ItemId::Node(id))
            .expect("load")
            .expect("present");
        assert_eq!(state.status(), ItemStatus::Existing);
        assert!(sism.has_item_state(&ItemId::Node(id)));
    }

    #[test]
    fn synthesized_property_reads_come_from_node_fields() {
        let dir = tempdir().expect("tempdir");
        let sism = manager(dir.path());
        let id = NodeId::fresh();
        let mut log = ChangeLog::new();
        log.added(added_node(id, None));
        sism.update(&log, None).expect("commit");

        let prop = sism
            .item_state(&ItemId::Property(PropertyId::new(id, Name::jcr_uuid())))
            .expect("load")
            .expect("synthesized");
        assert_eq!(
            prop.as_property().expect("property").values,
            vec![Value::String(id.to_hex())]
        );
    }

    #[test]
    fn concurrent_modification_is_stale() {
        let dir = tempdir().expect("tempdir");
        let sism = manager(dir.path());
        let id = NodeId::fresh();
        let prop_id = PropertyId::new(id, Name::plain("p"));

        let mut setup = ChangeLog::new();
        setup.added(added_node(id, None));
        setup.added(ItemState::Property(PropertyState::single(
            prop_id.clone(),
            Value::String("base".into()),
        )));
        sism.update(&setup, None).expect("setup");

        // Both sessions snapshot the same persisted property.
        let persisted = sism
            .item_state(&ItemId::Property(prop_id.clone()))
            .expect("load")
            .expect("present");
        let persisted = persisted.as_property().expect("property").clone();

        // Session A commits first.
        let mut a = persisted.transient_copy(ItemStatus::ExistingModified);
        a.values = vec![Value::String("A".into())];
        let mut log_a = ChangeLog::new();
        log_a.modified(ItemState::Property(a));
        sism.update(&log_a, None).expect("first writer wins");

        // Session B, from the pre-A snapshot, must fail.
        let mut b = persisted.transient_copy(ItemStatus::ExistingModified);
        b.values = vec![Value::String("B".into())];
        let mut log_b = ChangeLog::new();
        log_b.modified(ItemState::Property(b));
        let err = sism.update(&log_b, None).expect_err("stale");
        assert!(matches!(err, RepoError::Stale(_)));

        // The winning value survived.
        let current = sism
            .item_state(&ItemId::Property(prop_id))
            .expect("load")
            .expect("present");
        assert_eq!(
            current.as_property().expect("property").values,
            vec![Value::String("A".into())]
        );
    }

    #[test]
    fn disjoint_property_writes_both_commit() {
        let dir = tempdir().expect("tempdir");
        let sism = manager(dir.path());
        let id = NodeId::fresh();
        let p1 = PropertyId::new(id, Name::plain("p1"));
        let p2 = PropertyId::new(id, Name::plain("p2"));

        let mut setup = ChangeLog::new();
        setup.added(added_node(id, None));
        setup.added(ItemState::Property(PropertyState::single(
            p1.clone(),
            Value::String("init".into()),
        )));
        setup.added(ItemState::Property(PropertyState::single(
            p2.clone(),
            Value::String("init".into()),
        )));
        sism.update(&setup, None).expect("setup");

        let snap1 = sism
            .item_state(&ItemId::Property(p1.clone()))
            .expect("load")
            .expect("present")
            .as_property()
            .expect("property")
            .clone();
        let snap2 = sism
            .item_state(&ItemId::Property(p2.clone()))
            .expect("load")
            .expect("present")
            .as_property()
            .expect("property")
            .clone();

        let mut a = snap1.transient_copy(ItemStatus::ExistingModified);
        a.values = vec![Value::String("foo".into())];
        let mut log_a = ChangeLog::new();
        log_a.modified(ItemState::Property(a));
        sism.update(&log_a, None).expect("A commits");

        let mut b = snap2.transient_copy(ItemStatus::ExistingModified);
        b.values = vec![Value::String("bar".into())];
        let mut log_b = ChangeLog::new();
        log_b.modified(ItemState::Property(b));
        sism.update(&log_b, None).expect("B commits too");

        let read = |pid: &PropertyId| {
            sism.item_state(&ItemId::Property(pid.clone()))
                .expect("load")
                .expect("present")
                .as_property()
                .expect("property")
                .values
                .clone()
        };
        assert_eq!(read(&p1), vec![Value::String("foo".into())]);
        assert_eq!(read(&p2), vec![Value::String("bar".into())]);
    }

    #[test]
    fn dangling_reference_fails_constraint() {
        let dir = tempdir().expect("tempdir");
        let sism = manager(dir.path());
        let id = NodeId::fresh();

        let mut log = ChangeLog::new();
        log.added(added_node(id, None));
        log.added(ItemState::Property(PropertyState::single(
            PropertyId::new(id, Name::plain("ref")),
            Value::Reference(NodeId::fresh()),
        )));
        let err = sism.update(&log, None).expect_err("dangling");
        assert!(matches!(err, RepoError::Constraint(_)));
    }

    #[test]
    fn referenced_node_cannot_be_removed() {
        let dir = tempdir().expect("tempdir");
        let sism = manager(dir.path());
        let target = NodeId::fresh();
        let source = NodeId::fresh();

        let mut setup = ChangeLog::new();
        let mut target_state = NodeState::new(target, None, Name::nt_unstructured());
        target_state.mixins.insert(Name::mix_referenceable());
        setup.added(ItemState::Node(target_state));
        setup.added(added_node(source, None));
        setup.added(ItemState::Property(PropertyState::single(
            PropertyId::new(source, Name::plain("ref")),
            Value::Reference(target),
        )));
        sism.update(&setup, None).expect("setup");

        let persisted = sism
            .item_state(&ItemId::Node(target))
            .expect("load")
            .expect("present");
        let node = persisted.as_node().expect("node");
        let removal = node.transient_copy(ItemStatus::ExistingRemoved);
        let mut log = ChangeLog::new();
        log.deleted(ItemState::Node(removal));
        let err = sism.update(&log, None).expect_err("still referenced");
        assert!(matches!(err, RepoError::Constraint(_)));
    }

    #[test]
    fn external_update_is_cache_only_and_idempotent() {
        let dir = tempdir().expect("tempdir");
        let sism = manager(dir.path());
        let id = NodeId::fresh();
        let mut log = ChangeLog::new();
        log.added(added_node(id, None));
        sism.update(&log, None).expect("commit");

        struct Counting(AtomicUsize);
        impl ItemStateListener for Counting {
            fn state_created(&self, _state: &ItemState) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let listener = Arc::new(Counting(AtomicUsize::new(0)));
        let weak: Weak<dyn ItemStateListener> =
            Arc::downgrade(&(Arc::clone(&listener) as Arc<dyn ItemStateListener>));
        sism.register_listener(weak);

        sism.external_update(&log).expect("replay");
        sism.external_update(&log).expect("replay again");
        assert_eq!(listener.0.load(Ordering::SeqCst), 2);

        // The persisted state is unchanged by replays.
        assert!(sism.has_item_state(&ItemId::Node(id)));
    }
}
