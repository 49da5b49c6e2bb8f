//! The transient (per-session) item-state manager.
//!
//! Holds the session's uncommitted overlay over the shared manager: NEW
//! and EXISTING_MODIFIED states in the transient map, and the attic with
//! the EXISTING_REMOVED originals of removed items. Reads go transient →
//! attic (when the zombie view is requested) → shared, and never mutate
//! the shared manager. The manager is confined to one session and is not
//! itself thread-safe.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::{RepoError, Result};
use crate::model::{ItemId, NodeId, PropertyId};
use crate::state::changelog::ChangeLog;
use crate::state::shared::SharedItemStateManager;
use crate::state::{ItemState, ItemStatus, NodeState, PropertyState};

/// Per-session staging view over the shared item-state manager.
pub struct TransientItemStateManager {
    shared: Arc<SharedItemStateManager>,
    transient: FxHashMap<ItemId, ItemState>,
    attic: FxHashMap<ItemId, ItemState>,
    order: Vec<ItemId>,
}

impl TransientItemStateManager {
    /// A fresh overlay with no pending changes.
    pub fn new(shared: Arc<SharedItemStateManager>) -> Self {
        Self {
            shared,
            transient: FxHashMap::default(),
            attic: FxHashMap::default(),
            order: Vec::new(),
        }
    }

    /// The shared manager this overlay reads through.
    pub fn shared(&self) -> &Arc<SharedItemStateManager> {
        &self.shared
    }

    /// True when the session has uncommitted changes.
    pub fn has_pending_changes(&self) -> bool {
        !self.transient.is_empty() || !self.attic.is_empty()
    }

    /// Read-through lookup. With `zombie` the attic is consulted, so
    /// removed items remain addressable.
    pub fn get(&self, id: &ItemId, zombie: bool) -> Result<Option<ItemState>> {
        if let Some(state) = self.transient.get(id) {
            return Ok(Some(state.clone()));
        }
        if zombie {
            if let Some(state) = self.attic.get(id) {
                return Ok(Some(state.clone()));
            }
        } else if self.attic.contains_key(id) {
            // Removed in this session: invisible to the normal view.
            return Ok(None);
        }
        self.shared.item_state(id)
    }

    /// True when `id` resolves in the requested view.
    pub fn has(&self, id: &ItemId, zombie: bool) -> bool {
        matches!(self.get(id, zombie), Ok(Some(_)))
    }

    /// The attic state for `id`, if the session removed it.
    pub fn attic_state(&self, id: &ItemId) -> Option<&ItemState> {
        self.attic.get(id)
    }

    /// Iterates the pending NEW and MODIFIED states.
    pub fn transient_states(&self) -> impl Iterator<Item = &ItemState> {
        self.transient.values()
    }

    /// Iterates the attic (removed) states.
    pub fn attic_states(&self) -> impl Iterator<Item = &ItemState> {
        self.attic.values()
    }

    /// Registers a brand-new node.
    pub fn create_node(&mut self, state: NodeState) -> Result<()> {
        let id = ItemId::Node(state.id);
        if self.has(&id, false) {
            return Err(RepoError::InvalidArgument(format!(
                "node {} already exists",
                state.id
            )));
        }
        self.touch(&id);
        self.transient.insert(id, ItemState::Node(state));
        Ok(())
    }

    /// Registers a brand-new property.
    pub fn create_property(&mut self, state: PropertyState) -> Result<()> {
        let id = ItemId::Property(state.id.clone());
        self.touch(&id);
        self.transient.insert(id, ItemState::Property(state));
        Ok(())
    }

    /// Applies `f` to a transient copy of the node, creating the copy from
    /// the shared state on first touch.
    pub fn with_node_mut<T>(
        &mut self,
        id: NodeId,
        f: impl FnOnce(&mut NodeState) -> Result<T>,
    ) -> Result<T> {
        let item = ItemId::Node(id);
        self.ensure_transient(&item)?;
        match self.transient.get_mut(&item) {
            Some(ItemState::Node(node)) => f(node),
            _ => Err(RepoError::NotFound("node")),
        }
    }

    /// Applies `f` to a transient copy of the property, creating the copy
    /// from the shared state on first touch.
    pub fn with_property_mut<T>(
        &mut self,
        id: &PropertyId,
        f: impl FnOnce(&mut PropertyState) -> Result<T>,
    ) -> Result<T> {
        let item = ItemId::Property(id.clone());
        self.ensure_transient(&item)?;
        match self.transient.get_mut(&item) {
            Some(ItemState::Property(prop)) => f(prop),
            _ => Err(RepoError::NotFound("property")),
        }
    }

    fn ensure_transient(&mut self, id: &ItemId) -> Result<()> {
        if self.transient.contains_key(id) {
            return Ok(());
        }
        if self.attic.contains_key(id) {
            return Err(RepoError::InvalidArgument(format!(
                "item {id} was removed in this session"
            )));
        }
        let persisted = self
            .shared
            .item_state(id)?
            .ok_or(RepoError::NotFound("item"))?;
        let copy = match persisted {
            ItemState::Node(node) => {
                ItemState::Node(node.transient_copy(ItemStatus::ExistingModified))
            }
            ItemState::Property(prop) => {
                ItemState::Property(prop.transient_copy(ItemStatus::ExistingModified))
            }
        };
        self.touch(id);
        self.transient.insert(id.clone(), copy);
        Ok(())
    }

    /// Removes an item in this session. A NEW item simply evaporates; a
    /// persisted item moves to the attic as EXISTING_REMOVED.
    pub fn destroy(&mut self, id: &ItemId) -> Result<()> {
        if let Some(state) = self.transient.remove(id) {
            if state.status() == ItemStatus::New {
                self.order.retain(|o| o != id);
                return Ok(());
            }
            // Already carries its overlay; park it in the attic.
            let mut state = state;
            state.set_status(ItemStatus::ExistingRemoved);
            self.attic.insert(id.clone(), state);
            return Ok(());
        }
        let persisted = self
            .shared
            .item_state(id)?
            .ok_or(RepoError::NotFound("item"))?;
        let removed = match persisted {
            ItemState::Node(node) => {
                ItemState::Node(node.transient_copy(ItemStatus::ExistingRemoved))
            }
            ItemState::Property(prop) => {
                ItemState::Property(prop.transient_copy(ItemStatus::ExistingRemoved))
            }
        };
        self.touch(id);
        self.attic.insert(id.clone(), removed);
        Ok(())
    }

    /// Builds the change log for the pending overlay, in first-touch order.
    pub fn change_log(&self) -> ChangeLog {
        let mut log = ChangeLog::new();
        for id in &self.order {
            if let Some(state) = self.transient.get(id) {
                match state.status() {
                    ItemStatus::New => log.added(state.clone()),
                    _ => log.modified(state.clone()),
                }
            } else if let Some(state) = self.attic.get(id) {
                log.deleted(state.clone());
            }
        }
        log
    }

    /// Drops every pending change after a successful save.
    pub fn dispose(&mut self) {
        self.transient.clear();
        self.attic.clear();
        self.order.clear();
    }

    /// Discards the overlay, notifying discard listeners.
    pub fn refresh(&mut self) {
        for state in self.transient.values().chain(self.attic.values()) {
            self.shared.discarded(state);
        }
        self.dispose();
    }

    fn touch(&mut self, id: &ItemId) {
        if !self.order.contains(id) {
            self.order.push(id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::cache::BundleCache;
    use crate::bundle::codec::BundleCodec;
    use crate::bundle::store::FsBundleStore;
    use crate::interner::StringIndex;
    use crate::model::Name;
    use crate::value::Value;
    use tempfile::tempdir;

    fn shared(dir: &std::path::Path) -> Arc<SharedItemStateManager> {
        let codec = Arc::new(BundleCodec::new(
            Arc::new(StringIndex::open(dir.join("namespaces.properties")).expect("ns")),
            Arc::new(StringIndex::open(dir.join("names.properties")).expect("names")),
        ));
        let store = Arc::new(FsBundleStore::open(dir.join("store"), codec).expect("store"));
        Arc::new(SharedItemStateManager::new(
            store,
            Arc::new(BundleCache::new(1 << 20, 64, 1024)),
        ))
    }

    fn seed_node(sism: &SharedItemStateManager) -> NodeId {
        let id = NodeId::fresh();
        let mut log = ChangeLog::new();
        log.added(ItemState::Node(NodeState::new(
            id,
            None,
            Name::nt_unstructured(),
        )));
        sism.update(&log, None).expect("seed");
        id
    }

    #[test]
    fn read_through_prefers_transient() {
        let dir = tempdir().expect("tempdir");
        let sism = shared(dir.path());
        let id = seed_node(&sism);
        let mut tism = TransientItemStateManager::new(Arc::clone(&sism));

        tism.with_node_mut(id, |node| {
            node.mixins.insert(Name::mix_referenceable());
            Ok(())
        })
        .expect("modify");

        let seen = tism
            .get(&ItemId::Node(id), false)
            .expect("get")
            .expect("present");
        assert_eq!(seen.status(), ItemStatus::ExistingModified);

        // The shared view is untouched by transient writes.
        let persisted = sism
            .item_state(&ItemId::Node(id))
            .expect("load")
            .expect("present");
        assert!(persisted.as_node().expect("node").mixins.is_empty());
    }

    #[test]
    fn removed_items_hide_from_normal_view_but_not_zombie() {
        let dir = tempdir().expect("tempdir");
        let sism = shared(dir.path());
        let id = seed_node(&sism);
        let mut tism = TransientItemStateManager::new(Arc::clone(&sism));

        tism.destroy(&ItemId::Node(id)).expect("destroy");
        assert!(!tism.has(&ItemId::Node(id), false));
        let zombie = tism
            .get(&ItemId::Node(id), true)
            .expect("get")
            .expect("zombie view");
        assert_eq!(zombie.status(), ItemStatus::ExistingRemoved);
    }

    #[test]
    fn destroying_a_new_item_cancels_it() {
        let dir = tempdir().expect("tempdir");
        let sism = shared(dir.path());
        let mut tism = TransientItemStateManager::new(sism);

        let id = NodeId::fresh();
        tism.create_node(NodeState::new(id, None, Name::nt_unstructured()))
            .expect("create");
        tism.destroy(&ItemId::Node(id)).expect("destroy");
        assert!(tism.change_log().is_empty());
        assert!(!tism.has_pending_changes());
    }

    #[test]
    fn change_log_reflects_overlay() {
        let dir = tempdir().expect("tempdir");
        let sism = shared(dir.path());
        let existing = seed_node(&sism);
        let mut tism = TransientItemStateManager::new(Arc::clone(&sism));

        let fresh = NodeId::fresh();
        tism.create_node(NodeState::new(
            fresh,
            Some(existing),
            Name::nt_unstructured(),
        ))
        .expect("create");
        tism.with_node_mut(existing, |node| {
            node.add_child(Name::plain("kid"), fresh);
            Ok(())
        })
        .expect("link");
        tism.create_property(PropertyState::single(
            PropertyId::new(fresh, Name::plain("title")),
            Value::String("hi".into()),
        ))
        .expect("property");

        let log = tism.change_log();
        assert_eq!(log.added_states().count(), 2);
        assert_eq!(log.modified_states().count(), 1);

        sism.update(&log, None).expect("save");
        tism.dispose();
        assert!(!tism.has_pending_changes());
        assert!(sism.has_item_state(&ItemId::Node(fresh)));
    }
}
