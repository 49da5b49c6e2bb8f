//! Item states: the in-memory representation of nodes and properties.
//!
//! # Key Types
//!
//! - [`NodeState`] / [`PropertyState`] - per-item mutable state
//! - [`ItemState`] - tagged union used by the managers
//! - [`ItemStatus`] - lifecycle status, including the stale markers set
//!   when a concurrent transaction wins
//!
//! Transient states (held by a session overlay) carry an [`Overlay`]
//! snapshot of the persisted record they shadow: the original parent (so
//! the zombie hierarchy can still resolve the former path of a moved or
//! removed item) and the persisted modification counter (so commit can
//! detect staleness).

use std::collections::BTreeSet;

use crate::bundle::{sns_index, ChildEntry, NodePropBundle, PropertyEntry};
use crate::error::{RepoError, Result};
use crate::model::{ItemId, Name, NodeId, PropertyId};
use crate::value::{PropertyKind, Value};

pub mod changelog;
pub mod locking;
pub mod shared;
pub mod transient;

/// Lifecycle status of an item state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    /// Created in a session, not yet persisted.
    New,
    /// Mirrors the persisted record.
    Existing,
    /// Persisted record with uncommitted session changes.
    ExistingModified,
    /// Persisted record removed in the session, pending commit.
    ExistingRemoved,
    /// Another transaction modified the underlying record.
    StaleModified,
    /// Another transaction destroyed the underlying record.
    StaleDestroyed,
}

impl ItemStatus {
    /// True for the two stale markers.
    pub fn is_stale(self) -> bool {
        matches!(self, ItemStatus::StaleModified | ItemStatus::StaleDestroyed)
    }
}

/// A child entry removed in this session, remembering the same-name-sibling
/// index it had at removal time so the zombie view can still address it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedChildEntry {
    /// The removed entry.
    pub entry: ChildEntry,
    /// Its 1-based index at removal time.
    pub index: u32,
}

/// Snapshot of the persisted record a transient state shadows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlay {
    /// Parent at the time the transient copy was taken.
    pub parent_id: Option<NodeId>,
    /// Persisted modification counter at copy time.
    pub mod_count: u16,
}

/// In-memory state of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    /// Node id.
    pub id: NodeId,
    /// Current parent. `None` only for the root.
    pub parent_id: Option<NodeId>,
    /// Primary node type.
    pub primary_type: Name,
    /// Mixin types.
    pub mixins: BTreeSet<Name>,
    /// Ordered child entries; same-name-sibling indices are positional.
    pub child_entries: Vec<ChildEntry>,
    /// Entries removed in this session; consulted only by the zombie view.
    pub removed_child_entries: Vec<RemovedChildEntry>,
    /// Names of the node's persisted properties.
    pub property_names: BTreeSet<Name>,
    /// Share-parents for shareable nodes.
    pub shared_set: BTreeSet<NodeId>,
    /// Lifecycle status.
    pub status: ItemStatus,
    /// Persisted modification counter.
    pub mod_count: u16,
    /// Present on transient states only.
    pub overlay: Option<Overlay>,
}

impl NodeState {
    /// A brand-new node state.
    pub fn new(id: NodeId, parent_id: Option<NodeId>, primary_type: Name) -> Self {
        Self {
            id,
            parent_id,
            primary_type,
            mixins: BTreeSet::new(),
            child_entries: Vec::new(),
            removed_child_entries: Vec::new(),
            property_names: BTreeSet::new(),
            shared_set: BTreeSet::new(),
            status: ItemStatus::New,
            mod_count: 0,
            overlay: None,
        }
    }

    /// Materializes the persisted state from a bundle.
    pub fn from_bundle(bundle: &NodePropBundle) -> Self {
        Self {
            id: bundle.id,
            parent_id: bundle.parent_id,
            primary_type: bundle.primary_type.clone(),
            mixins: bundle.mixins.clone(),
            child_entries: bundle.child_entries.clone(),
            removed_child_entries: Vec::new(),
            property_names: bundle.properties.keys().cloned().collect(),
            shared_set: bundle.shared_set.clone(),
            status: ItemStatus::Existing,
            mod_count: bundle.mod_count,
            overlay: None,
        }
    }

    /// Clones the persisted state into a transient copy that remembers
    /// what it shadows.
    pub fn transient_copy(&self, status: ItemStatus) -> Self {
        let mut copy = self.clone();
        copy.status = status;
        copy.overlay = Some(Overlay {
            parent_id: self.parent_id,
            mod_count: self.mod_count,
        });
        copy
    }

    /// Appends a child entry.
    pub fn add_child(&mut self, name: Name, id: NodeId) {
        self.child_entries.push(ChildEntry::new(name, id));
    }

    /// Removes the entry for `id`, recording it (with its index at removal
    /// time) for the zombie view. Returns `false` when no entry matched.
    pub fn remove_child(&mut self, id: NodeId) -> bool {
        match self.child_entries.iter().position(|e| e.id == id) {
            Some(pos) => {
                let index = sns_index(&self.child_entries, pos);
                let entry = self.child_entries.remove(pos);
                self.removed_child_entries
                    .push(RemovedChildEntry { entry, index });
                true
            }
            None => false,
        }
    }

    /// True when the node is referenceable (`mix:referenceable` or a type
    /// that implies it).
    pub fn is_referenceable(&self) -> bool {
        self.mixins.contains(&Name::mix_referenceable()) || self.primary_type == Name::rep_root()
    }

    /// Synthesizes one of the three generated properties from node fields.
    pub fn synthesized_property(&self, name: &Name) -> Option<PropertyState> {
        if !name.is_synthesized() {
            return None;
        }
        let id = PropertyId::new(self.id, name.clone());
        let state = if *name == Name::jcr_primary_type() {
            PropertyState::single(id, Value::Name(self.primary_type.clone()))
        } else if *name == Name::jcr_mixin_types() {
            PropertyState::multi(
                id,
                PropertyKind::Name,
                self.mixins.iter().cloned().map(Value::Name).collect(),
            )
        } else {
            PropertyState::single(id, Value::String(self.id.to_hex()))
        };
        Some(state)
    }
}

/// In-memory state of one property.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyState {
    /// Property id (owning node + name).
    pub id: PropertyId,
    /// Value type.
    pub kind: PropertyKind,
    /// Declared multi-valued.
    pub multi_valued: bool,
    /// Current values.
    pub values: Vec<Value>,
    /// Lifecycle status.
    pub status: ItemStatus,
    /// Persisted modification counter.
    pub mod_count: u16,
    /// Persisted counter at transient-copy time; `None` on fresh states.
    pub overlay_mod_count: Option<u16>,
}

impl PropertyState {
    /// A new single-valued property state.
    pub fn single(id: PropertyId, value: Value) -> Self {
        Self {
            id,
            kind: value.kind(),
            multi_valued: false,
            values: vec![value],
            status: ItemStatus::New,
            mod_count: 0,
            overlay_mod_count: None,
        }
    }

    /// A new multi-valued property state.
    pub fn multi(id: PropertyId, kind: PropertyKind, values: Vec<Value>) -> Self {
        Self {
            id,
            kind,
            multi_valued: true,
            values,
            status: ItemStatus::New,
            mod_count: 0,
            overlay_mod_count: None,
        }
    }

    /// Materializes the persisted state from a bundle entry.
    pub fn from_entry(id: PropertyId, entry: &PropertyEntry) -> Self {
        Self {
            id,
            kind: entry.kind,
            multi_valued: entry.multi_valued,
            values: entry.values.clone(),
            status: ItemStatus::Existing,
            mod_count: entry.mod_count,
            overlay_mod_count: None,
        }
    }

    /// Clones into a transient copy shadowing the persisted record.
    pub fn transient_copy(&self, status: ItemStatus) -> Self {
        let mut copy = self.clone();
        copy.status = status;
        copy.overlay_mod_count = Some(self.mod_count);
        copy
    }

    /// The persisted form of this state.
    pub fn to_entry(&self) -> PropertyEntry {
        PropertyEntry {
            kind: self.kind,
            multi_valued: self.multi_valued,
            values: self.values.clone(),
            mod_count: self.mod_count,
        }
    }
}

/// Tagged union over the two state kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemState {
    /// A node state.
    Node(NodeState),
    /// A property state.
    Property(PropertyState),
}

impl ItemState {
    /// The item id.
    pub fn id(&self) -> ItemId {
        match self {
            ItemState::Node(n) => ItemId::Node(n.id),
            ItemState::Property(p) => ItemId::Property(p.id.clone()),
        }
    }

    /// Lifecycle status.
    pub fn status(&self) -> ItemStatus {
        match self {
            ItemState::Node(n) => n.status,
            ItemState::Property(p) => p.status,
        }
    }

    /// Overwrites the lifecycle status.
    pub fn set_status(&mut self, status: ItemStatus) {
        match self {
            ItemState::Node(n) => n.status = status,
            ItemState::Property(p) => p.status = status,
        }
    }

    /// Id of the node hosting this item: the node itself, or the
    /// property's owner.
    pub fn hosting_node(&self) -> NodeId {
        match self {
            ItemState::Node(n) => n.id,
            ItemState::Property(p) => p.id.parent,
        }
    }

    /// Current parent node: the node's parent, or the property's owner.
    pub fn parent_node(&self) -> Option<NodeId> {
        match self {
            ItemState::Node(n) => n.parent_id,
            ItemState::Property(p) => Some(p.id.parent),
        }
    }

    /// The original (overlayed) parent for transient states; falls back to
    /// the current parent.
    pub fn overlayed_parent(&self) -> Option<NodeId> {
        match self {
            ItemState::Node(n) => match &n.overlay {
                Some(overlay) => overlay.parent_id,
                None => n.parent_id,
            },
            ItemState::Property(p) => Some(p.id.parent),
        }
    }

    /// Borrows the node state or fails.
    pub fn as_node(&self) -> Result<&NodeState> {
        match self {
            ItemState::Node(n) => Ok(n),
            ItemState::Property(_) => Err(RepoError::InvalidArgument(
                "expected a node state".into(),
            )),
        }
    }

    /// Borrows the property state or fails.
    pub fn as_property(&self) -> Result<&PropertyState> {
        match self {
            ItemState::Property(p) => Ok(p),
            ItemState::Node(_) => Err(RepoError::InvalidArgument(
                "expected a property state".into(),
            )),
        }
    }
}
