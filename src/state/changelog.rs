//! The ordered set of item-state changes a session intends to commit.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::bundle::NodeReferences;
use crate::model::{ItemId, NodeId};
use crate::state::ItemState;

/// How an item appears in a [`ChangeLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    /// Created in this change set.
    Added,
    /// Modified in this change set.
    Modified,
    /// Deleted in this change set.
    Deleted,
}

/// Insertion-ordered collection of NEW / MODIFIED / DELETED item states plus
/// the reference-index updates derived from them.
#[derive(Debug, Default, Clone)]
pub struct ChangeLog {
    order: Vec<ItemId>,
    entries: FxHashMap<ItemId, (ChangeOp, ItemState)>,
    /// Reference-index records to write alongside the item changes.
    pub modified_refs: Vec<NodeReferences>,
    /// Reference-index records to destroy.
    pub deleted_refs: Vec<NodeId>,
}

impl ChangeLog {
    /// An empty change log.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.modified_refs.is_empty() && self.deleted_refs.is_empty()
    }

    /// Number of recorded item changes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Records a created state. Re-adding a previously deleted id turns
    /// the entry into a modification of the persisted item.
    pub fn added(&mut self, state: ItemState) {
        let id = state.id();
        match self.entries.get(&id).map(|(op, _)| *op) {
            Some(ChangeOp::Deleted) => {
                self.entries.insert(id, (ChangeOp::Modified, state));
            }
            Some(_) => {
                self.entries.insert(id, (ChangeOp::Added, state));
            }
            None => {
                self.order.push(id.clone());
                self.entries.insert(id, (ChangeOp::Added, state));
            }
        }
    }

    /// Records a modified state. A previously added item stays added.
    pub fn modified(&mut self, state: ItemState) {
        let id = state.id();
        match self.entries.get(&id).map(|(op, _)| *op) {
            Some(ChangeOp::Added) => {
                self.entries.insert(id, (ChangeOp::Added, state));
            }
            Some(_) => {
                self.entries.insert(id, (ChangeOp::Modified, state));
            }
            None => {
                self.order.push(id.clone());
                self.entries.insert(id, (ChangeOp::Modified, state));
            }
        }
    }

    /// Records a deleted state. Deleting an item added in the same change
    /// set cancels both entries.
    pub fn deleted(&mut self, state: ItemState) {
        let id = state.id();
        match self.entries.get(&id).map(|(op, _)| *op) {
            Some(ChangeOp::Added) => {
                self.entries.remove(&id);
                self.order.retain(|o| *o != id);
            }
            Some(_) => {
                self.entries.insert(id, (ChangeOp::Deleted, state));
            }
            None => {
                self.order.push(id.clone());
                self.entries.insert(id, (ChangeOp::Deleted, state));
            }
        }
    }

    /// Looks up the recorded operation and state for `id`.
    pub fn get(&self, id: &ItemId) -> Option<(&ChangeOp, &ItemState)> {
        self.entries.get(id).map(|(op, state)| (op, state))
    }

    /// All entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&ChangeOp, &ItemState)> {
        self.order.iter().filter_map(|id| self.get(id))
    }

    /// Added states in insertion order.
    pub fn added_states(&self) -> impl Iterator<Item = &ItemState> {
        self.filtered(ChangeOp::Added)
    }

    /// Modified states in insertion order.
    pub fn modified_states(&self) -> impl Iterator<Item = &ItemState> {
        self.filtered(ChangeOp::Modified)
    }

    /// Deleted states in insertion order.
    pub fn deleted_states(&self) -> impl Iterator<Item = &ItemState> {
        self.filtered(ChangeOp::Deleted)
    }

    fn filtered(&self, wanted: ChangeOp) -> impl Iterator<Item = &ItemState> {
        self.order.iter().filter_map(move |id| {
            self.entries
                .get(id)
                .filter(|(op, _)| *op == wanted)
                .map(|(_, state)| state)
        })
    }

    /// Node ids whose bundles are affected by this change set: every
    /// changed node plus the owner of every changed property.
    pub fn touched_nodes(&self) -> BTreeSet<NodeId> {
        self.iter().map(|(_, state)| state.hosting_node()).collect()
    }

    /// Folds `other` into `self`, preserving `other`'s ordering after
    /// existing entries.
    pub fn merge(&mut self, other: ChangeLog) {
        for id in other.order {
            if let Some((op, state)) = other.entries.get(&id) {
                match op {
                    ChangeOp::Added => self.added(state.clone()),
                    ChangeOp::Modified => self.modified(state.clone()),
                    ChangeOp::Deleted => self.deleted(state.clone()),
                }
            }
        }
        self.modified_refs.extend(other.modified_refs);
        self.deleted_refs.extend(other.deleted_refs);
    }

    /// Orders a subset of the log's node states parent-before-child
    /// (`parent_first`) or child-before-parent, for listener fan-out.
    /// Properties sort after (or before) their hosting node accordingly.
    pub fn topo_order<'a>(&self, states: Vec<&'a ItemState>, parent_first: bool) -> Vec<&'a ItemState> {
        let mut keyed: Vec<(usize, &ItemState)> = states
            .into_iter()
            .map(|state| (self.depth_within(state), state))
            .collect();
        keyed.sort_by_key(|(depth, _)| *depth);
        if !parent_first {
            keyed.reverse();
        }
        keyed.into_iter().map(|(_, state)| state).collect()
    }

    // Chain length through parents that are themselves part of this change
    // set; properties count one deeper than their node.
    fn depth_within(&self, state: &ItemState) -> usize {
        let mut depth = 0usize;
        let mut current = match state {
            ItemState::Node(_) => state.overlayed_parent(),
            ItemState::Property(p) => {
                depth += 1;
                Some(p.id.parent)
            }
        };
        let mut hops = 0usize;
        while let Some(node) = current {
            if hops > self.entries.len() + 1 {
                break;
            }
            hops += 1;
            depth += 1;
            let id = ItemId::Node(node);
            match self.entries.get(&id) {
                Some((_, state)) => current = state.overlayed_parent(),
                None => break,
            }
        }
        depth
    }
}
