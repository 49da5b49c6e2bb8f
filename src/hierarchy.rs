//! Path ↔ id resolution over an item-state source.
//!
//! The engine is generic over [`ItemStateSource`]; the shared view, the
//! session view, and the zombie view differ only in how they look states
//! up, which parent they report for a state, and whether removed child
//! entries take part in downward lookups. `resolve_path` returns absent on
//! a miss (cheap for callers probing existence); `path_of` errors when the
//! item cannot be anchored to the root.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::bundle::find_child;
use crate::error::{RepoError, Result};
use crate::model::{ItemId, Name, NodeId, Path, PathElement, PropertyId};
use crate::state::shared::SharedItemStateManager;
use crate::state::transient::TransientItemStateManager;
use crate::state::{ItemState, NodeState};

const MAX_WALK: usize = 10_000;

/// The two hooks a hierarchy view varies over, plus state lookup.
pub trait ItemStateSource {
    /// Looks up a state, absent on miss.
    fn item_state(&self, id: &ItemId) -> Result<Option<ItemState>>;

    /// The parent used for upward walks.
    fn parent_of(&self, state: &ItemState) -> Option<NodeId> {
        state.parent_node()
    }

    /// Resolves `(name, index)` among `parent`'s children.
    fn child_lookup(&self, parent: &NodeState, name: &Name, index: u32) -> Option<NodeId> {
        find_child(&parent.child_entries, name, index).map(|pos| parent.child_entries[pos].id)
    }

    /// Finds the `(name, index)` slot of `child` below `parent`.
    fn child_slot(&self, parent: &NodeState, child: NodeId) -> Option<(Name, u32)> {
        parent
            .child_entries
            .iter()
            .position(|e| e.id == child)
            .map(|pos| {
                (
                    parent.child_entries[pos].name.clone(),
                    crate::bundle::sns_index(&parent.child_entries, pos),
                )
            })
    }
}

/// Source over the shared (persisted) view.
pub struct SharedSource {
    sism: Arc<SharedItemStateManager>,
}

impl SharedSource {
    /// Wraps the shared manager.
    pub fn new(sism: Arc<SharedItemStateManager>) -> Self {
        Self { sism }
    }
}

impl ItemStateSource for SharedSource {
    fn item_state(&self, id: &ItemId) -> Result<Option<ItemState>> {
        self.sism.item_state(id)
    }
}

/// Source over a session's normal (non-zombie) view.
pub struct SessionSource<'a> {
    tism: &'a TransientItemStateManager,
}

impl<'a> SessionSource<'a> {
    /// Wraps a transient manager.
    pub fn new(tism: &'a TransientItemStateManager) -> Self {
        Self { tism }
    }
}

impl ItemStateSource for SessionSource<'_> {
    fn item_state(&self, id: &ItemId) -> Result<Option<ItemState>> {
        self.tism.get(id, false)
    }
}

/// Source over a session's zombie view: attic states resolve, upward walks
/// use the overlayed (original) parent, and downward lookups extend over
/// removed child entries.
pub struct ZombieSource<'a> {
    tism: &'a TransientItemStateManager,
}

impl<'a> ZombieSource<'a> {
    /// Wraps a transient manager.
    pub fn new(tism: &'a TransientItemStateManager) -> Self {
        Self { tism }
    }
}

impl ItemStateSource for ZombieSource<'_> {
    fn item_state(&self, id: &ItemId) -> Result<Option<ItemState>> {
        self.tism.get(id, true)
    }

    fn parent_of(&self, state: &ItemState) -> Option<NodeId> {
        state.overlayed_parent()
    }

    fn child_lookup(&self, parent: &NodeState, name: &Name, index: u32) -> Option<NodeId> {
        if let Some(pos) = find_child(&parent.child_entries, name, index) {
            return Some(parent.child_entries[pos].id);
        }
        parent
            .removed_child_entries
            .iter()
            .find(|removed| removed.entry.name == *name && removed.index == index)
            .map(|removed| removed.entry.id)
    }

    fn child_slot(&self, parent: &NodeState, child: NodeId) -> Option<(Name, u32)> {
        if let Some(slot) = parent
            .child_entries
            .iter()
            .position(|e| e.id == child)
            .map(|pos| {
                (
                    parent.child_entries[pos].name.clone(),
                    crate::bundle::sns_index(&parent.child_entries, pos),
                )
            })
        {
            return Some(slot);
        }
        parent
            .removed_child_entries
            .iter()
            .find(|removed| removed.entry.id == child)
            .map(|removed| (removed.entry.name.clone(), removed.index))
    }
}

/// Path ↔ id resolution engine.
pub struct HierarchyManager<S: ItemStateSource> {
    source: S,
    root: NodeId,
}

impl<S: ItemStateSource> HierarchyManager<S> {
    /// Builds a manager rooted at `root`.
    pub fn new(source: S, root: NodeId) -> Self {
        Self { source, root }
    }

    /// The root node id.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// The underlying source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Resolves an absolute, normalized path to an item id. Absent on any
    /// miss along the way; never an error for not-found.
    pub fn resolve_path(&self, path: &Path) -> Result<Option<ItemId>> {
        if !path.is_absolute() {
            return Err(RepoError::InvalidArgument(format!(
                "path {path} is not absolute"
            )));
        }
        let path = path.normalize()?;
        let mut current = self.root;
        let elements = path.elements();
        let steps: Vec<&PathElement> = elements
            .iter()
            .filter(|el| matches!(el, PathElement::Named { .. }))
            .collect();

        for (pos, element) in steps.iter().enumerate() {
            let PathElement::Named { name, index } = element else {
                continue;
            };
            let Some(state) = self.source.item_state(&ItemId::Node(current))? else {
                return Ok(None);
            };
            let node = state.as_node()?;
            match self.source.child_lookup(node, name, *index) {
                Some(child) => current = child,
                None => {
                    // The final step may address a property.
                    if pos == steps.len() - 1 && *index == 1 {
                        let prop = ItemId::Property(PropertyId::new(current, (*name).clone()));
                        if self.source.item_state(&prop)?.is_some() {
                            return Ok(Some(prop));
                        }
                    }
                    return Ok(None);
                }
            }
        }
        Ok(Some(ItemId::Node(current)))
    }

    /// The absolute path of an item. Errors when the item does not resolve
    /// to the root through its parents.
    pub fn path_of(&self, id: &ItemId) -> Result<Path> {
        match id {
            ItemId::Property(prop) => {
                let parent = self.path_of(&ItemId::Node(prop.parent))?;
                Ok(parent.child(prop.name.clone()))
            }
            ItemId::Node(node_id) => {
                let mut elements = VecDeque::new();
                let mut current = *node_id;
                let mut hops = 0usize;
                while current != self.root {
                    if hops > MAX_WALK {
                        return Err(RepoError::Corruption(
                            "parent chain does not terminate".into(),
                        ));
                    }
                    hops += 1;
                    let state = self
                        .source
                        .item_state(&ItemId::Node(current))?
                        .ok_or(RepoError::NotFound("node"))?;
                    let parent_id = self
                        .source
                        .parent_of(&state)
                        .ok_or(RepoError::NotFound("parent"))?;
                    let parent_state = self
                        .source
                        .item_state(&ItemId::Node(parent_id))?
                        .ok_or(RepoError::NotFound("parent"))?;
                    let (name, index) = self
                        .source
                        .child_slot(parent_state.as_node()?, current)
                        .ok_or(RepoError::NotFound("child entry"))?;
                    elements.push_front(PathElement::indexed(name, index));
                    current = parent_id;
                }
                elements.push_front(PathElement::Root);
                Path::from_elements(elements)
            }
        }
    }

    /// The `(name, index)` of a node below its parent; the root has none.
    pub fn name_of(&self, id: NodeId) -> Result<Option<(Name, u32)>> {
        if id == self.root {
            return Ok(None);
        }
        let state = self
            .source
            .item_state(&ItemId::Node(id))?
            .ok_or(RepoError::NotFound("node"))?;
        let parent_id = self
            .source
            .parent_of(&state)
            .ok_or(RepoError::NotFound("parent"))?;
        self.name_below(id, parent_id).map(Some)
    }

    /// The name of `id` below a specific parent; share-parents may each
    /// know the node under a different name.
    pub fn name_below(&self, id: NodeId, parent: NodeId) -> Result<(Name, u32)> {
        let parent_state = self
            .source
            .item_state(&ItemId::Node(parent))?
            .ok_or(RepoError::NotFound("parent"))?;
        self.source
            .child_slot(parent_state.as_node()?, id)
            .ok_or(RepoError::NotFound("child entry"))
    }

    /// Depth below the root (root = 0).
    pub fn depth(&self, id: &ItemId) -> Result<usize> {
        Ok(self.path_of(id)?.depth())
    }

    /// True when `ancestor` lies on `item`'s parent chain.
    pub fn is_ancestor(&self, ancestor: NodeId, item: &ItemId) -> Result<bool> {
        let mut current = match item {
            ItemId::Node(id) => *id,
            ItemId::Property(prop) => prop.parent,
        };
        if matches!(item, ItemId::Property(p) if p.parent == ancestor) {
            return Ok(true);
        }
        let mut hops = 0usize;
        while current != self.root {
            if hops > MAX_WALK {
                return Err(RepoError::Corruption(
                    "parent chain does not terminate".into(),
                ));
            }
            hops += 1;
            let Some(state) = self.source.item_state(&ItemId::Node(current))? else {
                return Ok(false);
            };
            match self.source.parent_of(&state) {
                Some(parent) => {
                    if parent == ancestor {
                        return Ok(true);
                    }
                    current = parent;
                }
                None => return Ok(false),
            }
        }
        Ok(ancestor == self.root && !matches!(item, ItemId::Node(id) if *id == self.root))
    }

    /// True when `ancestor` is reachable from `descendant` over
    /// parent-or-share-parent edges.
    pub fn is_share_ancestor(&self, ancestor: NodeId, descendant: NodeId) -> Result<bool> {
        Ok(self.share_relative_depth(ancestor, descendant)? >= 0)
    }

    /// Shortest ancestor distance over parent-or-share-parent edges, or
    /// `-1` when `ancestor` is not an ancestor of `descendant`.
    pub fn share_relative_depth(&self, ancestor: NodeId, descendant: NodeId) -> Result<i32> {
        if ancestor == descendant {
            return Ok(0);
        }
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut frontier: VecDeque<(NodeId, i32)> = VecDeque::new();
        frontier.push_back((descendant, 0));
        visited.insert(descendant);

        while let Some((current, distance)) = frontier.pop_front() {
            if visited.len() > MAX_WALK {
                return Err(RepoError::Corruption("share graph does not terminate".into()));
            }
            let Some(state) = self.source.item_state(&ItemId::Node(current))? else {
                continue;
            };
            let node = state.as_node()?;
            let mut uplinks: Vec<NodeId> = node.shared_set.iter().copied().collect();
            if let Some(parent) = self.source.parent_of(&state) {
                uplinks.push(parent);
            }
            for up in uplinks {
                if up == ancestor {
                    return Ok(distance + 1);
                }
                if visited.insert(up) {
                    frontier.push_back((up, distance + 1));
                }
            }
        }
        Ok(-1)
    }
}
