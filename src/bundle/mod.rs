//! Bundle records: the persisted form of one node plus its properties.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{Name, NodeId, PropertyId};
use crate::value::{PropertyKind, Value};

pub mod cache;
pub mod codec;
pub mod store;

/// One child slot of a node: name plus child node id. Same-name-sibling
/// indices are positional: the 1-based index of an entry is its position
/// among entries sharing its name, so indices stay dense across removals
/// and reorders without bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    /// Child name.
    pub name: Name,
    /// Child node id.
    pub id: NodeId,
}

impl ChildEntry {
    /// Builds a child entry.
    pub fn new(name: Name, id: NodeId) -> Self {
        Self { name, id }
    }
}

/// Computes the 1-based same-name-sibling index of `entries[pos]`.
pub fn sns_index(entries: &[ChildEntry], pos: usize) -> u32 {
    let name = &entries[pos].name;
    let mut index = 0u32;
    for entry in entries.iter().take(pos + 1) {
        if entry.name == *name {
            index += 1;
        }
    }
    index
}

/// Finds the entry position for `(name, index)`, if present.
pub fn find_child(entries: &[ChildEntry], name: &Name, index: u32) -> Option<usize> {
    let mut seen = 0u32;
    for (pos, entry) in entries.iter().enumerate() {
        if entry.name == *name {
            seen += 1;
            if seen == index {
                return Some(pos);
            }
        }
    }
    None
}

/// One persisted property: full values plus the per-item modification
/// counter used for stale detection.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyEntry {
    /// Value type.
    pub kind: PropertyKind,
    /// Declared multi-valued, independent of the current value count.
    pub multi_valued: bool,
    /// The values.
    pub values: Vec<Value>,
    /// Bumped on every persisted change of this property.
    pub mod_count: u16,
}

impl PropertyEntry {
    /// A single-valued entry.
    pub fn single(value: Value) -> Self {
        Self {
            kind: value.kind(),
            multi_valued: false,
            values: vec![value],
            mod_count: 0,
        }
    }

    /// A multi-valued entry. All values must share `kind`.
    pub fn multi(kind: PropertyKind, values: Vec<Value>) -> Self {
        Self {
            kind,
            multi_valued: true,
            values,
            mod_count: 0,
        }
    }
}

/// The on-disk record for one node and all of its persisted properties.
///
/// `jcr:primaryType`, `jcr:mixinTypes` and `jcr:uuid` are never present in
/// `properties`; they are synthesized on read from the node fields.
#[derive(Debug, Clone, PartialEq)]
pub struct NodePropBundle {
    /// Node id.
    pub id: NodeId,
    /// Parent node id. `None` only for the root bundle.
    pub parent_id: Option<NodeId>,
    /// Primary node type.
    pub primary_type: Name,
    /// Mixin types.
    pub mixins: BTreeSet<Name>,
    /// Ordered child entries.
    pub child_entries: Vec<ChildEntry>,
    /// Share-parents of this node, when it is shareable.
    pub shared_set: BTreeSet<NodeId>,
    /// Persisted properties keyed by name.
    pub properties: BTreeMap<Name, PropertyEntry>,
    /// Bumped on every persisted change of the node record itself.
    pub mod_count: u16,
}

impl NodePropBundle {
    /// A fresh bundle with no children or properties.
    pub fn new(id: NodeId, parent_id: Option<NodeId>, primary_type: Name) -> Self {
        Self {
            id,
            parent_id,
            primary_type,
            mixins: BTreeSet::new(),
            child_entries: Vec::new(),
            shared_set: BTreeSet::new(),
            properties: BTreeMap::new(),
            mod_count: 0,
        }
    }

    /// Approximate resident bytes, used by the secondary cache budget.
    pub fn memory_footprint(&self) -> usize {
        let mut size = std::mem::size_of::<Self>();
        size += name_footprint(&self.primary_type);
        for mixin in &self.mixins {
            size += name_footprint(mixin);
        }
        for entry in &self.child_entries {
            size += name_footprint(&entry.name) + 16;
        }
        size += self.shared_set.len() * 16;
        for (name, prop) in &self.properties {
            size += name_footprint(name) + std::mem::size_of::<PropertyEntry>();
            for value in &prop.values {
                size += value.memory_footprint();
            }
        }
        size
    }
}

fn name_footprint(name: &Name) -> usize {
    name.ns.len() + name.local.len() + std::mem::size_of::<Name>()
}

/// Inverse reference index entry: all `REFERENCE` properties targeting one
/// node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeReferences {
    /// Referenced node.
    pub target: Option<NodeId>,
    /// Properties holding a `REFERENCE` to the target.
    pub referrers: BTreeSet<PropertyId>,
}

impl NodeReferences {
    /// An empty reference set for `target`.
    pub fn new(target: NodeId) -> Self {
        Self {
            target: Some(target),
            referrers: BTreeSet::new(),
        }
    }

    /// True when no live property references the target.
    pub fn is_empty(&self) -> bool {
        self.referrers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> ChildEntry {
        ChildEntry::new(Name::plain(name), NodeId::fresh())
    }

    #[test]
    fn sns_indices_are_positional_and_dense() {
        let mut entries = vec![entry("foo"), entry("bar"), entry("foo"), entry("foo")];
        assert_eq!(sns_index(&entries, 0), 1);
        assert_eq!(sns_index(&entries, 2), 2);
        assert_eq!(sns_index(&entries, 3), 3);

        // Removing foo[1] renumbers foo[2] -> foo[1], foo[3] -> foo[2].
        let removed = entries.remove(0);
        assert_eq!(removed.name, Name::plain("foo"));
        assert_eq!(sns_index(&entries, 1), 1);
        assert_eq!(sns_index(&entries, 2), 2);
    }

    #[test]
    fn find_child_by_name_and_index() {
        let entries = vec![entry("foo"), entry("bar"), entry("foo")];
        let pos = find_child(&entries, &Name::plain("foo"), 2).expect("foo[2]");
        assert_eq!(pos, 2);
        assert!(find_child(&entries, &Name::plain("foo"), 3).is_none());
        assert!(find_child(&entries, &Name::plain("baz"), 1).is_none());
    }

    #[test]
    fn footprint_grows_with_content() {
        let id = NodeId::fresh();
        let mut bundle = NodePropBundle::new(id, None, Name::nt_unstructured());
        let empty = bundle.memory_footprint();
        bundle.properties.insert(
            Name::plain("title"),
            PropertyEntry::single(Value::String("x".repeat(256))),
        );
        assert!(bundle.memory_footprint() > empty + 256);
    }
}
