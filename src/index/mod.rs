//! Secondary full-text index over node documents.
//!
//! An in-memory inverted index kept current by listening to shared
//! item-state transitions: one document per node, one field per property
//! name, terms from the values' index form. Under format `V2` and later a
//! `PROPERTIES_SET` field records which property names a document carries,
//! so match-all queries rewrite to a single term lookup; `V3` additionally
//! indexes case-transformed terms for case-insensitive wildcards.
//!
//! Updates never mutate documents in place: the document is marked deleted
//! and re-added (the deletion set is captured by read-only readers at open
//! time). Cluster replays arrive through the same listener path.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::config::IndexFormatVersion;
use crate::model::NodeId;
use crate::state::shared::ItemStateListener;
use crate::state::{ItemState, NodeState};

pub mod bitset;
pub mod reader;
pub mod wildcard;

use bitset::BitSet;
use reader::{IndexSnapshot, ReadOnlyIndexReader};

/// Field recording the property names present on a document (format V2+).
pub const PROPERTIES_SET_FIELD: &str = ":propertiesSet";
/// Field carrying the document's primary type.
pub const PRIMARY_TYPE_FIELD: &str = ":primaryType";

/// Case transform applied to indexed terms (format V3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transform {
    /// Terms as written.
    None,
    /// Lowercased terms.
    Lower,
    /// Uppercased terms.
    Upper,
}

impl Transform {
    /// Field-name suffix for the transform's shadow field.
    pub fn field_of(self, field: &str) -> String {
        match self {
            Transform::None => field.to_string(),
            Transform::Lower => format!(":lower:{field}"),
            Transform::Upper => format!(":upper:{field}"),
        }
    }

    /// Cache-key discriminator.
    pub fn key(self) -> &'static str {
        match self {
            Transform::None => "none",
            Transform::Lower => "lower",
            Transform::Upper => "upper",
        }
    }
}

#[derive(Default)]
struct IndexCore {
    /// field -> term -> ascending doc numbers.
    fields: BTreeMap<String, BTreeMap<String, Vec<u32>>>,
    /// doc number -> node (dense, grows monotonically).
    doc_nodes: Vec<NodeId>,
    /// live doc of a node.
    doc_of: FxHashMap<NodeId, u32>,
    /// stored fields per live doc, for delete-and-readd updates.
    stored: FxHashMap<NodeId, BTreeMap<String, Vec<String>>>,
    deleted: Vec<bool>,
    generation: u64,
}

/// The search index.
pub struct SearchIndex {
    core: RwLock<IndexCore>,
    format: IndexFormatVersion,
}

impl SearchIndex {
    /// An empty index with the configured field layout generation.
    pub fn new(format: IndexFormatVersion) -> Self {
        Self {
            core: RwLock::new(IndexCore::default()),
            format,
        }
    }

    /// The configured format version.
    pub fn format(&self) -> IndexFormatVersion {
        self.format
    }

    /// Creates or replaces the document for `node` with the given stored
    /// fields (`property name -> terms`).
    pub fn update_doc(&self, node: NodeId, fields: BTreeMap<String, Vec<String>>) {
        let mut core = self.core.write();
        core.generation += 1;
        if let Some(doc) = core.doc_of.remove(&node) {
            core.deleted[doc as usize] = true;
        }
        let doc = core.doc_nodes.len() as u32;
        core.doc_nodes.push(node);
        core.deleted.push(false);
        core.doc_of.insert(node, doc);

        for (field, terms) in &fields {
            for term in terms {
                Self::post(&mut core, field, term, doc);
                if self.format >= IndexFormatVersion::V3 {
                    Self::post(
                        &mut core,
                        &Transform::Lower.field_of(field),
                        &term.to_lowercase(),
                        doc,
                    );
                    Self::post(
                        &mut core,
                        &Transform::Upper.field_of(field),
                        &term.to_uppercase(),
                        doc,
                    );
                }
            }
            if self.format >= IndexFormatVersion::V2 {
                Self::post(&mut core, PROPERTIES_SET_FIELD, field, doc);
            }
        }
        core.stored.insert(node, fields);
        trace!(node = %node, doc, "index.doc.updated");
    }

    /// The stored fields of a node's live document.
    pub fn stored_fields(&self, node: NodeId) -> Option<BTreeMap<String, Vec<String>>> {
        self.core.read().stored.get(&node).cloned()
    }

    /// Marks a node's document deleted.
    pub fn remove_doc(&self, node: NodeId) {
        let mut core = self.core.write();
        if let Some(doc) = core.doc_of.remove(&node) {
            core.generation += 1;
            core.deleted[doc as usize] = true;
            core.stored.remove(&node);
            trace!(node = %node, doc, "index.doc.removed");
        }
    }

    /// Opens a read-only view over the current state. The deletion set is
    /// captured now; later updates never affect the returned reader.
    pub fn open_reader(&self) -> ReadOnlyIndexReader {
        let core = self.core.read();
        let mut deleted = BitSet::new(core.deleted.len());
        for (doc, &dead) in core.deleted.iter().enumerate() {
            if dead {
                deleted.set(doc);
            }
        }
        ReadOnlyIndexReader::new(IndexSnapshot {
            generation: core.generation,
            fields: core.fields.clone(),
            deleted,
            max_doc: core.doc_nodes.len() as u32,
            doc_nodes: core.doc_nodes.clone(),
        })
    }

    fn post(core: &mut IndexCore, field: &str, term: &str, doc: u32) {
        let terms = core.fields.entry(field.to_string()).or_default();
        let docs = terms.entry(term.to_string()).or_default();
        // Doc numbers only grow, so pushes keep postings sorted.
        if docs.last().copied() != Some(doc) {
            docs.push(doc);
        }
    }
}

/// Bridges shared item-state events into index maintenance.
///
/// Holds the index strongly; registered with the shared manager as a weak
/// listener so a dropped repository never pins the fan-out path.
pub struct IndexUpdateListener {
    index: Arc<SearchIndex>,
}

impl IndexUpdateListener {
    /// Wraps an index.
    pub fn new(index: Arc<SearchIndex>) -> Self {
        Self { index }
    }

    fn fold_property(&self, state: &ItemState, removed: bool) {
        let ItemState::Property(prop) = state else {
            return;
        };
        let node = prop.id.parent;
        let mut fields = self.index.stored_fields(node).unwrap_or_default();
        let field = prop.id.name.to_string();
        if removed {
            fields.remove(&field);
        } else {
            let terms: Vec<String> = prop
                .values
                .iter()
                .map(|v| v.to_index_term())
                .filter(|t| !t.is_empty())
                .collect();
            fields.insert(field, terms);
        }
        self.index.update_doc(node, fields);
    }

    fn fold_node(&self, node: &NodeState) {
        let mut fields = self.index.stored_fields(node.id).unwrap_or_default();
        fields.insert(
            PRIMARY_TYPE_FIELD.to_string(),
            vec![node.primary_type.to_string()],
        );
        self.index.update_doc(node.id, fields);
    }
}

impl ItemStateListener for IndexUpdateListener {
    fn state_created(&self, state: &ItemState) {
        match state {
            ItemState::Node(node) => self.fold_node(node),
            ItemState::Property(_) => self.fold_property(state, false),
        }
    }

    fn state_modified(&self, state: &ItemState) {
        match state {
            ItemState::Node(node) => self.fold_node(node),
            ItemState::Property(_) => self.fold_property(state, false),
        }
    }

    fn state_destroyed(&self, state: &ItemState) {
        match state {
            ItemState::Node(node) => self.index.remove_doc(node.id),
            ItemState::Property(_) => self.fold_property(state, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
            .collect()
    }

    #[test]
    fn update_replaces_the_previous_document() {
        let index = SearchIndex::new(IndexFormatVersion::V2);
        let node = NodeId::fresh();
        index.update_doc(node, fields(&[("title", &["old"])]));
        index.update_doc(node, fields(&[("title", &["new"])]));

        let reader = index.open_reader();
        assert!(reader.term_docs("title", "old").is_empty());
        let hits = reader.term_docs("title", "new");
        assert_eq!(hits.len(), 1);
        assert_eq!(reader.node_of(hits[0]), Some(node));
    }

    #[test]
    fn readers_are_snapshots() {
        let index = SearchIndex::new(IndexFormatVersion::V2);
        let node = NodeId::fresh();
        index.update_doc(node, fields(&[("title", &["hello"])]));
        let reader = index.open_reader();
        index.remove_doc(node);

        // The pre-captured view still matches; a fresh reader does not.
        assert_eq!(reader.term_docs("title", "hello").len(), 1);
        let fresh = index.open_reader();
        assert!(fresh.term_docs("title", "hello").is_empty());
        assert_ne!(reader.generation(), fresh.generation());
    }

    #[test]
    fn properties_set_field_written_from_v2() {
        let v1 = SearchIndex::new(IndexFormatVersion::V1);
        let v2 = SearchIndex::new(IndexFormatVersion::V2);
        let node = NodeId::fresh();
        v1.update_doc(node, fields(&[("title", &["x"])]));
        v2.update_doc(node, fields(&[("title", &["x"])]));

        assert!(v1
            .open_reader()
            .term_docs(PROPERTIES_SET_FIELD, "title")
            .is_empty());
        assert_eq!(
            v2.open_reader()
                .term_docs(PROPERTIES_SET_FIELD, "title")
                .len(),
            1
        );
    }

    #[test]
    fn v3_indexes_case_transforms() {
        let index = SearchIndex::new(IndexFormatVersion::V3);
        let node = NodeId::fresh();
        index.update_doc(node, fields(&[("title", &["Hello"])]));
        let reader = index.open_reader();
        assert_eq!(
            reader
                .term_docs(&Transform::Lower.field_of("title"), "hello")
                .len(),
            1
        );
        assert_eq!(
            reader
                .term_docs(&Transform::Upper.field_of("title"), "HELLO")
                .len(),
            1
        );
    }
}
