//! Read-only, reference-counted index snapshots.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::error::{RepoError, Result};
use crate::index::bitset::BitSet;
use crate::model::NodeId;

/// Immutable index data captured at reader-open time.
pub struct IndexSnapshot {
    /// Snapshot identity: cache keys incorporate it so a re-opened reader
    /// never sees another generation's bitsets.
    pub generation: u64,
    pub(crate) fields: BTreeMap<String, BTreeMap<String, Vec<u32>>>,
    pub(crate) deleted: BitSet,
    pub(crate) max_doc: u32,
    pub(crate) doc_nodes: Vec<NodeId>,
}

struct Shared {
    snapshot: IndexSnapshot,
    refs: AtomicUsize,
}

/// A read-only view over one index generation.
///
/// Documents in the pre-captured deletion set are filtered out of every
/// iteration path. All mutator entry points fail. The view is reference
/// counted against the shared snapshot; the last release closes it.
pub struct ReadOnlyIndexReader {
    shared: Arc<Shared>,
}

impl ReadOnlyIndexReader {
    pub(crate) fn new(snapshot: IndexSnapshot) -> Self {
        Self {
            shared: Arc::new(Shared {
                snapshot,
                refs: AtomicUsize::new(1),
            }),
        }
    }

    /// Takes another reference to the underlying reader.
    pub fn acquire(&self) -> Self {
        self.shared.refs.fetch_add(1, Ordering::SeqCst);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Current reference count (diagnostics).
    pub fn ref_count(&self) -> usize {
        self.shared.refs.load(Ordering::SeqCst)
    }

    /// Snapshot identity for per-reader caches.
    pub fn generation(&self) -> u64 {
        self.shared.snapshot.generation
    }

    /// One past the highest document number in this snapshot.
    pub fn max_doc(&self) -> u32 {
        self.shared.snapshot.max_doc
    }

    /// True when `doc` was deleted before this snapshot was captured.
    pub fn is_deleted(&self, doc: u32) -> bool {
        self.shared.snapshot.deleted.get(doc as usize)
    }

    /// The node a live document stands for.
    pub fn node_of(&self, doc: u32) -> Option<NodeId> {
        if self.is_deleted(doc) {
            return None;
        }
        self.shared.snapshot.doc_nodes.get(doc as usize).copied()
    }

    /// Enumerates the terms of `field` in order, starting at `from`
    /// (inclusive) when given. Deleted documents are filtered out of the
    /// posting lists.
    pub fn terms<'a>(
        &'a self,
        field: &str,
        from: Option<&'a str>,
    ) -> impl Iterator<Item = (&'a str, Vec<u32>)> + 'a {
        let deleted = &self.shared.snapshot.deleted;
        self.shared
            .snapshot
            .fields
            .get(field)
            .into_iter()
            .flat_map(move |terms| {
                let range = match from {
                    Some(start) => terms.range::<str, _>((
                        Bound::Included(start),
                        Bound::Unbounded,
                    )),
                    None => terms.range::<str, _>((Bound::Unbounded, Bound::Unbounded)),
                };
                range.map(move |(term, docs)| {
                    let live: Vec<u32> = docs
                        .iter()
                        .copied()
                        .filter(|&doc| !deleted.get(doc as usize))
                        .collect();
                    (term.as_str(), live)
                })
            })
    }

    /// The live postings for one exact term.
    pub fn term_docs(&self, field: &str, term: &str) -> Vec<u32> {
        let deleted = &self.shared.snapshot.deleted;
        self.shared
            .snapshot
            .fields
            .get(field)
            .and_then(|terms| terms.get(term))
            .map(|docs| {
                docs.iter()
                    .copied()
                    .filter(|&doc| !deleted.get(doc as usize))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mutator entry point: always fails, the view is read-only.
    pub fn delete_document(&self, _doc: u32) -> Result<()> {
        Err(RepoError::InvalidArgument(
            "read-only index reader".into(),
        ))
    }

    /// Mutator entry point: always fails, the view is read-only.
    pub fn undelete_all(&self) -> Result<()> {
        Err(RepoError::InvalidArgument(
            "read-only index reader".into(),
        ))
    }

    /// Releases this reference; the last one closes the shared reader.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ReadOnlyIndexReader {
    fn drop(&mut self) {
        if self.shared.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            trace!(
                generation = self.shared.snapshot.generation,
                "index.reader.closed"
            );
        }
    }
}
