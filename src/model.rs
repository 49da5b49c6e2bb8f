//! Identifiers, names, and paths for repository items.
//!
//! # Key Types
//!
//! - [`NodeId`] - 128-bit globally unique node identifier
//! - [`PropertyId`] - a `(NodeId, Name)` pair addressing one property
//! - [`ItemId`] - discriminated union of the two
//! - [`Name`] - a `(namespace URI, local name)` pair
//! - [`Path`] - a sequence of path elements with same-name-sibling indices
//!
//! Names are interned by string index when persisted; in memory they are
//! plain owned strings. Paths may be absolute or relative; `.` and `..`
//! steps are resolved by [`Path::normalize`].

use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;
use uuid::Uuid;

use crate::error::{RepoError, Result};

/// Globally unique identifier for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generates a fresh random identifier.
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The raw 16-byte representation.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Rebuilds an identifier from its 16-byte representation.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// 32-character lowercase hex form (no hyphens).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    /// Parses the 32-character hex form.
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s)
            .map_err(|_| RepoError::InvalidArgument(format!("malformed node id: {s}")))?;
        let bytes: [u8; 16] = raw
            .try_into()
            .map_err(|_| RepoError::InvalidArgument(format!("node id has wrong length: {s}")))?;
        Ok(Self(Uuid::from_bytes(bytes)))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Identifier of a single property: owning node plus property name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyId {
    /// Node the property lives on.
    pub parent: NodeId,
    /// Property name.
    pub name: Name,
}

impl PropertyId {
    /// Builds a property id.
    pub fn new(parent: NodeId, name: Name) -> Self {
        Self { parent, name }
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.parent, self.name)
    }
}

/// Discriminated item identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ItemId {
    /// A node.
    Node(NodeId),
    /// A property.
    Property(PropertyId),
}

impl ItemId {
    /// True when this id addresses a node.
    pub fn is_node(&self) -> bool {
        matches!(self, ItemId::Node(_))
    }

    /// The node id, when this addresses a node.
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            ItemId::Node(id) => Some(*id),
            ItemId::Property(_) => None,
        }
    }

    /// The id of the node this item lives on: the node itself, or the
    /// property's parent.
    pub fn hosting_node(&self) -> NodeId {
        match self {
            ItemId::Node(id) => *id,
            ItemId::Property(pid) => pid.parent,
        }
    }
}

impl From<NodeId> for ItemId {
    fn from(id: NodeId) -> Self {
        ItemId::Node(id)
    }
}

impl From<PropertyId> for ItemId {
    fn from(id: PropertyId) -> Self {
        ItemId::Property(id)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Node(id) => write!(f, "{id}"),
            ItemId::Property(id) => write!(f, "{id}"),
        }
    }
}

/// Well-known namespace URIs.
pub mod ns {
    /// The `jcr` namespace.
    pub const JCR: &str = "http://www.jcp.org/jcr/1.0";
    /// The `nt` (node type) namespace.
    pub const NT: &str = "http://www.jcp.org/jcr/nt/1.0";
    /// The `mix` (mixin) namespace.
    pub const MIX: &str = "http://www.jcp.org/jcr/mix/1.0";
    /// The internal repository namespace.
    pub const REP: &str = "internal";
    /// The empty (default) namespace.
    pub const DEFAULT: &str = "";
}

/// A qualified name: namespace URI plus local name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name {
    /// Namespace URI. Empty for the default namespace.
    pub ns: String,
    /// Local part.
    pub local: String,
}

impl Name {
    /// Builds a qualified name.
    pub fn new(ns: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            local: local.into(),
        }
    }

    /// A name in the default (empty) namespace.
    pub fn plain(local: impl Into<String>) -> Self {
        Self::new(ns::DEFAULT, local)
    }

    /// `jcr:primaryType`. Synthesized, never persisted in a bundle.
    pub fn jcr_primary_type() -> Self {
        Self::new(ns::JCR, "primaryType")
    }

    /// `jcr:mixinTypes`. Synthesized, never persisted in a bundle.
    pub fn jcr_mixin_types() -> Self {
        Self::new(ns::JCR, "mixinTypes")
    }

    /// `jcr:uuid`. Synthesized, never persisted in a bundle.
    pub fn jcr_uuid() -> Self {
        Self::new(ns::JCR, "uuid")
    }

    /// `jcr:isCheckedOut`, the versioning gate consulted on write.
    pub fn jcr_is_checked_out() -> Self {
        Self::new(ns::JCR, "isCheckedOut")
    }

    /// `nt:unstructured`.
    pub fn nt_unstructured() -> Self {
        Self::new(ns::NT, "unstructured")
    }

    /// `nt:folder`.
    pub fn nt_folder() -> Self {
        Self::new(ns::NT, "folder")
    }

    /// `mix:referenceable`.
    pub fn mix_referenceable() -> Self {
        Self::new(ns::MIX, "referenceable")
    }

    /// `rep:root`, the primary type of the repository root.
    pub fn rep_root() -> Self {
        Self::new(ns::REP, "root")
    }

    /// `rep:policy`, the access-control subtree marker.
    pub fn rep_policy() -> Self {
        Self::new(ns::REP, "policy")
    }

    /// True for the three properties synthesized from node fields.
    pub fn is_synthesized(&self) -> bool {
        self.ns == ns::JCR
            && matches!(self.local.as_str(), "primaryType" | "mixinTypes" | "uuid")
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ns.is_empty() {
            write!(f, "{}", self.local)
        } else {
            write!(f, "{{{}}}{}", self.ns, self.local)
        }
    }
}

/// One step of a [`Path`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathElement {
    /// The root marker. Only legal as the first element.
    Root,
    /// `.`, the current item.
    Current,
    /// `..`, the parent item.
    Parent,
    /// A named step with a 1-based same-name-sibling index.
    Named {
        /// Step name.
        name: Name,
        /// 1-based index among same-named siblings. 1 when unspecified.
        index: u32,
    },
}

impl PathElement {
    /// A named step with the default index.
    pub fn named(name: Name) -> Self {
        PathElement::Named { name, index: 1 }
    }

    /// A named step with an explicit same-name-sibling index.
    pub fn indexed(name: Name, index: u32) -> Self {
        debug_assert!(index >= 1, "same-name-sibling indices are 1-based");
        PathElement::Named { name, index }
    }
}

/// An absolute or relative item path.
///
/// Same-name siblings are distinguished by dense 1-based indices; an index
/// of 1 is omitted from the textual form (`/a/b` ≡ `/a/b[1]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Path {
    elements: SmallVec<[PathElement; 8]>,
}

impl Path {
    /// The root path `/`.
    pub fn root() -> Self {
        let mut elements = SmallVec::new();
        elements.push(PathElement::Root);
        Self { elements }
    }

    /// Builds a path from raw elements. The element sequence must be
    /// non-empty and `Root` may only appear first.
    pub fn from_elements(elements: impl IntoIterator<Item = PathElement>) -> Result<Self> {
        let elements: SmallVec<[PathElement; 8]> = elements.into_iter().collect();
        if elements.is_empty() {
            return Err(RepoError::InvalidArgument("empty path".into()));
        }
        for (i, el) in elements.iter().enumerate() {
            if matches!(el, PathElement::Root) && i != 0 {
                return Err(RepoError::InvalidArgument(
                    "root marker inside a path".into(),
                ));
            }
        }
        Ok(Self { elements })
    }

    /// True when the path starts at the root.
    pub fn is_absolute(&self) -> bool {
        matches!(self.elements.first(), Some(PathElement::Root))
    }

    /// True for the bare root path.
    pub fn is_root(&self) -> bool {
        self.elements.len() == 1 && self.is_absolute()
    }

    /// The elements of this path.
    pub fn elements(&self) -> &[PathElement] {
        &self.elements
    }

    /// Number of named steps below the root. The root itself has depth 0.
    pub fn depth(&self) -> usize {
        self.elements
            .iter()
            .filter(|el| matches!(el, PathElement::Named { .. }))
            .count()
    }

    /// The final named step, if any.
    pub fn last_name(&self) -> Option<(&Name, u32)> {
        match self.elements.last() {
            Some(PathElement::Named { name, index }) => Some((name, *index)),
            _ => None,
        }
    }

    /// The parent path, or `None` for the root or a single-element
    /// relative path.
    pub fn parent(&self) -> Option<Path> {
        if self.elements.len() <= 1 {
            return None;
        }
        let mut elements = self.elements.clone();
        elements.pop();
        Some(Path { elements })
    }

    /// Appends a named step.
    pub fn child(&self, name: Name) -> Path {
        self.child_indexed(name, 1)
    }

    /// Appends a named step with an explicit same-name-sibling index.
    pub fn child_indexed(&self, name: Name, index: u32) -> Path {
        let mut elements = self.elements.clone();
        elements.push(PathElement::indexed(name, index));
        Path { elements }
    }

    /// Joins a relative path onto this one and normalizes the result.
    pub fn join(&self, relative: &Path) -> Result<Path> {
        if relative.is_absolute() {
            return Err(RepoError::InvalidArgument(
                "cannot join an absolute path".into(),
            ));
        }
        let mut elements = self.elements.clone();
        elements.extend(relative.elements.iter().cloned());
        Path { elements }.normalize()
    }

    /// Resolves `.` and `..` steps. Fails when `..` would climb above the
    /// root of an absolute path.
    pub fn normalize(&self) -> Result<Path> {
        let mut out: SmallVec<[PathElement; 8]> = SmallVec::new();
        for el in &self.elements {
            match el {
                PathElement::Current => {}
                PathElement::Parent => match out.last() {
                    Some(PathElement::Named { .. }) => {
                        out.pop();
                    }
                    Some(PathElement::Root) => {
                        return Err(RepoError::InvalidArgument(
                            "path climbs above the root".into(),
                        ));
                    }
                    _ => out.push(PathElement::Parent),
                },
                other => out.push(other.clone()),
            }
        }
        if out.is_empty() {
            out.push(PathElement::Current);
        }
        Ok(Path { elements: out })
    }

    /// The ancestor `degree` levels up (0 = self, 1 = parent, …).
    pub fn ancestor(&self, degree: usize) -> Result<Path> {
        let mut current = self.clone();
        for _ in 0..degree {
            current = current
                .parent()
                .ok_or_else(|| RepoError::InvalidArgument("no such ancestor".into()))?;
        }
        Ok(current)
    }

    /// True when `self` is a proper ancestor of `other` (both absolute and
    /// normalized).
    pub fn is_ancestor_of(&self, other: &Path) -> bool {
        if !self.is_absolute() || !other.is_absolute() {
            return false;
        }
        if self.elements.len() >= other.elements.len() {
            return false;
        }
        other.elements[..self.elements.len()] == self.elements[..]
    }
}

impl FromStr for Path {
    type Err = RepoError;

    /// Parses the diagnostic textual form: `/a/b[2]/c`, `../d`, `.`.
    ///
    /// Names parse into the default namespace unless written in the
    /// expanded `{uri}local` form.
    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(RepoError::InvalidArgument("empty path".into()));
        }
        let mut elements: SmallVec<[PathElement; 8]> = SmallVec::new();
        let mut rest = s;
        if let Some(stripped) = rest.strip_prefix('/') {
            elements.push(PathElement::Root);
            rest = stripped;
        }
        for segment in rest.split('/') {
            if segment.is_empty() {
                if rest.is_empty() {
                    break;
                }
                return Err(RepoError::InvalidArgument(format!(
                    "empty path segment in {s:?}"
                )));
            }
            elements.push(parse_segment(segment, s)?);
        }
        Path::from_elements(elements)
    }
}

fn parse_segment(segment: &str, whole: &str) -> Result<PathElement> {
    match segment {
        "." => return Ok(PathElement::Current),
        ".." => return Ok(PathElement::Parent),
        _ => {}
    }
    let (raw_name, index) = match segment.find('[') {
        Some(open) => {
            let close = segment
                .rfind(']')
                .filter(|&c| c == segment.len() - 1 && c > open)
                .ok_or_else(|| {
                    RepoError::InvalidArgument(format!("malformed index in {whole:?}"))
                })?;
            let idx: u32 = segment[open + 1..close]
                .parse()
                .map_err(|_| RepoError::InvalidArgument(format!("malformed index in {whole:?}")))?;
            if idx == 0 {
                return Err(RepoError::InvalidArgument(
                    "same-name-sibling indices are 1-based".into(),
                ));
            }
            (&segment[..open], idx)
        }
        None => (segment, 1),
    };
    if raw_name.is_empty() {
        return Err(RepoError::InvalidArgument(format!(
            "empty name in {whole:?}"
        )));
    }
    let name = if let Some(rest) = raw_name.strip_prefix('{') {
        let close = rest
            .find('}')
            .ok_or_else(|| RepoError::InvalidArgument(format!("malformed name in {whole:?}")))?;
        Name::new(&rest[..close], &rest[close + 1..])
    } else {
        Name::plain(raw_name)
    };
    Ok(PathElement::indexed(name, index))
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return write!(f, "/");
        }
        let mut needs_sep = false;
        for el in &self.elements {
            match el {
                PathElement::Root => {
                    write!(f, "/")?;
                    needs_sep = false;
                }
                PathElement::Current => {
                    if needs_sep {
                        write!(f, "/")?;
                    }
                    write!(f, ".")?;
                    needs_sep = true;
                }
                PathElement::Parent => {
                    if needs_sep {
                        write!(f, "/")?;
                    }
                    write!(f, "..")?;
                    needs_sep = true;
                }
                PathElement::Named { name, index } => {
                    if needs_sep {
                        write!(f, "/")?;
                    }
                    write!(f, "{name}")?;
                    if *index > 1 {
                        write!(f, "[{index}]")?;
                    }
                    needs_sep = true;
                }
            }
        }
        Ok(())
    }
}
