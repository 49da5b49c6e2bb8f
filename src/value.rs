//! Typed property values.

use std::fmt;

use time::OffsetDateTime;

use crate::error::{RepoError, Result};
use crate::model::{Name, NodeId, Path};

/// Content address of an externally stored binary (lowercase blake3 hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobId(pub String);

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The property type system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    String,
    Binary,
    Long,
    Double,
    Date,
    Boolean,
    Name,
    Path,
    Reference,
    WeakReference,
    Uri,
    Decimal,
}

impl PropertyKind {
    /// Stable one-byte wire tag.
    pub fn tag(self) -> u8 {
        match self {
            PropertyKind::String => 1,
            PropertyKind::Binary => 2,
            PropertyKind::Long => 3,
            PropertyKind::Double => 4,
            PropertyKind::Date => 5,
            PropertyKind::Boolean => 6,
            PropertyKind::Name => 7,
            PropertyKind::Path => 8,
            PropertyKind::Reference => 9,
            PropertyKind::WeakReference => 10,
            PropertyKind::Uri => 11,
            PropertyKind::Decimal => 12,
        }
    }

    /// Inverse of [`PropertyKind::tag`].
    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => PropertyKind::String,
            2 => PropertyKind::Binary,
            3 => PropertyKind::Long,
            4 => PropertyKind::Double,
            5 => PropertyKind::Date,
            6 => PropertyKind::Boolean,
            7 => PropertyKind::Name,
            8 => PropertyKind::Path,
            9 => PropertyKind::Reference,
            10 => PropertyKind::WeakReference,
            11 => PropertyKind::Uri,
            12 => PropertyKind::Decimal,
            other => {
                return Err(RepoError::Corruption(format!(
                    "unknown property type tag: 0x{other:02X}"
                )))
            }
        })
    }
}

/// A binary value: inlined in the bundle, or a reference into the
/// content-addressed data store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryValue {
    /// Bytes stored directly in the owning bundle.
    Inline(Vec<u8>),
    /// Reference to a blob in the data store.
    External(BlobId),
}

/// A type-tagged leaf value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Binary(BinaryValue),
    Long(i64),
    Double(f64),
    /// Persisted as unix milliseconds.
    Date(OffsetDateTime),
    Boolean(bool),
    Name(Name),
    Path(Path),
    Reference(NodeId),
    WeakReference(NodeId),
    Uri(String),
    /// Canonical textual form; no big-decimal arithmetic is performed.
    Decimal(String),
}

impl Value {
    /// The type of this value.
    pub fn kind(&self) -> PropertyKind {
        match self {
            Value::String(_) => PropertyKind::String,
            Value::Binary(_) => PropertyKind::Binary,
            Value::Long(_) => PropertyKind::Long,
            Value::Double(_) => PropertyKind::Double,
            Value::Date(_) => PropertyKind::Date,
            Value::Boolean(_) => PropertyKind::Boolean,
            Value::Name(_) => PropertyKind::Name,
            Value::Path(_) => PropertyKind::Path,
            Value::Reference(_) => PropertyKind::Reference,
            Value::WeakReference(_) => PropertyKind::WeakReference,
            Value::Uri(_) => PropertyKind::Uri,
            Value::Decimal(_) => PropertyKind::Decimal,
        }
    }

    /// The strong reference target, for `REFERENCE` values.
    pub fn reference_target(&self) -> Option<NodeId> {
        match self {
            Value::Reference(id) => Some(*id),
            _ => None,
        }
    }

    /// Textual form used for indexing and diagnostics.
    pub fn to_index_term(&self) -> String {
        match self {
            Value::String(s) | Value::Uri(s) | Value::Decimal(s) => s.clone(),
            Value::Binary(_) => String::new(),
            Value::Long(v) => v.to_string(),
            Value::Double(v) => v.to_string(),
            Value::Date(v) => (v.unix_timestamp_nanos() / 1_000_000).to_string(),
            Value::Boolean(v) => v.to_string(),
            Value::Name(n) => n.to_string(),
            Value::Path(p) => p.to_string(),
            Value::Reference(id) | Value::WeakReference(id) => id.to_hex(),
        }
    }

    /// Rough resident size, used for cache accounting.
    pub fn memory_footprint(&self) -> usize {
        let payload = match self {
            Value::String(s) | Value::Uri(s) | Value::Decimal(s) => s.len(),
            Value::Binary(BinaryValue::Inline(b)) => b.len(),
            Value::Binary(BinaryValue::External(id)) => id.0.len(),
            Value::Name(n) => n.ns.len() + n.local.len(),
            Value::Path(p) => p.elements().len() * 24,
            _ => 8,
        };
        payload + std::mem::size_of::<Value>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn kind_tags_round_trip() {
        for kind in [
            PropertyKind::String,
            PropertyKind::Binary,
            PropertyKind::Long,
            PropertyKind::Double,
            PropertyKind::Date,
            PropertyKind::Boolean,
            PropertyKind::Name,
            PropertyKind::Path,
            PropertyKind::Reference,
            PropertyKind::WeakReference,
            PropertyKind::Uri,
            PropertyKind::Decimal,
        ] {
            assert_eq!(PropertyKind::from_tag(kind.tag()).expect("tag"), kind);
        }
        assert!(PropertyKind::from_tag(0).is_err());
        assert!(PropertyKind::from_tag(13).is_err());
    }

    #[test]
    fn date_index_term_is_millis() {
        let v = Value::Date(datetime!(2020-01-01 00:00:00 UTC));
        assert_eq!(v.to_index_term(), "1577836800000");
    }
}
