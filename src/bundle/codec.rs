//! Versioned binary codec for [`NodePropBundle`] records.
//!
//! The first byte is the format version. `VERSION_1` records (no shared-set
//! section) are still readable; writers always emit `VERSION_2`. Names are
//! persisted as `(ns_index, name_index)` varint pairs against the workspace
//! string indices.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use time::OffsetDateTime;

use crate::bundle::{ChildEntry, NodePropBundle, NodeReferences, PropertyEntry, sns_index};
use crate::error::{RepoError, Result};
use crate::interner::StringIndex;
use crate::model::{Name, NodeId, Path, PropertyId};
use crate::value::{BinaryValue, BlobId, PropertyKind, Value};

/// Legacy format without the shared-set section.
pub const VERSION_1: u8 = 1;
/// Current format.
pub const VERSION_2: u8 = 2;

const BINARY_INLINE: u8 = 0;
const BINARY_EXTERNAL: u8 = 1;

/// Bundle encoder/decoder bound to the workspace string indices.
pub struct BundleCodec {
    namespaces: Arc<StringIndex>,
    names: Arc<StringIndex>,
}

impl BundleCodec {
    /// Builds a codec over the two workspace indices.
    pub fn new(namespaces: Arc<StringIndex>, names: Arc<StringIndex>) -> Self {
        Self { namespaces, names }
    }

    /// Serializes a bundle in the current format.
    pub fn encode(&self, bundle: &NodePropBundle) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(256);
        buf.push(VERSION_2);

        match bundle.parent_id {
            Some(parent) => {
                buf.push(1);
                buf.extend_from_slice(parent.as_bytes());
            }
            None => buf.push(0),
        }
        self.write_name(&mut buf, &bundle.primary_type)?;
        buf.extend_from_slice(&bundle.mod_count.to_le_bytes());

        write_varint(&mut buf, bundle.mixins.len() as u64);
        for mixin in &bundle.mixins {
            self.write_name(&mut buf, mixin)?;
        }

        write_varint(&mut buf, bundle.child_entries.len() as u64);
        for (pos, entry) in bundle.child_entries.iter().enumerate() {
            self.write_name(&mut buf, &entry.name)?;
            buf.extend_from_slice(entry.id.as_bytes());
            buf.extend_from_slice(&sns_index(&bundle.child_entries, pos).to_le_bytes());
        }

        write_varint(&mut buf, bundle.shared_set.len() as u64);
        for id in &bundle.shared_set {
            buf.extend_from_slice(id.as_bytes());
        }

        write_varint(&mut buf, bundle.properties.len() as u64);
        for (name, prop) in &bundle.properties {
            if name.is_synthesized() {
                return Err(RepoError::InvalidArgument(format!(
                    "synthesized property {name} must not be persisted"
                )));
            }
            self.write_name(&mut buf, name)?;
            buf.push(prop.kind.tag());
            buf.push(u8::from(prop.multi_valued));
            buf.extend_from_slice(&prop.mod_count.to_le_bytes());
            write_varint(&mut buf, prop.values.len() as u64);
            for value in &prop.values {
                if value.kind() != prop.kind {
                    return Err(RepoError::InvalidArgument(format!(
                        "property {name} mixes value types"
                    )));
                }
                self.write_value(&mut buf, value)?;
            }
        }

        Ok(buf)
    }

    /// Deserializes a bundle, accepting any supported format version.
    pub fn decode(&self, id: NodeId, bytes: &[u8]) -> Result<NodePropBundle> {
        let mut cursor = Cursor::new(bytes);
        let version = cursor.read_u8()?;
        if version != VERSION_1 && version != VERSION_2 {
            return Err(RepoError::Corruption(format!(
                "unsupported bundle version {version}"
            )));
        }

        let parent_id = match cursor.read_u8()? {
            0 => None,
            1 => Some(NodeId::from_bytes(cursor.read_uuid()?)),
            other => {
                return Err(RepoError::Corruption(format!(
                    "bad parent marker 0x{other:02X}"
                )))
            }
        };
        let primary_type = self.read_name(&mut cursor)?;
        let mod_count = cursor.read_u16()?;

        let mixin_count = cursor.read_varint()? as usize;
        let mut mixins = BTreeSet::new();
        for _ in 0..mixin_count {
            mixins.insert(self.read_name(&mut cursor)?);
        }

        let child_count = cursor.read_varint()? as usize;
        let mut child_entries = Vec::with_capacity(child_count);
        for _ in 0..child_count {
            let name = self.read_name(&mut cursor)?;
            let child = NodeId::from_bytes(cursor.read_uuid()?);
            let _slot = cursor.read_u32()?;
            child_entries.push(ChildEntry::new(name, child));
        }

        let mut shared_set = BTreeSet::new();
        if version >= VERSION_2 {
            let shared_count = cursor.read_varint()? as usize;
            for _ in 0..shared_count {
                shared_set.insert(NodeId::from_bytes(cursor.read_uuid()?));
            }
        }

        let prop_count = cursor.read_varint()? as usize;
        let mut properties = BTreeMap::new();
        for _ in 0..prop_count {
            let name = self.read_name(&mut cursor)?;
            if name.is_synthesized() {
                return Err(RepoError::Corruption(format!(
                    "synthesized property {name} found in bundle"
                )));
            }
            let kind = PropertyKind::from_tag(cursor.read_u8()?)?;
            let multi_valued = match cursor.read_u8()? {
                0 => false,
                1 => true,
                other => {
                    return Err(RepoError::Corruption(format!(
                        "bad multi-valued flag 0x{other:02X}"
                    )))
                }
            };
            let prop_mod_count = cursor.read_u16()?;
            let value_count = cursor.read_varint()? as usize;
            let mut values = Vec::with_capacity(value_count);
            for _ in 0..value_count {
                values.push(self.read_value(&mut cursor, kind)?);
            }
            if properties
                .insert(
                    name.clone(),
                    PropertyEntry {
                        kind,
                        multi_valued,
                        values,
                        mod_count: prop_mod_count,
                    },
                )
                .is_some()
            {
                return Err(RepoError::Corruption(format!(
                    "duplicate property {name} in bundle"
                )));
            }
        }

        cursor.ensure_consumed()?;
        Ok(NodePropBundle {
            id,
            parent_id,
            primary_type,
            mixins,
            child_entries,
            shared_set,
            properties,
            mod_count,
        })
    }

    /// Serializes a reference-index record.
    pub fn encode_refs(&self, refs: &NodeReferences) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(16 + refs.referrers.len() * 24);
        write_varint(&mut buf, refs.referrers.len() as u64);
        for referrer in &refs.referrers {
            buf.extend_from_slice(referrer.parent.as_bytes());
            self.write_name(&mut buf, &referrer.name)?;
        }
        Ok(buf)
    }

    /// Deserializes a reference-index record for `target`.
    pub fn decode_refs(&self, target: NodeId, bytes: &[u8]) -> Result<NodeReferences> {
        let mut cursor = Cursor::new(bytes);
        let count = cursor.read_varint()? as usize;
        let mut refs = NodeReferences::new(target);
        for _ in 0..count {
            let parent = NodeId::from_bytes(cursor.read_uuid()?);
            let name = self.read_name(&mut cursor)?;
            refs.referrers.insert(PropertyId::new(parent, name));
        }
        cursor.ensure_consumed()?;
        Ok(refs)
    }

    fn write_name(&self, buf: &mut Vec<u8>, name: &Name) -> Result<()> {
        let ns = self.namespaces.index(&name.ns)?;
        let local = self.names.index(&name.local)?;
        write_varint(buf, u64::from(ns));
        write_varint(buf, u64::from(local));
        Ok(())
    }

    fn read_name(&self, cursor: &mut Cursor<'_>) -> Result<Name> {
        let ns = u32::try_from(cursor.read_varint()?)
            .map_err(|_| RepoError::Corruption("namespace index overflow".into()))?;
        let local = u32::try_from(cursor.read_varint()?)
            .map_err(|_| RepoError::Corruption("name index overflow".into()))?;
        Ok(Name::new(
            self.namespaces.string(ns)?,
            self.names.string(local)?,
        ))
    }

    fn write_value(&self, buf: &mut Vec<u8>, value: &Value) -> Result<()> {
        match value {
            Value::String(s) | Value::Uri(s) | Value::Decimal(s) => write_string(buf, s),
            Value::Binary(BinaryValue::Inline(bytes)) => {
                buf.push(BINARY_INLINE);
                let len: u32 = bytes.len().try_into().map_err(|_| {
                    RepoError::InvalidArgument("inline binary exceeds u32::MAX".into())
                })?;
                buf.extend_from_slice(&len.to_le_bytes());
                buf.extend_from_slice(bytes);
            }
            Value::Binary(BinaryValue::External(id)) => {
                buf.push(BINARY_EXTERNAL);
                write_string(buf, &id.0);
            }
            Value::Long(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Double(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Date(v) => {
                let millis = (v.unix_timestamp_nanos() / 1_000_000) as i64;
                buf.extend_from_slice(&millis.to_le_bytes());
            }
            Value::Boolean(v) => buf.push(u8::from(*v)),
            Value::Name(name) => self.write_name(buf, name)?,
            Value::Path(path) => write_string(buf, &path.to_string()),
            Value::Reference(id) | Value::WeakReference(id) => {
                buf.extend_from_slice(id.as_bytes())
            }
        }
        Ok(())
    }

    fn read_value(&self, cursor: &mut Cursor<'_>, kind: PropertyKind) -> Result<Value> {
        Ok(match kind {
            PropertyKind::String => Value::String(cursor.read_string()?),
            PropertyKind::Uri => Value::Uri(cursor.read_string()?),
            PropertyKind::Decimal => Value::Decimal(cursor.read_string()?),
            PropertyKind::Binary => match cursor.read_u8()? {
                BINARY_INLINE => {
                    let len = cursor.read_u32()? as usize;
                    Value::Binary(BinaryValue::Inline(cursor.read_exact(len)?.to_vec()))
                }
                BINARY_EXTERNAL => {
                    Value::Binary(BinaryValue::External(BlobId(cursor.read_string()?)))
                }
                other => {
                    return Err(RepoError::Corruption(format!(
                        "bad binary marker 0x{other:02X}"
                    )))
                }
            },
            PropertyKind::Long => Value::Long(cursor.read_i64()?),
            PropertyKind::Double => Value::Double(f64::from_le_bytes(
                cursor
                    .read_exact(8)?
                    .try_into()
                    .expect("slice has exactly 8 bytes"),
            )),
            PropertyKind::Date => {
                let millis = cursor.read_i64()?;
                let nanos = i128::from(millis) * 1_000_000;
                Value::Date(OffsetDateTime::from_unix_timestamp_nanos(nanos).map_err(
                    |_| RepoError::Corruption(format!("date out of range: {millis}")),
                )?)
            }
            PropertyKind::Boolean => match cursor.read_u8()? {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                other => {
                    return Err(RepoError::Corruption(format!(
                        "invalid boolean encoding: {other}"
                    )))
                }
            },
            PropertyKind::Name => Value::Name(self.read_name(cursor)?),
            PropertyKind::Path => {
                let text = cursor.read_string()?;
                Value::Path(text.parse::<Path>().map_err(|_| {
                    RepoError::Corruption(format!("malformed path value: {text}"))
                })?)
            }
            PropertyKind::Reference => Value::Reference(NodeId::from_bytes(cursor.read_uuid()?)),
            PropertyKind::WeakReference => {
                Value::WeakReference(NodeId::from_bytes(cursor.read_uuid()?))
            }
        })
    }
}

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_varint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    data: &'a [u8],
    index: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, index: 0 }
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.index + len > self.data.len() {
            return Err(RepoError::Corruption("unexpected end of bundle".into()));
        }
        let start = self.index;
        self.index += len;
        Ok(&self.data[start..start + len])
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_exact(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes: [u8; 2] = self
            .read_exact(2)?
            .try_into()
            .expect("slice has exactly 2 bytes");
        Ok(u16::from_le_bytes(bytes))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self
            .read_exact(4)?
            .try_into()
            .expect("slice has exactly 4 bytes");
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let bytes: [u8; 8] = self
            .read_exact(8)?
            .try_into()
            .expect("slice has exactly 8 bytes");
        Ok(i64::from_le_bytes(bytes))
    }

    fn read_uuid(&mut self) -> Result<[u8; 16]> {
        Ok(self
            .read_exact(16)?
            .try_into()
            .expect("slice has exactly 16 bytes"))
    }

    fn read_varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(RepoError::Corruption("varint overflow".into()));
            }
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_varint()? as usize;
        let bytes = self.read_exact(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| RepoError::Corruption("invalid UTF-8 string".into()))
    }

    fn ensure_consumed(&self) -> Result<()> {
        if self.index != self.data.len() {
            return Err(RepoError::Corruption(
                "unexpected trailing bytes in bundle".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use time::macros::datetime;

    fn codec(dir: &std::path::Path) -> BundleCodec {
        BundleCodec::new(
            Arc::new(StringIndex::open(dir.join("namespaces.properties")).expect("ns index")),
            Arc::new(StringIndex::open(dir.join("names.properties")).expect("name index")),
        )
    }

    fn sample_bundle() -> NodePropBundle {
        let mut bundle = NodePropBundle::new(
            NodeId::fresh(),
            Some(NodeId::fresh()),
            Name::nt_unstructured(),
        );
        bundle.mod_count = 7;
        bundle.mixins.insert(Name::mix_referenceable());
        bundle
            .child_entries
            .push(ChildEntry::new(Name::plain("foo"), NodeId::fresh()));
        bundle
            .child_entries
            .push(ChildEntry::new(Name::plain("foo"), NodeId::fresh()));
        bundle.shared_set.insert(NodeId::fresh());
        bundle.properties.insert(
            Name::plain("title"),
            PropertyEntry::single(Value::String("hello".into())),
        );
        bundle.properties.insert(
            Name::plain("when"),
            PropertyEntry::single(Value::Date(datetime!(2021-06-01 12:00:00 UTC))),
        );
        bundle.properties.insert(
            Name::plain("tags"),
            PropertyEntry::multi(
                PropertyKind::String,
                vec![Value::String("a".into()), Value::String("b".into())],
            ),
        );
        bundle.properties.insert(
            Name::plain("payload"),
            PropertyEntry::single(Value::Binary(BinaryValue::Inline(vec![1, 2, 3]))),
        );
        bundle.properties.insert(
            Name::plain("blob"),
            PropertyEntry::single(Value::Binary(BinaryValue::External(BlobId(
                "ab".repeat(32),
            )))),
        );
        bundle
    }

    #[test]
    fn bundle_round_trip() {
        let dir = tempdir().expect("tempdir");
        let codec = codec(dir.path());
        let bundle = sample_bundle();
        let encoded = codec.encode(&bundle).expect("encode");
        assert_eq!(encoded[0], VERSION_2);
        let decoded = codec.decode(bundle.id, &encoded).expect("decode");
        assert_eq!(bundle, decoded);
    }

    #[test]
    fn synthesized_properties_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let codec = codec(dir.path());
        let mut bundle = sample_bundle();
        bundle.properties.insert(
            Name::jcr_uuid(),
            PropertyEntry::single(Value::String("x".into())),
        );
        assert!(matches!(
            codec.encode(&bundle),
            Err(RepoError::InvalidArgument(_))
        ));
    }

    #[test]
    fn trailing_bytes_are_corruption() {
        let dir = tempdir().expect("tempdir");
        let codec = codec(dir.path());
        let bundle = sample_bundle();
        let mut encoded = codec.encode(&bundle).expect("encode");
        encoded.extend_from_slice(&[0, 1]);
        assert!(matches!(
            codec.decode(bundle.id, &encoded),
            Err(RepoError::Corruption(_))
        ));
    }

    #[test]
    fn unknown_version_is_corruption() {
        let dir = tempdir().expect("tempdir");
        let codec = codec(dir.path());
        let bundle = sample_bundle();
        let mut encoded = codec.encode(&bundle).expect("encode");
        encoded[0] = 9;
        assert!(matches!(
            codec.decode(bundle.id, &encoded),
            Err(RepoError::Corruption(_))
        ));
    }

    #[test]
    fn version_one_without_shared_set_still_decodes() {
        let dir = tempdir().expect("tempdir");
        let codec = codec(dir.path());

        // A bare V2 record ends with the four zero varints for mixins,
        // children, shared set and properties. The equivalent V1 record
        // has no shared-set section, so it is the same bytes minus one
        // trailing zero and with the version byte rewritten.
        let bare = NodePropBundle::new(NodeId::fresh(), None, Name::nt_unstructured());
        let mut legacy = codec.encode(&bare).expect("encode");
        legacy[0] = VERSION_1;
        legacy.pop();

        let decoded = codec.decode(bare.id, &legacy).expect("decode v1");
        assert_eq!(decoded.primary_type, bare.primary_type);
        assert!(decoded.shared_set.is_empty());
        assert!(decoded.properties.is_empty());
    }
}
