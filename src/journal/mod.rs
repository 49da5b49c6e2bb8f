//! Append-only cluster journal.
//!
//! Every durable update is framed into `journal.log` as
//! `creator (u16-len UTF-8) | payload-len i32 | payload | crc32`, the
//! payload dispatching on a 1-byte kind identifier. The revision of a
//! record is the file offset immediately after it, so revisions are
//! monotone and recoverable by scanning. At most one writer appends at a
//! time, serialized by an exclusive lock file; replicas scan records
//! strictly above their local cursor in ascending order and apply foreign
//! records through `SharedItemStateManager::external_update`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path as FsPath, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{RepoError, Result};
use crate::model::{Name, NodeId, Path, PropertyId};
use crate::nodetype::NodeTypeDef;
use crate::state::changelog::{ChangeLog, ChangeOp};
use crate::state::{ItemState, ItemStatus, NodeState, PropertyState};
use crate::value::{BinaryValue, BlobId, PropertyKind, Value};

pub mod lockfile;

use lockfile::JournalLock;

const KIND_CHANGES: u8 = b'C';
const KIND_NODE_TYPE: u8 = b'T';
const KIND_NAMESPACE: u8 = b'N';
const KIND_PRIVILEGE: u8 = b'P';
const KIND_LOCK: u8 = b'L';
const KIND_UNLOCK: u8 = b'U';

/// One journalled event.
#[derive(Debug, Clone)]
pub enum JournalRecord {
    /// A committed workspace change set.
    Changes(ChangeLog),
    /// A node-type (re)registration.
    NodeType(NodeTypeDef),
    /// A namespace registration.
    Namespace {
        /// Registered prefix.
        prefix: String,
        /// Namespace URI.
        uri: String,
    },
    /// A custom privilege registration.
    Privilege {
        /// Privilege name.
        name: String,
    },
    /// A cluster-visible lock acquisition.
    Lock {
        /// Locked node.
        node: NodeId,
        /// Deep flag.
        deep: bool,
        /// Lock owner.
        owner: String,
    },
    /// A cluster-visible lock release.
    Unlock {
        /// Unlocked node.
        node: NodeId,
    },
}

/// File-backed journal for one cluster directory.
pub struct FileJournal {
    dir: PathBuf,
    creator: String,
    cursor: Mutex<u64>,
}

impl FileJournal {
    const LOG: &'static str = "journal.log";
    const LOCK: &'static str = "journal.lock";

    /// Opens (or creates) the journal under `dir` for `creator`.
    pub fn open(dir: impl AsRef<FsPath>, creator: impl Into<String>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            creator: creator.into(),
            cursor: Mutex::new(0),
        })
    }

    /// This journal's creator string.
    pub fn creator(&self) -> &str {
        &self.creator
    }

    /// The local replay cursor.
    pub fn revision(&self) -> u64 {
        *self.cursor.lock()
    }

    /// Appends a record and returns its revision. Serializes against
    /// other writers through the journal lock file.
    pub fn append(&self, record: &JournalRecord) -> Result<u64> {
        let _lock = JournalLock::acquire(self.dir.join(Self::LOCK))?;
        let payload = encode_record(record)?;
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(self.dir.join(Self::LOG))?;

        let creator = self.creator.as_bytes();
        let creator_len: u16 = creator
            .len()
            .try_into()
            .map_err(|_| RepoError::InvalidArgument("creator string too long".into()))?;
        let payload_len: i32 = payload
            .len()
            .try_into()
            .map_err(|_| RepoError::InvalidArgument("journal payload too large".into()))?;

        let mut frame = Vec::with_capacity(2 + creator.len() + 4 + payload.len() + 4);
        frame.extend_from_slice(&creator_len.to_le_bytes());
        frame.extend_from_slice(creator);
        frame.extend_from_slice(&payload_len.to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc32fast::hash(&frame).to_le_bytes());

        file.seek(SeekFrom::End(0))?;
        file.write_all(&frame)?;
        file.sync_data()?;
        let revision = file.metadata()?.len();
        debug!(revision, kind = payload.first().copied().unwrap_or(0), "journal.append");
        Ok(revision)
    }

    /// Scans records strictly above the local cursor, feeding every
    /// foreign record (creator differs from ours) to `apply` in ascending
    /// revision order, then advances the cursor. Returns how many records
    /// were applied.
    pub fn sync_with(
        &self,
        mut apply: impl FnMut(&str, JournalRecord) -> Result<()>,
    ) -> Result<usize> {
        let mut cursor = self.cursor.lock();
        let path = self.dir.join(Self::LOG);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let len = file.metadata()?.len();
        let mut offset = *cursor;
        let mut applied = 0usize;

        while offset < len {
            let (creator, payload, next) = match read_frame(&mut file, offset, len)? {
                Some(frame) => frame,
                None => {
                    warn!(offset, "journal.torn_tail");
                    break;
                }
            };
            let record = decode_record(&payload)?;
            if creator != self.creator {
                apply(&creator, record)?;
                applied += 1;
            } else {
                trace!(offset, "journal.skip_own");
            }
            offset = next;
            *cursor = offset;
        }
        Ok(applied)
    }
}

fn read_frame(file: &mut File, offset: u64, len: u64) -> Result<Option<(String, Vec<u8>, u64)>> {
    if offset + 2 > len {
        return Ok(None);
    }
    file.seek(SeekFrom::Start(offset))?;
    let mut small = [0u8; 2];
    file.read_exact(&mut small)?;
    let creator_len = u16::from_le_bytes(small) as u64;
    if offset + 2 + creator_len + 4 > len {
        return Ok(None);
    }
    let mut creator = vec![0u8; creator_len as usize];
    file.read_exact(&mut creator)?;
    let mut lenbuf = [0u8; 4];
    file.read_exact(&mut lenbuf)?;
    let payload_len = i32::from_le_bytes(lenbuf);
    if payload_len < 0 {
        return Err(RepoError::Corruption("negative journal payload length".into()));
    }
    let payload_len = payload_len as u64;
    let next = offset + 2 + creator_len + 4 + payload_len + 4;
    if next > len {
        return Ok(None);
    }
    let mut payload = vec![0u8; payload_len as usize];
    file.read_exact(&mut payload)?;
    let mut crcbuf = [0u8; 4];
    file.read_exact(&mut crcbuf)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&small);
    hasher.update(&creator);
    hasher.update(&lenbuf);
    hasher.update(&payload);
    if hasher.finalize() != u32::from_le_bytes(crcbuf) {
        return Err(RepoError::Corruption("journal record checksum mismatch".into()));
    }

    let creator = String::from_utf8(creator)
        .map_err(|_| RepoError::Corruption("journal creator is not UTF-8".into()))?;
    Ok(Some((creator, payload, next)))
}

// ---------------------------------------------------------------------------
// Record payload codec. Unlike bundles, journal payloads are fully
// self-describing: names travel as strings, not interner indices, because
// replicas keep independent string indices.

fn encode_record(record: &JournalRecord) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    match record {
        JournalRecord::Changes(log) => {
            buf.push(KIND_CHANGES);
            encode_change_log(&mut buf, log)?;
        }
        JournalRecord::NodeType(def) => {
            buf.push(KIND_NODE_TYPE);
            buf.extend_from_slice(&def.encode());
        }
        JournalRecord::Namespace { prefix, uri } => {
            buf.push(KIND_NAMESPACE);
            put_str(&mut buf, prefix);
            put_str(&mut buf, uri);
        }
        JournalRecord::Privilege { name } => {
            buf.push(KIND_PRIVILEGE);
            put_str(&mut buf, name);
        }
        JournalRecord::Lock { node, deep, owner } => {
            buf.push(KIND_LOCK);
            buf.extend_from_slice(node.as_bytes());
            buf.push(u8::from(*deep));
            put_str(&mut buf, owner);
        }
        JournalRecord::Unlock { node } => {
            buf.push(KIND_UNLOCK);
            buf.extend_from_slice(node.as_bytes());
        }
    }
    Ok(buf)
}

fn decode_record(payload: &[u8]) -> Result<JournalRecord> {
    let mut r = Reader::new(payload);
    let kind = r.u8()?;
    let record = match kind {
        KIND_CHANGES => JournalRecord::Changes(decode_change_log(&mut r)?),
        KIND_NODE_TYPE => JournalRecord::NodeType(NodeTypeDef::decode(r.rest())?),
        KIND_NAMESPACE => {
            let prefix = r.str()?;
            let uri = r.str()?;
            r.done()?;
            JournalRecord::Namespace { prefix, uri }
        }
        KIND_PRIVILEGE => {
            let name = r.str()?;
            r.done()?;
            JournalRecord::Privilege { name }
        }
        KIND_LOCK => {
            let node = NodeId::from_bytes(r.uuid()?);
            let deep = r.u8()? != 0;
            let owner = r.str()?;
            r.done()?;
            JournalRecord::Lock { node, deep, owner }
        }
        KIND_UNLOCK => {
            let node = NodeId::from_bytes(r.uuid()?);
            r.done()?;
            JournalRecord::Unlock { node }
        }
        other => {
            return Err(RepoError::Corruption(format!(
                "unknown journal record kind 0x{other:02X}"
            )))
        }
    };
    Ok(record)
}

fn encode_change_log(buf: &mut Vec<u8>, log: &ChangeLog) -> Result<()> {
    buf.extend_from_slice(&(log.len() as u32).to_le_bytes());
    for (op, state) in log.iter() {
        buf.push(match op {
            ChangeOp::Added => b'a',
            ChangeOp::Modified => b'm',
            ChangeOp::Deleted => b'd',
        });
        match state {
            ItemState::Node(node) => {
                buf.push(b'n');
                encode_node_state(buf, node);
            }
            ItemState::Property(prop) => {
                buf.push(b'p');
                encode_property_state(buf, prop)?;
            }
        }
    }
    Ok(())
}

fn decode_change_log(r: &mut Reader<'_>) -> Result<ChangeLog> {
    let count = r.u32()? as usize;
    let mut log = ChangeLog::new();
    for _ in 0..count {
        let op = r.u8()?;
        let marker = r.u8()?;
        let state = match marker {
            b'n' => ItemState::Node(decode_node_state(r, op)?),
            b'p' => ItemState::Property(decode_property_state(r, op)?),
            other => {
                return Err(RepoError::Corruption(format!(
                    "unknown state marker 0x{other:02X}"
                )))
            }
        };
        match op {
            b'a' => log.added(state),
            b'm' => log.modified(state),
            b'd' => log.deleted(state),
            other => {
                return Err(RepoError::Corruption(format!(
                    "unknown change op 0x{other:02X}"
                )))
            }
        }
    }
    r.done()?;
    Ok(log)
}

fn status_for(op: u8) -> ItemStatus {
    match op {
        b'a' => ItemStatus::Existing,
        b'd' => ItemStatus::ExistingRemoved,
        _ => ItemStatus::ExistingModified,
    }
}

fn encode_node_state(buf: &mut Vec<u8>, node: &NodeState) {
    buf.extend_from_slice(node.id.as_bytes());
    match node.parent_id {
        Some(parent) => {
            buf.push(1);
            buf.extend_from_slice(parent.as_bytes());
        }
        None => buf.push(0),
    }
    put_name(buf, &node.primary_type);
    buf.extend_from_slice(&(node.mixins.len() as u16).to_le_bytes());
    for mixin in &node.mixins {
        put_name(buf, mixin);
    }
    buf.extend_from_slice(&(node.child_entries.len() as u32).to_le_bytes());
    for entry in &node.child_entries {
        put_name(buf, &entry.name);
        buf.extend_from_slice(entry.id.as_bytes());
    }
    buf.extend_from_slice(&(node.shared_set.len() as u16).to_le_bytes());
    for id in &node.shared_set {
        buf.extend_from_slice(id.as_bytes());
    }
    buf.extend_from_slice(&(node.property_names.len() as u32).to_le_bytes());
    for name in &node.property_names {
        put_name(buf, name);
    }
}

fn decode_node_state(r: &mut Reader<'_>, op: u8) -> Result<NodeState> {
    let id = NodeId::from_bytes(r.uuid()?);
    let parent_id = match r.u8()? {
        0 => None,
        _ => Some(NodeId::from_bytes(r.uuid()?)),
    };
    let primary_type = r.name()?;
    let mut node = NodeState::new(id, parent_id, primary_type);
    node.status = status_for(op);
    for _ in 0..r.u16()? {
        node.mixins.insert(r.name()?);
    }
    let children = r.u32()? as usize;
    for _ in 0..children {
        let name = r.name()?;
        let child = NodeId::from_bytes(r.uuid()?);
        node.add_child(name, child);
    }
    for _ in 0..r.u16()? {
        node.shared_set.insert(NodeId::from_bytes(r.uuid()?));
    }
    let props = r.u32()? as usize;
    for _ in 0..props {
        node.property_names.insert(r.name()?);
    }
    Ok(node)
}

fn encode_property_state(buf: &mut Vec<u8>, prop: &PropertyState) -> Result<()> {
    buf.extend_from_slice(prop.id.parent.as_bytes());
    put_name(buf, &prop.id.name);
    buf.push(prop.kind.tag());
    buf.push(u8::from(prop.multi_valued));
    buf.extend_from_slice(&(prop.values.len() as u32).to_le_bytes());
    for value in &prop.values {
        encode_value(buf, value)?;
    }
    Ok(())
}

fn decode_property_state(r: &mut Reader<'_>, op: u8) -> Result<PropertyState> {
    let parent = NodeId::from_bytes(r.uuid()?);
    let name = r.name()?;
    let kind = PropertyKind::from_tag(r.u8()?)?;
    let multi_valued = r.u8()? != 0;
    let count = r.u32()? as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(decode_value(r, kind)?);
    }
    Ok(PropertyState {
        id: PropertyId::new(parent, name),
        kind,
        multi_valued,
        values,
        status: status_for(op),
        mod_count: 0,
        overlay_mod_count: None,
    })
}

fn encode_value(buf: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::String(s) | Value::Uri(s) | Value::Decimal(s) => put_str(buf, s),
        Value::Binary(BinaryValue::Inline(bytes)) => {
            buf.push(0);
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(bytes);
        }
        Value::Binary(BinaryValue::External(id)) => {
            buf.push(1);
            put_str(buf, &id.0);
        }
        Value::Long(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Double(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Date(v) => {
            let millis = (v.unix_timestamp_nanos() / 1_000_000) as i64;
            buf.extend_from_slice(&millis.to_le_bytes());
        }
        Value::Boolean(v) => buf.push(u8::from(*v)),
        Value::Name(name) => put_name(buf, name),
        Value::Path(path) => put_str(buf, &path.to_string()),
        Value::Reference(id) | Value::WeakReference(id) => buf.extend_from_slice(id.as_bytes()),
    }
    Ok(())
}

fn decode_value(r: &mut Reader<'_>, kind: PropertyKind) -> Result<Value> {
    Ok(match kind {
        PropertyKind::String => Value::String(r.str()?),
        PropertyKind::Uri => Value::Uri(r.str()?),
        PropertyKind::Decimal => Value::Decimal(r.str()?),
        PropertyKind::Binary => match r.u8()? {
            0 => {
                let len = r.u32()? as usize;
                Value::Binary(BinaryValue::Inline(r.bytes(len)?.to_vec()))
            }
            1 => Value::Binary(BinaryValue::External(BlobId(r.str()?))),
            other => {
                return Err(RepoError::Corruption(format!(
                    "bad binary marker 0x{other:02X}"
                )))
            }
        },
        PropertyKind::Long => Value::Long(r.i64()?),
        PropertyKind::Double => Value::Double(f64::from_le_bytes(
            r.bytes(8)?.try_into().expect("slice has exactly 8 bytes"),
        )),
        PropertyKind::Date => {
            let millis = r.i64()?;
            Value::Date(
                time::OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
                    .map_err(|_| RepoError::Corruption(format!("date out of range: {millis}")))?,
            )
        }
        PropertyKind::Boolean => Value::Boolean(r.u8()? != 0),
        PropertyKind::Name => Value::Name(r.name()?),
        PropertyKind::Path => {
            let text = r.str()?;
            Value::Path(
                text.parse::<Path>()
                    .map_err(|_| RepoError::Corruption(format!("malformed path value: {text}")))?,
            )
        }
        PropertyKind::Reference => Value::Reference(NodeId::from_bytes(r.uuid()?)),
        PropertyKind::WeakReference => Value::WeakReference(NodeId::from_bytes(r.uuid()?)),
    })
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn put_name(buf: &mut Vec<u8>, name: &Name) {
    put_str(buf, &name.ns);
    put_str(buf, &name.local);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(RepoError::Corruption("truncated journal payload".into()));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(
            self.bytes(2)?.try_into().expect("slice has exactly 2 bytes"),
        ))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(
            self.bytes(4)?.try_into().expect("slice has exactly 4 bytes"),
        ))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(
            self.bytes(8)?.try_into().expect("slice has exactly 8 bytes"),
        ))
    }

    fn uuid(&mut self) -> Result<[u8; 16]> {
        Ok(self
            .bytes(16)?
            .try_into()
            .expect("slice has exactly 16 bytes"))
    }

    fn str(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        String::from_utf8(self.bytes(len)?.to_vec())
            .map_err(|_| RepoError::Corruption("invalid UTF-8 in journal payload".into()))
    }

    fn name(&mut self) -> Result<Name> {
        let ns = self.str()?;
        let local = self.str()?;
        Ok(Name::new(ns, local))
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }

    fn done(&self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(RepoError::Corruption(
                "trailing bytes in journal payload".into(),
            ));
        }
        Ok(())
    }
}
