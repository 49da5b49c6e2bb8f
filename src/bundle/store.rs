//! Pluggable bundle persistence.
//!
//! [`BundleStore`] is the narrow interface the shared item-state manager
//! writes through. [`FsBundleStore`] keeps one file per bundle in a sharded
//! directory tree and makes multi-record batches atomic with a redo log:
//! every record of a batch is framed and fsynced to `redo.log` followed by a
//! commit frame, then applied to the target files, then the log is reset.
//! A batch whose commit frame never made it to disk is ignored on recovery.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bundle::codec::BundleCodec;
use crate::bundle::{NodePropBundle, NodeReferences};
use crate::error::{RepoError, Result};
use crate::model::NodeId;

/// One atomic set of persistence operations, assembled from a change log.
#[derive(Debug, Default)]
pub struct WriteBatch {
    /// Bundles to create or overwrite.
    pub bundles: Vec<NodePropBundle>,
    /// Bundles to destroy.
    pub deleted: Vec<NodeId>,
    /// Reference-index records to write.
    pub refs: Vec<NodeReferences>,
    /// Reference-index records to destroy.
    pub deleted_refs: Vec<NodeId>,
}

impl WriteBatch {
    /// True when the batch performs no work.
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
            && self.deleted.is_empty()
            && self.refs.is_empty()
            && self.deleted_refs.is_empty()
    }
}

/// Narrow persistence interface for bundles and the reference index.
///
/// All writes issued within one [`BundleStore::store_batch`] call are
/// atomic: a concurrent reader observes either none or all of them.
pub trait BundleStore: Send + Sync {
    /// Loads a bundle, absent on miss.
    fn load(&self, id: NodeId) -> Result<Option<NodePropBundle>>;
    /// True when a bundle exists for `id`.
    fn exists(&self, id: NodeId) -> Result<bool>;
    /// Loads the reference-index record for `target`, absent on miss.
    fn load_refs(&self, target: NodeId) -> Result<Option<NodeReferences>>;
    /// Applies a batch atomically.
    fn store_batch(&self, batch: WriteBatch) -> Result<()>;

    /// Stores one bundle.
    fn store_bundle(&self, bundle: NodePropBundle) -> Result<()> {
        self.store_batch(WriteBatch {
            bundles: vec![bundle],
            ..WriteBatch::default()
        })
    }

    /// Destroys one bundle.
    fn destroy_bundle(&self, id: NodeId) -> Result<()> {
        self.store_batch(WriteBatch {
            deleted: vec![id],
            ..WriteBatch::default()
        })
    }

    /// Stores one reference-index record.
    fn store_refs(&self, refs: NodeReferences) -> Result<()> {
        self.store_batch(WriteBatch {
            refs: vec![refs],
            ..WriteBatch::default()
        })
    }

    /// Destroys one reference-index record.
    fn destroy_refs(&self, target: NodeId) -> Result<()> {
        self.store_batch(WriteBatch {
            deleted_refs: vec![target],
            ..WriteBatch::default()
        })
    }
}

const REDO_MAGIC: &[u8; 8] = b"WRNREDO\0";
const REDO_VERSION: u16 = 1;
const REDO_HEADER_SIZE: usize = 16;
const FRAME_HEADER_SIZE: usize = 1 + 16 + 4;

const OP_PUT_BUNDLE: u8 = b'B';
const OP_DEL_BUNDLE: u8 = b'D';
const OP_PUT_REFS: u8 = b'R';
const OP_DEL_REFS: u8 = b'X';
const OP_COMMIT: u8 = b'C';

/// Filesystem bundle store with redo-log batch atomicity.
pub struct FsBundleStore {
    codec: Arc<BundleCodec>,
    root: PathBuf,
    redo: Mutex<RedoLog>,
}

impl FsBundleStore {
    /// Opens the store under `root`, replaying any committed-but-unapplied
    /// redo frames left by a crash.
    pub fn open(root: impl AsRef<Path>, codec: Arc<BundleCodec>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("bundles"))?;
        fs::create_dir_all(root.join("refs"))?;
        let redo = RedoLog::open(root.join("redo.log"))?;
        let store = Self {
            codec,
            root,
            redo: Mutex::new(redo),
        };
        store.recover()?;
        Ok(store)
    }

    fn recover(&self) -> Result<()> {
        let mut redo = self.redo.lock();
        let mut frames = Vec::new();
        let replayed = redo.replay(|op, id, payload| {
            frames.push((op, id, payload.to_vec()));
            Ok(())
        })?;
        drop(redo);
        if replayed == 0 {
            return Ok(());
        }
        warn!(frames = replayed, "bundle.redo.recovery");
        for (op, id, payload) in frames {
            self.apply(op, id, &payload)?;
        }
        self.redo.lock().reset()?;
        Ok(())
    }

    fn apply(&self, op: u8, id: NodeId, payload: &[u8]) -> Result<()> {
        match op {
            OP_PUT_BUNDLE => write_atomic(&self.record_path("bundles", id), payload),
            OP_DEL_BUNDLE => remove_quiet(&self.record_path("bundles", id)),
            OP_PUT_REFS => write_atomic(&self.record_path("refs", id), payload),
            OP_DEL_REFS => remove_quiet(&self.record_path("refs", id)),
            other => Err(RepoError::Corruption(format!(
                "unknown redo op 0x{other:02X}"
            ))),
        }
    }

    fn record_path(&self, kind: &str, id: NodeId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(kind).join(&hex[..2]).join(hex)
    }
}

impl BundleStore for FsBundleStore {
    fn load(&self, id: NodeId) -> Result<Option<NodePropBundle>> {
        match fs::read(self.record_path("bundles", id)) {
            Ok(bytes) => Ok(Some(self.codec.decode(id, &bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn exists(&self, id: NodeId) -> Result<bool> {
        Ok(self.record_path("bundles", id).exists())
    }

    fn load_refs(&self, target: NodeId) -> Result<Option<NodeReferences>> {
        match fs::read(self.record_path("refs", target)) {
            Ok(bytes) => Ok(Some(self.codec.decode_refs(target, &bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn store_batch(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut frames: Vec<(u8, NodeId, Vec<u8>)> = Vec::new();
        for bundle in &batch.bundles {
            frames.push((OP_PUT_BUNDLE, bundle.id, self.codec.encode(bundle)?));
        }
        for &id in &batch.deleted {
            frames.push((OP_DEL_BUNDLE, id, Vec::new()));
        }
        for refs in &batch.refs {
            let target = refs
                .target
                .ok_or_else(|| RepoError::InvalidArgument("refs without target".into()))?;
            frames.push((OP_PUT_REFS, target, self.codec.encode_refs(refs)?));
        }
        for &id in &batch.deleted_refs {
            frames.push((OP_DEL_REFS, id, Vec::new()));
        }

        {
            let mut redo = self.redo.lock();
            for (op, id, payload) in &frames {
                redo.append_frame(*op, *id, payload)?;
            }
            redo.append_commit()?;
            redo.sync()?;
        }

        for (op, id, payload) in &frames {
            self.apply(*op, *id, payload)?;
        }
        self.redo.lock().reset()?;
        debug!(frames = frames.len(), "bundle.batch.applied");
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| RepoError::Corruption("record path has no parent".into()))?;
    fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("record")
    ));
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_data()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_quiet(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Append-only redo log. Frames carry a crc32 trailer; only frames covered
/// by a commit frame are replayed.
struct RedoLog {
    file: File,
}

impl RedoLog {
    fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let mut log = Self { file };
        if log.file.metadata()?.len() == 0 {
            log.write_header()?;
        } else {
            log.validate_header()?;
        }
        Ok(log)
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = [0u8; REDO_HEADER_SIZE];
        header[..REDO_MAGIC.len()].copy_from_slice(REDO_MAGIC);
        header[8..10].copy_from_slice(&REDO_VERSION.to_le_bytes());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn validate_header(&mut self) -> Result<()> {
        let mut header = [0u8; REDO_HEADER_SIZE];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut header)?;
        if &header[..REDO_MAGIC.len()] != REDO_MAGIC {
            return Err(RepoError::Corruption("invalid redo log magic".into()));
        }
        let version = u16::from_le_bytes([header[8], header[9]]);
        if version != REDO_VERSION {
            return Err(RepoError::Corruption(format!(
                "unsupported redo log version {version}"
            )));
        }
        Ok(())
    }

    fn append_frame(&mut self, op: u8, id: NodeId, payload: &[u8]) -> Result<()> {
        let len: u32 = payload
            .len()
            .try_into()
            .map_err(|_| RepoError::InvalidArgument("redo payload exceeds u32::MAX".into()))?;
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[0] = op;
        header[1..17].copy_from_slice(id.as_bytes());
        header[17..21].copy_from_slice(&len.to_le_bytes());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        hasher.update(payload);
        let crc = hasher.finalize();

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&header)?;
        self.file.write_all(payload)?;
        self.file.write_all(&crc.to_le_bytes())?;
        Ok(())
    }

    fn append_commit(&mut self) -> Result<()> {
        self.append_frame(OP_COMMIT, NodeId::from_bytes([0u8; 16]), &[])
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.file.set_len(REDO_HEADER_SIZE as u64)?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Replays committed frames into `apply`; returns how many were fed.
    fn replay<F>(&mut self, mut apply: F) -> Result<u32>
    where
        F: FnMut(u8, NodeId, &[u8]) -> Result<()>,
    {
        self.file.seek(SeekFrom::Start(REDO_HEADER_SIZE as u64))?;
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let mut pending: Vec<(u8, NodeId, Vec<u8>)> = Vec::new();
        let mut applied = 0u32;

        loop {
            if !read_exact_or_eof(&mut self.file, &mut header)? {
                break;
            }
            let op = header[0];
            let id = NodeId::from_bytes(
                header[1..17]
                    .try_into()
                    .expect("slice has exactly 16 bytes"),
            );
            let len = u32::from_le_bytes(
                header[17..21]
                    .try_into()
                    .expect("slice has exactly 4 bytes"),
            ) as usize;
            let mut payload = vec![0u8; len];
            if !read_exact_or_eof(&mut self.file, &mut payload)? {
                // Torn tail write; everything before the last commit frame
                // has already been surfaced.
                break;
            }
            let mut crc_buf = [0u8; 4];
            if !read_exact_or_eof(&mut self.file, &mut crc_buf)? {
                break;
            }
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&header);
            hasher.update(&payload);
            if hasher.finalize() != u32::from_le_bytes(crc_buf) {
                return Err(RepoError::Corruption("redo frame checksum mismatch".into()));
            }

            if op == OP_COMMIT {
                for (op, id, payload) in pending.drain(..) {
                    apply(op, id, &payload)?;
                    applied += 1;
                }
            } else {
                pending.push((op, id, payload));
            }
        }
        Ok(applied)
    }
}

fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> Result<bool> {
    let mut read = 0usize;
    while read < buf.len() {
        let bytes = file.read(&mut buf[read..])?;
        if bytes == 0 {
            return Ok(false);
        }
        read += bytes;
    }
    Ok(true)
}
