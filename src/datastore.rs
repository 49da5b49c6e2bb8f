//! Content-addressed binary store.
//!
//! Blobs above the inline threshold are written here and referenced from
//! bundles by [`BlobId`] (lowercase blake3 hex). Writes are idempotent: the
//! identifier is the content hash, records land under
//! `<root>/<first two hex chars>/<hash>` via a temp-file-then-rename, and
//! rewriting an existing blob is a metadata touch. Deletion only ever
//! happens through [`DataStore::mark_and_sweep`] against a caller-supplied
//! inventory of live identifiers.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::error::{RepoError, Result};
use crate::value::BlobId;

/// Counters for blob traffic.
#[derive(Default)]
pub struct DataStoreMetrics {
    writes: AtomicU64,
    duplicate_writes: AtomicU64,
    reads: AtomicU64,
    swept: AtomicU64,
}

/// Point-in-time copy of [`DataStoreMetrics`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DataStoreMetricsSnapshot {
    /// Blobs written (including duplicates).
    pub writes: u64,
    /// Writes that found the blob already present.
    pub duplicate_writes: u64,
    /// Blob read operations.
    pub reads: u64,
    /// Blobs reclaimed by mark-and-sweep.
    pub swept: u64,
}

impl DataStoreMetrics {
    fn snapshot(&self) -> DataStoreMetricsSnapshot {
        DataStoreMetricsSnapshot {
            writes: self.writes.load(Ordering::Relaxed),
            duplicate_writes: self.duplicate_writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }
}

/// Filesystem-backed content-addressed store.
pub struct DataStore {
    root: PathBuf,
    metrics: DataStoreMetrics,
}

impl DataStore {
    /// Opens the store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            metrics: DataStoreMetrics::default(),
        })
    }

    /// Stores `bytes` and returns its content address. Idempotent.
    pub fn put(&self, bytes: &[u8]) -> Result<BlobId> {
        self.metrics.writes.fetch_add(1, Ordering::Relaxed);
        let id = BlobId(blake3::hash(bytes).to_hex().to_string());
        let target = self.blob_path(&id);
        if target.exists() {
            // Touch so a concurrent sweep never reclaims a blob that was
            // just re-referenced.
            let now = File::open(&target).and_then(|f| f.set_modified(SystemTime::now()));
            if let Err(err) = now {
                warn!(id = %id, error = %err, "datastore.touch_failed");
            }
            self.metrics.duplicate_writes.fetch_add(1, Ordering::Relaxed);
            return Ok(id);
        }
        let parent = target
            .parent()
            .ok_or_else(|| RepoError::Corruption("blob path has no parent".into()))?;
        fs::create_dir_all(parent)?;
        let tmp = parent.join(format!(".tmp-{}", std::process::id()));
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(bytes)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &target)?;
        debug!(id = %id, len = bytes.len(), "datastore.put");
        Ok(id)
    }

    /// Reads a blob back in full.
    pub fn get(&self, id: &BlobId) -> Result<Vec<u8>> {
        self.metrics.reads.fetch_add(1, Ordering::Relaxed);
        let path = self.blob_path(id);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(RepoError::NotFound("blob"))
            }
            Err(err) => return Err(err.into()),
        };
        let mut out = Vec::new();
        file.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Opens a blob for streaming.
    pub fn open_stream(&self, id: &BlobId) -> Result<File> {
        self.metrics.reads.fetch_add(1, Ordering::Relaxed);
        File::open(self.blob_path(id)).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                RepoError::NotFound("blob")
            } else {
                err.into()
            }
        })
    }

    /// True when the blob exists.
    pub fn contains(&self, id: &BlobId) -> bool {
        self.blob_path(id).exists()
    }

    /// Reclaims blobs absent from `live` whose modification time is older
    /// than `min_age`. Returns the number of blobs deleted.
    ///
    /// The age guard keeps a blob written by an in-flight commit (not yet
    /// referenced by any persisted bundle) from being reclaimed.
    pub fn mark_and_sweep(&self, live: &HashSet<BlobId>, min_age: Duration) -> Result<u64> {
        let cutoff = SystemTime::now()
            .checked_sub(min_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut deleted = 0u64;
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with(".tmp-") {
                    continue;
                }
                let id = BlobId(name.to_owned());
                if live.contains(&id) {
                    continue;
                }
                let modified = entry.metadata()?.modified()?;
                if modified > cutoff {
                    continue;
                }
                fs::remove_file(entry.path())?;
                deleted += 1;
            }
        }
        if deleted > 0 {
            self.metrics.swept.fetch_add(deleted, Ordering::Relaxed);
            debug!(deleted, "datastore.sweep");
        }
        Ok(deleted)
    }

    /// Current traffic counters.
    pub fn metrics_snapshot(&self) -> DataStoreMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn blob_path(&self, id: &BlobId) -> PathBuf {
        let shard = if id.0.len() >= 2 { &id.0[..2] } else { "xx" };
        self.root.join(shard).join(&id.0)
    }
}
