//! Persistent append-only string indices.
//!
//! Names are persisted in bundles as `(ns_index, name_index)` pairs; the two
//! indices live in `namespaces.properties` and `names.properties` inside the
//! workspace directory, one `index=string` line per entry. Entries are only
//! ever appended, so an index handed out once stays valid for the life of
//! the workspace.
//!
//! Reads take a shared lock and are hash-map lookups; interning a new string
//! serializes on the write lock and appends + flushes one line.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::{RepoError, Result};

/// One append-only `index=string` table.
pub struct StringIndex {
    path: PathBuf,
    inner: RwLock<Inner>,
}

struct Inner {
    file: File,
    by_string: FxHashMap<String, u32>,
    by_index: Vec<String>,
}

impl StringIndex {
    /// Opens (or creates) the index file and loads all entries.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut by_string = FxHashMap::default();
        let mut by_index = Vec::new();
        let reader = BufReader::new(File::open(&path)?);
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let (idx, raw) = line.split_once('=').ok_or_else(|| {
                RepoError::Corruption(format!("malformed string index line in {}", path.display()))
            })?;
            let idx: u32 = idx.parse().map_err(|_| {
                RepoError::Corruption(format!("bad index in {}", path.display()))
            })?;
            if idx as usize != by_index.len() {
                return Err(RepoError::Corruption(format!(
                    "string index {} out of sequence in {}",
                    idx,
                    path.display()
                )));
            }
            let value = unescape(raw)?;
            by_string.insert(value.clone(), idx);
            by_index.push(value);
        }

        trace!(entries = by_index.len(), path = %path.display(), "interner.open");
        Ok(Self {
            path,
            inner: RwLock::new(Inner {
                file,
                by_string,
                by_index,
            }),
        })
    }

    /// Returns the index for `s`, appending a new entry when unseen.
    pub fn index(&self, s: &str) -> Result<u32> {
        if let Some(idx) = self.lookup(s) {
            return Ok(idx);
        }
        let mut inner = self.inner.write();
        if let Some(&idx) = inner.by_string.get(s) {
            return Ok(idx);
        }
        let idx = u32::try_from(inner.by_index.len())
            .map_err(|_| RepoError::InvalidArgument("string index exhausted".into()))?;
        writeln!(inner.file, "{idx}={}", escape(s))?;
        inner.file.flush()?;
        inner.by_string.insert(s.to_owned(), idx);
        inner.by_index.push(s.to_owned());
        trace!(idx, len = s.len(), "interner.append");
        Ok(idx)
    }

    /// Read-only lookup.
    pub fn lookup(&self, s: &str) -> Option<u32> {
        self.inner.read().by_string.get(s).copied()
    }

    /// Resolves an index back to its string.
    pub fn string(&self, idx: u32) -> Result<String> {
        self.inner
            .read()
            .by_index
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| {
                RepoError::Corruption(format!(
                    "dangling string index {} in {}",
                    idx,
                    self.path.display()
                ))
            })
    }

    /// Number of interned strings.
    pub fn len(&self) -> usize {
        self.inner.read().by_index.len()
    }

    /// True when no strings are interned yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            _ => {
                return Err(RepoError::Corruption(
                    "bad escape in string index".into(),
                ))
            }
        }
    }
    Ok(out)
}
