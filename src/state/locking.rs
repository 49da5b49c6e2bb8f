//! Process-wide item-state-manager lock.
//!
//! A coarse reentrant read-write lock with writer preference: a waiting
//! writer blocks new readers, so commits are never starved. Reentrancy
//! comes in two forms. The thread owning the write lock may take read (or
//! further write) locks, and any thread participating in the same
//! distributed transaction, identified by the [`Xid`] carried in
//! thread-local context, may read while a cooperating thread holds the
//! writer. `downgrade()` turns a held write lock into a read lock without
//! leaving the critical section.
//!
//! Acquisition takes an optional timeout in place of thread interruption.

use std::cell::Cell;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{RepoError, Result};

/// Distributed transaction identifier carried through thread-local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Xid(pub u128);

thread_local! {
    static CURRENT_XID: Cell<Option<Xid>> = const { Cell::new(None) };
}

/// Associates the current thread with a transaction (or clears it).
pub fn set_current_xid(xid: Option<Xid>) {
    CURRENT_XID.with(|cell| cell.set(xid));
}

/// The transaction the current thread participates in, if any.
pub fn current_xid() -> Option<Xid> {
    CURRENT_XID.with(Cell::get)
}

#[derive(Default, Debug)]
struct Core {
    readers: usize,
    writer: Option<(ThreadId, Option<Xid>)>,
    writer_holds: usize,
    waiting_writers: usize,
}

impl Core {
    fn writer_is_current(&self) -> bool {
        match self.writer {
            Some((thread, xid)) => {
                thread == thread::current().id()
                    || (xid.is_some() && xid == current_xid())
            }
            None => false,
        }
    }

    fn may_read(&self) -> bool {
        if self.writer_is_current() {
            return true;
        }
        self.writer.is_none() && self.waiting_writers == 0
    }

    fn may_write(&self) -> bool {
        self.readers == 0 && self.writer.is_none()
    }
}

#[derive(Debug)]
struct Inner {
    core: Mutex<Core>,
    readers_ok: Condvar,
    writer_ok: Condvar,
}

/// The shared item-state manager lock.
#[derive(Clone)]
pub struct IsmLocking {
    inner: Arc<Inner>,
}

impl Default for IsmLocking {
    fn default() -> Self {
        Self::new()
    }
}

impl IsmLocking {
    /// A fresh, unheld lock.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core::default()),
                readers_ok: Condvar::new(),
                writer_ok: Condvar::new(),
            }),
        }
    }

    /// Acquires a read lock, waiting at most `timeout` when given.
    pub fn acquire_read(&self, timeout: Option<Duration>) -> Result<ReadGuard> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut core = self.inner.core.lock();
        while !core.may_read() {
            if !wait_until(&self.inner.readers_ok, &mut core, deadline) {
                return Err(RepoError::Locked(
                    "timed out waiting for the item-state read lock".into(),
                ));
            }
        }
        core.readers += 1;
        drop(core);
        Ok(ReadGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Acquires the write lock, waiting at most `timeout` when given.
    /// Reentrant for the owning thread and for its transaction peers.
    pub fn acquire_write(&self, timeout: Option<Duration>) -> Result<WriteGuard> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut core = self.inner.core.lock();
        if core.writer_is_current() {
            core.writer_holds += 1;
            drop(core);
            return Ok(WriteGuard {
                inner: Some(Arc::clone(&self.inner)),
            });
        }
        core.waiting_writers += 1;
        while !core.may_write() {
            if !wait_until(&self.inner.writer_ok, &mut core, deadline) {
                core.waiting_writers -= 1;
                // Readers parked behind this writer may proceed again.
                self.inner.readers_ok.notify_all();
                return Err(RepoError::Locked(
                    "timed out waiting for the item-state write lock".into(),
                ));
            }
        }
        core.waiting_writers -= 1;
        core.writer = Some((thread::current().id(), current_xid()));
        core.writer_holds = 1;
        drop(core);
        Ok(WriteGuard {
            inner: Some(Arc::clone(&self.inner)),
        })
    }

    #[cfg(test)]
    fn snapshot(&self) -> (usize, bool, usize) {
        let core = self.inner.core.lock();
        (core.readers, core.writer.is_some(), core.waiting_writers)
    }
}

fn wait_until(condvar: &Condvar, core: &mut parking_lot::MutexGuard<'_, Core>, deadline: Option<Instant>) -> bool {
    match deadline {
        Some(deadline) => !condvar.wait_until(core, deadline).timed_out(),
        None => {
            condvar.wait(core);
            true
        }
    }
}

/// A held read lock.
#[derive(Debug)]
pub struct ReadGuard {
    inner: Arc<Inner>,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        let mut core = self.inner.core.lock();
        core.readers -= 1;
        if core.readers == 0 {
            self.inner.writer_ok.notify_one();
        }
    }
}

/// A held write lock.
#[derive(Debug)]
pub struct WriteGuard {
    inner: Option<Arc<Inner>>,
}

impl WriteGuard {
    /// Atomically converts this write hold into a read lock. The critical
    /// section is never left: no other writer can slip in between.
    pub fn downgrade(mut self) -> ReadGuard {
        let inner = self.inner.take().expect("guard not yet released");
        {
            let mut core = inner.core.lock();
            core.writer_holds -= 1;
            if core.writer_holds == 0 {
                core.writer = None;
            }
            core.readers += 1;
            inner.readers_ok.notify_all();
            inner.writer_ok.notify_one();
        }
        ReadGuard { inner }
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let mut core = inner.core.lock();
        core.writer_holds -= 1;
        if core.writer_holds == 0 {
            core.writer = None;
            inner.writer_ok.notify_one();
            inner.readers_ok.notify_all();
        }
    }
}
