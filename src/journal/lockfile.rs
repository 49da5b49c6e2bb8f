#![allow(unsafe_code)]

//! Cross-process exclusive lock guarding the journal writer.
//!
//! The journal is a single-writer-at-a-time resource; writers serialize on
//! an exclusive byte-range lock over a dedicated lock file.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use crate::error::Result;

/// A held exclusive journal lock. Dropping releases it.
pub struct JournalLock {
    file: File,
}

impl JournalLock {
    /// Blocks until the exclusive lock is held.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        if file.metadata()?.len() < 1 {
            file.set_len(1)?;
        }
        lock_region(&file, true)?;
        Ok(Self { file })
    }

    /// Attempts the lock without blocking.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        if file.metadata()?.len() < 1 {
            file.set_len(1)?;
        }
        if lock_region(&file, false)? {
            Ok(Some(Self { file }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for JournalLock {
    fn drop(&mut self) {
        if let Err(_err) = unlock_region(&self.file) {
            #[cfg(debug_assertions)]
            eprintln!("failed to unlock journal: {_err:?}");
        }
    }
}

fn lock_region(file: &File, blocking: bool) -> Result<bool> {
    #[cfg(unix)]
    {
        Ok(unix::lock_region(file, blocking)?)
    }
    #[cfg(windows)]
    {
        Ok(windows::lock_region(file, blocking)?)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (file, blocking);
        Err(crate::error::RepoError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            "file locking unsupported on this platform",
        )))
    }
}

fn unlock_region(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        unix::unlock_region(file)
    }
    #[cfg(windows)]
    {
        windows::unlock_region(file)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = file;
        Ok(())
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::unix::io::AsRawFd;

    pub fn lock_region(file: &File, blocking: bool) -> io::Result<bool> {
        let fd = file.as_raw_fd();
        let mut flock = libc::flock {
            l_type: libc::F_WRLCK as _,
            l_whence: libc::SEEK_SET as _,
            l_start: 0,
            l_len: 1,
            l_pid: 0,
        };
        let cmd = if blocking {
            libc::F_SETLKW
        } else {
            libc::F_SETLK
        };
        loop {
            let res = unsafe { libc::fcntl(fd, cmd, &mut flock) };
            if res == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) if blocking => continue,
                Some(libc::EAGAIN) | Some(libc::EACCES) if !blocking => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    pub fn unlock_region(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let mut flock = libc::flock {
            l_type: libc::F_UNLCK as _,
            l_whence: libc::SEEK_SET as _,
            l_start: 0,
            l_len: 1,
            l_pid: 0,
        };
        let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut flock) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::*;
    use std::mem::zeroed;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    pub fn lock_region(file: &File, blocking: bool) -> io::Result<bool> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            let mut flags = LOCKFILE_EXCLUSIVE_LOCK;
            if !blocking {
                flags |= LOCKFILE_FAIL_IMMEDIATELY;
            }
            let res = LockFileEx(handle as isize, flags, 0, 1, 0, &mut overlapped);
            if res != 0 {
                Ok(true)
            } else {
                let err = io::Error::last_os_error();
                if !blocking && matches!(err.raw_os_error(), Some(ERROR_LOCK_VIOLATION)) {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    pub fn unlock_region(file: &File) -> io::Result<()> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            let res = UnlockFileEx(handle as isize, 0, 1, 0, &mut overlapped);
            if res != 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }
}
