//! Run lock - one maintenance run per host at a time
//!
//! The lock is an advisory `flock` on a well-known file. Acquisition polls
//! until the timeout expires; the lock is released when the guard drops.

use crate::{Result, StrataError};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const DEFAULT_POLL: Duration = Duration::from_secs(1);

/// Guard for an exclusive run lock
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock at `path`, polling once a second up to `timeout`
    pub fn acquire(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        Self::acquire_with_poll(path, timeout, DEFAULT_POLL)
    }

    pub fn acquire_with_poll(path: impl AsRef<Path>, timeout: Duration, poll: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StrataError::Lock(format!("cannot open {:?}: {}", path, e)))?;

        let deadline = Instant::now() + timeout;
        loop {
            if try_lock(&file).map_err(|e| StrataError::Lock(format!("flock {:?}: {}", path, e)))? {
                info!("Acquired run lock {:?}", path);
                return Ok(Self { file, path });
            }
            if Instant::now() >= deadline {
                return Err(StrataError::LockTimeout {
                    path,
                    secs: timeout.as_secs(),
                });
            }
            debug!("Run lock {:?} busy, retrying", path);
            thread::sleep(poll);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        unlock(&self.file);
        debug!("Released run lock {:?}", self.path);
    }
}

/// `Ok(false)` when another holder has the lock
#[cfg(unix)]
fn try_lock(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let error = std::io::Error::last_os_error();
    match error.raw_os_error() {
        Some(libc::EWOULDBLOCK) => Ok(false),
        _ => Err(error),
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if result != 0 {
        debug!("flock unlock returned non-zero (descriptor closes anyway)");
    }
}

// Without flock the process holding the file handle is the only guard.
#[cfg(not(unix))]
fn try_lock(_file: &File) -> std::io::Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}
