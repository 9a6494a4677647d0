//! Cross-process mutual exclusion around kernel target state.

use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, warn};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};

use crate::IscsiError;

/// Proof of ownership; the lock is released when the token is dropped.
pub struct LockToken(#[allow(dead_code)] Box<dyn Send>);

pub trait Lock: Send + Sync {
    fn name(&self) -> &str;

    /// Takes the lock if it is free, without blocking.
    fn try_lock(&self) -> Result<Option<LockToken>>;
}

/// Held lock. Dropping it releases the lock, including on early return.
pub struct LockGuard<'a> {
    name: &'a str,
    _token: LockToken,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        debug!("released lock {}", self.name);
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Polls `lock` until it is acquired or `timeout` expires.
pub fn acquire(lock: &dyn Lock, timeout: Duration) -> Result<LockGuard<'_>> {
    let started = Instant::now();
    loop {
        if let Some(token) = lock.try_lock()? {
            debug!("acquired lock {}", lock.name());
            return Ok(LockGuard {
                name: lock.name(),
                _token: token,
            });
        }
        if started.elapsed() >= timeout {
            anyhow::bail!(IscsiError::LockTimeout(lock.name().to_string()))
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// `flock(2)` on a lock file, shared by every process on the host.
#[derive(Debug)]
pub struct FileLock {
    name: String,
    path: PathBuf,
}

impl FileLock {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        FileLock { name, path }
    }
}

struct Flocked(File);

impl Drop for Flocked {
    fn drop(&mut self) {
        if let Err(e) = flock(self.0.as_raw_fd(), FlockArg::Unlock) {
            warn!("unlocking lock file: {}", e);
        }
    }
}

impl Lock for FileLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_lock(&self) -> Result<Option<LockToken>> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("opening lock file {}", self.path.display()))?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => Ok(Some(LockToken(Box::new(Flocked(file))))),
            Err(Errno::EWOULDBLOCK) => Ok(None),
            Err(e) => Err(IscsiError::Io(e.into()).into()),
        }
    }
}

/// Process-local lock for tests and single-process tools.
#[derive(Debug, Default)]
pub struct MemLock {
    held: Arc<AtomicBool>,
}

struct MemHeld(Arc<AtomicBool>);

impl Drop for MemHeld {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl MemLock {
    pub fn new() -> Self {
        MemLock::default()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

impl Lock for MemLock {
    fn name(&self) -> &str {
        "memory"
    }

    fn try_lock(&self) -> Result<Option<LockToken>> {
        if self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Ok(Some(LockToken(Box::new(MemHeld(self.held.clone())))))
        } else {
            Ok(None)
        }
    }
}
