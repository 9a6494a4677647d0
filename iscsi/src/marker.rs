use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

/// Volatile "configuration restored" flag.
///
/// Must not survive a reboot: saving the target configuration before the
/// kernel state has been rehydrated from the last snapshot would overwrite
/// that snapshot with an empty one.
pub trait RestoreMarker: Send + Sync {
    /// Unix timestamp at which the flag was set, if it is set.
    fn restored_at(&self) -> Result<Option<u64>>;

    fn set(&self, timestamp: u64) -> Result<()>;

    fn clear(&self) -> Result<()>;

    fn is_set(&self) -> Result<bool> {
        Ok(self.restored_at()?.is_some())
    }
}

pub(crate) fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Marker file on a tmpfs (e.g. under `/run`), holding the timestamp.
#[derive(Debug)]
pub struct FileRestoreMarker {
    path: PathBuf,
}

impl FileRestoreMarker {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileRestoreMarker {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl RestoreMarker for FileRestoreMarker {
    fn restored_at(&self) -> Result<Option<u64>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(text.trim().parse::<u64>().unwrap_or(0))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    fn set(&self, timestamp: u64) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, timestamp.to_string())
            .with_context(|| format!("writing {}", self.path.display()))
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemRestoreMarker {
    at: Mutex<Option<u64>>,
}

impl MemRestoreMarker {
    pub fn new() -> Self {
        MemRestoreMarker::default()
    }
}

impl RestoreMarker for MemRestoreMarker {
    fn restored_at(&self) -> Result<Option<u64>> {
        Ok(*self.at.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn set(&self, timestamp: u64) -> Result<()> {
        *self.at.lock().unwrap_or_else(|e| e.into_inner()) = Some(timestamp);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.at.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}
