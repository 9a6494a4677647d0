use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Runtime settings. Every field has a default, so an empty document is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// LIO configfs root.
    pub configfs_root: PathBuf,
    /// sysfs block class, for loop and device-mapper lookups.
    pub sys_block_root: PathBuf,
    /// udev by-path links for initiator-side devices.
    pub by_path_root: PathBuf,

    pub targetcli: String,
    pub targetctl: String,
    pub losetup: String,
    pub iscsiadm: String,

    /// Persisted target configuration (JSON).
    pub saved_config: PathBuf,
    pub lock_file: PathBuf,
    /// Volatile "configuration restored" marker; keep it on a tmpfs.
    pub restored_marker: PathBuf,

    pub target_namespace: String,
    /// Backstores whose backing device lives below one of these are never persisted.
    pub restore_roots: Vec<PathBuf>,

    pub tpg: TpgSettings,
    pub timeouts: Timeouts,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            configfs_root: PathBuf::from("/sys/kernel/config/target"),
            sys_block_root: PathBuf::from("/sys/block"),
            by_path_root: PathBuf::from("/dev/disk/by-path"),
            targetcli: "targetcli".to_string(),
            targetctl: "targetctl".to_string(),
            losetup: "losetup".to_string(),
            iscsiadm: "iscsiadm".to_string(),
            saved_config: PathBuf::from("/etc/target/saveconfig.json"),
            lock_file: PathBuf::from("/run/lock/iscsi-target.lock"),
            restored_marker: PathBuf::from("/run/iscsi/config-restored"),
            target_namespace: "iqn.2007-01.net.backup.dev".to_string(),
            restore_roots: vec![PathBuf::from("/restores")],
            tpg: TpgSettings::default(),
            timeouts: Timeouts::default(),
        }
    }
}

/// Portal-group session parameters applied to every new target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TpgSettings {
    pub header_digest: String,
    pub data_digest: String,
    pub max_burst_length: u32,
    pub first_burst_length: u32,
    pub initial_r2t: bool,
    pub immediate_data: bool,
    pub cmdsn_depth: u32,
}

impl Default for TpgSettings {
    fn default() -> Self {
        TpgSettings {
            header_digest: "CRC32C,None".to_string(),
            data_digest: "CRC32C,None".to_string(),
            max_burst_length: 1_048_576,
            first_burst_length: 262_144,
            initial_r2t: false,
            immediate_data: true,
            cmdsn_depth: 32,
        }
    }
}

/// Timeouts, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub lock: u64,
    pub command: u64,
    /// Bulk configuration dump/restore/clear.
    pub config: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            lock: 60,
            command: 30,
            config: 300,
        }
    }
}

impl Timeouts {
    pub fn lock(&self) -> Duration {
        Duration::from_secs(self.lock)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command)
    }

    pub fn config(&self) -> Duration {
        Duration::from_secs(self.config)
    }
}

impl Settings {
    /// create `Settings` from yaml string
    pub fn from(s: &str) -> Result<Settings> {
        let settings = serde_yml::from_str::<Settings>(s)?;
        Ok(settings)
    }

    /// create `Settings` from yaml file
    pub fn read<S: AsRef<Path>>(filename: S) -> Result<Settings> {
        let filename = filename.as_ref();
        let s = fs::read_to_string(filename)
            .with_context(|| format!("reading settings {}", filename.display()))?;
        Settings::from(&s)
    }

    /// encodes `Settings` to yaml string
    pub fn to_yml(&self) -> Result<String> {
        let s = serde_yml::to_string(self)?;
        Ok(s)
    }
}
