//! The persisted target configuration, in targetcli's saveconfig JSON format.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backstore::is_loop_device;
use crate::naming::{is_temporary_backstore, is_temporary_target};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SavedConfig {
    #[serde(default)]
    storage_objects: Vec<StorageObjectCfg>,
    #[serde(default)]
    targets: Vec<TargetCfg>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl SavedConfig {
    /// create `SavedConfig` from json string
    pub fn from(s: &str) -> Result<SavedConfig> {
        let config = serde_json::from_str::<SavedConfig>(s)?;
        Ok(config)
    }

    /// create `SavedConfig` from json file
    pub fn read<S: AsRef<Path>>(filename: S) -> Result<SavedConfig> {
        let filename = filename.as_ref();
        let s = fs::read_to_string(filename)
            .with_context(|| format!("reading {}", filename.display()))?;
        SavedConfig::from(&s)
    }

    pub fn to_json(&self) -> Result<String> {
        let s = serde_json::to_string_pretty(self)?;
        Ok(s)
    }

    /// Replaces `filename` atomically: the document is written and synced to
    /// a sibling temp file, which is then renamed over the original.
    pub fn write_to<S: AsRef<Path>>(&self, filename: S) -> Result<()> {
        let filename = filename.as_ref();
        let json = self.to_json()?;
        let tmp = sibling(filename, ".tmp");

        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, filename)
            .with_context(|| format!("renaming {} to {}", tmp.display(), filename.display()))?;

        Ok(())
    }

    pub fn storage_objects(&self) -> &[StorageObjectCfg] {
        &self.storage_objects
    }

    pub fn targets(&self) -> &[TargetCfg] {
        &self.targets
    }

    /// Strips everything that must not be restored verbatim after a reboot:
    /// temporary targets, restore-scoped and loop-backed storage objects,
    /// LUNs referencing a stripped storage object, and targets that lose
    /// their last LUN that way.
    pub fn prune(&mut self, restore_roots: &[PathBuf]) -> PruneSummary {
        let mut summary = PruneSummary::default();

        self.targets.retain(|t| {
            let keep = !is_temporary_target(&t.wwn);
            if !keep {
                summary.targets.push(t.wwn.clone());
            }
            keep
        });

        let mut stripped = BTreeSet::new();
        self.storage_objects.retain(|so| {
            let dev = Path::new(&so.dev);
            let keep = !(is_temporary_backstore(&so.name)
                || is_loop_device(dev)
                || restore_roots.iter().any(|root| dev.starts_with(root)));
            if !keep {
                stripped.insert(so.object_path());
                summary.storage_objects.push(so.name.clone());
            }
            keep
        });

        self.targets.retain_mut(|t| {
            let removed = t.strip_luns(&stripped);
            let keep = removed == 0 || t.lun_count() > 0;
            if !keep {
                summary.targets.push(t.wwn.clone());
            }
            keep
        });

        summary
    }
}

/// Names removed by [`SavedConfig::prune`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneSummary {
    pub targets: Vec<String>,
    pub storage_objects: Vec<String>,
}

pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StorageObjectCfg {
    name: String,
    plugin: String,
    #[serde(default)]
    dev: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl StorageObjectCfg {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn dev(&self) -> &str {
        &self.dev
    }

    pub fn object_path(&self) -> String {
        format!("/backstores/{}/{}", self.plugin, self.name)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TargetCfg {
    wwn: String,
    #[serde(default)]
    tpgs: Vec<TpgCfg>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl TargetCfg {
    pub fn wwn(&self) -> &str {
        &self.wwn
    }

    pub fn tpgs(&self) -> &[TpgCfg] {
        &self.tpgs
    }

    pub fn lun_count(&self) -> usize {
        self.tpgs.iter().map(|tpg| tpg.luns.len()).sum()
    }

    fn strip_luns(&mut self, stripped: &BTreeSet<String>) -> usize {
        let mut removed = 0;
        for tpg in self.tpgs.iter_mut() {
            let before = tpg.luns.len();
            tpg.luns.retain(|lun| !stripped.contains(&lun.storage_object));
            removed += before - tpg.luns.len();
        }
        removed
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TpgCfg {
    #[serde(default)]
    tag: u32,
    #[serde(default)]
    luns: Vec<LunCfg>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl TpgCfg {
    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn luns(&self) -> &[LunCfg] {
        &self.luns
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct LunCfg {
    #[serde(default)]
    index: u32,
    storage_object: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl LunCfg {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn storage_object(&self) -> &str {
        &self.storage_object
    }
}
