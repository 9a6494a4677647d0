use std::path::{Path, PathBuf};

use anyhow::Result;
use regex::Regex;
use serde::Serialize;

use crate::{file_name, Layer, NodeKind, ResourceTree};

pub(crate) static CORE_DIR: &str = "core";

#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackstoreKind {
    #[default]
    Block,
    Fileio,
}

impl BackstoreKind {
    /// Plugin name used by targetcli and the saved configuration.
    pub fn plugin(self) -> &'static str {
        match self {
            BackstoreKind::Block => "block",
            BackstoreKind::Fileio => "fileio",
        }
    }

    fn hba_prefix(self) -> &'static str {
        match self {
            BackstoreKind::Block => "iblock",
            BackstoreKind::Fileio => "fileio",
        }
    }

    pub fn from_plugin(plugin: &str) -> Option<Self> {
        [BackstoreKind::Block, BackstoreKind::Fileio]
            .into_iter()
            .find(|k| k.plugin() == plugin)
    }

    /// Parses a configfs HBA directory name such as `iblock_0`.
    pub fn from_hba(hba: &str) -> Option<Self> {
        let (prefix, index) = hba.rsplit_once('_')?;
        index.parse::<u32>().ok()?;
        [BackstoreKind::Block, BackstoreKind::Fileio]
            .into_iter()
            .find(|k| k.hba_prefix() == prefix)
    }

    /// `/backstores/<plugin>/<name>`, as referenced by LUNs.
    pub fn object_path(self, name: &str) -> String {
        format!("/backstores/{}/{}", self.plugin(), name)
    }
}

#[derive(Serialize, Debug, Default, Clone)]
pub struct Backstore {
    #[serde(skip)]
    root: PathBuf,
    kind: BackstoreKind,
    name: String,
    dev: String,
    read_only: bool,
    write_back: bool,
    wwn: Option<String>,
}

impl Backstore {
    pub fn kind(&self) -> BackstoreKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing device or file, as recorded in `udev_path`.
    pub fn dev(&self) -> &Path {
        Path::new(&self.dev)
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn write_back(&self) -> bool {
        self.write_back
    }

    pub fn wwn(&self) -> Option<&str> {
        self.wwn.as_deref()
    }

    pub fn is_loop_backed(&self) -> bool {
        is_loop_device(self.dev())
    }
}

pub fn is_loop_device(dev: &Path) -> bool {
    file_name(dev)
        .strip_prefix("loop")
        .map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
        && dev.starts_with("/dev")
}

impl Layer for Backstore {
    fn root(&self) -> &Path {
        &self.root
    }

    fn load(&mut self, tree: &dyn ResourceTree, root: &Path) -> Result<()> {
        self.root = root.to_path_buf();
        self.name = file_name(root);
        let hba = root.parent().map(file_name).unwrap_or_default();
        self.kind = BackstoreKind::from_hba(&hba)
            .ok_or_else(|| anyhow::anyhow!("unknown backstore plugin '{}'", hba))?;
        self.dev = tree.read(&root.join("udev_path"))?.trim().to_string();
        self.write_back = tree
            .read(&root.join("attrib").join("emulate_write_cache"))
            .map(|s| s.trim() == "1")
            .unwrap_or(false);

        let info = tree.read_text(&root.join("info")).unwrap_or_default();
        let re = Regex::new(r"readonly:\s*(\d)")?;
        self.read_only = re
            .captures(&info)
            .map(|c| &c[1] == "1")
            .unwrap_or(false);

        self.wwn = tree
            .read(&root.join("wwn").join("vpd_unit_serial"))
            .ok()
            .map(|s| {
                s.rsplit(':')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string()
            })
            .filter(|s| !s.is_empty());

        Ok(())
    }
}

/// Every backstore of a supported kind under `<configfs>/core`.
pub fn list_backstores(tree: &dyn ResourceTree, configfs_root: &Path) -> Result<Vec<Backstore>> {
    let pattern = configfs_root.join(CORE_DIR).join("*_*").join("*");
    let backstores = tree
        .glob(&pattern.to_string_lossy())?
        .into_iter()
        .filter(|p| tree.kind(p) == Some(NodeKind::Dir))
        .filter(|p| {
            p.parent()
                .map(|hba| BackstoreKind::from_hba(&file_name(hba)).is_some())
                .unwrap_or(false)
        })
        .filter_map(|p| {
            let mut backstore = Backstore::default();
            backstore.load(tree, &p).ok()?;
            Some(backstore)
        })
        .collect();

    Ok(backstores)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MemTree;

    #[test]
    fn parse_hba_names() {
        assert_eq!(BackstoreKind::from_hba("iblock_0"), Some(BackstoreKind::Block));
        assert_eq!(BackstoreKind::from_hba("fileio_12"), Some(BackstoreKind::Fileio));
        assert_eq!(BackstoreKind::from_hba("rd_mcp_1"), None);
        assert_eq!(BackstoreKind::from_hba("alua"), None);
        assert_eq!(BackstoreKind::from_plugin("block"), Some(BackstoreKind::Block));
        assert_eq!(BackstoreKind::Block.object_path("abc"), "/backstores/block/abc");
    }

    #[test]
    fn loop_device_paths() {
        assert!(is_loop_device(Path::new("/dev/loop0")));
        assert!(is_loop_device(Path::new("/dev/loop12")));
        assert!(!is_loop_device(Path::new("/dev/loop-control")));
        assert!(!is_loop_device(Path::new("/data/loop1")));
        assert!(!is_loop_device(Path::new("/dev/sdb")));
    }

    #[test]
    fn load_backstores() -> Result<()> {
        let tree = MemTree::new();
        let so = Path::new("/cfg/core/iblock_0/1a2b3c4d");
        tree.add_file(so.join("udev_path"), "/dev/loop3\n");
        tree.add_file(so.join("attrib/emulate_write_cache"), "1\n");
        tree.add_file(
            so.join("info"),
            "Status: ACTIVATED  Max Queue Depth: 0\n        iBlock device: loop3  readonly: 1\n",
        );
        tree.add_file(so.join("wwn/vpd_unit_serial"), "T10 VPD Unit Serial Number: 9f1c\n");
        tree.add_file("/cfg/core/iblock_0/hba_info", "HBA Index: 1\n");
        tree.add_file("/cfg/core/fileio_1/cafe0001/udev_path", "/data/x.img\n");
        tree.add_dir("/cfg/core/alua/lu_gp");

        let backstores = list_backstores(&tree, Path::new("/cfg"))?;
        assert_eq!(backstores.len(), 2);

        let file = &backstores[0];
        assert_eq!(file.kind(), BackstoreKind::Fileio);
        assert!(!file.is_loop_backed());

        let block = &backstores[1];
        assert_eq!(block.name(), "1a2b3c4d");
        assert_eq!(block.dev(), Path::new("/dev/loop3"));
        assert!(block.read_only());
        assert!(block.write_back());
        assert_eq!(block.wwn(), Some("9f1c"));
        assert!(block.is_loop_backed());

        Ok(())
    }
}
