use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;

use crate::{file_name, BackstoreKind, Layer, ResourceTree};

pub(crate) static TPG_DIR: &str = "tpgt_1";
/// targetcli's name for the portal group above.
pub(crate) static TPG_NODE: &str = "tpg1";
static TPG_LUN: &str = "lun";
static TPG_AUTH: &str = "auth";
static TPG_ATTRIB: &str = "attrib";
static TPG_SESSIONS: &str = "dynamic_sessions";

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChapDirection {
    Incoming,
    Outgoing,
}

impl ChapDirection {
    /// (user, password) attribute files under `tpgt_1/auth`.
    pub(crate) fn auth_files(self) -> (&'static str, &'static str) {
        match self {
            ChapDirection::Incoming => ("userid", "password"),
            ChapDirection::Outgoing => ("userid_mut", "password_mut"),
        }
    }

    /// (user, password) keys for `targetcli ... set auth`.
    pub(crate) fn auth_keys(self) -> (&'static str, &'static str) {
        match self {
            ChapDirection::Incoming => ("userid", "password"),
            ChapDirection::Outgoing => ("mutual_userid", "mutual_password"),
        }
    }
}

impl fmt::Display for ChapDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChapDirection::Incoming => write!(f, "incoming"),
            ChapDirection::Outgoing => write!(f, "outgoing"),
        }
    }
}

#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct ChapUsers {
    pub incoming: Option<String>,
    pub outgoing: Option<String>,
}

impl ChapUsers {
    pub fn get(&self, direction: ChapDirection) -> Option<&str> {
        match direction {
            ChapDirection::Incoming => self.incoming.as_deref(),
            ChapDirection::Outgoing => self.outgoing.as_deref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.incoming.is_none() && self.outgoing.is_none()
    }
}

#[derive(Serialize, Debug, Default, Clone)]
pub struct Target {
    #[serde(skip)]
    root: PathBuf,
    name: String,
    enabled: bool,
    authentication: bool,
    chap: ChapUsers,
    sessions: Vec<String>,

    luns: BTreeMap<u32, Lun>,
}

impl Target {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the portal group accepts logins.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn authentication(&self) -> bool {
        self.authentication
    }

    pub fn chap_users(&self) -> &ChapUsers {
        &self.chap
    }

    /// Initiator names with a live session on the portal group.
    pub fn sessions(&self) -> &[String] {
        &self.sessions
    }

    pub fn luns(&self) -> &BTreeMap<u32, Lun> {
        &self.luns
    }

    pub fn tpg_root(&self) -> PathBuf {
        self.root.join(TPG_DIR)
    }
}

/// Reads a CHAP attribute; LIO reports an unset value as an empty string.
pub(crate) fn read_auth(tree: &dyn ResourceTree, tpg: &Path, file: &str) -> Option<String> {
    tree.read(&tpg.join(TPG_AUTH).join(file))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn lun_ids(tree: &dyn ResourceTree, target_root: &Path) -> Result<Vec<u32>> {
    let pattern = target_root.join(TPG_DIR).join(TPG_LUN).join("lun_*");
    let mut ids = tree
        .glob(&pattern.to_string_lossy())?
        .iter()
        .filter_map(|p| lun_index(p))
        .collect::<Vec<u32>>();
    ids.sort_unstable();
    Ok(ids)
}

fn lun_index(path: &Path) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .strip_prefix("lun_")?
        .parse::<u32>()
        .ok()
}

impl Layer for Target {
    fn root(&self) -> &Path {
        &self.root
    }

    fn load(&mut self, tree: &dyn ResourceTree, root: &Path) -> Result<()> {
        self.root = root.to_path_buf();
        self.name = file_name(root);

        let tpg = root.join(TPG_DIR);
        self.enabled = tree.read(&tpg.join("enable"))?.trim() == "1";
        self.authentication = tree
            .read(&tpg.join(TPG_ATTRIB).join("authentication"))
            .map(|s| s.trim() == "1")
            .unwrap_or(false);

        let (user, _) = ChapDirection::Incoming.auth_files();
        let (mutual_user, _) = ChapDirection::Outgoing.auth_files();
        self.chap = ChapUsers {
            incoming: read_auth(tree, &tpg, user),
            outgoing: read_auth(tree, &tpg, mutual_user),
        };

        self.sessions = tree
            .read_text(&tpg.join(TPG_SESSIONS))
            .map(|text| {
                text.lines()
                    .map(|l| l.trim_matches(char::from(0)).trim().to_string())
                    .filter(|l| !l.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        // traverse tpg luns
        self.luns = lun_ids(tree, root)?
            .into_iter()
            .filter_map(|id| {
                let mut lun = Lun::default();
                lun.load(tree, &tpg.join(TPG_LUN).join(format!("lun_{}", id)))
                    .ok()?;
                Some((id, lun))
            })
            .collect();

        Ok(())
    }
}

#[derive(Serialize, Debug, Default, Clone)]
pub struct Lun {
    #[serde(skip)]
    root: PathBuf,
    index: u32,
    kind: BackstoreKind,
    backstore: String,
}

impl Lun {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn backstore_kind(&self) -> BackstoreKind {
        self.kind
    }

    pub fn backstore(&self) -> &str {
        &self.backstore
    }
}

impl Layer for Lun {
    fn root(&self) -> &Path {
        &self.root
    }

    fn load(&mut self, tree: &dyn ResourceTree, root: &Path) -> Result<()> {
        self.root = root.to_path_buf();
        self.index = lun_index(root).unwrap_or_default();

        // the only symlink in the LUN directory points at the backstore:
        // lun_0/<hash> -> ../../../../../../target/core/iblock_0/<name>
        let link = tree
            .glob(&root.join("*").to_string_lossy())?
            .into_iter()
            .find_map(|entry| tree.read_link(&entry).ok())
            .ok_or_else(|| anyhow::anyhow!("LUN {} has no backstore link", root.display()))?;

        self.backstore = link
            .file_name()
            .unwrap_or(OsStr::new(""))
            .to_string_lossy()
            .to_string();
        let hba = link
            .parent()
            .map(|p| file_name(p))
            .unwrap_or_default();
        self.kind = BackstoreKind::from_hba(&hba)
            .ok_or_else(|| anyhow::anyhow!("unknown backstore plugin '{}'", hba))?;

        Ok(())
    }
}
