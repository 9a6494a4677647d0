//! Read access to the kernel's pseudo-filesystems (configfs, sysfs, `/dev`).
//!
//! Everything that inspects live target or device state goes through
//! [`ResourceTree`], so the store logic can run against [`MemTree`] in tests.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use anyhow::{anyhow, Context, Result};
use glob::{MatchOptions, Pattern};

use crate::IscsiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Dir,
    File,
    Link,
    BlockDevice,
}

pub trait ResourceTree: Send + Sync {
    /// Paths matching a shell-style pattern, sorted.
    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>>;

    /// Whole content of a text attribute.
    fn read_text(&self, path: &Path) -> Result<String>;

    /// First line of a text attribute, with the trailing newline removed.
    fn read(&self, path: &Path) -> Result<String> {
        Ok(first_line(&self.read_text(path)?))
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf>;

    fn exists(&self, path: &Path) -> bool;

    /// Kind of the node at `path`, following symlinks.
    fn kind(&self, path: &Path) -> Option<NodeKind>;
}

/// The live filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysfsTree;

impl ResourceTree for SysfsTree {
    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let mut paths = glob::glob(pattern)?
            .filter_map(|res| res.ok())
            .collect::<Vec<PathBuf>>();
        paths.sort();
        Ok(paths)
    }

    fn read_text(&self, path: &Path) -> Result<String> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(text)
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf> {
        let buf = fs::read_link(path).map_err(IscsiError::Io)?;
        Ok(buf)
    }

    fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn kind(&self, path: &Path) -> Option<NodeKind> {
        let meta = fs::metadata(path).ok()?;
        let ft = meta.file_type();
        if ft.is_block_device() {
            Some(NodeKind::BlockDevice)
        } else if ft.is_dir() {
            Some(NodeKind::Dir)
        } else if ft.is_file() {
            Some(NodeKind::File)
        } else {
            None
        }
    }
}

pub(crate) fn first_line(text: &str) -> String {
    text.split('\n').next().unwrap_or("").to_string()
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(String),
    Link(PathBuf),
    Block,
}

/// An in-memory tree of absolute paths.
///
/// Parent directories are created implicitly. Symlink targets may be
/// relative, in which case they resolve against the link's directory.
#[derive(Debug, Default)]
pub struct MemTree {
    nodes: RwLock<BTreeMap<PathBuf, Node>>,
}

impl MemTree {
    pub fn new() -> Self {
        MemTree::default()
    }

    pub fn add_dir<P: AsRef<Path>>(&self, path: P) {
        self.insert(path.as_ref(), Node::Dir);
    }

    pub fn add_file<P: AsRef<Path>, S: AsRef<str>>(&self, path: P, text: S) {
        self.insert(path.as_ref(), Node::File(text.as_ref().to_string()));
    }

    pub fn add_link<P: AsRef<Path>, T: AsRef<Path>>(&self, path: P, target: T) {
        self.insert(path.as_ref(), Node::Link(target.as_ref().to_path_buf()));
    }

    pub fn add_block_device<P: AsRef<Path>>(&self, path: P) {
        self.insert(path.as_ref(), Node::Block);
    }

    /// Removes `path` and everything below it.
    pub fn remove<P: AsRef<Path>>(&self, path: P) {
        let path = path.as_ref();
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes.retain(|p, _| !p.starts_with(path));
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.keys().cloned().collect()
    }

    fn insert(&self, path: &Path, node: Node) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let mut parent = path.parent();
        while let Some(dir) = parent {
            if dir.as_os_str().is_empty() {
                break;
            }
            nodes.entry(dir.to_path_buf()).or_insert(Node::Dir);
            parent = dir.parent();
        }
        nodes.insert(path.to_path_buf(), node);
    }

    fn node(&self, path: &Path) -> Option<Node> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.get(path).cloned()
    }

    fn resolve(&self, path: &Path) -> Option<Node> {
        let mut current = path.to_path_buf();
        // bounded to catch link cycles
        for _ in 0..16 {
            match self.node(&current)? {
                Node::Link(target) => current = absolutize(&current, &target),
                node => return Some(node),
            }
        }
        None
    }
}

/// Joins a (possibly relative) link target onto the link's directory and
/// folds `..` components.
pub fn absolutize(link: &Path, target: &Path) -> PathBuf {
    let joined = match link.parent() {
        Some(dir) if target.is_relative() => dir.join(target),
        _ => target.to_path_buf(),
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

impl ResourceTree for MemTree {
    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let pattern = Pattern::new(pattern)?;
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        Ok(nodes
            .keys()
            .filter(|p| pattern.matches_path_with(p, options))
            .cloned()
            .collect())
    }

    fn read_text(&self, path: &Path) -> Result<String> {
        match self.resolve(path) {
            Some(Node::File(text)) => Ok(text),
            Some(_) => Err(anyhow!("{} is not a file", path.display())),
            None => Err(IscsiError::Io(std::io::ErrorKind::NotFound.into()))
                .with_context(|| format!("reading {}", path.display())),
        }
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf> {
        match self.node(path) {
            Some(Node::Link(target)) => Ok(target),
            _ => Err(IscsiError::Io(std::io::ErrorKind::InvalidInput.into()).into()),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        self.node(path).is_some()
    }

    fn kind(&self, path: &Path) -> Option<NodeKind> {
        match self.resolve(path)? {
            Node::Dir => Some(NodeKind::Dir),
            Node::File(_) => Some(NodeKind::File),
            Node::Block => Some(NodeKind::BlockDevice),
            Node::Link(_) => Some(NodeKind::Link),
        }
    }
}
