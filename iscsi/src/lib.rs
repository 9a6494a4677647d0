//! Control plane for exposing backup images and block devices as LIO iSCSI
//! targets, and for driving the local and remote initiators that consume them.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::Path;

use anyhow::Result;

mod backstore;
mod cleaner;
mod config;
mod devices;
mod error;
pub mod exec;
mod initiator;
pub mod lock;
mod marker;
pub mod naming;
pub mod remote;
mod settings;
mod target;
mod target_store;
mod tree;

#[cfg(test)]
mod fake;

pub use backstore::*;
pub use cleaner::*;
pub use config::*;
pub use devices::*;
pub use error::*;
pub use initiator::*;
pub use marker::*;
pub use settings::*;
pub use target::*;
pub use target_store::*;
pub use tree::*;

/// A kernel object that loads itself from a directory of the resource tree.
pub trait Layer {
    fn root(&self) -> &Path;

    fn load(&mut self, tree: &dyn ResourceTree, root: &Path) -> Result<()>;
}

/// `key=value` attributes passed through to targetcli.
#[derive(Debug, Default, Clone)]
pub struct Options {
    inner: BTreeMap<String, String>,
}

impl Options {
    pub fn new() -> Self {
        Options {
            inner: BTreeMap::new(),
        }
    }

    pub fn insert<S: AsRef<str>>(&mut self, k: S, v: S) -> &mut Self {
        self.inner
            .insert(k.as_ref().to_string(), v.as_ref().to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn to_args(&self) -> Vec<String> {
        self.inner
            .iter()
            .map(|(key, value)| key.to_owned() + "=" + value)
            .collect()
    }
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .unwrap_or(OsStr::new(""))
        .to_string_lossy()
        .to_string()
}
