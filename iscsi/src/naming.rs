//! Target (IQN) and backstore naming.

use std::path::{Path, PathBuf};

/// Separates the namespace of a temporary target from the rest of its name.
pub const TEMPORARY_MARKER: &str = ".temp:";
pub const TEMPORARY_SUFFIX: &str = "_temp";
pub const IMAGE_EXTENSION: &str = ".datto";
pub const CHECKSUM_EXTENSION: &str = ".checksum";

/// IQNs may not contain underscores.
pub fn normalize_target_name(name: &str) -> String {
    name.replace('_', "-")
}

pub fn is_temporary_target(name: &str) -> bool {
    name.contains(TEMPORARY_MARKER)
}

#[derive(Debug, Clone)]
pub struct TargetNames {
    namespace: String,
}

impl TargetNames {
    pub fn new<S: Into<String>>(namespace: S) -> Self {
        TargetNames {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// `<namespace>:<prefix>:<host>`, or `<namespace>:<host>` without a prefix.
    pub fn make(&self, host: &str, prefix: &str) -> String {
        self.build(&format!("{}:", self.namespace), host, prefix)
    }

    /// Same shape as [`TargetNames::make`] under the temporary namespace.
    /// Temporary targets are never persisted.
    pub fn make_temporary(&self, host: &str, prefix: &str) -> String {
        let namespace = format!("{}{}", self.namespace, TEMPORARY_MARKER);
        self.build(&namespace, host, prefix)
    }

    fn build(&self, namespace: &str, host: &str, prefix: &str) -> String {
        let name = if prefix.is_empty() {
            format!("{}{}", namespace, host)
        } else {
            format!("{}{}:{}", namespace, prefix, host)
        };
        normalize_target_name(&name)
    }

    /// Whether `name` was built by this namespace for `host`.
    pub fn belongs_to(&self, name: &str, host: &str) -> bool {
        let persistent = format!("{}:", self.namespace);
        let temporary = format!("{}{}", self.namespace, TEMPORARY_MARKER);
        if !name.starts_with(&persistent) && !name.starts_with(&temporary) {
            return false;
        }
        let host = normalize_target_name(host);
        name.rsplit(':').next() == Some(host.as_str())
    }
}

/// 32-bit FNV-1a.
pub fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Short deterministic backstore name for a backing path.
///
/// Backstore names end up in the 16-byte SCSI inquiry product field, so the
/// name is a hash of `<parent dir>_<file name without .datto>`, with
/// `_temp` appended for temporary backstores (at most 13 characters).
pub fn backstore_name<P: AsRef<Path>>(path: P, temporary: bool) -> String {
    let path = path.as_ref();
    let parent = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let file = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let base = file.strip_suffix(IMAGE_EXTENSION).unwrap_or(&file);

    let mut name = format!("{:08x}", fnv1a32(format!("{}_{}", parent, base).as_bytes()));
    if temporary {
        name.push_str(TEMPORARY_SUFFIX);
    }
    name
}

pub fn is_temporary_backstore(name: &str) -> bool {
    name.ends_with(TEMPORARY_SUFFIX)
}

/// Volume GUID of an image path: its file name without the image extension.
pub fn volume_guid<P: AsRef<Path>>(path: P) -> Option<String> {
    let file = path.as_ref().file_name()?.to_string_lossy().to_string();
    file.strip_suffix(IMAGE_EXTENSION).map(|s| s.to_string())
}

/// Checksum companion of an image: `<name>.checksum` next to `<name>.datto`.
pub fn checksum_path<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    let path = path.as_ref();
    let file = path.file_name()?.to_string_lossy().to_string();
    let base = file.strip_suffix(IMAGE_EXTENSION)?;
    Some(path.with_file_name(format!("{}{}", base, CHECKSUM_EXTENSION)))
}
