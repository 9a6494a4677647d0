//! Loop and device-mapper indirection between backing files and the block
//! devices that backstores actually reference.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info};

use crate::backstore::is_loop_device;
use crate::exec::{run_checked, Runner};
use crate::{args, file_name, ResourceTree};

/// Resolves device paths through `/sys/block`.
#[derive(Clone)]
pub struct DeviceResolver {
    tree: Arc<dyn ResourceTree>,
    sys_block: PathBuf,
}

impl DeviceResolver {
    pub fn new<P: AsRef<Path>>(tree: Arc<dyn ResourceTree>, sys_block: P) -> Self {
        DeviceResolver {
            tree,
            sys_block: sys_block.as_ref().to_path_buf(),
        }
    }

    /// Backing file of `/dev/loopN`, if it is an attached loop device.
    pub fn loop_backing_file(&self, dev: &Path) -> Option<PathBuf> {
        if !is_loop_device(dev) {
            return None;
        }
        let file = self
            .tree
            .read(&self.sys_block.join(file_name(dev)).join("loop/backing_file"))
            .ok()?;
        let file = file.trim().trim_end_matches(" (deleted)");
        if file.is_empty() {
            None
        } else {
            Some(PathBuf::from(file))
        }
    }

    /// Loop devices currently attached to `file`.
    pub fn loops_for_file(&self, file: &Path) -> Result<Vec<PathBuf>> {
        let pattern = self.sys_block.join("loop*").join("loop").join("backing_file");
        let loops = self
            .tree
            .glob(&pattern.to_string_lossy())?
            .into_iter()
            .filter_map(|p| {
                let backing = self.tree.read(&p).ok()?;
                let backing = backing.trim().trim_end_matches(" (deleted)");
                if Path::new(backing) != file {
                    return None;
                }
                // <sys_block>/loopN/loop/backing_file
                let name = p.parent()?.parent()?.file_name()?.to_string_lossy().to_string();
                Some(Path::new("/dev").join(name))
            })
            .collect();
        Ok(loops)
    }

    /// Device-mapper devices (e.g. dm-crypt) stacked on `dev`, both as
    /// `/dev/dm-N` and `/dev/mapper/<name>`.
    pub fn holders(&self, dev: &Path) -> Result<Vec<PathBuf>> {
        let pattern = self.sys_block.join("dm-*").join("slaves").join(file_name(dev));
        let mut holders = Vec::new();
        for slave in self.tree.glob(&pattern.to_string_lossy())? {
            let Some(dm) = slave.parent().and_then(|p| p.parent()) else {
                continue;
            };
            let dm_name = file_name(dm);
            holders.push(Path::new("/dev").join(&dm_name));
            if let Ok(name) = self.tree.read(&dm.join("dm").join("name")) {
                holders.push(Path::new("/dev/mapper").join(name.trim()));
            }
        }
        Ok(holders)
    }

    /// Every device path whose data is `path`: the path itself, loop
    /// devices over it and device-mapper devices over those.
    pub fn aliases(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut aliases = vec![path.to_path_buf()];
        for dev in self.loops_for_file(path)? {
            aliases.extend(self.holders(&dev)?);
            aliases.push(dev);
        }
        aliases.extend(self.holders(path)?);
        Ok(aliases)
    }

    /// Walks a device down to the file or device at the bottom of the
    /// loop/device-mapper stack.
    pub fn canonical(&self, dev: &Path) -> PathBuf {
        let mut current = dev.to_path_buf();
        // stacks are shallow, the bound only guards against odd sysfs loops
        for _ in 0..8 {
            match self.lower(&current) {
                Some(next) => current = next,
                None => break,
            }
        }
        current
    }

    fn lower(&self, dev: &Path) -> Option<PathBuf> {
        if let Some(file) = self.loop_backing_file(dev) {
            return Some(file);
        }

        let dm = if dev.starts_with("/dev/mapper") {
            self.dm_by_name(&file_name(dev))?
        } else if file_name(dev).starts_with("dm-") && dev.starts_with("/dev") {
            file_name(dev)
        } else {
            return None;
        };

        let slaves = self
            .tree
            .glob(&self.sys_block.join(&dm).join("slaves").join("*").to_string_lossy())
            .ok()?;
        slaves
            .first()
            .map(|slave| Path::new("/dev").join(file_name(slave)))
    }

    fn dm_by_name(&self, name: &str) -> Option<String> {
        let pattern = self.sys_block.join("dm-*").join("dm").join("name");
        self.tree
            .glob(&pattern.to_string_lossy())
            .ok()?
            .into_iter()
            .find(|p| {
                self.tree
                    .read(p)
                    .map(|n| n.trim() == name)
                    .unwrap_or(false)
            })
            .and_then(|p| Some(file_name(p.parent()?.parent()?)))
    }
}

/// Attaches and detaches loop devices with `losetup`.
#[derive(Clone)]
pub struct LoopDevices {
    runner: Arc<dyn Runner>,
    losetup: String,
    timeout: Duration,
}

impl LoopDevices {
    pub fn new(runner: Arc<dyn Runner>, losetup: &str, timeout: Duration) -> Self {
        LoopDevices {
            runner,
            losetup: losetup.to_string(),
            timeout,
        }
    }

    pub fn attach(&self, file: &Path, read_only: bool) -> Result<PathBuf> {
        let mut args = args!["--find", "--show"];
        if read_only {
            args.push("--read-only".to_string());
        }
        args.push(file.to_string_lossy().to_string());

        let out = run_checked(self.runner.as_ref(), &self.losetup, &args, self.timeout)?;
        let dev = out.stdout.trim();
        if dev.is_empty() {
            anyhow::bail!("losetup returned no device for {}", file.display())
        }
        info!("attached {} to {}", file.display(), dev);
        Ok(PathBuf::from(dev))
    }

    pub fn detach(&self, dev: &Path) -> Result<()> {
        run_checked(
            self.runner.as_ref(),
            &self.losetup,
            &args!["-d", dev.to_string_lossy()],
            self.timeout,
        )?;
        debug!("detached {}", dev.display());
        Ok(())
    }
}
