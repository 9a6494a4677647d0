//! Lifecycle of the iSCSI targets this host exposes through LIO.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Serialize;

use crate::config::sibling;
use crate::exec::{run_checked, Output, ProcessRunner, Runner};
use crate::lock::{acquire, FileLock, Lock, LockGuard};
use crate::marker::now;
use crate::naming::{self, TargetNames};
use crate::target::{lun_ids, read_auth, TPG_DIR, TPG_NODE};
use crate::{
    args, kind_of, list_backstores, Backstore, BackstoreKind, ChapDirection, ChapUsers,
    DeviceResolver, FileRestoreMarker, IscsiError, Layer, LoopDevices, NodeKind, Options,
    ResourceTree, RestoreMarker, SavedConfig, Settings, SysfsTree, Target,
};

static ISCSI_DIR: &str = "iscsi";

pub const CHAP_MIN_PASSWORD: usize = 12;

#[derive(Debug, Default, Clone)]
pub struct LunOptions {
    pub read_only: bool,
    pub write_back: bool,
    /// Inquiry unit serial number; LIO generates one when unset.
    pub wwn: Option<String>,
    /// Extra backstore attributes, e.g. `emulate_tpu=1`.
    pub attributes: Options,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LunInfo {
    pub index: u32,
    pub backstore: String,
    /// Device recorded in the backstore, e.g. `/dev/loop3`.
    pub device: PathBuf,
    /// `device` with loop and device-mapper layers resolved.
    pub path: PathBuf,
}

/// The part of a protected agent the store needs for cleanup.
pub trait AgentVolumes {
    fn name(&self) -> &str;

    /// Backing image of every volume included in the agent's backups.
    fn included_volume_images(&self) -> Vec<PathBuf>;
}

pub struct TargetStore {
    settings: Settings,
    names: TargetNames,
    tree: Arc<dyn ResourceTree>,
    runner: Arc<dyn Runner>,
    lock: Arc<dyn Lock>,
    marker: Arc<dyn RestoreMarker>,
    devices: DeviceResolver,
    loops: LoopDevices,
}

impl TargetStore {
    pub fn new(
        settings: Settings,
        tree: Arc<dyn ResourceTree>,
        runner: Arc<dyn Runner>,
        lock: Arc<dyn Lock>,
        marker: Arc<dyn RestoreMarker>,
    ) -> Self {
        let names = TargetNames::new(settings.target_namespace.clone());
        let devices = DeviceResolver::new(tree.clone(), &settings.sys_block_root);
        let loops = LoopDevices::new(
            runner.clone(),
            &settings.losetup,
            settings.timeouts.command(),
        );

        TargetStore {
            settings,
            names,
            tree,
            runner,
            lock,
            marker,
            devices,
            loops,
        }
    }

    /// Store over the live kernel, serialized with every other process on
    /// the host through the configured lock file.
    /// ```no_run
    /// use iscsi::{Settings, TargetStore};
    ///
    /// let store = TargetStore::system(Settings::default());
    /// let name = store.make_target_name("web01", "");
    /// store.create_target(&name)?;
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn system(settings: Settings) -> Self {
        let lock = Arc::new(FileLock::new(&settings.lock_file));
        let marker = Arc::new(FileRestoreMarker::new(&settings.restored_marker));
        TargetStore::new(
            settings,
            Arc::new(SysfsTree),
            Arc::new(ProcessRunner),
            lock,
            marker,
        )
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn names(&self) -> &TargetNames {
        &self.names
    }

    pub fn target_exists(&self, name: &str) -> bool {
        self.exists(&naming::normalize_target_name(name))
    }

    pub fn make_target_name(&self, host: &str, prefix: &str) -> String {
        self.names.make(host, prefix)
    }

    pub fn make_temporary_target_name(&self, host: &str, prefix: &str) -> String {
        self.names.make_temporary(host, prefix)
    }

    /// Creates a target with a single, enabled portal group that any
    /// initiator may log into. Returns the normalized name.
    pub fn create_target(&self, name: &str) -> Result<String> {
        let name = naming::normalize_target_name(name);
        let _guard = self.guard()?;

        if self.exists(&name) {
            anyhow::bail!(IscsiError::TargetExists(name))
        }
        self.targetcli(&args!["/iscsi", "create", name])?;

        if let Err(e) = self.setup_tpg(&name) {
            warn!("configuring {} failed, removing it: {:#}", name, e);
            if let Err(e) = self.targetcli(&args!["/iscsi", "delete", name]) {
                warn!("removing half-created target {}: {:#}", name, e);
            }
            return Err(e);
        }

        info!("created target {}", name);
        Ok(name)
    }

    fn setup_tpg(&self, name: &str) -> Result<()> {
        let tpg = &self.settings.tpg;
        let node = tpg_node(name);

        let depth = tpg.cmdsn_depth.to_string();
        let mut attributes = Options::new();
        attributes
            .insert("generate_node_acls", "1")
            .insert("demo_mode_write_protect", "0")
            .insert("cache_dynamic_acls", "1")
            .insert("default_cmdsn_depth", depth.as_str())
            .insert("authentication", "0");
        let mut cmd = args![node, "set", "attribute"];
        cmd.extend(attributes.to_args());
        self.targetcli(&cmd)?;

        let max_burst = tpg.max_burst_length.to_string();
        let first_burst = tpg.first_burst_length.to_string();
        let mut parameters = Options::new();
        parameters
            .insert("HeaderDigest", tpg.header_digest.as_str())
            .insert("DataDigest", tpg.data_digest.as_str())
            .insert("MaxBurstLength", max_burst.as_str())
            .insert("FirstBurstLength", first_burst.as_str())
            .insert("InitialR2T", yes_no(tpg.initial_r2t))
            .insert("ImmediateData", yes_no(tpg.immediate_data));
        let mut cmd = args![node, "set", "parameter"];
        cmd.extend(parameters.to_args());
        self.targetcli(&cmd)?;

        Ok(())
    }

    /// Exposes `path` (a regular file or a block device) as the next LUN of
    /// `target` and returns the LUN id.
    ///
    /// Files are wrapped in a loop device first. A backstore already mapping
    /// `path` under the expected name is reused.
    pub fn add_lun(&self, target: &str, path: &Path, options: &LunOptions) -> Result<u32> {
        let target = naming::normalize_target_name(target);
        let _guard = self.guard()?;

        if !self.exists(&target) {
            anyhow::bail!(IscsiError::NoTarget(target))
        }
        match self.tree.kind(path) {
            Some(NodeKind::File) | Some(NodeKind::BlockDevice) => {}
            _ => anyhow::bail!(IscsiError::InvalidPath(path.display().to_string())),
        }

        let name = naming::backstore_name(path, naming::is_temporary_target(&target));
        let created = self.ensure_backstore(path, &name, options)?;

        let result = self.map_lun(&target, &name);
        if result.is_err() && created {
            if let Err(e) = self.delete_backstore_locked(BackstoreKind::Block, &name) {
                warn!("removing backstore {} after failed LUN: {:#}", name, e);
            }
        }
        let lun = result?;

        info!("added LUN {} ({} -> {}) to {}", lun, name, path.display(), target);
        Ok(lun)
    }

    /// Maps backstore `name` as the next LUN of `target`, which must gain
    /// exactly one LUN.
    fn map_lun(&self, target: &str, name: &str) -> Result<u32> {
        let root = self.target_root(target);
        let before = lun_ids(self.tree.as_ref(), &root)?;

        self.targetcli(&args![
            format!("{}/luns", tpg_node(target)),
            "create",
            BackstoreKind::Block.object_path(name)
        ])?;

        let after = lun_ids(self.tree.as_ref(), &root)?;
        let added = after
            .into_iter()
            .filter(|id| !before.contains(id))
            .collect::<Vec<u32>>();
        if added.len() != 1 {
            anyhow::bail!(IscsiError::UnexpectedLunCount {
                target: target.to_string(),
                found: added.len(),
            })
        }
        Ok(added[0])
    }

    /// Returns whether a new backstore was created for `path`.
    fn ensure_backstore(&self, path: &Path, name: &str, options: &LunOptions) -> Result<bool> {
        if let Some(existing) = self.find_backstore(BackstoreKind::Block, name)? {
            if self.devices.canonical(existing.dev()) == path {
                debug!("reusing backstore {} for {}", name, path.display());
                return Ok(false);
            }
        }

        let attached = if self.tree.kind(path) == Some(NodeKind::File) {
            Some(self.loops.attach(path, options.read_only)?)
        } else {
            None
        };
        let device = attached.as_deref().unwrap_or(path);

        let result = match self.create_backstore(name, device, options) {
            Ok(()) => Ok(()),
            Err(e) => self.retry_backstore(path, name, device, options, e),
        };

        if result.is_err() {
            if let Some(dev) = &attached {
                if let Err(e) = self.loops.detach(dev) {
                    warn!("detaching {} after failed backstore: {:#}", dev.display(), e);
                }
            }
        }
        result.map(|()| true)
    }

    /// A failed create on a path no LUN uses is a leftover from an
    /// interrupted run: drop the stale backstore and try once more.
    fn retry_backstore(
        &self,
        path: &Path,
        name: &str,
        device: &Path,
        options: &LunOptions,
        err: anyhow::Error,
    ) -> Result<()> {
        let users = self.targets_by_path(path)?;
        if !users.is_empty() {
            warn!(
                "creating backstore {} failed while {} is exported by {:?}: {:#}",
                name,
                path.display(),
                users,
                err
            );
            anyhow::bail!(IscsiError::BackstoreInUse(path.display().to_string()))
        }

        warn!("creating backstore {} failed, removing stale one: {:#}", name, err);
        let plugin = format!("/backstores/{}", BackstoreKind::Block.plugin());
        if let Err(e) = self.targetcli(&args![plugin, "delete", name]) {
            debug!("no stale backstore {}: {:#}", name, e);
        }
        self.create_backstore(name, device, options)
    }

    fn create_backstore(&self, name: &str, device: &Path, options: &LunOptions) -> Result<()> {
        let kind = BackstoreKind::Block;
        let mut cmd = args![
            format!("/backstores/{}", kind.plugin()),
            "create",
            format!("name={}", name),
            format!("dev={}", device.display()),
            format!("readonly={}", options.read_only)
        ];
        if let Some(wwn) = &options.wwn {
            cmd.push(format!("wwn={}", wwn));
        }
        self.targetcli(&cmd)?;

        let mut attributes = options.attributes.clone();
        attributes.insert("emulate_write_cache", if options.write_back { "1" } else { "0" });
        let mut cmd = args![kind.object_path(name), "set", "attribute"];
        cmd.extend(attributes.to_args());
        self.targetcli(&cmd)?;

        debug!("created backstore {} on {}", name, device.display());
        Ok(())
    }

    /// Sets the CHAP credential for one direction and turns authentication
    /// on. With `close_sessions`, the portal group is disabled around the
    /// change so no initiator sees a half-written credential.
    pub fn add_chap_user(
        &self,
        target: &str,
        direction: ChapDirection,
        user: &str,
        password: &str,
        close_sessions: bool,
    ) -> Result<()> {
        let target = naming::normalize_target_name(target);
        if password.chars().count() < CHAP_MIN_PASSWORD {
            anyhow::bail!(IscsiError::ChapPasswordTooShort(CHAP_MIN_PASSWORD))
        }

        let _guard = self.guard()?;
        let tpg = self.tpg_root(&target)?;
        let (user_file, _) = direction.auth_files();
        if read_auth(self.tree.as_ref(), &tpg, user_file).is_some() {
            anyhow::bail!(IscsiError::ChapUserExists {
                target,
                direction: direction.to_string(),
            })
        }

        if close_sessions {
            if let Err(e) = self.set_enabled(&target, false) {
                warn!("closing sessions on {}: {:#}", target, e);
            }
        }
        let result = self
            .set_chap(&target, direction, user, password)
            .and_then(|_| self.set_tpg_attribute(&target, "authentication", "1"));
        if close_sessions {
            if let Err(e) = self.set_enabled(&target, true) {
                warn!("reopening sessions on {}: {:#}", target, e);
            }
        }
        result?;

        info!("added {} CHAP user {} to {}", direction, user, target);
        Ok(())
    }

    /// Clears the credential of `direction` if it belongs to `user`.
    /// Authentication is switched off once no credential is left.
    pub fn remove_chap_user(&self, target: &str, direction: ChapDirection, user: &str) -> Result<()> {
        let target = naming::normalize_target_name(target);
        let _guard = self.guard()?;
        let tpg = self.tpg_root(&target)?;

        let (user_file, _) = direction.auth_files();
        match read_auth(self.tree.as_ref(), &tpg, user_file) {
            Some(stored) if stored == user => {}
            _ => anyhow::bail!(IscsiError::NoChapUser {
                target,
                direction: direction.to_string(),
                user: user.to_string(),
            }),
        }

        self.set_chap(&target, direction, "", "")?;
        if self.chap_users(&tpg).is_empty() {
            self.set_tpg_attribute(&target, "authentication", "0")?;
            debug!("authentication disabled on {}", target);
        }

        info!("removed {} CHAP user {} from {}", direction, user, target);
        Ok(())
    }

    pub fn get_chap_users(&self, target: &str) -> Result<ChapUsers> {
        let tpg = self.tpg_root(&naming::normalize_target_name(target))?;
        Ok(self.chap_users(&tpg))
    }

    pub fn get_chap_password(&self, target: &str, direction: ChapDirection) -> Result<Option<String>> {
        let tpg = self.tpg_root(&naming::normalize_target_name(target))?;
        let (_, password_file) = direction.auth_files();
        Ok(read_auth(self.tree.as_ref(), &tpg, password_file))
    }

    fn chap_users(&self, tpg: &Path) -> ChapUsers {
        let (user, _) = ChapDirection::Incoming.auth_files();
        let (mutual_user, _) = ChapDirection::Outgoing.auth_files();
        ChapUsers {
            incoming: read_auth(self.tree.as_ref(), tpg, user),
            outgoing: read_auth(self.tree.as_ref(), tpg, mutual_user),
        }
    }

    fn set_chap(&self, target: &str, direction: ChapDirection, user: &str, password: &str) -> Result<()> {
        let (user_key, password_key) = direction.auth_keys();
        self.targetcli(&args![
            tpg_node(target),
            "set",
            "auth",
            format!("{}={}", user_key, user),
            format!("{}={}", password_key, password)
        ])?;
        Ok(())
    }

    fn set_tpg_attribute(&self, target: &str, key: &str, value: &str) -> Result<()> {
        self.targetcli(&args![
            tpg_node(target),
            "set",
            "attribute",
            format!("{}={}", key, value)
        ])?;
        Ok(())
    }

    /// Names of every target, sorted.
    pub fn list_targets(&self) -> Result<Vec<String>> {
        Ok(self
            .load_targets()?
            .iter()
            .map(|t| t.name().to_string())
            .collect())
    }

    pub fn get_target(&self, name: &str) -> Result<Target> {
        self.load_target(&naming::normalize_target_name(name))
    }

    /// Targets with a LUN whose backstore maps `path`, directly or through
    /// loop and device-mapper devices.
    pub fn get_targets_by_path(&self, path: &Path) -> Result<Vec<String>> {
        self.targets_by_path(path)
    }

    pub fn get_backstores_by_path(&self, path: &Path) -> Result<Vec<Backstore>> {
        self.backstores_by_path(path)
    }

    pub fn list_luns_for_target(&self, target: &str) -> Result<Vec<LunInfo>> {
        let target = self.load_target(&naming::normalize_target_name(target))?;
        let backstores = list_backstores(self.tree.as_ref(), &self.settings.configfs_root)?;

        target
            .luns()
            .values()
            .map(|lun| -> Result<LunInfo> {
                let backstore = backstores
                    .iter()
                    .find(|b| b.kind() == lun.backstore_kind() && b.name() == lun.backstore())
                    .ok_or_else(|| IscsiError::NoBackstore(lun.backstore().to_string()))?;
                let device = backstore.dev().to_path_buf();
                Ok(LunInfo {
                    index: lun.index(),
                    backstore: lun.backstore().to_string(),
                    path: self.devices.canonical(&device),
                    device,
                })
            })
            .collect()
    }

    /// GUIDs of the backup volumes exported by `target`.
    pub fn list_volume_guids_for_target(&self, target: &str) -> Result<Vec<String>> {
        Ok(self
            .list_luns_for_target(target)?
            .iter()
            .filter_map(|lun| naming::volume_guid(&lun.path))
            .collect())
    }

    pub fn list_sessions_on_target(&self, target: &str) -> Result<Vec<String>> {
        let target = self.load_target(&naming::normalize_target_name(target))?;
        Ok(target.sessions().to_vec())
    }

    /// Disables the portal group, dropping every session. Best effort:
    /// failures are logged and reported as `false`.
    pub fn close_sessions_on_target(&self, target: &str) -> bool {
        self.toggle(target, false)
    }

    pub fn allow_sessions_on_target(&self, target: &str) -> bool {
        self.toggle(target, true)
    }

    fn toggle(&self, target: &str, enable: bool) -> bool {
        let target = naming::normalize_target_name(target);
        let result = self
            .guard()
            .and_then(|_guard| self.set_enabled(&target, enable));
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "{} sessions on {} failed: {:#}",
                    if enable { "allowing" } else { "closing" },
                    target,
                    e
                );
                false
            }
        }
    }

    fn set_enabled(&self, target: &str, enable: bool) -> Result<()> {
        if !self.exists(target) {
            anyhow::bail!(IscsiError::NoTarget(target.to_string()))
        }
        let command = if enable { "enable" } else { "disable" };
        self.targetcli(&args![tpg_node(target), command])?;
        Ok(())
    }

    /// Deletes the target together with the backstores (and loop devices)
    /// of its LUNs. Backstores another target still exports are kept.
    pub fn delete_target(&self, target: &str) -> Result<()> {
        let target = naming::normalize_target_name(target);
        let _guard = self.guard()?;
        self.delete_target_locked(&target)
    }

    fn delete_target_locked(&self, name: &str) -> Result<()> {
        if !self.exists(name) {
            anyhow::bail!(IscsiError::NoTarget(name.to_string()))
        }
        if let Err(e) = self.set_enabled(name, false) {
            warn!("closing sessions on {}: {:#}", name, e);
        }

        let target = self.load_target(name)?;
        let others = self
            .load_targets()?
            .into_iter()
            .filter(|t| t.name() != name)
            .collect::<Vec<Target>>();

        for lun in target.luns().values() {
            let shared = others.iter().any(|t| {
                t.luns()
                    .values()
                    .any(|l| l.backstore_kind() == lun.backstore_kind() && l.backstore() == lun.backstore())
            });
            if shared {
                info!("backstore {} is still exported elsewhere, keeping it", lun.backstore());
                continue;
            }
            match self.delete_backstore_locked(lun.backstore_kind(), lun.backstore()) {
                Err(e) if kind_of(&e).map(|k| k.is_not_found()).unwrap_or(false) => {
                    debug!("backstore {} already gone", lun.backstore());
                }
                res => res?,
            }
        }

        self.targetcli(&args!["/iscsi", "delete", name])?;
        info!("deleted target {}", name);
        Ok(())
    }

    /// Deletes a backstore and detaches the loop device it was built on.
    pub fn delete_backstore(&self, kind: BackstoreKind, name: &str) -> Result<()> {
        let _guard = self.guard()?;
        self.delete_backstore_locked(kind, name)
    }

    fn delete_backstore_locked(&self, kind: BackstoreKind, name: &str) -> Result<()> {
        let backstore = self
            .find_backstore(kind, name)?
            .ok_or_else(|| IscsiError::NoBackstore(name.to_string()))?;

        // a busy loop device is auto-cleared once the backstore releases it
        let dev = backstore.dev();
        if backstore.is_loop_backed() && self.devices.loop_backing_file(dev).is_some() {
            self.loops.detach(dev)?;
        }
        let plugin = format!("/backstores/{}", kind.plugin());
        self.targetcli(&args![plugin, "delete", name])?;

        info!("deleted backstore {}", name);
        Ok(())
    }

    /// Removes every target and backstore exporting one of the agent's
    /// volume images or their checksum files.
    pub fn remove_agent_entities(&self, agent: &dyn AgentVolumes) -> Result<()> {
        let _guard = self.guard()?;

        for image in agent.included_volume_images() {
            let mut paths = vec![image.clone()];
            paths.extend(naming::checksum_path(&image));

            for path in paths {
                for target in self.targets_by_path(&path)? {
                    self.delete_target_locked(&target)?;
                }
                for backstore in self.backstores_by_path(&path)? {
                    self.delete_backstore_locked(backstore.kind(), backstore.name())?;
                }
            }
        }

        info!("removed iSCSI entities of agent {}", agent.name());
        Ok(())
    }

    /// Persists every durable target. Returns `false` without writing when
    /// the kernel state has not been restored since boot.
    pub fn save_configuration(&self) -> Result<bool> {
        let _guard = self.guard()?;
        // a concurrent clear resets the flag, so check it under the lock
        if !self.marker.is_set()? {
            warn!("target configuration not restored since boot, refusing to save");
            return Ok(false);
        }

        let file = &self.settings.saved_config;
        if let Some(dir) = file.parent() {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }

        let dump = sibling(file, ".dump");
        self.targetctl(&args!["save", dump.display()])?;
        let config = SavedConfig::read(&dump);
        if let Err(e) = fs::remove_file(&dump) {
            debug!("removing {}: {}", dump.display(), e);
        }
        let mut config = config?;

        let pruned = config.prune(&self.settings.restore_roots);
        if !pruned.targets.is_empty() || !pruned.storage_objects.is_empty() {
            debug!(
                "not persisting targets {:?}, storage objects {:?}",
                pruned.targets, pruned.storage_objects
            );
        }

        config.write_to(file)?;
        info!("saved target configuration to {}", file.display());
        Ok(true)
    }

    /// Loads the persisted configuration into the kernel, if there is one,
    /// and marks the configuration as restored.
    pub fn restore_configuration(&self) -> Result<()> {
        let _guard = self.guard()?;
        let file = &self.settings.saved_config;

        if file.exists() {
            self.targetctl(&args!["restore", file.display()])?;
            info!("restored target configuration from {}", file.display());
        } else {
            info!("no saved target configuration at {}", file.display());
        }

        self.mark_configuration_restored()
    }

    /// Wipes every target and backstore from the kernel.
    pub fn clear_configuration(&self) -> Result<()> {
        let _guard = self.guard()?;

        let loops = list_backstores(self.tree.as_ref(), &self.settings.configfs_root)?
            .into_iter()
            .filter(|b| b.is_loop_backed())
            .map(|b| b.dev().to_path_buf())
            .collect::<Vec<PathBuf>>();

        self.targetctl(&args!["clear"])?;
        for dev in loops {
            if let Err(e) = self.loops.detach(&dev) {
                warn!("detaching {}: {:#}", dev.display(), e);
            }
        }

        self.marker.clear()?;
        info!("cleared target configuration");
        Ok(())
    }

    pub fn mark_configuration_restored(&self) -> Result<()> {
        if let Some(at) = self.marker.restored_at()? {
            debug!("configuration already marked restored at {}", at);
            return Ok(());
        }
        self.marker.set(now())
    }

    pub fn is_configuration_restored(&self) -> Result<bool> {
        self.marker.is_set()
    }

    fn guard(&self) -> Result<LockGuard<'_>> {
        acquire(self.lock.as_ref(), self.settings.timeouts.lock())
    }

    fn targetcli(&self, args: &[String]) -> Result<Output> {
        run_checked(
            self.runner.as_ref(),
            &self.settings.targetcli,
            args,
            self.settings.timeouts.command(),
        )
    }

    fn targetctl(&self, args: &[String]) -> Result<Output> {
        run_checked(
            self.runner.as_ref(),
            &self.settings.targetctl,
            args,
            self.settings.timeouts.config(),
        )
    }

    fn target_root(&self, name: &str) -> PathBuf {
        self.settings.configfs_root.join(ISCSI_DIR).join(name)
    }

    fn exists(&self, name: &str) -> bool {
        !name.is_empty() && self.tree.kind(&self.target_root(name)) == Some(NodeKind::Dir)
    }

    fn tpg_root(&self, name: &str) -> Result<PathBuf> {
        if !self.exists(name) {
            anyhow::bail!(IscsiError::NoTarget(name.to_string()))
        }
        Ok(self.target_root(name).join(TPG_DIR))
    }

    fn load_target(&self, name: &str) -> Result<Target> {
        if !self.exists(name) {
            anyhow::bail!(IscsiError::NoTarget(name.to_string()))
        }
        let mut target = Target::default();
        target.load(self.tree.as_ref(), &self.target_root(name))?;
        Ok(target)
    }

    fn load_targets(&self) -> Result<Vec<Target>> {
        let pattern = self
            .settings
            .configfs_root
            .join(ISCSI_DIR)
            .join("*")
            .join(TPG_DIR);

        let mut targets = Vec::new();
        for tpg in self.tree.glob(&pattern.to_string_lossy())? {
            let Some(root) = tpg.parent() else {
                continue;
            };
            let mut target = Target::default();
            target.load(self.tree.as_ref(), root)?;
            targets.push(target);
        }
        Ok(targets)
    }

    fn find_backstore(&self, kind: BackstoreKind, name: &str) -> Result<Option<Backstore>> {
        let mut found = list_backstores(self.tree.as_ref(), &self.settings.configfs_root)?
            .into_iter()
            .filter(|b| b.kind() == kind && b.name() == name)
            .collect::<Vec<Backstore>>();

        if found.len() > 1 {
            anyhow::bail!(IscsiError::InconsistentState(format!(
                "{} {} backstores named {}",
                found.len(),
                kind.plugin(),
                name
            )))
        }
        Ok(found.pop())
    }

    fn backstores_by_path(&self, path: &Path) -> Result<Vec<Backstore>> {
        let aliases = self.devices.aliases(path)?;
        let expected = [
            naming::backstore_name(path, false),
            naming::backstore_name(path, true),
        ];

        let mut found = Vec::new();
        for backstore in list_backstores(self.tree.as_ref(), &self.settings.configfs_root)? {
            let dev = backstore.dev();
            if !aliases.iter().any(|a| a == dev) && self.devices.canonical(dev) != path {
                continue;
            }
            if !expected.iter().any(|n| n == backstore.name()) {
                warn!(
                    "backstore {} maps {} but {} was expected, using it anyway",
                    backstore.name(),
                    path.display(),
                    expected[0]
                );
            }
            found.push(backstore);
        }
        Ok(found)
    }

    fn targets_by_path(&self, path: &Path) -> Result<Vec<String>> {
        let backstores = self.backstores_by_path(path)?;
        if backstores.is_empty() {
            return Ok(Vec::new());
        }

        Ok(self
            .load_targets()?
            .into_iter()
            .filter(|t| {
                t.luns().values().any(|lun| {
                    backstores
                        .iter()
                        .any(|b| b.kind() == lun.backstore_kind() && b.name() == lun.backstore())
                })
            })
            .map(|t| t.name().to_string())
            .collect())
    }
}

fn tpg_node(target: &str) -> String {
    format!("/iscsi/{}/{}", target, TPG_NODE)
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "Yes"
    } else {
        "No"
    }
}
