//! Test doubles: a scripted LIO kernel behind `targetcli`/`targetctl`/
//! `losetup`, and a scripted remote executor.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};

use crate::exec::{command_line, Output, Runner};
use crate::remote::{RemoteExecutor, RemoteResponse};
use crate::{
    list_backstores, lock::MemLock, BackstoreKind, Layer, MemRestoreMarker, MemTree,
    ResourceTree, SavedConfig, Settings, Target, TargetStore,
};

pub(crate) const CONFIGFS: &str = "/sys/kernel/config/target";

/// A LIO configfs tree in memory, mutated by the same commands the store
/// issues.
pub(crate) struct FakeKernel {
    pub tree: Arc<MemTree>,
    calls: Mutex<Vec<String>>,
    failures: Mutex<Vec<(String, usize)>>,
    next_loop: AtomicU32,
}

impl FakeKernel {
    pub fn new() -> Arc<Self> {
        let tree = Arc::new(MemTree::new());
        tree.add_dir(Path::new(CONFIGFS).join("iscsi"));
        tree.add_dir(Path::new(CONFIGFS).join("core"));
        tree.add_dir("/sys/block");
        Arc::new(FakeKernel {
            tree,
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            next_loop: AtomicU32::new(0),
        })
    }

    /// Fails the next `times` commands whose command line contains `needle`.
    pub fn fail(&self, needle: &str, times: usize) {
        self.failures
            .lock()
            .unwrap()
            .push((needle.to_string(), times));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn add_image<P: AsRef<Path>>(&self, path: P) {
        self.tree.add_file(path, "");
    }

    pub fn add_session(&self, target: &str, initiator: &str) {
        let path = self.tpg(target).join("dynamic_sessions");
        let mut sessions = self.tree.read_text(&path).unwrap_or_default();
        sessions.push_str(initiator);
        sessions.push('\n');
        self.tree.add_file(path, sessions);
    }

    pub fn loop_devices(&self) -> Vec<PathBuf> {
        self.tree
            .glob("/dev/loop*")
            .unwrap_or_default()
    }

    fn target_root(&self, iqn: &str) -> PathBuf {
        Path::new(CONFIGFS).join("iscsi").join(iqn)
    }

    fn tpg(&self, iqn: &str) -> PathBuf {
        self.target_root(iqn).join("tpgt_1")
    }

    fn hba(&self, plugin: &str) -> Option<PathBuf> {
        let kind = BackstoreKind::from_plugin(plugin)?;
        let hba = match kind {
            BackstoreKind::Block => "iblock_0",
            BackstoreKind::Fileio => "fileio_0",
        };
        Some(Path::new(CONFIGFS).join("core").join(hba))
    }

    fn should_fail(&self, line: &str) -> bool {
        let mut failures = self.failures.lock().unwrap();
        for (needle, remaining) in failures.iter_mut() {
            if *remaining > 0 && line.contains(needle.as_str()) {
                *remaining -= 1;
                return true;
            }
        }
        false
    }

    fn targetcli(&self, args: &[String]) -> Output {
        let node = args.first().map(String::as_str).unwrap_or("");
        let command = args.get(1).map(String::as_str).unwrap_or("");
        let rest = args.get(2..).unwrap_or(&[]);

        if node == "/iscsi" {
            let iqn = rest.first().cloned().unwrap_or_default();
            return match command {
                "create" => self.create_target(&iqn),
                "delete" if self.tree.exists(&self.target_root(&iqn)) => {
                    self.tree.remove(self.target_root(&iqn));
                    Output::ok("Deleted Target.\n")
                }
                _ => Output::failed(1, "No such Target in configfs"),
            };
        }

        if let Some(plugin) = node.strip_prefix("/backstores/") {
            if let Some((plugin, name)) = plugin.split_once('/') {
                return self.set_backstore(plugin, name, command, rest);
            }
            return match command {
                "create" => self.create_backstore(plugin, rest),
                "delete" => self.delete_backstore(plugin, rest.first().map(String::as_str).unwrap_or("")),
                _ => Output::failed(1, "unknown command"),
            };
        }

        if let Some(path) = node.strip_prefix("/iscsi/") {
            if let Some(iqn) = path.strip_suffix("/tpg1/luns") {
                return self.create_lun(iqn, rest.first().map(String::as_str).unwrap_or(""));
            }
            if let Some(iqn) = path.strip_suffix("/tpg1") {
                if !self.tree.exists(&self.target_root(iqn)) {
                    return Output::failed(1, "No such path");
                }
                let tpg = self.tpg(iqn);
                return match command {
                    "enable" => {
                        self.tree.add_file(tpg.join("enable"), "1\n");
                        Output::ok("")
                    }
                    "disable" => {
                        self.tree.add_file(tpg.join("enable"), "0\n");
                        Output::ok("")
                    }
                    "set" => {
                        let group = match rest.first().map(String::as_str) {
                            Some("attribute") => "attrib",
                            Some("parameter") => "param",
                            Some("auth") => "auth",
                            _ => return Output::failed(1, "unknown group"),
                        };
                        for kv in rest.get(1..).unwrap_or(&[]) {
                            let (key, value) = kv.split_once('=').unwrap_or((kv, ""));
                            let key = match key {
                                "mutual_userid" => "userid_mut",
                                "mutual_password" => "password_mut",
                                other => other,
                            };
                            self.tree
                                .add_file(tpg.join(group).join(key), format!("{}\n", value));
                        }
                        Output::ok("")
                    }
                    _ => Output::failed(1, "unknown command"),
                };
            }
        }

        Output::failed(1, "No such path")
    }

    fn create_target(&self, iqn: &str) -> Output {
        if self.tree.exists(&self.target_root(iqn)) {
            return Output::failed(1, "This Target already exists in configFS");
        }
        let tpg = self.tpg(iqn);
        self.tree.add_file(tpg.join("enable"), "1\n");
        self.tree.add_file(tpg.join("attrib/authentication"), "0\n");
        for file in ["userid", "password", "userid_mut", "password_mut"] {
            self.tree.add_file(tpg.join("auth").join(file), "\n");
        }
        self.tree.add_file(tpg.join("dynamic_sessions"), "");
        self.tree.add_dir(tpg.join("lun"));
        self.tree.add_dir(tpg.join("np/0.0.0.0:3260"));
        Output::ok(format!("Created target {}.\nCreated TPG 1.\n", iqn))
    }

    fn create_backstore(&self, plugin: &str, rest: &[String]) -> Output {
        let Some(hba) = self.hba(plugin) else {
            return Output::failed(1, "No such path");
        };
        let mut name = "";
        let mut dev = "";
        let mut readonly = "false";
        let mut wwn = None;
        for kv in rest {
            match kv.split_once('=') {
                Some(("name", v)) => name = v,
                Some(("dev", v)) => dev = v,
                Some(("readonly", v)) => readonly = v,
                Some(("wwn", v)) => wwn = Some(v),
                _ => {}
            }
        }
        let root = hba.join(name);
        if self.tree.exists(&root) {
            return Output::failed(1, format!("Storage object {}/{} exists", plugin, name));
        }
        if !self.tree.exists(Path::new(dev)) {
            return Output::failed(1, format!("Cannot find {}", dev));
        }

        self.tree.add_file(hba.join("hba_info"), "HBA Index: 1\n");
        self.tree.add_file(root.join("udev_path"), format!("{}\n", dev));
        self.tree.add_file(root.join("attrib/emulate_write_cache"), "0\n");
        let ro = if readonly == "true" { 1 } else { 0 };
        self.tree.add_file(
            root.join("info"),
            format!("Status: ACTIVATED  Max Queue Depth: 0\n        iBlock device: x  readonly: {}\n", ro),
        );
        if let Some(wwn) = wwn {
            self.tree.add_file(
                root.join("wwn/vpd_unit_serial"),
                format!("T10 VPD Unit Serial Number: {}\n", wwn),
            );
        }
        Output::ok(format!("Created {} storage object {} using {}.\n", plugin, name, dev))
    }

    fn delete_backstore(&self, plugin: &str, name: &str) -> Output {
        let Some(hba) = self.hba(plugin) else {
            return Output::failed(1, "No such path");
        };
        if !self.tree.exists(&hba.join(name)) {
            return Output::failed(1, format!("No storage object named {}.", name));
        }
        self.tree.remove(hba.join(name));

        // LIO drops every LUN that pointed at the storage object
        let pattern = Path::new(CONFIGFS).join("iscsi/*/tpgt_1/lun/lun_*/*");
        for link in self.tree.glob(&pattern.to_string_lossy()).unwrap_or_default() {
            let Ok(target) = self.tree.read_link(&link) else {
                continue;
            };
            if target.ends_with(Path::new(&crate::file_name(&hba)).join(name)) {
                if let Some(lun) = link.parent() {
                    self.tree.remove(lun);
                }
            }
        }
        Output::ok(format!("Deleted storage object {}.\n", name))
    }

    fn set_backstore(&self, plugin: &str, name: &str, command: &str, rest: &[String]) -> Output {
        let Some(hba) = self.hba(plugin) else {
            return Output::failed(1, "No such path");
        };
        let root = hba.join(name);
        if command != "set" || !self.tree.exists(&root) {
            return Output::failed(1, "No such path");
        }
        for kv in rest.get(1..).unwrap_or(&[]) {
            let (key, value) = kv.split_once('=').unwrap_or((kv, ""));
            self.tree
                .add_file(root.join("attrib").join(key), format!("{}\n", value));
        }
        Output::ok("")
    }

    fn create_lun(&self, iqn: &str, object: &str) -> Output {
        let Some((plugin, name)) = object
            .strip_prefix("/backstores/")
            .and_then(|s| s.split_once('/'))
        else {
            return Output::failed(1, "Invalid storage object");
        };
        let Some(hba) = self.hba(plugin) else {
            return Output::failed(1, "No such path");
        };
        if !self.tree.exists(&hba.join(name)) || !self.tree.exists(&self.target_root(iqn)) {
            return Output::failed(1, "No such path");
        }

        let luns = self.tpg(iqn).join("lun");
        let mut index = 0;
        while self.tree.exists(&luns.join(format!("lun_{}", index))) {
            index += 1;
        }
        self.tree.add_link(
            luns.join(format!("lun_{}", index)).join("7c9d1e2a3b"),
            format!("../../../../../../target/core/{}/{}", crate::file_name(&hba), name),
        );
        Output::ok(format!("Created LUN {}.\n", index))
    }

    fn losetup(&self, args: &[String]) -> Output {
        match args.first().map(String::as_str) {
            Some("--find") => {
                let Some(file) = args.last() else {
                    return Output::failed(1, "no file");
                };
                if !self.tree.exists(Path::new(file)) {
                    return Output::failed(1, format!("{}: No such file or directory", file));
                }
                let n = self.next_loop.fetch_add(1, Ordering::SeqCst);
                self.tree.add_file(
                    format!("/sys/block/loop{}/loop/backing_file", n),
                    format!("{}\n", file),
                );
                self.tree.add_block_device(format!("/dev/loop{}", n));
                Output::ok(format!("/dev/loop{}\n", n))
            }
            Some("-d") => {
                let dev = args.get(1).cloned().unwrap_or_default();
                let name = crate::file_name(Path::new(&dev));
                let sys = Path::new("/sys/block").join(&name);
                if !self.tree.exists(&sys) {
                    return Output::failed(1, format!("{}: detach failed: No such device", dev));
                }
                self.tree.remove(sys);
                self.tree.remove(&dev);
                Output::ok("")
            }
            _ => Output::failed(1, "unsupported"),
        }
    }

    fn targetctl(&self, args: &[String]) -> Result<Output> {
        match args.first().map(String::as_str) {
            Some("save") => {
                let file = args.get(1).cloned().unwrap_or_default();
                fs::write(&file, serde_json::to_string_pretty(&self.dump()?)?)?;
                Ok(Output::ok(""))
            }
            Some("restore") => {
                let file = args.get(1).cloned().unwrap_or_default();
                let config = SavedConfig::read(&file)?;
                for so in config.storage_objects() {
                    self.create_backstore(
                        so.plugin(),
                        &[format!("name={}", so.name()), format!("dev={}", so.dev())],
                    );
                }
                for target in config.targets() {
                    self.create_target(target.wwn());
                    for tpg in target.tpgs() {
                        for lun in tpg.luns() {
                            self.create_lun(target.wwn(), lun.storage_object());
                        }
                    }
                }
                Ok(Output::ok(""))
            }
            Some("clear") => {
                self.tree.remove(Path::new(CONFIGFS).join("iscsi"));
                self.tree.remove(Path::new(CONFIGFS).join("core"));
                self.tree.add_dir(Path::new(CONFIGFS).join("iscsi"));
                self.tree.add_dir(Path::new(CONFIGFS).join("core"));
                Ok(Output::ok(""))
            }
            _ => Ok(Output::failed(1, "unsupported")),
        }
    }

    fn dump(&self) -> Result<Value> {
        let tree = self.tree.as_ref();
        let storage_objects = list_backstores(tree, Path::new(CONFIGFS))?
            .iter()
            .map(|b| {
                json!({
                    "name": b.name(),
                    "plugin": b.kind().plugin(),
                    "dev": b.dev(),
                    "readonly": b.read_only(),
                    "write_back": b.write_back(),
                    "wwn": b.wwn(),
                })
            })
            .collect::<Vec<Value>>();

        let mut targets = Vec::new();
        for root in tree.glob(&format!("{}/iscsi/iqn.*", CONFIGFS))? {
            let mut target = Target::default();
            target.load(tree, &root)?;
            let luns = target
                .luns()
                .values()
                .map(|lun| {
                    json!({
                        "index": lun.index(),
                        "storage_object": lun.backstore_kind().object_path(lun.backstore()),
                    })
                })
                .collect::<Vec<Value>>();
            targets.push(json!({
                "fabric": "iscsi",
                "wwn": target.name(),
                "tpgs": [{
                    "tag": 1,
                    "enable": target.enabled(),
                    "attributes": { "authentication": u8::from(target.authentication()) },
                    "luns": luns,
                }],
            }));
        }

        Ok(json!({
            "fabric_modules": [],
            "storage_objects": storage_objects,
            "targets": targets,
        }))
    }
}

impl Runner for FakeKernel {
    fn run(&self, program: &str, args: &[String], _timeout: Duration) -> Result<Output> {
        let line = command_line(program, args);
        self.calls.lock().unwrap().push(line.clone());
        if self.should_fail(&line) {
            return Ok(Output::failed(1, "injected failure"));
        }

        match program {
            "targetcli" => Ok(self.targetcli(args)),
            "targetctl" => self.targetctl(args),
            "losetup" => Ok(self.losetup(args)),
            _ => Ok(Output::failed(127, format!("{}: command not found", program))),
        }
    }
}

pub(crate) fn settings(dir: &Path) -> Settings {
    Settings {
        saved_config: dir.join("saveconfig.json"),
        lock_file: dir.join("iscsi.lock"),
        restored_marker: dir.join("restored"),
        ..Settings::default()
    }
}

pub(crate) fn store(kernel: &Arc<FakeKernel>, dir: &Path) -> TargetStore {
    TargetStore::new(
        settings(dir),
        kernel.tree.clone(),
        kernel.clone(),
        Arc::new(MemLock::new()),
        Arc::new(MemRestoreMarker::new()),
    )
}

/// Answers local commands from canned outputs, matched by substring of the
/// command line; unmatched commands exit with 127.
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    calls: Mutex<Vec<String>>,
    outputs: Mutex<Vec<(String, Output)>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(ScriptedRunner::default())
    }

    pub fn on(&self, needle: &str, output: Output) {
        self.outputs.lock().unwrap().push((needle.to_string(), output));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Runner for ScriptedRunner {
    fn run(&self, program: &str, args: &[String], _timeout: Duration) -> Result<Output> {
        let line = command_line(program, args);
        self.calls.lock().unwrap().push(line.clone());
        let outputs = self.outputs.lock().unwrap();
        Ok(outputs
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_else(|| Output::failed(127, format!("unscripted: {}", line))))
    }
}

/// Answers remote commands from a queue of canned responses, matched by
/// substring of the command line.
#[derive(Default)]
pub(crate) struct FakeRemote {
    calls: Mutex<Vec<String>>,
    responses: Mutex<VecDeque<(String, RemoteResponse)>>,
    fallback: Mutex<Vec<(String, RemoteResponse)>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeRemote::default())
    }

    /// Queues a one-shot response for the next command containing `needle`.
    pub fn respond(&self, needle: &str, stdout: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back((needle.to_string(), RemoteResponse::ok(stdout)));
    }

    /// Queues a one-shot response with a full exit status.
    pub fn respond_with(&self, needle: &str, response: RemoteResponse) {
        self.responses
            .lock()
            .unwrap()
            .push_back((needle.to_string(), response));
    }

    /// Response used whenever no one-shot response matches.
    pub fn always(&self, needle: &str, stdout: &str) {
        self.fallback
            .lock()
            .unwrap()
            .push((needle.to_string(), RemoteResponse::ok(stdout)));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl RemoteExecutor for FakeRemote {
    fn exec(&self, command: &str, args: &[String], _cwd: Option<&str>) -> Result<RemoteResponse> {
        let line = command_line(command, args);
        self.calls.lock().unwrap().push(line.clone());

        let mut responses = self.responses.lock().unwrap();
        if let Some(pos) = responses.iter().position(|(n, _)| line.contains(n.as_str())) {
            if let Some((_, response)) = responses.remove(pos) {
                return Ok(response);
            }
        }
        drop(responses);

        let fallback = self.fallback.lock().unwrap();
        match fallback.iter().find(|(n, _)| line.contains(n.as_str())) {
            Some((_, response)) => Ok(response.clone()),
            None => anyhow::bail!("remote host unreachable: {}", line),
        }
    }
}
