//! This host's own open-iscsi initiator, driven through `iscsiadm`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info};
use regex::Regex;
use serde::Serialize;

use crate::exec::{command_line, Output, ProcessRunner, Runner};
use crate::{absolutize, args, IscsiError, NodeKind, ResourceTree, Settings, SysfsTree};

pub const DEFAULT_PORT: u16 = 3260;

/// iscsiadm: a session to the node already exists.
const EXIT_SESSION_EXISTS: i32 = 15;
/// iscsiadm: no records or sessions matched.
const EXIT_NO_OBJECTS: i32 = 21;

/// A node record, as listed by `iscsiadm -m node` or discovery.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub portal: String,
    pub tpgt: u32,
    pub target: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct InitiatorSession {
    pub sid: u32,
    pub transport: String,
    pub portal: String,
    pub target: String,
}

/// `<ip>:<port>`, bracketing IPv6 addresses.
pub fn portal(ip: &str, port: u16) -> String {
    if ip.contains(':') && !ip.starts_with('[') {
        format!("[{}]:{}", ip, port)
    } else {
        format!("{}:{}", ip, port)
    }
}

/// Host part of a portal.
fn portal_host(portal: &str) -> &str {
    let host = portal.rsplit_once(':').map(|(h, _)| h).unwrap_or(portal);
    host.trim_start_matches('[').trim_end_matches(']')
}

pub struct LocalInitiator {
    iscsiadm: String,
    by_path: PathBuf,
    timeout: Duration,
    tree: Arc<dyn ResourceTree>,
    runner: Arc<dyn Runner>,
}

impl LocalInitiator {
    pub fn new(settings: &Settings, tree: Arc<dyn ResourceTree>, runner: Arc<dyn Runner>) -> Self {
        LocalInitiator {
            iscsiadm: settings.iscsiadm.clone(),
            by_path: settings.by_path_root.clone(),
            timeout: settings.timeouts.command(),
            tree,
            runner,
        }
    }

    pub fn system(settings: &Settings) -> Self {
        LocalInitiator::new(settings, Arc::new(SysfsTree), Arc::new(ProcessRunner))
    }

    /// Runs iscsiadm; exit codes in `accept` count as success.
    fn iscsiadm(&self, args: &[String], accept: &[i32]) -> Result<Output> {
        let out = self.runner.run(&self.iscsiadm, args, self.timeout)?;
        if out.success() || accept.contains(&out.code) {
            return Ok(out);
        }
        anyhow::bail!(IscsiError::ToolFailure {
            command: command_line(&self.iscsiadm, args),
            code: out.code,
            stderr: out.stderr.trim().to_string(),
        })
    }

    /// SendTargets discovery against a portal; returns the advertised records.
    pub fn discover_by_ip(&self, ip: &str, port: u16) -> Result<Vec<NodeRecord>> {
        let out = self.iscsiadm(
            &args!["-m", "discovery", "-t", "sendtargets", "-p", portal(ip, port)],
            &[],
        )?;
        let records = parse_records(&out.stdout)?;
        info!("discovered {} targets on {}", records.len(), portal(ip, port));
        Ok(records)
    }

    pub fn list_records(&self) -> Result<Vec<NodeRecord>> {
        let out = self.iscsiadm(&args!["-m", "node"], &[EXIT_NO_OBJECTS])?;
        if out.code == EXIT_NO_OBJECTS {
            return Ok(Vec::new());
        }
        parse_records(&out.stdout)
    }

    pub fn list_sessions(&self) -> Result<Vec<InitiatorSession>> {
        let out = self.iscsiadm(&args!["-m", "session"], &[EXIT_NO_OBJECTS])?;
        if out.code == EXIT_NO_OBJECTS {
            return Ok(Vec::new());
        }
        parse_sessions(&out.stdout)
    }

    /// Logs into `target` through `portal`. Already being logged in is success.
    pub fn login_target(&self, target: &str, portal: &str) -> Result<()> {
        let out = self.iscsiadm(
            &args!["-m", "node", "-T", target, "-p", portal, "--login"],
            &[EXIT_SESSION_EXISTS],
        )?;
        if out.code == EXIT_SESSION_EXISTS {
            debug!("already logged into {} on {}", target, portal);
        } else {
            info!("logged into {} on {}", target, portal);
        }
        Ok(())
    }

    /// Logs out of `target`. Not being logged in is success.
    pub fn logout_target(&self, target: &str, portal: &str) -> Result<()> {
        let out = self.iscsiadm(
            &args!["-m", "node", "-T", target, "-p", portal, "--logout"],
            &[EXIT_NO_OBJECTS],
        )?;
        if out.code == EXIT_NO_OBJECTS {
            debug!("no session to {} on {}", target, portal);
        } else {
            info!("logged out of {} on {}", target, portal);
        }
        Ok(())
    }

    /// Logs out of every session whose portal is on `ip`; returns the targets.
    pub fn logout_all_by_ip(&self, ip: &str) -> Result<Vec<String>> {
        let ip = ip.trim_start_matches('[').trim_end_matches(']');
        let mut targets = Vec::new();
        for session in self.list_sessions()? {
            if portal_host(&session.portal) != ip {
                continue;
            }
            self.logout_target(&session.target, &session.portal)?;
            targets.push(session.target);
        }
        Ok(targets)
    }

    /// Block device backing LUN `lun` of a logged-in target, resolved from
    /// the udev by-path link, or `None` if the link has not appeared.
    pub fn get_block_device_of_target(&self, target: &str, portal: &str, lun: u32) -> Result<Option<PathBuf>> {
        let link = self
            .by_path
            .join(format!("ip-{}-iscsi-{}-lun-{}", portal, target, lun));
        if !self.tree.exists(&link) {
            return Ok(None);
        }
        if self.tree.kind(&link) != Some(NodeKind::BlockDevice) {
            anyhow::bail!(IscsiError::InconsistentState(format!(
                "{} does not point at a block device",
                link.display()
            )))
        }
        Ok(Some(resolve_link(self.tree.as_ref(), &link)?))
    }

    /// Drops the discovery record of a portal and the node records it created.
    pub fn clear_discovery_entry(&self, ip: &str, port: u16) -> Result<()> {
        let portal = portal(ip, port);
        self.iscsiadm(
            &args!["-m", "node", "-p", portal, "-o", "delete"],
            &[EXIT_NO_OBJECTS],
        )?;
        self.iscsiadm(
            &args!["-m", "discoverydb", "-t", "sendtargets", "-p", portal, "-o", "delete"],
            &[EXIT_NO_OBJECTS],
        )?;
        info!("cleared discovery entry {}", portal);
        Ok(())
    }
}

fn resolve_link(tree: &dyn ResourceTree, link: &Path) -> Result<PathBuf> {
    let mut current = link.to_path_buf();
    for _ in 0..8 {
        match tree.read_link(&current) {
            Ok(target) => current = absolutize(&current, &target),
            Err(_) => break,
        }
    }
    Ok(current)
}

/// `10.0.0.5:3260,1 iqn.2007-01.net.backup.dev:web01`, one per line.
fn parse_records(text: &str) -> Result<Vec<NodeRecord>> {
    let re = Regex::new(r"^(\S+),(\d+)\s+(\S+)$")?;
    Ok(text
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line.trim())?;
            Some(NodeRecord {
                portal: caps[1].to_string(),
                tpgt: caps[2].parse().ok()?,
                target: caps[3].to_string(),
            })
        })
        .collect())
}

/// `tcp: [3] 10.0.0.5:3260,1 iqn.2007-01.net.backup.dev:web01 (non-flash)`
fn parse_sessions(text: &str) -> Result<Vec<InitiatorSession>> {
    let re = Regex::new(r"^(\w+):\s+\[(\d+)\]\s+(\S+),\d+\s+(\S+)")?;
    Ok(text
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line.trim())?;
            Some(InitiatorSession {
                sid: caps[2].parse().ok()?,
                transport: caps[1].to_string(),
                portal: caps[3].to_string(),
                target: caps[4].to_string(),
            })
        })
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fake::ScriptedRunner;
    use crate::MemTree;

    const SESSIONS: &str = "\
tcp: [1] 10.0.0.5:3260,1 iqn.2007-01.net.backup.dev:web01 (non-flash)
tcp: [4] [fe80::1]:3260,1 iqn.2007-01.net.backup.dev:web02 (non-flash)
tcp: [7] 10.0.0.5:3260,1 iqn.2007-01.net.backup.dev:web03 (non-flash)
";

    fn initiator(runner: Arc<ScriptedRunner>, tree: Arc<MemTree>) -> LocalInitiator {
        LocalInitiator::new(&Settings::default(), tree, runner)
    }

    #[test]
    fn parse_iscsiadm_listings() -> Result<()> {
        let records = parse_records(
            "10.0.0.5:3260,1 iqn.2007-01.net.backup.dev:web01\n\
             [fe80::1]:3260,1 iqn.2007-01.net.backup.dev:web02\n\
             iscsiadm: No records found\n",
        )?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].portal, "[fe80::1]:3260");
        assert_eq!(records[1].tpgt, 1);

        let sessions = parse_sessions(SESSIONS)?;
        assert_eq!(sessions.len(), 3);
        assert_eq!(sessions[1].sid, 4);
        assert_eq!(sessions[1].portal, "[fe80::1]:3260");
        assert_eq!(sessions[2].target, "iqn.2007-01.net.backup.dev:web03");

        assert_eq!(portal("fe80::1", 3260), "[fe80::1]:3260");
        assert_eq!(portal_host("[fe80::1]:3260"), "fe80::1");
        assert_eq!(portal_host("10.0.0.5:3260"), "10.0.0.5");

        Ok(())
    }

    #[test]
    fn login_and_logout_are_idempotent() -> Result<()> {
        let runner = ScriptedRunner::new();
        runner.on("--login", Output::failed(EXIT_SESSION_EXISTS, "session exists"));
        runner.on("--logout", Output::failed(EXIT_NO_OBJECTS, "No matching sessions found"));
        let initiator = initiator(runner.clone(), Arc::new(MemTree::new()));

        let target = "iqn.2007-01.net.backup.dev:web01";
        initiator.login_target(target, "10.0.0.5:3260")?;
        initiator.logout_target(target, "10.0.0.5:3260")?;
        initiator.logout_target(target, "10.0.0.5:3260")?;

        assert_eq!(
            runner.calls()[0],
            "iscsiadm -m node -T iqn.2007-01.net.backup.dev:web01 -p 10.0.0.5:3260 --login"
        );
        Ok(())
    }

    #[test]
    fn other_failures_are_tool_failures() {
        let runner = ScriptedRunner::new();
        runner.on("--login", Output::failed(24, "iscsiadm: Login failed to authenticate"));
        let initiator = initiator(runner, Arc::new(MemTree::new()));

        let err = initiator
            .login_target("iqn.2007-01.net.backup.dev:web01", "10.0.0.5:3260")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IscsiError>(),
            Some(IscsiError::ToolFailure { code: 24, .. })
        ));
    }

    #[test]
    fn empty_listings() -> Result<()> {
        let runner = ScriptedRunner::new();
        runner.on("-m node", Output::failed(EXIT_NO_OBJECTS, "No records found"));
        runner.on("-m session", Output::failed(EXIT_NO_OBJECTS, "No active sessions."));
        let initiator = initiator(runner, Arc::new(MemTree::new()));

        assert!(initiator.list_records()?.is_empty());
        assert!(initiator.list_sessions()?.is_empty());
        assert!(initiator.logout_all_by_ip("10.0.0.5")?.is_empty());
        Ok(())
    }

    #[test]
    fn logout_all_by_ip_matches_portal_host() -> Result<()> {
        let runner = ScriptedRunner::new();
        runner.on("-m session", Output::ok(SESSIONS));
        runner.on("--logout", Output::ok(""));
        let initiator = initiator(runner.clone(), Arc::new(MemTree::new()));

        let targets = initiator.logout_all_by_ip("10.0.0.5")?;
        assert_eq!(
            targets,
            vec![
                "iqn.2007-01.net.backup.dev:web01".to_string(),
                "iqn.2007-01.net.backup.dev:web03".to_string()
            ]
        );
        assert_eq!(initiator.logout_all_by_ip("[fe80::1]")?.len(), 1);
        Ok(())
    }

    #[test]
    fn discovery_and_cleanup() -> Result<()> {
        let runner = ScriptedRunner::new();
        runner.on(
            "-m discovery",
            Output::ok("10.0.0.5:3260,1 iqn.2007-01.net.backup.dev:web01\n"),
        );
        runner.on("-o delete", Output::failed(EXIT_NO_OBJECTS, "No records found"));
        let initiator = initiator(runner.clone(), Arc::new(MemTree::new()));

        let records = initiator.discover_by_ip("10.0.0.5", DEFAULT_PORT)?;
        assert_eq!(records[0].target, "iqn.2007-01.net.backup.dev:web01");

        initiator.clear_discovery_entry("10.0.0.5", DEFAULT_PORT)?;
        initiator.clear_discovery_entry("10.0.0.5", DEFAULT_PORT)?;
        assert!(runner
            .calls()
            .contains(&"iscsiadm -m discoverydb -t sendtargets -p 10.0.0.5:3260 -o delete".to_string()));
        Ok(())
    }

    #[test]
    fn block_device_from_by_path_link() -> Result<()> {
        let tree = Arc::new(MemTree::new());
        tree.add_block_device("/dev/sdc");
        tree.add_link(
            "/dev/disk/by-path/ip-10.0.0.5:3260-iscsi-iqn.2007-01.net.backup.dev:web01-lun-0",
            "../../sdc",
        );
        let initiator = initiator(ScriptedRunner::new(), tree);

        let target = "iqn.2007-01.net.backup.dev:web01";
        assert_eq!(
            initiator.get_block_device_of_target(target, "10.0.0.5:3260", 0)?,
            Some(PathBuf::from("/dev/sdc"))
        );
        assert_eq!(initiator.get_block_device_of_target(target, "10.0.0.5:3260", 1)?, None);
        Ok(())
    }
}
