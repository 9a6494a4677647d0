//! The Microsoft iSCSI initiator of a paired Windows host, driven through
//! an out-of-band command channel (`iscsicli`, `mountvol`, `diskpart`).

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};

use crate::args;
use crate::exec::command_line;
use crate::IscsiError;

mod session_list;

pub use session_list::*;

const SUCCESS_TEXT: &str = "The operation completed successfully";
const LOGIN_OK: &str = "LOGIN_OK";
const LOGIN_FAILED: &str = "LOGIN_FAILED";

/// Captured result of a remote command.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RemoteResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl RemoteResponse {
    pub fn ok<S: Into<String>>(stdout: S) -> Self {
        RemoteResponse {
            stdout: stdout.into(),
            ..RemoteResponse::default()
        }
    }

    pub fn failed<S: Into<String>>(exit_code: i32, stderr: S) -> Self {
        RemoteResponse {
            stderr: stderr.into(),
            exit_code,
            ..RemoteResponse::default()
        }
    }

    fn reports_success(&self) -> bool {
        self.exit_code == 0 && self.stdout.contains(SUCCESS_TEXT)
    }
}

/// Runs a command on the remote host. `Err` means the channel itself failed.
pub trait RemoteExecutor: Send + Sync {
    fn exec(&self, command: &str, args: &[String], cwd: Option<&str>) -> Result<RemoteResponse>;
}

/// `cmd /C "(echo l1& echo l2) | diskpart"`
fn diskpart_script(lines: &[String]) -> String {
    let echoes = lines
        .iter()
        .map(|l| format!("echo {}", l))
        .collect::<Vec<String>>()
        .join("& ");
    format!("({}) | diskpart", echoes)
}

pub struct RemoteInitiatorClient {
    executor: Arc<dyn RemoteExecutor>,
    portals: Mutex<BTreeSet<String>>,
    discover_attempts: u32,
    discover_delay: Duration,
}

impl RemoteInitiatorClient {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        RemoteInitiatorClient {
            executor,
            portals: Mutex::new(BTreeSet::new()),
            discover_attempts: 5,
            discover_delay: Duration::from_secs(2),
        }
    }

    /// How often, and how far apart, `discover_volume` looks for the disk.
    pub fn with_discovery(mut self, attempts: u32, delay: Duration) -> Self {
        self.discover_attempts = attempts.max(1);
        self.discover_delay = delay;
        self
    }

    fn exec(&self, command: &str, args: &[String]) -> Result<RemoteResponse> {
        debug!("remote exec: {}", command_line(command, args));
        self.executor.exec(command, args, None)
    }

    fn expect_success(&self, command: &str, args: &[String]) -> Result<RemoteResponse> {
        let response = self.exec(command, args)?;
        if !response.reports_success() {
            anyhow::bail!(IscsiError::RemoteProtocol(format!(
                "'{}' exited {}: {}{}",
                command_line(command, args),
                response.exit_code,
                response.stdout.trim(),
                response.stderr.trim()
            )))
        }
        Ok(response)
    }

    pub fn register_portal(&self, ip: &str, port: u16) -> Result<()> {
        self.expect_success("iscsicli", &args!["QAddTargetPortal", ip, port])?;
        self.portals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(format!("{}:{}", ip, port));
        info!("registered portal {}:{} on remote host", ip, port);
        Ok(())
    }

    /// Only portals registered through this client are known.
    pub fn is_portal_registered(&self, ip: &str, port: u16) -> bool {
        self.portals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&format!("{}:{}", ip, port))
    }

    /// Logs into `target`, with CHAP when credentials are given. Automount
    /// is off during the login so Windows does not grab the new volumes.
    pub fn login_to_target(&self, target: &str, user: Option<&str>, password: Option<&str>) -> Result<()> {
        let login = match (user, password) {
            (Some(user), Some(password)) => format!(
                "iscsicli LoginTarget {} T * * * * * * * * * * * {} {} 1 * 0",
                target, user, password
            ),
            _ => format!("iscsicli QLoginTarget {}", target),
        };
        let script = format!("{} && echo {} || echo {}", login, LOGIN_OK, LOGIN_FAILED);

        let automount = self.exec("mountvol", &args!["/N"])?;
        if automount.exit_code != 0 {
            anyhow::bail!(IscsiError::ToolFailure {
                command: "mountvol /N".to_string(),
                code: automount.exit_code,
                stderr: automount.stderr.trim().to_string(),
            })
        }
        let response = self.exec("cmd", &args!["/C", script]);
        if let Err(e) = self.exec("mountvol", &args!["/E"]) {
            warn!("re-enabling automount on remote host: {:#}", e);
        }
        let response = response?;

        if response.stdout.contains(LOGIN_OK) {
            info!("remote host logged into {}", target);
            Ok(())
        } else if response.stdout.contains(LOGIN_FAILED) {
            anyhow::bail!(IscsiError::ToolFailure {
                command: format!("iscsicli login {}", target),
                code: response.exit_code,
                stderr: format!("{}{}", response.stdout.trim(), response.stderr.trim()),
            })
        } else {
            anyhow::bail!(IscsiError::RemoteProtocol(format!(
                "no login status for {}: {}",
                target,
                response.stdout.trim()
            )))
        }
    }

    /// Waits for a disk of `target` to show up, brings it online and
    /// returns its device path, or `None` if it never appears.
    pub fn discover_volume(&self, target: &str) -> Result<Option<String>> {
        for attempt in 0..self.discover_attempts {
            if attempt > 0 {
                thread::sleep(self.discover_delay);
            }
            let found = self
                .list_devices()?
                .into_iter()
                .find(|d| d.is_for(target) && d.device_number.is_some());
            if let Some(number) = found.and_then(|d| d.device_number) {
                self.online_disk(number)?;
                let path = format!(r"\\.\PhysicalDrive{}", number);
                info!("{} is attached as {}", target, path);
                return Ok(Some(path));
            }
            debug!("{} not visible yet (attempt {})", target, attempt + 1);
        }

        warn!("no disk of {} appeared on remote host", target);
        Ok(None)
    }

    /// Logs out of every session to `target`. Not being logged in is success.
    pub fn logout_from_target(&self, target: &str) -> Result<bool> {
        let sessions = self
            .list_sessions()?
            .into_iter()
            .filter(|s| s.is_for(target))
            .collect::<Vec<RemoteSession>>();
        if sessions.is_empty() {
            debug!("remote host has no session to {}", target);
            return Ok(true);
        }

        let mut all = true;
        for session in sessions {
            all &= self.logout_from_session(&session.session_id)?;
        }
        Ok(all)
    }

    pub fn logout_from_session(&self, session_id: &str) -> Result<bool> {
        let response = self.exec("iscsicli", &args!["LogoutTarget", session_id])?;
        if response.reports_success() {
            info!("remote session {} logged out", session_id);
            return Ok(true);
        }
        warn!(
            "logging out remote session {} failed: {}{}",
            session_id,
            response.stdout.trim(),
            response.stderr.trim()
        );
        Ok(false)
    }

    pub fn list_sessions(&self) -> Result<Vec<RemoteSession>> {
        let response = self.expect_success("iscsicli", &args!["SessionList"])?;
        Ok(parse_session_list(&response.stdout))
    }

    /// Sessions without any attached device.
    pub fn list_unused_sessions(&self) -> Result<Vec<RemoteSession>> {
        Ok(self
            .list_sessions()?
            .into_iter()
            .filter(|s| s.devices.is_empty())
            .collect())
    }

    pub fn list_devices(&self) -> Result<Vec<RemoteDevice>> {
        Ok(self
            .list_sessions()?
            .into_iter()
            .flat_map(|s| s.devices)
            .collect())
    }

    /// Brings disk `number` online and clears its read-only flag.
    pub fn online_disk(&self, number: u32) -> Result<()> {
        self.diskpart(&[
            format!("select disk {}", number),
            "online disk noerr".to_string(),
            "attributes disk clear readonly noerr".to_string(),
        ])
    }

    pub fn offline_disk(&self, number: u32) -> Result<()> {
        self.diskpart(&[
            format!("select disk {}", number),
            "offline disk noerr".to_string(),
        ])
    }

    fn diskpart(&self, lines: &[String]) -> Result<()> {
        let args = args!["/C", diskpart_script(lines)];
        let response = self.exec("cmd", &args)?;
        if response.exit_code != 0 {
            anyhow::bail!(IscsiError::ToolFailure {
                command: command_line("cmd", &args),
                code: response.exit_code,
                stderr: response.stderr.trim().to_string(),
            })
        }
        Ok(())
    }
}
