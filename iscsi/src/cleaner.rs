//! Best-effort removal of the targets and remote sessions of one agent host.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};
use serde::Serialize;

use crate::remote::RemoteInitiatorClient;
use crate::{kind_of, TargetStore};

/// Fixed-delay retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        RetryPolicy {
            attempts: attempts.max(1),
            interval,
        }
    }

    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts => {
                    debug!("{} failed (attempt {}/{}): {:#}", what, attempt, self.attempts, e);
                    thread::sleep(self.interval);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Outcome of a prune pass: what was removed and what was left behind.
#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

pub struct SessionCleaner {
    host: String,
    store: Arc<TargetStore>,
    remote: Arc<RemoteInitiatorClient>,
    logout_retry: RetryPolicy,
    delete_retry: RetryPolicy,
}

impl SessionCleaner {
    pub fn new<S: Into<String>>(host: S, store: Arc<TargetStore>, remote: Arc<RemoteInitiatorClient>) -> Self {
        SessionCleaner {
            host: host.into(),
            store,
            remote,
            logout_retry: RetryPolicy::new(5, Duration::from_secs(1)),
            delete_retry: RetryPolicy::new(4, Duration::from_secs(2)),
        }
    }

    pub fn with_retries(mut self, logout: RetryPolicy, delete: RetryPolicy) -> Self {
        self.logout_retry = logout;
        self.delete_retry = delete;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Local targets named after this host.
    pub fn list_agent_target_names(&self) -> Result<Vec<String>> {
        let names = self.store.names();
        Ok(self
            .store
            .list_targets()?
            .into_iter()
            .filter(|name| names.belongs_to(name, &self.host))
            .collect())
    }

    /// Detaches the remote host from every one of its targets: raw disks
    /// are taken offline, then the session is logged out. Sessions that
    /// will not log out are reported, not raised.
    pub fn prune_initiator(&self) -> Result<PruneReport> {
        let names = self.list_agent_target_names()?;
        let mut report = PruneReport::default();

        for session in self.remote.list_sessions()? {
            if !names.iter().any(|name| session.is_for(name)) {
                continue;
            }

            for drive in session.devices.iter().filter_map(|d| d.physical_drive()) {
                if let Err(e) = self.remote.offline_disk(drive) {
                    warn!("offlining disk {} on {}: {:#}", drive, self.host, e);
                }
            }

            let what = format!("logging out session {}", session.session_id);
            let result = self.logout_retry.run(&what, || {
                if self.remote.logout_from_session(&session.session_id)? {
                    Ok(())
                } else {
                    anyhow::bail!("remote host kept session {}", session.session_id)
                }
            });
            match result {
                Ok(()) => report.removed.push(session.session_id),
                Err(e) => {
                    warn!("giving up on session {} of {}: {:#}", session.session_id, self.host, e);
                    report.failed.push(session.session_id);
                }
            }
        }

        info!(
            "pruned {} sessions of {}, {} left",
            report.removed.len(),
            self.host,
            report.failed.len()
        );
        Ok(report)
    }

    /// Deletes every target of this host. A target that cannot be deleted
    /// is logged and skipped.
    pub fn prune_agent_targets(&self) -> Result<PruneReport> {
        let mut report = PruneReport::default();

        for name in self.list_agent_target_names()? {
            let what = format!("deleting target {}", name);
            let result = self.delete_retry.run(&what, || match self.store.delete_target(&name) {
                Err(e) if kind_of(&e).map(|k| k.is_not_found()).unwrap_or(false) => Ok(()),
                res => res,
            });
            match result {
                Ok(()) => report.removed.push(name),
                Err(e) => {
                    warn!("giving up on target {}: {:#}", name, e);
                    report.failed.push(name);
                }
            }
        }

        info!(
            "pruned {} targets of {}, {} left",
            report.removed.len(),
            self.host,
            report.failed.len()
        );
        Ok(report)
    }
}
