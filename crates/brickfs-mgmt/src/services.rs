//! Helper daemons the management plane starts and queries but does not run:
//! rebalance processes, geo-replication sync workers and the quota probe.

use brickfs_volgen::OptionDict;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tracing::info;

use crate::error::{MgmtError, Result};
use crate::op_ctx::{RebalanceCommand, ResponseDict};

/// Progress of a rebalance run as reported by the rebalance process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RebalanceStatus {
    NotStarted,
    LayoutFixStarted,
    MigrationStarted,
    Stopped,
    Complete,
    Failed,
    LayoutFixComplete,
    MigrationComplete,
    Unknown,
}

impl RebalanceStatus {
    /// Status for a wire code; codes outside 0..=7 are [`RebalanceStatus::Unknown`]
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => RebalanceStatus::NotStarted,
            1 => RebalanceStatus::LayoutFixStarted,
            2 => RebalanceStatus::MigrationStarted,
            3 => RebalanceStatus::Stopped,
            4 => RebalanceStatus::Complete,
            5 => RebalanceStatus::Failed,
            6 => RebalanceStatus::LayoutFixComplete,
            7 => RebalanceStatus::MigrationComplete,
            _ => RebalanceStatus::Unknown,
        }
    }

    pub fn code(self) -> Option<i64> {
        match self {
            RebalanceStatus::NotStarted => Some(0),
            RebalanceStatus::LayoutFixStarted => Some(1),
            RebalanceStatus::MigrationStarted => Some(2),
            RebalanceStatus::Stopped => Some(3),
            RebalanceStatus::Complete => Some(4),
            RebalanceStatus::Failed => Some(5),
            RebalanceStatus::LayoutFixComplete => Some(6),
            RebalanceStatus::MigrationComplete => Some(7),
            RebalanceStatus::Unknown => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RebalanceStatus::NotStarted => "not started",
            RebalanceStatus::LayoutFixStarted => "step 1: layout fix in progress",
            RebalanceStatus::MigrationStarted => "step 2: data migration in progress",
            RebalanceStatus::Stopped => "stopped",
            RebalanceStatus::Complete => "completed",
            RebalanceStatus::Failed => "failed",
            RebalanceStatus::LayoutFixComplete => "step 1: layout fix complete",
            RebalanceStatus::MigrationComplete => "step 2: data migration complete",
            RebalanceStatus::Unknown => "unknown",
        }
    }

    /// Whether a rebalance process is still working
    pub fn is_running(self) -> bool {
        matches!(
            self,
            RebalanceStatus::LayoutFixStarted | RebalanceStatus::MigrationStarted
        )
    }
}

impl fmt::Display for RebalanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceProgress {
    pub status: RebalanceStatus,
    pub files: u64,
    pub size: u64,
    pub lookedup: u64,
}

impl Default for RebalanceProgress {
    fn default() -> Self {
        Self {
            status: RebalanceStatus::NotStarted,
            files: 0,
            size: 0,
            lookedup: 0,
        }
    }
}

impl RebalanceProgress {
    /// Reply keys: `status` carries the numeric code
    pub fn to_response(&self) -> ResponseDict {
        let mut rsp = ResponseDict::new();
        let code = self.status.code().unwrap_or(-1);
        rsp.insert("status".into(), code.to_string());
        rsp.insert("files".into(), self.files.to_string());
        rsp.insert("size".into(), self.size.to_string());
        rsp.insert("lookedup".into(), self.lookedup.to_string());
        rsp
    }

    pub fn from_response(rsp: &ResponseDict) -> Self {
        let num = |key: &str| rsp.get(key).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        let code = rsp.get("status").and_then(|v| v.parse::<i64>().ok()).unwrap_or(-1);
        Self {
            status: RebalanceStatus::from_code(code),
            files: num("files"),
            size: num("size"),
            lookedup: num("lookedup"),
        }
    }
}

/// Starts, stops and inspects the helper processes of this node
pub trait ServiceSupervisor: Send + Sync {
    fn start_rebalance(&self, volume: &str, command: RebalanceCommand) -> Result<()>;
    /// Stops a run and returns its last progress
    fn stop_rebalance(&self, volume: &str) -> Result<RebalanceProgress>;
    fn rebalance_status(&self, volume: &str) -> RebalanceProgress;

    fn start_gsync(&self, master: &str, slave: &str) -> Result<()>;
    fn stop_gsync(&self, master: &str, slave: &str) -> Result<()>;
    /// Worker state, `None` when no worker runs on this node
    fn gsync_status(&self, master: &str, slave: &str) -> Option<String>;
    fn gsync_config(&self, master: &str, slave: &str) -> OptionDict;
    fn set_gsync_config(&self, master: &str, slave: &str, name: &str, value: Option<&str>) -> Result<()>;

    /// Bytes used below `path`, read from the volume's accounting
    fn quota_usage(&self, volume: &str, path: &str) -> Option<u64>;
}

#[derive(Debug, Default)]
struct SupervisorState {
    rebalance: HashMap<String, RebalanceProgress>,
    gsync: HashMap<(String, String), String>,
    gsync_config: HashMap<(String, String), OptionDict>,
    usage: HashMap<(String, String), u64>,
}

/// Bookkeeping-only supervisor: records what was asked and reports it back
#[derive(Debug, Default)]
pub struct InMemorySupervisor {
    state: Mutex<SupervisorState>,
}

impl InMemorySupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Overrides the progress a rebalance run reports
    pub fn set_rebalance_progress(&self, volume: &str, progress: RebalanceProgress) {
        self.lock().rebalance.insert(volume.to_string(), progress);
    }

    pub fn set_quota_usage(&self, volume: &str, path: &str, bytes: u64) {
        self.lock()
            .usage
            .insert((volume.to_string(), path.to_string()), bytes);
    }

    pub fn gsync_sessions(&self) -> Vec<(String, String)> {
        let mut sessions: Vec<_> = self.lock().gsync.keys().cloned().collect();
        sessions.sort();
        sessions
    }
}

impl ServiceSupervisor for InMemorySupervisor {
    fn start_rebalance(&self, volume: &str, command: RebalanceCommand) -> Result<()> {
        let mut state = self.lock();
        let current = state.rebalance.get(volume).copied().unwrap_or_default();
        if current.status.is_running() {
            return Err(MgmtError::Conflict(format!(
                "Rebalance on {} is already started",
                volume
            )));
        }
        let status = match command {
            RebalanceCommand::MigrateData => RebalanceStatus::MigrationStarted,
            _ => RebalanceStatus::LayoutFixStarted,
        };
        info!(volume, ?command, "rebalance started");
        state.rebalance.insert(
            volume.to_string(),
            RebalanceProgress {
                status,
                ..Default::default()
            },
        );
        Ok(())
    }

    fn stop_rebalance(&self, volume: &str) -> Result<RebalanceProgress> {
        let mut state = self.lock();
        let progress = state
            .rebalance
            .get_mut(volume)
            .filter(|p| p.status.is_running())
            .ok_or_else(|| MgmtError::State(format!("Rebalance not started for volume {}", volume)))?;
        progress.status = RebalanceStatus::Stopped;
        info!(volume, "rebalance stopped");
        Ok(*progress)
    }

    fn rebalance_status(&self, volume: &str) -> RebalanceProgress {
        self.lock().rebalance.get(volume).copied().unwrap_or_default()
    }

    fn start_gsync(&self, master: &str, slave: &str) -> Result<()> {
        info!(master, slave, "geo-replication worker started");
        self.lock()
            .gsync
            .insert((master.to_string(), slave.to_string()), "OK".to_string());
        Ok(())
    }

    fn stop_gsync(&self, master: &str, slave: &str) -> Result<()> {
        let key = (master.to_string(), slave.to_string());
        if self.lock().gsync.remove(&key).is_none() {
            return Err(MgmtError::State(format!(
                "geo-replication session between {} & {} not active",
                master, slave
            )));
        }
        info!(master, slave, "geo-replication worker stopped");
        Ok(())
    }

    fn gsync_status(&self, master: &str, slave: &str) -> Option<String> {
        self.lock()
            .gsync
            .get(&(master.to_string(), slave.to_string()))
            .cloned()
    }

    fn gsync_config(&self, master: &str, slave: &str) -> OptionDict {
        self.lock()
            .gsync_config
            .get(&(master.to_string(), slave.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn set_gsync_config(&self, master: &str, slave: &str, name: &str, value: Option<&str>) -> Result<()> {
        let mut state = self.lock();
        let config = state
            .gsync_config
            .entry((master.to_string(), slave.to_string()))
            .or_default();
        match value {
            Some(v) => {
                config.insert(name.to_string(), v.to_string());
            }
            None => {
                config.remove(name);
            }
        }
        Ok(())
    }

    fn quota_usage(&self, volume: &str, path: &str) -> Option<u64> {
        self.lock()
            .usage
            .get(&(volume.to_string(), path.to_string()))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_labels_verbatim() {
        let expected = [
            "not started",
            "step 1: layout fix in progress",
            "step 2: data migration in progress",
            "stopped",
            "completed",
            "failed",
            "step 1: layout fix complete",
            "step 2: data migration complete",
        ];
        for (code, label) in expected.iter().enumerate() {
            let status = RebalanceStatus::from_code(code as i64);
            assert_eq!(status.label(), *label);
            assert_eq!(status.code(), Some(code as i64));
        }
        assert_eq!(RebalanceStatus::from_code(8).label(), "unknown");
        assert_eq!(RebalanceStatus::from_code(-1).label(), "unknown");
    }

    #[test]
    fn test_progress_response_round_trip() {
        let p = RebalanceProgress {
            status: RebalanceStatus::MigrationStarted,
            files: 10,
            size: 4096,
            lookedup: 12,
        };
        let rsp = p.to_response();
        assert_eq!(rsp["status"], "2");
        assert_eq!(RebalanceProgress::from_response(&rsp), p);
    }

    #[test]
    fn test_rebalance_lifecycle() {
        let sup = InMemorySupervisor::new();
        assert_eq!(sup.rebalance_status("v").status, RebalanceStatus::NotStarted);
        sup.start_rebalance("v", RebalanceCommand::Start).unwrap();
        assert!(sup.start_rebalance("v", RebalanceCommand::Start).is_err());
        let stopped = sup.stop_rebalance("v").unwrap();
        assert_eq!(stopped.status, RebalanceStatus::Stopped);
        assert!(sup.stop_rebalance("v").is_err());
        sup.start_rebalance("v", RebalanceCommand::MigrateData).unwrap();
        assert_eq!(sup.rebalance_status("v").status, RebalanceStatus::MigrationStarted);
    }

    #[test]
    fn test_gsync_bookkeeping() {
        let sup = InMemorySupervisor::new();
        sup.start_gsync("v", "ssh://h::dst").unwrap();
        assert_eq!(sup.gsync_status("v", "ssh://h::dst").as_deref(), Some("OK"));
        sup.set_gsync_config("v", "ssh://h::dst", "log-level", Some("DEBUG")).unwrap();
        assert_eq!(sup.gsync_config("v", "ssh://h::dst")["log-level"], "DEBUG");
        sup.set_gsync_config("v", "ssh://h::dst", "log-level", None).unwrap();
        assert!(sup.gsync_config("v", "ssh://h::dst").is_empty());
        sup.stop_gsync("v", "ssh://h::dst").unwrap();
        assert!(sup.stop_gsync("v", "ssh://h::dst").is_err());
    }
}
