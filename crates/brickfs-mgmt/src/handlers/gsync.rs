//! Geo-replication sessions between a master volume and a remote slave.
//!
//! Every node records the session in the master volume's `gsync_slaves`
//! under the uuid of the node that started it; only that node runs the
//! sync worker.

use brickfs_volgen::options::VKEY_MARKER_XTIME;
use brickfs_volgen::{VolumeInfo, VolumeStatus};
use tracing::info;
use uuid::Uuid;

use super::{mismatch, OpHandler};
use crate::error::{MgmtError, Result};
use crate::merge::KEY_GSYNC_COUNT;
use crate::op_ctx::{GsyncCommand, GsyncConfig, OpRequest, OperationKind, ResponseDict};
use crate::state::ClusterState;

/// Config keys owned by the management daemon
const RESERVED_CONFIG: &[&str] = &["gluster-command", "pid-file", "state-file", "session-owner"];

const WORKER_NOT_RUNNING: &str = "not running";

fn is_reserved(name: &str) -> bool {
    let normalized = name.replace('_', "-");
    RESERVED_CONFIG.contains(&normalized.as_str())
}

/// Local paths become `file://` urls, bare `host::vol` slaves go over ssh
pub fn canonical_slave(slave: &str) -> String {
    let slave = slave.trim();
    if slave.contains("://") {
        slave.to_string()
    } else if slave.starts_with('/') {
        format!("file://{}", slave)
    } else {
        format!("ssh://{}", slave)
    }
}

/// Owner uuid of the session `master -> slave`, if registered
fn session_owner(vol: &VolumeInfo, slave: &str) -> Option<Uuid> {
    vol.gsync_slave_urls()
        .into_iter()
        .find(|(_, url)| url == slave)
        .map(|(owner, _)| owner)
}

fn next_slave_key(vol: &VolumeInfo) -> String {
    let max = vol
        .gsync_slaves
        .keys()
        .filter_map(|k| k.strip_prefix("slave")?.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("slave{}", max + 1)
}

fn require<'a>(value: &'a Option<String>, what: &str) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| MgmtError::Validation(what.to_string()))
}

fn started_master(state: &ClusterState, master: &str) -> Result<VolumeInfo> {
    let vol = state
        .volume(master)
        .ok_or_else(|| MgmtError::Validation(format!("Volume name {} does not exist", master)))?;
    if vol.status != VolumeStatus::Started {
        return Err(MgmtError::State(format!(
            "Volume {} needs to be started before geo-replication start",
            master
        )));
    }
    Ok(vol)
}

fn check_config(config: &GsyncConfig) -> Result<()> {
    let missing = || MgmtError::Validation("Option name missing".into());
    match config {
        GsyncConfig::GetAll => Ok(()),
        GsyncConfig::Get { name } => name.as_ref().map(|_| ()).ok_or_else(missing),
        GsyncConfig::Set { name, value } => {
            let name = name.as_deref().ok_or_else(missing)?;
            if value.as_deref().map_or(true, str::is_empty) {
                return Err(MgmtError::Validation("missing value".into()));
            }
            if is_reserved(name) {
                return Err(MgmtError::Validation("Reserved option".into()));
            }
            Ok(())
        }
        GsyncConfig::Del { name } => {
            let name = name.as_deref().ok_or_else(missing)?;
            if is_reserved(name) {
                return Err(MgmtError::Validation("Reserved option".into()));
            }
            Ok(())
        }
    }
}

pub struct GeoReplication;

impl GeoReplication {
    fn config(state: &ClusterState, master: &str, slave: &str, config: &GsyncConfig) -> Result<ResponseDict> {
        let services = &state.services;
        let mut rsp = ResponseDict::new();
        match config {
            GsyncConfig::GetAll => rsp.extend(services.gsync_config(master, slave)),
            GsyncConfig::Get { name } => {
                let name = name.as_deref().unwrap_or_default();
                if let Some(v) = services.gsync_config(master, slave).get(name) {
                    rsp.insert(name.to_string(), v.clone());
                }
            }
            GsyncConfig::Set { name, value } => {
                let name = name.as_deref().unwrap_or_default();
                services.set_gsync_config(master, slave, name, value.as_deref())?;
                info!(master, slave, option = name, "geo-replication config set");
            }
            GsyncConfig::Del { name } => {
                let name = name.as_deref().unwrap_or_default();
                services.set_gsync_config(master, slave, name, None)?;
                info!(master, slave, option = name, "geo-replication config removed");
            }
        }
        Ok(rsp)
    }

    /// Sessions this node owns, numbered from 1
    fn status(state: &ClusterState, master: Option<&str>, slave: Option<&str>) -> ResponseDict {
        let local = state.uuid();
        let mut rsp = ResponseDict::new();
        let mut count = 0;
        for vol in state.volumes() {
            if master.is_some_and(|m| m != vol.name) {
                continue;
            }
            for (owner, url) in vol.gsync_slave_urls() {
                if owner != local || slave.is_some_and(|s| s != url) {
                    continue;
                }
                count += 1;
                let status = state
                    .services
                    .gsync_status(&vol.name, &url)
                    .unwrap_or_else(|| WORKER_NOT_RUNNING.to_string());
                rsp.insert(format!("master{}", count), vol.name.clone());
                rsp.insert(format!("slave{}", count), url);
                rsp.insert(format!("status{}", count), status);
            }
        }
        rsp.insert(KEY_GSYNC_COUNT.to_string(), count.to_string());
        rsp
    }
}

impl OpHandler for GeoReplication {
    fn kind(&self) -> OperationKind {
        OperationKind::GeoReplicationSet
    }

    fn prepare(&self, _state: &ClusterState, request: &mut OpRequest) -> Result<()> {
        if let OpRequest::GeoReplication { slave: Some(slave), .. } = request {
            *slave = canonical_slave(slave);
        }
        Ok(())
    }

    fn stage(&self, state: &ClusterState, origin: Uuid, request: &OpRequest) -> Result<()> {
        let OpRequest::GeoReplication { master, slave, command } = request else {
            return Err(mismatch(self.kind(), request));
        };
        match command {
            GsyncCommand::Start => {
                let master = require(master, "Master volume required")?;
                let slave = require(slave, "Slave required")?;
                let vol = started_master(state, master)?;
                match session_owner(&vol, slave) {
                    Some(owner) if owner == origin => Err(MgmtError::Conflict(format!(
                        "geo-replication session between {} & {} already started",
                        master, slave
                    ))),
                    Some(_) => Err(MgmtError::Conflict(
                        "geo-replication already running in an another machine".into(),
                    )),
                    None => Ok(()),
                }
            }
            GsyncCommand::Stop => {
                let master = require(master, "Master volume required")?;
                let slave = require(slave, "Slave required")?;
                let vol = started_master(state, master)?;
                if session_owner(&vol, slave).is_none() {
                    return Err(MgmtError::State(format!(
                        "geo-replication session between {} & {} not active",
                        master, slave
                    )));
                }
                Ok(())
            }
            GsyncCommand::Config(config) => {
                let master = require(master, "Master volume required")?;
                require(slave, "Slave required")?;
                if state.volume(master).is_none() {
                    return Err(MgmtError::Validation(format!("Volume name {} does not exist", master)));
                }
                check_config(config)
            }
            GsyncCommand::Status => match master.as_deref() {
                Some(m) if state.volume(m).is_none() => {
                    Err(MgmtError::Validation(format!("Volume name {} does not exist", m)))
                }
                _ => Ok(()),
            },
        }
    }

    fn commit(&self, state: &ClusterState, origin: Uuid, request: &OpRequest) -> Result<ResponseDict> {
        let OpRequest::GeoReplication { master, slave, command } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let owner_here = origin == state.uuid();
        match command {
            GsyncCommand::Start => {
                let master = require(master, "Master volume required")?;
                let slave = require(slave, "Slave required")?;
                let mut vol = state.require_volume(master)?;
                let key = next_slave_key(&vol);
                vol.gsync_slaves.insert(key, format!("{}:{}", origin, slave));
                vol.options.insert(VKEY_MARKER_XTIME.to_string(), "on".to_string());
                vol.touch();
                state.store_volume(vol)?;
                if owner_here {
                    state.services.start_gsync(master, slave)?;
                }
                info!(master, slave, %origin, "geo-replication session registered");
                Ok(ResponseDict::new())
            }
            GsyncCommand::Stop => {
                let master = require(master, "Master volume required")?;
                let slave = require(slave, "Slave required")?;
                let mut vol = state.require_volume(master)?;
                vol.gsync_slaves
                    .retain(|_, entry| entry.split_once(':').map(|(_, url)| url) != Some(slave));
                vol.touch();
                state.store_volume(vol)?;
                if owner_here {
                    state.services.stop_gsync(master, slave)?;
                }
                info!(master, slave, "geo-replication session removed");
                Ok(ResponseDict::new())
            }
            GsyncCommand::Config(config) => {
                if !owner_here {
                    return Ok(ResponseDict::new());
                }
                let master = require(master, "Master volume required")?;
                let slave = require(slave, "Slave required")?;
                Self::config(state, master, slave, config)
            }
            GsyncCommand::Status => Ok(Self::status(state, master.as_deref(), slave.as_deref())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testutil::{add_volume, run, state_with};
    use crate::services::{InMemorySupervisor, ServiceSupervisor};
    use std::sync::Arc;

    const SLAVE: &str = "ssh://backup::dst";

    fn gsync(command: GsyncCommand) -> OpRequest {
        OpRequest::GeoReplication {
            master: Some("v".into()),
            slave: Some("backup::dst".into()),
            command,
        }
    }

    fn setup() -> (ClusterState, Arc<InMemorySupervisor>) {
        let services = Arc::new(InMemorySupervisor::new());
        let state = state_with(services.clone());
        add_volume(&state, "v", 2, VolumeStatus::Started);
        (state, services)
    }

    #[test]
    fn test_canonical_slave() {
        assert_eq!(canonical_slave("/backup"), "file:///backup");
        assert_eq!(canonical_slave("host::vol"), "ssh://host::vol");
        assert_eq!(canonical_slave("gluster://h:vol"), "gluster://h:vol");
    }

    #[test]
    fn test_start_registers_session() {
        let (state, services) = setup();
        run(&state, gsync(GsyncCommand::Start)).unwrap();
        let vol = state.volume("v").unwrap();
        assert_eq!(vol.gsync_slaves["slave1"], format!("{}:{}", state.uuid(), SLAVE));
        assert_eq!(vol.options[VKEY_MARKER_XTIME], "on");
        assert_eq!(services.gsync_sessions(), vec![("v".to_string(), SLAVE.to_string())]);

        let err = run(&state, gsync(GsyncCommand::Start)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "geo-replication session between v & ssh://backup::dst already started"
        );
    }

    #[test]
    fn test_start_owned_elsewhere() {
        let (state, services) = setup();
        let other = Uuid::new_v4();
        let mut req = gsync(GsyncCommand::Start);
        GeoReplication.prepare(&state, &mut req).unwrap();
        GeoReplication.stage(&state, other, &req).unwrap();
        GeoReplication.commit(&state, other, &req).unwrap();
        assert!(services.gsync_sessions().is_empty());

        let err = GeoReplication.stage(&state, state.uuid(), &req).unwrap_err();
        assert_eq!(err.to_string(), "geo-replication already running in an another machine");
    }

    #[test]
    fn test_start_needs_started_volume() {
        let services = Arc::new(InMemorySupervisor::new());
        let state = state_with(services);
        add_volume(&state, "v", 1, VolumeStatus::Stopped);
        let err = run(&state, gsync(GsyncCommand::Start)).unwrap_err();
        assert_eq!(err.to_string(), "Volume v needs to be started before geo-replication start");

        let err = run(
            &state,
            OpRequest::GeoReplication {
                master: Some("nope".into()),
                slave: Some("/b".into()),
                command: GsyncCommand::Start,
            },
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Volume name nope does not exist");
    }

    #[test]
    fn test_stop_and_status() {
        let (state, services) = setup();
        let err = run(&state, gsync(GsyncCommand::Stop)).unwrap_err();
        assert!(err.to_string().ends_with("not active"));

        run(&state, gsync(GsyncCommand::Start)).unwrap();
        let rsp = run(&state, gsync(GsyncCommand::Status)).unwrap();
        assert_eq!(rsp[KEY_GSYNC_COUNT], "1");
        assert_eq!(rsp["master1"], "v");
        assert_eq!(rsp["slave1"], SLAVE);
        assert_eq!(rsp["status1"], "OK");

        run(&state, gsync(GsyncCommand::Stop)).unwrap();
        assert!(!state.volume("v").unwrap().has_gsync_sessions());
        assert!(services.gsync_sessions().is_empty());
        let rsp = run(&state, gsync(GsyncCommand::Status)).unwrap();
        assert_eq!(rsp[KEY_GSYNC_COUNT], "0");
    }

    #[test]
    fn test_config_requests() {
        let (state, services) = setup();
        let set = |name: &str, value: Option<&str>| {
            gsync(GsyncCommand::Config(GsyncConfig::Set {
                name: Some(name.into()),
                value: value.map(String::from),
            }))
        };
        assert_eq!(run(&state, set("pid_file", Some("/x"))).unwrap_err().to_string(), "Reserved option");
        assert_eq!(run(&state, set("log-level", None)).unwrap_err().to_string(), "missing value");
        let err = run(
            &state,
            gsync(GsyncCommand::Config(GsyncConfig::Get { name: None })),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Option name missing");
        let err = run(
            &state,
            OpRequest::GeoReplication {
                master: Some("v".into()),
                slave: None,
                command: GsyncCommand::Config(GsyncConfig::GetAll),
            },
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Slave required");

        run(&state, set("log-level", Some("DEBUG"))).unwrap();
        assert_eq!(services.gsync_config("v", SLAVE)["log-level"], "DEBUG");
        let rsp = run(
            &state,
            gsync(GsyncCommand::Config(GsyncConfig::Get {
                name: Some("log-level".into()),
            })),
        )
        .unwrap();
        assert_eq!(rsp["log-level"], "DEBUG");
        run(
            &state,
            gsync(GsyncCommand::Config(GsyncConfig::Del {
                name: Some("log-level".into()),
            })),
        )
        .unwrap();
        assert!(services.gsync_config("v", SLAVE).is_empty());
    }
}
