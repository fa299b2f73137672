//! Rebalance: the rebalance process runs on the node that issued the command.

use brickfs_volgen::VolumeStatus;
use tracing::info;
use uuid::Uuid;

use super::{mismatch, OpHandler};
use crate::error::{MgmtError, Result};
use crate::op_ctx::{OpRequest, OperationKind, RebalanceCommand, ResponseDict};
use crate::state::ClusterState;

pub struct Rebalance;

impl OpHandler for Rebalance {
    fn kind(&self) -> OperationKind {
        OperationKind::Rebalance
    }

    fn stage(&self, state: &ClusterState, origin: Uuid, request: &OpRequest) -> Result<()> {
        let OpRequest::Rebalance { name, command } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let vol = state.require_volume(name)?;
        if vol.status != VolumeStatus::Started {
            return Err(MgmtError::State(format!(
                "Volume {} needs to be started to perform rebalance",
                name
            )));
        }
        let runs_here = origin == state.uuid();
        match command {
            RebalanceCommand::Start | RebalanceCommand::FixLayout | RebalanceCommand::MigrateData => {
                if vol.dist_count() <= 1 {
                    return Err(MgmtError::Validation(format!(
                        "Volume {} is not a distribute volume or contains only 1 brick.\nNot performing rebalance",
                        name
                    )));
                }
                if runs_here && state.services.rebalance_status(name).status.is_running() {
                    return Err(MgmtError::Conflict(format!("Rebalance on {} is already started", name)));
                }
            }
            RebalanceCommand::Stop => {
                if runs_here && !state.services.rebalance_status(name).status.is_running() {
                    return Err(MgmtError::State(format!("Rebalance not started for volume {}", name)));
                }
            }
            RebalanceCommand::Status => {}
        }
        Ok(())
    }

    fn commit(&self, state: &ClusterState, origin: Uuid, request: &OpRequest) -> Result<ResponseDict> {
        let OpRequest::Rebalance { name, command } = request else {
            return Err(mismatch(self.kind(), request));
        };
        if origin != state.uuid() {
            return Ok(ResponseDict::new());
        }
        let progress = match command {
            RebalanceCommand::Start | RebalanceCommand::FixLayout | RebalanceCommand::MigrateData => {
                state.services.start_rebalance(name, *command)?;
                info!(volume = %name, ?command, "rebalance requested");
                state.services.rebalance_status(name)
            }
            RebalanceCommand::Stop => state.services.stop_rebalance(name)?,
            RebalanceCommand::Status => state.services.rebalance_status(name),
        };
        Ok(progress.to_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testutil::{add_volume, run, state, state_with};
    use crate::services::{InMemorySupervisor, RebalanceProgress, RebalanceStatus, ServiceSupervisor};
    use std::sync::Arc;

    fn rebalance(command: RebalanceCommand) -> OpRequest {
        OpRequest::Rebalance {
            name: "v".into(),
            command,
        }
    }

    #[test]
    fn test_requires_started_distribute() {
        let single = state();
        add_volume(&single, "v", 1, VolumeStatus::Started);
        let err = run(&single, rebalance(RebalanceCommand::Start)).unwrap_err();
        assert!(err.to_string().contains("Not performing rebalance"));

        let stopped = state();
        add_volume(&stopped, "v", 2, VolumeStatus::Stopped);
        let err = run(&stopped, rebalance(RebalanceCommand::Status)).unwrap_err();
        assert_eq!(err.to_string(), "Volume v needs to be started to perform rebalance");
    }

    #[test]
    fn test_start_status_stop() {
        let services = Arc::new(InMemorySupervisor::new());
        let state = state_with(services.clone());
        add_volume(&state, "v", 4, VolumeStatus::Started);

        let rsp = run(&state, rebalance(RebalanceCommand::Start)).unwrap();
        assert_eq!(rsp["status"], "1");
        assert!(run(&state, rebalance(RebalanceCommand::Start)).is_err());

        services.set_rebalance_progress(
            "v",
            RebalanceProgress {
                status: RebalanceStatus::MigrationStarted,
                files: 7,
                size: 1024,
                lookedup: 9,
            },
        );
        let rsp = run(&state, rebalance(RebalanceCommand::Status)).unwrap();
        assert_eq!(RebalanceProgress::from_response(&rsp).files, 7);

        let rsp = run(&state, rebalance(RebalanceCommand::Stop)).unwrap();
        assert_eq!(RebalanceStatus::from_code(rsp["status"].parse().unwrap()), RebalanceStatus::Stopped);
        assert!(run(&state, rebalance(RebalanceCommand::Stop)).is_err());
    }

    #[test]
    fn test_peers_do_not_run_rebalance() {
        let services = Arc::new(InMemorySupervisor::new());
        let state = state_with(services.clone());
        add_volume(&state, "v", 4, VolumeStatus::Started);
        let other = Uuid::new_v4();
        let req = rebalance(RebalanceCommand::Start);
        Rebalance.stage(&state, other, &req).unwrap();
        assert!(Rebalance.commit(&state, other, &req).unwrap().is_empty());
        assert_eq!(services.rebalance_status("v").status, RebalanceStatus::NotStarted);
    }
}
