//! Volume profiling: toggles io-stats counters and collects them from bricks.

use brickfs_volgen::options::{VKEY_DIAG_CNT_FOP_HITS, VKEY_DIAG_LAT_MEASUREMENT};
use brickfs_volgen::{VolumeInfo, VolumeStatus};
use tracing::info;
use uuid::Uuid;

use super::{mismatch, OpHandler};
use crate::brick_op::BrickTarget;
use crate::error::{MgmtError, Result};
use crate::op_ctx::{OpRequest, OperationKind, ProfileCommand, ResponseDict};
use crate::state::ClusterState;
use crate::transport::BrickRequest;

const PROFILE_KEYS: [&str; 2] = [VKEY_DIAG_LAT_MEASUREMENT, VKEY_DIAG_CNT_FOP_HITS];

fn profiling_on(state: &ClusterState, vol: &VolumeInfo) -> bool {
    let table = state.volgen.table();
    PROFILE_KEYS
        .iter()
        .all(|k| table.get_boolean(&vol.options, k).unwrap_or(false))
}

pub struct Profile;

impl OpHandler for Profile {
    fn kind(&self) -> OperationKind {
        OperationKind::Profile
    }

    fn stage(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<()> {
        let OpRequest::Profile { name, command } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let vol = state.require_volume(name)?;
        let on = profiling_on(state, &vol);
        match command {
            ProfileCommand::Start if on => Err(MgmtError::State(format!(
                "Profile on Volume {} is already started",
                name
            ))),
            ProfileCommand::Stop | ProfileCommand::Info if !on => Err(MgmtError::State(format!(
                "Profile on Volume {} is not started",
                name
            ))),
            ProfileCommand::Info if vol.status != VolumeStatus::Started => {
                Err(MgmtError::State(format!("Volume {} is not started", name)))
            }
            _ => Ok(()),
        }
    }

    fn select_bricks(&self, state: &ClusterState, request: &OpRequest) -> Result<Vec<BrickTarget>> {
        let OpRequest::Profile { name, command } = request else {
            return Err(mismatch(self.kind(), request));
        };
        if *command != ProfileCommand::Info {
            return Ok(Vec::new());
        }
        let vol = state.require_volume(name)?;
        Ok(vol
            .bricks
            .into_iter()
            .filter(|b| state.is_local_brick(b))
            .map(|b| BrickTarget::new(b, BrickRequest::ProfileInfo))
            .collect())
    }

    fn commit(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<ResponseDict> {
        let OpRequest::Profile { name, command } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let mut rsp = ResponseDict::new();
        rsp.insert("volname".into(), name.clone());
        if *command == ProfileCommand::Info {
            return Ok(rsp);
        }
        let mut vol = state.require_volume(name)?;
        let value = if *command == ProfileCommand::Start { "on" } else { "off" };
        for key in PROFILE_KEYS {
            vol.options.insert(key.to_string(), value.to_string());
        }
        vol.touch();
        state.store_volume(vol)?;
        info!(volume = %name, ?command, "profiling toggled");
        Ok(rsp)
    }
}
