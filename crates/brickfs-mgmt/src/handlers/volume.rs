//! Volume lifecycle: create, delete, start, stop.

use brickfs_volgen::{BrickInfo, ClusterType, VolumeInfo, VolumeStatus};
use std::collections::HashSet;
use tracing::info;
use uuid::Uuid;

use super::{mismatch, OpHandler};
use crate::brick_op::BrickTarget;
use crate::error::{MgmtError, Result};
use crate::op_ctx::{OpRequest, OperationKind, ResponseDict};
use crate::state::ClusterState;
use crate::transport::BrickRequest;

pub const MAX_VOLNAME_LEN: usize = 1024;

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_VOLNAME_LEN {
        return Err(MgmtError::Validation(format!("Volume name {} is not valid", name)));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(MgmtError::Validation(format!(
            "Volume name {} contains invalid characters",
            name
        )));
    }
    Ok(())
}

/// Parses and checks bricks that are about to join a volume
pub(crate) fn validate_new_bricks(state: &ClusterState, specs: &[String]) -> Result<Vec<BrickInfo>> {
    if specs.is_empty() {
        return Err(MgmtError::Validation("No bricks specified".into()));
    }
    let mut seen = HashSet::new();
    let mut bricks = Vec::with_capacity(specs.len());
    for spec in specs {
        let brick = BrickInfo::parse(spec)?;
        if !brick.path.starts_with('/') {
            return Err(MgmtError::Validation(format!(
                "Brick {} is not an absolute path",
                spec
            )));
        }
        if !seen.insert(brick.id()) {
            return Err(MgmtError::Validation(format!("Brick {} is duplicated", spec)));
        }
        if !state.is_known_host(&brick.hostname) {
            return Err(MgmtError::Validation(format!(
                "Host {} not a friend",
                brick.hostname
            )));
        }
        if let Some(owner) = state.brick_owner(&brick) {
            return Err(MgmtError::Conflict(format!(
                "Brick {} is already part of volume {}",
                spec, owner
            )));
        }
        bricks.push(brick);
    }
    Ok(bricks)
}

/// Replica and stripe volumes grow and shrink in whole groups
pub(crate) fn check_group_multiple(cluster: ClusterType, sub_count: usize, count: usize) -> Result<()> {
    if cluster == ClusterType::None {
        return Ok(());
    }
    if sub_count < 2 {
        return Err(MgmtError::Validation(format!(
            "{:?} count must be at least 2",
            cluster
        )));
    }
    if count % sub_count != 0 {
        return Err(MgmtError::Validation(format!(
            "Incorrect number of bricks supplied {} for type {:?} with count {}",
            count, cluster, sub_count
        )));
    }
    Ok(())
}

pub struct CreateVolume;

impl OpHandler for CreateVolume {
    fn kind(&self) -> OperationKind {
        OperationKind::CreateVolume
    }

    fn prepare(&self, _state: &ClusterState, request: &mut OpRequest) -> Result<()> {
        match request {
            OpRequest::CreateVolume { volume_id, .. } => {
                volume_id.get_or_insert_with(Uuid::new_v4);
                Ok(())
            }
            other => Err(mismatch(self.kind(), other)),
        }
    }

    fn stage(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<()> {
        let OpRequest::CreateVolume {
            name,
            volume_id,
            cluster,
            sub_count,
            bricks,
            ..
        } = request
        else {
            return Err(mismatch(self.kind(), request));
        };
        validate_name(name)?;
        if state.volume(name).is_some() {
            return Err(MgmtError::Conflict(format!("Volume {} already exists", name)));
        }
        if volume_id.is_none() {
            return Err(MgmtError::Validation("Unable to get volume id".into()));
        }
        let bricks = validate_new_bricks(state, bricks)?;
        check_group_multiple(*cluster, *sub_count, bricks.len())
    }

    fn commit(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<ResponseDict> {
        let OpRequest::CreateVolume {
            name,
            volume_id,
            cluster,
            sub_count,
            transport,
            bricks,
        } = request
        else {
            return Err(mismatch(self.kind(), request));
        };
        let id = volume_id.ok_or_else(|| MgmtError::Validation("Unable to get volume id".into()))?;
        let bricks = bricks
            .iter()
            .map(|b| BrickInfo::parse(b))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let sub_count = if *cluster == ClusterType::None { 0 } else { *sub_count };
        let vol = VolumeInfo::new(name.clone(), id, *cluster, sub_count, *transport, bricks);
        state.store_volume(vol)?;
        info!(volume = %name, %id, "volume created");
        Ok(ResponseDict::new())
    }
}

pub struct DeleteVolume;

impl OpHandler for DeleteVolume {
    fn kind(&self) -> OperationKind {
        OperationKind::DeleteVolume
    }

    fn stage(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<()> {
        let OpRequest::DeleteVolume { name } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let vol = state.require_volume(name)?;
        if vol.status == VolumeStatus::Started {
            return Err(MgmtError::State(format!(
                "Volume {} has been started.Volume needs to be stopped before deletion.",
                name
            )));
        }
        Ok(())
    }

    fn commit(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<ResponseDict> {
        let OpRequest::DeleteVolume { name } = request else {
            return Err(mismatch(self.kind(), request));
        };
        state.remove_volume(name)?;
        info!(volume = %name, "volume deleted");
        Ok(ResponseDict::new())
    }
}

pub struct StartVolume;

impl OpHandler for StartVolume {
    fn kind(&self) -> OperationKind {
        OperationKind::StartVolume
    }

    fn stage(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<()> {
        let OpRequest::StartVolume { name, force } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let vol = state.require_volume(name)?;
        if vol.status == VolumeStatus::Started && !force {
            return Err(MgmtError::State(format!("Volume {} already started", name)));
        }
        Ok(())
    }

    fn commit(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<ResponseDict> {
        let OpRequest::StartVolume { name, .. } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let mut vol = state.require_volume(name)?;
        let mut port = state.next_brick_port();
        for brick in vol.bricks.iter_mut() {
            brick.started = true;
            if state.is_local_host(&brick.hostname) && brick.port.is_none() {
                brick.port = Some(port);
                port += 1;
            }
        }
        vol.status = VolumeStatus::Started;
        vol.touch();
        state.store_volume(vol)?;
        info!(volume = %name, "volume started");
        Ok(ResponseDict::new())
    }
}

pub struct StopVolume;

impl OpHandler for StopVolume {
    fn kind(&self) -> OperationKind {
        OperationKind::StopVolume
    }

    fn stage(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<()> {
        let OpRequest::StopVolume { name, force } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let vol = state.require_volume(name)?;
        if vol.status != VolumeStatus::Started {
            return Err(MgmtError::State(format!("Volume {} is not in the started state", name)));
        }
        if vol.has_gsync_sessions() && !force {
            return Err(MgmtError::State(format!(
                "geo-replication sessions are active for the volume {}. Use 'force' to stop the volume",
                name
            )));
        }
        Ok(())
    }

    fn select_bricks(&self, state: &ClusterState, request: &OpRequest) -> Result<Vec<BrickTarget>> {
        let OpRequest::StopVolume { name, .. } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let vol = state.require_volume(name)?;
        Ok(vol
            .bricks
            .into_iter()
            .filter(|b| b.started && state.is_local_brick(b))
            .map(|b| BrickTarget::new(b, BrickRequest::Terminate))
            .collect())
    }

    fn commit(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<ResponseDict> {
        let OpRequest::StopVolume { name, .. } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let mut vol = state.require_volume(name)?;
        for brick in vol.bricks.iter_mut() {
            brick.started = false;
            if state.is_local_host(&brick.hostname) {
                brick.port = None;
            }
        }
        vol.status = VolumeStatus::Stopped;
        vol.touch();
        state.store_volume(vol)?;
        info!(volume = %name, "volume stopped");
        Ok(ResponseDict::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::handlers::testutil::{add_volume, run, state};
    use brickfs_volgen::TransportType;

    fn create(name: &str, cluster: ClusterType, sub_count: usize, bricks: &[&str]) -> OpRequest {
        OpRequest::CreateVolume {
            name: name.into(),
            volume_id: None,
            cluster,
            sub_count,
            transport: TransportType::Tcp,
            bricks: bricks.iter().map(|b| b.to_string()).collect(),
        }
    }

    #[test]
    fn test_create_replicate() {
        let state = state();
        run(
            &state,
            create("vol0", ClusterType::Replicate, 2, &["node1:/a", "node2:/b", "node1:/c", "node2:/d"]),
        )
        .unwrap();
        let vol = state.volume("vol0").unwrap();
        assert_eq!(vol.brick_count(), 4);
        assert_eq!(vol.dist_count(), 2);
        assert_eq!(vol.status, VolumeStatus::Created);
    }

    #[test]
    fn test_create_validation() {
        let state = state();
        let err = run(&state, create("bad name", ClusterType::None, 0, &["node1:/a"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = run(&state, create("v", ClusterType::Replicate, 2, &["node1:/a", "node2:/b", "node1:/c"])).unwrap_err();
        assert!(err.to_string().contains("Incorrect number of bricks"));

        let err = run(&state, create("v", ClusterType::None, 0, &["node1:/a", "node1:/a"])).unwrap_err();
        assert!(err.to_string().contains("duplicated"));

        let err = run(&state, create("v", ClusterType::None, 0, &["node9:/a"])).unwrap_err();
        assert_eq!(err.to_string(), "Host node9 not a friend");

        let err = run(&state, create("v", ClusterType::None, 0, &["node1:relative"])).unwrap_err();
        assert!(err.to_string().contains("absolute"));

        run(&state, create("v", ClusterType::None, 0, &["node1:/a"])).unwrap();
        let err = run(&state, create("v", ClusterType::None, 0, &["node1:/b"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err = run(&state, create("w", ClusterType::None, 0, &["node1:/a"])).unwrap_err();
        assert_eq!(err.to_string(), "Brick node1:/a is already part of volume v");
    }

    #[test]
    fn test_start_stop_delete() {
        let state = state();
        add_volume(&state, "v", 2, VolumeStatus::Created);
        let err = run(&state, OpRequest::StopVolume { name: "v".into(), force: false }).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);

        run(&state, OpRequest::StartVolume { name: "v".into(), force: false }).unwrap();
        let vol = state.volume("v").unwrap();
        assert_eq!(vol.status, VolumeStatus::Started);
        assert_eq!(vol.bricks[0].port, Some(24009));
        assert_eq!(vol.bricks[1].port, None);

        let err = run(&state, OpRequest::StartVolume { name: "v".into(), force: false }).unwrap_err();
        assert_eq!(err.to_string(), "Volume v already started");
        run(&state, OpRequest::StartVolume { name: "v".into(), force: true }).unwrap();

        let err = run(&state, OpRequest::DeleteVolume { name: "v".into() }).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);

        run(&state, OpRequest::StopVolume { name: "v".into(), force: false }).unwrap();
        assert_eq!(state.volume("v").unwrap().status, VolumeStatus::Stopped);
        run(&state, OpRequest::DeleteVolume { name: "v".into() }).unwrap();
        assert!(state.volume("v").is_none());
    }

    #[test]
    fn test_stop_selects_local_bricks() {
        let state = state();
        add_volume(&state, "v", 3, VolumeStatus::Started);
        let targets = StopVolume
            .select_bricks(&state, &OpRequest::StopVolume { name: "v".into(), force: false })
            .unwrap();
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|t| t.brick.hostname == "node1"));
    }

    #[test]
    fn test_stop_blocked_by_gsync() {
        let state = state();
        let mut vol = add_volume(&state, "v", 1, VolumeStatus::Started);
        vol.gsync_slaves
            .insert("slave1".into(), format!("{}:ssh://h::dst", state.uuid()));
        state.store_volume(vol).unwrap();
        let err = run(&state, OpRequest::StopVolume { name: "v".into(), force: false }).unwrap_err();
        assert!(err.to_string().contains("geo-replication sessions are active"));
        run(&state, OpRequest::StopVolume { name: "v".into(), force: true }).unwrap();
    }
}
