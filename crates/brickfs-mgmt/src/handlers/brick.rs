//! Brick membership changes: add, remove and replace.

use brickfs_volgen::builder::{KEY_ENABLE_PUMP, KEY_RB_DST_BRICK};
use brickfs_volgen::{BrickInfo, ReplaceBrickSession, ReplaceBrickStatus, VolgenEngine, VolumeInfo, VolumeStatus};
use std::collections::HashSet;
use tracing::info;
use uuid::Uuid;

use super::volume::{check_group_multiple, validate_new_bricks};
use super::{mismatch, OpHandler};
use crate::brick_op::BrickTarget;
use crate::error::{MgmtError, Result};
use crate::merge::{KEY_DST_BRICK_PORT, KEY_SRC_BRICK_PORT};
use crate::op_ctx::{OpRequest, OperationKind, ReplaceBrickAction, ResponseDict};
use crate::state::ClusterState;
use crate::transport::BrickRequest;

pub struct AddBrick;

impl OpHandler for AddBrick {
    fn kind(&self) -> OperationKind {
        OperationKind::AddBrick
    }

    fn stage(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<()> {
        let OpRequest::AddBrick { name, bricks } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let vol = state.require_volume(name)?;
        if vol.replace_brick.is_some() {
            return Err(MgmtError::State(format!(
                "Replace brick is in progress on volume {}. Please retry after replace-brick operation is committed or aborted",
                name
            )));
        }
        let bricks = validate_new_bricks(state, bricks)?;
        check_group_multiple(vol.cluster, vol.sub_count, bricks.len())
    }

    fn commit(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<ResponseDict> {
        let OpRequest::AddBrick { name, bricks } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let mut vol = state.require_volume(name)?;
        let started = vol.status == VolumeStatus::Started;
        let mut port = state.next_brick_port();
        for spec in bricks {
            let mut brick = BrickInfo::parse(spec)?;
            brick.started = started;
            if started && state.is_local_brick(&brick) {
                brick.port = Some(port);
                port += 1;
            }
            vol.bricks.push(brick);
        }
        vol.touch();
        info!(volume = %name, added = bricks.len(), "bricks added");
        state.store_volume(vol)?;
        Ok(ResponseDict::new())
    }
}

pub struct RemoveBrick;

fn bricks_to_remove(vol: &VolumeInfo, specs: &[String]) -> Result<Vec<BrickInfo>> {
    let mut seen = HashSet::new();
    let mut found = Vec::with_capacity(specs.len());
    for spec in specs {
        let (_, brick) = vol.find_brick(spec).ok_or_else(|| {
            MgmtError::Validation(format!("Incorrect brick {} for volume {}", spec, vol.name))
        })?;
        if !seen.insert(spec.as_str()) {
            return Err(MgmtError::Validation(format!("Brick {} is duplicated", spec)));
        }
        found.push(brick.clone());
    }
    Ok(found)
}

impl OpHandler for RemoveBrick {
    fn kind(&self) -> OperationKind {
        OperationKind::RemoveBrick
    }

    fn stage(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<()> {
        let OpRequest::RemoveBrick { name, bricks } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let vol = state.require_volume(name)?;
        if bricks.is_empty() {
            return Err(MgmtError::Validation("No bricks specified".into()));
        }
        if vol.replace_brick.is_some() {
            return Err(MgmtError::State(format!(
                "Replace brick is in progress on volume {}. Please retry after replace-brick operation is committed or aborted",
                name
            )));
        }
        let removed = bricks_to_remove(&vol, bricks)?;
        if removed.len() >= vol.brick_count() {
            return Err(MgmtError::Validation(
                "Deleting all the bricks of the volume is not allowed".into(),
            ));
        }
        check_group_multiple(vol.cluster, vol.sub_count, removed.len())
    }

    fn select_bricks(&self, state: &ClusterState, request: &OpRequest) -> Result<Vec<BrickTarget>> {
        let OpRequest::RemoveBrick { name, bricks } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let vol = state.require_volume(name)?;
        Ok(bricks_to_remove(&vol, bricks)?
            .into_iter()
            .filter(|b| b.started && state.is_local_brick(b))
            .map(|b| BrickTarget::new(b, BrickRequest::Terminate))
            .collect())
    }

    fn commit(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<ResponseDict> {
        let OpRequest::RemoveBrick { name, bricks } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let mut vol = state.require_volume(name)?;
        for removed in bricks_to_remove(&vol, bricks)? {
            state
                .store
                .remove_volfile(&VolgenEngine::brick_volfile_path(&vol, &removed))?;
        }
        vol.bricks.retain(|b| !bricks.contains(&b.id()));
        vol.touch();
        info!(volume = %name, removed = bricks.len(), "bricks removed");
        state.store_volume(vol)?;
        Ok(ResponseDict::new())
    }
}

pub struct ReplaceBrick;

fn session_matches(vol: &VolumeInfo, src: &str, dst: &str) -> Result<ReplaceBrickSession> {
    match &vol.replace_brick {
        Some(s) if s.src.id() == src && s.dst.id() == dst => Ok(s.clone()),
        Some(s) => Err(MgmtError::Validation(format!(
            "Replace brick in progress between {} and {}",
            s.src, s.dst
        ))),
        None => Err(MgmtError::State(format!(
            "Replace brick is not started on volume {}",
            vol.name
        ))),
    }
}

fn clear_pump(vol: &mut VolumeInfo) {
    vol.options.remove(KEY_ENABLE_PUMP);
    vol.options.remove(KEY_RB_DST_BRICK);
    vol.replace_brick = None;
}

impl ReplaceBrick {
    /// Ports of the bricks this node serves
    fn local_ports(state: &ClusterState, vol: &VolumeInfo, src: &BrickInfo, dst: &BrickInfo) -> ResponseDict {
        let mut rsp = ResponseDict::new();
        if state.is_local_brick(src) {
            if let Some(port) = vol.find_brick(&src.id()).and_then(|(_, b)| b.port) {
                rsp.insert(KEY_SRC_BRICK_PORT.into(), port.to_string());
            }
        }
        if state.is_local_brick(dst) {
            let port = dst.port.unwrap_or_else(|| state.next_brick_port());
            rsp.insert(KEY_DST_BRICK_PORT.into(), port.to_string());
        }
        rsp
    }
}

impl OpHandler for ReplaceBrick {
    fn kind(&self) -> OperationKind {
        OperationKind::ReplaceBrick
    }

    fn stage(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<()> {
        let OpRequest::ReplaceBrick { name, src, dst, action } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let vol = state.require_volume(name)?;
        if vol.find_brick(src).is_none() {
            return Err(MgmtError::Validation(format!(
                "Incorrect source brick {} for volume {}",
                src, name
            )));
        }
        match action {
            ReplaceBrickAction::Start => {
                if vol.status != VolumeStatus::Started {
                    return Err(MgmtError::State(format!("Volume {} needs to be started", name)));
                }
                if let Some(s) = &vol.replace_brick {
                    return Err(MgmtError::Conflict(format!(
                        "Replace brick is already started between {} and {}",
                        s.src, s.dst
                    )));
                }
                validate_new_bricks(state, std::slice::from_ref(dst))?;
            }
            ReplaceBrickAction::Pause => {
                let session = session_matches(&vol, src, dst)?;
                if session.status == ReplaceBrickStatus::Paused {
                    return Err(MgmtError::State("Replace brick is already paused".into()));
                }
            }
            ReplaceBrickAction::Abort | ReplaceBrickAction::Status | ReplaceBrickAction::Commit => {
                session_matches(&vol, src, dst)?;
            }
            ReplaceBrickAction::CommitForce => {
                if vol.replace_brick.is_some() {
                    session_matches(&vol, src, dst)?;
                } else {
                    validate_new_bricks(state, std::slice::from_ref(dst))?;
                }
            }
        }
        Ok(())
    }

    fn commit(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<ResponseDict> {
        let OpRequest::ReplaceBrick { name, src, dst, action } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let mut vol = state.require_volume(name)?;
        let (index, src_brick) = vol
            .find_brick(src)
            .map(|(i, b)| (i, b.clone()))
            .ok_or_else(|| MgmtError::Validation(format!("Incorrect source brick {} for volume {}", src, name)))?;
        let dst_brick = BrickInfo::parse(dst)?;
        let mut rsp = Self::local_ports(state, &vol, &src_brick, &dst_brick);

        match action {
            ReplaceBrickAction::Start => {
                vol.options.insert(KEY_ENABLE_PUMP.into(), "on".into());
                vol.options.insert(KEY_RB_DST_BRICK.into(), dst_brick.id());
                vol.replace_brick = Some(ReplaceBrickSession {
                    src: src_brick,
                    dst: dst_brick,
                    status: ReplaceBrickStatus::Started,
                });
                info!(volume = %name, %src, %dst, "replace-brick started");
            }
            ReplaceBrickAction::Pause => {
                if let Some(session) = vol.replace_brick.as_mut() {
                    session.status = ReplaceBrickStatus::Paused;
                }
                info!(volume = %name, %src, %dst, "replace-brick paused");
            }
            ReplaceBrickAction::Abort => {
                clear_pump(&mut vol);
                info!(volume = %name, %src, %dst, "replace-brick aborted");
            }
            ReplaceBrickAction::Status => {
                let status = match vol.replace_brick.as_ref().map(|s| s.status) {
                    Some(ReplaceBrickStatus::Started) => "migration in progress",
                    Some(ReplaceBrickStatus::Paused) => "migration paused",
                    None => "not started",
                };
                rsp.insert("status".into(), status.into());
                return Ok(rsp);
            }
            ReplaceBrickAction::Commit | ReplaceBrickAction::CommitForce => {
                state
                    .store
                    .remove_volfile(&VolgenEngine::brick_volfile_path(&vol, &src_brick))?;
                let mut new_brick = dst_brick;
                new_brick.started = src_brick.started;
                if new_brick.started && state.is_local_brick(&new_brick) {
                    new_brick.port = Some(state.next_brick_port());
                }
                vol.bricks[index] = new_brick;
                clear_pump(&mut vol);
                info!(volume = %name, %src, %dst, "replace-brick committed");
            }
        }
        vol.touch();
        state.store_volume(vol)?;
        Ok(rsp)
    }
}
