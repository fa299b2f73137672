//! Pulls volume definitions from a named peer.

use brickfs_volgen::VolumeInfo;
use tracing::{info, warn};
use uuid::Uuid;

use super::{mismatch, OpHandler};
use crate::error::{MgmtError, Result};
use crate::friend_sm::FriendState;
use crate::merge::KEY_COUNT;
use crate::op_ctx::{OpRequest, OperationKind, ResponseDict};
use crate::state::ClusterState;

/// Encodes volumes as `volume1..N` JSON values plus `count`
pub fn export_volumes(volumes: &[VolumeInfo]) -> Result<ResponseDict> {
    let mut rsp = ResponseDict::new();
    for (i, vol) in volumes.iter().enumerate() {
        rsp.insert(format!("volume{}", i + 1), serde_json::to_string(vol)?);
    }
    rsp.insert(KEY_COUNT.to_string(), volumes.len().to_string());
    Ok(rsp)
}

/// Decodes the payload built by [`export_volumes`]
pub fn import_payload(rsp: &ResponseDict) -> Result<Vec<VolumeInfo>> {
    let count: usize = rsp.get(KEY_COUNT).and_then(|c| c.parse().ok()).unwrap_or(0);
    (1..=count)
        .filter_map(|i| rsp.get(&format!("volume{}", i)))
        .map(|raw| serde_json::from_str(raw).map_err(MgmtError::from))
        .collect()
}

pub struct SyncVolume;

impl OpHandler for SyncVolume {
    fn kind(&self) -> OperationKind {
        OperationKind::Sync
    }

    fn stage(&self, state: &ClusterState, origin: Uuid, request: &OpRequest) -> Result<()> {
        let OpRequest::Sync { hostname, volume } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let coordinating = origin == state.uuid();
        if state.is_local_host(hostname) {
            if coordinating {
                return Err(MgmtError::Validation("sync from localhost not allowed".into()));
            }
            if let Some(name) = volume {
                state.require_volume(name)?;
            }
            return Ok(());
        }
        if coordinating {
            let connected = state
                .peers
                .find(hostname)
                .map(|p| p.state == FriendState::Connected)
                .unwrap_or(false);
            if !connected {
                return Err(MgmtError::Validation(format!("{}, is not a friend", hostname)));
            }
        }
        Ok(())
    }

    fn commit(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<ResponseDict> {
        let OpRequest::Sync { hostname, volume } = request else {
            return Err(mismatch(self.kind(), request));
        };
        if !state.is_local_host(hostname) {
            return Ok(ResponseDict::new());
        }
        let volumes = match volume {
            Some(name) => vec![state.require_volume(name)?],
            None => state.volumes(),
        };
        info!(count = volumes.len(), "exporting volumes for sync");
        export_volumes(&volumes)
    }

    fn post_commit(&self, state: &ClusterState, request: &OpRequest, response: &ResponseDict) -> Result<()> {
        let OpRequest::Sync { hostname, .. } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let volumes = import_payload(response)?;
        if volumes.is_empty() {
            warn!(%hostname, "sync returned no volumes");
            return Ok(());
        }
        let imported = state.import_volumes(volumes)?;
        info!(%hostname, imported, "volumes synced");
        Ok(())
    }
}
