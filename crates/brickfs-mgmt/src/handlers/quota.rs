//! Directory quota limits kept in the volume's `features.limit-usage` option.

use brickfs_volgen::options::{VKEY_FEATURES_LIMIT_USAGE, VKEY_FEATURES_QUOTA};
use brickfs_volgen::validate::parse_size;
use brickfs_volgen::VolumeInfo;
use tracing::info;
use uuid::Uuid;

use super::{mismatch, OpHandler};
use crate::error::{MgmtError, Result};
use crate::op_ctx::{OpRequest, OperationKind, QuotaCommand, ResponseDict};
use crate::state::ClusterState;

/// `(path, limit)` pairs in stored order
fn limits(vol: &VolumeInfo) -> Vec<(String, String)> {
    vol.options
        .get(VKEY_FEATURES_LIMIT_USAGE)
        .map(|raw| {
            raw.split(',')
                .filter_map(|entry| entry.rsplit_once(':'))
                .map(|(path, limit)| (path.to_string(), limit.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn store_limits(vol: &mut VolumeInfo, limits: &[(String, String)]) {
    if limits.is_empty() {
        vol.options.remove(VKEY_FEATURES_LIMIT_USAGE);
        return;
    }
    let joined = limits
        .iter()
        .map(|(p, l)| format!("{}:{}", p, l))
        .collect::<Vec<_>>()
        .join(",");
    vol.options.insert(VKEY_FEATURES_LIMIT_USAGE.to_string(), joined);
}

fn quota_on(state: &ClusterState, vol: &VolumeInfo) -> bool {
    state
        .volgen
        .table()
        .get_boolean(&vol.options, VKEY_FEATURES_QUOTA)
        .unwrap_or(false)
}

pub struct Quota;

impl Quota {
    fn list(state: &ClusterState, vol: &VolumeInfo, paths: &[String]) -> ResponseDict {
        let mut rsp = ResponseDict::new();
        let mut count = 0;
        for (path, limit) in limits(vol) {
            if !paths.is_empty() && !paths.contains(&path) {
                continue;
            }
            count += 1;
            if let Some(used) = state.services.quota_usage(&vol.name, &path) {
                rsp.insert(format!("usage{}", count), used.to_string());
            }
            rsp.insert(format!("path{}", count), path);
            rsp.insert(format!("limit{}", count), limit);
        }
        rsp.insert("count".into(), count.to_string());
        rsp
    }
}

impl OpHandler for Quota {
    fn kind(&self) -> OperationKind {
        OperationKind::Quota
    }

    fn stage(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<()> {
        let OpRequest::Quota { name, command } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let vol = state.require_volume(name)?;
        let on = quota_on(state, &vol);
        match command {
            QuotaCommand::Enable if on => {
                Err(MgmtError::State(format!("Quota is already enabled on volume {}", name)))
            }
            QuotaCommand::Disable if !on => {
                Err(MgmtError::State(format!("Quota is already disabled on volume {}", name)))
            }
            QuotaCommand::Enable | QuotaCommand::Disable => Ok(()),
            _ if !on => Err(MgmtError::State(format!(
                "Quota is disabled on volume {}, please enable quota",
                name
            ))),
            QuotaCommand::LimitUsage { path, limit } => {
                if !path.starts_with('/') {
                    return Err(MgmtError::Validation(format!("Path {} should be absolute", path)));
                }
                if path.contains(',') || path.contains(':') {
                    return Err(MgmtError::Validation(format!("Invalid path {}", path)));
                }
                match parse_size(limit) {
                    Some(n) if n > 0 => Ok(()),
                    _ => Err(MgmtError::Validation(format!("Invalid limit value {}", limit))),
                }
            }
            QuotaCommand::Remove { path } => {
                if limits(&vol).iter().any(|(p, _)| p == path) {
                    Ok(())
                } else {
                    Err(MgmtError::Validation(format!("Limit not set on path {}", path)))
                }
            }
            QuotaCommand::List { .. } => {
                if limits(&vol).is_empty() {
                    Err(MgmtError::State("Limits not set on any directory".into()))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn commit(&self, state: &ClusterState, origin: Uuid, request: &OpRequest) -> Result<ResponseDict> {
        let OpRequest::Quota { name, command } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let mut vol = state.require_volume(name)?;
        match command {
            QuotaCommand::List { paths } => {
                // usage is probed once, by the node that asked
                if origin != state.uuid() {
                    return Ok(ResponseDict::new());
                }
                return Ok(Self::list(state, &vol, paths));
            }
            QuotaCommand::Enable => {
                vol.options.insert(VKEY_FEATURES_QUOTA.to_string(), "on".to_string());
            }
            QuotaCommand::Disable => {
                vol.options.insert(VKEY_FEATURES_QUOTA.to_string(), "off".to_string());
                vol.options.remove(VKEY_FEATURES_LIMIT_USAGE);
            }
            QuotaCommand::LimitUsage { path, limit } => {
                let mut current = limits(&vol);
                match current.iter_mut().find(|(p, _)| p == path) {
                    Some(entry) => entry.1 = limit.clone(),
                    None => current.push((path.clone(), limit.clone())),
                }
                store_limits(&mut vol, &current);
            }
            QuotaCommand::Remove { path } => {
                let mut current = limits(&vol);
                current.retain(|(p, _)| p != path);
                store_limits(&mut vol, &current);
            }
        }
        vol.touch();
        state.store_volume(vol)?;
        info!(volume = %name, ?command, "quota updated");
        Ok(ResponseDict::new())
    }
}
