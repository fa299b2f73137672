//! Volume option set and reset.

use brickfs_volgen::options::OPT_FLAG_FORCE;
use brickfs_volgen::{OptionDict, OptionLookup, OptionTable, VolumeInfo};
use tracing::info;
use uuid::Uuid;

use super::{mismatch, OpHandler};
use crate::error::{MgmtError, Result};
use crate::op_ctx::{OpRequest, OperationKind, ResponseDict};
use crate::state::ClusterState;

/// Volume name addressing cluster-wide options
pub const ALL_VOLUMES: &str = "all";

/// Value that drops a key back to its table default
pub const DEFAULT_MARKER: &str = "default";

/// One requested change after key resolution
#[derive(Debug, Clone, PartialEq, Eq)]
enum Change {
    Set(String, String),
    /// Drop the key; `String` is the key as stored
    Unset(String),
}

fn unknown_option(key: &str, lookup: OptionLookup) -> MgmtError {
    let mut msg = format!("option : {} does not exist", key);
    if let OptionLookup::Unknown(Some(hint)) = lookup {
        msg.push_str(&format!("\nDid you mean {}?", hint));
    }
    MgmtError::Validation(msg)
}

fn resolve(table: &OptionTable, options: &OptionDict, force: bool) -> Result<Vec<Change>> {
    if options.is_empty() {
        return Err(MgmtError::Validation("No options received".into()));
    }
    let mut changes = Vec::with_capacity(options.len());
    for (key, value) in options {
        match table.check_option_exists(key) {
            OptionLookup::Exists(full) => {
                if table.has_flags(&full, OPT_FLAG_FORCE) && !force {
                    return Err(MgmtError::Conflict(format!("option {} is reserved; use force", full)));
                }
                if value == DEFAULT_MARKER {
                    changes.push(Change::Unset(full));
                } else {
                    changes.push(Change::Set(full, value.clone()));
                }
            }
            lookup => {
                if value == DEFAULT_MARKER {
                    changes.push(Change::Unset(key.clone()));
                } else {
                    return Err(unknown_option(key, lookup));
                }
            }
        }
    }
    Ok(changes)
}

/// Options as they would be passed to graph validation
fn candidate(table: &OptionTable, changes: &[Change]) -> OptionDict {
    changes
        .iter()
        .filter_map(|c| match c {
            Change::Set(k, v) => Some((k.clone(), v.clone())),
            Change::Unset(k) => {
                let default = table.find(k)?.default?;
                Some((k.clone(), default.to_string()))
            }
        })
        .collect()
}

fn apply(vol: &mut VolumeInfo, changes: &[Change]) {
    for change in changes {
        match change {
            Change::Set(k, v) => {
                vol.options.insert(k.clone(), v.clone());
            }
            Change::Unset(k) => {
                vol.options.remove(k);
            }
        }
    }
    vol.touch();
}

pub struct SetOption;

impl OpHandler for SetOption {
    fn kind(&self) -> OperationKind {
        OperationKind::SetOption
    }

    fn stage(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<()> {
        let OpRequest::SetOption { name, options, force } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let table = state.volgen.table();
        let changes = resolve(table, options, *force)?;
        let candidate = candidate(table, &changes);
        let all = state.volumes();
        if name == ALL_VOLUMES {
            if all.is_empty() {
                return Err(MgmtError::Validation("No volumes present in cluster".into()));
            }
            for vol in &all {
                state.volgen.validate_global(vol, &all, &candidate)?;
            }
        } else {
            let vol = state.require_volume(name)?;
            state.volgen.validate_reconf(&vol, &all, &candidate)?;
        }
        Ok(())
    }

    fn commit(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<ResponseDict> {
        let OpRequest::SetOption { name, options, force } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let changes = resolve(state.volgen.table(), options, *force)?;
        let targets = if name == ALL_VOLUMES {
            state.volumes()
        } else {
            vec![state.require_volume(name)?]
        };
        for mut vol in targets {
            apply(&mut vol, &changes);
            info!(volume = %vol.name, changes = changes.len(), "options set");
            state.store_volume(vol)?;
        }
        Ok(ResponseDict::new())
    }
}

pub struct ResetOption;

impl ResetOption {
    /// Keys of `vol` the reset removes
    fn targets(table: &OptionTable, vol: &VolumeInfo, key: Option<&str>, force: bool) -> Result<Vec<Change>> {
        match key {
            Some(key) => {
                let full = match table.check_option_exists(key) {
                    OptionLookup::Exists(full) => full,
                    lookup => return Err(unknown_option(key, lookup)),
                };
                if table.has_flags(&full, OPT_FLAG_FORCE) && !force {
                    return Err(MgmtError::Conflict(format!("option {} is reserved; use force", full)));
                }
                Ok(vec![Change::Unset(full)])
            }
            None => Ok(vol
                .options
                .keys()
                // keys outside the table are internal bookkeeping
                .filter(|k| table.find(k).is_some())
                .filter(|k| force || !table.has_flags(k, OPT_FLAG_FORCE))
                .map(|k| Change::Unset(k.clone()))
                .collect()),
        }
    }
}

impl OpHandler for ResetOption {
    fn kind(&self) -> OperationKind {
        OperationKind::ResetOption
    }

    fn stage(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<()> {
        let OpRequest::ResetOption { name, key, force } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let table = state.volgen.table();
        let vol = state.require_volume(name)?;
        let changes = Self::targets(table, &vol, key.as_deref(), *force)?;
        let mut candidate = candidate(table, &changes);
        candidate.retain(|k, _| table.is_local(k));
        state.volgen.validate_reconf(&vol, &state.volumes(), &candidate)?;
        Ok(())
    }

    fn commit(&self, state: &ClusterState, _origin: Uuid, request: &OpRequest) -> Result<ResponseDict> {
        let OpRequest::ResetOption { name, key, force } = request else {
            return Err(mismatch(self.kind(), request));
        };
        let mut vol = state.require_volume(name)?;
        let changes = Self::targets(state.volgen.table(), &vol, key.as_deref(), *force)?;
        apply(&mut vol, &changes);
        info!(volume = %name, reset = changes.len(), "options reset");
        state.store_volume(vol)?;
        Ok(ResponseDict::new())
    }
}
