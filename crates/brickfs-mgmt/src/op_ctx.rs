//! Typed cluster operation requests and the context of an in-flight operation.

use brickfs_volgen::{ClusterType, OptionDict, TransportType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Operation-specific reply payload
pub type ResponseDict = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationKind {
    CreateVolume,
    DeleteVolume,
    StartVolume,
    StopVolume,
    AddBrick,
    RemoveBrick,
    ReplaceBrick,
    SetOption,
    ResetOption,
    Rebalance,
    Profile,
    Quota,
    GeoReplicationSet,
    FsmLog,
    Sync,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::CreateVolume => "Volume Create",
            OperationKind::DeleteVolume => "Volume Delete",
            OperationKind::StartVolume => "Volume Start",
            OperationKind::StopVolume => "Volume Stop",
            OperationKind::AddBrick => "Add Brick",
            OperationKind::RemoveBrick => "Remove Brick",
            OperationKind::ReplaceBrick => "Replace Brick",
            OperationKind::SetOption => "Set Volume",
            OperationKind::ResetOption => "Reset Volume",
            OperationKind::Rebalance => "Rebalance",
            OperationKind::Profile => "Profile",
            OperationKind::Quota => "Quota",
            OperationKind::GeoReplicationSet => "Geo-replication",
            OperationKind::FsmLog => "FSM Log",
            OperationKind::Sync => "Volume Sync",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplaceBrickAction {
    Start,
    Pause,
    Abort,
    Status,
    Commit,
    CommitForce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebalanceCommand {
    Start,
    FixLayout,
    MigrateData,
    Stop,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileCommand {
    Start,
    Stop,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuotaCommand {
    Enable,
    Disable,
    LimitUsage { path: String, limit: String },
    Remove { path: String },
    List { paths: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GsyncConfig {
    Get { name: Option<String> },
    GetAll,
    Set { name: Option<String>, value: Option<String> },
    Del { name: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GsyncCommand {
    Start,
    Stop,
    Config(GsyncConfig),
    Status,
}

/// A management operation with its typed arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpRequest {
    CreateVolume {
        name: String,
        /// Filled in by the coordinator before the operation starts
        #[serde(default)]
        volume_id: Option<Uuid>,
        cluster: ClusterType,
        #[serde(default)]
        sub_count: usize,
        transport: TransportType,
        bricks: Vec<String>,
    },
    DeleteVolume {
        name: String,
    },
    StartVolume {
        name: String,
        #[serde(default)]
        force: bool,
    },
    StopVolume {
        name: String,
        #[serde(default)]
        force: bool,
    },
    AddBrick {
        name: String,
        bricks: Vec<String>,
    },
    RemoveBrick {
        name: String,
        bricks: Vec<String>,
    },
    ReplaceBrick {
        name: String,
        src: String,
        dst: String,
        action: ReplaceBrickAction,
    },
    /// `name` may be `all` for cluster-wide options
    SetOption {
        name: String,
        options: OptionDict,
        #[serde(default)]
        force: bool,
    },
    ResetOption {
        name: String,
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        force: bool,
    },
    Rebalance {
        name: String,
        command: RebalanceCommand,
    },
    Profile {
        name: String,
        command: ProfileCommand,
    },
    Quota {
        name: String,
        command: QuotaCommand,
    },
    GeoReplication {
        master: Option<String>,
        slave: Option<String>,
        command: GsyncCommand,
    },
    Sync {
        hostname: String,
        #[serde(default)]
        volume: Option<String>,
    },
    FsmLog {
        #[serde(default)]
        peer: Option<String>,
    },
}

impl OpRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            OpRequest::CreateVolume { .. } => OperationKind::CreateVolume,
            OpRequest::DeleteVolume { .. } => OperationKind::DeleteVolume,
            OpRequest::StartVolume { .. } => OperationKind::StartVolume,
            OpRequest::StopVolume { .. } => OperationKind::StopVolume,
            OpRequest::AddBrick { .. } => OperationKind::AddBrick,
            OpRequest::RemoveBrick { .. } => OperationKind::RemoveBrick,
            OpRequest::ReplaceBrick { .. } => OperationKind::ReplaceBrick,
            OpRequest::SetOption { .. } => OperationKind::SetOption,
            OpRequest::ResetOption { .. } => OperationKind::ResetOption,
            OpRequest::Rebalance { .. } => OperationKind::Rebalance,
            OpRequest::Profile { .. } => OperationKind::Profile,
            OpRequest::Quota { .. } => OperationKind::Quota,
            OpRequest::GeoReplication { .. } => OperationKind::GeoReplicationSet,
            OpRequest::Sync { .. } => OperationKind::Sync,
            OpRequest::FsmLog { .. } => OperationKind::FsmLog,
        }
    }

    /// Volume the operation targets, if any
    pub fn volume(&self) -> Option<&str> {
        match self {
            OpRequest::CreateVolume { name, .. }
            | OpRequest::DeleteVolume { name }
            | OpRequest::StartVolume { name, .. }
            | OpRequest::StopVolume { name, .. }
            | OpRequest::AddBrick { name, .. }
            | OpRequest::RemoveBrick { name, .. }
            | OpRequest::ReplaceBrick { name, .. }
            | OpRequest::SetOption { name, .. }
            | OpRequest::ResetOption { name, .. }
            | OpRequest::Rebalance { name, .. }
            | OpRequest::Profile { name, .. }
            | OpRequest::Quota { name, .. } => Some(name),
            OpRequest::GeoReplication { master, .. } => master.as_deref(),
            OpRequest::Sync { volume, .. } => volume.as_deref(),
            OpRequest::FsmLog { .. } => None,
        }
    }

    /// Whether the operation fans out to local bricks before committing
    pub fn needs_brick_op(&self) -> bool {
        matches!(
            self,
            OpRequest::StopVolume { .. }
                | OpRequest::RemoveBrick { .. }
                | OpRequest::Profile {
                    command: ProfileCommand::Info,
                    ..
                }
        )
    }
}

/// Final result of an operation as returned to the caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpReply {
    pub op_ret: i32,
    pub op_errno: i32,
    #[serde(default)]
    pub op_errstr: Option<String>,
    #[serde(default)]
    pub response: ResponseDict,
}

impl OpReply {
    pub fn success(response: ResponseDict) -> Self {
        Self {
            response,
            ..Default::default()
        }
    }

    pub fn failure(op_errno: i32, errstr: impl Into<String>) -> Self {
        Self {
            op_ret: -1,
            op_errno,
            op_errstr: Some(errstr.into()),
            response: ResponseDict::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.op_ret == 0
    }
}

/// Accumulated state of the one operation in flight on the coordinator
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub id: Uuid,
    pub kind: OperationKind,
    pub request: OpRequest,
    /// Peers that answered each phase, in arrival order
    pub peer_results: Vec<(Uuid, i32)>,
    /// First non-zero return code
    pub op_ret: i32,
    pub op_errno: i32,
    /// First rejection reason
    pub op_errstr: Option<String>,
    pub response: ResponseDict,
}

impl OperationContext {
    pub fn new(request: OpRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: request.kind(),
            request,
            peer_results: Vec::new(),
            op_ret: 0,
            op_errno: 0,
            op_errstr: None,
            response: ResponseDict::new(),
        }
    }

    /// Records a failure unless an earlier one already won
    pub fn record_failure(&mut self, op_ret: i32, op_errno: i32, errstr: String) -> bool {
        if self.op_ret != 0 {
            return false;
        }
        self.op_ret = if op_ret == 0 { -1 } else { op_ret };
        self.op_errno = op_errno;
        self.op_errstr = Some(errstr);
        true
    }

    pub fn failed(&self) -> bool {
        self.op_ret != 0
    }

    pub fn reply(&self) -> OpReply {
        OpReply {
            op_ret: self.op_ret,
            op_errno: self.op_errno,
            op_errstr: self.op_errstr.clone(),
            response: if self.failed() {
                ResponseDict::new()
            } else {
                self.response.clone()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_json_shape() {
        let json = r#"{"op":"set_option","name":"vol0","options":{"performance.io-cache":"off"}}"#;
        let req: OpRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.kind(), OperationKind::SetOption);
        assert_eq!(req.volume(), Some("vol0"));
        assert!(!req.needs_brick_op());

        let req = OpRequest::Profile {
            name: "v".into(),
            command: ProfileCommand::Info,
        };
        assert!(req.needs_brick_op());
        let back: OpRequest = serde_json::from_str(&serde_json::to_string(&req).unwrap()).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_first_failure_wins() {
        let mut ctx = OperationContext::new(OpRequest::DeleteVolume { name: "v".into() });
        assert!(ctx.record_failure(-1, 22, "first".into()));
        assert!(!ctx.record_failure(-1, 5, "second".into()));
        assert_eq!(ctx.op_errstr.as_deref(), Some("first"));
        assert_eq!(ctx.op_errno, 22);
        let reply = ctx.reply();
        assert!(!reply.is_success());
        assert!(reply.response.is_empty());
    }
}
