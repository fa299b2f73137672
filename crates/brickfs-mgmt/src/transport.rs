//! Peer and brick RPC boundary.
//!
//! Messages are plain serde enums; the byte encoding belongs to the
//! transport implementation. The daemon only ever talks to the traits
//! below, which lets tests wire nodes together in-process.

use async_trait::async_trait;
use brickfs_volgen::{BrickInfo, VolumeInfo};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::friend_sm::FsmLogEntry;
use crate::op_ctx::{OpRequest, ResponseDict};
use crate::peer::PeerRecord;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer {addr} unreachable: {reason}")]
    Unreachable { addr: String, reason: String },

    #[error("request to {addr} timed out after {timeout_ms}ms")]
    Timeout { addr: String, timeout_ms: u64 },

    #[error("unable to decode response from {addr}: {reason}")]
    Decode { addr: String, reason: String },

    #[error("{addr} failed the request: {reason}")]
    Remote { addr: String, reason: String },
}

/// Requests exchanged between management daemons
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerRequest {
    /// First contact from a prober
    Probe { uuid: Uuid, hostname: String, port: u16 },
    /// Handshake carrying the sender's volume set
    FriendAdd {
        uuid: Uuid,
        hostname: String,
        port: u16,
        volumes: Vec<VolumeInfo>,
    },
    /// The sender detaches the receiver
    FriendRemove { uuid: Uuid, hostname: String },
    /// The sender's view of the cluster membership
    FriendUpdate {
        uuid: Uuid,
        hostname: String,
        peers: Vec<PeerRecord>,
    },
    /// Take the cluster lock on behalf of `uuid`
    ClusterLock { uuid: Uuid },
    /// Release the cluster lock held by `uuid`
    ClusterUnlock { uuid: Uuid },
    /// Validate an operation against the receiver's state
    StageOp { uuid: Uuid, request: OpRequest },
    /// Run the receiver's brick sub-operations for an operation
    BrickOp { uuid: Uuid, request: OpRequest },
    /// Apply an operation
    CommitOp { uuid: Uuid, request: OpRequest },
    /// Return the friend state machine log
    FsmLog,
    /// Liveness check between befriended peers
    Heartbeat { uuid: Uuid },
}

impl PeerRequest {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            PeerRequest::Probe { .. } => "probe",
            PeerRequest::FriendAdd { .. } => "friend-add",
            PeerRequest::FriendRemove { .. } => "friend-remove",
            PeerRequest::FriendUpdate { .. } => "friend-update",
            PeerRequest::ClusterLock { .. } => "cluster-lock",
            PeerRequest::ClusterUnlock { .. } => "cluster-unlock",
            PeerRequest::StageOp { .. } => "stage-op",
            PeerRequest::BrickOp { .. } => "brick-op",
            PeerRequest::CommitOp { .. } => "commit-op",
            PeerRequest::FsmLog => "fsm-log",
            PeerRequest::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Reply to any [`PeerRequest`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerResponse {
    pub uuid: Uuid,
    pub hostname: String,
    pub op_ret: i32,
    pub op_errno: i32,
    #[serde(default)]
    pub op_errstr: Option<String>,
    #[serde(default)]
    pub payload: ResponseDict,
    #[serde(default)]
    pub volumes: Vec<VolumeInfo>,
    #[serde(default)]
    pub fsm_log: Vec<FsmLogEntry>,
}

impl PeerResponse {
    /// Successful reply from `uuid`
    pub fn accept(uuid: Uuid, hostname: impl Into<String>) -> Self {
        Self {
            uuid,
            hostname: hostname.into(),
            ..Default::default()
        }
    }

    /// Failed reply from `uuid`
    pub fn reject(uuid: Uuid, hostname: impl Into<String>, errno: i32, errstr: impl Into<String>) -> Self {
        Self {
            uuid,
            hostname: hostname.into(),
            op_ret: -1,
            op_errno: errno,
            op_errstr: Some(errstr.into()),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: ResponseDict) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_volumes(mut self, volumes: Vec<VolumeInfo>) -> Self {
        self.volumes = volumes;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.op_ret == 0
    }
}

/// Sub-operations executed by a brick daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrickRequest {
    /// Shut the brick daemon down
    Terminate,
    /// Report io-stats counters
    ProfileInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrickResponse {
    pub op_ret: i32,
    #[serde(default)]
    pub op_errstr: Option<String>,
    #[serde(default)]
    pub payload: ResponseDict,
}

/// Channel to other management daemons
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Sends one request and waits for its reply
    async fn send(&self, hostname: &str, port: u16, request: PeerRequest) -> Result<PeerResponse, TransportError>;
}

/// Channel to brick daemons
#[async_trait]
pub trait BrickTransport: Send + Sync + 'static {
    /// Sends one brick sub-operation
    async fn send(&self, brick: &BrickInfo, request: BrickRequest) -> Result<BrickResponse, TransportError>;

    /// Drops the connection to a brick
    async fn disconnect(&self, brick: &BrickInfo);
}
