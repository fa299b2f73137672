//! Volume and brick model shared by the graph compiler and the management daemon.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, VolgenError};

/// How consecutive bricks are grouped into sub-volumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterType {
    /// Plain distribution over every brick
    None,
    /// Files striped across each group of bricks
    Stripe,
    /// Files mirrored across each group of bricks
    Replicate,
}

/// User-visible volume type derived from cluster type and group size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeType {
    /// Distribute only
    Distribute,
    /// A single stripe group
    Stripe,
    /// A single replica group
    Replicate,
    /// Several stripe groups under distribute
    DistributedStripe,
    /// Several replica groups under distribute
    DistributedReplicate,
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolumeType::Distribute => "Distribute",
            VolumeType::Stripe => "Stripe",
            VolumeType::Replicate => "Replicate",
            VolumeType::DistributedStripe => "Distributed-Stripe",
            VolumeType::DistributedReplicate => "Distributed-Replicate",
        };
        f.write_str(s)
    }
}

/// Network transport used between clients and bricks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    /// TCP only
    Tcp,
    /// RDMA only
    Rdma,
    /// Both, clients pick per mount
    TcpRdma,
}

impl TransportType {
    /// Value written into `transport-type` options
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Tcp => "tcp",
            TransportType::Rdma => "rdma",
            TransportType::TcpRdma => "tcp,rdma",
        }
    }

    /// Parses `tcp`, `rdma` or `tcp,rdma`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Some(TransportType::Tcp),
            "rdma" => Some(TransportType::Rdma),
            "tcp,rdma" | "rdma,tcp" => Some(TransportType::TcpRdma),
            _ => None,
        }
    }
}

/// Lifecycle status of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeStatus {
    /// Defined but never started
    Created,
    /// Bricks are serving
    Started,
    /// Bricks were stopped
    Stopped,
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolumeStatus::Created => "Created",
            VolumeStatus::Started => "Started",
            VolumeStatus::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// A single storage directory on a host contributing to a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrickInfo {
    /// Host serving the brick
    pub hostname: String,
    /// Absolute export directory
    pub path: String,
    /// Port of the brick daemon once it is listening
    #[serde(default)]
    pub port: Option<u16>,
    /// Whether the brick daemon is running
    #[serde(default)]
    pub started: bool,
}

impl BrickInfo {
    /// Creates a stopped brick
    pub fn new(hostname: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            path: path.into(),
            port: None,
            started: false,
        }
    }

    /// Parses `host:/path`
    pub fn parse(spec: &str) -> Result<Self> {
        let (host, path) = spec
            .split_once(':')
            .ok_or_else(|| VolgenError::Inconsistent(format!("brick {} is not of the form host:path", spec)))?;
        if host.is_empty() || path.is_empty() {
            return Err(VolgenError::Inconsistent(format!(
                "brick {} is not of the form host:path",
                spec
            )));
        }
        Ok(Self::new(host, path))
    }

    /// `host:path` identifier
    pub fn id(&self) -> String {
        format!("{}:{}", self.hostname, self.path)
    }
}

impl fmt::Display for BrickInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.path)
    }
}

/// State of an in-progress brick replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplaceBrickStatus {
    /// Data is being pumped to the destination
    Started,
    /// Migration is paused
    Paused,
}

/// Source and destination of a brick replacement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceBrickSession {
    /// Brick being replaced
    pub src: BrickInfo,
    /// Brick taking over
    pub dst: BrickInfo,
    /// Migration state
    pub status: ReplaceBrickStatus,
}

/// Full definition of a volume as known to the management plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    /// Volume name
    pub name: String,
    /// Cluster-unique identifier
    pub id: Uuid,
    /// Grouping of bricks
    pub cluster: ClusterType,
    /// Bricks per replica/stripe group, zero for plain distribute
    pub sub_count: usize,
    /// Client transport
    pub transport: TransportType,
    /// Lifecycle status
    pub status: VolumeStatus,
    /// Bricks in graph order
    pub bricks: Vec<BrickInfo>,
    /// Reconfigured options
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Geo-replication slaves, `slaveN` to `host-uuid:slave-url`
    #[serde(default)]
    pub gsync_slaves: BTreeMap<String, String>,
    /// Pending brick replacement
    #[serde(default)]
    pub replace_brick: Option<ReplaceBrickSession>,
    /// Monotonic definition version
    #[serde(default)]
    pub version: u64,
}

impl VolumeInfo {
    /// Creates a volume in the `Created` state with no options
    pub fn new(
        name: impl Into<String>,
        id: Uuid,
        cluster: ClusterType,
        sub_count: usize,
        transport: TransportType,
        bricks: Vec<BrickInfo>,
    ) -> Self {
        Self {
            name: name.into(),
            id,
            cluster,
            sub_count,
            transport,
            status: VolumeStatus::Created,
            bricks,
            options: BTreeMap::new(),
            gsync_slaves: BTreeMap::new(),
            replace_brick: None,
            version: 1,
        }
    }

    /// Number of bricks
    pub fn brick_count(&self) -> usize {
        self.bricks.len()
    }

    /// Number of sub-volumes under distribute
    pub fn dist_count(&self) -> usize {
        if self.sub_count > 0 {
            self.brick_count() / self.sub_count
        } else {
            self.brick_count()
        }
    }

    /// Derived user-visible type
    pub fn volume_type(&self) -> VolumeType {
        let distributed = self.sub_count > 0 && self.sub_count < self.brick_count();
        match (self.cluster, distributed) {
            (ClusterType::None, _) => VolumeType::Distribute,
            (ClusterType::Stripe, false) => VolumeType::Stripe,
            (ClusterType::Stripe, true) => VolumeType::DistributedStripe,
            (ClusterType::Replicate, false) => VolumeType::Replicate,
            (ClusterType::Replicate, true) => VolumeType::DistributedReplicate,
        }
    }

    /// Looks up a brick by `host:path`
    pub fn find_brick(&self, id: &str) -> Option<(usize, &BrickInfo)> {
        self.bricks.iter().enumerate().find(|(_, b)| b.id() == id)
    }

    /// Whether any geo-replication session is registered
    pub fn has_gsync_sessions(&self) -> bool {
        !self.gsync_slaves.is_empty()
    }

    /// Registered slave urls, without the owning host prefix
    pub fn gsync_slave_urls(&self) -> Vec<(Uuid, String)> {
        self.gsync_slaves
            .values()
            .filter_map(|entry| {
                let (host, url) = entry.split_once(':')?;
                Some((Uuid::parse_str(host).ok()?, url.to_string()))
            })
            .collect()
    }

    /// Bumps the version after a committed change
    pub fn touch(&mut self) {
        self.version += 1;
    }
}
