//! In-process cluster: daemons wired together through a fake network.

#![allow(dead_code)]

use async_trait::async_trait;
use brickfs_mgmt::op_ctx::{OpReply, OpRequest, ResponseDict};
use brickfs_mgmt::services::InMemorySupervisor;
use brickfs_mgmt::state::ClusterState;
use brickfs_mgmt::store::MemoryStore;
use brickfs_mgmt::transport::{
    BrickRequest, BrickResponse, BrickTransport, PeerRequest, PeerResponse, PeerTransport, TransportError,
};
use brickfs_mgmt::MgmtDaemon;
use brickfs_volgen::{BrickInfo, ClusterType, TransportType};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

pub const FRAME_TIMEOUT: Duration = Duration::from_millis(300);

/// Misbehaviour injected on a host, optionally only for one request type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Unreachable,
    Timeout,
    Decode,
    Reject(String),
}

#[derive(Default)]
pub struct Network {
    nodes: RwLock<HashMap<String, Arc<MgmtDaemon>>>,
    faults: Mutex<HashMap<(String, String), Fault>>,
    sent: Mutex<Vec<(String, String)>>,
}

impl Network {
    pub fn attach(&self, hostname: &str, daemon: Arc<MgmtDaemon>) {
        self.nodes.write().unwrap().insert(hostname.to_string(), daemon);
    }

    pub fn detach(&self, hostname: &str) {
        self.nodes.write().unwrap().remove(hostname);
    }

    /// `request` is a request name such as `stage-op`, or `*` for all
    pub fn inject(&self, hostname: &str, request: &str, fault: Fault) {
        self.faults
            .lock()
            .unwrap()
            .insert((hostname.to_string(), request.to_string()), fault);
    }

    pub fn heal(&self, hostname: &str) {
        self.faults.lock().unwrap().retain(|(h, _), _| h != hostname);
    }

    /// Requests delivered to `hostname`, by name
    pub fn sent_to(&self, hostname: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h == hostname)
            .map(|(_, r)| r.clone())
            .collect()
    }

    fn fault(&self, hostname: &str, request: &str) -> Option<Fault> {
        let faults = self.faults.lock().unwrap();
        faults
            .get(&(hostname.to_string(), request.to_string()))
            .or_else(|| faults.get(&(hostname.to_string(), "*".to_string())))
            .cloned()
    }
}

#[async_trait]
impl PeerTransport for Network {
    async fn send(&self, hostname: &str, port: u16, request: PeerRequest) -> Result<PeerResponse, TransportError> {
        let addr = format!("{}:{}", hostname, port);
        match self.fault(hostname, request.name()) {
            Some(Fault::Unreachable) => {
                return Err(TransportError::Unreachable {
                    addr,
                    reason: "connection refused".into(),
                })
            }
            Some(Fault::Timeout) => {
                tokio::time::sleep(FRAME_TIMEOUT * 10).await;
            }
            Some(Fault::Decode) => {
                return Err(TransportError::Decode {
                    addr,
                    reason: "truncated frame".into(),
                })
            }
            Some(Fault::Reject(reason)) => {
                return Ok(PeerResponse::reject(uuid::Uuid::nil(), hostname, 22, reason));
            }
            None => {}
        }
        let daemon = self.nodes.read().unwrap().get(hostname).cloned();
        let Some(daemon) = daemon else {
            return Err(TransportError::Unreachable {
                addr,
                reason: "no route to host".into(),
            });
        };
        self.sent
            .lock()
            .unwrap()
            .push((hostname.to_string(), request.name().to_string()));
        Ok(daemon.handle_peer_request(request).await)
    }
}

/// Brick daemons that record what they were asked to do
#[derive(Default)]
pub struct Bricks {
    calls: Mutex<Vec<(String, BrickRequest)>>,
    failing: Mutex<Vec<String>>,
}

impl Bricks {
    pub fn calls(&self) -> Vec<(String, BrickRequest)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail(&self, brick: &str) {
        self.failing.lock().unwrap().push(brick.to_string());
    }
}

#[async_trait]
impl BrickTransport for Bricks {
    async fn send(&self, brick: &BrickInfo, request: BrickRequest) -> Result<BrickResponse, TransportError> {
        self.calls.lock().unwrap().push((brick.id(), request));
        if self.failing.lock().unwrap().contains(&brick.id()) {
            return Ok(BrickResponse {
                op_ret: -1,
                op_errstr: Some(format!("brick {} is wedged", brick.id())),
                payload: ResponseDict::new(),
            });
        }
        let mut payload = ResponseDict::new();
        if request == BrickRequest::ProfileInfo {
            payload.insert("read-count".into(), "7".into());
        }
        Ok(BrickResponse {
            op_ret: 0,
            op_errstr: None,
            payload,
        })
    }

    async fn disconnect(&self, _brick: &BrickInfo) {}
}

pub struct Node {
    pub daemon: Arc<MgmtDaemon>,
    pub store: Arc<MemoryStore>,
    pub services: Arc<InMemorySupervisor>,
}

impl Node {
    pub fn state(&self) -> &Arc<ClusterState> {
        self.daemon.state()
    }

    pub async fn submit(&self, request: OpRequest) -> OpReply {
        self.daemon.submit(request).await
    }
}

pub struct Cluster {
    pub net: Arc<Network>,
    pub bricks: Arc<Bricks>,
    pub nodes: Vec<Node>,
}

impl Cluster {
    /// `n` daemons named `node1..n` that do not know each other yet
    pub fn standalone(n: usize) -> Self {
        let net = Arc::new(Network::default());
        let bricks = Arc::new(Bricks::default());
        let nodes = (1..=n)
            .map(|i| {
                let hostname = format!("node{}", i);
                let store = Arc::new(MemoryStore::new());
                let services = Arc::new(InMemorySupervisor::new());
                let state = ClusterState::new(
                    hostname.clone(),
                    24007,
                    "/var/lib/brickfs",
                    store.clone(),
                    services.clone(),
                )
                .unwrap();
                let daemon = Arc::new(MgmtDaemon::new(
                    Arc::new(state),
                    net.clone(),
                    bricks.clone(),
                    FRAME_TIMEOUT,
                    Duration::ZERO,
                ));
                net.attach(&hostname, daemon.clone());
                Node { daemon, store, services }
            })
            .collect();
        Self { net, bricks, nodes }
    }

    /// `n` daemons with node1 having probed every other node
    pub async fn formed(n: usize) -> Self {
        let cluster = Self::standalone(n);
        for i in 2..=n {
            let reply = cluster.node(1).daemon.probe(&format!("node{}", i), 24007).await;
            assert!(reply.is_success(), "probe node{} failed: {:?}", i, reply);
        }
        cluster
    }

    /// 1-based, matching the hostnames
    pub fn node(&self, i: usize) -> &Node {
        &self.nodes[i - 1]
    }
}

pub fn create_volume(name: &str, cluster: ClusterType, sub_count: usize, bricks: &[&str]) -> OpRequest {
    OpRequest::CreateVolume {
        name: name.into(),
        volume_id: None,
        cluster,
        sub_count,
        transport: TransportType::Tcp,
        bricks: bricks.iter().map(|b| b.to_string()).collect(),
    }
}

pub fn assert_ok(reply: &OpReply) {
    assert!(reply.is_success(), "operation failed: {:?}", reply);
}
