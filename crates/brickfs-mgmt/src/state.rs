//! Everything one management daemon knows about the cluster.

use brickfs_volgen::{BrickInfo, VolgenEngine, VolumeInfo};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{MgmtError, Result};
use crate::friend_sm::{transition, FriendAction, FriendEvent, FriendState, FsmLog, ProbeRejection};
use crate::op_lock::OpLockTable;
use crate::peer::{Peer, PeerRegistry};
use crate::services::ServiceSupervisor;
use crate::store::VolumeStore;

/// First port handed out to brick daemons
pub const BRICK_BASE_PORT: u16 = 24009;

/// Identity this node announces to its peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNode {
    pub uuid: Uuid,
    pub hostname: String,
    pub port: u16,
}

pub struct ClusterState {
    pub local: LocalNode,
    pub peers: PeerRegistry,
    pub op_lock: OpLockTable,
    pub volgen: VolgenEngine,
    pub store: Arc<dyn VolumeStore>,
    pub services: Arc<dyn ServiceSupervisor>,
    pub fsm_log: FsmLog,
    volumes: RwLock<BTreeMap<String, VolumeInfo>>,
}

impl ClusterState {
    /// Loads the node identity, peers and volumes from `store`
    pub fn new(
        hostname: impl Into<String>,
        port: u16,
        workdir: impl Into<PathBuf>,
        store: Arc<dyn VolumeStore>,
        services: Arc<dyn ServiceSupervisor>,
    ) -> Result<Self> {
        let local = LocalNode {
            uuid: store.node_uuid()?,
            hostname: hostname.into(),
            port,
        };
        let peers = PeerRegistry::new();
        for record in store.load_peers()? {
            debug!(peer = %record.hostname, uuid = %record.uuid, "restoring peer");
            peers.insert(Peer::from(record))?;
        }
        let volumes = store
            .load_volumes()?
            .into_iter()
            .map(|v| (v.name.clone(), v))
            .collect::<BTreeMap<_, _>>();
        info!(uuid = %local.uuid, peers = peers.len(), volumes = volumes.len(), "cluster state loaded");
        Ok(Self {
            local,
            peers,
            op_lock: OpLockTable::new(),
            volgen: VolgenEngine::new(workdir),
            store,
            services,
            fsm_log: FsmLog::default(),
            volumes: RwLock::new(volumes),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.local.uuid
    }

    pub fn is_local_host(&self, host: &str) -> bool {
        host == self.local.hostname || host == "localhost" || host == "127.0.0.1"
    }

    pub fn is_local_brick(&self, brick: &BrickInfo) -> bool {
        self.is_local_host(&brick.hostname)
    }

    /// Local host or a peer that completed the handshake
    pub fn is_known_host(&self, host: &str) -> bool {
        self.is_local_host(host)
            || self
                .peers
                .find(host)
                .map(|p| p.state == FriendState::Connected)
                .unwrap_or(false)
    }

    pub fn volume(&self, name: &str) -> Option<VolumeInfo> {
        self.volumes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn volumes(&self) -> Vec<VolumeInfo> {
        self.volumes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn require_volume(&self, name: &str) -> Result<VolumeInfo> {
        self.volume(name)
            .ok_or_else(|| MgmtError::Validation(format!("Volume {} does not exist", name)))
    }

    /// Regenerates the volume's volfiles, then persists and publishes it
    pub fn store_volume(&self, vol: VolumeInfo) -> Result<()> {
        for volfile in self.volgen.generate_volume_volfiles(&vol)? {
            self.store.write_volfile(&volfile.path, &volfile.contents())?;
        }
        self.store.save_volume(&vol)?;
        debug!(volume = %vol.name, version = vol.version, "volume stored");
        self.volumes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(vol.name.clone(), vol);
        self.regenerate_nfs()
    }

    pub fn remove_volume(&self, name: &str) -> Result<()> {
        self.store.delete_volume(name)?;
        self.volumes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        self.regenerate_nfs()
    }

    pub fn regenerate_nfs(&self) -> Result<()> {
        let volfile = self.volgen.generate_nfs_volfile(&self.volumes())?;
        self.store.write_volfile(&volfile.path, &volfile.contents())
    }

    /// Volume defined on which host uses `brick`, if any
    pub fn brick_owner(&self, brick: &BrickInfo) -> Option<String> {
        let id = brick.id();
        self.volumes()
            .into_iter()
            .find(|v| v.find_brick(&id).is_some())
            .map(|v| v.name)
    }

    /// Next free port for a brick daemon on this node
    pub fn next_brick_port(&self) -> u16 {
        self.volumes()
            .iter()
            .flat_map(|v| v.bricks.iter())
            .filter(|b| self.is_local_brick(b))
            .filter_map(|b| b.port)
            .max()
            .map(|p| p + 1)
            .unwrap_or(BRICK_BASE_PORT)
    }

    /// Whether a remote volume set may be merged into ours
    pub fn check_import(&self, remote: &[VolumeInfo]) -> Option<ProbeRejection> {
        let volumes = self.volumes.read().unwrap_or_else(|e| e.into_inner());
        remote
            .iter()
            .any(|r| volumes.get(&r.name).map(|l| l.id != r.id).unwrap_or(false))
            .then_some(ProbeRejection::VolumeConflict)
    }

    /// Adopts remote volumes that are new or newer than ours
    pub fn import_volumes(&self, remote: Vec<VolumeInfo>) -> Result<usize> {
        if let Some(rejection) = self.check_import(&remote) {
            return Err(MgmtError::Conflict(rejection.message(&self.local.hostname)));
        }
        let mut imported = 0;
        for mut vol in remote {
            let current = self.volume(&vol.name);
            if let Some(current) = &current {
                if current.version >= vol.version {
                    continue;
                }
                // brick ports are only meaningful on the host running the brick
                for brick in vol.bricks.iter_mut().filter(|b| self.is_local_host(&b.hostname)) {
                    brick.port = current
                        .find_brick(&brick.id())
                        .and_then(|(_, b)| b.port);
                }
            }
            info!(volume = %vol.name, version = vol.version, "importing volume");
            self.store_volume(vol)?;
            imported += 1;
        }
        Ok(imported)
    }

    /// Persists a peer once its uuid is known
    pub fn persist_peer(&self, peer: &Peer) -> Result<()> {
        match peer.record() {
            Some(record) => self.store.save_peer(&record),
            None => Ok(()),
        }
    }

    /// Runs `event` through the friend state machine of the peer `hostname`.
    ///
    /// The read of the current state, the persisted write of the new one and
    /// the log entry all happen under the peer registry's write lock.
    pub fn apply_friend_event(&self, hostname: &str, event: FriendEvent) -> Result<Vec<FriendAction>> {
        self.peers.transition(hostname, |peer| {
            let current = peer.state;
            let t = transition(current, &event)?;
            let mut next = peer.clone();
            next.state = t.next;
            self.persist_peer(&next)?;
            peer.state = t.next;
            self.fsm_log.record(hostname, current, &event, t.next);
            debug!(peer = %hostname, old = ?current, event = %event, new = ?t.next, "friend state change");
            Ok(t.actions)
        })
    }

    /// Drops a peer from memory and from the store
    pub fn forget_peer(&self, hostname: &str) -> Result<Option<Peer>> {
        let removed = self.peers.remove_host(hostname);
        if let Some(uuid) = removed.as_ref().and_then(|p| p.uuid) {
            self.store.delete_peer(uuid)?;
            info!(peer = %hostname, %uuid, "peer removed");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::InMemorySupervisor;
    use crate::store::MemoryStore;
    use brickfs_volgen::{ClusterType, TransportType, VolumeStatus};

    fn state() -> (ClusterState, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let state = ClusterState::new(
            "node1",
            24007,
            "/var/lib/brickfs",
            store.clone(),
            Arc::new(InMemorySupervisor::new()),
        )
        .unwrap();
        (state, store)
    }

    fn volume(name: &str) -> VolumeInfo {
        VolumeInfo::new(
            name,
            Uuid::new_v4(),
            ClusterType::None,
            0,
            TransportType::Tcp,
            vec![BrickInfo::new("node1", format!("/export/{}", name))],
        )
    }

    #[test]
    fn test_store_volume_writes_volfiles() {
        let (state, store) = state();
        state.store_volume(volume("v0")).unwrap();
        let paths = store.volfile_paths();
        assert!(paths.contains(&"vols/v0/v0-fuse.vol".to_string()));
        assert!(paths.contains(&"nfs/nfs-server.vol".to_string()));
        assert!(state.volume("v0").is_some());

        state.remove_volume("v0").unwrap();
        assert!(state.volume("v0").is_none());
        assert!(!store.volfile_paths().iter().any(|p| p.starts_with("vols/v0/")));
    }

    #[test]
    fn test_require_volume_message() {
        let (state, _) = state();
        let err = state.require_volume("nope").unwrap_err();
        assert_eq!(err.to_string(), "Volume nope does not exist");
    }

    #[test]
    fn test_import_conflict_and_versions() {
        let (state, _) = state();
        let local = volume("v0");
        state.store_volume(local.clone()).unwrap();

        let mut clash = volume("v0");
        clash.id = Uuid::new_v4();
        assert_eq!(state.check_import(&[clash.clone()]), Some(ProbeRejection::VolumeConflict));
        assert!(state.import_volumes(vec![clash]).is_err());

        let mut older = local.clone();
        older.status = VolumeStatus::Started;
        older.version = 0;
        assert_eq!(state.import_volumes(vec![older]).unwrap(), 0);
        assert_eq!(state.volume("v0").unwrap().status, VolumeStatus::Created);

        let mut newer = local;
        newer.status = VolumeStatus::Started;
        newer.version = 5;
        assert_eq!(state.import_volumes(vec![newer, volume("v1")]).unwrap(), 2);
        assert_eq!(state.volume("v0").unwrap().status, VolumeStatus::Started);
        assert!(state.volume("v1").is_some());
    }

    #[test]
    fn test_next_brick_port() {
        let (state, _) = state();
        assert_eq!(state.next_brick_port(), BRICK_BASE_PORT);
        let mut v = volume("v0");
        v.bricks[0].port = Some(24010);
        state.store_volume(v).unwrap();
        assert_eq!(state.next_brick_port(), 24011);
    }

    #[test]
    fn test_known_hosts() {
        let (state, _) = state();
        assert!(state.is_known_host("localhost"));
        assert!(state.is_known_host("node1"));
        assert!(!state.is_known_host("node2"));
        let mut peer = Peer::new("node2", 24007);
        peer.state = FriendState::Connected;
        state.peers.insert(peer).unwrap();
        assert!(state.is_known_host("node2"));
    }

    #[test]
    fn test_friend_events_are_logged_and_persisted() {
        let (state, store) = state();
        let mut peer = Peer::new("node2", 24007);
        peer.uuid = Some(Uuid::new_v4());
        state.peers.insert(peer).unwrap();

        let actions = state
            .apply_friend_event("node2", FriendEvent::ProbeReceived(crate::friend_sm::ProbeOutcome::Inbound))
            .unwrap();
        assert_eq!(actions, vec![FriendAction::ReplyAccept]);
        assert_eq!(state.peers.find("node2").unwrap().state, FriendState::ProbeReceived);
        assert_eq!(store.load_peers().unwrap()[0].state, FriendState::ProbeReceived);
        assert_eq!(state.fsm_log.entries()[0].event, "RCVD_PROBE");

        assert!(state.apply_friend_event("node2", FriendEvent::FriendAddAccepted).is_err());
        assert!(state.forget_peer("node2").unwrap().is_some());
        assert!(store.load_peers().unwrap().is_empty());
    }

    #[test]
    fn test_friend_event_for_missing_peer_fails() {
        let (state, _) = state();
        let err = state
            .apply_friend_event("node9", FriendEvent::TransportLost)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::State);
        assert!(state.fsm_log.entries().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_friend_events_chain() {
        let (state, _) = state();
        let state = Arc::new(state);
        let mut peer = Peer::new("node2", 24007);
        peer.uuid = Some(Uuid::new_v4());
        state.peers.insert(peer).unwrap();

        let events = [
            FriendEvent::TransportLost,
            FriendEvent::ProbeReceived(crate::friend_sm::ProbeOutcome::Inbound),
            FriendEvent::FriendRemoveReceived,
        ];
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let state = state.clone();
                tokio::spawn(async move {
                    for j in 0..5 {
                        let _ = state.apply_friend_event("node2", events[(i + j) % events.len()]);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        // every logged transition starts where the previous one ended
        let log = state.fsm_log.entries();
        assert!(!log.is_empty());
        for pair in log.windows(2) {
            assert_eq!(pair[1].old_state, pair[0].new_state);
        }
        let last = log.last().unwrap();
        assert_eq!(state.peers.find("node2").unwrap().state, last.new_state);
    }
}
