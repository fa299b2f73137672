//! Known peers and their connection state.
//!
//! Peers are keyed by the hostname they were probed or announced with.
//! A peer discovered by hostname has no uuid until its probe reply comes
//! back; uuids are unique once assigned.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::{MgmtError, Result};
use crate::friend_sm::FriendState;

/// This node's view of one remote management daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub uuid: Option<Uuid>,
    pub hostname: String,
    pub port: u16,
    pub state: FriendState,
    /// Whether the transport to the peer is currently up
    pub connected: bool,
}

impl Peer {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            uuid: None,
            hostname: hostname.into(),
            port,
            state: FriendState::Unknown,
            connected: false,
        }
    }

    /// Persisted form, only available once the uuid is known
    pub fn record(&self) -> Option<PeerRecord> {
        Some(PeerRecord {
            uuid: self.uuid?,
            hostname: self.hostname.clone(),
            port: self.port,
            state: self.state,
        })
    }
}

/// Persisted and announced form of a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub uuid: Uuid,
    pub hostname: String,
    pub port: u16,
    pub state: FriendState,
}

impl From<PeerRecord> for Peer {
    fn from(r: PeerRecord) -> Self {
        Self {
            uuid: Some(r.uuid),
            hostname: r.hostname,
            port: r.port,
            state: r.state,
            connected: r.state == FriendState::Connected,
        }
    }
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<BTreeMap<String, Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Peer>> {
        self.peers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Peer>> {
        self.peers.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Finds a peer by uuid string or hostname; uuids win
    pub fn find(&self, key: &str) -> Option<Peer> {
        if let Ok(uuid) = Uuid::parse_str(key) {
            if let Some(peer) = self.find_by_uuid(uuid) {
                return Some(peer);
            }
        }
        self.read().get(key).cloned()
    }

    pub fn find_by_uuid(&self, uuid: Uuid) -> Option<Peer> {
        self.read().values().find(|p| p.uuid == Some(uuid)).cloned()
    }

    pub fn insert(&self, peer: Peer) -> Result<()> {
        let mut peers = self.write();
        if peers.contains_key(&peer.hostname) {
            return Err(MgmtError::Conflict(format!(
                "Probe on host {} port {} already in peer list",
                peer.hostname, peer.port
            )));
        }
        if let Some(uuid) = peer.uuid {
            if peers.values().any(|p| p.uuid == Some(uuid)) {
                return Err(MgmtError::Conflict(format!("peer {} already in peer list", uuid)));
            }
        }
        peers.insert(peer.hostname.clone(), peer);
        Ok(())
    }

    /// Assigns the uuid learned from a probe reply
    pub fn assign_uuid(&self, hostname: &str, uuid: Uuid) -> Result<()> {
        let mut peers = self.write();
        if peers
            .values()
            .any(|p| p.uuid == Some(uuid) && p.hostname != hostname)
        {
            return Err(MgmtError::Conflict(format!("peer {} already in peer list", uuid)));
        }
        let peer = peers
            .get_mut(hostname)
            .ok_or_else(|| MgmtError::State(format!("{} is not a known peer", hostname)))?;
        peer.uuid = Some(uuid);
        Ok(())
    }

    /// Applies `f` to the peer named `hostname`
    pub fn update<F>(&self, hostname: &str, f: F) -> Result<Peer>
    where
        F: FnOnce(&mut Peer),
    {
        let mut peers = self.write();
        let peer = peers
            .get_mut(hostname)
            .ok_or_else(|| MgmtError::State(format!("{} is not a known peer", hostname)))?;
        f(peer);
        Ok(peer.clone())
    }

    /// Runs `f` on the peer named `hostname` with the registry write-locked,
    /// so no other change to any peer can interleave with it
    pub fn transition<T, F>(&self, hostname: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Peer) -> Result<T>,
    {
        let mut peers = self.write();
        let peer = peers
            .get_mut(hostname)
            .ok_or_else(|| MgmtError::State(format!("{} is not a known peer", hostname)))?;
        f(peer)
    }

    pub fn remove(&self, uuid: Uuid) -> Option<Peer> {
        let mut peers = self.write();
        let hostname = peers.values().find(|p| p.uuid == Some(uuid))?.hostname.clone();
        peers.remove(&hostname)
    }

    pub fn remove_host(&self, hostname: &str) -> Option<Peer> {
        self.write().remove(hostname)
    }

    pub fn list(&self) -> Vec<Peer> {
        self.read().values().cloned().collect()
    }

    /// Peers that completed the handshake
    pub fn befriended(&self) -> Vec<Peer> {
        self.read()
            .values()
            .filter(|p| p.state == FriendState::Connected)
            .cloned()
            .collect()
    }

    pub fn records(&self) -> Vec<PeerRecord> {
        self.read().values().filter_map(Peer::record).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
