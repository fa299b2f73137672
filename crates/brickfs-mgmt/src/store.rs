//! Persisted volume, peer and volfile state.

use brickfs_volgen::VolumeInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{MgmtError, Result};
use crate::peer::PeerRecord;

/// Load/save primitives for everything a node persists
pub trait VolumeStore: Send + Sync {
    fn load_volumes(&self) -> Result<Vec<VolumeInfo>>;
    fn save_volume(&self, vol: &VolumeInfo) -> Result<()>;
    /// Removes the volume record and every volfile below its directory
    fn delete_volume(&self, name: &str) -> Result<()>;

    fn load_peers(&self) -> Result<Vec<PeerRecord>>;
    fn save_peer(&self, peer: &PeerRecord) -> Result<()>;
    fn delete_peer(&self, uuid: Uuid) -> Result<()>;

    /// `path` is relative to the working directory
    fn write_volfile(&self, path: &str, contents: &str) -> Result<()>;
    fn remove_volfile(&self, path: &str) -> Result<()>;
    fn read_volfile(&self, path: &str) -> Result<Option<String>>;

    /// This node's identity, created on first use
    fn node_uuid(&self) -> Result<Uuid>;
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeInfo {
    uuid: Uuid,
}

/// JSON files below a working directory
#[derive(Debug, Clone)]
pub struct FileStore {
    workdir: PathBuf,
}

impl FileStore {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self { workdir: workdir.into() }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn vols_dir(&self) -> PathBuf {
        self.workdir.join("vols")
    }

    fn peers_dir(&self) -> PathBuf {
        self.workdir.join("peers")
    }

    fn info_path(&self, name: &str) -> PathBuf {
        self.vols_dir().join(name).join("info.json")
    }

    fn relative(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        if rel.is_absolute() || rel.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(MgmtError::Store(format!("volfile path {} escapes the working directory", path)));
        }
        Ok(self.workdir.join(rel))
    }

    /// Writes through a temporary file and a rename
    fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "persisted");
        Ok(())
    }

    fn read_json_dir<T: for<'de> Deserialize<'de>>(dir: &Path, file_name: Option<&str>) -> Result<Vec<T>> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| match file_name {
                Some(name) => e.path().join(name),
                None => e.path(),
            })
            .filter(|p| p.is_file() && p.extension().and_then(|x| x.to_str()) == Some("json"))
            .collect();
        paths.sort();
        for path in paths {
            let data = fs::read_to_string(&path)?;
            out.push(serde_json::from_str(&data)?);
        }
        Ok(out)
    }
}

impl VolumeStore for FileStore {
    fn load_volumes(&self) -> Result<Vec<VolumeInfo>> {
        Self::read_json_dir(&self.vols_dir(), Some("info.json"))
    }

    fn save_volume(&self, vol: &VolumeInfo) -> Result<()> {
        let data = serde_json::to_vec_pretty(vol)?;
        Self::write_atomic(&self.info_path(&vol.name), &data)
    }

    fn delete_volume(&self, name: &str) -> Result<()> {
        let dir = self.vols_dir().join(name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load_peers(&self) -> Result<Vec<PeerRecord>> {
        Self::read_json_dir(&self.peers_dir(), None)
    }

    fn save_peer(&self, peer: &PeerRecord) -> Result<()> {
        let data = serde_json::to_vec_pretty(peer)?;
        Self::write_atomic(&self.peers_dir().join(format!("{}.json", peer.uuid)), &data)
    }

    fn delete_peer(&self, uuid: Uuid) -> Result<()> {
        match fs::remove_file(self.peers_dir().join(format!("{}.json", uuid))) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_volfile(&self, path: &str, contents: &str) -> Result<()> {
        Self::write_atomic(&self.relative(path)?, contents.as_bytes())
    }

    fn remove_volfile(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.relative(path)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn read_volfile(&self, path: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.relative(path)?) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn node_uuid(&self) -> Result<Uuid> {
        let path = self.workdir.join("node.json");
        match fs::read_to_string(&path) {
            Ok(data) => {
                let info: NodeInfo = serde_json::from_str(&data)?;
                Ok(info.uuid)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let info = NodeInfo { uuid: Uuid::new_v4() };
                Self::write_atomic(&path, &serde_json::to_vec_pretty(&info)?)?;
                Ok(info.uuid)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    volumes: BTreeMap<String, VolumeInfo>,
    peers: BTreeMap<Uuid, PeerRecord>,
    volfiles: BTreeMap<String, String>,
    uuid: Option<Uuid>,
}

/// In-memory store; writes can be made to fail
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_uuid(uuid: Uuid) -> Self {
        let store = Self::default();
        store.lock().uuid = Some(uuid);
        store
    }

    /// Makes every subsequent write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn volfile_paths(&self) -> Vec<String> {
        self.lock().volfiles.keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MgmtError::Store("store is read-only".into()));
        }
        Ok(())
    }
}

impl VolumeStore for MemoryStore {
    fn load_volumes(&self) -> Result<Vec<VolumeInfo>> {
        Ok(self.lock().volumes.values().cloned().collect())
    }

    fn save_volume(&self, vol: &VolumeInfo) -> Result<()> {
        self.check_writable()?;
        self.lock().volumes.insert(vol.name.clone(), vol.clone());
        Ok(())
    }

    fn delete_volume(&self, name: &str) -> Result<()> {
        self.check_writable()?;
        let mut state = self.lock();
        state.volumes.remove(name);
        let prefix = format!("vols/{}/", name);
        state.volfiles.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    fn load_peers(&self) -> Result<Vec<PeerRecord>> {
        Ok(self.lock().peers.values().cloned().collect())
    }

    fn save_peer(&self, peer: &PeerRecord) -> Result<()> {
        self.check_writable()?;
        self.lock().peers.insert(peer.uuid, peer.clone());
        Ok(())
    }

    fn delete_peer(&self, uuid: Uuid) -> Result<()> {
        self.check_writable()?;
        self.lock().peers.remove(&uuid);
        Ok(())
    }

    fn write_volfile(&self, path: &str, contents: &str) -> Result<()> {
        self.check_writable()?;
        self.lock().volfiles.insert(path.to_string(), contents.to_string());
        Ok(())
    }

    fn remove_volfile(&self, path: &str) -> Result<()> {
        self.check_writable()?;
        self.lock().volfiles.remove(path);
        Ok(())
    }

    fn read_volfile(&self, path: &str) -> Result<Option<String>> {
        Ok(self.lock().volfiles.get(path).cloned())
    }

    fn node_uuid(&self) -> Result<Uuid> {
        let mut state = self.lock();
        Ok(*state.uuid.get_or_insert_with(Uuid::new_v4))
    }
}
