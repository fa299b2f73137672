use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MgmtConfig {
    pub bind_addr: SocketAddr,
    /// Name this node announces to peers; must resolve from every peer
    pub hostname: String,
    /// Port peers reach this node on
    pub port: u16,
    pub workdir: PathBuf,
    pub admin_token: Option<String>,
    pub frame_timeout_secs: u64,
    pub brick_disconnect_grace_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub log_level: String,
}

impl Default for MgmtConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 24007)),
            hostname: String::from("localhost"),
            port: 24007,
            workdir: PathBuf::from("/var/lib/brickfs"),
            admin_token: None,
            frame_timeout_secs: 600,
            brick_disconnect_grace_secs: 5,
            heartbeat_interval_secs: 3,
            log_level: String::from("info"),
        }
    }
}

impl MgmtConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: MgmtConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: MgmtConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_secs(self.frame_timeout_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.brick_disconnect_grace_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}
