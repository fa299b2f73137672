use crate::api::{DetachBody, OptionCheck, PeerView, ProbeBody};
use crate::friend_sm::FsmLogEntry;
use crate::op_ctx::{
    GsyncCommand, GsyncConfig, OpReply, OpRequest, ProfileCommand, QuotaCommand, RebalanceCommand,
    ReplaceBrickAction, ResponseDict,
};
use crate::services::RebalanceProgress;
use anyhow::Result;
use brickfs_volgen::{ClusterType, TransportType, VolumeInfo};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bfs-mgmt")]
#[command(about = "BrickFS management daemon and CLI", long_about = None)]
pub struct Cli {
    #[arg(short, long, default_value = "http://localhost:24007")]
    pub server: String,

    #[arg(short, long, env = "BFS_ADMIN_TOKEN")]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the management daemon
    Serve {
        #[arg(short, long, default_value = "/etc/brickfs/mgmt.toml")]
        config: PathBuf,
        #[arg(long)]
        bind: Option<SocketAddr>,
        #[arg(long)]
        hostname: Option<String>,
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
    Peer {
        #[command(subcommand)]
        cmd: PeerCmd,
    },
    Volume {
        #[command(subcommand)]
        cmd: VolumeCmd,
    },
    /// Recent peer state transitions of this node or of `peer`
    FsmLog {
        peer: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum PeerCmd {
    Probe {
        host: String,
        #[arg(short, long)]
        port: Option<u16>,
    },
    Detach {
        host: String,
        #[arg(long)]
        force: bool,
    },
    Status,
}

#[derive(Subcommand, Clone)]
pub enum VolumeCmd {
    Create {
        name: String,
        #[arg(long, conflicts_with = "stripe")]
        replica: Option<usize>,
        #[arg(long)]
        stripe: Option<usize>,
        #[arg(long, default_value = "tcp", value_parser = parse_transport)]
        transport: TransportType,
        #[arg(required = true)]
        bricks: Vec<String>,
    },
    Delete {
        name: String,
    },
    Start {
        name: String,
        #[arg(long)]
        force: bool,
    },
    Stop {
        name: String,
        #[arg(long)]
        force: bool,
    },
    Info {
        name: Option<String>,
    },
    AddBrick {
        name: String,
        #[arg(required = true)]
        bricks: Vec<String>,
    },
    RemoveBrick {
        name: String,
        #[arg(required = true)]
        bricks: Vec<String>,
    },
    ReplaceBrick {
        name: String,
        src: String,
        dst: String,
        #[arg(value_parser = kebab::<ReplaceBrickAction>)]
        action: ReplaceBrickAction,
    },
    /// Set options given as `KEY VALUE` pairs; `all` as name sets cluster-wide options
    Set {
        name: String,
        #[arg(required = true, num_args = 2.., value_names = ["KEY", "VALUE"])]
        pairs: Vec<String>,
        #[arg(long)]
        force: bool,
    },
    Reset {
        name: String,
        key: Option<String>,
        #[arg(long)]
        force: bool,
    },
    Rebalance {
        name: String,
        #[arg(value_parser = kebab::<RebalanceCommand>)]
        command: RebalanceCommand,
    },
    Profile {
        name: String,
        #[arg(value_parser = kebab::<ProfileCommand>)]
        command: ProfileCommand,
    },
    Quota {
        name: String,
        #[command(subcommand)]
        cmd: QuotaCmd,
    },
    GeoReplication {
        #[arg(long)]
        master: Option<String>,
        #[arg(long)]
        slave: Option<String>,
        #[command(subcommand)]
        cmd: GsyncCmd,
    },
    /// Pull volume definitions from `host`
    Sync {
        host: String,
        volume: Option<String>,
    },
    /// Check whether an option key exists
    OptionCheck {
        key: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum QuotaCmd {
    Enable,
    Disable,
    LimitUsage { path: String, limit: String },
    Remove { path: String },
    List { paths: Vec<String> },
}

#[derive(Subcommand, Clone)]
pub enum GsyncCmd {
    Start,
    Stop,
    Status,
    Config {
        name: Option<String>,
        value: Option<String>,
        #[arg(long, conflicts_with = "value")]
        del: bool,
    },
}

fn kebab<T: DeserializeOwned>(s: &str) -> std::result::Result<T, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(|_| format!("invalid value '{}'", s))
}

fn parse_transport(s: &str) -> std::result::Result<TransportType, String> {
    TransportType::parse(s).ok_or_else(|| format!("invalid transport '{}'", s))
}

impl QuotaCmd {
    fn to_command(&self) -> QuotaCommand {
        match self.clone() {
            QuotaCmd::Enable => QuotaCommand::Enable,
            QuotaCmd::Disable => QuotaCommand::Disable,
            QuotaCmd::LimitUsage { path, limit } => QuotaCommand::LimitUsage { path, limit },
            QuotaCmd::Remove { path } => QuotaCommand::Remove { path },
            QuotaCmd::List { paths } => QuotaCommand::List { paths },
        }
    }
}

impl GsyncCmd {
    fn to_command(&self) -> GsyncCommand {
        match self.clone() {
            GsyncCmd::Start => GsyncCommand::Start,
            GsyncCmd::Stop => GsyncCommand::Stop,
            GsyncCmd::Status => GsyncCommand::Status,
            GsyncCmd::Config { name, del: true, .. } => GsyncCommand::Config(GsyncConfig::Del { name }),
            GsyncCmd::Config { name: None, .. } => GsyncCommand::Config(GsyncConfig::GetAll),
            GsyncCmd::Config { name, value: None, .. } => GsyncCommand::Config(GsyncConfig::Get { name }),
            GsyncCmd::Config { name, value, .. } => GsyncCommand::Config(GsyncConfig::Set { name, value }),
        }
    }
}

impl VolumeCmd {
    /// The cluster operation this command submits, if it is one
    pub fn to_request(&self) -> Result<Option<OpRequest>> {
        let request = match self.clone() {
            VolumeCmd::Create {
                name,
                replica,
                stripe,
                transport,
                bricks,
            } => {
                let (cluster, sub_count) = match (replica, stripe) {
                    (Some(n), _) => (ClusterType::Replicate, n),
                    (None, Some(n)) => (ClusterType::Stripe, n),
                    (None, None) => (ClusterType::None, 0),
                };
                OpRequest::CreateVolume {
                    name,
                    volume_id: None,
                    cluster,
                    sub_count,
                    transport,
                    bricks,
                }
            }
            VolumeCmd::Delete { name } => OpRequest::DeleteVolume { name },
            VolumeCmd::Start { name, force } => OpRequest::StartVolume { name, force },
            VolumeCmd::Stop { name, force } => OpRequest::StopVolume { name, force },
            VolumeCmd::AddBrick { name, bricks } => OpRequest::AddBrick { name, bricks },
            VolumeCmd::RemoveBrick { name, bricks } => OpRequest::RemoveBrick { name, bricks },
            VolumeCmd::ReplaceBrick { name, src, dst, action } => OpRequest::ReplaceBrick { name, src, dst, action },
            VolumeCmd::Set { name, pairs, force } => {
                if pairs.len() % 2 != 0 {
                    anyhow::bail!("Options must be given as KEY VALUE pairs");
                }
                let options = pairs
                    .chunks(2)
                    .map(|kv| (kv[0].clone(), kv[1].clone()))
                    .collect();
                OpRequest::SetOption { name, options, force }
            }
            VolumeCmd::Reset { name, key, force } => OpRequest::ResetOption { name, key, force },
            VolumeCmd::Rebalance { name, command } => OpRequest::Rebalance { name, command },
            VolumeCmd::Profile { name, command } => OpRequest::Profile { name, command },
            VolumeCmd::Quota { name, cmd } => OpRequest::Quota {
                name,
                command: cmd.to_command(),
            },
            VolumeCmd::GeoReplication { master, slave, cmd } => OpRequest::GeoReplication {
                master,
                slave,
                command: cmd.to_command(),
            },
            VolumeCmd::Sync { host, volume } => OpRequest::Sync { hostname: host, volume },
            VolumeCmd::Info { .. } | VolumeCmd::OptionCheck { .. } => return Ok(None),
        };
        Ok(Some(request))
    }
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Serve { .. } => anyhow::bail!("serve is handled by the daemon entry point"),
            Command::Peer { ref cmd } => self.peer(cmd).await,
            Command::Volume { ref cmd } => self.volume(cmd).await,
            Command::FsmLog { ref peer } => self.fsm_log(peer.as_deref()).await,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let client = Client::new();
        let url = format!("{}{}", self.server, path);

        let mut request = client.get(&url);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("Request failed: {}", response.status());
        }
        Ok(response.json().await?)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let client = Client::new();
        let url = format!("{}{}", self.server, path);

        let mut request = client.post(&url).json(body);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("Request failed: {}", response.status());
        }
        Ok(response.json().await?)
    }

    async fn peer(&self, cmd: &PeerCmd) -> Result<()> {
        match cmd {
            PeerCmd::Probe { host, port } => {
                let body = ProbeBody {
                    host: host.clone(),
                    port: *port,
                };
                let reply = checked(self.post("/api/v1/peers/probe", &body).await?)?;
                match reply.response.get("output").map(String::as_str) {
                    Some("success") | None => println!("Probe successful"),
                    Some(message) => println!("{}", message),
                }
            }
            PeerCmd::Detach { host, force } => {
                let body = DetachBody {
                    host: host.clone(),
                    force: *force,
                };
                checked(self.post("/api/v1/peers/detach", &body).await?)?;
                println!("Detach successful");
            }
            PeerCmd::Status => {
                let peers: Vec<PeerView> = self.get("/api/v1/peers").await?;
                print!("{}", format_peer_status(&peers));
            }
        }
        Ok(())
    }

    async fn volume(&self, cmd: &VolumeCmd) -> Result<()> {
        match cmd {
            VolumeCmd::Info { name: Some(name) } => {
                let vol: VolumeInfo = self.get(&format!("/api/v1/volumes/{}", name)).await?;
                print!("{}", format_volume_info(&vol));
                return Ok(());
            }
            VolumeCmd::Info { name: None } => {
                let volumes: Vec<VolumeInfo> = self.get("/api/v1/volumes").await?;
                if volumes.is_empty() {
                    println!("No volumes present");
                }
                for vol in &volumes {
                    print!("{}", format_volume_info(vol));
                }
                return Ok(());
            }
            VolumeCmd::OptionCheck { key } => {
                let check: OptionCheck = self.get(&format!("/api/v1/options/check?key={}", key)).await?;
                match (check.exists, check.hint) {
                    (true, Some(full)) => println!("{} exists as {}", check.key, full),
                    (true, None) => println!("{} exists", check.key),
                    (false, Some(hint)) => anyhow::bail!("option {} does not exist\n{}", check.key, hint),
                    (false, None) => anyhow::bail!("option {} does not exist", check.key),
                }
                return Ok(());
            }
            _ => {}
        }
        let Some(request) = cmd.to_request()? else {
            return Ok(());
        };
        let reply = checked(self.post("/api/v1/ops", &request).await?)?;
        print!("{}", format_op_reply(&request, &reply.response));
        Ok(())
    }

    async fn fsm_log(&self, peer: Option<&str>) -> Result<()> {
        let path = match peer {
            Some(peer) => format!("/api/v1/fsm-log?peer={}", peer),
            None => "/api/v1/fsm-log".to_string(),
        };
        let entries: Vec<FsmLogEntry> = self.get(&path).await?;
        for (i, entry) in entries.iter().enumerate() {
            println!(
                "{}. {}: {} --({})--> {} [{}]",
                i + 1,
                entry.peer,
                entry.old_state,
                entry.event,
                entry.new_state,
                entry.timestamp.format("%Y-%m-%d %H:%M:%S")
            );
        }
        Ok(())
    }
}

/// Turns a failed operation into an error carrying its reason
fn checked(reply: OpReply) -> Result<OpReply> {
    if reply.is_success() {
        return Ok(reply);
    }
    match reply.op_errstr {
        Some(errstr) if !errstr.is_empty() => anyhow::bail!("{}", errstr),
        _ => anyhow::bail!("operation failed (errno {})", reply.op_errno),
    }
}

pub fn format_peer_status(peers: &[PeerView]) -> String {
    let mut out = format!("Number of Peers: {}\n", peers.len());
    for peer in peers {
        out.push_str(&format!(
            "\nHostname: {}\nUuid: {}\nState: {} ({})\n",
            peer.hostname,
            peer.uuid.as_deref().unwrap_or("-"),
            peer.state,
            if peer.connected { "Connected" } else { "Disconnected" }
        ));
    }
    out
}

pub fn format_volume_info(vol: &VolumeInfo) -> String {
    let total = vol.bricks.len();
    let count = if vol.sub_count > 1 && total > vol.sub_count {
        format!("{} x {} = {}", total / vol.sub_count, vol.sub_count, total)
    } else {
        total.to_string()
    };
    let mut out = format!(
        "\nVolume Name: {}\nType: {}\nVolume ID: {}\nStatus: {}\nNumber of Bricks: {}\nTransport-type: {}\n",
        vol.name,
        vol.volume_type(),
        vol.id,
        vol.status,
        count,
        vol.transport.as_str()
    );
    if !vol.bricks.is_empty() {
        out.push_str("Bricks:\n");
        for (i, brick) in vol.bricks.iter().enumerate() {
            out.push_str(&format!("Brick{}: {}\n", i + 1, brick));
        }
    }
    if !vol.options.is_empty() {
        out.push_str("Options Reconfigured:\n");
        for (key, value) in &vol.options {
            out.push_str(&format!("{}: {}\n", key, value));
        }
    }
    out
}

fn count_of(rsp: &ResponseDict) -> usize {
    rsp.get("count").and_then(|c| c.parse().ok()).unwrap_or(0)
}

/// Human-readable result of a successful operation
pub fn format_op_reply(request: &OpRequest, rsp: &ResponseDict) -> String {
    match request {
        OpRequest::CreateVolume { name, .. } => format!(
            "Creation of volume {} has been successful. Please start the volume to access data.\n",
            name
        ),
        OpRequest::DeleteVolume { name } => format!("Deleting volume {} has been successful\n", name),
        OpRequest::StartVolume { name, .. } => format!("Starting volume {} has been successful\n", name),
        OpRequest::StopVolume { name, .. } => format!("Stopping volume {} has been successful\n", name),
        OpRequest::AddBrick { .. } => "Add Brick successful\n".to_string(),
        OpRequest::RemoveBrick { .. } => "Remove Brick successful\n".to_string(),
        OpRequest::ReplaceBrick { action, .. } => {
            let mut out = format!("replace-brick {} successful\n", kebab_name(action));
            for (key, value) in rsp {
                out.push_str(&format!("{}: {}\n", key, value));
            }
            out
        }
        OpRequest::SetOption { .. } => "Set volume successful\n".to_string(),
        OpRequest::ResetOption { .. } => "reset volume successful\n".to_string(),
        OpRequest::Rebalance { name, command } => {
            let progress = RebalanceProgress::from_response(rsp);
            match command {
                RebalanceCommand::Stop => format!(
                    "stopped rebalance process of volume {} \n(after rebalancing {} files totaling {} bytes)\n",
                    name, progress.files, progress.size
                ),
                RebalanceCommand::Status => format!(
                    "rebalance {}: rebalanced {} files of size {} (total files scanned {})\n",
                    progress.status, progress.files, progress.size, progress.lookedup
                ),
                _ => format!("Starting rebalance on volume {} has been successful\n", name),
            }
        }
        OpRequest::Profile { name, command } => match command {
            ProfileCommand::Start => format!("Starting volume profile on {} has been successful\n", name),
            ProfileCommand::Stop => format!("Stopping volume profile on {} has been successful\n", name),
            ProfileCommand::Info => {
                let mut out = String::new();
                for i in 1..=count_of(rsp) {
                    let prefix = format!("{}-", i);
                    let brick = rsp.get(&format!("{}brick", prefix)).map(String::as_str).unwrap_or("-");
                    out.push_str(&format!("Brick: {}\n", brick));
                    for (key, value) in rsp.iter().filter(|(k, _)| k.starts_with(&prefix)) {
                        if key.ends_with("-brick") {
                            continue;
                        }
                        out.push_str(&format!("  {}: {}\n", &key[prefix.len()..], value));
                    }
                }
                out
            }
        },
        OpRequest::Quota { command, .. } => match command {
            QuotaCommand::List { .. } => {
                let mut out = format!("{:<32} {:>12} {:>12}\n", "path", "limit_set", "size");
                for i in 1..=count_of(rsp) {
                    let field = |k: &str| rsp.get(&format!("{}{}", k, i)).cloned().unwrap_or_default();
                    out.push_str(&format!("{:<32} {:>12} {:>12}\n", field("path"), field("limit"), field("usage")));
                }
                out
            }
            _ => "quota command successful\n".to_string(),
        },
        OpRequest::GeoReplication { command, .. } => match command {
            GsyncCommand::Status => {
                let mut out = format!("{:<24} {:<40} {:<12}\n", "MASTER", "SLAVE", "STATUS");
                let count = rsp.get("gsync-count").and_then(|c| c.parse().ok()).unwrap_or(0);
                for i in 1..=count {
                    let field = |k: &str| rsp.get(&format!("{}{}", k, i)).cloned().unwrap_or_default();
                    out.push_str(&format!("{:<24} {:<40} {:<12}\n", field("master"), field("slave"), field("status")));
                }
                out
            }
            GsyncCommand::Config(GsyncConfig::Get { .. } | GsyncConfig::GetAll) => {
                rsp.iter().map(|(k, v)| format!("{}: {}\n", k, v)).collect()
            }
            _ => "geo-replication command executed successfully\n".to_string(),
        },
        OpRequest::Sync { .. } => "sync successful\n".to_string(),
        OpRequest::FsmLog { .. } => String::new(),
    }
}

fn kebab_name<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use brickfs_volgen::BrickInfo;
    use uuid::Uuid;

    #[test]
    fn test_cli_peer_probe_subcommand() {
        let cli = Cli::parse_from(["bfs-mgmt", "peer", "probe", "node2"]);
        match &cli.command {
            Command::Peer {
                cmd: PeerCmd::Probe { host, port },
            } => {
                assert_eq!(host, "node2");
                assert!(port.is_none());
            }
            _ => panic!("Expected Peer Probe command"),
        }
    }

    #[test]
    fn test_cli_with_server_and_token_flags() {
        let cli = Cli::parse_from(["bfs-mgmt", "--server", "http://node1:24007", "--token", "secret", "peer", "status"]);
        assert_eq!(cli.server, "http://node1:24007");
        assert_eq!(cli.token, Some("secret".to_string()));
    }

    #[test]
    fn test_cli_volume_create_replica() {
        let cli = Cli::parse_from([
            "bfs-mgmt", "volume", "create", "vol0", "--replica", "2", "node1:/b1", "node2:/b2",
        ]);
        let Command::Volume { cmd } = cli.command else {
            panic!("Expected Volume command");
        };
        match cmd.to_request().unwrap() {
            Some(OpRequest::CreateVolume {
                name,
                cluster,
                sub_count,
                transport,
                bricks,
                ..
            }) => {
                assert_eq!(name, "vol0");
                assert_eq!(cluster, ClusterType::Replicate);
                assert_eq!(sub_count, 2);
                assert_eq!(transport, TransportType::Tcp);
                assert_eq!(bricks, vec!["node1:/b1", "node2:/b2"]);
            }
            _ => panic!("Expected CreateVolume request"),
        }
    }

    #[test]
    fn test_cli_volume_set_pairs() {
        let cli = Cli::parse_from([
            "bfs-mgmt", "volume", "set", "vol0", "auth.allow", "10.*", "ping-timeout", "20",
        ]);
        let Command::Volume { cmd } = cli.command else {
            panic!("Expected Volume command");
        };
        match cmd.to_request().unwrap() {
            Some(OpRequest::SetOption { options, force, .. }) => {
                assert!(!force);
                assert_eq!(options["auth.allow"], "10.*");
                assert_eq!(options["ping-timeout"], "20");
            }
            _ => panic!("Expected SetOption request"),
        }

        let odd = VolumeCmd::Set {
            name: "vol0".into(),
            pairs: vec!["a".into(), "b".into(), "c".into()],
            force: false,
        };
        assert!(odd.to_request().is_err());
    }

    #[test]
    fn test_cli_kebab_actions() {
        let cli = Cli::parse_from([
            "bfs-mgmt", "volume", "replace-brick", "vol0", "node1:/a", "node2:/b", "commit-force",
        ]);
        match cli.command {
            Command::Volume {
                cmd: VolumeCmd::ReplaceBrick { action, .. },
            } => assert_eq!(action, ReplaceBrickAction::CommitForce),
            _ => panic!("Expected ReplaceBrick command"),
        }
        assert!(Cli::try_parse_from(["bfs-mgmt", "volume", "rebalance", "vol0", "sideways"]).is_err());
        let cli = Cli::parse_from(["bfs-mgmt", "volume", "rebalance", "vol0", "fix-layout"]);
        match cli.command {
            Command::Volume {
                cmd: VolumeCmd::Rebalance { command, .. },
            } => assert_eq!(command, RebalanceCommand::FixLayout),
            _ => panic!("Expected Rebalance command"),
        }
    }

    #[test]
    fn test_cli_geo_replication_config() {
        let parse = |args: &[&str]| {
            let mut argv = vec!["bfs-mgmt", "volume", "geo-replication", "--master", "v", "--slave", "/backup", "config"];
            argv.extend_from_slice(args);
            let Command::Volume { cmd } = Cli::parse_from(argv).command else {
                panic!("Expected Volume command");
            };
            match cmd.to_request().unwrap() {
                Some(OpRequest::GeoReplication { command, .. }) => command,
                _ => panic!("Expected GeoReplication request"),
            }
        };
        assert_eq!(parse(&[]), GsyncCommand::Config(GsyncConfig::GetAll));
        assert_eq!(
            parse(&["log-level"]),
            GsyncCommand::Config(GsyncConfig::Get {
                name: Some("log-level".into())
            })
        );
        assert_eq!(
            parse(&["log-level", "DEBUG"]),
            GsyncCommand::Config(GsyncConfig::Set {
                name: Some("log-level".into()),
                value: Some("DEBUG".into())
            })
        );
        assert_eq!(
            parse(&["log-level", "--del"]),
            GsyncCommand::Config(GsyncConfig::Del {
                name: Some("log-level".into())
            })
        );
    }

    #[test]
    fn test_cli_quota_list() {
        let cli = Cli::parse_from(["bfs-mgmt", "volume", "quota", "vol0", "list", "/a", "/b"]);
        let Command::Volume { cmd } = cli.command else {
            panic!("Expected Volume command");
        };
        match cmd.to_request().unwrap() {
            Some(OpRequest::Quota { command, .. }) => assert_eq!(
                command,
                QuotaCommand::List {
                    paths: vec!["/a".into(), "/b".into()]
                }
            ),
            _ => panic!("Expected Quota request"),
        }
    }

    #[test]
    fn test_info_is_not_an_operation() {
        let cmd = VolumeCmd::Info { name: None };
        assert!(cmd.to_request().unwrap().is_none());
    }

    #[test]
    fn test_checked_reply() {
        assert!(checked(OpReply::success(ResponseDict::new())).is_ok());
        let err = checked(OpReply::failure(22, "Volume vol0 does not exist")).unwrap_err();
        assert_eq!(err.to_string(), "Volume vol0 does not exist");
    }

    #[test]
    fn test_format_peer_status() {
        let peers = vec![PeerView {
            uuid: Some("5a2b".into()),
            hostname: "node2".into(),
            port: 24007,
            state: "Peer in Cluster".into(),
            connected: true,
        }];
        let out = format_peer_status(&peers);
        assert!(out.starts_with("Number of Peers: 1\n"));
        assert!(out.contains("State: Peer in Cluster (Connected)"));
    }

    #[test]
    fn test_format_volume_info() {
        let bricks = ["node1:/b1", "node2:/b2", "node1:/b3", "node2:/b4"]
            .iter()
            .map(|b| BrickInfo::parse(b).unwrap())
            .collect();
        let vol = VolumeInfo::new("vol0", Uuid::nil(), ClusterType::Replicate, 2, TransportType::Tcp, bricks);
        let out = format_volume_info(&vol);
        assert!(out.contains("Volume Name: vol0"));
        assert!(out.contains("Number of Bricks: 2 x 2 = 4"));
        assert!(out.contains("Brick3: node1:/b3"));
        assert!(!out.contains("Options Reconfigured"));
    }

    #[test]
    fn test_format_rebalance_status() {
        let request = OpRequest::Rebalance {
            name: "vol0".into(),
            command: RebalanceCommand::Status,
        };
        let mut rsp = ResponseDict::new();
        rsp.insert("status".into(), "4".into());
        rsp.insert("files".into(), "12".into());
        rsp.insert("size".into(), "4096".into());
        rsp.insert("lookedup".into(), "40".into());
        assert_eq!(
            format_op_reply(&request, &rsp),
            "rebalance completed: rebalanced 12 files of size 4096 (total files scanned 40)\n"
        );
    }
}
