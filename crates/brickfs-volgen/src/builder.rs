//! Graph compiler: turns a volume definition plus its option dictionary
//! into brick, client and NFS gateway graphs.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, VolgenError};
use crate::graph::{StageId, VolumeGraph};
use crate::options::{
    parse_boolean, OptionDict, OptionTable, VolOptMapEntry, VKEY_FEATURES_QUOTA, VKEY_MARKER_XTIME,
    VKEY_NFS_DISABLE, VKEY_PERF_STAT_PREFETCH,
};
use crate::validate::validate_graph;
use crate::volume::{BrickInfo, ClusterType, TransportType, VolumeInfo, VolumeStatus};

/// Internal key enabling the replace-brick pump on brick graphs
pub const KEY_ENABLE_PUMP: &str = "enable-pump";
/// Internal key holding the replace-brick destination as `host:path`
pub const KEY_RB_DST_BRICK: &str = "replace-brick.dst-brick";
/// Dictionary override for the transport written into client stages
pub const KEY_CLIENT_TRANSPORT: &str = "client-transport-type";
/// Location of the NFS gateway volfile below the working directory
pub const NFS_VOLFILE_PATH: &str = "nfs/nfs-server.vol";

/// Which kind of process a graph is generated for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphRole {
    /// Brick daemon serving one export directory
    Brick,
    /// Native client mount
    Client,
    /// NFS gateway covering every started volume
    Nfs,
}

impl GraphRole {
    fn keyword(self) -> &'static str {
        match self {
            GraphRole::Brick => "brick",
            GraphRole::Client => "client",
            GraphRole::Nfs => "nfs",
        }
    }
}

/// A generated graph together with its path relative to the working directory
#[derive(Debug, Clone)]
pub struct Volfile {
    /// Relative path, e.g. `vols/<vol>/<vol>-fuse.vol`
    pub path: String,
    /// The graph to serialize
    pub graph: VolumeGraph,
}

impl Volfile {
    /// Serialized volfile text
    pub fn contents(&self) -> String {
        self.graph.to_volfile()
    }
}

/// Builds processing-stage graphs from the option routing table
#[derive(Debug, Clone)]
pub struct VolgenEngine {
    table: &'static OptionTable,
    workdir: PathBuf,
}

fn overlay(base: &OptionDict, candidate: Option<&OptionDict>) -> OptionDict {
    let mut set = base.clone();
    if let Some(candidate) = candidate {
        for (k, v) in candidate {
            set.insert(k.clone(), v.clone());
        }
    }
    set
}

fn brick_file_component(path: &str) -> String {
    path.trim_start_matches('/').replace('/', "-")
}

impl VolgenEngine {
    /// Engine over the process-wide option table
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self::with_table(OptionTable::global(), workdir)
    }

    /// Engine over a specific table
    pub fn with_table(table: &'static OptionTable, workdir: impl Into<PathBuf>) -> Self {
        Self {
            table,
            workdir: workdir.into(),
        }
    }

    /// Option table in use
    pub fn table(&self) -> &'static OptionTable {
        self.table
    }

    /// Working directory graphs are generated for
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// `<workdir>/vols/<vol>`
    pub fn vol_dir(&self, volname: &str) -> PathBuf {
        self.workdir.join("vols").join(volname)
    }

    /// Relative path of a brick's volfile
    pub fn brick_volfile_path(vol: &VolumeInfo, brick: &BrickInfo) -> String {
        format!(
            "vols/{}/{}.{}.{}.vol",
            vol.name,
            vol.name,
            brick.hostname,
            brick_file_component(&brick.path)
        )
    }

    /// Relative path of the native client volfile
    pub fn client_volfile_path(vol: &VolumeInfo) -> String {
        format!("vols/{}/{}-fuse.vol", vol.name, vol.name)
    }

    /// Relative path of the rdma client volfile
    pub fn rdma_client_volfile_path(vol: &VolumeInfo) -> String {
        format!("vols/{}/{}-rdma-fuse.vol", vol.name, vol.name)
    }

    /// Calls `f` for every table row that has a value in `dict` or a default
    fn for_each_option<F>(&self, dict: &OptionDict, mut f: F) -> Result<()>
    where
        F: FnMut(&'static VolOptMapEntry, &str) -> Result<()>,
    {
        for entry in self.table.entries() {
            let value = match dict.get(entry.key) {
                Some(v) => v.as_str(),
                None => match entry.default {
                    Some(d) => d,
                    None => continue,
                },
            };
            f(entry, value)?;
        }
        Ok(())
    }

    fn set_on_type(graph: &mut VolumeGraph, stage_type: &str, option: &str, value: &str) {
        let ids: Vec<StageId> = graph.stages_of_type(stage_type).collect();
        for id in ids {
            graph.set_option(id, option, value);
        }
    }

    fn apply_basic(graph: &mut VolumeGraph, entry: &VolOptMapEntry, value: &str) {
        if entry.is_special() {
            return;
        }
        Self::set_on_type(graph, entry.stage_type, entry.option_name(), value);
    }

    fn apply_log_level(graph: &mut VolumeGraph, entry: &VolOptMapEntry, value: &str, role: GraphRole) {
        if entry.option_name() == "!log-level" && entry.key.contains(role.keyword()) {
            Self::set_on_type(graph, entry.stage_type, "log-level", value);
        }
    }

    fn apply_server_auth(graph: &mut VolumeGraph, entry: &VolOptMapEntry, value: &str) {
        if entry.option_name() != "!server-auth" {
            return;
        }
        let Some(head) = graph.head() else { return };
        let which = entry.specifier();
        let names: Vec<String> = graph
            .stage(head)
            .children
            .iter()
            .map(|&c| graph.stage(c).name.clone())
            .collect();
        for child in names {
            graph.set_option(head, &format!("auth.addr.{}.{}", child, which), value);
        }
    }

    fn check_marker_off(&self, vol: &VolumeInfo, entry: &VolOptMapEntry, value: &str) -> Result<()> {
        if entry.option_name() != "!xtime" {
            return Ok(());
        }
        let enabled = parse_boolean(value).ok_or_else(|| VolgenError::InvalidBoolean {
            key: entry.key.to_string(),
            value: value.to_string(),
        })?;
        if enabled {
            return Ok(());
        }
        if self.table.get_boolean(&vol.options, VKEY_MARKER_XTIME)? && vol.has_gsync_sessions() {
            return Err(VolgenError::GeoReplicationActive(VKEY_MARKER_XTIME.to_string()));
        }
        Ok(())
    }

    /// Builds the graph served by one brick daemon
    pub fn build_server_graph(
        &self,
        vol: &VolumeInfo,
        brick: &BrickInfo,
        candidate: Option<&OptionDict>,
    ) -> Result<VolumeGraph> {
        let set = overlay(&vol.options, candidate);
        let volname = vol.name.as_str();
        let transport = vol.transport.as_str();
        let mut graph = VolumeGraph::new();

        let posix = graph.add("storage/posix", volname);
        graph.set_option(posix, "directory", &brick.path);
        graph.add("features/access-control", volname);
        graph.add("features/locks", volname);
        graph.add("performance/io-threads", volname);

        let pump = match set.get(KEY_ENABLE_PUMP) {
            Some(v) => parse_boolean(v).ok_or_else(|| VolgenError::InvalidBoolean {
                key: KEY_ENABLE_PUMP.to_string(),
                value: v.clone(),
            })?,
            None => false,
        };
        if pump {
            let below = graph
                .head()
                .ok_or_else(|| VolgenError::Inconsistent("empty brick graph".into()))?;
            let rb = graph.add_nolink("protocol/client", &format!("{}-replace-brick", volname));
            graph.set_option(rb, "transport-type", transport);
            if let Some(dst) = set.get(KEY_RB_DST_BRICK) {
                let dst = BrickInfo::parse(dst)?;
                graph.set_option(rb, "remote-host", &dst.hostname);
                graph.set_option(rb, "remote-subvolume", &dst.path);
            }
            let pump = graph.add_nolink("cluster/pump", &format!("{}-pump", volname));
            graph.link(pump, below);
            graph.link(pump, rb);
        }

        let marker = graph.add("features/marker", volname);
        graph.set_option(marker, "volume-uuid", &vol.id.to_string());
        let tstamp = self.vol_dir(volname).join("marker.tstamp");
        graph.set_option(marker, "timestamp-file", &tstamp.to_string_lossy());

        graph.add_as("debug/io-stats", &brick.path);

        let server = graph.add("protocol/server", volname);
        graph.set_option(server, "transport-type", transport);

        self.for_each_option(&set, |entry, value| {
            Self::apply_server_auth(&mut graph, entry, value);
            self.check_marker_off(vol, entry, value)?;
            Self::apply_log_level(&mut graph, entry, value, GraphRole::Brick);
            Ok(())
        })?;
        self.for_each_option(&set, |entry, value| {
            Self::apply_basic(&mut graph, entry, value);
            Ok(())
        })?;

        debug!(volume = %volname, brick = %brick, stages = graph.len(), "built brick graph");
        Ok(graph)
    }

    /// Builds the native client graph
    pub fn build_client_graph(&self, vol: &VolumeInfo, candidate: Option<&OptionDict>) -> Result<VolumeGraph> {
        let set = overlay(&vol.options, candidate);
        let volname = vol.name.as_str();
        let brick_count = vol.brick_count();

        if brick_count == 0 {
            return Err(VolgenError::Inconsistent("brick count is 0".into()));
        }
        if vol.sub_count > 0 && vol.sub_count < brick_count && brick_count % vol.sub_count != 0 {
            return Err(VolgenError::Inconsistent(format!(
                "total number of bricks ({}) is not divisible with number of bricks per cluster ({}) in a multi-cluster setup",
                brick_count, vol.sub_count
            )));
        }

        let transport = match set.get(KEY_CLIENT_TRANSPORT) {
            Some(tt) => tt.clone(),
            None => vol.transport.as_str().to_string(),
        };

        let mut graph = VolumeGraph::new();
        let mut subvols: Vec<StageId> = Vec::with_capacity(brick_count);
        for (i, brick) in vol.bricks.iter().enumerate() {
            let id = graph.add_nolink("protocol/client", &format!("{}-client-{}", volname, i));
            graph.set_option(id, "remote-host", &brick.hostname);
            graph.set_option(id, "remote-subvolume", &brick.path);
            graph.set_option(id, "transport-type", &transport);
            subvols.push(id);
        }

        if vol.sub_count > 1 {
            let kind = match vol.cluster {
                ClusterType::Replicate => "replicate",
                ClusterType::Stripe => "stripe",
                ClusterType::None => {
                    return Err(VolgenError::Inconsistent("unrecognized clustering type".into()));
                }
            };
            let stage_type = format!("cluster/{}", kind);
            let mut groups = Vec::new();
            for (j, chunk) in subvols.chunks(vol.sub_count).enumerate() {
                let group = graph.add_nolink(&stage_type, &format!("{}-{}-{}", volname, kind, j));
                for &child in chunk {
                    graph.link(group, child);
                }
                groups.push(group);
            }
            subvols = groups;
        }

        if vol.dist_count() > 1 {
            let dht = graph.add_nolink("cluster/distribute", &format!("{}-dht", volname));
            for &child in &subvols {
                graph.link(dht, child);
            }
        }

        if self.table.get_boolean(&set, VKEY_FEATURES_QUOTA)? {
            graph.add("features/quota", volname);
        }

        self.for_each_option(&set, |entry, value| {
            if entry.option_name() != "!perf" {
                return Ok(());
            }
            let enabled = parse_boolean(value).ok_or_else(|| VolgenError::InvalidBoolean {
                key: entry.key.to_string(),
                value: value.to_string(),
            })?;
            if enabled {
                graph.add(entry.stage_type, volname);
            }
            Ok(())
        })?;

        graph.add_as("debug/io-stats", volname);

        self.for_each_option(&set, |entry, value| {
            Self::apply_log_level(&mut graph, entry, value, GraphRole::Client);
            Ok(())
        })?;
        self.for_each_option(&set, |entry, value| {
            Self::apply_basic(&mut graph, entry, value);
            Ok(())
        })?;

        debug!(volume = %volname, stages = graph.len(), "built client graph");
        Ok(graph)
    }

    fn nfs_namespaced_key(option: &str, volname: &str) -> Option<String> {
        let key = match option {
            "!nfs.rpc-auth-allow" => format!("rpc-auth.addr.{}.allow", volname),
            "!nfs.rpc-auth-reject" => format!("rpc-auth.addr.{}.reject", volname),
            "!nfs.rpc-auth-unix" => format!("rpc-auth.auth.unix.{}", volname),
            "!nfs.rpc-auth-null" => format!("rpc-auth.auth.null.{}", volname),
            "!nfs.trusted-sync" => format!("nfs3.{}.trusted-sync", volname),
            "!nfs.trusted-write" => format!("nfs3.{}.trusted-write", volname),
            "!nfs.volume-access" => format!("nfs3.{}.volume-access", volname),
            "!nfs.export-dir" => format!("nfs3.{}.export-dir", volname),
            "!nfs.ports-insecure" => format!("rpc-auth.ports.{}.insecure", volname),
            "!nfs.disable" => format!("nfs.{}.disable", volname),
            _ => return None,
        };
        Some(key)
    }

    /// Builds the NFS gateway graph over every started volume.
    ///
    /// `candidate` overlays options onto the named volume only.
    pub fn build_nfs_graph(
        &self,
        volumes: &[VolumeInfo],
        candidate: Option<(&str, &OptionDict)>,
    ) -> Result<VolumeGraph> {
        let mut graph = VolumeGraph::new();
        let nfs = graph.add_as("nfs/server", "nfs-server");
        graph.set_option(nfs, "nfs.dynamic-volumes", "on");

        for vol in volumes {
            if vol.status != VolumeStatus::Started {
                continue;
            }
            let vol_candidate = candidate.and_then(|(name, dict)| (name == vol.name).then_some(dict));
            let set = overlay(&vol.options, vol_candidate);
            if set.get(VKEY_NFS_DISABLE).and_then(|v| parse_boolean(v)).unwrap_or(false) {
                continue;
            }

            graph.set_option(nfs, &format!("rpc-auth.addr.{}.allow", vol.name), "*");
            graph.set_option(nfs, &format!("nfs3.{}.volume-id", vol.name), &vol.id.to_string());

            let mut client_set = vol_candidate.cloned().unwrap_or_default();
            client_set.insert(VKEY_PERF_STAT_PREFETCH.to_string(), "off".to_string());
            if vol.transport == TransportType::TcpRdma {
                client_set.insert(KEY_CLIENT_TRANSPORT.to_string(), "rdma".to_string());
            }
            let sub = self.build_client_graph(vol, Some(&client_set))?;
            graph.merge_sub(sub)?;

            self.for_each_option(&set, |entry, value| {
                if let Some(key) = Self::nfs_namespaced_key(entry.option_name(), &vol.name) {
                    graph.set_option(nfs, &key, value);
                } else if entry.stage_type == "nfs/server" && !entry.is_special() {
                    graph.set_option(nfs, entry.option_name(), value);
                }
                Ok(())
            })?;
        }

        debug!(stages = graph.len(), "built nfs graph");
        Ok(graph)
    }

    /// Builds a graph for `role`; NFS graphs cover `all_volumes`
    pub fn build(
        &self,
        role: GraphRole,
        vol: &VolumeInfo,
        brick: Option<&BrickInfo>,
        all_volumes: &[VolumeInfo],
    ) -> Result<VolumeGraph> {
        match role {
            GraphRole::Brick => {
                let brick = brick.ok_or_else(|| VolgenError::Inconsistent("brick graph needs a brick".into()))?;
                self.build_server_graph(vol, brick, None)
            }
            GraphRole::Client => self.build_client_graph(vol, None),
            GraphRole::Nfs => self.build_nfs_graph(all_volumes, None),
        }
    }

    /// Brick and client volfiles of one volume
    pub fn generate_volume_volfiles(&self, vol: &VolumeInfo) -> Result<Vec<Volfile>> {
        let mut files = Vec::with_capacity(vol.brick_count() + 2);
        for brick in &vol.bricks {
            let graph = self.build_server_graph(vol, brick, None)?;
            validate_graph(&graph)?;
            files.push(Volfile {
                path: Self::brick_volfile_path(vol, brick),
                graph,
            });
        }

        let graph = self.build_client_graph(vol, None)?;
        validate_graph(&graph)?;
        files.push(Volfile {
            path: Self::client_volfile_path(vol),
            graph,
        });

        if vol.transport == TransportType::TcpRdma {
            let mut rdma = OptionDict::new();
            rdma.insert(KEY_CLIENT_TRANSPORT.to_string(), "rdma".to_string());
            let graph = self.build_client_graph(vol, Some(&rdma))?;
            validate_graph(&graph)?;
            files.push(Volfile {
                path: Self::rdma_client_volfile_path(vol),
                graph,
            });
        }
        Ok(files)
    }

    /// The cluster-wide NFS gateway volfile
    pub fn generate_nfs_volfile(&self, volumes: &[VolumeInfo]) -> Result<Volfile> {
        let graph = self.build_nfs_graph(volumes, None)?;
        validate_graph(&graph)?;
        Ok(Volfile {
            path: NFS_VOLFILE_PATH.to_string(),
            graph,
        })
    }

    fn validate_candidate(&self, vol: &VolumeInfo, all_volumes: &[VolumeInfo], candidate: &OptionDict) -> Result<()> {
        for brick in &vol.bricks {
            validate_graph(&self.build_server_graph(vol, brick, Some(candidate))?)?;
        }
        validate_graph(&self.build_client_graph(vol, Some(candidate))?)?;
        validate_graph(&self.build_nfs_graph(all_volumes, Some((vol.name.as_str(), candidate)))?)?;
        Ok(())
    }

    /// Dry-runs every graph of `vol` with per-volume `candidate` options applied
    pub fn validate_reconf(&self, vol: &VolumeInfo, all_volumes: &[VolumeInfo], candidate: &OptionDict) -> Result<()> {
        if let Some(key) = candidate.keys().find(|k| !self.table.is_local(k)) {
            return Err(VolgenError::NotLocalOption(key.clone()));
        }
        self.validate_candidate(vol, all_volumes, candidate)
    }

    /// Dry-runs every graph of `vol` with cluster-wide `candidate` options applied
    pub fn validate_global(&self, vol: &VolumeInfo, all_volumes: &[VolumeInfo], candidate: &OptionDict) -> Result<()> {
        if let Some(key) = candidate.keys().find(|k| !self.table.is_global(k)) {
            return Err(VolgenError::NotGlobalOption(key.clone()));
        }
        self.validate_candidate(vol, all_volumes, candidate)
    }
}
