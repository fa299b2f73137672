//! Static option routing table.
//!
//! Every user-settable volume option maps to an option on one stage type.
//! Options whose stage option starts with [`SPECIAL_MARKER`] are handled by
//! dedicated code in the graph builder instead of being copied through.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::error::{Result, VolgenError};
use crate::trie::{OptionHint, OptionTrie};

/// Open key/value option dictionary of a volume
pub type OptionDict = BTreeMap<String, String>;

/// Prefix marking options that need a dedicated handler
pub const SPECIAL_MARKER: char = '!';

/// Option may only be changed or reset with force
pub const OPT_FLAG_FORCE: u32 = 0x01;

/// Turns on latency accounting in io-stats
pub const VKEY_DIAG_LAT_MEASUREMENT: &str = "diagnostics.latency-measurement";
/// Turns on per-fop counters in io-stats
pub const VKEY_DIAG_CNT_FOP_HITS: &str = "diagnostics.count-fop-hits";
/// Client-side stat-prefetch toggle
pub const VKEY_PERF_STAT_PREFETCH: &str = "performance.stat-prefetch";
/// Marker xtime indexing used by geo-replication
pub const VKEY_MARKER_XTIME: &str = "geo-replication.indexing";
/// Quota accounting toggle
pub const VKEY_FEATURES_QUOTA: &str = "features.quota";
/// Per-directory quota limits
pub const VKEY_FEATURES_LIMIT_USAGE: &str = "features.limit-usage";
/// Per-volume NFS export toggle
pub const VKEY_NFS_DISABLE: &str = "nfs.disable";

/// Who sees an option and at which scope it applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Per-volume, documented
    Doc,
    /// Per-volume, hidden
    NoDoc,
    /// Cluster-wide, documented
    GlobalDoc,
    /// Cluster-wide, hidden
    GlobalNoDoc,
}

impl Visibility {
    /// Applies to a single volume
    pub fn is_local(self) -> bool {
        matches!(self, Visibility::Doc | Visibility::NoDoc)
    }

    /// Applies cluster-wide
    pub fn is_global(self) -> bool {
        matches!(self, Visibility::GlobalDoc | Visibility::GlobalNoDoc)
    }
}

/// One row of the routing table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolOptMapEntry {
    /// User-facing dotted key
    pub key: &'static str,
    /// Stage type receiving the option
    pub stage_type: &'static str,
    /// Stage option name, derived from the key when absent
    pub option: Option<&'static str>,
    /// Value applied when the volume does not set the key
    pub default: Option<&'static str>,
    /// Scope and documentation class
    pub visibility: Visibility,
    /// `OPT_FLAG_*` bits
    pub flags: u32,
}

impl VolOptMapEntry {
    /// Stage option name, falling back to the text after the last dot of the key
    pub fn option_name(&self) -> &'static str {
        match self.option {
            Some(opt) => opt,
            None => match self.key.rfind('.') {
                Some(idx) => &self.key[idx + 1..],
                None => self.key,
            },
        }
    }

    /// Whether this row is routed to a dedicated handler
    pub fn is_special(&self) -> bool {
        self.option_name().starts_with(SPECIAL_MARKER)
    }

    /// Domain part of the key (before the first dot)
    pub fn domain(&self) -> &'static str {
        self.key.split('.').next().unwrap_or(self.key)
    }

    /// Specifier part of the key (after the first dot)
    pub fn specifier(&self) -> &'static str {
        match self.key.find('.') {
            Some(idx) => &self.key[idx + 1..],
            None => self.key,
        }
    }
}

const fn row(
    key: &'static str,
    stage_type: &'static str,
    option: Option<&'static str>,
    default: Option<&'static str>,
    visibility: Visibility,
    flags: u32,
) -> VolOptMapEntry {
    VolOptMapEntry {
        key,
        stage_type,
        option,
        default,
        visibility,
        flags,
    }
}

use Visibility::{Doc, GlobalDoc, GlobalNoDoc, NoDoc};

/// The routing table, in application order
pub static VOLOPT_MAP: &[VolOptMapEntry] = &[
    row("cluster.lookup-unhashed", "cluster/distribute", None, None, Doc, 0),
    row("cluster.min-free-disk", "cluster/distribute", None, None, Doc, 0),
    row("cluster.entry-change-log", "cluster/replicate", None, None, Doc, 0),
    row("cluster.read-subvolume", "cluster/replicate", None, None, Doc, 0),
    row("cluster.background-self-heal-count", "cluster/replicate", None, None, Doc, 0),
    row("cluster.metadata-self-heal", "cluster/replicate", None, None, Doc, 0),
    row("cluster.data-self-heal", "cluster/replicate", None, None, Doc, 0),
    row("cluster.entry-self-heal", "cluster/replicate", None, None, Doc, 0),
    row("cluster.strict-readdir", "cluster/replicate", None, None, Doc, 0),
    row("cluster.self-heal-window-size", "cluster/replicate", Some("data-self-heal-window-size"), None, Doc, 0),
    row("cluster.data-change-log", "cluster/replicate", None, None, Doc, 0),
    row("cluster.metadata-change-log", "cluster/replicate", None, None, Doc, 0),
    row("cluster.data-self-heal-algorithm", "cluster/replicate", Some("data-self-heal-algorithm"), None, Doc, 0),
    row("cluster.quorum-type", "cluster/replicate", None, None, Doc, 0),
    row("cluster.quorum-count", "cluster/replicate", None, None, Doc, 0),
    row("cluster.stripe-block-size", "cluster/stripe", Some("block-size"), None, Doc, 0),
    row(VKEY_DIAG_LAT_MEASUREMENT, "debug/io-stats", Some("latency-measurement"), Some("off"), NoDoc, 0),
    row("diagnostics.dump-fd-stats", "debug/io-stats", None, None, Doc, 0),
    row(VKEY_DIAG_CNT_FOP_HITS, "debug/io-stats", Some("count-fop-hits"), Some("off"), NoDoc, 0),
    row("diagnostics.brick-log-level", "debug/io-stats", Some("!log-level"), None, Doc, 0),
    row("diagnostics.client-log-level", "debug/io-stats", Some("!log-level"), None, Doc, 0),
    row("performance.cache-max-file-size", "performance/io-cache", Some("max-file-size"), None, Doc, 0),
    row("performance.cache-min-file-size", "performance/io-cache", Some("min-file-size"), None, Doc, 0),
    row("performance.cache-refresh-timeout", "performance/io-cache", Some("cache-timeout"), None, Doc, 0),
    row("performance.cache-priority", "performance/io-cache", Some("priority"), None, Doc, 0),
    row("performance.cache-size", "performance/io-cache", None, None, NoDoc, 0),
    row("performance.cache-size", "performance/quick-read", None, None, NoDoc, 0),
    row("performance.flush-behind", "performance/write-behind", Some("flush-behind"), None, Doc, 0),
    row("performance.io-thread-count", "performance/io-threads", Some("thread-count"), None, Doc, 0),
    row("performance.disk-usage-limit", "performance/quota", None, None, Doc, 0),
    row("performance.min-free-disk-limit", "performance/quota", None, None, Doc, 0),
    row("performance.write-behind-window-size", "performance/write-behind", Some("cache-size"), None, Doc, 0),
    row("network.frame-timeout", "protocol/client", None, None, Doc, 0),
    row("network.ping-timeout", "protocol/client", None, None, Doc, 0),
    row("network.inode-lru-limit", "protocol/server", None, None, Doc, 0),
    row("auth.allow", "protocol/server", Some("!server-auth"), Some("*"), Doc, 0),
    row("auth.reject", "protocol/server", Some("!server-auth"), None, Doc, 0),
    row("transport.keepalive", "protocol/server", Some("transport.socket.keepalive"), None, NoDoc, 0),
    row("server.allow-insecure", "protocol/server", Some("rpc-auth-allow-insecure"), None, NoDoc, 0),
    row("performance.write-behind", "performance/write-behind", Some("!perf"), Some("on"), NoDoc, 0),
    row("performance.read-ahead", "performance/read-ahead", Some("!perf"), Some("on"), NoDoc, 0),
    row("performance.io-cache", "performance/io-cache", Some("!perf"), Some("on"), NoDoc, 0),
    row("performance.quick-read", "performance/quick-read", Some("!perf"), Some("on"), NoDoc, 0),
    row(VKEY_PERF_STAT_PREFETCH, "performance/stat-prefetch", Some("!perf"), Some("on"), NoDoc, 0),
    row(VKEY_MARKER_XTIME, "features/marker", Some("xtime"), Some("off"), NoDoc, OPT_FLAG_FORCE),
    row(VKEY_MARKER_XTIME, "features/marker", Some("!xtime"), Some("off"), NoDoc, OPT_FLAG_FORCE),
    row("nfs.enable-ino32", "nfs/server", Some("nfs.enable-ino32"), None, GlobalDoc, 0),
    row("nfs.mem-factor", "nfs/server", Some("nfs.mem-factor"), None, GlobalDoc, 0),
    row("nfs.export-dirs", "nfs/server", Some("nfs3.export-dirs"), None, GlobalDoc, 0),
    row("nfs.export-volumes", "nfs/server", Some("nfs3.export-volumes"), None, GlobalDoc, 0),
    row("nfs.addr-namelookup", "nfs/server", Some("rpc-auth.addr.namelookup"), None, GlobalDoc, 0),
    row("nfs.dynamic-volumes", "nfs/server", Some("nfs.dynamic-volumes"), None, GlobalNoDoc, 0),
    row("nfs.register-with-portmap", "nfs/server", Some("rpc.register-with-portmap"), None, GlobalDoc, 0),
    row("nfs.port", "nfs/server", Some("nfs.port"), None, GlobalDoc, 0),
    row("nfs.rpc-auth-unix", "nfs/server", Some("!nfs.rpc-auth-unix"), None, Doc, 0),
    row("nfs.rpc-auth-null", "nfs/server", Some("!nfs.rpc-auth-null"), None, Doc, 0),
    row("nfs.rpc-auth-allow", "nfs/server", Some("!nfs.rpc-auth-allow"), None, Doc, 0),
    row("nfs.rpc-auth-reject", "nfs/server", Some("!nfs.rpc-auth-reject"), None, Doc, 0),
    row("nfs.ports-insecure", "nfs/server", Some("!nfs.ports-insecure"), None, Doc, 0),
    row("nfs.trusted-sync", "nfs/server", Some("!nfs.trusted-sync"), None, Doc, 0),
    row("nfs.trusted-write", "nfs/server", Some("!nfs.trusted-write"), None, Doc, 0),
    row("nfs.volume-access", "nfs/server", Some("!nfs.volume-access"), None, Doc, 0),
    row("nfs.export-dir", "nfs/server", Some("!nfs.export-dir"), None, Doc, 0),
    row(VKEY_NFS_DISABLE, "nfs/server", Some("!nfs.disable"), None, Doc, 0),
    row(VKEY_FEATURES_QUOTA, "features/marker", Some("quota"), Some("off"), NoDoc, OPT_FLAG_FORCE),
    row(VKEY_FEATURES_LIMIT_USAGE, "features/quota", Some("limit-set"), None, NoDoc, 0),
    row("features.quota-timeout", "features/quota", Some("timeout"), Some("0"), Doc, 0),
];

/// Result of looking a key up in the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionLookup {
    /// The key (possibly completed from a bare specifier) exists
    Exists(String),
    /// The key is unknown, with suggestions when any are close
    Unknown(Option<OptionHint>),
}

/// Read-only view over the routing table with its hint index
#[derive(Debug)]
pub struct OptionTable {
    entries: &'static [VolOptMapEntry],
    trie: OptionTrie,
}

impl OptionTable {
    /// Builds a table view and its trie over `entries`
    pub fn new(entries: &'static [VolOptMapEntry]) -> Self {
        let trie = OptionTrie::build(entries.iter().map(|e| e.key));
        Self { entries, trie }
    }

    /// Process-wide table built once from [`VOLOPT_MAP`]
    pub fn global() -> &'static OptionTable {
        static TABLE: OnceLock<OptionTable> = OnceLock::new();
        TABLE.get_or_init(|| OptionTable::new(VOLOPT_MAP))
    }

    /// All rows in application order
    pub fn entries(&self) -> &'static [VolOptMapEntry] {
        self.entries
    }

    /// Hint index over the keys
    pub fn trie(&self) -> &OptionTrie {
        &self.trie
    }

    /// First row with exactly this key
    pub fn find(&self, key: &str) -> Option<&'static VolOptMapEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    /// Completes a bare specifier to the unique full key it belongs to
    pub fn option_complete(&self, key: &str) -> Option<&'static str> {
        let mut completion: Option<&'static str> = None;
        for entry in self.entries {
            if entry.specifier() != key {
                continue;
            }
            match completion {
                Some(existing) if existing != entry.key => return None,
                _ => completion = Some(entry.key),
            }
        }
        completion
    }

    /// Resolves a user-supplied key to a full table key
    fn resolve(&self, key: &str) -> Option<&'static str> {
        if key.contains('.') {
            self.find(key).map(|e| e.key)
        } else {
            self.option_complete(key)
        }
    }

    /// Whether `key` names an option, completing bare specifiers and
    /// falling back to trie hints when it does not
    pub fn check_option_exists(&self, key: &str) -> OptionLookup {
        match self.resolve(key) {
            Some(full) => OptionLookup::Exists(full.to_string()),
            None => OptionLookup::Unknown(self.trie.hint(key)),
        }
    }

    /// Whether the key exists and carries any of `flags`
    pub fn has_flags(&self, key: &str, flags: u32) -> bool {
        self.resolve(key)
            .and_then(|k| self.find(k))
            .map(|e| e.flags & flags != 0)
            .unwrap_or(false)
    }

    /// Whether the key exists and is cluster-wide
    pub fn is_global(&self, key: &str) -> bool {
        self.resolve(key)
            .and_then(|k| self.find(k))
            .map(|e| e.visibility.is_global())
            .unwrap_or(false)
    }

    /// Whether the key exists and is per-volume
    pub fn is_local(&self, key: &str) -> bool {
        self.resolve(key)
            .and_then(|k| self.find(k))
            .map(|e| e.visibility.is_local())
            .unwrap_or(false)
    }

    /// Value from `dict`, or the table default for the key
    pub fn get_with_default<'a>(&self, dict: &'a OptionDict, key: &str) -> Option<&'a str> {
        if let Some(v) = dict.get(key) {
            return Some(v.as_str());
        }
        self.entries
            .iter()
            .filter(|e| e.key == key)
            .find_map(|e| e.default)
    }

    /// Boolean value from `dict` or the default, `false` when neither is set
    pub fn get_boolean(&self, dict: &OptionDict, key: &str) -> Result<bool> {
        match self.get_with_default(dict, key) {
            None => Ok(false),
            Some(value) => parse_boolean(value).ok_or_else(|| VolgenError::InvalidBoolean {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }
}

/// Parses the boolean spellings accepted on the command line
pub fn parse_boolean(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "yes" | "true" | "enable" => Some(true),
        "0" | "off" | "no" | "false" | "disable" => Some(false),
        _ => None,
    }
}
