//! Structural and value checks applied to a built graph.
//!
//! Each stage type declares which options it needs and what values it
//! accepts for a handful of options; anything else is passed through.

use crate::error::{Result, VolgenError};
use crate::graph::VolumeGraph;
use crate::options::parse_boolean;

/// Every stage type the compiler may emit
pub const KNOWN_STAGE_TYPES: &[&str] = &[
    "storage/posix",
    "features/access-control",
    "features/locks",
    "features/marker",
    "features/quota",
    "performance/io-threads",
    "performance/write-behind",
    "performance/read-ahead",
    "performance/io-cache",
    "performance/quick-read",
    "performance/stat-prefetch",
    "performance/quota",
    "cluster/distribute",
    "cluster/replicate",
    "cluster/stripe",
    "cluster/pump",
    "debug/io-stats",
    "protocol/client",
    "protocol/server",
    "nfs/server",
];

#[derive(Debug, Clone, Copy)]
enum ValueKind {
    Bool,
    Int { min: i64, max: i64 },
    Size,
    Enum(&'static [&'static str]),
}

const LOG_LEVELS: &[&str] = &["DEBUG", "WARNING", "ERROR", "CRITICAL", "NONE", "TRACE", "INFO"];

const VALUE_KINDS: &[(&str, &str, ValueKind)] = &[
    ("debug/io-stats", "latency-measurement", ValueKind::Bool),
    ("debug/io-stats", "count-fop-hits", ValueKind::Bool),
    ("debug/io-stats", "dump-fd-stats", ValueKind::Bool),
    ("debug/io-stats", "log-level", ValueKind::Enum(LOG_LEVELS)),
    ("performance/io-threads", "thread-count", ValueKind::Int { min: 1, max: 64 }),
    ("performance/io-cache", "cache-size", ValueKind::Size),
    ("performance/io-cache", "max-file-size", ValueKind::Size),
    ("performance/io-cache", "min-file-size", ValueKind::Size),
    ("performance/io-cache", "cache-timeout", ValueKind::Int { min: 0, max: 60 }),
    ("performance/quick-read", "cache-size", ValueKind::Size),
    ("performance/write-behind", "cache-size", ValueKind::Size),
    ("performance/write-behind", "flush-behind", ValueKind::Bool),
    ("protocol/client", "frame-timeout", ValueKind::Int { min: 0, max: 86400 }),
    ("protocol/client", "ping-timeout", ValueKind::Int { min: 1, max: 1013 }),
    ("protocol/server", "inode-lru-limit", ValueKind::Int { min: 0, max: 1_048_576 }),
    ("protocol/server", "rpc-auth-allow-insecure", ValueKind::Bool),
    ("cluster/replicate", "data-self-heal-algorithm", ValueKind::Enum(&["diff", "full"])),
    ("cluster/replicate", "metadata-self-heal", ValueKind::Bool),
    ("cluster/replicate", "data-self-heal", ValueKind::Bool),
    ("cluster/replicate", "entry-self-heal", ValueKind::Bool),
    ("cluster/replicate", "strict-readdir", ValueKind::Bool),
    ("cluster/replicate", "data-change-log", ValueKind::Bool),
    ("cluster/replicate", "metadata-change-log", ValueKind::Bool),
    ("cluster/replicate", "entry-change-log", ValueKind::Bool),
    ("cluster/replicate", "quorum-type", ValueKind::Enum(&["none", "auto", "fixed"])),
    ("cluster/stripe", "block-size", ValueKind::Size),
    ("cluster/distribute", "lookup-unhashed", ValueKind::Bool),
    ("features/marker", "xtime", ValueKind::Bool),
    ("features/marker", "quota", ValueKind::Bool),
    ("features/quota", "timeout", ValueKind::Int { min: 0, max: 60 }),
    ("nfs/server", "nfs.enable-ino32", ValueKind::Bool),
    ("nfs/server", "nfs.dynamic-volumes", ValueKind::Bool),
    ("nfs/server", "nfs.port", ValueKind::Int { min: 1, max: 65535 }),
];

const REQUIRED: &[(&str, &str)] = &[
    ("storage/posix", "directory"),
    ("protocol/client", "transport-type"),
    ("protocol/server", "transport-type"),
    ("features/marker", "volume-uuid"),
];

/// Parses sizes such as `64MB`, `1GB` or a plain byte count
pub fn parse_size(value: &str) -> Option<u64> {
    let v = value.trim();
    let split = v.find(|c: char| !c.is_ascii_digit()).unwrap_or(v.len());
    let (digits, suffix) = v.split_at(split);
    let n: u64 = digits.parse().ok()?;
    let mult: u64 = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" | "K" => 1 << 10,
        "MB" | "M" => 1 << 20,
        "GB" | "G" => 1 << 30,
        "TB" | "T" => 1 << 40,
        "PB" | "P" => 1 << 50,
        _ => return None,
    };
    n.checked_mul(mult)
}

fn check_value(stage: &str, option: &str, value: &str, kind: ValueKind) -> Result<()> {
    let bad = |reason: String| VolgenError::InvalidValue {
        stage: stage.to_string(),
        option: option.to_string(),
        value: value.to_string(),
        reason,
    };
    match kind {
        ValueKind::Bool => parse_boolean(value)
            .map(|_| ())
            .ok_or_else(|| bad("expected a boolean".into())),
        ValueKind::Int { min, max } => {
            let n: i64 = value
                .trim()
                .parse()
                .map_err(|_| bad("expected an integer".into()))?;
            if n < min || n > max {
                return Err(bad(format!("out of range {}-{}", min, max)));
            }
            Ok(())
        }
        ValueKind::Size => parse_size(value)
            .map(|_| ())
            .ok_or_else(|| bad("expected a size".into())),
        ValueKind::Enum(allowed) => {
            if allowed.iter().any(|a| a.eq_ignore_ascii_case(value.trim())) {
                Ok(())
            } else {
                Err(bad(format!("expected one of {}", allowed.join(", "))))
            }
        }
    }
}

/// Checks stage types, required options and declared value kinds
pub fn validate_graph(graph: &VolumeGraph) -> Result<()> {
    for id in graph.iter() {
        let stage = graph.stage(id);
        if !KNOWN_STAGE_TYPES.contains(&stage.stage_type.as_str()) {
            return Err(VolgenError::UnknownStageType(stage.stage_type.clone()));
        }
        for (ty, opt) in REQUIRED {
            if *ty == stage.stage_type && !stage.options.contains_key(*opt) {
                return Err(VolgenError::MissingValue {
                    stage: stage.name.clone(),
                    option: opt.to_string(),
                });
            }
        }
        if stage.stage_type == "protocol/client"
            && !stage.name.ends_with("-replace-brick")
            && !(stage.options.contains_key("remote-host") && stage.options.contains_key("remote-subvolume"))
        {
            return Err(VolgenError::MissingValue {
                stage: stage.name.clone(),
                option: "remote-host".into(),
            });
        }
        for (key, value) in &stage.options {
            if let Some((_, _, kind)) = VALUE_KINDS
                .iter()
                .find(|(ty, opt, _)| *ty == stage.stage_type && opt == key)
            {
                check_value(&stage.name, key, value, *kind)?;
            }
        }
    }
    Ok(())
}
