//! Folding peer and brick responses into the coordinator's response.
//!
//! Per-brick keys are numbered `<n><suffix>`; a peer numbers its bricks
//! from 1, so its keys are shifted by the number of bricks already merged
//! before insertion.

use crate::op_ctx::{OperationKind, ResponseDict};

pub const KEY_COUNT: &str = "count";
pub const KEY_GSYNC_COUNT: &str = "gsync-count";
pub const KEY_ERRSTR: &str = "errstr";
pub const KEY_SRC_BRICK_PORT: &str = "src-brick-port";
pub const KEY_DST_BRICK_PORT: &str = "dst-brick-port";

fn get_count(dict: &ResponseDict, key: &str) -> usize {
    dict.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
}

/// Splits `12-read-hits` into `(12, "-read-hits")`
pub fn split_index(key: &str) -> Option<(usize, &str)> {
    let end = key.find(|c: char| !c.is_ascii_digit()).unwrap_or(key.len());
    if end == 0 {
        return None;
    }
    let n = key[..end].parse().ok()?;
    Some((n, &key[end..]))
}

/// Merges a peer's profile response, rebasing its brick indices
pub fn rebase_profile(dst: &mut ResponseDict, src: &ResponseDict) {
    let base = get_count(dst, KEY_COUNT);
    let added = get_count(src, KEY_COUNT);
    for (key, value) in src {
        if key == KEY_COUNT {
            continue;
        }
        match split_index(key) {
            Some((n, suffix)) => {
                dst.insert(format!("{}{}", n + base, suffix), value.clone());
            }
            None => {
                dst.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }
    dst.insert(KEY_COUNT.to_string(), (base + added).to_string());
}

/// Adds one local brick's counters as the next index
pub fn add_brick_profile(dst: &mut ResponseDict, brick: &str, payload: &ResponseDict) {
    let idx = get_count(dst, KEY_COUNT) + 1;
    dst.insert(format!("{}-brick", idx), brick.to_string());
    for (key, value) in payload {
        dst.insert(format!("{}-{}", idx, key), value.clone());
    }
    dst.insert(KEY_COUNT.to_string(), idx.to_string());
}

/// Appends a peer's geo-replication session list
pub fn append_gsync_status(dst: &mut ResponseDict, src: &ResponseDict) {
    let base = get_count(dst, KEY_GSYNC_COUNT);
    let added = get_count(src, KEY_GSYNC_COUNT);
    for i in 1..=added {
        for prefix in ["master", "slave", "status"] {
            if let Some(v) = src.get(&format!("{}{}", prefix, i)) {
                dst.insert(format!("{}{}", prefix, base + i), v.clone());
            }
        }
    }
    dst.insert(KEY_GSYNC_COUNT.to_string(), (base + added).to_string());
    if let Some(err) = src.get(KEY_ERRSTR) {
        dst.insert(KEY_ERRSTR.to_string(), err.clone());
    }
}

pub fn copy_rb_ports(dst: &mut ResponseDict, src: &ResponseDict) {
    for key in [KEY_SRC_BRICK_PORT, KEY_DST_BRICK_PORT] {
        if let Some(v) = src.get(key) {
            dst.insert(key.to_string(), v.clone());
        }
    }
}

/// Collects `volumeN` payloads for import
pub fn collect_sync_volumes(dst: &mut ResponseDict, src: &ResponseDict) {
    let base = get_count(dst, KEY_COUNT);
    let added = get_count(src, KEY_COUNT);
    for i in 1..=added {
        if let Some(v) = src.get(&format!("volume{}", i)) {
            dst.insert(format!("volume{}", base + i), v.clone());
        }
    }
    dst.insert(KEY_COUNT.to_string(), (base + added).to_string());
}

/// Merges a commit response according to the operation kind
pub fn merge_commit_response(kind: OperationKind, dst: &mut ResponseDict, src: &ResponseDict) {
    if src.is_empty() {
        return;
    }
    match kind {
        OperationKind::Profile => rebase_profile(dst, src),
        OperationKind::GeoReplicationSet if src.contains_key(KEY_GSYNC_COUNT) => append_gsync_status(dst, src),
        OperationKind::ReplaceBrick => {
            copy_rb_ports(dst, src);
            for (k, v) in src {
                dst.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        OperationKind::Sync => collect_sync_volumes(dst, src),
        _ => {
            for (k, v) in src {
                dst.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
    }
}
