//! Node-local record of the single in-flight cluster operation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{MgmtError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OpLockEntry {
    /// Node coordinating the operation
    pub holder: Uuid,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct OpLockTable {
    entry: Mutex<Option<OpLockEntry>>,
}

impl OpLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock for `holder`; fails immediately when held
    pub fn lock(&self, holder: Uuid) -> Result<OpLockEntry> {
        let mut entry = self.entry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = *entry {
            warn!(holder = %current.holder, requester = %holder, "cluster lock already held");
            return Err(MgmtError::State(format!(
                "Another transaction is in progress. Please try again after sometime. (lock held by {})",
                current.holder
            )));
        }
        let new = OpLockEntry {
            holder,
            acquired_at: Utc::now(),
        };
        *entry = Some(new);
        debug!(holder = %holder, "cluster lock acquired");
        Ok(new)
    }

    /// Releases the lock; only the holder may do so
    pub fn unlock(&self, holder: Uuid) -> Result<()> {
        let mut entry = self.entry.lock().unwrap_or_else(|e| e.into_inner());
        match *entry {
            Some(current) if current.holder == holder => {
                *entry = None;
                debug!(holder = %holder, "cluster lock released");
                Ok(())
            }
            Some(current) => Err(MgmtError::State(format!(
                "lock held by {}, unlock requested by {}",
                current.holder, holder
            ))),
            None => Err(MgmtError::State(format!("lock not held, unlock requested by {}", holder))),
        }
    }

    pub fn holder(&self) -> Option<OpLockEntry> {
        *self.entry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_locked(&self) -> bool {
        self.holder().is_some()
    }
}
