//! Error taxonomy of the management daemon.

use brickfs_volgen::VolgenError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportError;

/// Coarse classification of a failure, independent of its message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Peer unreachable or timed out
    Transport,
    /// Malformed response
    ProtocolDecode,
    /// Staging rejected the request
    Validation,
    /// Name collisions, already-probed peers, reserved options
    Conflict,
    /// Wrong peer state or an operation already in flight
    State,
    /// Persisted state could not be read or written
    Store,
}

impl ErrorKind {
    /// Errno-style code carried in replies
    pub fn errno(self) -> i32 {
        match self {
            ErrorKind::Transport => 107,
            ErrorKind::ProtocolDecode => 74,
            ErrorKind::Validation => 22,
            ErrorKind::Conflict => 17,
            ErrorKind::State => 16,
            ErrorKind::Store => 5,
        }
    }
}

/// Errors raised by the management daemon
#[derive(Debug, Error)]
pub enum MgmtError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    State(String),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Volgen(#[from] VolgenError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl MgmtError {
    /// Classifies the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            MgmtError::Transport(TransportError::Decode { .. }) => ErrorKind::ProtocolDecode,
            MgmtError::Transport(_) => ErrorKind::Transport,
            MgmtError::ProtocolDecode(_) | MgmtError::Json(_) => ErrorKind::ProtocolDecode,
            MgmtError::Validation(_) | MgmtError::Volgen(_) => ErrorKind::Validation,
            MgmtError::Conflict(_) => ErrorKind::Conflict,
            MgmtError::State(_) => ErrorKind::State,
            MgmtError::Store(_) | MgmtError::Io(_) => ErrorKind::Store,
        }
    }
}

pub type Result<T> = std::result::Result<T, MgmtError>;
