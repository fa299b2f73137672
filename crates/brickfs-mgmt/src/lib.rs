#![warn(missing_docs)]

//! BrickFS management subsystem: peer membership, cluster-wide volume transactions, brick ops, admin API, CLI

pub mod api;
pub mod brick_op;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod driver;
pub mod error;
pub mod friend_sm;
pub mod handlers;
pub mod http_transport;
pub mod merge;
pub mod op_ctx;
pub mod op_lock;
pub mod op_sm;
pub mod peer;
pub mod services;
pub mod state;
pub mod store;
pub mod transport;

pub use api::AdminApi;
pub use config::MgmtConfig;
pub use daemon::MgmtDaemon;
pub use error::{ErrorKind, MgmtError, Result};
pub use op_ctx::{OpReply, OpRequest};
