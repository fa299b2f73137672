#![warn(missing_docs)]

//! BrickFS graph compiler: option routing table, option hints, volume model and volfile generation

pub mod builder;
pub mod error;
pub mod graph;
pub mod options;
pub mod trie;
pub mod validate;
pub mod volume;

pub use builder::{GraphRole, VolgenEngine, Volfile};
pub use error::{Result, VolgenError};
pub use graph::{Stage, StageDescription, StageId, VolumeGraph};
pub use options::{OptionDict, OptionLookup, OptionTable, VolOptMapEntry, Visibility};
pub use trie::{OptionHint, OptionTrie};
pub use volume::{
    BrickInfo, ClusterType, ReplaceBrickSession, ReplaceBrickStatus, TransportType, VolumeInfo, VolumeStatus,
    VolumeType,
};
