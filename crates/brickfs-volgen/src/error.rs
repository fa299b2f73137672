use thiserror::Error;

/// Errors raised while building, validating or parsing volume graphs
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VolgenError {
    /// The volume layout cannot be expressed as a graph
    #[error("volume inconsistency: {0}")]
    Inconsistent(String),

    /// A stage references a type the graph compiler does not know
    #[error("unknown stage type: {0}")]
    UnknownStageType(String),

    /// A stage is missing an option it cannot run without
    #[error("stage {stage} is missing required option {option}")]
    MissingValue {
        /// Instance name of the stage
        stage: String,
        /// Name of the missing option
        option: String,
    },

    /// An option value does not satisfy the stage's accepted range or format
    #[error("invalid value '{value}' for option {option} on {stage}: {reason}")]
    InvalidValue {
        /// Instance name of the stage
        stage: String,
        /// Name of the option
        option: String,
        /// Rejected value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// A value expected to be boolean could not be parsed
    #[error("value '{value}' for {key} is not a valid boolean")]
    InvalidBoolean {
        /// Option key
        key: String,
        /// Offending value
        value: String,
    },

    /// The key is not known to the option table
    #[error("option : {0} does not exist")]
    UnknownOption(String),

    /// A per-volume change touched a global option
    #[error("option specified is not a local option: {0}")]
    NotLocalOption(String),

    /// A cluster-wide change touched a per-volume option
    #[error("option specified is not a global option: {0}")]
    NotGlobalOption(String),

    /// Indexing may not be turned off while sessions depend on it
    #[error("{0} cannot be disabled while geo-replication sessions exist")]
    GeoReplicationActive(String),

    /// The volfile text could not be parsed
    #[error("volfile parse error at line {line}: {reason}")]
    Parse {
        /// One-based line number
        line: usize,
        /// Description of the problem
        reason: String,
    },
}

/// Result type for graph compiler operations
pub type Result<T> = std::result::Result<T, VolgenError>;
