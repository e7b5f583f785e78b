//! Error types for the OpenDPI runtime

use thiserror::Error;

/// OpenDPI error type
#[derive(Error, Debug)]
pub enum CoreError {
    /// Operation is not legal for the active pipeline topology
    #[error("topology violation: {0}")]
    TopologyViolation(String),

    /// Parameter outside its valid range
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration the engine cannot apply while live
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Call not legal in the current lifecycle state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Thread spawn, allocation or pinning failure
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Hardware facade failure
    #[error("hardware error: {0}")]
    Hardware(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for the OpenDPI runtime
pub type CoreResult<T> = Result<T, CoreError>;
