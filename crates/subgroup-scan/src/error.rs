use crate::capability::SubgroupOperations;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("device lacks required subgroup operations (required {required:?}, supported {supported:?})")]
    CapabilityUnsupported {
        required: SubgroupOperations,
        supported: SubgroupOperations,
    },
    #[error("no usable compute device: {0}")]
    DeviceUnavailable(String),
    #[error("inconsistent device capabilities: {0}")]
    InconsistentCapabilities(String),
    #[error("failed to allocate a {bytes} byte device buffer: {reason}")]
    AllocationFailure { bytes: u64, reason: String },
    #[error("dispatch failed: {0}")]
    DispatchFailure(String),
    #[error("hierarchy needs {depth} levels, more than the allowed {max_depth}")]
    HierarchyDepthExceeded { depth: usize, max_depth: u32 },
    #[error("input of {len} elements does not fit 32-bit indexing")]
    InputTooLarge { len: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unable to read configuration file")]
    ConfigRead(#[from] std::io::Error),
    #[error("unable to parse configuration file")]
    ConfigParse(#[from] serde_json::Error),
}

impl Error {
    /// Whether starting the whole call again from fresh input may succeed.
    ///
    /// Inputs are read-only for the duration of a call, so a call that failed
    /// while executing is idempotent to retry from scratch. It is never resumed
    /// mid-hierarchy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DispatchFailure(_))
    }
}
