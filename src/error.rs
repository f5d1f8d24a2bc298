use thiserror::Error;

/// Error kinds for the metadata engine and cache-mapping core (spec §7).
///
/// Only [`CacheError::WouldBlock`] and [`CacheError::NoSpaceData`] are
/// retryable by a caller; every other variant is fatal to the transaction
/// or handle in progress.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("operation would block")]
    WouldBlock,

    #[error("data device exhausted: no free pool blocks")]
    NoSpaceData,

    #[error("metadata device exhausted: {0}")]
    NoSpaceMetadata(String),

    #[error("checksum validation failed for block {0}")]
    ChecksumFail(u64),

    #[error("block {0} read from wrong location (expected {1})")]
    LocationMismatch(u64, u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata is inconsistent after a failed commit: {0}")]
    ConsistencyFail(String),

    #[error("arena exhausted: {0}")]
    OutOfMemory(String),

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("not found")]
    NotFound,

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Whether a caller may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::WouldBlock | CacheError::NoSpaceData)
    }
}
