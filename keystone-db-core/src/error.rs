//! Error types for keystone-db-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric codes attached to KV-layer failures.
///
/// The codes in [`CAPACITY_CODES`] share one remedy: do less work per
/// transaction.
pub mod codes {
    /// Transaction ran out of its time budget.
    pub const TIMED_OUT: i32 = 1004;
    /// Read version is older than the storage layer can still serve.
    pub const TRANSACTION_TOO_OLD: i32 = 1007;
    /// Commit failed a serializable conflict check.
    pub const NOT_COMMITTED: i32 = 1020;
    /// Storage is lagging behind the commit pipeline.
    pub const PROCESS_BEHIND: i32 = 1031;
    /// Commit may or may not have been applied.
    pub const COMMIT_UNKNOWN_RESULT: i32 = 2002;
    /// Mutation set exceeded the per-transaction size limit.
    pub const TRANSACTION_TOO_LARGE: i32 = 2101;
}

/// Codes whose remedy is shrinking the per-transaction workload.
pub const CAPACITY_CODES: [i32; 6] = [
    codes::TIMED_OUT,
    codes::TRANSACTION_TOO_OLD,
    codes::NOT_COMMITTED,
    codes::PROCESS_BEHIND,
    codes::COMMIT_UNKNOWN_RESULT,
    codes::TRANSACTION_TOO_LARGE,
];

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    /// KV-layer failure carrying a numeric code
    #[error("kv error {code}: {message}")]
    Kv { code: i32, message: String },

    /// Store opened against different metadata than it was created with
    #[error("metadata mismatch: {0}")]
    MetaDataMismatch(String),

    /// Stored bytes failed to decode
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Invalid tuple encoding
    #[error("invalid tuple: {0}")]
    InvalidTuple(String),

    /// Unknown index or index in the wrong state for the operation
    #[error("invalid index: {0}")]
    InvalidIndex(String),

    /// Record rejected by the store
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Index maintainer failure
    #[error("maintainer error: {0}")]
    Maintainer(String),
}

impl Error {
    /// Create a KV error with the given code
    pub fn kv(code: i32, message: impl Into<String>) -> Self {
        Error::Kv {
            code,
            message: message.into(),
        }
    }

    /// Create a metadata mismatch error
    pub fn metadata_mismatch(msg: impl Into<String>) -> Self {
        Error::MetaDataMismatch(msg.into())
    }

    /// Create a corrupt data error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    /// Create an invalid tuple error
    pub fn invalid_tuple(msg: impl Into<String>) -> Self {
        Error::InvalidTuple(msg.into())
    }

    /// Create an invalid index error
    pub fn invalid_index(msg: impl Into<String>) -> Self {
        Error::InvalidIndex(msg.into())
    }

    /// Create an invalid record error
    pub fn invalid_record(msg: impl Into<String>) -> Self {
        Error::InvalidRecord(msg.into())
    }

    /// Create a maintainer error
    pub fn maintainer(msg: impl Into<String>) -> Self {
        Error::Maintainer(msg.into())
    }

    /// The KV error code, if this is a KV-layer failure
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Kv { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether this error's remedy is doing less work per transaction
    pub fn is_capacity(&self) -> bool {
        self.code().is_some_and(|c| CAPACITY_CODES.contains(&c))
    }
}
