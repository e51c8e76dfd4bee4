//! Transactional ordered KV traits.
//!
//! These are the seams the record store and the index builder run against.
//! Implementations must provide serializable transactions with
//! read-your-writes semantics; they may retry transient failures internally,
//! but every surfaced failure must carry its numeric code (see
//! [`crate::error::codes`]) so callers can classify it.

use crate::error::Result;
use async_trait::async_trait;

/// Transaction scheduling priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionPriority {
    /// Normal priority
    #[default]
    Default,
    /// Lowest priority; yields to user traffic
    Batch,
}

/// Options for a range read
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeOptions {
    /// Maximum rows to return; `None` for no bound
    pub limit: Option<usize>,
    /// Return rows in descending key order, starting from the end
    pub reverse: bool,
}

impl RangeOptions {
    /// Forward read returning at most `limit` rows
    pub fn limited(limit: usize) -> Self {
        RangeOptions {
            limit: Some(limit),
            reverse: false,
        }
    }

    /// Reverse read returning at most `limit` rows
    pub fn reverse_limited(limit: usize) -> Self {
        RangeOptions {
            limit: Some(limit),
            reverse: true,
        }
    }
}

/// One row of a range read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// Raw key
    pub key: Vec<u8>,
    /// Raw value
    pub value: Vec<u8>,
}

/// A database that can begin transactions
#[async_trait]
pub trait KvDatabase: Send + Sync + 'static {
    /// The transaction type this database produces
    type Tx: KvTransaction;

    /// Begin a new transaction at the given priority
    async fn begin(&self, priority: TransactionPriority) -> Result<Self::Tx>;
}

/// A serializable transaction over the ordered key space.
///
/// Handles are cheaply cloneable; clones share the same transaction state.
/// Reads observe the transaction's own uncommitted writes.
#[async_trait]
pub trait KvTransaction: Clone + Send + Sync + 'static {
    /// Read a single key
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Read rows with keys in `[begin, end)`, in key order (descending when
    /// `options.reverse`), up to `options.limit` rows
    async fn get_range(&self, begin: &[u8], end: &[u8], options: RangeOptions)
        -> Result<Vec<KeyValue>>;

    /// Set a key to a value
    async fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove a key
    async fn clear(&self, key: &[u8]) -> Result<()>;

    /// Remove every key in `[begin, end)`
    async fn clear_range(&self, begin: &[u8], end: &[u8]) -> Result<()>;

    /// Commit the transaction. Failure means the writes did not apply,
    /// except for [`crate::error::codes::COMMIT_UNKNOWN_RESULT`], where the
    /// outcome is genuinely unknown and the caller must re-verify.
    async fn commit(&self) -> Result<()>;
}
