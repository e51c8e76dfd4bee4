//! Error types for the indexer.
//!
//! Failures keep their causal chain intact (`source()` links all the way
//! down to the KV error code), and classification walks that chain: the
//! retry controller looks for capacity codes, the build driver looks for
//! the range-already-built signal. Wrapping never hides either.

use keystone_db_core::tuple::Tuple;
use keystone_db_core::CAPACITY_CODES;
use std::error::Error as StdError;
use thiserror::Error;

/// Indexer errors
#[derive(Error, Debug)]
pub enum IndexerError {
    /// Error from keystone-db-core
    #[error("core error: {0}")]
    Core(#[from] keystone_db_core::Error),

    /// A range given as unbuilt contained subranges that had already been
    /// built. Expected under multi-builder concurrency, and after a commit
    /// whose result was unknown but in fact applied.
    #[error("range [{}, {}) was already built", fmt_bound(.begin), fmt_bound(.end))]
    RangeBuilt {
        /// Inclusive low bound of the attempted range
        begin: Option<Tuple>,
        /// Exclusive high bound of the attempted range
        end: Option<Tuple>,
    },

    /// The index is not in the write-only state; building it would corrupt
    /// served reads
    #[error("attempted to build readable index {index}")]
    BuildingReadableIndex {
        /// Name of the index
        index: String,
    },

    /// Invalid builder configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The retry budget ran out; the last failure is the source
    #[error("gave up after {tries} attempts")]
    RetriesExhausted {
        /// Attempts made before giving up
        tries: usize,
        /// The failure that ended the run
        #[source]
        source: Box<IndexerError>,
    },
}

/// Result type for indexer operations
pub type Result<T> = std::result::Result<T, IndexerError>;

fn fmt_bound(bound: &Option<Tuple>) -> String {
    match bound {
        None => "..".to_string(),
        Some(t) => t.to_string(),
    }
}

/// Walk the causal chain for a KV capacity code (the "do less work per
/// transaction" family)
pub fn capacity_code(err: &IndexerError) -> Option<i32> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(core_err) = e.downcast_ref::<keystone_db_core::Error>() {
            if let Some(code) = core_err.code() {
                if CAPACITY_CODES.contains(&code) {
                    return Some(code);
                }
            }
        }
        current = e.source();
    }
    None
}

/// Walk the causal chain for a range-already-built failure
pub fn range_built(err: &IndexerError) -> Option<(&Option<Tuple>, &Option<Tuple>)> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(IndexerError::RangeBuilt { begin, end }) = e.downcast_ref::<IndexerError>() {
            return Some((begin, end));
        }
        current = e.source();
    }
    None
}

/// Walk the causal chain for the readable-index guard tripping
pub fn building_readable(err: &IndexerError) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if matches!(
            e.downcast_ref::<IndexerError>(),
            Some(IndexerError::BuildingReadableIndex { .. })
        ) {
            return true;
        }
        current = e.source();
    }
    false
}
