//! # Keystone DB Indexer
//!
//! Online secondary-index builder for Keystone DB.
//!
//! Builds an index over an existing record collection while the collection
//! keeps serving reads and writes. The build runs across many short
//! batch-priority transactions; a persistent set of already-built
//! primary-key ranges, kept inside the store, coordinates any number of
//! concurrent builders so that every record is applied to the index exactly
//! once — the guarantee non-idempotent maintainers need.
//!
//! This crate provides:
//! - [`RangeSet`]: the transactional built-range bookkeeping
//! - [`OnlineIndexBuilder`]: chunked build driver, adaptive retry
//!   controller, endpoint priming, and a single-transaction rebuild for
//!   small stores
//! - [`BuildOptions`] / [`BuildStats`]: configuration and progress counters
//!
//! ## Example
//!
//! ```ignore
//! use keystone_db_indexer::{BuildOptions, OnlineIndexBuilder};
//!
//! let builder = OnlineIndexBuilder::new(db, subspace, metadata, "new_index", BuildOptions::default())?;
//! builder.build_index(true).await?;
//! ```

pub mod config;
pub mod error;
pub mod online;
pub mod stats;

pub use config::{
    BuildOptions, DEFAULT_LIMIT, DEFAULT_MAX_RETRIES, DEFAULT_RECORDS_PER_SECOND, UNLIMITED,
};
pub use error::{building_readable, capacity_code, range_built, IndexerError, Result};
pub use online::OnlineIndexBuilder;
pub use stats::BuildStats;

// The built-range set lives in the core crate so the record store's write
// path can consult it; re-exported here because it is this crate's
// coordination primitive.
pub use keystone_db_core::range_set::{MissingRanges, RangeSet};
