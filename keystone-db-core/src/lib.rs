//! # Keystone DB Core
//!
//! Ordered key-value substrate and record-store layer for Keystone DB.
//!
//! This crate provides:
//! - Order-preserving tuple encoding for primary keys ([`tuple`])
//! - Byte-prefix namespaces ([`subspace`])
//! - Transactional KV trait seams ([`kv`]) and an in-memory implementation
//!   with serializable conflict checking and fault injection ([`memory`])
//! - Typed records, index metadata, and index maintainers ([`record`],
//!   [`index`])
//! - The persistent built-range set that coordinates index builds and
//!   gates write-time maintenance of building indexes ([`range_set`])
//! - The record store itself ([`store`])
//!
//! ## Design Principles
//!
//! 1. **Bytes are the contract**: every ordering guarantee reduces to
//!    lexicographic comparison of packed keys
//! 2. **Async at the KV seam only**: encoding and range arithmetic are
//!    synchronous
//! 3. **One transaction, one store**: a [`store::RecordStore`] is opened per
//!    transaction and never outlives it

pub mod error;
pub mod index;
pub mod kv;
pub mod memory;
pub mod range_set;
pub mod record;
pub mod store;
pub mod subspace;
pub mod tuple;

pub use error::{codes, Error, Result, CAPACITY_CODES};
pub use index::{IndexKind, IndexMaintainer, IndexMeta, IndexState};
pub use kv::{KeyValue, KvDatabase, KvTransaction, RangeOptions, TransactionPriority};
pub use memory::{Fault, FaultEffect, MemoryDatabase, MemoryTransaction};
pub use range_set::{MissingRanges, RangeSet};
pub use record::{Record, RecordMetaData, RecordTypeMeta};
pub use store::{index_range_subspace_of, RecordCursor, RecordStore, ScanProperties};
pub use subspace::Subspace;
pub use tuple::{
    key_after, prefix_successor, EndpointType, Tuple, TupleRange, TupleValue, BOUND_MAX, BOUND_MIN,
};
