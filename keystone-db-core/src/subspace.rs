//! Byte-prefix namespaces over the KV key space.
//!
//! A `Subspace` scopes a family of keys under a common prefix, the way the
//! record store scopes records, index data, and index build ranges away from
//! each other. Keys inside a subspace are packed tuples appended to the
//! prefix, so raw byte order within a subspace equals tuple order.

use crate::error::{Error, Result};
use crate::tuple::{Tuple, BOUND_MAX, BOUND_MIN};

/// A keyspace prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subspace {
    prefix: Vec<u8>,
}

impl Subspace {
    /// Create a subspace from a raw prefix
    pub fn new(prefix: impl Into<Vec<u8>>) -> Self {
        Subspace {
            prefix: prefix.into(),
        }
    }

    /// Create a subspace whose prefix is a packed tuple
    pub fn from_tuple(tuple: &Tuple) -> Self {
        Subspace {
            prefix: tuple.pack(),
        }
    }

    /// A child subspace: this prefix extended by a packed tuple
    pub fn subspace(&self, tuple: &Tuple) -> Subspace {
        let mut prefix = self.prefix.clone();
        prefix.extend_from_slice(&tuple.pack());
        Subspace { prefix }
    }

    /// The raw prefix bytes
    pub fn key(&self) -> &[u8] {
        &self.prefix
    }

    /// The key for a tuple inside this subspace
    pub fn pack(&self, tuple: &Tuple) -> Vec<u8> {
        let packed = tuple.pack();
        let mut key = Vec::with_capacity(self.prefix.len() + packed.len());
        key.extend_from_slice(&self.prefix);
        key.extend_from_slice(&packed);
        key
    }

    /// Recover the tuple from a key in this subspace
    pub fn unpack(&self, key: &[u8]) -> Result<Tuple> {
        let suffix = key
            .strip_prefix(self.prefix.as_slice())
            .ok_or_else(|| Error::corrupt("key not in subspace"))?;
        Tuple::unpack(suffix)
    }

    /// Whether a key lies inside this subspace
    pub fn contains(&self, key: &[u8]) -> bool {
        key.starts_with(&self.prefix)
    }

    /// The `[begin, end)` key range spanning every key in this subspace
    pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
        let mut begin = self.prefix.clone();
        begin.push(BOUND_MIN);
        let mut end = self.prefix.clone();
        end.push(BOUND_MAX);
        (begin, end)
    }
}
