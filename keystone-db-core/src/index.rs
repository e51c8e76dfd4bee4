//! Secondary index metadata, states, and maintainers.
//!
//! A maintainer applies one record's effect to the index's stored
//! representation. `Value` maintainers are idempotent (rewriting the same
//! entry is harmless); `Count` maintainers are not — they read-modify-write
//! an aggregate, so applying the same record twice corrupts the index.
//! The build machinery is designed around not letting that happen.

use crate::error::{Error, Result};
use crate::kv::KvTransaction;
use crate::record::Record;
use crate::subspace::Subspace;
use crate::tuple::{Tuple, TupleValue};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What kind of index this is, which selects its maintainer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// One entry per record keyed by payload then primary key
    Value,
    /// A single aggregate count of covered records
    Count,
}

/// Declared secondary index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    /// Index name, unique within the metadata
    pub name: String,
    /// Key under which this index's data and bookkeeping live
    pub subspace_key: i64,
    /// Maintainer selection
    pub kind: IndexKind,
    /// Names of the record types this index covers
    pub record_types: Vec<String>,
}

impl IndexMeta {
    /// Create an index over the given record types
    pub fn new(
        name: impl Into<String>,
        subspace_key: i64,
        kind: IndexKind,
        record_types: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        IndexMeta {
            name: name.into(),
            subspace_key,
            kind,
            record_types: record_types.into_iter().map(Into::into).collect(),
        }
    }
}

/// Lifecycle state of an index.
///
/// ```text
/// Disabled -> WriteOnly -> Readable
///                ^            |
///                +- rebuild --+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// Not maintained and not readable
    Disabled,
    /// Maintained on writes, not yet served to readers
    WriteOnly,
    /// Fully built and served
    Readable,
}

impl IndexState {
    /// Persistent single-byte form
    pub fn to_byte(self) -> u8 {
        match self {
            IndexState::Disabled => 0,
            IndexState::WriteOnly => 1,
            IndexState::Readable => 2,
        }
    }

    /// Decode the persistent form
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(IndexState::Disabled),
            1 => Ok(IndexState::WriteOnly),
            2 => Ok(IndexState::Readable),
            other => Err(Error::corrupt(format!("unknown index state {other}"))),
        }
    }
}

/// Applies record changes to an index's stored representation.
///
/// `old` is the record's previous version (`None` on insert and on initial
/// build); `new` is its current version (`None` on delete).
#[async_trait]
pub trait IndexMaintainer: Send + Sync {
    /// Apply one record transition to the index
    async fn update(&self, old: Option<&Record>, new: Option<&Record>) -> Result<()>;
}

/// Resolve the maintainer for an index over the given transaction
pub fn maintainer_for<T: KvTransaction>(
    index: &IndexMeta,
    tx: T,
    index_subspace: Subspace,
) -> Box<dyn IndexMaintainer> {
    match index.kind {
        IndexKind::Value => Box::new(ValueIndexMaintainer {
            tx,
            subspace: index_subspace,
        }),
        IndexKind::Count => Box::new(CountIndexMaintainer {
            tx,
            subspace: index_subspace,
        }),
    }
}

/// Entry-per-record index keyed by `(payload, primary key)`
pub struct ValueIndexMaintainer<T: KvTransaction> {
    tx: T,
    subspace: Subspace,
}

impl<T: KvTransaction> ValueIndexMaintainer<T> {
    fn entry_key(&self, record: &Record) -> Vec<u8> {
        let entry = Tuple::from_elements([TupleValue::Bytes(record.payload.clone())])
            .concat(&record.primary_key);
        self.subspace.pack(&entry)
    }
}

#[async_trait]
impl<T: KvTransaction> IndexMaintainer for ValueIndexMaintainer<T> {
    async fn update(&self, old: Option<&Record>, new: Option<&Record>) -> Result<()> {
        if let Some(old) = old {
            self.tx.clear(&self.entry_key(old)).await?;
        }
        if let Some(new) = new {
            self.tx.set(&self.entry_key(new), &[]).await?;
        }
        Ok(())
    }
}

/// Aggregate count of covered records.
///
/// The counter is read-modify-write, so this maintainer must see every
/// record exactly once.
pub struct CountIndexMaintainer<T: KvTransaction> {
    tx: T,
    subspace: Subspace,
}

impl<T: KvTransaction> CountIndexMaintainer<T> {
    fn decode(bytes: Option<Vec<u8>>) -> Result<i64> {
        match bytes {
            None => Ok(0),
            Some(b) => {
                let raw: [u8; 8] = b
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::corrupt("count index value is not 8 bytes"))?;
                Ok(i64::from_le_bytes(raw))
            }
        }
    }
}

#[async_trait]
impl<T: KvTransaction> IndexMaintainer for CountIndexMaintainer<T> {
    async fn update(&self, old: Option<&Record>, new: Option<&Record>) -> Result<()> {
        let delta = i64::from(new.is_some()) - i64::from(old.is_some());
        if delta == 0 {
            return Ok(());
        }
        let key = self.subspace.key().to_vec();
        let current = Self::decode(self.tx.get(&key).await?)?;
        self.tx
            .set(&key, &(current + delta).to_le_bytes())
            .await?;
        Ok(())
    }
}

/// Read a count index's current value; used by callers inspecting the index
pub async fn read_count<T: KvTransaction>(tx: &T, index_subspace: &Subspace) -> Result<i64> {
    CountIndexMaintainer::<T>::decode(tx.get(index_subspace.key()).await?)
}
