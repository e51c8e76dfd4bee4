//! The record store: typed records and secondary indexes over a KV
//! transaction.
//!
//! A `RecordStore` is opened per transaction and scoped to a subspace. Its
//! key layout, under the store subspace:
//!
//! | Space | Key | Value |
//! |---|---|---|
//! | `(0,)` | store header | JSON [`StoreHeader`] |
//! | `(1, pk…)` | record | packed `(type_name, payload)` |
//! | `(2, index_key, …)` | index data | maintainer-defined |
//! | `(3, index_key, bound…)` | index build ranges | bound bytes |
//! | `(4, index_key)` | index state | single byte |
//!
//! Saving a record applies the maintainers of the indexes covering its
//! type. For a readable index that is unconditional. For a write-only
//! (building) index the built-range set gates it: a key inside a built
//! range is maintained here, a key in unbuilt territory is left for the
//! builder — between the two, every record reaches a non-idempotent
//! maintainer exactly once.

use crate::error::{Error, Result};
use crate::index::{maintainer_for, IndexMaintainer, IndexMeta, IndexState};
use crate::kv::{KeyValue, KvTransaction, RangeOptions};
use crate::range_set::RangeSet;
use crate::record::{Record, RecordMetaData};
use crate::subspace::Subspace;
use crate::tuple::{key_after, Tuple, TupleValue, TupleRange};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

const HEADER_SPACE: i64 = 0;
const RECORD_SPACE: i64 = 1;
const INDEX_SPACE: i64 = 2;
const INDEX_RANGE_SPACE: i64 = 3;
const INDEX_STATE_SPACE: i64 = 4;

const STORE_FORMAT_VERSION: u32 = 1;

/// Persisted store header
#[derive(Debug, Serialize, Deserialize)]
struct StoreHeader {
    format_version: u32,
    metadata_version: u64,
}

/// Options for a record scan
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanProperties {
    /// Maximum rows the cursor will return; `None` for no bound
    pub limit: Option<usize>,
    /// Scan in descending primary-key order
    pub reverse: bool,
}

impl ScanProperties {
    /// Forward scan returning at most `limit` rows
    pub fn limited(limit: usize) -> Self {
        ScanProperties {
            limit: Some(limit),
            reverse: false,
        }
    }
}

/// The subspace holding an index's build-range bookkeeping, derivable
/// without opening a store
pub fn index_range_subspace_of(store_subspace: &Subspace, index: &IndexMeta) -> Subspace {
    store_subspace.subspace(
        &Tuple::from_elements([
            TupleValue::Int(INDEX_RANGE_SPACE),
            TupleValue::Int(index.subspace_key),
        ]),
    )
}

/// A record store bound to one transaction
#[derive(Clone, Debug)]
pub struct RecordStore<T: KvTransaction> {
    tx: T,
    subspace: Subspace,
    metadata: Arc<RecordMetaData>,
}

impl<T: KvTransaction> RecordStore<T> {
    /// Open the store, creating its header on first use and verifying the
    /// metadata version on every later open
    pub async fn open(tx: T, subspace: Subspace, metadata: Arc<RecordMetaData>) -> Result<Self> {
        let header_key = subspace.pack(&Tuple::int(HEADER_SPACE));
        match tx.get(&header_key).await? {
            Some(bytes) => {
                let header: StoreHeader = serde_json::from_slice(&bytes)?;
                if header.metadata_version != metadata.version {
                    return Err(Error::metadata_mismatch(format!(
                        "store has metadata version {} but {} was given",
                        header.metadata_version, metadata.version
                    )));
                }
            }
            None => {
                let header = StoreHeader {
                    format_version: STORE_FORMAT_VERSION,
                    metadata_version: metadata.version,
                };
                tx.set(&header_key, &serde_json::to_vec(&header)?).await?;
            }
        }
        Ok(RecordStore {
            tx,
            subspace,
            metadata,
        })
    }

    /// The transaction this store runs in
    pub fn transaction(&self) -> &T {
        &self.tx
    }

    /// The metadata this store was opened with
    pub fn metadata(&self) -> &Arc<RecordMetaData> {
        &self.metadata
    }

    fn record_subspace(&self) -> Subspace {
        self.subspace.subspace(&Tuple::int(RECORD_SPACE))
    }

    /// The subspace holding an index's data
    pub fn index_subspace(&self, index: &IndexMeta) -> Subspace {
        self.subspace.subspace(&Tuple::from_elements([
            TupleValue::Int(INDEX_SPACE),
            TupleValue::Int(index.subspace_key),
        ]))
    }

    /// The subspace holding an index's build-range bookkeeping
    pub fn index_range_subspace(&self, index: &IndexMeta) -> Subspace {
        index_range_subspace_of(&self.subspace, index)
    }

    fn index_state_key(&self, index: &IndexMeta) -> Vec<u8> {
        self.subspace.pack(&Tuple::from_elements([
            TupleValue::Int(INDEX_STATE_SPACE),
            TupleValue::Int(index.subspace_key),
        ]))
    }

    /// The maintainer for an index, bound to this store's transaction
    pub fn index_maintainer(&self, index: &IndexMeta) -> Box<dyn IndexMaintainer> {
        maintainer_for(index, self.tx.clone(), self.index_subspace(index))
    }

    /// Current lifecycle state of an index; absent means `Disabled`
    pub async fn index_state(&self, index: &IndexMeta) -> Result<IndexState> {
        match self.tx.get(&self.index_state_key(index)).await? {
            None => Ok(IndexState::Disabled),
            Some(bytes) if bytes.len() == 1 => IndexState::from_byte(bytes[0]),
            Some(_) => Err(Error::corrupt("index state is not a single byte")),
        }
    }

    /// Whether the index is in the write-only (building) state
    pub async fn is_index_write_only(&self, index: &IndexMeta) -> Result<bool> {
        Ok(self.index_state(index).await? == IndexState::WriteOnly)
    }

    /// Put an index into the write-only state, from any state. This is the
    /// entry point of a build (and of a rebuild of a readable index).
    pub async fn enable_index_write_only(&self, index: &IndexMeta) -> Result<()> {
        self.tx
            .set(
                &self.index_state_key(index),
                &[IndexState::WriteOnly.to_byte()],
            )
            .await
    }

    /// Flip a write-only index to readable. Returns `false` if the index is
    /// already readable (another actor won the flip); errors if the index
    /// is disabled.
    pub async fn mark_index_readable(&self, index: &IndexMeta) -> Result<bool> {
        match self.index_state(index).await? {
            IndexState::Readable => Ok(false),
            IndexState::WriteOnly => {
                self.tx
                    .set(
                        &self.index_state_key(index),
                        &[IndexState::Readable.to_byte()],
                    )
                    .await?;
                tracing::info!(index = %index.name, "index marked readable");
                Ok(true)
            }
            IndexState::Disabled => Err(Error::invalid_index(format!(
                "cannot mark disabled index {} readable",
                index.name
            ))),
        }
    }

    /// Remove every data entry of an index (not its build-range bookkeeping)
    pub async fn clear_index_data(&self, index: &IndexMeta) -> Result<()> {
        let (begin, end) = self.index_subspace(index).range();
        self.tx.clear_range(&begin, &end).await
    }

    fn record_value(record: &Record) -> Vec<u8> {
        Tuple::from_elements([
            TupleValue::String(record.record_type.clone()),
            TupleValue::Bytes(record.payload.clone()),
        ])
        .pack()
    }

    fn decode_record(&self, row: &KeyValue, record_subspace: &Subspace) -> Result<Record> {
        let primary_key = record_subspace.unpack(&row.key)?;
        let value = Tuple::unpack(&row.value)?;
        match value.elements() {
            [TupleValue::String(record_type), TupleValue::Bytes(payload)] => Ok(Record {
                primary_key,
                record_type: record_type.clone(),
                payload: payload.clone(),
            }),
            _ => Err(Error::corrupt("malformed record value")),
        }
    }

    /// Save a record and run the maintainers of every non-disabled index
    /// covering its type
    pub async fn save_record(&self, record: &Record) -> Result<()> {
        let type_meta = self.metadata.record_type(&record.record_type).ok_or_else(|| {
            Error::invalid_record(format!("unknown record type {}", record.record_type))
        })?;
        if let Some(type_key) = type_meta.type_key {
            if record.primary_key.elements().first() != Some(&TupleValue::Int(type_key)) {
                return Err(Error::invalid_record(format!(
                    "record of type {} must have primary key starting with {}",
                    record.record_type, type_key
                )));
            }
        }

        let old = self.load_record(&record.primary_key).await?;
        let key = self.record_subspace().pack(&record.primary_key);
        self.tx.set(&key, &Self::record_value(record)).await?;

        for index in &self.metadata.indexes {
            if !index.record_types.contains(&record.record_type) {
                continue;
            }
            match self.index_state(index).await? {
                IndexState::Disabled => continue,
                IndexState::WriteOnly => {
                    // While a build is in flight, only keys inside already
                    // built ranges are maintained here; the builder covers
                    // the rest exactly once.
                    let range_set = RangeSet::new(self.index_range_subspace(index));
                    if !range_set.contains(&self.tx, &record.primary_key).await? {
                        continue;
                    }
                }
                IndexState::Readable => {}
            }
            let maintainer = self.index_maintainer(index);
            maintainer.update(old.as_ref(), Some(record)).await?;
        }
        Ok(())
    }

    /// Load a record by primary key
    pub async fn load_record(&self, primary_key: &Tuple) -> Result<Option<Record>> {
        let record_subspace = self.record_subspace();
        let key = record_subspace.pack(primary_key);
        match self.tx.get(&key).await? {
            None => Ok(None),
            Some(value) => {
                let row = KeyValue {
                    key,
                    value,
                };
                Ok(Some(self.decode_record(&row, &record_subspace)?))
            }
        }
    }

    /// Open a cursor over records with primary keys in `range`.
    ///
    /// `continuation` resumes a prior scan strictly after (before, when
    /// reversed) the record it names. Rows come back in key order; the scan
    /// is serializable like every read in the transaction.
    pub fn scan_records(
        &self,
        range: &TupleRange,
        continuation: Option<&[u8]>,
        properties: ScanProperties,
    ) -> RecordCursor<T> {
        let record_subspace = self.record_subspace();
        let (mut lo, mut hi) = range.to_key_range(record_subspace.key());
        if let Some(cont) = continuation {
            let mut resumed = record_subspace.key().to_vec();
            resumed.extend_from_slice(cont);
            if properties.reverse {
                hi = resumed;
            } else {
                lo = key_after(&resumed);
            }
        }
        RecordCursor {
            store: self.clone(),
            record_subspace,
            lo,
            hi,
            reverse: properties.reverse,
            remaining: properties.limit,
            buffer: VecDeque::new(),
            fetch_done: false,
            limit_hit: false,
            last_pk_bytes: None,
        }
    }
}

/// Cursor page size when the caller did not bound the scan
const CURSOR_PAGE: usize = 256;

/// Streaming record cursor
pub struct RecordCursor<T: KvTransaction> {
    store: RecordStore<T>,
    record_subspace: Subspace,
    lo: Vec<u8>,
    hi: Vec<u8>,
    reverse: bool,
    remaining: Option<usize>,
    buffer: VecDeque<KeyValue>,
    fetch_done: bool,
    limit_hit: bool,
    last_pk_bytes: Option<Vec<u8>>,
}

impl<T: KvTransaction> RecordCursor<T> {
    /// The next record, or `None` when the scan is exhausted or the row
    /// limit was reached
    pub async fn next(&mut self) -> Result<Option<Record>> {
        if self.remaining == Some(0) {
            return Ok(None);
        }
        if self.buffer.is_empty() && !self.fetch_done {
            self.fill().await?;
        }
        let Some(row) = self.buffer.pop_front() else {
            return Ok(None);
        };
        let record = self.store.decode_record(&row, &self.record_subspace)?;
        self.last_pk_bytes = Some(record.primary_key.pack());
        if let Some(remaining) = &mut self.remaining {
            *remaining -= 1;
            if *remaining == 0 && (!self.buffer.is_empty() || !self.fetch_done) {
                self.limit_hit = true;
            }
        }
        Ok(Some(record))
    }

    /// Opaque resume point, present only when the cursor stopped at its row
    /// limit with rows possibly left in range
    pub fn continuation(&self) -> Option<Vec<u8>> {
        if self.limit_hit {
            self.last_pk_bytes.clone()
        } else {
            None
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let batch = self.remaining.unwrap_or(CURSOR_PAGE).min(CURSOR_PAGE);
        if batch == 0 || self.lo >= self.hi {
            self.fetch_done = true;
            return Ok(());
        }
        let rows = self
            .store
            .tx
            .get_range(
                &self.lo,
                &self.hi,
                RangeOptions {
                    limit: Some(batch),
                    reverse: self.reverse,
                },
            )
            .await?;
        if rows.len() < batch {
            self.fetch_done = true;
        }
        if let Some(last) = rows.last() {
            if self.reverse {
                self.hi = last.key.clone();
            } else {
                self.lo = key_after(&last.key);
            }
        }
        self.buffer.extend(rows);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{read_count, IndexKind};
    use crate::kv::{KvDatabase, TransactionPriority};
    use crate::memory::MemoryDatabase;
    use crate::record::RecordTypeMeta;

    fn test_metadata() -> Arc<RecordMetaData> {
        Arc::new(
            RecordMetaData::new(1)
                .with_record_type(RecordTypeMeta::with_prefix("order", 10))
                .with_record_type(RecordTypeMeta::with_prefix("shipment", 11))
                .with_index(IndexMeta::new("order_count", 1, IndexKind::Count, ["order"])),
        )
    }

    fn store_subspace() -> Subspace {
        Subspace::from_tuple(&Tuple::int(99))
    }

    fn order(id: i64) -> Record {
        Record::new(Tuple::int(10).with(id), "order", format!("order-{id}"))
    }

    async fn open(db: &MemoryDatabase) -> RecordStore<crate::memory::MemoryTransaction> {
        let tx = db.begin(TransactionPriority::Default).await.unwrap();
        RecordStore::open(tx, store_subspace(), test_metadata())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let db = MemoryDatabase::new();
        let store = open(&db).await;
        store.save_record(&order(1)).await.unwrap();
        store.transaction().commit().await.unwrap();

        let store = open(&db).await;
        let loaded = store.load_record(&Tuple::int(10).with(1i64)).await.unwrap();
        assert_eq!(loaded.unwrap().payload, b"order-1");
    }

    #[tokio::test]
    async fn test_metadata_version_checked() {
        let db = MemoryDatabase::new();
        let store = open(&db).await;
        store.transaction().commit().await.unwrap();

        let tx = db.begin(TransactionPriority::Default).await.unwrap();
        let newer = Arc::new(RecordMetaData::new(2));
        let err = RecordStore::open(tx, store_subspace(), newer)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MetaDataMismatch(_)));
    }

    #[tokio::test]
    async fn test_type_prefix_enforced() {
        let db = MemoryDatabase::new();
        let store = open(&db).await;
        let stray = Record::new(Tuple::int(42).with(1i64), "order", "x");
        assert!(store.save_record(&stray).await.is_err());
    }

    #[tokio::test]
    async fn test_write_only_maintenance_gated_by_built_ranges() {
        let db = MemoryDatabase::new();
        let store = open(&db).await;
        let index = store.metadata().index("order_count").unwrap().clone();
        store.enable_index_write_only(&index).await.unwrap();

        // Nothing is built yet: saves land in unbuilt territory and are
        // left for the builder.
        store.save_record(&order(1)).await.unwrap();
        assert_eq!(
            read_count(store.transaction(), &store.index_subspace(&index))
                .await
                .unwrap(),
            0
        );

        // Mark the high half of the key space built; a save there is
        // maintained immediately.
        let range_set = RangeSet::new(store.index_range_subspace(&index));
        range_set
            .insert(
                store.transaction(),
                Some(&Tuple::int(10).with(5i64)),
                None,
            )
            .await
            .unwrap();
        store.save_record(&order(7)).await.unwrap();
        store.save_record(&order(2)).await.unwrap();
        assert_eq!(
            read_count(store.transaction(), &store.index_subspace(&index))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_readable_index_always_maintained() {
        let db = MemoryDatabase::new();
        let store = open(&db).await;
        let index = store.metadata().index("order_count").unwrap().clone();
        store.enable_index_write_only(&index).await.unwrap();
        store.mark_index_readable(&index).await.unwrap();

        store.save_record(&order(1)).await.unwrap();
        assert_eq!(
            read_count(store.transaction(), &store.index_subspace(&index))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_scan_order_limit_and_continuation() {
        let db = MemoryDatabase::new();
        let store = open(&db).await;
        for id in 0..10i64 {
            store.save_record(&order(id)).await.unwrap();
        }
        store.transaction().commit().await.unwrap();

        let store = open(&db).await;
        let mut cursor =
            store.scan_records(&TupleRange::all(), None, ScanProperties::limited(4));
        let mut ids = Vec::new();
        while let Some(record) = cursor.next().await.unwrap() {
            ids.push(record.primary_key.elements()[1].clone());
        }
        assert_eq!(ids.len(), 4);
        let continuation = cursor.continuation().expect("limit was hit");

        let mut cursor = store.scan_records(
            &TupleRange::all(),
            Some(&continuation),
            ScanProperties::default(),
        );
        let mut rest = 0;
        while let Some(record) = cursor.next().await.unwrap() {
            assert_eq!(record.record_type, "order");
            rest += 1;
        }
        assert_eq!(rest, 6);
        assert!(cursor.continuation().is_none());
    }

    #[tokio::test]
    async fn test_reverse_scan_finds_last() {
        let db = MemoryDatabase::new();
        let store = open(&db).await;
        for id in 0..5i64 {
            store.save_record(&order(id)).await.unwrap();
        }
        let mut cursor = store.scan_records(
            &TupleRange::all(),
            None,
            ScanProperties {
                limit: Some(1),
                reverse: true,
            },
        );
        let last = cursor.next().await.unwrap().unwrap();
        assert_eq!(last.primary_key, Tuple::int(10).with(4i64));
    }

    #[tokio::test]
    async fn test_mark_readable_transitions() {
        let db = MemoryDatabase::new();
        let store = open(&db).await;
        let index = store.metadata().index("order_count").unwrap().clone();

        assert!(store.mark_index_readable(&index).await.is_err());
        store.enable_index_write_only(&index).await.unwrap();
        assert!(store.mark_index_readable(&index).await.unwrap());
        assert!(!store.mark_index_readable(&index).await.unwrap());
        assert_eq!(
            store.index_state(&index).await.unwrap(),
            IndexState::Readable
        );
    }
}
