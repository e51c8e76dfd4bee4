//! Online index builder.
//!
//! Builds a secondary index while the record store keeps serving reads and
//! writes. The build walks the primary-key space in transaction-sized
//! chunks, at batch priority so user traffic preempts it, and records every
//! finished chunk in the index's [`RangeSet`]. That set is what coordinates
//! any number of builders running against the same index: a chunk whose
//! range-set insert reports no change was already built by someone else,
//! and the loser rescans for whatever is left. Because the chunk's
//! maintainer updates and its range-set insert commit atomically, no record
//! is ever applied to the index twice — which is what non-idempotent
//! maintainers such as counts require.
//!
//! The per-transaction row limit adapts: errors that mean "too much work in
//! one transaction" shrink it multiplicatively, and the shrunken value
//! sticks for the rest of the run.
//!
//! ```ignore
//! let builder = OnlineIndexBuilder::new(db, subspace, metadata, "by_payload", options)?;
//! builder.build_index(true).await?;
//! ```

use crate::config::{BuildOptions, UNLIMITED};
use crate::error::{building_readable, capacity_code, range_built, IndexerError, Result};
use crate::stats::BuildStats;
use futures::future::BoxFuture;
use futures::FutureExt;
use keystone_db_core::kv::{KvDatabase, KvTransaction, TransactionPriority};
use keystone_db_core::range_set::RangeSet;
use keystone_db_core::record::RecordMetaData;
use keystone_db_core::store::{index_range_subspace_of, RecordStore, ScanProperties};
use keystone_db_core::subspace::Subspace;
use keystone_db_core::tuple::{EndpointType, Tuple, TupleRange, BOUND_MAX, BOUND_MIN};
use keystone_db_core::IndexMeta;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Builds one index online, across many short transactions.
///
/// Holds the database handle, the store-opening info, the index identity,
/// the resolved record-type set, the immutable records range, and the
/// adaptive row limit. Cheap to share by reference across the async chain;
/// the limit is the only mutable state.
#[derive(Debug)]
pub struct OnlineIndexBuilder<D: KvDatabase> {
    db: Arc<D>,
    subspace: Subspace,
    metadata: Arc<RecordMetaData>,
    index: IndexMeta,
    record_types: Vec<String>,
    records_range: TupleRange,
    limit: AtomicUsize,
    max_retries: usize,
    records_per_second: usize,
    initial_delay_ms: u64,
    max_delay_ms: u64,
    stats: Arc<BuildStats>,
}

impl<D: KvDatabase> OnlineIndexBuilder<D> {
    /// Create a builder for the named index.
    ///
    /// The record-type set defaults to the types the index covers; naming a
    /// type the metadata lacks is a metadata mismatch. The records range is
    /// computed once: the minimal inclusive interval over the covered
    /// types' prefixes when every one of them has a prefix, the whole key
    /// space otherwise.
    pub fn new(
        db: Arc<D>,
        store_subspace: Subspace,
        metadata: Arc<RecordMetaData>,
        index_name: &str,
        options: BuildOptions,
    ) -> Result<Self> {
        options.validate()?;
        let index = metadata
            .index(index_name)
            .ok_or_else(|| {
                keystone_db_core::Error::metadata_mismatch(format!(
                    "index {index_name} not contained in the metadata"
                ))
            })?
            .clone();
        let record_types = match &options.record_types {
            None => index.record_types.clone(),
            Some(types) => {
                for name in types {
                    if metadata.record_type(name).is_none() {
                        return Err(keystone_db_core::Error::metadata_mismatch(format!(
                            "record type {name} not contained in the metadata"
                        ))
                        .into());
                    }
                }
                types.clone()
            }
        };
        let records_range = compute_records_range(&metadata, &record_types);
        Ok(OnlineIndexBuilder {
            db,
            subspace: store_subspace,
            metadata,
            index,
            record_types,
            records_range,
            limit: AtomicUsize::new(options.limit),
            max_retries: options.max_retries,
            records_per_second: options.records_per_second,
            initial_delay_ms: options.initial_delay_ms,
            max_delay_ms: options.max_delay_ms,
            stats: Arc::new(BuildStats::default()),
        })
    }

    /// The index being built
    pub fn index(&self) -> &IndexMeta {
        &self.index
    }

    /// The primary-key interval that could hold covered records
    pub fn records_range(&self) -> &TupleRange {
        &self.records_range
    }

    /// Progress counters for this run
    pub fn stats(&self) -> Arc<BuildStats> {
        Arc::clone(&self.stats)
    }

    /// The current (possibly shrunken) per-transaction row limit
    pub fn current_limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    async fn open_store(&self, tx: D::Tx) -> Result<RecordStore<D::Tx>> {
        Ok(RecordStore::open(tx, self.subspace.clone(), Arc::clone(&self.metadata)).await?)
    }

    fn shrink_limit(&self) -> usize {
        let shrunk = (3 * self.limit.load(Ordering::Relaxed) / 4).max(1);
        self.limit.store(shrunk, Ordering::Relaxed);
        shrunk
    }

    // ========================================================================
    // Retry controller
    // ========================================================================

    /// Run `f` against a freshly opened store in a batch-priority
    /// transaction, committing on success.
    ///
    /// Failures whose causal chain carries a capacity code shrink the row
    /// limit and retry after a jittered, exponentially growing delay; the
    /// shrunken limit sticks. Anything else surfaces immediately, as does
    /// an exhausted retry budget. Fails fast if the index is not
    /// write-only: building a readable index would corrupt served reads.
    pub async fn run_with_retry<'s, R, F>(&'s self, f: F) -> Result<R>
    where
        R: Send,
        F: Fn(RecordStore<D::Tx>) -> BoxFuture<'s, Result<R>> + Send + Sync,
    {
        let mut tries: usize = 0;
        let mut wait_ms = self.initial_delay_ms;
        loop {
            let attempt: Result<R> = async {
                let tx = self.db.begin(TransactionPriority::Batch).await?;
                let store = self.open_store(tx.clone()).await?;
                if !store.is_index_write_only(&self.index).await? {
                    return Err(IndexerError::BuildingReadableIndex {
                        index: self.index.name.clone(),
                    });
                }
                let value = f(store).await?;
                tx.commit().await?;
                Ok(value)
            }
            .await;
            let err = match attempt {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if tries >= self.max_retries {
                return Err(IndexerError::RetriesExhausted {
                    tries,
                    source: Box::new(err),
                });
            }
            let Some(code) = capacity_code(&err) else {
                return Err(err);
            };
            tries += 1;
            let limit = self.shrink_limit();
            tracing::info!(
                index = %self.index.name,
                code,
                limit,
                error = %err,
                "lessening limit of online index build"
            );
            let delay_ms = rand::thread_rng().gen_range(0..wait_ms.max(1));
            wait_ms = (wait_ms * 2).min(self.max_delay_ms);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    /// Like [`Self::run_with_retry`] but at default priority, without the
    /// write-only guard and without touching the limit. Used for the final
    /// readable flip, which happens precisely when the guard would trip.
    async fn run_plain<'s, R, F>(&'s self, f: F) -> Result<R>
    where
        R: Send,
        F: Fn(RecordStore<D::Tx>) -> BoxFuture<'s, Result<R>> + Send + Sync,
    {
        let mut tries: usize = 0;
        let mut wait_ms = self.initial_delay_ms;
        loop {
            let attempt: Result<R> = async {
                let tx = self.db.begin(TransactionPriority::Default).await?;
                let store = self.open_store(tx.clone()).await?;
                let value = f(store).await?;
                tx.commit().await?;
                Ok(value)
            }
            .await;
            let err = match attempt {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if tries >= self.max_retries || capacity_code(&err).is_none() {
                return Err(err);
            }
            tries += 1;
            let delay_ms = rand::thread_rng().gen_range(0..wait_ms.max(1));
            wait_ms = (wait_ms * 2).min(self.max_delay_ms);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    // ========================================================================
    // Chunk builder
    // ========================================================================

    /// Scan a bounded prefix of `range` inside the caller's transaction,
    /// applying the maintainer to every covered record in cursor order.
    ///
    /// Does not touch the range set. Returns the primary key of the first
    /// record not consumed (the resume point), or `None` when the range was
    /// empty or fully consumed.
    pub async fn build_range_only(
        &self,
        store: &RecordStore<D::Tx>,
        range: &TupleRange,
        respect_limit: bool,
    ) -> Result<Option<Tuple>> {
        if store.metadata().version != self.metadata.version {
            return Err(keystone_db_core::Error::metadata_mismatch(
                "store does not have the same metadata as the builder",
            )
            .into());
        }
        let maintainer = store.index_maintainer(&self.index);
        let limit = respect_limit.then(|| self.limit.load(Ordering::Relaxed));
        let mut cursor = store.scan_records(
            range,
            None,
            ScanProperties {
                limit,
                reverse: false,
            },
        );
        let mut empty = true;
        // Updates run one at a time, in cursor order. Some maintainers have
        // internal ordering dependencies that a wider pipeline would break.
        while let Some(record) = cursor.next().await? {
            empty = false;
            self.stats.record_scanned();
            if self.record_types.iter().any(|t| *t == record.record_type) {
                self.stats.record_indexed();
                maintainer.update(None, Some(&record)).await?;
            }
        }
        if empty {
            return Ok(None);
        }
        let Some(continuation) = cursor.continuation() else {
            return Ok(None);
        };
        let mut next_cursor =
            store.scan_records(range, Some(&continuation), ScanProperties::limited(1));
        Ok(next_cursor.next().await?.map(|r| r.primary_key))
    }

    // ========================================================================
    // Unbuilt-range transaction
    // ========================================================================

    /// Build one chunk of `[begin, end)` and record it in the range set,
    /// atomically.
    ///
    /// Requires the range to be unbuilt. If the range-set insert reports no
    /// change, some other actor (or an earlier commit of ours whose result
    /// was reported unknown) already covered it, and the transaction fails
    /// with [`IndexerError::RangeBuilt`] before anything commits.
    ///
    /// Returns the resume point: `end` itself when the chunk reached it.
    pub async fn build_unbuilt_range(
        &self,
        store: &RecordStore<D::Tx>,
        begin: Option<Tuple>,
        end: Option<Tuple>,
    ) -> Result<Option<Tuple>> {
        let range = TupleRange::between(begin.clone(), end.clone());
        let real_end = match self.build_range_only(store, &range, true).await? {
            Some(next) => Some(next),
            None => end.clone(),
        };
        let range_set = RangeSet::new(store.index_range_subspace(&self.index));
        let changed = range_set
            .insert(store.transaction(), begin.as_ref(), real_end.as_ref())
            .await?;
        if !changed {
            return Err(IndexerError::RangeBuilt { begin, end });
        }
        Ok(real_end)
    }

    /// Build every missing part of `[begin, end)` inside the caller's
    /// transaction, chunk by chunk, updating the range set as it goes.
    ///
    /// Fails if there is more work than fits in one transaction; the
    /// retry-looped [`Self::build_range`] handles that case.
    pub async fn build_range_in(
        &self,
        store: &RecordStore<D::Tx>,
        begin: Option<Tuple>,
        end: Option<Tuple>,
    ) -> Result<()> {
        let range_set = RangeSet::new(store.index_range_subspace(&self.index));
        let mut missing =
            range_set.missing_ranges(store.transaction().clone(), begin.as_ref(), end.as_ref());
        while let Some((gap_begin, gap_end)) = missing.next().await? {
            let mut current = gap_begin;
            loop {
                match self
                    .build_unbuilt_range(store, current.clone(), gap_end.clone())
                    .await
                {
                    Ok(real_end) => {
                        if real_end == gap_end {
                            break;
                        }
                        current = real_end;
                    }
                    Err(err) if range_built(&err).is_some() => {
                        // Within a single transaction nothing else can have
                        // covered the gap, but recovering costs nothing and
                        // keeps the multi-builder guarantee on this path too.
                        tracing::debug!(
                            index = %self.index.name,
                            "gap reported built inside transactional build, skipping"
                        );
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Endpoint primer
    // ========================================================================

    /// Mark the key-space regions that cannot hold covered records as
    /// built, build the two endpoint ranges, and return the interior still
    /// to be built (`None` when the store is empty or holds one record).
    ///
    /// Writers typically append past the last key, so the high endpoint
    /// range is the contended one; getting both endpoints out of the way in
    /// this short prelude lets the long interior build run without
    /// conflicting with appends.
    async fn build_endpoints_in(&self, store: &RecordStore<D::Tx>) -> Result<Option<TupleRange>> {
        let range_set = RangeSet::new(store.index_range_subspace(&self.index));
        if !self.records_range.is_all() {
            // No covered record can exist outside the records range.
            let (low, high) = self.records_range.bound_bytes();
            range_set
                .insert_bounds(store.transaction(), vec![BOUND_MIN], low)
                .await?;
            range_set
                .insert_bounds(store.transaction(), high, vec![BOUND_MAX])
                .await?;
        }

        let mut first_cursor =
            store.scan_records(&self.records_range, None, ScanProperties::limited(1));
        let Some(first) = first_cursor.next().await?.map(|r| r.primary_key) else {
            // No records at all: everything is trivially built.
            range_set
                .insert_bounds(store.transaction(), vec![BOUND_MIN], vec![BOUND_MAX])
                .await?;
            return Ok(None);
        };
        self.build_range_in(store, None, Some(first.clone())).await?;

        let mut last_cursor = store.scan_records(
            &self.records_range,
            None,
            ScanProperties {
                limit: Some(1),
                reverse: true,
            },
        );
        let Some(last) = last_cursor.next().await?.map(|r| r.primary_key) else {
            return Ok(None);
        };
        self.build_range_in(store, Some(last.clone()), None).await?;

        if first == last {
            Ok(None)
        } else {
            Ok(Some(TupleRange::between(Some(first), Some(last))))
        }
    }

    /// Retry-looped [`Self::build_endpoints_in`]
    pub async fn build_endpoints(&self) -> Result<Option<TupleRange>> {
        self.run_with_retry(|store| {
            async move { self.build_endpoints_in(&store).await }.boxed()
        })
        .await
    }

    // ========================================================================
    // Build driver
    // ========================================================================

    /// Build every missing part of `[begin, end)` across as many
    /// transactions as it takes, under the retry controller and the
    /// rate limit.
    pub async fn build_range(&self, begin: Option<Tuple>, end: Option<Tuple>) -> Result<()> {
        let range_set = RangeSet::new(index_range_subspace_of(&self.subspace, &self.index));
        let mut queue: VecDeque<(Option<Tuple>, Option<Tuple>)> = VecDeque::new();
        {
            let tx = self.db.begin(TransactionPriority::Batch).await?;
            let missing = range_set.missing_ranges(tx, begin.as_ref(), end.as_ref());
            queue.extend(missing.into_vec().await?);
        }

        while let Some((range_begin, range_end)) = queue.pop_front() {
            let begin_item = range_begin.clone();
            let end_item = range_end.clone();
            let result = self
                .run_with_retry(move |store| {
                    let begin = begin_item.clone();
                    let end = end_item.clone();
                    async move { self.build_unbuilt_range(&store, begin, end).await }.boxed()
                })
                .await;
            match result {
                Ok(real_end) => {
                    if real_end != range_end {
                        // Stopped at the row limit; the tail goes back on
                        // the queue.
                        queue.push_back((real_end, range_end));
                    }
                    self.rate_limit_sleep().await;
                }
                Err(err) if range_built(&err).is_some() => {
                    // Another actor made progress inside our interval;
                    // recompute what remains of it.
                    tracing::info!(
                        index = %self.index.name,
                        "range already built by another actor, requeueing what remains"
                    );
                    let tx = self.db.begin(TransactionPriority::Batch).await?;
                    let missing =
                        range_set.missing_ranges(tx, range_begin.as_ref(), range_end.as_ref());
                    queue.extend(missing.into_vec().await?);
                    self.rate_limit_sleep().await;
                }
                Err(err) if building_readable(&err) => {
                    // The index flipped readable under us. If our interval
                    // has nothing missing, a concurrent builder finished the
                    // whole job and the failure is vacuous.
                    if self
                        .nothing_missing(range_begin.as_ref(), range_end.as_ref())
                        .await?
                    {
                        tracing::debug!(
                            index = %self.index.name,
                            "index became readable with no work remaining"
                        );
                        continue;
                    }
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn nothing_missing(&self, begin: Option<&Tuple>, end: Option<&Tuple>) -> Result<bool> {
        let range_set = RangeSet::new(index_range_subspace_of(&self.subspace, &self.index));
        let tx = self.db.begin(TransactionPriority::Batch).await?;
        let mut missing = range_set.missing_ranges(tx, begin, end);
        Ok(missing.next().await?.is_none())
    }

    async fn rate_limit_sleep(&self) {
        if self.records_per_second == UNLIMITED {
            return;
        }
        let limit = self.limit.load(Ordering::Relaxed) as u64;
        let delay_ms = 1000 * limit / self.records_per_second as u64;
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    /// Build the whole index: prime the endpoints, pump the interior
    /// through the retry controller, and optionally flip the index
    /// readable at the end.
    pub async fn build_index(&self, mark_readable: bool) -> Result<()> {
        let start = Instant::now();
        tracing::info!(index = %self.index.name, "online index build starting");
        let interior = match self.build_endpoints().await {
            Ok(interior) => interior,
            Err(err) if building_readable(&err) => {
                // A concurrent builder may have finished the whole job and
                // flipped the index before we even started. With nothing
                // missing anywhere, there is no build left to do.
                if self.nothing_missing(None, None).await? {
                    tracing::debug!(
                        index = %self.index.name,
                        "index became readable before endpoint priming, nothing to build"
                    );
                    None
                } else {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        };
        if let Some(interior) = interior {
            self.build_range(interior.low.clone(), interior.high.clone())
                .await?;
        }
        if mark_readable {
            self.run_plain(|store| {
                async move {
                    store.mark_index_readable(&self.index).await?;
                    Ok(())
                }
                .boxed()
            })
            .await?;
        }
        tracing::info!(
            index = %self.index.name,
            duration_ms = start.elapsed().as_millis() as u64,
            records_scanned = self.stats.records_scanned(),
            records_indexed = self.stats.records_indexed(),
            "online index build complete"
        );
        Ok(())
    }

    // ========================================================================
    // Single-transaction rebuild
    // ========================================================================

    /// Clear and rebuild the index within the caller's transaction.
    ///
    /// Only fits small stores: there is no retry and no rate limit, and a
    /// store with too many records will simply fail to commit. Larger
    /// stores should use [`Self::build_index`].
    pub async fn rebuild_index(&self, store: &RecordStore<D::Tx>) -> Result<()> {
        store.clear_index_data(&self.index).await?;
        // The whole key space counts as built from here on: write-only
        // maintenance keeps the index current, and concurrent online
        // builders find no work to duplicate.
        let range_set = RangeSet::new(store.index_range_subspace(&self.index));
        range_set.clear(store.transaction()).await?;
        range_set
            .insert_bounds(store.transaction(), vec![BOUND_MIN], vec![BOUND_MAX])
            .await?;

        let mut range = self.records_range.clone();
        while let Some(next) = self.build_range_only(store, &range, true).await? {
            range = TupleRange {
                low: Some(next),
                high: range.high,
                low_endpoint: EndpointType::Inclusive,
                high_endpoint: range.high_endpoint,
            };
        }
        Ok(())
    }
}

fn compute_records_range(metadata: &RecordMetaData, record_types: &[String]) -> TupleRange {
    let mut low: Option<Tuple> = None;
    let mut high: Option<Tuple> = None;
    for name in record_types {
        let Some(type_key) = metadata.record_type(name).and_then(|t| t.type_key) else {
            // A type without a prefix can live anywhere in the key space.
            return TupleRange::all();
        };
        let prefix = Tuple::int(type_key);
        match (&mut low, &mut high) {
            (Some(lo), Some(hi)) => {
                if prefix < *lo {
                    *lo = prefix.clone();
                }
                if prefix > *hi {
                    *hi = prefix;
                }
            }
            _ => {
                low = Some(prefix.clone());
                high = Some(prefix);
            }
        }
    }
    match (low, high) {
        (Some(low), Some(high)) => TupleRange::between_inclusive(Some(low), Some(high)),
        _ => TupleRange::all(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_db_core::memory::MemoryDatabase;
    use keystone_db_core::record::RecordTypeMeta;
    use keystone_db_core::IndexKind;

    fn metadata() -> Arc<RecordMetaData> {
        Arc::new(
            RecordMetaData::new(1)
                .with_record_type(RecordTypeMeta::with_prefix("order", 10))
                .with_record_type(RecordTypeMeta::with_prefix("shipment", 14))
                .with_record_type(RecordTypeMeta::new("event"))
                .with_index(IndexMeta::new(
                    "by_payload",
                    1,
                    IndexKind::Value,
                    ["order", "shipment"],
                ))
                .with_index(IndexMeta::new("events", 2, IndexKind::Value, ["event"])),
        )
    }

    fn builder(options: BuildOptions) -> OnlineIndexBuilder<MemoryDatabase> {
        OnlineIndexBuilder::new(
            Arc::new(MemoryDatabase::new()),
            Subspace::from_tuple(&Tuple::int(1)),
            metadata(),
            "by_payload",
            options,
        )
        .unwrap()
    }

    #[test]
    fn test_records_range_spans_type_prefixes() {
        let b = builder(BuildOptions::default());
        let range = b.records_range();
        assert_eq!(range.low, Some(Tuple::int(10)));
        assert_eq!(range.high, Some(Tuple::int(14)));
        assert_eq!(range.high_endpoint, EndpointType::Inclusive);
    }

    #[test]
    fn test_records_range_falls_back_to_all() {
        let b = OnlineIndexBuilder::new(
            Arc::new(MemoryDatabase::new()),
            Subspace::from_tuple(&Tuple::int(1)),
            metadata(),
            "events",
            BuildOptions::default(),
        )
        .unwrap();
        assert!(b.records_range().is_all());
    }

    #[test]
    fn test_unknown_index_rejected() {
        let err = OnlineIndexBuilder::new(
            Arc::new(MemoryDatabase::new()),
            Subspace::from_tuple(&Tuple::int(1)),
            metadata(),
            "nope",
            BuildOptions::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("metadata"));
    }

    #[test]
    fn test_unknown_record_type_rejected() {
        let err = OnlineIndexBuilder::new(
            Arc::new(MemoryDatabase::new()),
            Subspace::from_tuple(&Tuple::int(1)),
            metadata(),
            "by_payload",
            BuildOptions::default().with_record_types(["mystery"]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("mystery"));
    }

    #[test]
    fn test_limit_shrinks_and_floors() {
        let b = builder(BuildOptions::default().with_limit(100));
        assert_eq!(b.shrink_limit(), 75);
        assert_eq!(b.shrink_limit(), 56);
        assert_eq!(b.shrink_limit(), 42);

        let b = builder(BuildOptions::default().with_limit(1));
        assert_eq!(b.shrink_limit(), 1);
    }
}
