//! End-to-end online build scenarios against the in-memory KV database.

use keystone_db_core::index::read_count;
use keystone_db_core::kv::{KvDatabase, KvTransaction, TransactionPriority};
use keystone_db_core::memory::{Fault, MemoryDatabase, MemoryTransaction};
use keystone_db_core::{
    codes, IndexKind, IndexMeta, IndexState, Record, RecordMetaData, RecordStore, RecordTypeMeta,
    Subspace, Tuple,
};
use keystone_db_indexer::{building_readable, BuildOptions, OnlineIndexBuilder, RangeSet, UNLIMITED};
use std::sync::Arc;

const ORDER_PREFIX: i64 = 10;
const SHIPMENT_PREFIX: i64 = 11;
const INVOICE_PREFIX: i64 = 12;

fn test_metadata() -> Arc<RecordMetaData> {
    Arc::new(
        RecordMetaData::new(1)
            .with_record_type(RecordTypeMeta::with_prefix("order", ORDER_PREFIX))
            .with_record_type(RecordTypeMeta::with_prefix("shipment", SHIPMENT_PREFIX))
            .with_record_type(RecordTypeMeta::with_prefix("invoice", INVOICE_PREFIX))
            .with_index(IndexMeta::new("order_count", 1, IndexKind::Count, ["order"]))
            .with_index(IndexMeta::new(
                "billing_count",
                2,
                IndexKind::Count,
                ["order", "invoice"],
            )),
    )
}

struct Fixture {
    db: Arc<MemoryDatabase>,
    subspace: Subspace,
    metadata: Arc<RecordMetaData>,
}

impl Fixture {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        Fixture {
            db: Arc::new(MemoryDatabase::new()),
            subspace: Subspace::from_tuple(&Tuple::int(1)),
            metadata: test_metadata(),
        }
    }

    async fn open_store(&self) -> RecordStore<MemoryTransaction> {
        let tx = self
            .db
            .begin(TransactionPriority::Default)
            .await
            .unwrap();
        RecordStore::open(tx, self.subspace.clone(), Arc::clone(&self.metadata))
            .await
            .unwrap()
    }

    fn order(&self, id: i64) -> Record {
        Record::new(
            Tuple::int(ORDER_PREFIX).with(id),
            "order",
            format!("order-{id}"),
        )
    }

    /// Save `count` order records, with the indexes still disabled: this is
    /// the pre-existing backlog an online build has to cover.
    async fn populate_orders(&self, count: i64) {
        let store = self.open_store().await;
        for id in 0..count {
            store.save_record(&self.order(id)).await.unwrap();
        }
        store.transaction().commit().await.unwrap();
    }

    async fn enable_write_only(&self, index_name: &str) {
        let store = self.open_store().await;
        let index = self.metadata.index(index_name).unwrap().clone();
        store.enable_index_write_only(&index).await.unwrap();
        store.transaction().commit().await.unwrap();
    }

    fn builder(&self, index_name: &str, options: BuildOptions) -> OnlineIndexBuilder<MemoryDatabase> {
        OnlineIndexBuilder::new(
            Arc::clone(&self.db),
            self.subspace.clone(),
            Arc::clone(&self.metadata),
            index_name,
            options,
        )
        .unwrap()
    }

    async fn count_value(&self, index_name: &str) -> i64 {
        let store = self.open_store().await;
        let index = self.metadata.index(index_name).unwrap();
        read_count(store.transaction(), &store.index_subspace(index))
            .await
            .unwrap()
    }

    async fn index_state(&self, index_name: &str) -> IndexState {
        let store = self.open_store().await;
        let index = self.metadata.index(index_name).unwrap();
        store.index_state(index).await.unwrap()
    }

    async fn missing_ranges(&self, index_name: &str) -> Vec<(Option<Tuple>, Option<Tuple>)> {
        let store = self.open_store().await;
        let index = self.metadata.index(index_name).unwrap();
        let set = RangeSet::new(store.index_range_subspace(index));
        set.missing_ranges(store.transaction().clone(), None, None)
            .into_vec()
            .await
            .unwrap()
    }

    fn fast_options() -> BuildOptions {
        BuildOptions::default()
            .with_records_per_second(UNLIMITED)
            .with_delays_ms(1, 20)
    }
}

#[tokio::test]
async fn test_empty_store_builds_and_flips_readable() {
    let fx = Fixture::new();
    fx.enable_write_only("order_count").await;

    let builder = fx.builder("order_count", Fixture::fast_options());
    builder.build_index(true).await.unwrap();

    assert_eq!(fx.index_state("order_count").await, IndexState::Readable);
    assert!(fx.missing_ranges("order_count").await.is_empty());
    assert_eq!(builder.stats().records_indexed(), 0);
    assert_eq!(fx.count_value("order_count").await, 0);
}

#[tokio::test]
async fn test_build_chunks_through_backlog() {
    let fx = Fixture::new();
    fx.populate_orders(250).await;
    fx.enable_write_only("order_count").await;

    let builder = fx.builder("order_count", Fixture::fast_options().with_limit(100));
    builder.build_index(true).await.unwrap();

    assert_eq!(builder.stats().records_indexed(), 250);
    assert_eq!(builder.stats().records_scanned(), 250);
    assert_eq!(fx.count_value("order_count").await, 250);
    assert!(fx.missing_ranges("order_count").await.is_empty());
    assert_eq!(fx.index_state("order_count").await, IndexState::Readable);
    // The limit never shrank: no capacity errors were hit.
    assert_eq!(builder.current_limit(), 100);
}

#[tokio::test]
async fn test_capacity_errors_shrink_limit_and_build_completes() {
    let fx = Fixture::new();
    fx.populate_orders(1000).await;
    fx.enable_write_only("order_count").await;

    // The first two commits carrying a chunk-sized mutation set fail as too
    // large; endpoint and state transactions are far below the threshold.
    fx.db
        .inject_fault(Fault::abort(codes::TRANSACTION_TOO_LARGE, 2, 60));

    let builder = fx.builder("order_count", Fixture::fast_options().with_limit(100));
    builder.build_index(true).await.unwrap();

    // 100 -> 75 -> 56, and the shrunken limit sticks.
    assert_eq!(builder.current_limit(), 56);
    // Aborted attempts are rescanned, but each record's effect lands once.
    assert_eq!(fx.count_value("order_count").await, 1000);
    assert!(builder.stats().records_indexed() >= 1000);
    assert!(fx.missing_ranges("order_count").await.is_empty());
    assert_eq!(fx.index_state("order_count").await, IndexState::Readable);
}

#[tokio::test]
async fn test_two_concurrent_builders_apply_each_record_once() {
    let fx = Fixture::new();
    fx.populate_orders(500).await;
    fx.enable_write_only("order_count").await;

    // A finite rate limit makes both builders yield between chunks so their
    // transactions genuinely interleave (50 rows at 25k/s sleeps 2ms).
    let options = BuildOptions::default()
        .with_records_per_second(25_000)
        .with_limit(50)
        .with_delays_ms(1, 20);
    let a = fx.builder("order_count", options.clone());
    let b = fx.builder("order_count", options);

    let (ra, rb) = tokio::join!(a.build_index(true), b.build_index(true));
    ra.unwrap();
    rb.unwrap();

    // The count index is not idempotent: a double-applied record would show
    // up here.
    assert_eq!(fx.count_value("order_count").await, 500);
    assert!(fx.missing_ranges("order_count").await.is_empty());
    assert_eq!(fx.index_state("order_count").await, IndexState::Readable);
    // Between them the builders saw every record at least once.
    let indexed = a.stats().records_indexed() + b.stats().records_indexed();
    assert!(indexed >= 500);
}

#[tokio::test]
async fn test_build_range_twice_is_noop() {
    let fx = Fixture::new();
    fx.populate_orders(300).await;
    fx.enable_write_only("order_count").await;

    let builder = fx.builder("order_count", Fixture::fast_options().with_limit(100));
    let begin = Some(Tuple::int(ORDER_PREFIX).with(100i64));
    let end = Some(Tuple::int(ORDER_PREFIX).with(200i64));

    builder.build_range(begin.clone(), end.clone()).await.unwrap();
    assert_eq!(builder.stats().records_indexed(), 100);
    assert_eq!(fx.count_value("order_count").await, 100);

    // Everything in the window is covered now; the second call finds no
    // missing ranges and changes nothing.
    builder.build_range(begin, end).await.unwrap();
    assert_eq!(builder.stats().records_indexed(), 100);
    assert_eq!(fx.count_value("order_count").await, 100);
}

#[tokio::test]
async fn test_ambiguous_commit_detected_via_built_range() {
    let fx = Fixture::new();
    fx.populate_orders(10).await;
    fx.enable_write_only("order_count").await;

    // The chunk transaction commits, but its result is reported unknown.
    // The retry's range-set insert is then a no-op, which is how the
    // builder learns the previous attempt actually went through.
    fx.db
        .inject_fault(Fault::commit_anyway(codes::COMMIT_UNKNOWN_RESULT, 1, 5));

    let builder = fx.builder(
        "order_count",
        Fixture::fast_options().with_max_retries(5),
    );
    builder
        .build_range(
            Some(Tuple::int(ORDER_PREFIX).with(0i64)),
            Some(Tuple::int(ORDER_PREFIX).with(10i64)),
        )
        .await
        .unwrap();

    // One committed pass plus one abandoned rescan.
    assert_eq!(builder.stats().records_scanned(), 20);
    assert_eq!(fx.count_value("order_count").await, 10);
    // Only the requested window is covered.
    assert_eq!(
        fx.missing_ranges("order_count").await,
        vec![
            (None, Some(Tuple::int(ORDER_PREFIX).with(0i64))),
            (Some(Tuple::int(ORDER_PREFIX).with(10i64)), None),
        ],
    );
}

#[tokio::test]
async fn test_single_record_store() {
    let fx = Fixture::new();
    fx.populate_orders(1).await;
    fx.enable_write_only("order_count").await;

    let builder = fx.builder("order_count", Fixture::fast_options());
    builder.build_index(true).await.unwrap();

    // The endpoint ranges alone cover a one-record store.
    assert_eq!(fx.count_value("order_count").await, 1);
    assert!(fx.missing_ranges("order_count").await.is_empty());
    assert_eq!(fx.index_state("order_count").await, IndexState::Readable);
}

#[tokio::test]
async fn test_records_outside_type_set_are_scanned_not_indexed() {
    let fx = Fixture::new();
    // Shipments sit between orders and invoices in the key space, inside
    // the billing index's records range but outside its type set.
    {
        let store = fx.open_store().await;
        for id in 0..5i64 {
            store.save_record(&fx.order(id)).await.unwrap();
            store
                .save_record(&Record::new(
                    Tuple::int(SHIPMENT_PREFIX).with(id),
                    "shipment",
                    "s",
                ))
                .await
                .unwrap();
            store
                .save_record(&Record::new(
                    Tuple::int(INVOICE_PREFIX).with(id),
                    "invoice",
                    "i",
                ))
                .await
                .unwrap();
        }
        store.transaction().commit().await.unwrap();
    }
    fx.enable_write_only("billing_count").await;

    let builder = fx.builder("billing_count", Fixture::fast_options());
    builder.build_index(true).await.unwrap();

    assert_eq!(builder.stats().records_scanned(), 15);
    assert_eq!(builder.stats().records_indexed(), 10);
    assert_eq!(fx.count_value("billing_count").await, 10);
}

#[tokio::test]
async fn test_build_index_rerun_is_noop() {
    let fx = Fixture::new();
    fx.populate_orders(80).await;
    fx.enable_write_only("order_count").await;

    let builder = fx.builder("order_count", Fixture::fast_options());
    builder.build_index(false).await.unwrap();
    assert_eq!(fx.count_value("order_count").await, 80);
    let indexed = builder.stats().records_indexed();

    // Still write-only, fully covered: the rerun finds nothing to do.
    builder.build_index(false).await.unwrap();
    assert_eq!(builder.stats().records_indexed(), indexed);
    assert_eq!(fx.count_value("order_count").await, 80);

    builder.build_index(true).await.unwrap();
    assert_eq!(fx.index_state("order_count").await, IndexState::Readable);
    assert_eq!(fx.count_value("order_count").await, 80);
}

#[tokio::test]
async fn test_rebuild_in_one_transaction_then_online_noop() {
    let fx = Fixture::new();
    fx.populate_orders(50).await;
    fx.enable_write_only("order_count").await;

    let builder = fx.builder("order_count", Fixture::fast_options().with_limit(16));
    {
        let store = fx.open_store().await;
        builder.rebuild_index(&store).await.unwrap();
        store.transaction().commit().await.unwrap();
    }
    assert_eq!(fx.count_value("order_count").await, 50);
    assert!(fx.missing_ranges("order_count").await.is_empty());

    // The online path finds everything already covered.
    builder.build_index(true).await.unwrap();
    assert_eq!(fx.count_value("order_count").await, 50);
    assert_eq!(fx.index_state("order_count").await, IndexState::Readable);
}

#[tokio::test]
async fn test_building_readable_index_fails_fast() {
    let fx = Fixture::new();
    fx.populate_orders(20).await;
    fx.enable_write_only("order_count").await;
    {
        let store = fx.open_store().await;
        let index = fx.metadata.index("order_count").unwrap().clone();
        store.mark_index_readable(&index).await.unwrap();
        store.transaction().commit().await.unwrap();
    }

    let builder = fx.builder("order_count", Fixture::fast_options());
    let err = builder.build_index(false).await.unwrap_err();
    assert!(building_readable(&err));
    // Nothing was applied to the index.
    assert_eq!(fx.count_value("order_count").await, 0);
}

#[tokio::test]
async fn test_writes_during_write_only_phase_count_once() {
    let fx = Fixture::new();
    fx.populate_orders(40).await;
    fx.enable_write_only("order_count").await;

    // A writer lands new records while the index is write-only but before
    // any range is built: save-time maintenance defers to the builder, so
    // the count index sees nothing yet.
    {
        let store = fx.open_store().await;
        for id in 40..50i64 {
            store.save_record(&fx.order(id)).await.unwrap();
        }
        store.transaction().commit().await.unwrap();
    }
    assert_eq!(fx.count_value("order_count").await, 0);

    let builder = fx.builder("order_count", Fixture::fast_options());
    builder.build_index(true).await.unwrap();
    assert_eq!(fx.count_value("order_count").await, 50);
    assert_eq!(fx.index_state("order_count").await, IndexState::Readable);

    // Appends past the last key land in the built high endpoint region and
    // are maintained at write time.
    {
        let store = fx.open_store().await;
        store.save_record(&fx.order(50)).await.unwrap();
        store.transaction().commit().await.unwrap();
    }
    assert_eq!(fx.count_value("order_count").await, 51);
}
