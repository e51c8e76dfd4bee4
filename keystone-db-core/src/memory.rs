//! In-memory transactional KV database.
//!
//! A `BTreeMap`-backed implementation of the KV traits with snapshot
//! isolation and serializable conflict checking: each transaction reads from
//! a snapshot taken at begin, tracks the key ranges it read, and commit
//! fails with [`codes::NOT_COMMITTED`] if any of those ranges intersect a
//! write committed after the snapshot. Intended for tests and embedded use;
//! the snapshot is a full clone, which is fine at those scales.
//!
//! Fault injection lets tests exercise the capacity-error paths: a
//! [`Fault`] makes a matching commit fail with a chosen code, optionally
//! applying the writes anyway (the "commit succeeded but the result was
//! lost" case).

use crate::error::{codes, Error, Result};
use crate::kv::{KeyValue, KvDatabase, KvTransaction, RangeOptions, TransactionPriority};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

/// What a matched fault does to the commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultEffect {
    /// Report failure and discard the writes
    Abort,
    /// Apply the writes, then report failure anyway
    CommitAnyway,
}

/// A planned commit failure
#[derive(Debug)]
pub struct Fault {
    /// Error code the failed commit will carry
    pub code: i32,
    /// How many matching commits to fail
    pub times: u32,
    /// Only match commits with at least this many mutations
    pub min_mutations: usize,
    /// Whether the writes land despite the reported failure
    pub effect: FaultEffect,
}

impl Fault {
    /// Abort the next `times` commits carrying at least `min_mutations`
    /// mutations with the given code
    pub fn abort(code: i32, times: u32, min_mutations: usize) -> Self {
        Fault {
            code,
            times,
            min_mutations,
            effect: FaultEffect::Abort,
        }
    }

    /// Apply the next matching commit but report it failed
    pub fn commit_anyway(code: i32, times: u32, min_mutations: usize) -> Self {
        Fault {
            code,
            times,
            min_mutations,
            effect: FaultEffect::CommitAnyway,
        }
    }
}

#[derive(Debug, Clone)]
enum Mutation {
    Set(Vec<u8>, Vec<u8>),
    Clear(Vec<u8>),
    ClearRange(Vec<u8>, Vec<u8>),
}

impl Mutation {
    fn written_range(&self) -> (Vec<u8>, Vec<u8>) {
        match self {
            Mutation::Set(k, _) | Mutation::Clear(k) => (k.clone(), key_successor(k)),
            Mutation::ClearRange(b, e) => (b.clone(), e.clone()),
        }
    }
}

#[derive(Debug)]
struct CommitRecord {
    version: u64,
    written: Vec<(Vec<u8>, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct Shared {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    version: u64,
    log: Vec<CommitRecord>,
}

/// In-memory KV database
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    shared: Arc<Mutex<Shared>>,
    faults: Arc<Mutex<Vec<Fault>>>,
}

impl MemoryDatabase {
    /// Create an empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan a commit failure; faults are consumed in insertion order
    pub fn inject_fault(&self, fault: Fault) {
        self.faults.lock().expect("lock poisoned").push(fault);
    }

    /// Number of committed keys, for test assertions
    pub fn len(&self) -> usize {
        self.shared.lock().expect("lock poisoned").data.len()
    }

    /// Whether the committed state is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvDatabase for MemoryDatabase {
    type Tx = MemoryTransaction;

    async fn begin(&self, priority: TransactionPriority) -> Result<Self::Tx> {
        let shared = self.shared.lock().expect("lock poisoned");
        Ok(MemoryTransaction {
            db: Arc::clone(&self.shared),
            faults: Arc::clone(&self.faults),
            state: Arc::new(Mutex::new(TxState {
                view: shared.data.clone(),
                mutations: Vec::new(),
                reads: Vec::new(),
                committed: false,
            })),
            read_version: shared.version,
            _priority: priority,
        })
    }
}

#[derive(Debug)]
struct TxState {
    /// Snapshot overlaid with this transaction's own writes
    view: BTreeMap<Vec<u8>, Vec<u8>>,
    mutations: Vec<Mutation>,
    reads: Vec<(Vec<u8>, Vec<u8>)>,
    committed: bool,
}

/// Transaction over a [`MemoryDatabase`]
#[derive(Debug, Clone)]
pub struct MemoryTransaction {
    db: Arc<Mutex<Shared>>,
    faults: Arc<Mutex<Vec<Fault>>>,
    state: Arc<Mutex<TxState>>,
    read_version: u64,
    _priority: TransactionPriority,
}

fn key_successor(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0x00);
    next
}

fn ranges_intersect(a: &(Vec<u8>, Vec<u8>), b: &(Vec<u8>, Vec<u8>)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

#[async_trait]
impl KvTransaction for MemoryTransaction {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.reads.push((key.to_vec(), key_successor(key)));
        Ok(state.view.get(key).cloned())
    }

    async fn get_range(
        &self,
        begin: &[u8],
        end: &[u8],
        options: RangeOptions,
    ) -> Result<Vec<KeyValue>> {
        let mut state = self.state.lock().expect("lock poisoned");
        if begin >= end {
            return Ok(Vec::new());
        }
        let range = (
            Bound::Included(begin.to_vec()),
            Bound::Excluded(end.to_vec()),
        );
        let rows: Vec<KeyValue> = if options.reverse {
            let iter = state.view.range(range).rev();
            match options.limit {
                Some(n) => iter.take(n),
                None => iter.take(usize::MAX),
            }
            .map(|(k, v)| KeyValue {
                key: k.clone(),
                value: v.clone(),
            })
            .collect()
        } else {
            let iter = state.view.range(range);
            match options.limit {
                Some(n) => iter.take(n),
                None => iter.take(usize::MAX),
            }
            .map(|(k, v)| KeyValue {
                key: k.clone(),
                value: v.clone(),
            })
            .collect()
        };

        // Conflict range: only the part of [begin, end) actually examined.
        let limit_hit = options.limit.is_some_and(|n| n > 0 && rows.len() == n);
        let examined = if !limit_hit {
            (begin.to_vec(), end.to_vec())
        } else if options.reverse {
            (rows.last().expect("nonempty").key.clone(), end.to_vec())
        } else {
            (
                begin.to_vec(),
                key_successor(&rows.last().expect("nonempty").key),
            )
        };
        state.reads.push(examined);
        Ok(rows)
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.view.insert(key.to_vec(), value.to_vec());
        state
            .mutations
            .push(Mutation::Set(key.to_vec(), value.to_vec()));
        Ok(())
    }

    async fn clear(&self, key: &[u8]) -> Result<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.view.remove(key);
        state.mutations.push(Mutation::Clear(key.to_vec()));
        Ok(())
    }

    async fn clear_range(&self, begin: &[u8], end: &[u8]) -> Result<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        let doomed: Vec<Vec<u8>> = state
            .view
            .range((
                Bound::Included(begin.to_vec()),
                Bound::Excluded(end.to_vec()),
            ))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            state.view.remove(&key);
        }
        state
            .mutations
            .push(Mutation::ClearRange(begin.to_vec(), end.to_vec()));
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.committed {
            return Err(Error::kv(
                codes::NOT_COMMITTED,
                "transaction already committed",
            ));
        }

        // Planned faults take precedence over conflict checking.
        let fault = {
            let mut faults = self.faults.lock().expect("lock poisoned");
            let matched = faults
                .iter_mut()
                .find(|f| f.times > 0 && state.mutations.len() >= f.min_mutations);
            match matched {
                Some(f) => {
                    f.times -= 1;
                    Some((f.code, f.effect))
                }
                None => None,
            }
        };

        let mut db = self.db.lock().expect("lock poisoned");
        if let Some((code, effect)) = fault {
            if effect == FaultEffect::CommitAnyway {
                apply(&mut db, &state.mutations);
            }
            state.committed = true;
            return Err(Error::kv(code, "injected commit failure"));
        }

        for record in db.log.iter().rev() {
            if record.version <= self.read_version {
                break;
            }
            for written in &record.written {
                if state.reads.iter().any(|read| ranges_intersect(read, written)) {
                    return Err(Error::kv(
                        codes::NOT_COMMITTED,
                        "transaction conflict: read range modified by a later commit",
                    ));
                }
            }
        }

        apply(&mut db, &state.mutations);
        state.committed = true;
        Ok(())
    }
}

fn apply(db: &mut Shared, mutations: &[Mutation]) {
    if mutations.is_empty() {
        return;
    }
    for mutation in mutations {
        match mutation {
            Mutation::Set(k, v) => {
                db.data.insert(k.clone(), v.clone());
            }
            Mutation::Clear(k) => {
                db.data.remove(k);
            }
            Mutation::ClearRange(b, e) => {
                let doomed: Vec<Vec<u8>> = db
                    .data
                    .range((Bound::Included(b.clone()), Bound::Excluded(e.clone())))
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in doomed {
                    db.data.remove(&key);
                }
            }
        }
    }
    db.version += 1;
    let written = mutations.iter().map(Mutation::written_range).collect();
    let version = db.version;
    db.log.push(CommitRecord { version, written });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_your_writes() {
        let db = MemoryDatabase::new();
        let tx = db.begin(TransactionPriority::Default).await.unwrap();
        tx.set(b"a", b"1").await.unwrap();
        assert_eq!(tx.get(b"a").await.unwrap(), Some(b"1".to_vec()));
        tx.commit().await.unwrap();

        let tx2 = db.begin(TransactionPriority::Default).await.unwrap();
        assert_eq!(tx2.get(b"a").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_range_read_limits_and_reverse() {
        let db = MemoryDatabase::new();
        let tx = db.begin(TransactionPriority::Default).await.unwrap();
        for i in 0u8..5 {
            tx.set(&[i], &[i]).await.unwrap();
        }
        tx.commit().await.unwrap();

        let tx = db.begin(TransactionPriority::Default).await.unwrap();
        let rows = tx
            .get_range(&[0], &[10], RangeOptions::limited(2))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, vec![0]);

        let rows = tx
            .get_range(&[0], &[10], RangeOptions::reverse_limited(1))
            .await
            .unwrap();
        assert_eq!(rows[0].key, vec![4]);
    }

    #[tokio::test]
    async fn test_conflict_detection() {
        let db = MemoryDatabase::new();
        let setup = db.begin(TransactionPriority::Default).await.unwrap();
        setup.set(b"counter", b"0").await.unwrap();
        setup.commit().await.unwrap();

        let a = db.begin(TransactionPriority::Default).await.unwrap();
        let b = db.begin(TransactionPriority::Default).await.unwrap();
        // Both read-modify-write the same key; the second commit must fail.
        let _ = a.get(b"counter").await.unwrap();
        let _ = b.get(b"counter").await.unwrap();
        a.set(b"counter", b"1").await.unwrap();
        b.set(b"counter", b"1").await.unwrap();
        a.commit().await.unwrap();
        let err = b.commit().await.unwrap_err();
        assert_eq!(err.code(), Some(codes::NOT_COMMITTED));
    }

    #[tokio::test]
    async fn test_blind_writes_do_not_conflict() {
        let db = MemoryDatabase::new();
        let a = db.begin(TransactionPriority::Default).await.unwrap();
        let b = db.begin(TransactionPriority::Default).await.unwrap();
        a.set(b"x", b"1").await.unwrap();
        b.set(b"y", b"2").await.unwrap();
        a.commit().await.unwrap();
        b.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_abort() {
        let db = MemoryDatabase::new();
        db.inject_fault(Fault::abort(codes::TRANSACTION_TOO_LARGE, 1, 0));

        let tx = db.begin(TransactionPriority::Default).await.unwrap();
        tx.set(b"a", b"1").await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert_eq!(err.code(), Some(codes::TRANSACTION_TOO_LARGE));

        // Writes were discarded, and the fault is spent.
        let tx = db.begin(TransactionPriority::Default).await.unwrap();
        assert_eq!(tx.get(b"a").await.unwrap(), None);
        tx.set(b"a", b"2").await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_commit_anyway() {
        let db = MemoryDatabase::new();
        db.inject_fault(Fault::commit_anyway(codes::COMMIT_UNKNOWN_RESULT, 1, 0));

        let tx = db.begin(TransactionPriority::Default).await.unwrap();
        tx.set(b"a", b"1").await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert_eq!(err.code(), Some(codes::COMMIT_UNKNOWN_RESULT));

        // The write landed even though the commit reported failure.
        let tx = db.begin(TransactionPriority::Default).await.unwrap();
        assert_eq!(tx.get(b"a").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_min_mutations_filter() {
        let db = MemoryDatabase::new();
        db.inject_fault(Fault::abort(codes::TRANSACTION_TOO_LARGE, 1, 3));

        // Two mutations: below the threshold, commits fine.
        let tx = db.begin(TransactionPriority::Default).await.unwrap();
        tx.set(b"a", b"1").await.unwrap();
        tx.set(b"b", b"1").await.unwrap();
        tx.commit().await.unwrap();

        // Three mutations: trips the fault.
        let tx = db.begin(TransactionPriority::Default).await.unwrap();
        tx.set(b"c", b"1").await.unwrap();
        tx.set(b"d", b"1").await.unwrap();
        tx.set(b"e", b"1").await.unwrap();
        assert!(tx.commit().await.is_err());
    }
}
