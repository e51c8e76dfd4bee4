//! Persistent set of built primary-key ranges.
//!
//! The range set is the sole coordination point between concurrent
//! builders: it lives inside the KV store, under the index's range
//! subspace, and is only ever touched inside transactions. Each entry is a
//! key holding the range's begin bound and a value holding its end bound.
//!
//! Bounds are raw "bound bytes": a packed primary-key tuple, or the
//! sentinel `0x00` for unbounded-below / `0xFF` for unbounded-above.
//! Lexicographic byte order on bound bytes equals primary-key order, with
//! the sentinels at the extremes, so all the interval arithmetic here is
//! plain byte comparison. Tuples appear only at the API surface.
//!
//! Invariants at every commit boundary: entries are pairwise disjoint, and
//! inserting merges with any overlapping or adjacent entries in the same
//! transaction.

use crate::error::Result;
use crate::kv::{KvTransaction, RangeOptions};
use crate::subspace::Subspace;
use crate::tuple::{key_after, Tuple, BOUND_MAX, BOUND_MIN};
use std::collections::VecDeque;

/// Encode an optional begin bound as bound bytes
pub fn begin_bound(tuple: Option<&Tuple>) -> Vec<u8> {
    match tuple {
        None => vec![BOUND_MIN],
        Some(t) => t.pack(),
    }
}

/// Encode an optional end bound as bound bytes
pub fn end_bound(tuple: Option<&Tuple>) -> Vec<u8> {
    match tuple {
        None => vec![BOUND_MAX],
        Some(t) => t.pack(),
    }
}

fn decode_bound(bytes: &[u8]) -> Result<Option<Tuple>> {
    if bytes == [BOUND_MIN] || bytes == [BOUND_MAX] {
        return Ok(None);
    }
    Ok(Some(Tuple::unpack(bytes)?))
}

/// The built-range set of one index
#[derive(Debug, Clone)]
pub struct RangeSet {
    subspace: Subspace,
}

impl RangeSet {
    /// A range set stored under the given subspace
    pub fn new(subspace: Subspace) -> Self {
        RangeSet { subspace }
    }

    fn entry_key(&self, bound: &[u8]) -> Vec<u8> {
        let mut key = self.subspace.key().to_vec();
        key.extend_from_slice(bound);
        key
    }

    fn bound_of(&self, key: &[u8]) -> Vec<u8> {
        key[self.subspace.key().len()..].to_vec()
    }

    /// Insert `[begin, end)`. Returns `true` iff the set changed, i.e. the
    /// range was not already fully covered. Overlapping and adjacent
    /// entries are read and rewritten as one merged entry in the same
    /// transaction.
    pub async fn insert<T: KvTransaction>(
        &self,
        tx: &T,
        begin: Option<&Tuple>,
        end: Option<&Tuple>,
    ) -> Result<bool> {
        self.insert_bounds(tx, begin_bound(begin), end_bound(end))
            .await
    }

    /// Raw-bounds form of [`RangeSet::insert`]
    pub async fn insert_bounds<T: KvTransaction>(
        &self,
        tx: &T,
        begin: Vec<u8>,
        end: Vec<u8>,
    ) -> Result<bool> {
        if begin >= end {
            return Ok(false);
        }

        let mut new_begin = begin.clone();
        let mut new_end = end.clone();
        let mut covered_to = begin.clone();
        let mut changed = false;
        let mut doomed: Vec<Vec<u8>> = Vec::new();

        // The nearest entry at or before `begin` may cover into the range.
        let (space_begin, _) = self.subspace.range();
        let pred = tx
            .get_range(
                &space_begin,
                &key_after(&self.entry_key(&begin)),
                RangeOptions::reverse_limited(1),
            )
            .await?;
        if let Some(entry) = pred.first() {
            if entry.value >= begin {
                let entry_begin = self.bound_of(&entry.key);
                if entry_begin < new_begin {
                    new_begin = entry_begin;
                }
                if entry.value > covered_to {
                    covered_to = entry.value.clone();
                }
                if entry.value > new_end {
                    new_end = entry.value.clone();
                }
                doomed.push(entry.key.clone());
            }
        }

        // Entries beginning inside (begin, end]; the one starting exactly at
        // `end` is adjacent and merges too.
        let overlapping = tx
            .get_range(
                &key_after(&self.entry_key(&begin)),
                &key_after(&self.entry_key(&end)),
                RangeOptions::default(),
            )
            .await?;
        for entry in &overlapping {
            let entry_begin = self.bound_of(&entry.key);
            if entry_begin > covered_to {
                changed = true;
            }
            if entry.value > covered_to {
                covered_to = entry.value.clone();
            }
            if entry.value > new_end {
                new_end = entry.value.clone();
            }
            doomed.push(entry.key.clone());
        }
        if covered_to < end {
            changed = true;
        }
        if !changed {
            return Ok(false);
        }

        for key in &doomed {
            tx.clear(key).await?;
        }
        tx.set(&self.entry_key(&new_begin), &new_end).await?;
        Ok(true)
    }

    /// Whether `key` lies inside a built range.
    ///
    /// This is the write path's question: a record saved into a built range
    /// must be maintained immediately, one saved into an unbuilt range is
    /// left for the builder to pick up.
    pub async fn contains<T: KvTransaction>(&self, tx: &T, key: &Tuple) -> Result<bool> {
        let bound = key.pack();
        let (space_begin, _) = self.subspace.range();
        let pred = tx
            .get_range(
                &space_begin,
                &key_after(&self.entry_key(&bound)),
                RangeOptions::reverse_limited(1),
            )
            .await?;
        Ok(pred.first().is_some_and(|entry| entry.value > bound))
    }

    /// Stream the complement of the set within `[begin, end)` as disjoint
    /// ranges in ascending order. Inserts may be interleaved with iteration
    /// in the same transaction.
    pub fn missing_ranges<T: KvTransaction>(
        &self,
        tx: T,
        begin: Option<&Tuple>,
        end: Option<&Tuple>,
    ) -> MissingRanges<T> {
        let begin = begin_bound(begin);
        let end = end_bound(end);
        MissingRanges {
            tx,
            subspace: self.subspace.clone(),
            fetch_from: key_after(&self.entry_key(&begin)),
            pos: begin,
            end,
            buffer: VecDeque::new(),
            entries_done: false,
            primed: false,
            done: false,
        }
    }

    /// Remove every entry
    pub async fn clear<T: KvTransaction>(&self, tx: &T) -> Result<()> {
        let (begin, end) = self.subspace.range();
        tx.clear_range(&begin, &end).await?;
        Ok(())
    }
}

/// How many entries a missing-ranges scan reads per batch
const MISSING_BATCH: usize = 32;

/// Streaming complement query over a [`RangeSet`]
pub struct MissingRanges<T: KvTransaction> {
    tx: T,
    subspace: Subspace,
    /// Uncovered cursor, in bound bytes
    pos: Vec<u8>,
    end: Vec<u8>,
    /// Absolute key the next entry batch starts from
    fetch_from: Vec<u8>,
    buffer: VecDeque<(Vec<u8>, Vec<u8>)>,
    entries_done: bool,
    primed: bool,
    done: bool,
}

impl<T: KvTransaction> MissingRanges<T> {
    fn entry_key(&self, bound: &[u8]) -> Vec<u8> {
        let mut key = self.subspace.key().to_vec();
        key.extend_from_slice(bound);
        key
    }

    /// The next missing range, ascending; `None` when the query is drained
    pub async fn next(&mut self) -> Result<Option<(Option<Tuple>, Option<Tuple>)>> {
        if self.done {
            return Ok(None);
        }
        if !self.primed {
            self.primed = true;
            // An entry at or before the query begin may cover a prefix.
            let (space_begin, _) = self.subspace.range();
            let pred = self
                .tx
                .get_range(
                    &space_begin,
                    &key_after(&self.entry_key(&self.pos.clone())),
                    RangeOptions::reverse_limited(1),
                )
                .await?;
            if let Some(entry) = pred.first() {
                if entry.value > self.pos {
                    self.pos = entry.value.clone();
                }
            }
            if self.pos >= self.end {
                self.done = true;
                return Ok(None);
            }
        }
        loop {
            if self.buffer.is_empty() && !self.entries_done {
                let fetch_to = self.entry_key(&self.end.clone());
                let rows = self
                    .tx
                    .get_range(
                        &self.fetch_from,
                        &fetch_to,
                        RangeOptions::limited(MISSING_BATCH),
                    )
                    .await?;
                if rows.len() < MISSING_BATCH {
                    self.entries_done = true;
                }
                if let Some(last) = rows.last() {
                    self.fetch_from = key_after(&last.key);
                }
                let prefix_len = self.subspace.key().len();
                for row in rows {
                    self.buffer
                        .push_back((row.key[prefix_len..].to_vec(), row.value));
                }
            }
            match self.buffer.pop_front() {
                Some((entry_begin, entry_end)) => {
                    if entry_begin > self.pos {
                        let gap_begin = std::mem::replace(&mut self.pos, entry_end);
                        let gap = (decode_bound(&gap_begin)?, decode_bound(&entry_begin)?);
                        if self.pos >= self.end {
                            self.done = true;
                        }
                        return Ok(Some(gap));
                    }
                    if entry_end > self.pos {
                        self.pos = entry_end;
                    }
                    if self.pos >= self.end {
                        self.done = true;
                        return Ok(None);
                    }
                }
                None => {
                    self.done = true;
                    if self.pos < self.end {
                        return Ok(Some((
                            decode_bound(&self.pos)?,
                            decode_bound(&self.end)?,
                        )));
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Drain the query into a vector
    pub async fn into_vec(mut self) -> Result<Vec<(Option<Tuple>, Option<Tuple>)>> {
        let mut out = Vec::new();
        while let Some(range) = self.next().await? {
            out.push(range);
        }
        Ok(out)
    }
}
