//! Build progress counters.
//!
//! Shared through an `Arc` so callers can watch a build from outside while
//! it runs.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one build run
#[derive(Debug, Default)]
pub struct BuildStats {
    scanned: AtomicU64,
    indexed: AtomicU64,
}

impl BuildStats {
    /// Rows visited by chunk scans
    pub fn records_scanned(&self) -> u64 {
        self.scanned.load(Ordering::Relaxed)
    }

    /// Rows whose type was covered, i.e. maintainer invocations
    pub fn records_indexed(&self) -> u64 {
        self.indexed.load(Ordering::Relaxed)
    }

    pub(crate) fn record_scanned(&self) {
        self.scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_indexed(&self) {
        self.indexed.fetch_add(1, Ordering::Relaxed);
    }
}
