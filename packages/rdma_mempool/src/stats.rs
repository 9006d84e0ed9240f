//! Diagnostic counters of a memory pool.
//!
//! Every recorded occurrence is also observed on the process-wide `nm` events in
//! [`metrics`][crate::metrics], which aggregate across pools.
//!
//! All counters use `Relaxed` ordering. Individual counter values are eventually consistent
//! and a snapshot taken while other threads allocate may be transiently inconsistent across
//! counters. Do not use these values for allocation decisions.

use std::sync::atomic::{AtomicU64, Ordering};

use nm::Event;

use crate::metrics::{
    BLOCKS_ALLOCATED_BYTES, BLOCKS_RELEASED, GATHER_UNWOUND_SEGMENTS, INVALID_SIZE_BYTES,
    MISUSE_FREES, OUT_OF_MEMORY_BYTES,
};

/// A point-in-time snapshot of the counters of a [`Mempool`][crate::Mempool].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct MempoolStats {
    /// Blocks successfully handed out, including segments of scatter/gather allocations.
    pub allocations: u64,

    /// Blocks returned to their size class.
    pub releases: u64,

    /// Allocations rejected because no size class was large enough.
    pub invalid_size_failures: u64,

    /// Allocations rejected because the size class was exhausted.
    pub out_of_memory_failures: u64,

    /// Calls that returned an empty or inconsistent block descriptor.
    pub misuse_frees: u64,

    /// Scatter/gather allocations that failed partway and returned their earlier segments.
    pub gather_unwinds: u64,
}

impl MempoolStats {
    /// Blocks handed out and not yet returned, according to the counters.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.allocations.saturating_sub(self.releases)
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    allocations: AtomicU64,
    releases: AtomicU64,
    invalid_size_failures: AtomicU64,
    out_of_memory_failures: AtomicU64,
    misuse_frees: AtomicU64,
    gather_unwinds: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_allocation(&self, block_size: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        BLOCKS_ALLOCATED_BYTES.with(|e| e.observe(block_size));
    }

    pub(crate) fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        BLOCKS_RELEASED.with(Event::observe_once);
    }

    pub(crate) fn record_invalid_size(&self, requested: usize) {
        self.invalid_size_failures.fetch_add(1, Ordering::Relaxed);
        INVALID_SIZE_BYTES.with(|e| e.observe(requested));
    }

    pub(crate) fn record_out_of_memory(&self, block_size: usize) {
        self.out_of_memory_failures.fetch_add(1, Ordering::Relaxed);
        OUT_OF_MEMORY_BYTES.with(|e| e.observe(block_size));
    }

    pub(crate) fn record_misuse_free(&self) {
        self.misuse_frees.fetch_add(1, Ordering::Relaxed);
        MISUSE_FREES.with(Event::observe_once);
    }

    pub(crate) fn record_gather_unwind(&self, returned_segments: usize) {
        self.gather_unwinds.fetch_add(1, Ordering::Relaxed);
        GATHER_UNWOUND_SEGMENTS.with(|e| e.observe(returned_segments));
    }

    pub(crate) fn snapshot(&self) -> MempoolStats {
        MempoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            invalid_size_failures: self.invalid_size_failures.load(Ordering::Relaxed),
            out_of_memory_failures: self.out_of_memory_failures.load(Ordering::Relaxed),
            misuse_frees: self.misuse_frees.load(Ordering::Relaxed),
            gather_unwinds: self.gather_unwinds.load(Ordering::Relaxed),
        }
    }
}
