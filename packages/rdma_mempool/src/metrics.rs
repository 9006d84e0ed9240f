//! Process-wide metrics of all memory pools, collected with `nm`.
//!
//! These complement the per-pool [`MempoolStats`][crate::MempoolStats] snapshot. Collect them
//! with `nm::Report::collect()`.

use nm::{Event, Magnitude};

/// Histogram buckets for granted block sizes in bytes.
///
/// The boundaries are the default size classes, so each bucket counts one class of a default
/// pool. Custom classes land in the nearest bucket above them.
const BLOCK_SIZE_BYTES_BUCKETS: &[Magnitude] = &[16_384, 65_536, 262_144, 1_048_576];

thread_local! {
    /// Blocks handed out, including segments of scatter/gather allocations.
    ///
    /// The magnitude is the granted block size in bytes.
    pub(crate) static BLOCKS_ALLOCATED_BYTES: Event = Event::builder()
        .name("rdma_mempool_blocks_allocated_bytes")
        .histogram(BLOCK_SIZE_BYTES_BUCKETS)
        .build();

    /// Blocks returned to their size class.
    pub(crate) static BLOCKS_RELEASED: Event = Event::builder()
        .name("rdma_mempool_blocks_released")
        .build();

    /// Allocations rejected because no size class was large enough.
    ///
    /// The magnitude is the requested length in bytes.
    pub(crate) static INVALID_SIZE_BYTES: Event = Event::builder()
        .name("rdma_mempool_invalid_size_bytes")
        .build();

    /// Allocations rejected because the size class was exhausted.
    ///
    /// The magnitude is the block size of the exhausted class in bytes.
    pub(crate) static OUT_OF_MEMORY_BYTES: Event = Event::builder()
        .name("rdma_mempool_out_of_memory_bytes")
        .histogram(BLOCK_SIZE_BYTES_BUCKETS)
        .build();

    /// Calls that returned an empty or inconsistent block descriptor.
    pub(crate) static MISUSE_FREES: Event = Event::builder()
        .name("rdma_mempool_misuse_frees")
        .build();

    /// Scatter/gather allocations that failed partway.
    ///
    /// The magnitude is the number of segments returned during the unwind.
    pub(crate) static GATHER_UNWOUND_SEGMENTS: Event = Event::builder()
        .name("rdma_mempool_gather_unwound_segments")
        .build();
}
