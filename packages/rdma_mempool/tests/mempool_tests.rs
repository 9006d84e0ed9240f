//! Integration tests for the `rdma_mempool` package.
//!
//! These exercise the public API against the built-in slab sub-allocator, including exhaustion
//! of size classes, scatter/gather unwinding and sharing a pool between threads.

use std::num::NonZero;
use std::sync::Arc;
use std::thread;

use new_zealand::nz;
use rdma_mempool::{
    DropPolicy, Error, FreeOutcome, MemDesc, Mempool, MpMem, RegistrationKey,
    SlabCacheAllocator,
};

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

fn limited_pool(blocks_per_class: NonZero<usize>) -> Mempool {
    let allocator = SlabCacheAllocator::builder()
        .block_limit(blocks_per_class)
        .build();

    Mempool::builder().allocator(allocator).build().unwrap()
}

fn is_zeroed(block: &MpMem) -> bool {
    // SAFETY: The pool outlives this call and nobody else touches the block.
    unsafe { block.as_slice() }
        .unwrap()
        .iter()
        .all(|b| *b == 0)
}

#[test]
fn default_pool_has_transport_classes() {
    let pool = Mempool::new().unwrap();

    assert_eq!(
        pool.class_sizes().collect::<Vec<_>>(),
        [16 * KIB, 64 * KIB, 256 * KIB, MIB]
    );
    assert_eq!(pool.max_segments(), 32);
    assert_eq!(pool.name(), "rdma_mempool");

    pool.integrity_check();
}

#[test]
fn block_is_at_least_requested_and_zeroed() {
    let pool = Mempool::new().unwrap();

    for length in [0, 1, 4095, 16 * KIB, 50_000, 200_000, MIB] {
        let mut block = pool.alloc(length).unwrap();

        assert!(block.len() >= length);
        assert!(is_zeroed(&block));

        let address = block.address().unwrap();
        assert_eq!(address.addr() % 4096, 0, "block for {length} bytes is not page aligned");

        pool.free(&mut block);
    }
}

#[test]
fn distinct_blocks_do_not_overlap() {
    let pool = Mempool::new().unwrap();

    let mut blocks = (0..20)
        .map(|i| pool.alloc(i * 3000).unwrap())
        .collect::<Vec<_>>();

    let mut ranges = blocks
        .iter()
        .map(|b| {
            let start = b.address().unwrap().addr();
            (start, start + b.len())
        })
        .collect::<Vec<_>>();

    ranges.sort_unstable();

    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "blocks {pair:?} overlap");
    }

    for block in &mut blocks {
        assert_eq!(pool.free(block), FreeOutcome::Released);
    }

    assert_eq!(pool.outstanding_blocks(), 0);
}

#[test]
fn writes_do_not_leak_into_next_user() {
    let pool = Mempool::new().unwrap();

    let mut block = pool.alloc(64 * KIB).unwrap();

    // SAFETY: The pool is alive and nobody else touches the block.
    unsafe { block.as_mut_slice() }.unwrap().fill(0xA5);

    pool.free(&mut block);

    let mut block = pool.alloc(64 * KIB).unwrap();
    assert!(is_zeroed(&block));

    pool.free(&mut block);
}

#[test]
fn too_large_request_is_rejected() {
    let pool = Mempool::new().unwrap();

    let result = pool.alloc(MIB + 1);

    assert!(matches!(
        result,
        Err(Error::InvalidSize {
            requested,
            largest: MIB
        }) if requested == MIB + 1
    ));
    assert!(pool.resolve_class(MIB + 1).is_none());
    assert_eq!(pool.stats().invalid_size_failures, 1);
}

#[test]
fn exhausted_class_does_not_fall_back_to_larger_class() {
    let pool = limited_pool(nz!(2));

    let mut first = pool.alloc(100).unwrap();
    let mut second = pool.alloc(200).unwrap();

    let mut third = MpMem::new();
    let result = pool.alloc_into(300, &mut third);

    assert!(matches!(
        result,
        Err(Error::OutOfMemory { block_size }) if block_size == 16 * KIB
    ));
    assert!(third.is_empty());

    // The larger classes are unaffected.
    let mut larger = pool.alloc(20 * KIB).unwrap();
    assert_eq!(larger.len(), 64 * KIB);

    // Returning a block makes room again.
    pool.free(&mut first);
    pool.alloc_into(300, &mut third).unwrap();

    for block in [&mut second, &mut third, &mut larger] {
        pool.free(block);
    }

    assert_eq!(pool.stats().out_of_memory_failures, 1);
    assert_eq!(pool.outstanding_blocks(), 0);
}

#[test]
fn free_is_idempotent() {
    let pool = Mempool::new().unwrap();

    let mut block = pool.alloc(10).unwrap();

    assert_eq!(pool.free(&mut block), FreeOutcome::Released);

    for _ in 0..3 {
        let outcome = pool.free(&mut block);
        assert_eq!(outcome, FreeOutcome::AlreadyReleased);
        assert!(outcome.is_misuse());
    }

    // A descriptor that never held a block is reported differently.
    assert_eq!(pool.free(&mut MpMem::new()), FreeOutcome::AlreadyEmpty);

    assert_eq!(pool.outstanding_blocks(), 0);

    let stats = pool.stats();
    assert_eq!(stats.releases, 1);
    assert_eq!(stats.misuse_frees, 4);
}

#[test]
fn registration_key_lives_with_the_block() {
    let pool = Mempool::new().unwrap();

    let mut block = pool.alloc(1000).unwrap();
    assert_eq!(block.registration(), None);

    block.set_registration(RegistrationKey::new(0x1234));
    assert_eq!(block.registration(), Some(RegistrationKey::new(0x1234)));

    pool.free(&mut block);
    assert_eq!(block.registration(), None);
}

#[test]
fn outstanding_counts_are_per_class() {
    let pool = Mempool::new().unwrap();

    let mut small = pool.alloc(1).unwrap();
    let mut large = pool.alloc(MIB).unwrap();
    let mut large2 = pool.alloc(MIB - 1).unwrap();

    assert_eq!(pool.outstanding_blocks_in(small.owner().unwrap().index()), Some(1));
    assert_eq!(pool.outstanding_blocks_in(large.owner().unwrap().index()), Some(2));
    assert_eq!(pool.outstanding_blocks(), 3);

    for block in [&mut small, &mut large, &mut large2] {
        pool.free(block);
    }

    assert_eq!(pool.outstanding_blocks(), 0);
}

#[test]
fn gather_grants_per_segment_lengths() {
    let pool = Mempool::new().unwrap();
    let mut desc = MemDesc::new();

    pool.alloc_gather(&[100, 16 * KIB + 1, 70_000, MIB], &mut desc)
        .unwrap();

    assert_eq!(
        desc.segments().iter().map(MpMem::len).collect::<Vec<_>>(),
        [16 * KIB, 64 * KIB, 256 * KIB, MIB]
    );
    assert!(desc.segments().iter().all(is_zeroed));

    pool.free_gather(&mut desc);

    assert!(desc.is_empty());
    assert_eq!(pool.outstanding_blocks(), 0);
}

#[test]
fn gather_invalid_segment_leaves_nothing_allocated() {
    let pool = Mempool::new().unwrap();
    let mut desc = MemDesc::new();

    let result = pool.alloc_gather(&[1024, 70_000, 2_000_000], &mut desc);

    assert!(matches!(result, Err(Error::InvalidSize { .. })));
    assert!(desc.is_empty());
    assert_eq!(pool.outstanding_blocks(), 0);
    assert_eq!(pool.stats().gather_unwinds, 1);

    // The descriptor remains usable.
    pool.alloc_gather(&[1024, 70_000], &mut desc).unwrap();
    assert_eq!(desc.len(), 2);
    pool.free_gather(&mut desc);
}

#[test]
fn gather_exhaustion_leaves_nothing_allocated() {
    let pool = limited_pool(nz!(2));
    let mut desc = MemDesc::new();

    let result = pool.alloc_gather(&[1, 2, 3], &mut desc);

    assert!(matches!(result, Err(Error::OutOfMemory { .. })));
    assert!(desc.is_empty());
    assert_eq!(pool.outstanding_blocks(), 0);

    // Both blocks of the small class are available again.
    pool.alloc_gather(&[1, 2], &mut desc).unwrap();
    pool.free_gather(&mut desc);
}

#[test]
fn gather_segment_limit_is_enforced() {
    let pool = Mempool::new().unwrap();
    let mut desc = MemDesc::new();

    let lengths = vec![100; 33];
    let result = pool.alloc_gather(&lengths, &mut desc);

    assert!(matches!(
        result,
        Err(Error::TooManySegments {
            requested: 33,
            max: 32
        })
    ));
    assert_eq!(pool.stats().allocations, 0);

    pool.alloc_gather(&lengths[..32], &mut desc).unwrap();
    assert_eq!(desc.len(), 32);
    pool.free_gather(&mut desc);
}

#[test]
fn free_gather_after_partial_early_free() {
    let pool = Mempool::new().unwrap();
    let mut desc = MemDesc::new();

    pool.alloc_gather(&[10, 20, 30, 40, 50, 60], &mut desc).unwrap();

    for index in [0, 3, 5] {
        pool.free(&mut desc.segments_mut()[index]);
    }

    assert_eq!(pool.outstanding_blocks(), 3);

    pool.free_gather(&mut desc);

    assert_eq!(pool.outstanding_blocks(), 0);
    assert_eq!(pool.stats().misuse_frees, 0);
}

#[test]
fn pool_can_be_dropped_with_blocks_outstanding() {
    let allocator = SlabCacheAllocator::builder()
        .drop_policy(DropPolicy::MayDropItems)
        .build();

    let pool = Mempool::builder().allocator(allocator).build().unwrap();

    let block = pool.alloc(1000).unwrap();
    assert!(!block.is_empty());

    drop(pool);

    // The descriptor still exists but its memory is gone; we only check it was not touched.
    assert_eq!(block.len(), 16 * KIB);
}

#[test]
#[should_panic]
fn pool_drop_with_blocks_outstanding_panics_if_forbidden() {
    let allocator = SlabCacheAllocator::builder()
        .drop_policy(DropPolicy::MustNotDropItems)
        .build();

    let pool = Mempool::builder().allocator(allocator).build().unwrap();

    let _block = pool.alloc(1000).unwrap();

    drop(pool);
}

#[test]
fn pools_have_distinct_identities() {
    let a = Mempool::new().unwrap();
    let b = Mempool::new().unwrap();

    assert_ne!(a.id(), b.id());

    let mut block = a.alloc(1).unwrap();
    assert_eq!(block.owner().unwrap().pool(), a.id());

    a.free(&mut block);
}

#[test]
fn shared_pool_across_threads() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 200;

    let pool = Arc::new(Mempool::new().unwrap());

    let handles = (0..THREADS)
        .map(|thread_index| {
            let pool = Arc::clone(&pool);

            thread::spawn(move || {
                let mut desc = MemDesc::new();

                for round in 0..ROUNDS {
                    let mut block = pool.alloc((thread_index + round) * 997).unwrap();
                    assert!(is_zeroed(&block));

                    // SAFETY: This thread exclusively holds the block.
                    unsafe { block.as_mut_slice() }.unwrap().fill(0xFF);

                    pool.alloc_gather(&[round, round * 2, 70_000], &mut desc)
                        .unwrap();
                    assert!(desc.segments().iter().all(is_zeroed));

                    pool.free(&mut block);
                    pool.free_gather(&mut desc);
                }
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.allocations, (THREADS * ROUNDS * 4) as u64);
    assert_eq!(stats.outstanding(), 0);
    assert_eq!(pool.outstanding_blocks(), 0);
}
