use std::alloc::{Layout, alloc, dealloc};
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZero;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use new_zealand::nz;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::{BlockAddress, BlockCache, DropPolicy, SlabAllocator};

/// How many bytes we aim to place in one slab. Blocks larger than this get one slab each.
const DEFAULT_SLAB_BYTES: NonZero<usize> = nz!(2 * 1024 * 1024);

/// The default sub-allocator used by [`Mempool`][crate::Mempool].
///
/// Creates one [`SlabCache`] per size class. Each cache grows on demand by allocating slabs
/// from the global allocator, each slab holding a fixed number of equally sized blocks.
///
/// # Examples
///
/// ```
/// use new_zealand::nz;
/// use rdma_mempool::{Mempool, SlabCacheAllocator};
///
/// // At most 64 outstanding blocks per size class.
/// let allocator = SlabCacheAllocator::builder()
///     .block_limit(nz!(64))
///     .build();
///
/// let pool = Mempool::builder().allocator(allocator).build().unwrap();
/// assert_eq!(pool.class_count(), 4);
/// ```
#[derive(Debug)]
pub struct SlabCacheAllocator {
    slab_bytes: NonZero<usize>,
    block_limit: Option<NonZero<usize>>,
    drop_policy: DropPolicy,

    /// Shared with every cache we create, so we can tell how many are still alive.
    live_caches: Arc<AtomicUsize>,
}

impl SlabCacheAllocator {
    /// Creates an allocator with the default configuration: no block limit, 2 MiB slabs and
    /// [`DropPolicy::MayDropItems`].
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a new [`SlabCacheAllocator`].
    pub fn builder() -> SlabCacheAllocatorBuilder {
        SlabCacheAllocatorBuilder::new()
    }

    /// The number of caches created by this allocator that have not yet been destroyed.
    #[must_use]
    pub fn live_caches(&self) -> usize {
        self.live_caches.load(Ordering::Relaxed)
    }
}

impl Default for SlabCacheAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SlabAllocator for SlabCacheAllocator {
    type Cache = SlabCache;

    fn create_cache(
        &self,
        name: &str,
        block_size: NonZero<usize>,
        alignment: NonZero<usize>,
    ) -> Option<SlabCache> {
        let Some(geometry) = SlabGeometry::new(block_size, alignment, self.slab_bytes) else {
            debug!(
                cache = name,
                block_size = block_size.get(),
                alignment = alignment.get(),
                "block size and alignment do not form a valid slab layout"
            );
            return None;
        };

        self.live_caches.fetch_add(1, Ordering::Relaxed);

        debug!(
            cache = name,
            block_size = block_size.get(),
            stride = geometry.stride,
            blocks_per_slab = geometry.blocks_per_slab,
            "slab cache created"
        );

        Some(SlabCache {
            name: name.to_owned(),
            geometry,
            block_limit: self.block_limit,
            drop_policy: self.drop_policy,
            state: Mutex::new(CacheState::default()),
            live_caches: Arc::clone(&self.live_caches),
        })
    }
}

/// Builder for creating an instance of [`SlabCacheAllocator`].
#[derive(Debug)]
#[must_use]
pub struct SlabCacheAllocatorBuilder {
    slab_bytes: NonZero<usize>,
    block_limit: Option<NonZero<usize>>,
    drop_policy: DropPolicy,
}

impl SlabCacheAllocatorBuilder {
    fn new() -> Self {
        Self {
            slab_bytes: DEFAULT_SLAB_BYTES,
            block_limit: None,
            drop_policy: DropPolicy::default(),
        }
    }

    /// Caps the number of blocks each cache may have outstanding at the same time. Allocations
    /// beyond the cap fail as if the system were out of memory.
    pub fn block_limit(mut self, limit: NonZero<usize>) -> Self {
        self.block_limit = Some(limit);
        self
    }

    /// Sets the target size of one slab. A slab always holds at least one block, so caches
    /// with blocks larger than this get one slab per block.
    pub fn slab_bytes(mut self, bytes: NonZero<usize>) -> Self {
        self.slab_bytes = bytes;
        self
    }

    /// Sets the [drop policy][DropPolicy] applied to every cache created by the allocator.
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Builds the allocator with the specified configuration.
    #[must_use]
    pub fn build(self) -> SlabCacheAllocator {
        SlabCacheAllocator {
            slab_bytes: self.slab_bytes,
            block_limit: self.block_limit,
            drop_policy: self.drop_policy,
            live_caches: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Memory layout shared by every slab of one cache.
#[derive(Clone, Copy, Debug)]
struct SlabGeometry {
    block_size: NonZero<usize>,

    /// Distance between the start of two neighbouring blocks: the block size rounded up to
    /// the alignment, so every block in a slab is aligned.
    stride: usize,

    blocks_per_slab: usize,

    slab_layout: Layout,
}

impl SlabGeometry {
    fn new(
        block_size: NonZero<usize>,
        alignment: NonZero<usize>,
        slab_bytes: NonZero<usize>,
    ) -> Option<Self> {
        if !alignment.is_power_of_two() {
            return None;
        }

        let stride = block_size.get().checked_next_multiple_of(alignment.get())?;
        let blocks_per_slab = slab_bytes.get().checked_div(stride)?.max(1);
        let slab_layout =
            Layout::from_size_align(stride.checked_mul(blocks_per_slab)?, alignment.get()).ok()?;

        Some(Self {
            block_size,
            stride,
            blocks_per_slab,
            slab_layout,
        })
    }

    fn block_offset(&self, index: usize) -> usize {
        index
            .checked_mul(self.stride)
            .expect("block index is bounded by the slab, whose size we have already calculated")
    }
}

/// A thread-safe cache of equally sized, aligned blocks.
///
/// Blocks are zero-filled whenever they are handed out, so a block that is returned and then
/// handed out again never exposes the data of its previous user.
///
/// The cache validates every returned address and panics if it was not handed out by this
/// cache or if it is returned twice.
pub struct SlabCache {
    name: String,
    geometry: SlabGeometry,
    block_limit: Option<NonZero<usize>>,
    drop_policy: DropPolicy,
    state: Mutex<CacheState>,
    live_caches: Arc<AtomicUsize>,
}

#[derive(Default)]
struct CacheState {
    slabs: Vec<Slab>,

    /// Start address of every slab, mapped to its index in `slabs`.
    slab_index_by_start: BTreeMap<usize, usize>,

    /// Lowest index of any slab that has a vacant block, if known. This is a cache, not the
    /// ground truth: `None` does not imply that there are no vacant blocks.
    slab_with_vacant_slot_index: Option<usize>,

    outstanding: usize,
}

impl SlabCache {
    /// The diagnostic name the cache was created with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The number of blocks the cache can hand out without allocating another slab.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state
            .lock()
            .slabs
            .len()
            .checked_mul(self.geometry.blocks_per_slab)
            .expect("capacity cannot exceed the address space we have already allocated")
    }

    /// Releases slabs at the end of the cache that have no outstanding blocks.
    #[cfg_attr(test, mutants::skip)] // Only affects memory usage, not observable behavior.
    pub fn shrink_to_fit(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let new_len = state
            .slabs
            .iter()
            .rposition(|slab| !slab.is_empty())
            .map_or(0, |index| {
                index
                    .checked_add(1)
                    .expect("slab index cannot overflow")
            });

        if new_len < state.slabs.len() {
            state.slab_with_vacant_slot_index = None;
        }

        for slab in state.slabs.drain(new_len..) {
            state.slab_index_by_start.remove(&slab.start());
        }
    }

    fn new_slab(&self) -> Option<Slab> {
        let slab = Slab::new(&self.geometry);

        if slab.is_none() {
            error!(
                cache = %self.name,
                bytes = self.geometry.slab_layout.size(),
                "failed to allocate memory for a new slab"
            );
        }

        slab
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(test)]
    pub(crate) fn integrity_check(&self) {
        let state = self.state.lock();

        let mut occupied_total: usize = 0;

        for (index, slab) in state.slabs.iter().enumerate() {
            slab.integrity_check();

            assert!(
                state.slab_index_by_start.get(&slab.start()) == Some(&index),
                "slab {index} of cache '{}' is missing from the address index",
                self.name
            );

            occupied_total = occupied_total
                .checked_add(slab.count)
                .expect("occupied blocks cannot exceed the address space");
        }

        assert!(
            state.slab_index_by_start.len() == state.slabs.len(),
            "slab cache '{}' indexes {} slabs but owns {}",
            self.name,
            state.slab_index_by_start.len(),
            state.slabs.len()
        );

        assert!(
            occupied_total == state.outstanding,
            "slab cache '{}' tracks {} outstanding blocks but its slabs hold {}",
            self.name,
            state.outstanding,
            occupied_total
        );
    }
}

impl BlockCache for SlabCache {
    fn block_size(&self) -> NonZero<usize> {
        self.geometry.block_size
    }

    fn alloc_zeroed(&self) -> Option<BlockAddress> {
        // Slabs are allocated without holding the lock. If another thread grows the cache in
        // the meantime, the spare slab is simply released again.
        let mut spare_slab = None;

        let address = loop {
            let mut state = self.state.lock();

            if self
                .block_limit
                .is_some_and(|limit| state.outstanding >= limit.get())
            {
                debug!(cache = %self.name, outstanding = state.outstanding, "block limit reached");
                return None;
            }

            if state.index_of_slab_with_vacant_slot().is_none() {
                let Some(slab) = spare_slab.take() else {
                    drop(state);
                    spare_slab = Some(self.new_slab()?);
                    continue;
                };

                state.push_slab(slab);
            }

            break state.take_vacant(&self.geometry);
        };

        // SAFETY: The block is inside a slab and `block_size <= stride`, so all of its bytes are
        // inside the allocation. The block is marked occupied, so nobody else can reach it.
        unsafe {
            address
                .as_non_null()
                .write_bytes(0, self.geometry.block_size.get());
        }

        Some(address)
    }

    fn free(&self, address: BlockAddress) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(slab_index) = state.index_of_slab_containing(address, &self.geometry) else {
            panic!(
                "block {address:?} was not allocated from slab cache '{}'",
                self.name
            );
        };

        let slab = state
            .slabs
            .get_mut(slab_index)
            .expect("the address index only refers to slabs that exist");

        let offset = slab
            .offset_of(address, &self.geometry)
            .expect("we just found the slab by this address");

        assert!(
            offset.checked_rem(self.geometry.stride) == Some(0),
            "block {address:?} is not at a block boundary in slab cache '{}'",
            self.name
        );

        let index = offset
            .checked_div(self.geometry.stride)
            .expect("stride is never zero");

        assert!(
            slab.is_occupied(index),
            "block {address:?} was returned to slab cache '{}' more than once",
            self.name
        );

        slab.release(index);

        // Keep pointing at the lowest slab with a vacancy, to fill the cache from the start.
        if state
            .slab_with_vacant_slot_index
            .is_none_or(|current| current > slab_index)
        {
            state.slab_with_vacant_slot_index = Some(slab_index);
        }

        state.outstanding = state
            .outstanding
            .checked_sub(1)
            .expect("we verified above that the block was outstanding");
    }

    fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }
}

impl fmt::Debug for SlabCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabCache")
            .field("name", &self.name)
            .field("block_size", &self.geometry.block_size)
            .field("stride", &self.geometry.stride)
            .field("blocks_per_slab", &self.geometry.blocks_per_slab)
            .field("block_limit", &self.block_limit)
            .field("drop_policy", &self.drop_policy)
            .finish_non_exhaustive()
    }
}

impl Drop for SlabCache {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let outstanding = state.outstanding;

        // Release the memory first. If we panic below, there is nothing good left to do anyway.
        state.slabs.clear();
        state.slab_index_by_start.clear();

        self.live_caches.fetch_sub(1, Ordering::Relaxed);

        if outstanding == 0 {
            debug!(cache = %self.name, "slab cache destroyed");
        } else {
            error!(
                cache = %self.name,
                outstanding,
                "slab cache destroyed with outstanding blocks"
            );
        }

        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the first panic was.
        if self.drop_policy == DropPolicy::MustNotDropItems && !thread::panicking() {
            assert!(
                outstanding == 0,
                "dropped slab cache '{}' with {outstanding} outstanding blocks under a policy that says it must be empty when dropped",
                self.name
            );
        }
    }
}

impl CacheState {
    fn index_of_slab_with_vacant_slot(&mut self) -> Option<usize> {
        if let Some(index) = self.slab_with_vacant_slot_index {
            return Some(index);
        }

        let index = self.slabs.iter().position(|slab| !slab.is_full())?;
        self.slab_with_vacant_slot_index = Some(index);
        Some(index)
    }

    fn index_of_slab_containing(
        &self,
        address: BlockAddress,
        geometry: &SlabGeometry,
    ) -> Option<usize> {
        // The slab with the greatest start address not above the block is the only candidate.
        let (_, &index) = self
            .slab_index_by_start
            .range(..=address.addr())
            .next_back()?;

        self.slabs
            .get(index)?
            .offset_of(address, geometry)
            .map(|_| index)
    }

    fn push_slab(&mut self, slab: Slab) {
        let index = self.slabs.len();

        self.slab_index_by_start.insert(slab.start(), index);
        self.slabs.push(slab);
    }

    /// Marks a vacant block as occupied and returns its address. The block is not zeroed.
    fn take_vacant(&mut self, geometry: &SlabGeometry) -> BlockAddress {
        let slab_index = self
            .index_of_slab_with_vacant_slot()
            .expect("caller must ensure that a slab with a vacant block exists");

        let slab = self
            .slabs
            .get_mut(slab_index)
            .expect("we just verified that there is a slab with a vacant slot at this index");

        let address = slab.take_vacant(geometry);

        self.slab_with_vacant_slot_index = if slab.is_full() {
            None
        } else {
            Some(slab_index)
        };

        self.outstanding = self
            .outstanding
            .checked_add(1)
            .expect("outstanding blocks cannot exceed the address space");

        address
    }
}

/// One contiguous allocation holding `blocks_per_slab` blocks.
///
/// Vacant blocks form a stack threaded through `entries`, with `next_free_index` as the top.
/// The stack points out of bounds when the slab is full.
struct Slab {
    first_block_ptr: NonNull<u8>,
    layout: Layout,
    entries: Box<[Entry]>,
    next_free_index: usize,
    count: usize,
}

#[derive(Clone, Copy)]
enum Entry {
    Occupied,

    Vacant { next_free_index: usize },
}

impl Slab {
    fn new(geometry: &SlabGeometry) -> Option<Self> {
        // SAFETY: The layout has a non-zero size because the block size is non-zero and
        // there is at least one block per slab.
        let ptr = NonNull::new(unsafe { alloc(geometry.slab_layout) })?;

        // For the last block, this points out of bounds, which means the slab is full.
        let entries = (0..geometry.blocks_per_slab)
            .map(|index| Entry::Vacant {
                next_free_index: index
                    .checked_add(1)
                    .expect("guarded by the slab layout fitting in the address space"),
            })
            .collect();

        Some(Self {
            first_block_ptr: ptr,
            layout: geometry.slab_layout,
            entries,
            next_free_index: 0,
            count: 0,
        })
    }

    fn start(&self) -> usize {
        self.first_block_ptr.addr().get()
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn is_full(&self) -> bool {
        self.next_free_index >= self.entries.len()
    }

    fn is_occupied(&self, index: usize) -> bool {
        matches!(self.entries.get(index), Some(Entry::Occupied))
    }

    /// Offset of the address from the start of the slab, if the address is inside the slab.
    fn offset_of(&self, address: BlockAddress, geometry: &SlabGeometry) -> Option<usize> {
        let offset = address.addr().checked_sub(self.start())?;

        (offset < geometry.slab_layout.size()).then_some(offset)
    }

    fn take_vacant(&mut self, geometry: &SlabGeometry) -> BlockAddress {
        let index = self.next_free_index;

        let entry = self
            .entries
            .get_mut(index)
            .expect("caller must only take from a slab that is not full");

        let Entry::Vacant { next_free_index } = *entry else {
            panic!("free stack of slab pointed at occupied block {index}");
        };

        *entry = Entry::Occupied;
        self.next_free_index = next_free_index;

        self.count = self
            .count
            .checked_add(1)
            .expect("guarded by the number of entries");

        // SAFETY: The index is in bounds of `entries`, so the offset is inside the allocation.
        BlockAddress::new(unsafe { self.first_block_ptr.add(geometry.block_offset(index)) })
    }

    fn release(&mut self, index: usize) {
        let next_free_index = self.next_free_index;

        let entry = self
            .entries
            .get_mut(index)
            .expect("caller verified that the index is in bounds");

        assert!(
            matches!(entry, Entry::Occupied),
            "release({index}) entry was vacant"
        );

        // Push the released block onto the free stack.
        *entry = Entry::Vacant { next_free_index };
        self.next_free_index = index;

        self.count = self
            .count
            .checked_sub(1)
            .expect("we asserted above that the entry is occupied so count must be non-zero");
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(test)]
    fn integrity_check(&self) {
        let occupied = self
            .entries
            .iter()
            .filter(|entry| matches!(entry, Entry::Occupied))
            .count();

        assert!(
            occupied == self.count,
            "slab count {} does not match the observed occupied count {occupied}",
            self.count
        );

        // Walk the free stack; it must visit exactly the vacant entries.
        let mut visited: usize = 0;
        let mut cursor = self.next_free_index;

        while let Some(entry) = self.entries.get(cursor) {
            let Entry::Vacant { next_free_index } = *entry else {
                panic!("free stack passes through occupied entry {cursor}");
            };

            visited = visited
                .checked_add(1)
                .expect("guarded by the number of entries");

            assert!(
                visited <= self.entries.len(),
                "free stack of slab contains a cycle"
            );

            cursor = next_free_index;
        }

        assert!(
            visited.checked_add(occupied) == Some(self.entries.len()),
            "free stack visits {visited} entries but {} are vacant",
            self.entries.len().saturating_sub(occupied)
        );
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        // SAFETY: The layout must match between alloc and dealloc. It does.
        unsafe {
            dealloc(self.first_block_ptr.as_ptr(), self.layout);
        }
    }
}

// SAFETY: Yes, there are raw pointers involved here but nothing inherently non-thread-mobile
// about it. The slab owns its allocation and all access goes through the cache mutex.
unsafe impl Send for Slab {}
