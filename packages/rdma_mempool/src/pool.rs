use std::fmt;
use std::mem;
use std::num::NonZero;

use tracing::{debug, error, info};

use crate::size_class::{SizeClass, class_name, resolve};
use crate::stats::StatsCounters;
use crate::{
    BlockCache, ClassHandle, ClassIndex, Error, MemDesc, MempoolBuilder, MempoolConfig,
    MempoolStats, MpMem, PoolId, Result, SlabAllocator, SlabCacheAllocator,
};

/// A pool of pre-allocated, zero-filled memory blocks in a fixed set of size classes.
///
/// Each size class is backed by its own slab-style cache created by the pool's
/// [`SlabAllocator`]. A request for some number of bytes is served from the smallest class
/// whose block size is at least that large; requests larger than the largest class fail.
///
/// The pool does no locking of its own. All operations take `&self` and rely on the caches
/// being internally synchronized, so the pool can be shared between threads.
///
/// Dropping the pool destroys every cache. Blocks still held by callers become invalid at
/// that point.
///
/// # Examples
///
/// ```
/// use rdma_mempool::{FreeOutcome, Mempool};
///
/// let pool = Mempool::new().unwrap();
///
/// let mut block = pool.alloc(1500).unwrap();
/// assert_eq!(block.len(), 16_384);
///
/// assert_eq!(pool.free(&mut block), FreeOutcome::Released);
/// assert!(block.is_empty());
/// ```
pub struct Mempool<A: SlabAllocator = SlabCacheAllocator> {
    id: PoolId,
    name: String,

    /// Strictly ascending by block size.
    classes: Vec<SizeClass<A::Cache>>,

    max_segments: usize,
    stats: StatsCounters,

    // Dropped after the classes, as some allocators track the caches they created.
    allocator: A,
}

/// What [`Mempool::free()`] did with a block descriptor.
///
/// Returning a block never fails. The outcomes other than [`Released`][Self::Released]
/// indicate that the caller returned something it did not hold. They are also logged and
/// counted in [`MempoolStats::misuse_frees`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum FreeOutcome {
    /// The block was returned to its size class and the descriptor is now empty.
    Released,

    /// The descriptor never held a block, or was emptied without a free. Nothing happened.
    AlreadyEmpty,

    /// The descriptor's block was already returned by an earlier free. Nothing happened.
    AlreadyReleased,

    /// The descriptor named a size class but had no address. The descriptor was cleared
    /// without returning anything.
    Inconsistent,
}

impl FreeOutcome {
    /// Whether the caller returned a descriptor that did not hold a block.
    #[must_use]
    pub fn is_misuse(self) -> bool {
        !matches!(self, Self::Released)
    }
}

impl Mempool<SlabCacheAllocator> {
    /// Creates a pool with the default configuration, backed by a [`SlabCacheAllocator`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConstructionFailure`] if a size class could not be created.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Starts building a new [`Mempool`].
    ///
    /// Use this when you want to customize the size classes or the sub-allocator.
    pub fn builder() -> MempoolBuilder<SlabCacheAllocator> {
        MempoolBuilder::new()
    }
}

impl<A: SlabAllocator> Mempool<A> {
    pub(crate) fn new_inner(config: MempoolConfig, allocator: A) -> Result<Self> {
        config.validate()?;

        let id = PoolId::next();
        let alignment = NonZero::new(config.alignment).expect("validated to be a power of two");
        let mut classes = Vec::with_capacity(config.class_sizes.len());

        for &size in &config.class_sizes {
            let block_size = NonZero::new(size).expect("validated to be non-zero");
            let name = class_name(&config.name, block_size);

            let Some(cache) = allocator.create_cache(&name, block_size, alignment) else {
                error!(class = %name, block_size = size, "block cache creation failed");

                destroy_classes(classes);
                error!(pool = %config.name, "memory pool creation failed");

                return Err(Error::ConstructionFailure {
                    class_name: name,
                    block_size: size,
                });
            };

            info!(class = %name, block_size = size, "block cache created");
            classes.push(SizeClass::new(name, block_size, cache));
        }

        info!(
            pool = %config.name,
            classes = classes.len(),
            "memory pool created"
        );

        Ok(Self {
            id,
            name: config.name,
            classes,
            max_segments: config.max_segments,
            stats: StatsCounters::default(),
            allocator,
        })
    }

    /// Process-unique identity of the pool, as recorded in the descriptors of its blocks.
    #[must_use]
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// The name the pool was configured with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The sub-allocator that created the caches of this pool.
    #[must_use]
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// The number of size classes.
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// The block sizes of the size classes, smallest first.
    pub fn class_sizes(&self) -> impl Iterator<Item = usize> {
        self.classes.iter().map(|class| class.block_size().get())
    }

    /// The block size of one size class, or `None` if the pool has no such class.
    #[must_use]
    pub fn block_size(&self, class: ClassIndex) -> Option<usize> {
        self.classes
            .get(class.get())
            .map(|class| class.block_size().get())
    }

    /// The largest length that can be allocated from this pool.
    #[must_use]
    pub fn largest_block_size(&self) -> usize {
        self.classes
            .last()
            .map(|class| class.block_size().get())
            .expect("a pool always has at least one size class")
    }

    /// The maximum number of segments in one scatter/gather allocation.
    #[must_use]
    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    /// Finds the smallest size class whose blocks can hold `length` bytes.
    ///
    /// Returns `None` if `length` is larger than the largest class.
    ///
    /// # Examples
    ///
    /// ```
    /// use rdma_mempool::Mempool;
    ///
    /// let pool = Mempool::new().unwrap();
    ///
    /// let class = pool.resolve_class(20_000).unwrap();
    /// assert_eq!(pool.block_size(class), Some(65_536));
    ///
    /// assert!(pool.resolve_class(2_000_000).is_none());
    /// ```
    #[must_use]
    pub fn resolve_class(&self, length: usize) -> Option<ClassIndex> {
        resolve(&self.classes, length)
    }

    /// Allocates a zero-filled block of at least `length` bytes.
    ///
    /// The granted length, available via [`MpMem::len()`], is the block size of the size
    /// class that served the request and may be larger than `length`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSize`] if `length` is larger than the largest size class and
    /// [`Error::OutOfMemory`] if the size class is exhausted.
    pub fn alloc(&self, length: usize) -> Result<MpMem> {
        let mut block = MpMem::new();
        self.alloc_into(length, &mut block)?;
        Ok(block)
    }

    /// Allocates a zero-filled block of at least `length` bytes into an existing descriptor.
    ///
    /// The descriptor is cleared first, so it is empty if the allocation fails. Any block it
    /// held before is not returned to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSize`] if `length` is larger than the largest size class and
    /// [`Error::OutOfMemory`] if the size class is exhausted.
    pub fn alloc_into(&self, length: usize, block: &mut MpMem) -> Result<()> {
        if !block.is_empty() {
            error!(
                pool = %self.name,
                owner = ?block.owner(),
                "overwriting a block descriptor that still holds a block, the block is leaked"
            );
        }

        block.clear();

        let Some(index) = self.resolve_class(length) else {
            self.stats.record_invalid_size(length);
            debug!(pool = %self.name, length, "no size class is large enough");

            return Err(Error::InvalidSize {
                requested: length,
                largest: self.largest_block_size(),
            });
        };

        let class = self.class(index);

        let Some(address) = class.cache().alloc_zeroed() else {
            self.stats.record_out_of_memory(class.block_size().get());
            debug!(pool = %self.name, class = class.name(), length, "size class is exhausted");

            return Err(Error::OutOfMemory {
                block_size: class.block_size().get(),
            });
        };

        block.populate(
            address,
            ClassHandle::new(self.id, index),
            class.block_size().get(),
        );

        self.stats.record_allocation(class.block_size().get());

        Ok(())
    }

    /// Returns a block to the size class it came from and clears the descriptor.
    ///
    /// This never fails. Returning an empty descriptor does nothing, which makes it safe to
    /// free a descriptor more than once. Such calls are nevertheless reported, see
    /// [`FreeOutcome`]. A repeated free of a returned block is reported as
    /// [`FreeOutcome::AlreadyReleased`] and a free of a descriptor that never held a block as
    /// [`FreeOutcome::AlreadyEmpty`]; the `state` field of the log event tells them apart.
    ///
    /// # Panics
    ///
    /// Panics if the block was allocated from a different pool.
    pub fn free(&self, block: &mut MpMem) -> FreeOutcome {
        let Some(owner) = block.owner() else {
            self.stats.record_misuse_free();

            if block.was_released() {
                error!(
                    pool = %self.name,
                    state = "already_released",
                    "free called again on a block descriptor that was already freed"
                );

                return FreeOutcome::AlreadyReleased;
            }

            error!(
                pool = %self.name,
                state = "never_populated",
                "free called on an empty block descriptor"
            );

            return FreeOutcome::AlreadyEmpty;
        };

        assert!(
            owner.pool() == self.id,
            "block descriptor belongs to pool {:?}, not to pool '{}' ({:?})",
            owner.pool(),
            self.name,
            self.id
        );

        let Some(address) = block.address() else {
            self.stats.record_misuse_free();
            error!(
                pool = %self.name,
                class = owner.index().get(),
                "block descriptor has an owning class but no address"
            );

            block.clear();
            return FreeOutcome::Inconsistent;
        };

        self.class(owner.index()).cache().free(address);
        block.clear_released();

        self.stats.record_release();

        FreeOutcome::Released
    }

    /// Allocates one block per segment of a scatter/gather request.
    ///
    /// Either every segment is allocated, or none is: if any segment fails, the segments
    /// allocated before it are returned to their classes and the descriptor is left empty.
    ///
    /// If the descriptor still holds blocks from an earlier allocation, they are returned to
    /// the pool first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooManySegments`] if there are more lengths than
    /// [`max_segments()`][Self::max_segments], and otherwise the error of the first segment
    /// that could not be allocated (see [`alloc()`][Self::alloc]).
    ///
    /// # Examples
    ///
    /// ```
    /// use rdma_mempool::{Error, MemDesc, Mempool};
    ///
    /// let pool = Mempool::new().unwrap();
    /// let mut desc = MemDesc::new();
    ///
    /// let result = pool.alloc_gather(&[1024, 70_000, 2_000_000], &mut desc);
    ///
    /// assert!(matches!(result, Err(Error::InvalidSize { .. })));
    /// assert!(desc.is_empty());
    /// assert_eq!(pool.outstanding_blocks(), 0);
    /// ```
    pub fn alloc_gather(&self, lengths: &[usize], desc: &mut MemDesc) -> Result<()> {
        if !desc.is_empty() {
            error!(
                pool = %self.name,
                segments = desc.len(),
                "gather descriptor still holds blocks, returning them before reuse"
            );

            self.free_gather(desc);
        }

        desc.reset();

        if lengths.len() > self.max_segments {
            return Err(Error::TooManySegments {
                requested: lengths.len(),
                max: self.max_segments,
            });
        }

        desc.prepare(lengths.len());

        for (index, &length) in lengths.iter().enumerate() {
            let slot = desc
                .slots_mut()
                .get_mut(index)
                .expect("we prepared one slot per length");

            if let Err(e) = self.alloc_into(length, slot) {
                let allocated = desc
                    .slots_mut()
                    .get_mut(..index)
                    .expect("we prepared one slot per length");

                for block in allocated {
                    self.free(block);
                }

                self.stats.record_gather_unwind(index);

                debug!(
                    pool = %self.name,
                    segment = index,
                    segments = lengths.len(),
                    error = %e,
                    "scatter/gather allocation failed, returned earlier segments"
                );

                return Err(e);
            }
        }

        desc.commit();

        Ok(())
    }

    /// Returns every block held by a gather descriptor and marks the descriptor empty.
    ///
    /// Segments that were already returned individually are skipped.
    pub fn free_gather(&self, desc: &mut MemDesc) {
        for block in desc.segments_mut() {
            if !block.is_empty() {
                self.free(block);
            }
        }

        desc.reset();
    }

    /// A snapshot of the pool's diagnostic counters.
    #[must_use]
    pub fn stats(&self) -> MempoolStats {
        self.stats.snapshot()
    }

    /// The number of blocks handed out by all size classes and not yet returned, as reported
    /// by the caches.
    #[must_use]
    pub fn outstanding_blocks(&self) -> usize {
        self.classes
            .iter()
            .map(|class| class.cache().outstanding())
            .sum()
    }

    /// The number of blocks handed out by one size class and not yet returned, or `None` if
    /// the pool has no such class.
    #[must_use]
    pub fn outstanding_blocks_in(&self, class: ClassIndex) -> Option<usize> {
        self.classes
            .get(class.get())
            .map(|class| class.cache().outstanding())
    }

    /// Verifies the internal invariants of the pool, panicking if any is violated.
    ///
    /// # Panics
    ///
    /// Panics if the size classes are not strictly ascending or if a cache hands out blocks of
    /// a different size than its class.
    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    pub fn integrity_check(&self) {
        for pair in self.classes.windows(2) {
            if let [smaller, larger] = pair {
                assert!(
                    smaller.block_size() < larger.block_size(),
                    "size class '{}' is not smaller than '{}'",
                    smaller.name(),
                    larger.name()
                );
            }
        }

        for class in &self.classes {
            assert!(
                class.cache().block_size() == class.block_size(),
                "cache of size class '{}' hands out {} byte blocks",
                class.name(),
                class.cache().block_size()
            );
        }
    }

    fn class(&self, index: ClassIndex) -> &SizeClass<A::Cache> {
        self.classes
            .get(index.get())
            .expect("class indexes are only created by this pool for its own classes")
    }
}

impl<A: SlabAllocator> Drop for Mempool<A> {
    fn drop(&mut self) {
        destroy_classes(mem::take(&mut self.classes));

        info!(pool = %self.name, "memory pool destroyed");
    }
}

impl<A: SlabAllocator> fmt::Debug for Mempool<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mempool")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("class_sizes", &self.class_sizes().collect::<Vec<_>>())
            .field("max_segments", &self.max_segments)
            .field("allocator", &self.allocator)
            .finish_non_exhaustive()
    }
}

/// Destroys the caches of the classes, smallest class first.
fn destroy_classes<C: BlockCache>(classes: Vec<SizeClass<C>>) {
    for class in classes {
        info!(class = class.name(), "block cache destroyed");
        drop(class);
    }
}
