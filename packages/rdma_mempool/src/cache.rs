//! The seam between the pool and the slab-style sub-allocators that back its size classes.
//!
//! The pool only ever talks to its sub-allocators through these traits, which allows the
//! real [`SlabCacheAllocator`][crate::SlabCacheAllocator] to be swapped for a kernel facility,
//! a registered-memory arena or a test double.

use std::fmt::Debug;
use std::num::NonZero;
use std::ptr::NonNull;

/// The address of a block handed out by a [`BlockCache`].
///
/// This is only an address. Neither the pool nor this type ever dereference it; the caller
/// that holds the block descriptor owns the memory until it returns the block.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct BlockAddress(NonNull<u8>);

impl BlockAddress {
    /// Wraps a pointer to the start of a block.
    #[must_use]
    pub const fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// The address as a non-null pointer.
    #[must_use]
    pub const fn as_non_null(self) -> NonNull<u8> {
        self.0
    }

    /// The address as a raw pointer.
    #[must_use]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// The numeric value of the address.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.addr().get()
    }
}

// SAFETY: This is a plain address that is never dereferenced through this type. Whoever
// dereferences it is responsible for synchronizing access to the memory behind it.
unsafe impl Send for BlockAddress {}

// SAFETY: See above, the type offers no access to the memory it points to.
unsafe impl Sync for BlockAddress {}

/// Creates one [`BlockCache`] per size class when a pool is constructed.
///
/// Destroying a cache is done by dropping it.
#[cfg_attr(test, mockall::automock(type Cache = MockBlockCache;))]
pub trait SlabAllocator: Debug + Send + Sync {
    /// The type of cache this allocator creates.
    type Cache: BlockCache;

    /// Creates a cache that hands out blocks of exactly `block_size` bytes, each aligned to
    /// `alignment` bytes.
    ///
    /// Returns `None` if the cache cannot be created, for example due to resource exhaustion.
    fn create_cache(
        &self,
        name: &str,
        block_size: NonZero<usize>,
        alignment: NonZero<usize>,
    ) -> Option<Self::Cache>;
}

/// A slab-style sub-allocator that hands out and takes back blocks of a single size.
///
/// Implementations must be internally synchronized: the pool calls these methods concurrently
/// from any number of threads without locking of its own.
#[cfg_attr(test, mockall::automock)]
pub trait BlockCache: Debug + Send + Sync {
    /// The size of every block handed out by this cache.
    fn block_size(&self) -> NonZero<usize>;

    /// Hands out one zero-filled block of [`block_size()`][Self::block_size] bytes.
    ///
    /// Returns `None` if the cache is exhausted.
    fn alloc_zeroed(&self) -> Option<BlockAddress>;

    /// Takes back a block previously handed out by [`alloc_zeroed()`][Self::alloc_zeroed] on
    /// this same cache.
    ///
    /// Implementations may panic if the address was not handed out by this cache or has
    /// already been returned.
    fn free(&self, address: BlockAddress);

    /// The number of blocks handed out and not yet returned.
    fn outstanding(&self) -> usize;
}
