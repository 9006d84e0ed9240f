use std::fmt;
use std::num::NonZero;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::BlockCache;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Position of a size class in its pool, counting from the smallest class.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ClassIndex(usize);

impl ClassIndex {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index)
    }

    /// The index as a plain number.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

/// Process-unique identity of a [`Mempool`][crate::Mempool].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PoolId(u64);

impl PoolId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);

        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identifies the size class that produced a block, and the pool the class belongs to.
///
/// Block descriptors carry this handle so a block can be returned without the caller
/// remembering where it came from, and so it can never be returned to a different pool.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ClassHandle {
    pool: PoolId,
    index: ClassIndex,
}

impl ClassHandle {
    pub(crate) const fn new(pool: PoolId, index: ClassIndex) -> Self {
        Self { pool, index }
    }

    /// The pool that owns the size class.
    #[must_use]
    pub const fn pool(self) -> PoolId {
        self.pool
    }

    /// The position of the size class within its pool.
    #[must_use]
    pub const fn index(self) -> ClassIndex {
        self.index
    }
}

/// One bucket of equally sized blocks, backed by its own cache.
#[derive(Debug)]
pub(crate) struct SizeClass<C> {
    name: String,
    block_size: NonZero<usize>,
    cache: C,
}

impl<C: BlockCache> SizeClass<C> {
    pub(crate) fn new(name: String, block_size: NonZero<usize>, cache: C) -> Self {
        Self {
            name,
            block_size,
            cache,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn block_size(&self) -> NonZero<usize> {
        self.block_size
    }

    pub(crate) fn cache(&self) -> &C {
        &self.cache
    }
}

/// Finds the smallest class that can hold `length` bytes.
///
/// `None` stands for the implicit terminal class of requests that are too large for any
/// class. That class never has a cache behind it.
pub(crate) fn resolve<C>(classes: &[SizeClass<C>], length: usize) -> Option<ClassIndex> {
    classes
        .iter()
        .position(|class| class.block_size.get() >= length)
        .map(ClassIndex::new)
}

/// Diagnostic name of a size class, e.g. `rdma_mempool-64K`.
pub(crate) fn class_name(pool_name: &str, block_size: NonZero<usize>) -> String {
    format!("{pool_name}-{}", HumanSize(block_size.get()))
}

struct HumanSize(usize);

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;

        if bytes.checked_rem(MIB) == Some(0) {
            write!(f, "{}M", bytes.checked_div(MIB).unwrap_or_default())
        } else if bytes.checked_rem(KIB) == Some(0) {
            write!(f, "{}K", bytes.checked_div(KIB).unwrap_or_default())
        } else {
            write!(f, "{bytes}")
        }
    }
}
