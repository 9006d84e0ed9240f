/// Determines what a [`SlabCache`][crate::SlabCache] does if blocks are still
/// outstanding when it is destroyed.
///
/// Outstanding blocks always become invalid when their cache is destroyed. The policy
/// only decides whether that is reported as a diagnostic or treated as a bug.
///
/// # Examples
///
/// ```
/// use rdma_mempool::{DropPolicy, SlabCacheAllocator};
///
/// let allocator = SlabCacheAllocator::builder()
///     .drop_policy(DropPolicy::MustNotDropItems)
///     .build();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// The cache releases its memory even if blocks are outstanding, logging an error for
    /// each cache that still had blocks handed out. This is the default.
    #[default]
    MayDropItems,

    /// The cache will panic if it still has outstanding blocks when it is dropped.
    ///
    /// This may be valuable in tests and in transports that quiesce all traffic before
    /// tearing down the pool, where an outstanding block means a descriptor was leaked.
    MustNotDropItems,
}
