use crate::{Mempool, MempoolConfig, Result, SlabAllocator, SlabCacheAllocator};

/// Builder for creating an instance of [`Mempool`].
///
/// You only need to use this builder if you want to customize the pool configuration.
/// The default configuration used by [`Mempool::new()`][1] serves an RDMA transport with
/// 16 KiB, 64 KiB, 256 KiB and 1 MiB blocks.
///
/// # Examples
///
/// ```
/// use rdma_mempool::Mempool;
///
/// let pool = Mempool::builder()
///     .name("rx")
///     .class_sizes([4096, 65_536])
///     .max_segments(8)
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.class_sizes().collect::<Vec<_>>(), [4096, 65_536]);
/// ```
///
/// [1]: Mempool::new
#[derive(Debug)]
#[must_use]
pub struct MempoolBuilder<A> {
    config: MempoolConfig,
    allocator: A,
}

impl MempoolBuilder<SlabCacheAllocator> {
    pub(crate) fn new() -> Self {
        Self {
            config: MempoolConfig::default(),
            allocator: SlabCacheAllocator::new(),
        }
    }
}

impl<A> MempoolBuilder<A> {
    /// Sets the prefix of the diagnostic names given to the size classes.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Sets the block sizes of the size classes, in bytes, smallest first.
    ///
    /// # Examples
    ///
    /// ```
    /// use rdma_mempool::Mempool;
    ///
    /// let pool = Mempool::builder().class_sizes([512, 4096]).build().unwrap();
    /// assert_eq!(pool.largest_block_size(), 4096);
    /// ```
    pub fn class_sizes(mut self, sizes: impl IntoIterator<Item = usize>) -> Self {
        self.config.class_sizes = sizes.into_iter().collect();
        self
    }

    /// Sets the alignment of every block, in bytes.
    pub fn alignment(mut self, alignment: usize) -> Self {
        self.config.alignment = alignment;
        self
    }

    /// Sets the maximum number of segments in one scatter/gather allocation.
    pub fn max_segments(mut self, max_segments: usize) -> Self {
        self.config.max_segments = max_segments;
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: MempoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the sub-allocator that creates the cache behind each size class.
    ///
    /// # Examples
    ///
    /// ```
    /// use rdma_mempool::{DropPolicy, Mempool, SlabCacheAllocator};
    ///
    /// let pool = Mempool::builder()
    ///     .allocator(
    ///         SlabCacheAllocator::builder()
    ///             .drop_policy(DropPolicy::MustNotDropItems)
    ///             .build(),
    ///     )
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn allocator<B>(self, allocator: B) -> MempoolBuilder<B> {
        MempoolBuilder {
            config: self.config,
            allocator,
        }
    }
}

impl<A: SlabAllocator> MempoolBuilder<A> {
    /// Builds the pool, creating one cache per size class.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`][crate::Error::InvalidConfig] if the configuration is
    /// not usable and [`Error::ConstructionFailure`][crate::Error::ConstructionFailure] if a
    /// cache could not be created. No caches remain after a failure.
    pub fn build(self) -> Result<Mempool<A>> {
        Mempool::new_inner(self.config, self.allocator)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn setters_reach_the_pool() {
        let pool = Mempool::builder()
            .name("tx")
            .class_sizes([1024, 2048, 8192])
            .alignment(64)
            .max_segments(3)
            .build()
            .unwrap();

        assert_eq!(pool.name(), "tx");
        assert_eq!(pool.class_sizes().collect::<Vec<_>>(), [1024, 2048, 8192]);
        assert_eq!(pool.max_segments(), 3);
    }

    #[test]
    fn config_replaces_previous_setters() {
        let mut config = MempoolConfig::default();
        config.class_sizes = vec![4096];

        let pool = Mempool::builder()
            .class_sizes([1, 2, 3])
            .config(config)
            .build()
            .unwrap();

        assert_eq!(pool.class_sizes().collect::<Vec<_>>(), [4096]);
    }

    #[test]
    fn invalid_config_fails_build() {
        let result = Mempool::builder().class_sizes([4096, 1024]).build();

        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }
}
