use thiserror::Error;

/// Errors that can occur when creating a memory pool or allocating blocks from it.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The requested length is larger than the largest configured size class.
    ///
    /// Retrying will not help; the pool needs a configuration with a larger class.
    #[error("requested length {requested} exceeds the largest size class of {largest} bytes")]
    InvalidSize {
        /// The length the caller asked for, in bytes.
        requested: usize,

        /// The block size of the largest size class in the pool, in bytes.
        largest: usize,
    },

    /// The sub-allocator of the resolved size class could not supply a block.
    ///
    /// This may be transient under memory pressure. The pool never retries on its own.
    #[error("size class of {block_size} bytes is out of memory")]
    OutOfMemory {
        /// The block size of the exhausted size class, in bytes.
        block_size: usize,
    },

    /// The sub-allocator for one of the size classes could not be created.
    ///
    /// Any size classes created before the failing one have already been torn down.
    #[error("failed to create block cache '{class_name}' for {block_size}-byte blocks")]
    ConstructionFailure {
        /// Diagnostic name of the size class that failed.
        class_name: String,

        /// Block size of the size class that failed, in bytes.
        block_size: usize,
    },

    /// The pool configuration is not usable.
    #[error("invalid memory pool configuration: {reason}")]
    InvalidConfig {
        /// A human-readable description of the problem.
        reason: String,
    },

    /// A scatter/gather request has more segments than a gather descriptor can hold.
    #[error("scatter/gather request of {requested} segments exceeds the maximum of {max}")]
    TooManySegments {
        /// Number of segments in the request.
        requested: usize,

        /// Maximum number of segments supported by the pool configuration.
        max: usize,
    },
}

/// A specialized `Result` type for memory pool operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
