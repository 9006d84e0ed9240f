#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A pool of pre-allocated, zero-filled memory blocks for RDMA transports.
//!
//! Network transports that move data with RDMA need buffers they can register with the network
//! adapter once and then reuse for many transfers. This crate provides [`Mempool`], which keeps
//! such buffers in a small, fixed set of size classes. By default these are 16 KiB, 64 KiB,
//! 256 KiB and 1 MiB.
//!
//! A request for some number of bytes is served from the smallest size class that can hold it.
//! The caller receives a block descriptor ([`MpMem`]) that records the block address, the size
//! class that produced it and the granted length, which is the full block size of that class.
//! Every block is zero-filled when handed out.
//!
//! # Key Features
//!
//! - **Size classes**: Requests are rounded up to the smallest fitting block size
//! - **Zero-filled blocks**: Memory never carries data from a previous user
//! - **Safe double free**: Returning an empty descriptor is a harmless, reported no-op
//! - **Scatter/gather**: [`Mempool::alloc_gather()`] allocates one block per segment and either
//!   succeeds for every segment or leaves nothing allocated
//! - **Pluggable sub-allocator**: Caches are created by a [`SlabAllocator`], by default the
//!   built-in [`SlabCacheAllocator`]
//! - **Thread safety**: The pool can be shared between threads; all operations take `&self`
//!
//! # Examples
//!
//! ```
//! use rdma_mempool::{MemDesc, Mempool};
//!
//! let pool = Mempool::new().unwrap();
//!
//! // A single block.
//! let mut block = pool.alloc(3000).unwrap();
//! assert_eq!(block.len(), 16_384);
//! pool.free(&mut block);
//!
//! // One block per segment of a scatter/gather request.
//! let mut desc = MemDesc::new();
//! pool.alloc_gather(&[4096, 100_000], &mut desc).unwrap();
//! assert_eq!(desc.len(), 2);
//! pool.free_gather(&mut desc);
//! ```
//!
//! # Custom size classes
//!
//! ```
//! use rdma_mempool::Mempool;
//!
//! let pool = Mempool::builder()
//!     .name("small")
//!     .class_sizes([256, 1024, 4096])
//!     .alignment(64)
//!     .build()
//!     .unwrap();
//!
//! assert!(pool.alloc(5000).is_err());
//! ```
//!
//! # Logging
//!
//! The pool reports through [`tracing`]. Pool and cache lifecycle events are logged at `info`,
//! allocation failures at `debug` and caller misuse (such as freeing an empty descriptor) at
//! `error`. No subscriber is installed by this crate.
//!
//! # Metrics
//!
//! Allocations, releases, failures, misuse and scatter/gather unwinds are observed as [`nm`]
//! events named `rdma_mempool_*`, aggregated over all pools in the process. Collect them with
//! `nm::Report::collect()`. Each pool additionally keeps its own counters, see
//! [`Mempool::stats()`].

mod block;
mod builder;
mod cache;
mod config;
mod drop_policy;
mod error;
mod mem_desc;
mod metrics;
mod pool;
mod size_class;
mod slab_cache;
mod stats;

pub use block::*;
pub use builder::*;
pub use cache::*;
pub use config::*;
pub use drop_policy::*;
pub use error::*;
pub use mem_desc::*;
pub use pool::*;
pub use size_class::{ClassHandle, ClassIndex, PoolId};
pub use slab_cache::{SlabCache, SlabCacheAllocator, SlabCacheAllocatorBuilder};
pub use stats::MempoolStats;
