use smallvec::SmallVec;

use crate::MpMem;

/// Most scatter/gather requests carry a handful of segments; those need no heap allocation.
const INLINE_SEGMENTS: usize = 4;

/// Describes the blocks of one scatter/gather allocation, one block per segment.
///
/// Filled by [`Mempool::alloc_gather()`][crate::Mempool::alloc_gather] and returned with
/// [`Mempool::free_gather()`][crate::Mempool::free_gather]. The segment count is only set once
/// every segment has been allocated, so a descriptor is either fully populated or holds no
/// blocks at all.
///
/// Individual segments may be returned early through [`Mempool::free()`][crate::Mempool::free]
/// via [`segments_mut()`][Self::segments_mut]; returning the whole descriptor afterwards skips
/// them.
///
/// # Examples
///
/// ```
/// use rdma_mempool::{MemDesc, Mempool};
///
/// let pool = Mempool::new().unwrap();
/// let mut desc = MemDesc::new();
///
/// pool.alloc_gather(&[1024, 70_000], &mut desc).unwrap();
///
/// let granted = desc.segments().iter().map(|s| s.len()).collect::<Vec<_>>();
/// assert_eq!(granted, [16_384, 262_144]);
///
/// pool.free_gather(&mut desc);
/// assert!(desc.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct MemDesc {
    slots: SmallVec<[MpMem; INLINE_SEGMENTS]>,

    /// Number of valid segments. Slots at or beyond this index never hold a block.
    count: usize,
}

impl MemDesc {
    /// Creates an empty descriptor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of segments in the descriptor.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the descriptor has no segments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The segments, in the order of the lengths they were allocated for.
    ///
    /// Segments that were returned individually are empty.
    #[must_use]
    pub fn segments(&self) -> &[MpMem] {
        self.slots
            .get(..self.count)
            .expect("count never exceeds the number of slots")
    }

    /// The segments, for the transport to attach registration keys or to return individual
    /// segments early.
    #[must_use]
    pub fn segments_mut(&mut self) -> &mut [MpMem] {
        self.slots
            .get_mut(..self.count)
            .expect("count never exceeds the number of slots")
    }

    /// Discards the previous content and provides `segment_count` empty slots.
    ///
    /// The caller must have returned every block held by the descriptor beforehand.
    pub(crate) fn prepare(&mut self, segment_count: usize) {
        debug_assert!(
            self.slots.iter().all(MpMem::is_empty),
            "preparing a gather descriptor that still holds blocks would leak them"
        );

        self.count = 0;
        self.slots.clear();
        self.slots.resize_with(segment_count, MpMem::default);
    }

    /// The slots being filled by an allocation in progress, valid or not.
    pub(crate) fn slots_mut(&mut self) -> &mut [MpMem] {
        &mut self.slots
    }

    /// Publishes the slots as valid segments once all of them hold a block.
    pub(crate) fn commit(&mut self) {
        self.count = self.slots.len();
    }

    /// Marks the descriptor as holding no segments.
    pub(crate) fn reset(&mut self) {
        self.count = 0;
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(MemDesc: Send, Sync, Default);

    #[test]
    fn new_is_empty() {
        let desc = MemDesc::new();

        assert!(desc.is_empty());
        assert_eq!(desc.len(), 0);
        assert!(desc.segments().is_empty());
    }

    #[test]
    fn prepared_slots_are_hidden_until_commit() {
        let mut desc = MemDesc::new();
        desc.prepare(6);

        assert_eq!(desc.slots_mut().len(), 6);
        assert!(desc.segments().is_empty());

        desc.commit();

        assert_eq!(desc.len(), 6);
        assert_eq!(desc.segments().len(), 6);
        assert!(desc.segments().iter().all(MpMem::is_empty));

        desc.reset();

        assert!(desc.is_empty());
        assert!(desc.segments_mut().is_empty());
    }
}
