use std::slice;

use crate::{BlockAddress, ClassHandle};

/// Key of the RDMA memory region that covers a block, as assigned by the transport when it
/// registers the memory with the network adapter.
///
/// The pool never registers memory itself. It only makes sure a stale key never survives a
/// block being returned or handed out again.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RegistrationKey(u32);

impl RegistrationKey {
    /// Wraps a local key obtained from memory registration.
    #[must_use]
    pub const fn new(key: u32) -> Self {
        Self(key)
    }

    /// The key as a plain number.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Describes one block handed out by a [`Mempool`][crate::Mempool].
///
/// The descriptor records everything needed to return the block later: its address, the size
/// class that produced it and the granted length. The granted length is the block size of the
/// class, which may be larger than the length that was requested.
///
/// A default-constructed descriptor is empty. Returning an empty descriptor to the pool is a
/// harmless no-op, so a descriptor may be freed any number of times. A descriptor emptied by
/// returning its block remembers that, so a repeated free can be told apart from a free of a
/// descriptor that never held anything.
///
/// The descriptor is intentionally not `Clone`: two descriptors for the same block would allow
/// the block to be returned twice.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct MpMem {
    address: Option<BlockAddress>,
    owner: Option<ClassHandle>,
    length: usize,
    registration: Option<RegistrationKey>,

    // Set when the descriptor was emptied by returning its block to the pool.
    released: bool,
}

impl MpMem {
    /// Creates an empty descriptor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the descriptor holds no block.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.owner.is_none()
    }

    /// The address of the block, if the descriptor holds one.
    #[must_use]
    pub fn address(&self) -> Option<BlockAddress> {
        self.address
    }

    /// The size class the block came from, if the descriptor holds one.
    #[must_use]
    pub fn owner(&self) -> Option<ClassHandle> {
        self.owner
    }

    /// The number of bytes granted, which is the block size of the owning class.
    ///
    /// Zero for an empty descriptor.
    #[must_use]
    pub fn len(&self) -> usize {
        self.length
    }

    /// The registration key set by the transport, if any.
    #[must_use]
    pub fn registration(&self) -> Option<RegistrationKey> {
        self.registration
    }

    /// Records the key of the memory region that covers this block.
    ///
    /// The key is cleared when the block is returned to the pool.
    pub fn set_registration(&mut self, key: RegistrationKey) {
        self.registration = Some(key);
    }

    /// Views the block as bytes.
    ///
    /// Returns `None` for an empty descriptor.
    ///
    /// # Safety
    ///
    /// The pool that produced the block must still exist, and no other code may be writing to
    /// the block (e.g. the network adapter) for the lifetime of the returned slice.
    #[must_use]
    pub unsafe fn as_slice(&self) -> Option<&[u8]> {
        let address = self.address?;

        // SAFETY: The block is `length` bytes long and owned by this descriptor; the caller
        // guarantees the pool is alive and nobody writes to the block concurrently.
        Some(unsafe { slice::from_raw_parts(address.as_ptr(), self.length) })
    }

    /// Views the block as mutable bytes.
    ///
    /// Returns `None` for an empty descriptor.
    ///
    /// # Safety
    ///
    /// The pool that produced the block must still exist, and no other code may access the
    /// block (e.g. the network adapter) for the lifetime of the returned slice.
    #[must_use]
    pub unsafe fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        let address = self.address?;

        // SAFETY: The block is `length` bytes long and exclusively owned by this descriptor;
        // the caller guarantees the pool is alive and nobody else accesses the block.
        Some(unsafe { slice::from_raw_parts_mut(address.as_ptr(), self.length) })
    }

    pub(crate) fn populate(&mut self, address: BlockAddress, owner: ClassHandle, length: usize) {
        self.address = Some(address);
        self.owner = Some(owner);
        self.length = length;
        self.registration = None;
        self.released = false;
    }

    /// Restores the canonical empty state.
    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    /// Empties the descriptor after its block went back to the pool.
    pub(crate) fn clear_released(&mut self) {
        *self = Self {
            released: true,
            ..Self::default()
        };
    }

    /// Whether the descriptor is empty because its block was already returned.
    pub(crate) fn was_released(&self) -> bool {
        self.is_empty() && self.released
    }

    #[cfg(test)]
    pub(crate) fn inconsistent(owner: ClassHandle) -> Self {
        Self {
            address: None,
            owner: Some(owner),
            length: 0,
            registration: None,
            released: false,
        }
    }
}
