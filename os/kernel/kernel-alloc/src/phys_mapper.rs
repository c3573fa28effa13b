//! # Offset-based `PhysMapper`
//!
//! Physical memory is reachable at `offset + pa` in the current address
//! space. During bootstrap the low identity map makes `offset = 0`; a later
//! move to a higher-half direct map only changes the offset.

use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for a linear window onto physical memory.
#[derive(Debug, Copy, Clone)]
pub struct OffsetPhysMapper {
    offset: u64,
}

impl OffsetPhysMapper {
    /// # Safety
    /// Every physical address the memory manager touches (table frames, heap
    /// frames, the frame-state array) must be mapped writable at
    /// `offset + pa`.
    #[must_use]
    pub const unsafe fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// Physical equals virtual.
    ///
    /// # Safety
    /// All managed physical memory must be identity-mapped.
    #[must_use]
    pub const unsafe fn identity() -> Self {
        Self { offset: 0 }
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

impl PhysMapper for OffsetPhysMapper {
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = self.offset.wrapping_add(pa.as_u64()) as *mut T;
        // Safety: upheld by the constructor contract and the caller.
        unsafe { &mut *va }
    }
}
