//! # Virtual Memory Support
//!
//! x86-64 4-level paging for the kernel's memory manager: entry layout,
//! typed tables and the walking engine that creates, inspects and tears
//! down table hierarchies. Allocation policy lives elsewhere; this crate
//! only asks a [`FrameAlloc`] for table frames and reaches physical memory
//! through a [`PhysMapper`].
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   → maps 4 KiB page
//!   │        │        └────────────► PDE   → PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE → PS=1 → 1 GiB page
//!   └──────────────────────────────► PML4E
//! ```
//!
//! PML4 slots `0..256` are the user (lower) half and private to each address
//! space. Slots `256..512` are the kernel (higher) half and shared: every
//! address space holds the same entries, pointing at the same PDPTs.
//!
//! ## Physical access
//!
//! Table frames are physical memory. The engine never dereferences a
//! physical address itself; every access goes through
//! [`PhysMapper::phys_to_mut`]. During bootstrap the mapper is the identity
//! map. Moving to a direct map at an offset changes only the mapper.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::mut_from_ref)]

mod engine;
pub mod entry;
mod mmu;
pub mod table;

pub use crate::engine::{LeafSize, Occupancy, PageTables, Reclaim, TableDepth, Translation, WalkError};
pub use crate::entry::{PageFlags, PageTableEntry};
pub use crate::mmu::Mmu;
#[cfg(target_arch = "x86_64")]
pub use crate::mmu::X86Mmu;
pub use crate::table::{PageTable, Pd, Pdpt, Pml4, Pt, TableIndex, TableLevel};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Source of physical 4 KiB frames for page tables.
///
/// Takes `&self`: implementations lock internally, so one allocator can be
/// shared by every address space.
pub trait FrameAlloc {
    /// One frame, or `None` when physical memory is exhausted. Contents are
    /// unspecified.
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame previously obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&self, frame: PhysicalPage<Size4K>);
}

/// Turns physical addresses into pointers usable in the current address
/// space (identity map, or a direct map at a fixed offset).
///
/// # Safety
/// - `pa` must be mapped writable for `&mut T`.
/// - The mapping must stay valid for `'a`.
/// - `T` must match the bytes at `pa`, and no other live reference may
///   alias them.
pub trait PhysMapper {
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Typed view of a table frame.
    ///
    /// # Safety
    /// `frame` must hold a page table of level `L`.
    #[inline]
    unsafe fn table_mut<'a, L: TableLevel>(&self, frame: PhysicalPage<Size4K>) -> &'a mut PageTable<L> {
        unsafe { self.phys_to_mut::<PageTable<L>>(frame.base()) }
    }

    /// Raw bytes of a frame.
    ///
    /// # Safety
    /// `frame` must not be in use as a typed object elsewhere.
    #[inline]
    unsafe fn frame_bytes_mut<'a>(&self, frame: PhysicalPage<Size4K>) -> &'a mut [u8; 4096] {
        unsafe { self.phys_to_mut::<[u8; 4096]>(frame.base()) }
    }

    /// Fill a frame with zeros.
    #[inline]
    fn zero_frame(&self, frame: PhysicalPage<Size4K>) {
        // Safety: freshly allocated frames are owned by the caller.
        unsafe { self.frame_bytes_mut(frame) }.fill(0);
    }
}
