//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw addresses and page bases used by the
//! frame allocator and the paging code.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Physical memory (RAM, MMIO, page-table frames). |
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Addresses translated by the page tables. |
//!
//! Page sizes are type-level markers implementing [`PageSize`]:
//! [`Size4K`], [`Size2M`] and [`Size1G`].
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_8000_0000_1234);
//! let (page, off) = va.split::<Size4K>();
//! assert_eq!(page.base().as_u64(), 0xFFFF_8000_0000_1000);
//! assert_eq!(off, 0x234);
//! assert_eq!(page.join(off), va);
//! assert!(va.is_higher_half());
//! ```
//!
//! The wrappers are `#[repr(transparent)]` over `u64` and all helpers are
//! `const fn`, so mixing up address kinds costs a compile error and nothing
//! at runtime.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

/// Align `x` down to the nearest multiple of `a` (`a` must be a power of two).
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a` (`a` must be a power of two).
///
/// Returns `None` if rounding up overflows.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(1, 4096), Some(4096));
/// assert_eq!(align_up(4096, 4096), Some(4096));
/// assert_eq!(align_up(u64::MAX, 4096), None);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> Option<u64> {
    debug_assert!(a.is_power_of_two());
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Number of `S`-sized pages needed to hold `bytes` bytes.
///
/// ```rust
/// # use kernel_memory_addresses::{pages_for, Size4K};
/// assert_eq!(pages_for::<Size4K>(0), 0);
/// assert_eq!(pages_for::<Size4K>(1), 1);
/// assert_eq!(pages_for::<Size4K>(8192), 2);
/// ```
#[inline]
#[must_use]
pub const fn pages_for<S: PageSize>(bytes: u64) -> u64 {
    bytes.div_ceil(S::SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pa_split_and_join() {
        let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
        let (pp, off) = pa.split::<Size4K>();
        assert_eq!(pp.base().as_u64(), 0x0000_0010_2000_0000);
        assert_eq!(off, 0x42);
        assert_eq!(pp.join(off), pa);
    }

    #[test]
    fn pages_are_aligned_down() {
        let pa = PhysicalAddress::new(0x0000_0008_1234_5678);
        assert_eq!(pa.page::<Size2M>().base().as_u64(), 0x0000_0008_1220_0000);
        assert_eq!(pa.page::<Size1G>().base().as_u64(), 0x0000_0008_0000_0000);
    }

    #[test]
    fn checked_page_construction_rejects_unaligned() {
        assert!(PhysicalPage::<Size4K>::from_start_address(PhysicalAddress::new(0x1001)).is_none());
        assert!(PhysicalPage::<Size4K>::from_start_address(PhysicalAddress::new(0x2000)).is_some());
        assert!(VirtualPage::<Size2M>::from_start_address(VirtualAddress::new(0x1000)).is_none());
    }

    #[test]
    fn frame_numbers_and_stepping() {
        let p = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x10_0000));
        assert_eq!(p.number(), 256);
        assert_eq!(p.add(3).base().as_u64(), 0x10_3000);
        assert_eq!(PhysicalPage::<Size4K>::from_number(256), p);
    }

    #[test]
    fn canonical_halves() {
        assert!(VirtualAddress::new(0x0000_7FFF_FFFF_F000).is_lower_half());
        assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_higher_half());
        assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
        assert!(VirtualAddress::new(0xFFFF_FFFF_FFFF_FFFF).is_canonical());
    }

    #[test]
    fn virtual_page_iteration_by_offset() {
        let base = VirtualPage::<Size4K>::from_addr(VirtualAddress::new(0x40_0000));
        let pages: Vec<u64> = (0..3).map(|i| base.add(i).base().as_u64()).collect();
        assert_eq!(pages, [0x40_0000, 0x40_1000, 0x40_2000]);
    }
}
