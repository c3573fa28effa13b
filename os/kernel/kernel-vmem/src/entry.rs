//! # Page-Table Entries and Mapping Flags
//!
//! [`PageTableEntry`] is the raw 64-bit hardware word, shared by all four
//! levels. [`PageFlags`] is the flag-only view that mapping APIs accept and
//! return; it never carries address bits.

use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Bits 12..=51 of an entry: the frame address.
pub const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// One 64-bit x86-64 paging-structure entry (PML4E, PDPTE, PDE or PTE).
///
/// | Bits  | Field            |
/// |-------|------------------|
/// | 0     | present          |
/// | 1     | writable         |
/// | 2     | user             |
/// | 3     | write-through    |
/// | 4     | cache-disable    |
/// | 5     | accessed         |
/// | 6     | dirty            |
/// | 7     | large page (PS)  |
/// | 8     | global           |
/// | 9–11  | OS available     |
/// | 12–51 | frame address    |
/// | 52–62 | ignored          |
/// | 63    | no-execute       |
///
/// With `present` clear the address field is meaningless.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    /// Set by the CPU on first access.
    pub accessed: bool,
    /// Set by the CPU on first write through a leaf.
    pub dirty: bool,
    /// Leaf at PDPT (1 GiB) or PD (2 MiB) level.
    pub large_page: bool,
    pub global: bool,
    #[bits(3)]
    pub os_available: u8,
    #[bits(40)]
    frame_bits: u64,
    #[bits(11)]
    __: u16,
    pub no_execute: bool,
}

impl PageTableEntry {
    /// Entry pointing at `frame` with the given flags.
    #[inline]
    #[must_use]
    pub const fn with_frame(frame: PhysicalPage<Size4K>, flags: PageFlags) -> Self {
        Self::from_bits((frame.base().as_u64() & ADDRESS_MASK) | flags.bits())
    }

    /// Leaf or link entry for an arbitrary aligned physical address.
    #[inline]
    #[must_use]
    pub const fn with_address(pa: PhysicalAddress, flags: PageFlags) -> Self {
        Self::from_bits((pa.as_u64() & ADDRESS_MASK) | flags.bits())
    }

    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_bits() << 12)
    }

    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(self.address())
    }

    /// Flag bits only; address bits are dropped.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.into_bits())
    }

    #[inline]
    pub const fn set_flags(&mut self, flags: PageFlags) {
        *self = Self::from_bits((self.into_bits() & ADDRESS_MASK) | flags.bits());
    }

    #[inline]
    pub const fn clear(&mut self) {
        *self = Self::new();
    }

    /// Present and pointing at a next-level table.
    #[inline]
    #[must_use]
    pub const fn is_table_link(self) -> bool {
        self.present() && !self.large_page()
    }
}

bitflags::bitflags! {
    /// Mapping flags, at the hardware bit positions.
    ///
    /// `PRESENT` is implied by every mapping call; the others are taken as
    /// given.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        /// Accessible from ring 3.
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const LARGE_PAGE    = 1 << 7;
        /// Survives CR3 reloads when CR4.PGE is on.
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

impl PageFlags {
    /// Bits the CPU writes behind our back.
    pub const HARDWARE_MANAGED: Self = Self::ACCESSED.union(Self::DIRTY);

    /// Link entries for kernel-only subtrees.
    pub const KERNEL_TABLE: Self = Self::PRESENT.union(Self::WRITABLE);

    /// Link entries on the path to a user leaf.
    pub const USER_TABLE: Self = Self::KERNEL_TABLE.union(Self::USER);

    /// Kernel data: present, writable, not executable.
    pub const KERNEL_RW: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::NO_EXECUTE);

    /// User data: present, writable, user, not executable.
    pub const USER_RW: Self = Self::KERNEL_RW.union(Self::USER);

    /// User code: present, user, executable, read-only.
    pub const USER_RX: Self = Self::PRESENT.union(Self::USER);

    /// Flags as compared for idempotent re-mapping.
    #[inline]
    #[must_use]
    pub const fn comparable(self) -> Self {
        self.difference(Self::HARDWARE_MANAGED)
    }

    #[inline]
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.contains(Self::USER)
    }
}
