//! # Typed Page Tables
//!
//! Every level is a 4 KiB-aligned array of 512 [`PageTableEntry`] words. The
//! level is a type parameter so an index for one level cannot be used on a
//! table of another, and so walking code states which table it holds.
//!
//! | Level | Marker   | VA bits  | Leaf possible |
//! |-------|----------|----------|---------------|
//! | 4     | [`Pml4`] | 47..=39  | no            |
//! | 3     | [`Pdpt`] | 38..=30  | 1 GiB (PS=1)  |
//! | 2     | [`Pd`]   | 29..=21  | 2 MiB (PS=1)  |
//! | 1     | [`Pt`]   | 20..=12  | 4 KiB         |

use crate::entry::PageTableEntry;
use core::fmt;
use core::marker::PhantomData;
use kernel_info::memory::{ENTRIES_PER_TABLE, KERNEL_PML4_START};
use kernel_memory_addresses::VirtualAddress;

mod sealed {
    pub trait Sealed {}
}

/// A paging level.
pub trait TableLevel: sealed::Sealed + Copy + 'static {
    /// Shift of the 9 index bits inside a virtual address.
    const SHIFT: u32;
    /// Bytes of virtual space one entry of this level spans.
    const ENTRY_SPAN: u64 = 1 << Self::SHIFT;
    /// Short name for diagnostics.
    const NAME: &'static str;
}

macro_rules! table_level {
    ($(#[$meta:meta])* $ty:ident, $shift:literal, $name:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub enum $ty {}

        impl sealed::Sealed for $ty {}

        impl TableLevel for $ty {
            const SHIFT: u32 = $shift;
            const NAME: &'static str = $name;
        }
    };
}

table_level!(
    /// Page Map Level 4 (top level, referenced by CR3).
    Pml4, 39, "PML4"
);
table_level!(
    /// Page Directory Pointer Table.
    Pdpt, 30, "PDPT"
);
table_level!(
    /// Page Directory.
    Pd, 21, "PD"
);
table_level!(
    /// Page Table (leaf level).
    Pt, 12, "PT"
);

/// Index into a table of level `L`, always `< 512`.
#[repr(transparent)]
pub struct TableIndex<L: TableLevel>(u16, PhantomData<L>);

impl<L: TableLevel> Clone for TableIndex<L> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<L: TableLevel> Copy for TableIndex<L> {}

impl<L: TableLevel> PartialEq for TableIndex<L> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<L: TableLevel> Eq for TableIndex<L> {}

impl<L: TableLevel> TableIndex<L> {
    /// Extract this level's index bits from `va`.
    #[inline]
    #[must_use]
    pub const fn of(va: VirtualAddress) -> Self {
        Self(((va.as_u64() >> L::SHIFT) & 0x1FF) as u16, PhantomData)
    }

    /// Construct from a raw value; `v` must be `< 512`.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES_PER_TABLE);
        Self(v, PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl<L: TableLevel> fmt::Debug for TableIndex<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", L::NAME, self.0)
    }
}

/// All four indices of `va`, top level first.
#[inline]
#[must_use]
pub const fn split_indices(
    va: VirtualAddress,
) -> (
    TableIndex<Pml4>,
    TableIndex<Pdpt>,
    TableIndex<Pd>,
    TableIndex<Pt>,
) {
    (
        TableIndex::of(va),
        TableIndex::of(va),
        TableIndex::of(va),
        TableIndex::of(va),
    )
}

/// One page-table frame of level `L`.
#[repr(C, align(4096))]
pub struct PageTable<L: TableLevel> {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
    _level: PhantomData<L>,
}

const _: () = {
    assert!(size_of::<PageTable<Pml4>>() == 4096);
    assert!(align_of::<PageTable<Pt>>() == 4096);
};

impl<L: TableLevel> PageTable<L> {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::new(); ENTRIES_PER_TABLE],
            _level: PhantomData,
        }
    }

    /// Clear all entries.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::new());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex<L>) -> PageTableEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: TableIndex<L>, e: PageTableEntry) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    pub const fn entry_mut(&mut self, i: TableIndex<L>) -> &mut PageTableEntry {
        &mut self.entries[i.as_usize()]
    }

    /// Present entries with their index.
    #[allow(clippy::cast_possible_truncation)] // i < 512
    pub fn present(&self) -> impl Iterator<Item = (TableIndex<L>, PageTableEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.present())
            .map(|(i, e)| (TableIndex::new(i as u16), *e))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.present())
    }
}

impl PageTable<Pml4> {
    /// Copy the higher-half entries (256..512) from `kernel` verbatim.
    pub fn copy_kernel_half(&mut self, kernel: &Self) {
        self.entries[KERNEL_PML4_START..].copy_from_slice(&kernel.entries[KERNEL_PML4_START..]);
    }

    /// Lower-half (user) slots only.
    pub fn lower_half_mut(&mut self) -> &mut [PageTableEntry] {
        &mut self.entries[..KERNEL_PML4_START]
    }

    #[must_use]
    pub fn lower_half(&self) -> &[PageTableEntry] {
        &self.entries[..KERNEL_PML4_START]
    }

    #[must_use]
    pub fn higher_half(&self) -> &[PageTableEntry] {
        &self.entries[KERNEL_PML4_START..]
    }
}

/// Virtual base covered by `(i4, i3, i2, i1)`, sign-extended to canonical form.
#[must_use]
pub const fn compose_va(i4: usize, i3: usize, i2: usize, i1: usize) -> VirtualAddress {
    let raw = ((i4 as u64) << 39) | ((i3 as u64) << 30) | ((i2 as u64) << 21) | ((i1 as u64) << 12);
    let canonical = if raw & (1 << 47) != 0 {
        raw | 0xFFFF_0000_0000_0000
    } else {
        raw
    };
    VirtualAddress::new(canonical)
}
