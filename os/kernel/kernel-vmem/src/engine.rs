//! # Page-Table Engine
//!
//! Walks, grows and tears down one table hierarchy rooted at a PML4 frame.
//!
//! - [`PageTables::get_or_create_table`] walks `depth` steps down from the
//!   root, allocating and zeroing any missing intermediate table.
//! - [`PageTables::get_pte_noalloc`] does the same walk read-only. A missing
//!   table or a large page on the way yields `None`; looking never allocates.
//! - [`PageTables::translate`] resolves through 4 KiB, 2 MiB and 1 GiB leaves.
//! - [`PageTables::teardown_lower_half`] reports every frame reachable from
//!   the user half, leaves first, and unlinks it.
//!
//! Link entries are written with [`PageFlags::KERNEL_TABLE`], plus `USER`
//! when the walk is on behalf of a user leaf. Hardware checks U/S at every
//! level, so a user leaf under a supervisor-only link would be unreachable.

use crate::entry::{PageFlags, PageTableEntry};
use crate::table::{Pd, Pdpt, Pml4, Pt, PageTable, TableIndex, TableLevel, compose_va, split_indices};
use crate::{FrameAlloc, PhysMapper};
use core::fmt;
use kernel_info::memory::KERNEL_PML4_START;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size1G, Size2M, Size4K, VirtualAddress};

/// Failure while growing the hierarchy.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum WalkError {
    #[error("out of physical frames for a page table")]
    OutOfFrames,
    #[error("address is covered by a {0} large page")]
    LargePage(LeafSize),
}

/// How far [`PageTables::get_or_create_table`] descends.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum TableDepth {
    /// One step: yields the PDPT.
    Pdpt = 1,
    /// Two steps: yields the PD.
    Pd = 2,
    /// Three steps: yields the PT.
    Pt = 3,
}

/// Size of the leaf a translation ended at.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LeafSize {
    Size4K,
    Size2M,
    Size1G,
}

impl LeafSize {
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Size4K => Size4K::SIZE,
            Self::Size2M => Size2M::SIZE,
            Self::Size1G => Size1G::SIZE,
        }
    }

    /// Number of 4 KiB frames backing one leaf of this size.
    #[must_use]
    pub const fn frames(self) -> u64 {
        self.bytes() / Size4K::SIZE
    }
}

impl fmt::Display for LeafSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Size4K => Size4K::NAME,
            Self::Size2M => Size2M::NAME,
            Self::Size1G => Size1G::NAME,
        })
    }
}

/// Result of a successful [`PageTables::translate`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Translation {
    /// Physical address including the in-page offset.
    pub phys: PhysicalAddress,
    /// Leaf flags.
    pub flags: PageFlags,
    pub size: LeafSize,
}

/// What [`PageTables::occupancy`] finds at an address.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Occupancy {
    /// A leaf maps the address.
    Mapped(Translation),
    /// Nothing maps the aligned block of this many bytes around the address.
    /// The block is one entry of the lowest table the walk reached.
    Hole(u64),
}

/// Bytes covered by one PML4 entry.
const PML4_ENTRY_SPAN: u64 = Size1G::SIZE * 512;

/// What [`PageTables::teardown_lower_half`] hands back.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Reclaim {
    /// Frame behind a 4 KiB leaf.
    Frame(PhysicalPage<Size4K>),
    /// Contiguous frames behind a 2 MiB or 1 GiB leaf.
    Run { base: PhysicalAddress, frames: u64 },
    /// A table frame whose subtree has been reported already.
    Table(PhysicalPage<Size4K>),
}

/// Handle to one hierarchy.
pub struct PageTables<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> PageTables<'m, M> {
    #[inline]
    #[must_use]
    pub const fn new(mapper: &'m M, root: PhysicalPage<Size4K>) -> Self {
        Self { root, mapper }
    }

    /// Allocate and zero a fresh table frame.
    ///
    /// # Errors
    /// [`WalkError::OutOfFrames`] if the allocator is empty.
    pub fn alloc_table<A: FrameAlloc + ?Sized>(
        mapper: &M,
        alloc: &A,
    ) -> Result<PhysicalPage<Size4K>, WalkError> {
        let frame = alloc.alloc_4k().ok_or(WalkError::OutOfFrames)?;
        mapper.zero_frame(frame);
        Ok(frame)
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    #[inline]
    pub fn pml4_mut(&self) -> &mut PageTable<Pml4> {
        // Safety: the root frame holds a PML4 for the lifetime of `self`.
        unsafe { self.mapper.table_mut(self.root) }
    }

    #[inline]
    fn table_mut<L: TableLevel>(&self, frame: PhysicalPage<Size4K>) -> &mut PageTable<L> {
        // Safety: `frame` came from a link entry one level up.
        unsafe { self.mapper.table_mut(frame) }
    }

    /// Follow (or create) the link in `entry`.
    fn descend<A: FrameAlloc + ?Sized>(
        &self,
        entry: &mut PageTableEntry,
        alloc: &A,
        link: PageFlags,
        level: LeafSize,
    ) -> Result<PhysicalPage<Size4K>, WalkError> {
        if entry.present() {
            if entry.large_page() {
                return Err(WalkError::LargePage(level));
            }
            if link.is_user() && !entry.user() {
                entry.set_user(true);
            }
            return Ok(entry.frame());
        }
        let frame = Self::alloc_table(self.mapper, alloc)?;
        *entry = PageTableEntry::with_frame(frame, link);
        Ok(frame)
    }

    /// Walk `depth` steps from the root, creating missing tables, and return
    /// the frame of the table reached.
    ///
    /// `user` requests `USER` on every link on the path.
    ///
    /// # Errors
    /// - [`WalkError::OutOfFrames`] if a table could not be allocated. Tables
    ///   created before the failure stay linked (they are empty).
    /// - [`WalkError::LargePage`] if a large leaf sits on the path.
    pub fn get_or_create_table<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &A,
        va: VirtualAddress,
        depth: TableDepth,
        user: bool,
    ) -> Result<PhysicalPage<Size4K>, WalkError> {
        let link = if user {
            PageFlags::USER_TABLE
        } else {
            PageFlags::KERNEL_TABLE
        };
        let (i4, i3, i2, _) = split_indices(va);

        let pdpt = self.descend(self.pml4_mut().entry_mut(i4), alloc, link, LeafSize::Size1G)?;
        if depth == TableDepth::Pdpt {
            return Ok(pdpt);
        }
        let pd = self.descend(
            self.table_mut::<Pdpt>(pdpt).entry_mut(i3),
            alloc,
            link,
            LeafSize::Size1G,
        )?;
        if depth == TableDepth::Pd {
            return Ok(pd);
        }
        self.descend(self.table_mut::<Pd>(pd).entry_mut(i2), alloc, link, LeafSize::Size2M)
    }

    /// Leaf entry for `va`, creating tables as needed.
    ///
    /// # Errors
    /// As [`get_or_create_table`](Self::get_or_create_table).
    pub fn leaf_entry_mut<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &A,
        va: VirtualAddress,
        user: bool,
    ) -> Result<&mut PageTableEntry, WalkError> {
        let pt = self.get_or_create_table(alloc, va, TableDepth::Pt, user)?;
        Ok(self.table_mut::<Pt>(pt).entry_mut(TableIndex::of(va)))
    }

    /// Leaf entry for `va` if every table on the path exists.
    ///
    /// Returns `None` on a missing table and on a large page; the latter is
    /// not an individually mapped 4 KiB page.
    #[must_use]
    pub fn get_pte_noalloc(&self, va: VirtualAddress) -> Option<&mut PageTableEntry> {
        let (i4, i3, i2, i1) = split_indices(va);
        let e4 = self.pml4_mut().get(i4);
        if !e4.is_table_link() {
            return None;
        }
        let e3 = self.table_mut::<Pdpt>(e4.frame()).get(i3);
        if !e3.is_table_link() {
            return None;
        }
        let e2 = self.table_mut::<Pd>(e3.frame()).get(i2);
        if !e2.is_table_link() {
            return None;
        }
        Some(self.table_mut::<Pt>(e2.frame()).entry_mut(i1))
    }

    /// Like [`translate`](Self::translate), but a miss also says how large
    /// the unmapped block around `va` is, so scans can skip absent tables.
    #[must_use]
    pub fn occupancy(&self, va: VirtualAddress) -> Occupancy {
        let (i4, i3, i2, i1) = split_indices(va);
        let e4 = self.pml4_mut().get(i4);
        if !e4.is_table_link() {
            return Occupancy::Hole(PML4_ENTRY_SPAN);
        }

        let e3 = self.table_mut::<Pdpt>(e4.frame()).get(i3);
        if !e3.present() {
            return Occupancy::Hole(Size1G::SIZE);
        }
        if e3.large_page() {
            return Occupancy::Mapped(leaf(e3, va, LeafSize::Size1G));
        }

        let e2 = self.table_mut::<Pd>(e3.frame()).get(i2);
        if !e2.present() {
            return Occupancy::Hole(Size2M::SIZE);
        }
        if e2.large_page() {
            return Occupancy::Mapped(leaf(e2, va, LeafSize::Size2M));
        }

        let e1 = self.table_mut::<Pt>(e2.frame()).get(i1);
        if e1.present() {
            Occupancy::Mapped(leaf(e1, va, LeafSize::Size4K))
        } else {
            Occupancy::Hole(Size4K::SIZE)
        }
    }

    /// Resolve `va` through whatever leaf maps it.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<Translation> {
        let (i4, i3, i2, i1) = split_indices(va);
        let e4 = self.pml4_mut().get(i4);
        if !e4.is_table_link() {
            return None;
        }

        let e3 = self.table_mut::<Pdpt>(e4.frame()).get(i3);
        if !e3.present() {
            return None;
        }
        if e3.large_page() {
            return Some(leaf(e3, va, LeafSize::Size1G));
        }

        let e2 = self.table_mut::<Pd>(e3.frame()).get(i2);
        if !e2.present() {
            return None;
        }
        if e2.large_page() {
            return Some(leaf(e2, va, LeafSize::Size2M));
        }

        let e1 = self.table_mut::<Pt>(e2.frame()).get(i1);
        e1.present().then(|| leaf(e1, va, LeafSize::Size4K))
    }

    /// Unlink every user-half subtree and report its frames to `sink`.
    ///
    /// Order per subtree: leaf frames and large-page runs, then the table
    /// holding them, up to the PDPT. The PML4 itself is left to the caller.
    /// Higher-half entries are untouched; they are shared.
    pub fn teardown_lower_half(&self, mut sink: impl FnMut(Reclaim)) {
        for e4 in self.pml4_mut().lower_half_mut() {
            if !e4.is_table_link() {
                e4.clear();
                continue;
            }
            let pdpt_frame = e4.frame();
            for (_, e3) in self.table_mut::<Pdpt>(pdpt_frame).present() {
                if e3.large_page() {
                    sink(Reclaim::Run {
                        base: e3.address(),
                        frames: LeafSize::Size1G.frames(),
                    });
                    continue;
                }
                let pd_frame = e3.frame();
                for (_, e2) in self.table_mut::<Pd>(pd_frame).present() {
                    if e2.large_page() {
                        sink(Reclaim::Run {
                            base: e2.address(),
                            frames: LeafSize::Size2M.frames(),
                        });
                        continue;
                    }
                    let pt_frame = e2.frame();
                    for (_, e1) in self.table_mut::<Pt>(pt_frame).present() {
                        sink(Reclaim::Frame(e1.frame()));
                    }
                    sink(Reclaim::Table(pt_frame));
                }
                sink(Reclaim::Table(pd_frame));
            }
            sink(Reclaim::Table(pdpt_frame));
            e4.clear();
        }
    }

    /// Visit every present leaf in the hierarchy, in address order.
    ///
    /// `lower_only` restricts the walk to the user half.
    pub fn for_each_mapping(&self, lower_only: bool, mut f: impl FnMut(VirtualAddress, Translation)) {
        let pml4 = self.pml4_mut();
        for (i4, e4) in pml4.present() {
            let i4 = i4.as_usize();
            if lower_only && i4 >= KERNEL_PML4_START {
                break;
            }
            if e4.large_page() {
                continue;
            }
            for (i3, e3) in self.table_mut::<Pdpt>(e4.frame()).present() {
                let i3 = i3.as_usize();
                if e3.large_page() {
                    let va = compose_va(i4, i3, 0, 0);
                    f(va, leaf(e3, va, LeafSize::Size1G));
                    continue;
                }
                for (i2, e2) in self.table_mut::<Pd>(e3.frame()).present() {
                    let i2 = i2.as_usize();
                    if e2.large_page() {
                        let va = compose_va(i4, i3, i2, 0);
                        f(va, leaf(e2, va, LeafSize::Size2M));
                        continue;
                    }
                    for (i1, e1) in self.table_mut::<Pt>(e2.frame()).present() {
                        let va = compose_va(i4, i3, i2, i1.as_usize());
                        f(va, leaf(e1, va, LeafSize::Size4K));
                    }
                }
            }
        }
    }
}

fn leaf(e: PageTableEntry, va: VirtualAddress, size: LeafSize) -> Translation {
    let offset = va.as_u64() & (size.bytes() - 1);
    let base = e.address().as_u64() & !(size.bytes() - 1);
    Translation {
        phys: PhysicalAddress::new(base + offset),
        flags: e.flags().difference(PageFlags::LARGE_PAGE),
        size,
    }
}
