//! # Mapper
//!
//! Map, unmap and protect 4 KiB pages in a [`Context`].
//!
//! - Both addresses must be page aligned and the virtual address canonical.
//!   User contexts may only touch the lower half; the shared higher half is
//!   changed through the kernel context.
//! - Mapping an already present page succeeds only if address and flags
//!   match (ignoring `ACCESSED`/`DIRTY`); otherwise it is a conflict and the
//!   existing mapping stays.
//! - Unmapping never frees the backing frame. The frame belongs to whoever
//!   mapped it.
//! - Every change to a leaf invalidates that page's TLB entry.

use crate::context::Context;
use crate::error::VmmError;
use crate::vmm::{TableCounter, Vmm};
use alloc::vec::Vec;
use core::ops::Range;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K, VirtualAddress, align_up, pages_for};
use kernel_vmem::{Mmu, Occupancy, PageFlags, PageTableEntry, PageTables, PhysMapper, TableDepth, Translation};
use log::trace;

/// Result of installing one leaf.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Installed {
    New,
    AlreadyPresent,
}

impl<M: PhysMapper, U: Mmu> Vmm<M, U> {
    fn check_page(ctx: &Context, va: VirtualAddress) -> Result<(), VmmError> {
        if !va.is_aligned::<Size4K>() {
            return Err(VmmError::Misaligned(va.as_u64()));
        }
        if !va.is_canonical() {
            return Err(VmmError::InvalidArgument("non-canonical virtual address"));
        }
        if va.is_higher_half() && !ctx.is_kernel() {
            return Err(VmmError::InvalidArgument(
                "kernel-half address in a user context",
            ));
        }
        Ok(())
    }

    /// Validate both ends of `[va, va + pages * 4K)`.
    pub(crate) fn check_run(ctx: &Context, va: VirtualAddress, pages: u64) -> Result<(), VmmError> {
        if pages == 0 {
            return Err(VmmError::ZeroSize);
        }
        Self::check_page(ctx, va)?;
        let last = pages
            .checked_sub(1)
            .and_then(|n| n.checked_mul(Size4K::SIZE))
            .and_then(|off| va.checked_add(off))
            .ok_or(VmmError::InvalidArgument("range overflows the address space"))?;
        Self::check_page(ctx, last)
    }

    fn flush(&self, va: VirtualAddress) {
        self.mmu.invalidate_page(va);
    }

    fn map_one(
        &self,
        ctx: &Context,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<Installed, VmmError> {
        Self::check_page(ctx, va)?;
        if !pa.is_aligned::<Size4K>() {
            return Err(VmmError::Misaligned(pa.as_u64()));
        }
        let flags = flags
            .union(PageFlags::PRESENT)
            .difference(PageFlags::LARGE_PAGE);
        let user = flags.is_user();

        let counter = TableCounter::new(&self.frames);
        let outcome = ctx.with_state(|state| {
            let tables = PageTables::new(&self.mapper, ctx.root());
            let entry = tables
                .leaf_entry_mut(&counter, va, user)
                .map_err(|e| VmmError::from_walk(e, va))?;
            if entry.present() {
                if entry.address() == pa && entry.flags().comparable() == flags.comparable() {
                    return Ok(Installed::AlreadyPresent);
                }
                return Err(VmmError::MappingConflict {
                    va,
                    existing: entry.address(),
                });
            }
            *entry = PageTableEntry::with_address(pa, flags);
            state.pages.add(user);
            Ok(Installed::New)
        });

        let installed = outcome == Ok(Installed::New);
        if installed {
            self.flush(va);
            trace!("VMM: ctx {} map {va} -> {pa} {flags:?}", ctx.id());
        }
        let tables = counter.allocated();
        self.stats.with_lock(|s| {
            s.tables_allocated += tables;
            if installed {
                s.page_mapped(user);
                s.tlb_flushes += 1;
            }
        });
        outcome
    }

    pub(crate) fn unmap_one(&self, ctx: &Context, va: VirtualAddress) -> Result<PhysicalAddress, VmmError> {
        let (pa, user) = ctx.with_state(|state| {
            let tables = PageTables::new(&self.mapper, ctx.root());
            match tables.get_pte_noalloc(va) {
                Some(entry) if entry.present() => {
                    let taken = (entry.address(), entry.user());
                    entry.clear();
                    state.pages.remove(taken.1);
                    Ok(taken)
                }
                Some(_) => Err(VmmError::NotMapped(va)),
                None => Err(match tables.translate(va) {
                    Some(_) => VmmError::LargePage(va),
                    None => VmmError::NotMapped(va),
                }),
            }
        })?;
        self.flush(va);
        self.stats.with_lock(|s| {
            s.page_unmapped(user);
            s.tlb_flushes += 1;
        });
        trace!("VMM: ctx {} unmap {va} (was {pa})", ctx.id());
        Ok(pa)
    }

    /// Map one page `va -> pa`. `PRESENT` is always set.
    ///
    /// # Errors
    /// - [`VmmError::Misaligned`] / [`VmmError::InvalidArgument`] for bad addresses.
    /// - [`VmmError::MappingConflict`] if `va` is mapped differently.
    /// - [`VmmError::LargePage`] if a large page covers `va`.
    /// - [`VmmError::OutOfMemory`] if a page table could not be allocated.
    pub fn map_page(
        &self,
        ctx: &Context,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        self.record(self.map_one(ctx, va, pa, flags).map(|_| ()))
    }

    /// Map `pages` consecutive pages starting at `va -> pa`.
    ///
    /// All or nothing: on failure every page this call installed is unmapped
    /// again before the error is returned. Pages that were already mapped
    /// identically are left as they were.
    ///
    /// # Errors
    /// As [`map_page`](Self::map_page), plus [`VmmError::ZeroSize`].
    pub fn map_pages(
        &self,
        ctx: &Context,
        va: VirtualAddress,
        pa: PhysicalAddress,
        pages: u64,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        self.record(Self::check_run(ctx, va, pages))?;
        if pa.checked_add(pages * Size4K::SIZE).is_none() {
            return self.fail(VmmError::InvalidArgument("physical range overflows"));
        }

        let mut installed = Vec::new();
        for i in 0..pages {
            let off = i * Size4K::SIZE;
            let page = va + off;
            match self.map_one(ctx, page, pa + off, flags) {
                Ok(Installed::New) => installed.push(page),
                Ok(Installed::AlreadyPresent) => {}
                Err(e) => {
                    for &undo in installed.iter().rev() {
                        let undone = self.unmap_one(ctx, undo);
                        debug_assert!(undone.is_ok(), "rollback of {undo}: {undone:?}");
                    }
                    trace!(
                        "VMM: ctx {} rolled back {} of {pages} pages at {va}: {e}",
                        ctx.id(),
                        installed.len()
                    );
                    return self.fail(e);
                }
            }
        }
        Ok(())
    }

    /// Remove the mapping of `va` and return the frame it pointed to. The
    /// frame is not freed.
    ///
    /// # Errors
    /// [`VmmError::NotMapped`], [`VmmError::LargePage`], or an address error.
    pub fn unmap_page(&self, ctx: &Context, va: VirtualAddress) -> Result<PhysicalAddress, VmmError> {
        self.record(Self::check_page(ctx, va))?;
        self.record(self.unmap_one(ctx, va))
    }

    /// Unmap every mapped page in `[va, va + pages * 4K)`, skipping holes.
    /// Returns how many pages were unmapped. Frames are not freed.
    ///
    /// # Errors
    /// Address errors and [`VmmError::ZeroSize`] only; holes are not errors.
    pub fn unmap_pages(&self, ctx: &Context, va: VirtualAddress, pages: u64) -> Result<u64, VmmError> {
        self.record(Self::check_run(ctx, va, pages))?;
        let mut removed = 0;
        for i in 0..pages {
            if self.unmap_one(ctx, va + i * Size4K::SIZE).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Rewrite the flags of every page in `[va, va + size)`.
    ///
    /// The physical address and the hardware `ACCESSED`/`DIRTY` bits are
    /// kept; `PRESENT` is always set. Nothing changes unless every page in
    /// the range is mapped by a 4 KiB leaf.
    ///
    /// # Errors
    /// [`VmmError::NotMapped`] / [`VmmError::LargePage`] for the first page
    /// that cannot be rewritten, [`VmmError::ZeroSize`], address errors.
    pub fn protect(&self, ctx: &Context, va: VirtualAddress, size: u64, flags: PageFlags) -> Result<(), VmmError> {
        let pages = pages_for::<Size4K>(size);
        self.record(Self::check_run(ctx, va, pages))?;
        let flags = flags
            .union(PageFlags::PRESENT)
            .difference(PageFlags::LARGE_PAGE)
            .difference(PageFlags::HARDWARE_MANAGED);
        let to_user = flags.is_user();

        let counter = TableCounter::new(&self.frames);
        let moved = ctx.with_state(|state| {
            let tables = PageTables::new(&self.mapper, ctx.root());
            for i in 0..pages {
                let page = va + i * Size4K::SIZE;
                match tables.get_pte_noalloc(page) {
                    Some(e) if e.present() => {}
                    Some(_) => return Err(VmmError::NotMapped(page)),
                    None => {
                        return Err(match tables.translate(page) {
                            Some(_) => VmmError::LargePage(page),
                            None => VmmError::NotMapped(page),
                        });
                    }
                }
            }

            let mut moved: (u64, u64) = (0, 0);
            for i in 0..pages {
                let page = va + i * Size4K::SIZE;
                if to_user {
                    tables
                        .get_or_create_table(&counter, page, TableDepth::Pt, true)
                        .map_err(|e| VmmError::from_walk(e, page))?;
                }
                let Some(entry) = tables.get_pte_noalloc(page) else {
                    return Err(VmmError::NotMapped(page));
                };
                let was_user = entry.user();
                let kept = entry.flags().intersection(PageFlags::HARDWARE_MANAGED);
                entry.set_flags(flags.union(kept));
                if was_user != to_user {
                    state.pages.remove(was_user);
                    state.pages.add(to_user);
                    if to_user {
                        moved.0 += 1;
                    } else {
                        moved.1 += 1;
                    }
                }
                self.flush(page);
            }
            Ok(moved)
        });
        let (to_user_count, to_kernel_count) = self.record(moved)?;

        let tables = counter.allocated();
        self.stats.with_lock(|s| {
            s.tables_allocated += tables;
            s.tlb_flushes += pages;
            s.kernel_pages = (s.kernel_pages + to_kernel_count).saturating_sub(to_user_count);
            s.user_pages = (s.user_pages + to_user_count).saturating_sub(to_kernel_count);
        });
        trace!("VMM: ctx {} protect {va}..+{pages} pages {flags:?}", ctx.id());
        Ok(())
    }

    /// Full translation of `va`, including large pages.
    #[must_use]
    pub fn translate(&self, ctx: &Context, va: VirtualAddress) -> Option<Translation> {
        ctx.with_state(|_| PageTables::new(&self.mapper, ctx.root()).translate(va))
    }

    /// Physical address backing `va`, in-page offset included.
    #[must_use]
    pub fn virt_to_phys(&self, ctx: &Context, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.translate(ctx, va).map(|t| t.phys)
    }

    #[must_use]
    pub fn is_mapped(&self, ctx: &Context, va: VirtualAddress) -> bool {
        self.translate(ctx, va).is_some()
    }

    /// Flags of the leaf mapping `va`.
    #[must_use]
    pub fn get_flags(&self, ctx: &Context, va: VirtualAddress) -> Option<PageFlags> {
        self.translate(ctx, va).map(|t| t.flags)
    }

    /// First page-aligned hole of at least `size` bytes inside `range`.
    ///
    /// Absent tables are skipped by their whole span and large pages as a
    /// whole; only populated page tables are scanned page by page.
    ///
    /// # Errors
    /// [`VmmError::NoVirtualSpace`] if no hole fits, [`VmmError::ZeroSize`].
    pub fn find_free_region(
        &self,
        ctx: &Context,
        range: Range<VirtualAddress>,
        size: u64,
    ) -> Result<VirtualAddress, VmmError> {
        let pages = pages_for::<Size4K>(size);
        if pages == 0 {
            return self.fail(VmmError::ZeroSize);
        }
        let end = range.end.as_u64();
        let first = align_up(range.start.as_u64(), Size4K::SIZE);
        let fits = pages
            .checked_mul(Size4K::SIZE)
            .zip(first)
            .filter(|&(need, first)| first <= end && need <= end - first);
        let Some((need, first)) = fits else {
            return self.fail(VmmError::NoVirtualSpace(pages));
        };
        let found = ctx.with_state(|_| {
            let tables = PageTables::new(&self.mapper, ctx.root());
            let mut start = first;
            let mut cursor = start;
            loop {
                if cursor - start >= need {
                    return Some(VirtualAddress::new(start));
                }
                if end.saturating_sub(cursor) < Size4K::SIZE {
                    return None;
                }
                match tables.occupancy(VirtualAddress::new(cursor)) {
                    Occupancy::Hole(span) => {
                        cursor = (cursor & !(span - 1)).saturating_add(span).min(end);
                    }
                    Occupancy::Mapped(t) => {
                        let span = t.size.bytes();
                        cursor = (cursor & !(span - 1)).checked_add(span)?;
                        start = cursor;
                    }
                }
            }
        });
        match found {
            Some(va) => Ok(va),
            None => self.fail(VmmError::NoVirtualSpace(pages)),
        }
    }

    /// Back `[va, va + size)` with fresh zeroed frames.
    ///
    /// All or nothing: on failure the pages mapped so far are unmapped and
    /// their frames freed.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`], [`VmmError::MappingConflict`] if part of
    /// the range is already mapped, address errors.
    pub fn reserve_region(&self, ctx: &Context, va: VirtualAddress, size: u64, flags: PageFlags) -> Result<(), VmmError> {
        let pages = pages_for::<Size4K>(size);
        self.record(Self::check_run(ctx, va, pages))?;
        let r = self.back_range(ctx, va, pages, flags, true);
        self.record(r)
    }

    /// Map `pages` fresh frames at `va`, undoing everything on failure.
    pub(crate) fn back_range(
        &self,
        ctx: &Context,
        va: VirtualAddress,
        pages: u64,
        flags: PageFlags,
        zeroed: bool,
    ) -> Result<(), VmmError> {
        let mut installed: Vec<(VirtualAddress, PhysicalAddress)> = Vec::new();
        for i in 0..pages {
            let page = va + i * Size4K::SIZE;
            let frame = if zeroed {
                self.frames.alloc_zeroed(&self.mapper, 1)
            } else {
                self.frames.alloc(1)
            };
            let step = frame
                .map_err(|_| VmmError::OutOfMemory)
                .and_then(|frame| match self.map_one(ctx, page, frame, flags) {
                    Ok(_) => Ok(frame),
                    Err(e) => {
                        self.frames.free(frame, 1);
                        Err(e)
                    }
                });
            match step {
                Ok(frame) => installed.push((page, frame)),
                Err(e) => {
                    for &(undo, frame) in installed.iter().rev() {
                        let undone = self.unmap_one(ctx, undo);
                        debug_assert!(undone.is_ok(), "rollback of {undo}: {undone:?}");
                        self.frames.free(frame, 1);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Walk `[va, va + len)` of `ctx` in per-frame chunks.
    #[allow(clippy::cast_possible_truncation)] // in-frame offsets
    fn for_each_chunk(
        &self,
        ctx: &Context,
        va: VirtualAddress,
        len: usize,
        mut f: impl FnMut(&mut [u8], usize),
    ) -> Result<(), VmmError> {
        let mut done = 0usize;
        while done < len {
            let at = va
                .checked_add(done as u64)
                .ok_or(VmmError::InvalidArgument("range overflows the address space"))?;
            let phys = self.virt_to_phys(ctx, at).ok_or(VmmError::NotMapped(at))?;
            let offset = phys.offset::<Size4K>() as usize;
            let chunk = (Size4K::SIZE as usize - offset).min(len - done);
            // Safety: the frame is mapped in `ctx`; the copy stays inside it.
            let bytes = unsafe { self.mapper.frame_bytes_mut(phys.page::<Size4K>()) };
            f(&mut bytes[offset..offset + chunk], done);
            done += chunk;
        }
        Ok(())
    }

    /// Copy `data` into the mapped range at `va` of `ctx`.
    ///
    /// Goes through the page tables and the physical mapper, so `ctx` need
    /// not be the active context.
    ///
    /// # Errors
    /// [`VmmError::NotMapped`] at the first unmapped byte. Bytes before it
    /// have been written.
    pub fn copy_to_virt(&self, ctx: &Context, va: VirtualAddress, data: &[u8]) -> Result<(), VmmError> {
        let r = self.for_each_chunk(ctx, va, data.len(), |dst, done| {
            dst.copy_from_slice(&data[done..done + dst.len()]);
        });
        self.record(r)
    }

    /// Copy from the mapped range at `va` of `ctx` into `out`.
    ///
    /// # Errors
    /// [`VmmError::NotMapped`] at the first unmapped byte.
    pub fn copy_from_virt(&self, ctx: &Context, va: VirtualAddress, out: &mut [u8]) -> Result<(), VmmError> {
        let r = self.for_each_chunk(ctx, va, out.len(), |src, done| {
            out[done..done + src.len()].copy_from_slice(src);
        });
        self.record(r)
    }
}
