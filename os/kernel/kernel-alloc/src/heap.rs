//! # Kernel Heap
//!
//! `vmalloc` hands out page-granular, virtually contiguous kernel memory
//! from a fixed window in the higher half. Addresses come from a bump
//! cursor that never moves backwards; physical frames are taken one at a
//! time from the frame allocator. Every allocation is recorded by base
//! address so [`Vmm::vfree`] needs no size.
//!
//! The heap window lives in one PML4 slot that is linked into the kernel
//! context at boot, so the mappings are visible in every context.
//!
//! [`Vmm::alloc_pages`] is the general form: with `USER` in the flags it
//! finds a hole in the context's user heap range instead of bumping the
//! kernel cursor.

use crate::context::Context;
use crate::error::VmmError;
use crate::vmm::Vmm;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress, align_down, pages_for};
use kernel_vmem::{Mmu, PageFlags, PhysMapper};
use log::{debug, warn};

/// A live kernel-heap allocation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeapAllocation {
    pub base: VirtualAddress,
    pub pages: u64,
}

/// Snapshot of the kernel heap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeapStats {
    /// Live allocation records.
    pub records: usize,
    /// Pages held by live allocations.
    pub live_pages: u64,
    /// Next address the bump cursor hands out.
    pub cursor: VirtualAddress,
    /// Bytes left between the cursor and the end of the window.
    pub remaining: u64,
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} allocations, {} pages live, cursor {}, {:#x} bytes left",
            self.records, self.live_pages, self.cursor, self.remaining
        )
    }
}

/// Bump cursor plus the allocation records.
pub(crate) struct KernelHeap {
    cursor: u64,
    end: u64,
    records: BTreeMap<u64, HeapAllocation>,
}

impl KernelHeap {
    pub(crate) fn new(base: VirtualAddress, size: u64) -> Self {
        Self {
            cursor: base.as_u64(),
            end: base.as_u64().saturating_add(size),
            records: BTreeMap::new(),
        }
    }

    fn bump(&mut self, pages: u64) -> Result<VirtualAddress, VmmError> {
        let remaining = (self.end - self.cursor) / Size4K::SIZE;
        if pages > remaining {
            return Err(VmmError::HeapExhausted {
                requested: pages,
                remaining,
            });
        }
        let va = VirtualAddress::new(self.cursor);
        self.cursor += pages * Size4K::SIZE;
        Ok(va)
    }

    fn stats(&self) -> HeapStats {
        HeapStats {
            records: self.records.len(),
            live_pages: self.records.values().map(|r| r.pages).sum(),
            cursor: VirtualAddress::new(self.cursor),
            remaining: self.end - self.cursor,
        }
    }
}

impl<M: PhysMapper, U: Mmu> Vmm<M, U> {
    /// Allocate and map `pages` fresh pages.
    ///
    /// - `USER` in `flags`: the first hole in `ctx`'s user heap range
    ///   (`USER_HEAP_START` up to the bottom of the stack window). Frames
    ///   are zeroed.
    /// - otherwise: the next `pages` of the kernel heap window, mapped in
    ///   the kernel context whatever `ctx` is. Heap addresses are never
    ///   handed out twice, not even after a failed allocation.
    ///
    /// # Errors
    /// [`VmmError::ZeroSize`], [`VmmError::HeapExhausted`],
    /// [`VmmError::NoVirtualSpace`], [`VmmError::OutOfMemory`]. Frames
    /// acquired before a failure are returned.
    pub fn alloc_pages(&self, ctx: &Context, pages: u64, flags: PageFlags) -> Result<VirtualAddress, VmmError> {
        if pages == 0 {
            return self.fail(VmmError::ZeroSize);
        }

        if flags.is_user() {
            if ctx.is_kernel() {
                return self.fail(VmmError::InvalidArgument(
                    "user pages need a user context",
                ));
            }
            let floor = ctx.stack_top().as_u64().saturating_sub(self.config.user_stack_max);
            let range = ctx.user_heap_start()..VirtualAddress::new(floor);
            let Some(bytes) = pages.checked_mul(Size4K::SIZE) else {
                return self.fail(VmmError::NoVirtualSpace(pages));
            };
            let va = self.find_free_region(ctx, range, bytes)?;
            let r = self.back_range(ctx, va, pages, flags, true);
            self.record(r)?;
            ctx.raise_heap_cursor(va + bytes);
            return Ok(va);
        }

        let va = match self.heap.with_lock(|h| h.bump(pages)) {
            Ok(va) => va,
            Err(e) => {
                warn!("VMM: {e}");
                return self.fail(e);
            }
        };
        let r = self.back_range(&self.kernel, va, pages, flags, false);
        self.record(r)?;
        Ok(va)
    }

    /// Unmap `pages` pages at `va` and free their frames.
    ///
    /// Higher-half pages are unmapped in the kernel context. Holes are
    /// skipped; frames the allocator does not own are unmapped but not
    /// freed. Returns how many frames went back.
    ///
    /// # Errors
    /// Address errors and [`VmmError::ZeroSize`].
    pub fn free_pages(&self, ctx: &Context, va: VirtualAddress, pages: u64) -> Result<u64, VmmError> {
        let ctx = if va.is_higher_half() { &*self.kernel } else { ctx };
        self.record(Self::check_run(ctx, va, pages))?;
        let mut freed = 0;
        for i in 0..pages {
            let page = va + i * Size4K::SIZE;
            let Ok(pa) = self.unmap_one(ctx, page) else {
                continue;
            };
            if self.frames.owns(pa) {
                self.frames.free(pa, 1);
                freed += 1;
            }
        }
        Ok(freed)
    }

    /// Allocate `size` bytes (rounded up to pages) of kernel memory.
    ///
    /// The memory is mapped read-write, not executable, and not zeroed.
    ///
    /// # Errors
    /// As [`alloc_pages`](Self::alloc_pages).
    pub fn vmalloc(&self, size: u64) -> Result<VirtualAddress, VmmError> {
        let pages = pages_for::<Size4K>(size);
        let base = self.alloc_pages(&self.kernel, pages, PageFlags::KERNEL_RW)?;
        self.heap
            .with_lock(|h| h.records.insert(base.as_u64(), HeapAllocation { base, pages }));
        debug!("VMM: vmalloc({size:#x}) = {base} ({pages} pages)");
        Ok(base)
    }

    /// [`vmalloc`](Self::vmalloc) with the memory zero-filled.
    ///
    /// # Errors
    /// As [`alloc_pages`](Self::alloc_pages).
    pub fn vzalloc(&self, size: u64) -> Result<VirtualAddress, VmmError> {
        let base = self.vmalloc(size)?;
        for i in 0..pages_for::<Size4K>(size) {
            if let Some(pa) = self.virt_to_phys(&self.kernel, base + i * Size4K::SIZE) {
                self.mapper.zero_frame(pa.page::<Size4K>());
            }
        }
        Ok(base)
    }

    /// Release a [`vmalloc`](Self::vmalloc) allocation by its base address.
    ///
    /// Without a record for `va` the page containing `va` alone is unmapped
    /// and its frame freed. Returns how many frames went back.
    ///
    /// # Errors
    /// [`VmmError::NotMapped`] if there is no record and nothing is mapped
    /// at `va`.
    pub fn vfree(&self, va: VirtualAddress) -> Result<u64, VmmError> {
        if let Some(rec) = self.heap.with_lock(|h| h.records.remove(&va.as_u64())) {
            let freed = self.free_pages(&self.kernel, rec.base, rec.pages)?;
            debug!("VMM: vfree({va}) released {freed} frames");
            return Ok(freed);
        }

        let ctx = if va.is_higher_half() {
            Arc::clone(&self.kernel)
        } else {
            self.current()
        };
        let page = VirtualAddress::new(align_down(va.as_u64(), Size4K::SIZE));
        warn!("VMM: vfree({va}) without a record, releasing the single page {page}");
        if !self.is_mapped(&ctx, page) {
            return self.fail(VmmError::NotMapped(va));
        }
        self.free_pages(&ctx, page, 1)
    }

    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.with_lock(|h| h.stats())
    }

    /// Visit every live heap allocation in address order.
    pub fn for_each_allocation(&self, mut f: impl FnMut(HeapAllocation)) {
        self.heap.with_lock(|h| h.records.values().copied().for_each(&mut f));
    }
}
