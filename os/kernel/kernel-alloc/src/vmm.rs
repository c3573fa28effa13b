//! # Global VMM State
//!
//! [`Vmm`] is the one memory-manager instance of a kernel: frame allocator,
//! kernel context, current context, kernel-heap state, statistics and the
//! last-error slot. The kernel stores it wherever it likes and passes it
//! around; nothing here is a module-level singleton.
//!
//! Mapping operations live in [`mapper`](crate::mapper), the kernel heap in
//! [`heap`](crate::heap), fault handling in [`fault`](crate::fault).
//!
//! ## Locks
//!
//! Each context, the frame allocator, the heap, the statistics and the
//! current-context slot have their own [`SpinLock`]. A context lock may be
//! held while the frame allocator is locked, never the other way around.
//! Statistics are updated after the context lock is released.

use crate::context::{Context, ContextId, TeardownReport};
use crate::error::VmmError;
use crate::frame_alloc::{FrameAllocator, FrameZone};
use crate::heap::KernelHeap;
use crate::stats::VmmStats;
use alloc::sync::Arc;
use core::cell::Cell;
use core::ops::Range;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::{IDENTITY_LOW_BYTES, KERNEL_HEAP_BASE, KERNEL_HEAP_SIZE, USER_STACK_MAX};
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, Mmu, PageFlags, PageTables, PhysMapper, TableDepth};
use log::{info, warn};

/// Runtime layout knobs. Defaults come from `kernel_info::memory`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VmmConfig {
    /// Bytes of low physical memory identity-mapped into the kernel context.
    pub identity_map_bytes: u64,
    /// First address of the kernel heap window.
    pub heap_base: VirtualAddress,
    /// Size of the kernel heap window in bytes.
    pub heap_size: u64,
    /// How far below `stack_top` a user stack may grow on demand.
    pub user_stack_max: u64,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            identity_map_bytes: IDENTITY_LOW_BYTES,
            heap_base: VirtualAddress::new(KERNEL_HEAP_BASE),
            heap_size: KERNEL_HEAP_SIZE,
            user_stack_max: USER_STACK_MAX,
        }
    }
}

/// Flags of the boot identity map: kernel only, writable, executable, global.
const IDENTITY_FLAGS: PageFlags = PageFlags::PRESENT
    .union(PageFlags::WRITABLE)
    .union(PageFlags::GLOBAL);

/// The memory manager.
pub struct Vmm<M: PhysMapper, U: Mmu> {
    pub(crate) mapper: M,
    pub(crate) mmu: U,
    pub(crate) config: VmmConfig,
    pub(crate) frames: FrameAllocator,
    pub(crate) kernel: Arc<Context>,
    pub(crate) current: SpinLock<Arc<Context>>,
    pub(crate) heap: SpinLock<KernelHeap>,
    pub(crate) stats: SpinLock<VmmStats>,
    last_error: SpinLock<Option<VmmError>>,
    next_id: AtomicU64,
}

impl<M: PhysMapper, U: Mmu> Vmm<M, U> {
    /// Bring up the memory manager from the firmware memory map.
    ///
    /// # Panics
    /// If the frame allocator cannot be built (empty map, no usable memory,
    /// state array outside the zone) or the kernel context cannot be set up.
    /// Nothing can run without either.
    #[must_use]
    pub fn init(
        mapper: M,
        mmu: U,
        regions: &[MemoryRegion],
        kernel_image: Range<PhysicalAddress>,
        config: VmmConfig,
    ) -> Self {
        let zone = match FrameZone::from_memory_map(&mapper, regions, kernel_image) {
            Ok(zone) => zone,
            Err(e) => panic!("PMM: initialization failed: {e}"),
        };
        match Self::with_frames(mapper, mmu, FrameAllocator::new(zone), config) {
            Ok(vmm) => vmm,
            Err(e) => panic!("VMM: initialization failed: {e}"),
        }
    }

    /// Bring up the memory manager on an existing frame allocator.
    ///
    /// Creates the kernel context, identity-maps low memory, links the
    /// kernel-heap PML4 slot so every later context shares the heap tables,
    /// and activates the kernel context.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if the allocator cannot supply the tables,
    /// [`VmmError::InvalidArgument`] for an unusable `config`.
    pub fn with_frames(
        mapper: M,
        mmu: U,
        frames: FrameAllocator,
        config: VmmConfig,
    ) -> Result<Self, VmmError> {
        if !config.heap_base.is_higher_half() || !config.heap_base.is_aligned::<Size4K>() {
            return Err(VmmError::InvalidArgument("heap base must be an aligned higher-half address"));
        }
        if config.heap_size == 0 || config.heap_base.checked_add(config.heap_size - 1).is_none() {
            return Err(VmmError::InvalidArgument("heap window does not fit the address space"));
        }

        let kernel = Arc::new(Context::new_kernel(&mapper, &frames)?);
        let heap = KernelHeap::new(config.heap_base, config.heap_size);
        let vmm = Self {
            current: SpinLock::new(Arc::clone(&kernel)),
            kernel,
            mapper,
            mmu,
            config,
            frames,
            heap: SpinLock::new(heap),
            stats: SpinLock::new(VmmStats {
                contexts_created: 1,
                contexts_active: 1,
                tables_allocated: 1,
                ..VmmStats::default()
            }),
            last_error: SpinLock::new(None),
            next_id: AtomicU64::new(1),
        };

        let identity_pages = config.identity_map_bytes / Size4K::SIZE;
        if identity_pages > 0 {
            vmm.map_pages(
                &vmm.kernel,
                VirtualAddress::zero(),
                PhysicalAddress::zero(),
                identity_pages,
                IDENTITY_FLAGS,
            )?;
        }

        let counter = TableCounter::new(&vmm.frames);
        PageTables::new(&vmm.mapper, vmm.kernel.root())
            .get_or_create_table(&counter, config.heap_base, TableDepth::Pdpt, false)
            .map_err(|e| VmmError::from_walk(e, config.heap_base))?;
        vmm.stats.with_lock(|s| s.tables_allocated += counter.allocated());

        vmm.mmu.load_root(vmm.kernel.root());

        let pmm = vmm.frames.stats();
        info!(
            "VMM: kernel context active, root {}, identity map {:#x} bytes, heap {}..+{:#x}, {} of {} frames free",
            vmm.kernel.root().base(),
            config.identity_map_bytes,
            config.heap_base,
            config.heap_size,
            pmm.free,
            pmm.total
        );
        Ok(vmm)
    }

    /// New user address space sharing the kernel half.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if no frame is left for the PML4.
    pub fn create_context(&self) -> Result<Arc<Context>, VmmError> {
        let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let ctx = self.record(Context::new_user(id, &self.kernel, &self.mapper, &self.frames))?;
        self.stats.with_lock(|s| {
            s.contexts_created += 1;
            s.contexts_active += 1;
            s.tables_allocated += 1;
        });
        Ok(Arc::new(ctx))
    }

    /// Tear down a user address space and return its frames.
    ///
    /// The kernel context is left alone. If `ctx` is the current context the
    /// kernel context is activated first.
    ///
    /// # Errors
    /// [`VmmError::ContextInUse`] if other handles to `ctx` are still alive;
    /// nothing is freed and the current context is unchanged in that case.
    pub fn destroy_context(&self, ctx: Arc<Context>) -> Result<TeardownReport, VmmError> {
        if ctx.is_kernel() {
            warn!("VMM: refusing to destroy the kernel context");
            return Ok(TeardownReport::default());
        }
        // The current slot holds one handle of its own; anything beyond that
        // and ours means the context is still in use.
        let switched = self.current.with_lock(|cur| {
            let is_current = Arc::ptr_eq(cur, &ctx);
            if Arc::strong_count(&ctx) > 1 + usize::from(is_current) {
                return Err(VmmError::ContextInUse(ctx.id()));
            }
            if is_current {
                *cur = Arc::clone(&self.kernel);
            }
            Ok(is_current)
        });
        if self.record(switched)? {
            self.mmu.load_root(self.kernel.root());
        }
        let ctx = match Arc::try_unwrap(ctx) {
            Ok(ctx) => ctx,
            Err(still_shared) => return self.fail(VmmError::ContextInUse(still_shared.id())),
        };

        let pages = ctx.pages();
        let report = ctx.teardown(&self.mapper, &self.frames);
        self.stats.with_lock(|s| {
            s.contexts_destroyed += 1;
            s.contexts_active = s.contexts_active.saturating_sub(1);
            s.tables_freed += report.tables_freed;
            s.kernel_pages = s.kernel_pages.saturating_sub(pages.kernel);
            s.user_pages = s.user_pages.saturating_sub(pages.user);
        });
        Ok(report)
    }

    /// Make `ctx` the active address space.
    ///
    /// A user context does not contain the low identity map. The caller must
    /// be running from kernel-half code and data when switching to one.
    pub fn switch_to(&self, ctx: &Arc<Context>) {
        let changed = self.current.with_lock(|cur| {
            if Arc::ptr_eq(cur, ctx) {
                false
            } else {
                *cur = Arc::clone(ctx);
                true
            }
        });
        if changed {
            self.mmu.load_root(ctx.root());
        }
    }

    #[must_use]
    pub fn current(&self) -> Arc<Context> {
        self.current.with_lock(|cur| Arc::clone(cur))
    }

    #[must_use]
    pub fn current_root(&self) -> PhysicalPage<Size4K> {
        self.current.with_lock(|cur| cur.root())
    }

    #[must_use]
    pub const fn kernel_context(&self) -> &Arc<Context> {
        &self.kernel
    }

    #[must_use]
    pub const fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[must_use]
    pub const fn mmu(&self) -> &U {
        &self.mmu
    }

    #[must_use]
    pub const fn config(&self) -> &VmmConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> VmmStats {
        self.stats.with_lock(|s| *s)
    }

    /// Most recent recoverable error reported by any operation.
    #[must_use]
    pub fn last_error(&self) -> Option<VmmError> {
        self.last_error.with_lock(|e| *e)
    }

    pub(crate) fn fail<T>(&self, e: VmmError) -> Result<T, VmmError> {
        self.last_error.with_lock(|slot| *slot = Some(e));
        Err(e)
    }

    pub(crate) fn record<T>(&self, r: Result<T, VmmError>) -> Result<T, VmmError> {
        r.or_else(|e| self.fail(e))
    }
}

/// Frame source that counts the page-table frames it hands out.
pub(crate) struct TableCounter<'a> {
    frames: &'a FrameAllocator,
    allocated: Cell<u64>,
}

impl<'a> TableCounter<'a> {
    pub(crate) const fn new(frames: &'a FrameAllocator) -> Self {
        Self {
            frames,
            allocated: Cell::new(0),
        }
    }

    pub(crate) fn allocated(&self) -> u64 {
        self.allocated.get()
    }
}

impl FrameAlloc for TableCounter<'_> {
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
        let frame = self.frames.alloc_4k()?;
        self.allocated.set(self.allocated.get() + 1);
        Some(frame)
    }

    fn free_4k(&self, frame: PhysicalPage<Size4K>) {
        self.frames.free_4k(frame);
    }
}
