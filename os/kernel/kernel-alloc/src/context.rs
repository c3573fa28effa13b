//! # Address-Space Contexts
//!
//! A context owns one PML4 and everything reachable from its lower half.
//! The higher half is shared: [`Context::new_user`] copies the kernel
//! context's PML4 entries 256..512 verbatim, so every context sees the same
//! kernel tables.
//!
//! Teardown ([`Context::teardown`]) is the one place where unmapping and
//! freeing physical frames happen together: leaf frames, large-page runs
//! and table frames of the lower half all go back to the frame allocator,
//! then the PML4 itself.

use crate::error::VmmError;
use crate::frame_alloc::FrameAllocator;
use core::fmt;
use kernel_info::memory::{USER_HEAP_START, USER_STACK_TOP};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, PageTables, PhysMapper, Pml4, Reclaim};
use log::{debug, trace};

/// Identifier of a context. The kernel context is `0`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContextId(pub u64);

impl ContextId {
    pub const KERNEL: Self = Self(0);
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Mapped 4 KiB pages in a context. `kernel + user == total`.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PageCounts {
    pub total: u64,
    pub kernel: u64,
    pub user: u64,
}

impl PageCounts {
    pub(crate) const fn add(&mut self, user: bool) {
        self.total += 1;
        if user {
            self.user += 1;
        } else {
            self.kernel += 1;
        }
    }

    pub(crate) const fn remove(&mut self, user: bool) {
        self.total = self.total.saturating_sub(1);
        if user {
            self.user = self.user.saturating_sub(1);
        } else {
            self.kernel = self.kernel.saturating_sub(1);
        }
    }
}

/// Mutable bookkeeping guarded by the context lock.
#[derive(Debug, Copy, Clone)]
pub struct ContextState {
    pub pages: PageCounts,
    /// End of the highest user-heap allocation so far.
    pub heap_cursor: VirtualAddress,
    /// Initial user stack pointer; the stack grows down from here.
    pub stack_top: VirtualAddress,
}

/// Totals reported by [`Context::teardown`].
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct TeardownReport {
    /// Leaf frames returned to the allocator (large pages count per frame).
    pub frames_freed: u64,
    /// Leaf frames not owned by the allocator (MMIO, foreign memory); left alone.
    pub frames_skipped: u64,
    /// Table frames returned, including the PML4.
    pub tables_freed: u64,
}

/// One isolated virtual address space.
pub struct Context {
    id: ContextId,
    root: PhysicalPage<Size4K>,
    kernel: bool,
    state: SpinLock<ContextState>,
}

impl Context {
    fn with_root(id: ContextId, root: PhysicalPage<Size4K>, kernel: bool) -> Self {
        Self {
            id,
            root,
            kernel,
            state: SpinLock::new(ContextState {
                pages: PageCounts::default(),
                heap_cursor: VirtualAddress::new(USER_HEAP_START),
                stack_top: VirtualAddress::new(USER_STACK_TOP),
            }),
        }
    }

    /// The kernel context: an empty PML4.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if no frame is left for the PML4.
    pub(crate) fn new_kernel<M: PhysMapper>(mapper: &M, frames: &FrameAllocator) -> Result<Self, VmmError> {
        let root = PageTables::alloc_table(mapper, frames).map_err(|_| VmmError::OutOfMemory)?;
        debug!("VMM: kernel context root {}", root.base());
        Ok(Self::with_root(ContextId::KERNEL, root, true))
    }

    /// A user context sharing `kernel`'s higher half. The lower half starts
    /// empty.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if no frame is left for the PML4.
    pub(crate) fn new_user<M: PhysMapper>(
        id: ContextId,
        kernel: &Self,
        mapper: &M,
        frames: &FrameAllocator,
    ) -> Result<Self, VmmError> {
        let root = PageTables::alloc_table(mapper, frames).map_err(|_| VmmError::OutOfMemory)?;
        let ctx = Self::with_root(id, root, false);
        // Hold the kernel lock so the higher half is copied in one piece.
        kernel.state.with_lock(|_| {
            // Safety: both frames hold PML4s; `root` is not yet visible to anyone.
            let (dst, src) = unsafe {
                (
                    mapper.table_mut::<Pml4>(root),
                    mapper.table_mut::<Pml4>(kernel.root),
                )
            };
            dst.copy_kernel_half(src);
        });
        debug!("VMM: context {id} created, root {}", root.base());
        Ok(ctx)
    }

    /// Reclaim every lower-half frame and table, then the PML4.
    ///
    /// Leaf frames go back only when the allocator owns them; anything
    /// else (device memory, frames outside the zone) is skipped.
    pub(crate) fn teardown<M: PhysMapper>(self, mapper: &M, frames: &FrameAllocator) -> TeardownReport {
        let mut report = TeardownReport::default();
        self.state.with_lock(|_| {
            let tables = PageTables::new(mapper, self.root);
            tables.teardown_lower_half(|r| match r {
                Reclaim::Frame(frame) => {
                    if frames.owns(frame.base()) {
                        frames.free_4k(frame);
                        report.frames_freed += 1;
                    } else {
                        report.frames_skipped += 1;
                    }
                }
                Reclaim::Run { base, frames: n } => {
                    if frames.owns(base) {
                        frames.free(base, n);
                        report.frames_freed += n;
                    } else {
                        report.frames_skipped += n;
                    }
                }
                Reclaim::Table(frame) => {
                    trace!("VMM: context {} frees table {}", self.id, frame.base());
                    frames.free_4k(frame);
                    report.tables_freed += 1;
                }
            });
        });
        frames.free_4k(self.root);
        report.tables_freed += 1;
        debug!(
            "VMM: context {} destroyed: {} frames, {} tables freed, {} foreign frames skipped",
            self.id, report.frames_freed, report.tables_freed, report.frames_skipped
        );
        report
    }

    #[must_use]
    pub const fn id(&self) -> ContextId {
        self.id
    }

    /// Physical frame of the PML4.
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        self.kernel
    }

    #[must_use]
    pub fn pages(&self) -> PageCounts {
        self.state.with_lock(|s| s.pages)
    }

    #[must_use]
    pub fn stack_top(&self) -> VirtualAddress {
        self.state.with_lock(|s| s.stack_top)
    }

    pub fn set_stack_top(&self, top: VirtualAddress) {
        self.state.with_lock(|s| s.stack_top = top);
    }

    #[must_use]
    pub fn heap_cursor(&self) -> VirtualAddress {
        self.state.with_lock(|s| s.heap_cursor)
    }

    /// Bottom of the user heap range.
    #[must_use]
    pub const fn user_heap_start(&self) -> VirtualAddress {
        VirtualAddress::new(USER_HEAP_START)
    }

    pub(crate) fn raise_heap_cursor(&self, end: VirtualAddress) {
        self.state.with_lock(|s| {
            if end > s.heap_cursor {
                s.heap_cursor = end;
            }
        });
    }

    /// Run `f` with the context lock held.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ContextState) -> R) -> R {
        self.state.with_lock(f)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("kernel", &self.kernel)
            .field("state", &self.state)
            .finish()
    }
}
