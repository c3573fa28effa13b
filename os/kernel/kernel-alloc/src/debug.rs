//! Diagnostics: statistics and page-table dumps through the `log` facade.

use crate::context::Context;
use crate::vmm::Vmm;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{Mmu, PageTableEntry, PhysMapper, Pd, Pdpt, Pml4, Pt, TableIndex, TableLevel};
use log::info;

fn log_entry<L: TableLevel>(index: TableIndex<L>, e: PageTableEntry) {
    info!(
        "{index:?}={:016x} P={} RW={} US={} PS={} NX={}",
        e.into_bits(),
        e.present(),
        e.writable(),
        e.user(),
        e.large_page(),
        e.no_execute()
    );
}

impl<M: PhysMapper, U: Mmu> Vmm<M, U> {
    /// Log VMM, frame allocator and heap statistics.
    pub fn dump_stats(&self) {
        let pmm = self.frames.stats();
        info!("VMM: {}", self.stats());
        info!(
            "PMM: {} frames, {} used, {} free, {} reserved",
            pmm.total, pmm.used, pmm.free, pmm.reserved
        );
        info!("HEAP: {}", self.heap_stats());
        if let Some(e) = self.last_error() {
            info!("VMM: last error: {e}");
        }
    }

    /// Log every leaf mapping of `ctx`. User contexts list their lower
    /// half only; the kernel half is the same everywhere.
    pub fn dump_page_tables(&self, ctx: &Context) {
        let counts = ctx.pages();
        info!(
            "VMM: ctx {} root {} pages {} (kernel {}, user {})",
            ctx.id(),
            ctx.root().base(),
            counts.total,
            counts.kernel,
            counts.user
        );
        ctx.with_state(|_| {
            kernel_vmem::PageTables::new(&self.mapper, ctx.root()).for_each_mapping(!ctx.is_kernel(), |va, t| {
                info!("  {va} -> {} [{}] {:?}", t.phys, t.size, t.flags);
            });
        });
    }

    /// Log the table walk for `va` in `ctx`, level by level.
    pub fn dump_walk(&self, ctx: &Context, va: VirtualAddress) {
        ctx.with_state(|_| {
            // Safety: the context lock is held; every frame below is a live table.
            let pml4 = unsafe { self.mapper.table_mut::<Pml4>(ctx.root()) };
            let i4 = TableIndex::<Pml4>::of(va);
            let e4 = pml4.get(i4);
            log_entry(i4, e4);
            if !e4.present() {
                info!("-- not present at {}", Pml4::NAME);
                return;
            }

            let pdpt = unsafe { self.mapper.table_mut::<Pdpt>(e4.frame()) };
            let i3 = TableIndex::<Pdpt>::of(va);
            let e3 = pdpt.get(i3);
            log_entry(i3, e3);
            if !e3.present() || e3.large_page() {
                info!("-- {} at {}", if e3.present() { "1 GiB leaf" } else { "not present" }, Pdpt::NAME);
                return;
            }

            let pd = unsafe { self.mapper.table_mut::<Pd>(e3.frame()) };
            let i2 = TableIndex::<Pd>::of(va);
            let e2 = pd.get(i2);
            log_entry(i2, e2);
            if !e2.present() || e2.large_page() {
                info!("-- {} at {}", if e2.present() { "2 MiB leaf" } else { "not present" }, Pd::NAME);
                return;
            }

            let pt = unsafe { self.mapper.table_mut::<Pt>(e2.frame()) };
            let i1 = TableIndex::<Pt>::of(va);
            let e1 = pt.get(i1);
            log_entry(i1, e1);
            if e1.present() {
                info!("-- 4 KiB leaf -> {}", e1.address());
            } else {
                info!("-- not present at {}", Pt::NAME);
            }
        });
    }
}
