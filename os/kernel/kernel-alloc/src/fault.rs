//! # Page-Fault Resolver
//!
//! The trap layer hands over CR2 and the pushed error code; the answer is
//! whether execution may resume.
//!
//! Policy: a not-present fault inside the current user context's stack
//! window `[stack_top - user_stack_max, stack_top)` is resolved by mapping
//! one zeroed, user read-write, non-executable frame at the faulting page.
//! Everything else is unresolved; it is logged with a table walk and the
//! trap layer decides what to do (today: halt).

use crate::vmm::Vmm;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress};
use kernel_vmem::{Mmu, PageFlags, PhysMapper};
use log::{debug, error};

/// Page-fault error code layout (x86-64).
///
/// Reference: Intel SDM Vol. 3A, §6.15.1 "Page-Fault Exception (#PF)".
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool,
    /// 0 = read or execute, 1 = write.
    pub write: bool,
    /// 0 = supervisor, 1 = user mode (CPL 3).
    pub user: bool,
    /// Reserved bit set in a paging structure.
    pub reserved_bit: bool,
    /// Instruction fetch.
    pub instruction_fetch: bool,
    /// Protection-key violation (CR4.PKE).
    pub protection_key: bool,
    /// Shadow-stack access (CET).
    pub shadow_stack: bool,
    #[bits(57)]
    __: u64,
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            "Non-present page (page not mapped)"
        } else if self.protection_key() {
            "Protection-key violation"
        } else if self.shadow_stack() {
            "Shadow-stack access violation"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// Outcome reported back to the trap layer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultResolution {
    /// The faulting access can be retried.
    Resolved,
    /// Not handled; the trap layer must not return to the faulting code.
    Unresolved,
}

impl<M: PhysMapper, U: Mmu> Vmm<M, U> {
    /// Try to resolve a page fault at `addr` in the current context.
    #[must_use]
    pub fn handle_page_fault(&self, addr: VirtualAddress, err: PageFaultError) -> FaultResolution {
        self.stats.with_lock(|s| s.faults_handled += 1);

        let ctx = self.current();
        let page = addr.page::<Size4K>().base();
        let resolvable = !ctx.is_kernel()
            && !err.present()
            && !err.reserved_bit()
            && addr.is_lower_half()
            && {
                let top = ctx.stack_top().as_u64();
                let floor = top.saturating_sub(self.config.user_stack_max);
                (floor..top).contains(&addr.as_u64())
            };

        if resolvable && self.reserve_region(&ctx, page, Size4K::SIZE, PageFlags::USER_RW).is_ok() {
            self.stats.with_lock(|s| s.faults_resolved += 1);
            debug!("VMM: ctx {} grew its stack to {page}", ctx.id());
            return FaultResolution::Resolved;
        }

        error!(
            "PAGE FAULT: cr2={addr} err={:#x} ctx {}: {}",
            err.into_bits(),
            ctx.id(),
            err.explain()
        );
        self.dump_walk(&ctx, addr);
        FaultResolution::Unresolved
    }
}
