//! # MMU Control
//!
//! The two hardware operations the memory manager needs: dropping one cached
//! translation and switching the active address space.

use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// Translation-cache and root-register control.
///
/// Single core only: there is no cross-core shootdown.
pub trait Mmu {
    /// Drop the cached translation for the page containing `va`.
    fn invalidate_page(&self, va: VirtualAddress);

    /// Make `root` the active top-level table. Flushes all non-global
    /// translations.
    fn load_root(&self, root: PhysicalPage<Size4K>);
}

/// The real thing: `invlpg` and `mov cr3`.
#[cfg(target_arch = "x86_64")]
#[derive(Debug)]
pub struct X86Mmu {
    _private: (),
}

#[cfg(target_arch = "x86_64")]
impl X86Mmu {
    /// # Safety
    /// Must run at CPL0 with paging enabled, and every root later passed to
    /// [`Mmu::load_root`] must map the currently executing code and stack.
    /// Roots of user address spaces only share the kernel half, so code that
    /// switches to them has to run from kernel-half addresses.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }

    /// Root currently loaded in CR3.
    #[must_use]
    pub fn active_root(&self) -> PhysicalPage<Size4K> {
        let cr3: u64;
        // Safety: reading CR3 has no side effects at CPL0.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        PhysicalPage::from_addr(kernel_memory_addresses::PhysicalAddress::new(
            cr3 & crate::entry::ADDRESS_MASK,
        ))
    }
}

#[cfg(target_arch = "x86_64")]
impl Mmu for X86Mmu {
    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        // Safety: constructing `X86Mmu` asserted CPL0.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }

    #[inline]
    fn load_root(&self, root: PhysicalPage<Size4K>) {
        // Safety: see `X86Mmu::new`.
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) root.base().as_u64(), options(nostack, preserves_flags));
        }
    }
}
