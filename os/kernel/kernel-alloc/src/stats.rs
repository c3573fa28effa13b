//! Process-wide VMM counters.

use core::fmt;

/// Aggregate counters, updated under one lock after the per-context lock
/// has been released.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct VmmStats {
    pub contexts_created: u64,
    pub contexts_destroyed: u64,
    /// Live contexts, the kernel context included.
    pub contexts_active: u64,
    /// Mapped 4 KiB pages without `USER`, summed over all contexts.
    pub kernel_pages: u64,
    /// Mapped 4 KiB pages with `USER`, summed over all contexts.
    pub user_pages: u64,
    pub tables_allocated: u64,
    pub tables_freed: u64,
    pub tlb_flushes: u64,
    pub faults_handled: u64,
    pub faults_resolved: u64,
}

impl VmmStats {
    #[must_use]
    pub const fn mapped_pages(&self) -> u64 {
        self.kernel_pages + self.user_pages
    }

    /// Count one newly mapped page.
    pub(crate) const fn page_mapped(&mut self, user: bool) {
        if user {
            self.user_pages += 1;
        } else {
            self.kernel_pages += 1;
        }
    }

    pub(crate) const fn page_unmapped(&mut self, user: bool) {
        if user {
            self.user_pages = self.user_pages.saturating_sub(1);
        } else {
            self.kernel_pages = self.kernel_pages.saturating_sub(1);
        }
    }
}

impl fmt::Display for VmmStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "contexts: {} active ({} created, {} destroyed)",
            self.contexts_active, self.contexts_created, self.contexts_destroyed
        )?;
        writeln!(
            f,
            "pages:    {} mapped ({} kernel, {} user)",
            self.mapped_pages(),
            self.kernel_pages,
            self.user_pages
        )?;
        writeln!(
            f,
            "tables:   {} allocated, {} freed",
            self.tables_allocated, self.tables_freed
        )?;
        write!(
            f,
            "tlb:      {} flushes; faults: {} handled, {} resolved",
            self.tlb_flushes, self.faults_handled, self.faults_resolved
        )
    }
}
