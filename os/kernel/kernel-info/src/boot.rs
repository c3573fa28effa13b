//! # Firmware Memory Map
//!
//! The boot stage hands the kernel an ordered list of physical regions. Only
//! [`MemoryRegionKind::Usable`] regions at or above
//! [`PMM_ZONE_BASE`](crate::memory::PMM_ZONE_BASE) ever reach the frame
//! allocator.

/// Type tag of a firmware memory region.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Free RAM.
    Usable = 1,
    /// Firmware or device owned; never touched.
    Reserved = 2,
    /// ACPI tables; reclaimable after they were parsed.
    AcpiReclaimable = 3,
    /// ACPI non-volatile storage.
    AcpiNvs = 4,
    /// Defective RAM.
    Bad = 5,
}

impl MemoryRegionKind {
    /// Decode the E820-style type number. Unknown types are treated as reserved.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Usable,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::Bad,
            _ => Self::Reserved,
        }
    }
}

/// One `(base, length, kind)` entry of the firmware memory map.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    /// Physical base address in bytes.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    /// Exclusive end address, saturating at `u64::MAX`.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Usable)
    }
}
