//! Recoverable memory-manager errors.

use crate::context::ContextId;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::WalkError;

/// A failure the caller is expected to handle.
///
/// Invariant violations (double free, corrupted frame state) are not errors;
/// they panic.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("address {0:#x} is not page aligned")]
    Misaligned(u64),
    #[error("zero-sized request")]
    ZeroSize,
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("no free virtual region of {0} pages")]
    NoVirtualSpace(u64),
    #[error("kernel heap exhausted ({requested} pages requested, {remaining} left)")]
    HeapExhausted { requested: u64, remaining: u64 },
    #[error("{va} is already mapped to {existing}")]
    MappingConflict {
        va: VirtualAddress,
        existing: PhysicalAddress,
    },
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("{0} is covered by a large page")]
    LargePage(VirtualAddress),
    #[error("context {0} is still referenced")]
    ContextInUse(ContextId),
}

impl VmmError {
    pub(crate) const fn from_walk(e: WalkError, va: VirtualAddress) -> Self {
        match e {
            WalkError::OutOfFrames => Self::OutOfMemory,
            WalkError::LargePage(_) => Self::LargePage(va),
        }
    }
}
