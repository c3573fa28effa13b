//! # Kernel Memory Management
//!
//! Physical frame allocation and virtual address spaces for the kernel.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │  Kernel heap (vmalloc / vzalloc / vfree)            │
//! │    • bump cursor over a 1 GiB higher-half window    │
//! │    • allocation records keyed by base address       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │  Mapper and contexts                                │
//! │    • map / unmap / protect on 4 KiB pages           │
//! │    • shared kernel half, private user half          │
//! │    • page-fault resolver                            │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │  Frame allocator                                    │
//! │    • one state byte per 4 KiB frame above 1 MiB     │
//! │    • wrap-around first-fit search from a cursor     │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Everything hangs off one [`Vmm`] value, created by [`Vmm::init`] from
//! the firmware memory map. Page-table frames are reached through a
//! [`PhysMapper`](kernel_vmem::PhysMapper); [`OffsetPhysMapper`] covers the
//! identity map used during bootstrap and any fixed-offset direct map.
//!
//! ## Identity map and user contexts
//!
//! The low identity map built by [`Vmm::init`] exists in the kernel context
//! only; user contexts share the kernel half and nothing else. An identity
//! [`OffsetPhysMapper`] is therefore enough for bootstrap and for work in
//! the kernel context. Before the first [`Vmm::switch_to`] onto a user
//! context on real hardware, the running code, its stack and the mapper's
//! window onto physical memory must all live in the kernel half, for
//! example a direct map set up with [`Vmm::map_pages`] in the kernel
//! context and a mapper built with [`OffsetPhysMapper::new`] at that offset.
//!
//! ## Errors
//!
//! Recoverable failures come back as [`VmmError`] and are also stored in
//! [`Vmm::last_error`]. Broken invariants (double free, freeing outside the
//! zone, unusable memory map at boot) panic.
//!
//! ## Example
//!
//! ```no_run
//! # use kernel_alloc::*;
//! # use kernel_info::boot::{MemoryRegion, MemoryRegionKind};
//! # use kernel_memory_addresses::PhysicalAddress;
//! # fn demo<U: kernel_vmem::Mmu>(mmu: U) -> Result<(), VmmError> {
//! let regions = [MemoryRegion::new(0, 64 << 20, MemoryRegionKind::Usable)];
//! let image = PhysicalAddress::new(0x10_0000)..PhysicalAddress::new(0x20_0000);
//! // Safety: physical memory is identity mapped while booting. This example
//! // stays in the kernel context, so the identity map remains active.
//! let mapper = unsafe { OffsetPhysMapper::identity() };
//! let vmm = Vmm::init(mapper, mmu, &regions, image, VmmConfig::default());
//!
//! let buf = vmm.vzalloc(8192)?;
//! vmm.vfree(buf)?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod context;
mod debug;
pub mod error;
pub mod fault;
pub mod frame_alloc;
pub mod heap;
mod mapper;
pub mod phys_mapper;
pub mod stats;
pub mod vmm;

pub use context::{Context, ContextId, PageCounts, TeardownReport};
pub use error::VmmError;
pub use fault::{FaultResolution, PageFaultError};
pub use frame_alloc::{FrameAllocator, FrameError, FrameInitError, FrameState, FrameStats, FrameZone};
pub use heap::{HeapAllocation, HeapStats};
pub use phys_mapper::OffsetPhysMapper;
pub use stats::VmmStats;
pub use vmm::{Vmm, VmmConfig};
