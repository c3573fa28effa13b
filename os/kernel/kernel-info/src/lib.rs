//! # Kernel Memory Layout and Boot Interface
//!
//! Fixed layout constants shared by the frame allocator, the paging code and
//! the rest of the kernel, plus the firmware memory-map types handed over at
//! boot.
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │   Identity map (low memory)     │
//! USER_SPACE_BASE       ├─────────────────────────────────┤ 0x0000_0000_0040_0000
//!                       │   User code & data              │
//! USER_HEAP_START       ├─────────────────────────────────┤ 0x0000_0000_1000_0000
//!                       │   User heap (grows up)          │
//!                       │              ...                │
//!                       │   User stack (grows down)       │
//! USER_STACK_TOP        ├─────────────────────────────────┤ 0x0000_7FFF_FFFF_F000
//!                       │   Non-canonical hole            │
//! KERNEL_SPACE_BASE     ├─────────────────────────────────┤ 0xFFFF_8000_0000_0000
//!                       │   Kernel heap (1 GiB)           │
//!                       ├─────────────────────────────────┤ 0xFFFF_8000_4000_0000
//!                       │   Rest of kernel space          │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! Physical memory below [`PMM_ZONE_BASE`](memory::PMM_ZONE_BASE) (1 MiB) is
//! never handed to the frame allocator.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
