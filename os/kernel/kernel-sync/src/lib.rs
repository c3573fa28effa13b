//! # Kernel synchronization primitives
//!
//! The memory manager runs on a single core, interleaved only by interrupts.
//! Every piece of shared allocator state sits behind a [`SpinLock`] held for
//! the shortest possible critical section.
//!
//! Lock order: context lock before frame-allocator lock. The statistics lock
//! is never held while acquiring another lock.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
