#![allow(dead_code)]

use kernel_alloc::{OffsetPhysMapper, Vmm, VmmConfig};
use kernel_info::boot::{MemoryRegion, MemoryRegionKind};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::Mmu;
use std::alloc::{Layout, alloc_zeroed};
use std::sync::Mutex;

/// Simulated physical memory size.
pub const RAM_BYTES: u64 = 8 << 20;

/// Kernel image inside the simulated RAM: 16 frames at 1 MiB.
pub const IMAGE_START: u64 = 0x10_0000;
pub const IMAGE_END: u64 = 0x11_0000;

/// Identity map used by the test machine (one page table's worth).
pub const IDENTITY_BYTES: u64 = 2 << 20;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MmuEvent {
    Invalidate(VirtualAddress),
    LoadRoot(PhysicalPage<Size4K>),
}

/// Records what the memory manager asks the MMU to do.
#[derive(Debug, Default)]
pub struct RecordingMmu {
    pub events: Mutex<Vec<MmuEvent>>,
}

impl RecordingMmu {
    pub fn loads(&self) -> Vec<PhysicalPage<Size4K>> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                MmuEvent::LoadRoot(root) => Some(*root),
                MmuEvent::Invalidate(_) => None,
            })
            .collect()
    }

    pub fn invalidated(&self, va: VirtualAddress) -> bool {
        self.events
            .lock()
            .unwrap()
            .contains(&MmuEvent::Invalidate(va))
    }
}

impl Mmu for RecordingMmu {
    fn invalidate_page(&self, va: VirtualAddress) {
        self.events.lock().unwrap().push(MmuEvent::Invalidate(va));
    }

    fn load_root(&self, root: PhysicalPage<Size4K>) {
        self.events.lock().unwrap().push(MmuEvent::LoadRoot(root));
    }
}

pub type TestVmm = Vmm<OffsetPhysMapper, RecordingMmu>;

/// Leak a zeroed, 4 KiB-aligned buffer standing in for physical memory
/// `[0, bytes)` and return a mapper onto it.
pub fn ram(bytes: u64) -> OffsetPhysMapper {
    let layout = Layout::from_size_align(bytes as usize, 4096).unwrap();
    // Safety: non-zero size; the buffer is never freed.
    let ptr = unsafe { alloc_zeroed(layout) };
    assert!(!ptr.is_null());
    // Safety: physical addresses below `bytes` land inside the buffer.
    unsafe { OffsetPhysMapper::new(ptr as u64) }
}

pub fn usable(base: u64, length: u64) -> MemoryRegion {
    MemoryRegion::new(base, length, MemoryRegionKind::Usable)
}

pub fn image() -> core::ops::Range<PhysicalAddress> {
    PhysicalAddress::new(IMAGE_START)..PhysicalAddress::new(IMAGE_END)
}

pub fn config() -> VmmConfig {
    VmmConfig {
        identity_map_bytes: IDENTITY_BYTES,
        ..VmmConfig::default()
    }
}

/// 8 MiB machine with one usable region.
pub fn machine() -> TestVmm {
    machine_with(config())
}

pub fn machine_with(config: VmmConfig) -> TestVmm {
    Vmm::init(
        ram(RAM_BYTES),
        RecordingMmu::default(),
        &[usable(0, RAM_BYTES)],
        image(),
        config,
    )
}

/// Allocate one free frame straight from the frame allocator.
pub fn frame(vmm: &TestVmm) -> PhysicalAddress {
    vmm.frames().alloc(1).unwrap()
}

pub fn free_frames(vmm: &TestVmm) -> u64 {
    vmm.frames().stats().free
}
