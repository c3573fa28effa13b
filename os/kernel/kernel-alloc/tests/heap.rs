mod common;

use common::*;
use kernel_alloc::{VmmConfig, VmmError};
use kernel_info::memory::{KERNEL_HEAP_BASE, USER_HEAP_START};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::PageFlags;

const HEAP: VirtualAddress = VirtualAddress::new(KERNEL_HEAP_BASE);

#[test]
fn first_vmalloc_starts_at_the_heap_base_and_round_trips() {
    let vmm = machine();
    let kernel = vmm.kernel_context();

    let buf = vmm.vmalloc(8192).unwrap();
    assert_eq!(buf, HEAP);
    assert_eq!(vmm.get_flags(kernel, buf), Some(PageFlags::KERNEL_RW));

    let pattern = vec![0xAAu8; 8192];
    vmm.copy_to_virt(kernel, buf, &pattern).unwrap();
    let mut back = vec![0u8; 8192];
    vmm.copy_from_virt(kernel, buf, &mut back).unwrap();
    assert_eq!(back, pattern);

    assert_eq!(vmm.vfree(buf), Ok(2));
    assert!(!vmm.is_mapped(kernel, buf));
}

#[test]
fn vfree_undoes_vmalloc_exactly() {
    let vmm = machine();
    // First allocation creates the heap's PD and PT.
    let warm = vmm.vmalloc(1).unwrap();
    vmm.vfree(warm).unwrap();

    let free_before = free_frames(&vmm);
    let records_before = vmm.heap_stats().records;

    let buf = vmm.vmalloc(10_000).unwrap();
    assert_eq!(vmm.heap_stats().records, records_before + 1);
    assert_eq!(vmm.heap_stats().live_pages, 3);
    assert_eq!(free_frames(&vmm), free_before - 3);

    assert_eq!(vmm.vfree(buf), Ok(3));
    assert_eq!(vmm.heap_stats().records, records_before);
    assert_eq!(free_frames(&vmm), free_before);
}

#[test]
fn heap_addresses_are_never_reused() {
    let vmm = machine();
    let a = vmm.vmalloc(4096).unwrap();
    vmm.vfree(a).unwrap();
    let b = vmm.vmalloc(4096).unwrap();
    assert_eq!(b, a + 0x1000);
    assert_eq!(vmm.heap_stats().cursor, HEAP + 0x2000);
}

#[test]
fn vzalloc_hands_out_zeroed_memory_even_from_recycled_frames() {
    let vmm = machine();
    let kernel = vmm.kernel_context();

    let dirty = vmm.vmalloc(4096).unwrap();
    vmm.copy_to_virt(kernel, dirty, &[0x55; 4096]).unwrap();
    let frame = vmm.virt_to_phys(kernel, dirty).unwrap();
    vmm.vfree(dirty).unwrap();

    let clean = vmm.vzalloc(4096).unwrap();
    assert_eq!(vmm.virt_to_phys(kernel, clean), Some(frame));
    let mut back = [0xFFu8; 4096];
    vmm.copy_from_virt(kernel, clean, &mut back).unwrap();
    assert!(back.iter().all(|b| *b == 0));
}

#[test]
fn vfree_without_a_record_releases_one_page() {
    let vmm = machine();
    let kernel = vmm.kernel_context();
    let buf = vmm.vmalloc(8192).unwrap();

    // An interior pointer has no record.
    assert_eq!(vmm.vfree(buf + 0x1010), Ok(1));
    assert!(vmm.is_mapped(kernel, buf));
    assert!(!vmm.is_mapped(kernel, buf + 0x1000));
    assert_eq!(vmm.heap_stats().records, 1);

    // The record frees whatever is still mapped.
    assert_eq!(vmm.vfree(buf), Ok(1));
    assert_eq!(vmm.heap_stats().records, 0);

    assert_eq!(vmm.vfree(buf), Err(VmmError::NotMapped(buf)));
    assert_eq!(vmm.last_error(), Some(VmmError::NotMapped(buf)));
}

#[test]
fn free_pages_validates_the_whole_range() {
    let vmm = machine();
    let kernel = vmm.kernel_context();
    let ctx = vmm.create_context().unwrap();
    let top = VirtualAddress::new(0xFFFF_FFFF_FFFF_F000);

    assert!(matches!(
        vmm.free_pages(kernel, top, 2),
        Err(VmmError::InvalidArgument(_))
    ));
    assert!(matches!(
        vmm.free_pages(&ctx, VirtualAddress::new(0x0000_8000_0000_0000), 1),
        Err(VmmError::InvalidArgument(_))
    ));
    // The run would end in the kernel half.
    assert!(matches!(
        vmm.free_pages(&ctx, VirtualAddress::new(0x0000_7FFF_FFFF_F000), 2),
        Err(VmmError::InvalidArgument(_))
    ));
    assert_eq!(
        vmm.free_pages(kernel, HEAP + 0x10, 1),
        Err(VmmError::Misaligned(HEAP.as_u64() + 0x10))
    );
    assert_eq!(vmm.free_pages(kernel, HEAP, 0), Err(VmmError::ZeroSize));
    assert_eq!(vmm.last_error(), Some(VmmError::ZeroSize));

    let buf = vmm.vmalloc(4096).unwrap();
    assert_eq!(vmm.free_pages(kernel, buf, 1), Ok(1));
}

#[test]
fn heap_window_exhaustion_is_recoverable() {
    let vmm = machine_with(VmmConfig {
        heap_size: 4 * 4096,
        ..config()
    });

    assert_eq!(
        vmm.vmalloc(5 * 4096),
        Err(VmmError::HeapExhausted {
            requested: 5,
            remaining: 4
        })
    );
    let buf = vmm.vmalloc(4 * 4096).unwrap();
    assert_eq!(buf, HEAP);
    assert_eq!(
        vmm.vmalloc(1),
        Err(VmmError::HeapExhausted {
            requested: 1,
            remaining: 0
        })
    );
    assert_eq!(vmm.heap_stats().remaining, 0);
}

#[test]
fn frame_exhaustion_returns_partial_frames() {
    let vmm = machine();
    let warm = vmm.vmalloc(1).unwrap();
    vmm.vfree(warm).unwrap();

    let free = free_frames(&vmm);
    for _ in 1..free {
        vmm.frames().alloc(1).unwrap();
    }
    assert_eq!(free_frames(&vmm), 1);

    assert_eq!(vmm.vmalloc(8192), Err(VmmError::OutOfMemory));
    assert_eq!(free_frames(&vmm), 1);
    assert_eq!(vmm.heap_stats().records, 0);
    assert!(!vmm.is_mapped(vmm.kernel_context(), HEAP + 0x1000));
}

#[test]
fn vmalloc_rejects_zero_bytes() {
    let vmm = machine();
    assert_eq!(vmm.vmalloc(0), Err(VmmError::ZeroSize));
}

#[test]
fn user_pages_come_from_the_user_heap_range() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    let start = VirtualAddress::new(USER_HEAP_START);

    let a = vmm.alloc_pages(&ctx, 2, PageFlags::USER_RW).unwrap();
    assert_eq!(a, start);
    assert_eq!(ctx.heap_cursor(), start + 0x2000);
    let b = vmm.alloc_pages(&ctx, 1, PageFlags::USER_RW).unwrap();
    assert_eq!(b, start + 0x2000);
    assert_eq!(vmm.get_flags(&ctx, b), Some(PageFlags::USER_RW));

    // Holes are reused; the cursor only records the high-water mark.
    assert_eq!(vmm.free_pages(&ctx, a, 2), Ok(2));
    let c = vmm.alloc_pages(&ctx, 1, PageFlags::USER_RW).unwrap();
    assert_eq!(c, start);
    assert_eq!(ctx.heap_cursor(), start + 0x3000);

    assert!(matches!(
        vmm.alloc_pages(vmm.kernel_context(), 1, PageFlags::USER_RW),
        Err(VmmError::InvalidArgument(_))
    ));
}
