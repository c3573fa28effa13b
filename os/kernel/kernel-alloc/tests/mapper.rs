mod common;

use common::*;
use kernel_alloc::{FrameState, VmmError};
use kernel_info::memory::USER_HEAP_START;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PageFlags;

const VA: VirtualAddress = VirtualAddress::new(0x40_0000);

fn page(n: u64) -> VirtualAddress {
    VA + n * 0x1000
}

#[test]
fn mapping_twice_with_identical_arguments_is_idempotent() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    let pa = frame(&vmm);

    vmm.map_page(&ctx, VA, pa, PageFlags::USER_RW).unwrap();
    vmm.map_page(&ctx, VA, pa, PageFlags::USER_RW).unwrap();

    assert_eq!(ctx.pages().total, 1);
    assert_eq!(ctx.pages().user, 1);
    assert_eq!(vmm.stats().user_pages, 1);
    assert!(vmm.mmu().invalidated(VA));
}

#[test]
fn idempotence_ignores_accessed_and_dirty() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    let pa = frame(&vmm);

    let touched = PageFlags::USER_RW | PageFlags::ACCESSED | PageFlags::DIRTY;
    vmm.map_page(&ctx, VA, pa, touched).unwrap();
    vmm.map_page(&ctx, VA, pa, PageFlags::USER_RW).unwrap();
    assert_eq!(ctx.pages().total, 1);
}

#[test]
fn conflicting_mapping_is_rejected_and_existing_kept() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    let (p1, p2) = (frame(&vmm), frame(&vmm));

    vmm.map_page(&ctx, VA, p1, PageFlags::USER_RW).unwrap();
    let err = vmm.map_page(&ctx, VA, p2, PageFlags::USER_RW).unwrap_err();
    assert_eq!(err, VmmError::MappingConflict { va: VA, existing: p1 });
    assert_eq!(vmm.last_error(), Some(err));

    // Same frame, different permissions is a conflict too.
    assert!(matches!(
        vmm.map_page(&ctx, VA, p1, PageFlags::USER_RX),
        Err(VmmError::MappingConflict { .. })
    ));

    assert_eq!(vmm.virt_to_phys(&ctx, VA), Some(p1));
    assert_eq!(vmm.get_flags(&ctx, VA), Some(PageFlags::USER_RW));
    assert_eq!(ctx.pages().total, 1);
}

#[test]
fn translation_keeps_the_page_offset() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    let pa = frame(&vmm);

    vmm.map_page(&ctx, VA, pa, PageFlags::USER_RW).unwrap();
    assert_eq!(vmm.virt_to_phys(&ctx, VA + 0x123), Some(pa + 0x123));
    assert_eq!(vmm.virt_to_phys(&ctx, VA + 0xFFF), Some(pa + 0xFFF));
    assert!(vmm.is_mapped(&ctx, VA));
    assert!(!vmm.is_mapped(&ctx, page(1)));
}

#[test]
fn unmap_keeps_the_frame_allocated() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    let pa = frame(&vmm);
    vmm.map_page(&ctx, VA, pa, PageFlags::USER_RW).unwrap();

    assert_eq!(vmm.unmap_page(&ctx, VA), Ok(pa));
    assert!(!vmm.is_mapped(&ctx, VA));
    assert_eq!(vmm.frames().state_of(pa), Some(FrameState::Used));
    assert_eq!(ctx.pages().total, 0);
    assert_eq!(vmm.stats().user_pages, 0);

    assert_eq!(vmm.unmap_page(&ctx, VA), Err(VmmError::NotMapped(VA)));
}

#[test]
fn unmap_pages_skips_holes() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    for n in [0, 2, 3] {
        vmm.map_page(&ctx, page(n), frame(&vmm), PageFlags::USER_RW).unwrap();
    }
    assert_eq!(vmm.unmap_pages(&ctx, VA, 5), Ok(3));
    assert_eq!(ctx.pages().total, 0);
    assert_eq!(vmm.unmap_pages(&ctx, VA, 0), Err(VmmError::ZeroSize));
}

#[test]
fn map_pages_maps_a_contiguous_run() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    let pa = vmm.frames().alloc(4).unwrap();

    vmm.map_pages(&ctx, VA, pa, 4, PageFlags::USER_RW).unwrap();
    for n in 0..4 {
        assert_eq!(vmm.virt_to_phys(&ctx, page(n)), Some(pa + n * 0x1000));
    }
    assert_eq!(ctx.pages().user, 4);
}

#[test]
fn failed_run_leaves_nothing_it_mapped() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    let pa = vmm.frames().alloc(5).unwrap();
    let squatter = frame(&vmm);

    // Page 0 already maps what the run wants; page 3 belongs to someone else.
    vmm.map_page(&ctx, page(0), pa, PageFlags::USER_RW).unwrap();
    vmm.map_page(&ctx, page(3), squatter, PageFlags::USER_RW).unwrap();

    let err = vmm.map_pages(&ctx, VA, pa, 5, PageFlags::USER_RW).unwrap_err();
    assert_eq!(
        err,
        VmmError::MappingConflict {
            va: page(3),
            existing: squatter
        }
    );

    assert_eq!(vmm.virt_to_phys(&ctx, page(0)), Some(pa));
    assert!(!vmm.is_mapped(&ctx, page(1)));
    assert!(!vmm.is_mapped(&ctx, page(2)));
    assert_eq!(vmm.virt_to_phys(&ctx, page(3)), Some(squatter));
    assert!(!vmm.is_mapped(&ctx, page(4)));
    assert_eq!(ctx.pages().total, 2);
    assert_eq!(vmm.stats().user_pages, 2);
}

#[test]
fn out_of_frames_midway_rolls_back_every_page() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();

    // Two pages below a 2 MiB boundary, two above it. Tables exist for the
    // lower half of the run only.
    let start = VirtualAddress::new(0x5F_E000);
    let scratch = frame(&vmm);
    vmm.map_page(&ctx, start, scratch, PageFlags::USER_RW).unwrap();
    vmm.unmap_page(&ctx, start).unwrap();

    while vmm.frames().alloc(1).is_ok() {}

    let target = PhysicalAddress::new(0x30_0000);
    let err = vmm.map_pages(&ctx, start, target, 4, PageFlags::USER_RW).unwrap_err();
    assert_eq!(err, VmmError::OutOfMemory);
    assert_eq!(vmm.last_error(), Some(VmmError::OutOfMemory));
    for n in 0..4 {
        assert!(!vmm.is_mapped(&ctx, start + n * 0x1000));
    }
    assert_eq!(ctx.pages().total, 0);
}

#[test]
fn protect_rewrites_flags_and_keeps_the_frame() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    let pa = vmm.frames().alloc(2).unwrap();
    vmm.map_pages(&ctx, VA, pa, 2, PageFlags::USER_RW).unwrap();

    vmm.protect(&ctx, VA, 0x2000, PageFlags::USER_RX).unwrap();
    for n in 0..2 {
        assert_eq!(vmm.get_flags(&ctx, page(n)), Some(PageFlags::USER_RX));
        assert_eq!(vmm.virt_to_phys(&ctx, page(n)), Some(pa + n * 0x1000));
    }

    // PRESENT survives an empty flag set.
    vmm.protect(&ctx, VA, 1, PageFlags::empty()).unwrap();
    assert_eq!(vmm.get_flags(&ctx, VA), Some(PageFlags::PRESENT));
}

#[test]
fn protect_moves_pages_between_kernel_and_user_counts() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    let before = vmm.stats();
    vmm.map_page(&ctx, VA, frame(&vmm), PageFlags::KERNEL_RW).unwrap();
    assert_eq!(ctx.pages().kernel, 1);

    vmm.protect(&ctx, VA, 0x1000, PageFlags::USER_RW).unwrap();
    assert_eq!(ctx.pages().kernel, 0);
    assert_eq!(ctx.pages().user, 1);
    let after = vmm.stats();
    assert_eq!(after.kernel_pages, before.kernel_pages);
    assert_eq!(after.user_pages, before.user_pages + 1);
}

#[test]
fn protect_changes_nothing_if_part_of_the_range_is_unmapped() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    vmm.map_page(&ctx, page(0), frame(&vmm), PageFlags::USER_RW).unwrap();
    vmm.map_page(&ctx, page(2), frame(&vmm), PageFlags::USER_RW).unwrap();

    let err = vmm.protect(&ctx, VA, 0x3000, PageFlags::USER_RX).unwrap_err();
    assert_eq!(err, VmmError::NotMapped(page(1)));
    assert_eq!(vmm.get_flags(&ctx, page(0)), Some(PageFlags::USER_RW));
    assert_eq!(vmm.get_flags(&ctx, page(2)), Some(PageFlags::USER_RW));
}

#[test]
fn address_checks() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    let pa = frame(&vmm);

    assert_eq!(
        vmm.map_page(&ctx, VA + 1, pa, PageFlags::USER_RW),
        Err(VmmError::Misaligned(VA.as_u64() + 1))
    );
    assert_eq!(
        vmm.map_page(&ctx, VA, pa + 8, PageFlags::USER_RW),
        Err(VmmError::Misaligned(pa.as_u64() + 8))
    );
    assert!(matches!(
        vmm.map_page(&ctx, VirtualAddress::new(0x0000_8000_0000_0000), pa, PageFlags::USER_RW),
        Err(VmmError::InvalidArgument(_))
    ));
    // The shared half is only changed through the kernel context.
    assert!(matches!(
        vmm.map_page(&ctx, VirtualAddress::new(0xFFFF_8000_1000_0000), pa, PageFlags::KERNEL_RW),
        Err(VmmError::InvalidArgument(_))
    ));
    assert_eq!(
        vmm.map_pages(&ctx, VA, pa, 0, PageFlags::USER_RW),
        Err(VmmError::ZeroSize)
    );
    assert_eq!(ctx.pages().total, 0);
}

#[test]
fn identity_map_lives_in_the_kernel_context_only() {
    let vmm = machine();
    let kernel = vmm.kernel_context();
    let ctx = vmm.create_context().unwrap();

    let low_va = VirtualAddress::new(0x1234);
    assert_eq!(vmm.virt_to_phys(kernel, low_va), Some(PhysicalAddress::new(0x1234)));
    let flags = vmm.get_flags(kernel, low_va).unwrap();
    assert!(flags.contains(PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::GLOBAL));
    assert!(!flags.contains(PageFlags::NO_EXECUTE));
    assert!(!flags.contains(PageFlags::USER));
    assert_eq!(kernel.pages().kernel, IDENTITY_BYTES / 0x1000);

    assert!(!vmm.is_mapped(&ctx, low_va));
}

#[test]
fn find_free_region_skips_mapped_pages() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    let heap = VirtualAddress::new(USER_HEAP_START);
    vmm.map_page(&ctx, heap, frame(&vmm), PageFlags::USER_RW).unwrap();
    vmm.map_page(&ctx, heap + 0x2000, frame(&vmm), PageFlags::USER_RW).unwrap();

    let window = heap..heap + 0x10_0000;
    assert_eq!(vmm.find_free_region(&ctx, window, 0x2000), Ok(heap + 0x3000));
    assert_eq!(vmm.find_free_region(&ctx, heap..heap + 0x10_0000, 0x1000), Ok(heap + 0x1000));
    assert_eq!(
        vmm.find_free_region(&ctx, heap..heap + 0x3000, 0x2000),
        Err(VmmError::NoVirtualSpace(2))
    );
    assert_eq!(vmm.find_free_region(&ctx, heap..heap + 0x3000, 0), Err(VmmError::ZeroSize));
}

#[test]
fn find_free_region_skips_absent_tables_by_their_span() {
    const GIB: u64 = 1 << 30;
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    let heap = VirtualAddress::new(USER_HEAP_START);
    let far = heap + 512 * GIB;
    vmm.map_page(&ctx, heap, frame(&vmm), PageFlags::USER_RW).unwrap();
    vmm.map_page(&ctx, far, frame(&vmm), PageFlags::USER_RW).unwrap();

    // Larger than the window itself.
    assert_eq!(
        vmm.find_free_region(&ctx, heap..heap + 1024 * GIB, 1024 * GIB + 0x1000),
        Err(VmmError::NoVirtualSpace(1024 * GIB / 0x1000 + 1))
    );
    // Each hole is one page short.
    assert_eq!(
        vmm.find_free_region(&ctx, heap..heap + 1024 * GIB, 512 * GIB),
        Err(VmmError::NoVirtualSpace(512 * GIB / 0x1000))
    );
    assert_eq!(
        vmm.find_free_region(&ctx, heap..heap + 1024 * GIB, 512 * GIB - 0x1000),
        Ok(heap + 0x1000)
    );
    assert_eq!(
        vmm.find_free_region(&ctx, far..heap + 1024 * GIB, 4 * GIB),
        Ok(far + 0x1000)
    );
}

#[test]
fn reserve_region_backs_a_range_with_zeroed_frames() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    let before = free_frames(&vmm);

    vmm.reserve_region(&ctx, VA, 0x3000, PageFlags::USER_RW).unwrap();
    // Three data frames plus PDPT, PD and PT.
    assert_eq!(free_frames(&vmm), before - 6);

    let mut buf = vec![0xFFu8; 0x3000];
    vmm.copy_from_virt(&ctx, VA, &mut buf).unwrap();
    assert!(buf.iter().all(|b| *b == 0));
}

#[test]
fn reserve_region_is_all_or_nothing() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    vmm.map_page(&ctx, page(2), frame(&vmm), PageFlags::USER_RW).unwrap();
    let before = free_frames(&vmm);

    let err = vmm.reserve_region(&ctx, VA, 0x4000, PageFlags::USER_RW).unwrap_err();
    assert!(matches!(err, VmmError::MappingConflict { .. }));
    assert_eq!(free_frames(&vmm), before);
    assert!(!vmm.is_mapped(&ctx, page(0)));
    assert!(!vmm.is_mapped(&ctx, page(1)));
    assert!(vmm.is_mapped(&ctx, page(2)));
}

#[test]
fn copies_cross_page_boundaries_of_inactive_contexts() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    vmm.reserve_region(&ctx, VA, 0x2000, PageFlags::USER_RW).unwrap();

    let data: Vec<u8> = (0..200u8).collect();
    let at = VA + 0xF9C;
    vmm.copy_to_virt(&ctx, at, &data).unwrap();

    let mut back = vec![0u8; data.len()];
    vmm.copy_from_virt(&ctx, at, &mut back).unwrap();
    assert_eq!(back, data);

    let mut tail = [0u8; 8];
    assert_eq!(
        vmm.copy_from_virt(&ctx, VA + 0x1FFC, &mut tail),
        Err(VmmError::NotMapped(page(2)))
    );
}
