//! # Memory Layout

/// Size of a physical frame and of a 4 KiB page.
pub const FRAME_SIZE: u64 = 4096;

/// Entries per page table, at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// First physical address managed by the frame allocator.
pub const PMM_ZONE_BASE: u64 = 0x0010_0000; // 1 MiB

/// Low physical memory identity-mapped into the kernel context at boot.
///
/// Ends where user space begins so the identity map never collides with
/// user mappings.
pub const IDENTITY_LOW_BYTES: u64 = 0x0040_0000; // 4 MiB

/// Start of the kernel (higher) half.
pub const KERNEL_SPACE_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Kernel heap window, served by `vmalloc`.
pub const KERNEL_HEAP_BASE: u64 = KERNEL_SPACE_BASE;

/// Size of the kernel heap window.
pub const KERNEL_HEAP_SIZE: u64 = 0x4000_0000; // 1 GiB

/// Lowest address handed out to user code.
pub const USER_SPACE_BASE: u64 = 0x0040_0000; // 4 MiB

/// First address of the user heap region.
pub const USER_HEAP_START: u64 = 0x1000_0000; // 256 MiB

/// Initial user stack pointer; the stack grows down from here.
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;

/// Maximum size the user stack may grow to on demand.
pub const USER_STACK_MAX: u64 = 0x0080_0000; // 8 MiB

/// Index of the first top-level (PML4) slot belonging to the kernel half.
pub const KERNEL_PML4_START: usize = 256;

const _: () = {
    assert!(KERNEL_HEAP_BASE.is_multiple_of(FRAME_SIZE));
    assert!(KERNEL_HEAP_SIZE.is_multiple_of(FRAME_SIZE));
    assert!(KERNEL_HEAP_BASE.checked_add(KERNEL_HEAP_SIZE - 1).is_some());
    assert!(USER_SPACE_BASE < USER_HEAP_START);
    assert!(USER_HEAP_START < USER_STACK_TOP - USER_STACK_MAX);
    assert!(USER_STACK_TOP.is_multiple_of(FRAME_SIZE));
    assert!(IDENTITY_LOW_BYTES.is_multiple_of(FRAME_SIZE));
    assert!(IDENTITY_LOW_BYTES <= USER_SPACE_BASE);
    assert!(PMM_ZONE_BASE.is_multiple_of(FRAME_SIZE));
    // Kernel heap must fit into a single top-level slot.
    assert!(KERNEL_HEAP_SIZE <= 1 << 39);
    assert!(((KERNEL_SPACE_BASE >> 39) & 0x1FF) as usize == KERNEL_PML4_START);
};
