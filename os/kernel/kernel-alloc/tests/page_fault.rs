mod common;

use common::*;
use kernel_alloc::{FaultResolution, PageFaultError};
use kernel_info::memory::{USER_STACK_MAX, USER_STACK_TOP};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::PageFlags;

fn not_present_user_write() -> PageFaultError {
    PageFaultError::new().with_user(true).with_write(true)
}

#[test]
fn stack_fault_maps_a_zeroed_page() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    vmm.switch_to(&ctx);

    let addr = VirtualAddress::new(USER_STACK_TOP - 0x18);
    let page = VirtualAddress::new(USER_STACK_TOP - 0x1000);
    assert_eq!(
        vmm.handle_page_fault(addr, not_present_user_write()),
        FaultResolution::Resolved
    );
    assert_eq!(vmm.get_flags(&ctx, page), Some(PageFlags::USER_RW));

    let mut bytes = [0xFFu8; 64];
    vmm.copy_from_virt(&ctx, page, &mut bytes).unwrap();
    assert!(bytes.iter().all(|b| *b == 0));

    let stats = vmm.stats();
    assert_eq!(stats.faults_handled, 1);
    assert_eq!(stats.faults_resolved, 1);
}

#[test]
fn faults_outside_the_stack_window_are_unresolved() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    vmm.switch_to(&ctx);

    let below = VirtualAddress::new(USER_STACK_TOP - USER_STACK_MAX - 0x1000);
    assert_eq!(
        vmm.handle_page_fault(below, not_present_user_write()),
        FaultResolution::Unresolved
    );
    assert_eq!(
        vmm.handle_page_fault(VirtualAddress::new(0x40_0000), not_present_user_write()),
        FaultResolution::Unresolved
    );
    assert_eq!(ctx.pages().total, 0);
}

#[test]
fn protection_faults_are_unresolved() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    vmm.switch_to(&ctx);

    let addr = VirtualAddress::new(USER_STACK_TOP - 0x10);
    let err = not_present_user_write().with_present(true);
    assert_eq!(vmm.handle_page_fault(addr, err), FaultResolution::Unresolved);
}

#[test]
fn kernel_context_faults_are_unresolved() {
    let vmm = machine();
    let addr = VirtualAddress::new(USER_STACK_TOP - 0x10);
    assert_eq!(
        vmm.handle_page_fault(addr, PageFaultError::new().with_write(true)),
        FaultResolution::Unresolved
    );
    let stats = vmm.stats();
    assert_eq!(stats.faults_handled, 1);
    assert_eq!(stats.faults_resolved, 0);
}

#[test]
fn stack_window_follows_the_context_stack_top() {
    let vmm = machine();
    let ctx = vmm.create_context().unwrap();
    let top = VirtualAddress::new(0x7000_0000);
    ctx.set_stack_top(top);
    vmm.switch_to(&ctx);

    let addr = VirtualAddress::new(0x6FFF_F000);
    assert_eq!(
        vmm.handle_page_fault(addr, not_present_user_write()),
        FaultResolution::Resolved
    );
    assert!(vmm.is_mapped(&ctx, addr));
    assert_eq!(
        vmm.handle_page_fault(top, not_present_user_write()),
        FaultResolution::Unresolved
    );
}
