//! Virtual memory manager integration tests: address-space lifecycle,
//! map/unmap/translate round trips, kernel-half sharing, and the demand
//! pager contracts.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(helix_kernel::testing::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;
use helix_kernel::arch::traps;
use helix_kernel::memory::pmm;
use helix_kernel::memory::vmm::{
    self, MapError, PageFlags, UnmapError, HEAP_BASE, KERNEL_HIGHER_HALF_BASE,
    USER_STACK_GUARD_BASE,
};

#[no_mangle]
#[link_section = ".text.boot"]
pub extern "C" fn KernelMain(_kernel_size: u64) -> ! {
    helix_kernel::logging::init();

    pmm::init(false);
    traps::init();
    vmm::init(false);

    test_main();

    loop {
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    helix_kernel::testing::test_panic_handler(info)
}

/// A canonical low-half test address far away from the user windows.
const TEST_VA: u64 = 0x0000_0042_0000_0000;

fn alloc_phys() -> u64 {
    pmm::with_pmm(|mgr| mgr.alloc_frame())
        .expect("test frame allocation should succeed")
        .physical_address()
}

fn free_frame_count() -> u64 {
    pmm::with_pmm(|mgr| mgr.free_frames())
}

/// Contract: map then translate returns `phys | (virt & 0xFFF)`; unmap
/// removes the translation and reports a second unmap as NotMapped.
#[test_case]
fn test_map_translate_unmap_round_trip() {
    let space = vmm::create_address_space().expect("address space should be created");
    let phys = alloc_phys();

    assert!(!vmm::is_mapped(&space, TEST_VA), "fresh VA must be unmapped");
    assert!(
        vmm::translate(&space, TEST_VA).is_none(),
        "translate of an unmapped VA must report no mapping"
    );

    vmm::map_page(&space, TEST_VA, phys, PageFlags::WRITABLE).expect("map should succeed");

    // The page-offset bits must survive translation.
    assert!(
        vmm::translate(&space, TEST_VA + 0x123) == Some(phys | 0x123),
        "translate must return the mapped frame with original offset bits"
    );
    assert!(vmm::is_mapped(&space, TEST_VA));

    vmm::unmap_page(&space, TEST_VA).expect("unmap of a mapped page should succeed");
    assert!(
        vmm::translate(&space, TEST_VA).is_none(),
        "translation must be gone after unmap"
    );

    let err = vmm::unmap_page(&space, TEST_VA).expect_err("second unmap must fail");
    assert!(
        matches!(err, UnmapError::NotMapped { .. }),
        "unmapping an absent page must signal NotMapped"
    );

    vmm::destroy_address_space(space);
}

/// Contract: remapping the same frame is idempotent, remapping a different
/// frame over a live translation is refused.
#[test_case]
fn test_remap_conflict_detection() {
    let space = vmm::create_address_space().expect("address space should be created");
    let phys_a = alloc_phys();
    let phys_b = alloc_phys();

    vmm::map_page(&space, TEST_VA, phys_a, PageFlags::WRITABLE).expect("initial map");
    vmm::map_page(&space, TEST_VA, phys_a, PageFlags::WRITABLE)
        .expect("same-frame remap must be idempotent");

    let err = vmm::map_page(&space, TEST_VA, phys_b, PageFlags::WRITABLE)
        .expect_err("conflicting remap must fail");
    assert!(
        matches!(err, MapError::AlreadyMapped { .. }),
        "expected AlreadyMapped for a different-frame remap"
    );

    let _ = pmm::with_pmm(|mgr| mgr.release_pfn(phys_b / 4096));
    vmm::destroy_address_space(space);
}

/// Contract: two fresh address spaces share the kernel half behaviorally
/// and keep their low halves fully independent.
#[test_case]
fn test_address_space_isolation_and_kernel_sharing() {
    let space_a = vmm::create_address_space().expect("space A should be created");
    let space_b = vmm::create_address_space().expect("space B should be created");

    // Kernel half: both spaces resolve the physical window identically
    // (slots 256-511 are copied by value from the kernel root).
    let probe = KERNEL_HIGHER_HALF_BASE + 0x0020_1234;
    let via_a = vmm::translate(&space_a, probe);
    let via_b = vmm::translate(&space_b, probe);
    assert!(via_a == Some(0x0020_1234), "kernel half must map phys-offset");
    assert!(via_a == via_b, "kernel half must be identical across spaces");

    // Low half: a mapping in A must not appear in B.
    let phys = alloc_phys();
    vmm::map_page(&space_a, TEST_VA, phys, PageFlags::WRITABLE).expect("map in space A");
    assert!(vmm::is_mapped(&space_a, TEST_VA));
    assert!(
        !vmm::is_mapped(&space_b, TEST_VA),
        "space B must not alias space A's low-half mapping"
    );

    vmm::destroy_address_space(space_a);
    vmm::destroy_address_space(space_b);
}

/// Contract: destroying a space returns every owned frame (root,
/// intermediate tables, mapped leaves) to the physical allocator.
#[test_case]
fn test_destroy_releases_owned_frames() {
    let before = free_frame_count();

    let space = vmm::create_address_space().expect("address space should be created");
    let phys = alloc_phys();
    vmm::map_page(&space, TEST_VA, phys, PageFlags::WRITABLE).expect("map should succeed");
    vmm::map_page(&space, TEST_VA + 0x1000, alloc_phys(), PageFlags::WRITABLE)
        .expect("second map should succeed");

    assert!(
        free_frame_count() < before,
        "tables and leaves must consume frames while the space lives"
    );

    vmm::destroy_address_space(space);

    assert!(
        free_frame_count() == before,
        "destroy must release the root, all sub-tables and all leaf frames"
    );
}

/// Contract: huge-page kernel leaves translate with the wide offset and
/// refuse 4 KiB remapping inside them.
#[test_case]
fn test_huge_page_translation_and_conflict() {
    let kernel = vmm::kernel_space();

    // The physical window is built from 2 MiB huge pages.
    let probe = KERNEL_HIGHER_HALF_BASE + 0x003F_5678;
    assert!(
        vmm::translate(&kernel, probe) == Some(0x003F_5678),
        "huge-page leaves must preserve the 2 MiB offset"
    );

    let phys = alloc_phys();
    let err = vmm::map_page(&kernel, KERNEL_HIGHER_HALF_BASE + 0x1000, phys, PageFlags::WRITABLE)
        .expect_err("mapping inside a huge-page leaf must fail");
    assert!(
        matches!(err, MapError::HugePageConflict { .. }),
        "expected HugePageConflict inside the physical window"
    );
    let _ = pmm::with_pmm(|mgr| mgr.release_pfn(phys / 4096));
}

/// Contract: the demand pager fixes non-present heap-arena faults and
/// refuses protection faults and guard-page touches.
#[test_case]
fn test_demand_pager_policies() {
    // Non-present fault inside the heap arena: fixed by a fresh mapping.
    let fault_va = HEAP_BASE + 0x0040_2000;
    assert!(
        vmm::handle_page_fault(fault_va, 0),
        "heap-arena demand fault must be fixed"
    );
    assert!(
        vmm::is_mapped(&vmm::kernel_space(), fault_va),
        "the fixed fault must leave a live mapping behind"
    );

    // Protection faults (P=1) must never be hidden by demand mapping.
    assert!(
        !vmm::handle_page_fault(fault_va, 1),
        "protection faults must be refused"
    );

    // The stack guard page must stay unmapped.
    assert!(
        !vmm::handle_page_fault(USER_STACK_GUARD_BASE, 0),
        "guard-page faults must be refused"
    );

    // Arbitrary unmapped regions are not demand-paged.
    assert!(
        !vmm::handle_page_fault(0x0000_0123_4567_8000, 0),
        "faults outside known regions must be refused"
    );
}
