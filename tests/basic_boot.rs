//! Boot smoke test: the full bring-up sequence completes and the test
//! framework is reachable afterwards.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(helix_kernel::testing::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;
use helix_kernel::arch::{fpu, gdt, traps};
use helix_kernel::memory::{heap, pmm, vmm};

#[no_mangle]
#[link_section = ".text.boot"]
pub extern "C" fn KernelMain(_kernel_size: u64) -> ! {
    helix_kernel::logging::init();

    gdt::init();
    fpu::init();
    pmm::init(false);
    traps::init();
    vmm::init(false);
    heap::init(false);

    test_main();

    loop {
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    helix_kernel::testing::test_panic_handler(info)
}

#[test_case]
fn test_boot_sequence_reaches_test_harness() {
    assert_eq!(1 + 1, 2);
}

#[test_case]
fn test_memory_subsystems_report_initialized() {
    assert!(pmm::is_initialized(), "PMM must be initialized after boot");
    assert!(heap::is_initialized(), "heap must be initialized after boot");
    assert!(gdt::is_initialized(), "GDT must be initialized after boot");
}
