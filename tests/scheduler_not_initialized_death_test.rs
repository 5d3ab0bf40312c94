//! Death test: scheduler operations before `init` are fatal.
//!
//! The scheduler is core infrastructure; calls against uninitialized state
//! indicate corruption and must panic rather than limp along.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(helix_kernel::testing::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;
use helix_kernel::arch::qemu::{exit_qemu, QemuExitCode};
use helix_kernel::scheduler;

#[no_mangle]
#[link_section = ".text.boot"]
pub extern "C" fn KernelMain(_kernel_size: u64) -> ! {
    helix_kernel::logging::init();

    test_main();

    // The test must panic before reaching this point.
    exit_qemu(QemuExitCode::Failed);
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let expected = "scheduler not initialized";
    let matches_contract = info
        .message()
        .as_str()
        .is_some_and(|m| m.contains(expected));

    if matches_contract {
        exit_qemu(QemuExitCode::Success);
    } else {
        exit_qemu(QemuExitCode::Failed);
    }
}

/// Contract: blocking a task before `scheduler::init` panics.
#[test_case]
fn test_block_before_init_panics() {
    scheduler::block_task(1);
}
