//! Death test for the mutex ownership discipline: unlocking on behalf of
//! another task is never allowed.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(helix_kernel::testing::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;
use helix_kernel::arch::qemu::{exit_qemu, QemuExitCode};
use helix_kernel::sync::mutex::Mutex;

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
    let expected = "unlock by non-owner";
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

/// Contract: unlock from a task that does not own the mutex panics.
#[test_case]
fn test_unlock_by_non_owner_panics() {
    static M: Mutex = Mutex::sleeping("death-not-owner");

    M.lock_from(Some(1), || {});
    M.unlock_from(Some(2));
}
