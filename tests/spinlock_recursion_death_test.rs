//! Death test for recursive spinlock acquisition.
//!
//! Acquiring the same lock twice from the same CPU without releasing must
//! panic; the expected panic is treated as success.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(helix_kernel::testing::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;
use helix_kernel::arch::qemu::{exit_qemu, QemuExitCode};
use helix_kernel::sync::spinlock::RawSpinLock;

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
    let expected = "recursive acquisition";
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

/// Contract: same-owner re-acquisition panics with the lock's name in the
/// diagnostic.
#[test_case]
fn test_recursive_acquire_panics() {
    static LOCK: RawSpinLock = RawSpinLock::new("death-recursive");

    LOCK.acquire();
    LOCK.acquire();
}
