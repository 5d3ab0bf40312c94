//! Test framework for the kernel.
//!
//! Provides a custom test framework for bare-metal execution: tests run
//! inside QEMU and report over the serial port.
//!
//! Each integration test file (in `tests/`) must enable the custom test
//! framework and wire up the entry point:
//!
//! ```ignore
//! #![feature(custom_test_frameworks)]
//! #![test_runner(helix_kernel::testing::test_runner)]
//! #![reexport_test_harness_main = "test_main"]
//! ```
//!
//! Then mark test functions with `#[test_case]`:
//! ```ignore
//! #[test_case]
//! fn test_simple_assertion() {
//!     assert_eq!(1 + 1, 2);
//! }
//! ```
//!
//! The compiler collects all `#[test_case]` functions and generates a
//! `test_main()` entry point that passes them to [`test_runner`].  Call
//! `test_main()` from `KernelMain` after performing any required
//! initialization.

use crate::arch::qemu::{exit_qemu, QemuExitCode};
use crate::{debug, debugln};

/// Trait for types that can be run as tests.
pub trait Testable {
    /// Runs the test and reports the result.
    fn run(&self);
}

/// Implement Testable for any function with no arguments.
impl<T: Fn()> Testable for T {
    fn run(&self) {
        // core::any::type_name yields the function path as the test name.
        debug!("  {}...", core::any::type_name::<T>());

        // If the test panics, the panic handler takes over.
        self();

        debugln!(" [ok]");
    }
}

/// The main test runner.
///
/// Called by the generated harness with every `#[test_case]` function.
/// Runs each test and exits QEMU with the appropriate exit code.
pub fn test_runner(tests: &[&dyn Testable]) {
    debugln!("========================================");
    debugln!("    HELIX Kernel Test Framework");
    debugln!("========================================");
    debugln!();
    debugln!("Running {} tests:", tests.len());
    debugln!();

    for test in tests {
        test.run();
    }

    debugln!();
    debugln!("========================================");
    debugln!("All {} tests passed!", tests.len());
    debugln!("========================================");

    exit_qemu(QemuExitCode::Success);
}

/// Called when a test panics.
///
/// Outputs the failure information and exits QEMU with a failure code.
pub fn test_panic_handler(info: &core::panic::PanicInfo) -> ! {
    debugln!(" [FAILED]");
    debugln!();
    debugln!("========================================");
    debugln!("TEST FAILED!");
    debugln!("========================================");

    if let Some(location) = info.location() {
        debugln!("Location: {}:{}", location.file(), location.line());
    }

    if let Some(message) = info.message().as_str() {
        debugln!("Message: {}", message);
    }

    debugln!();

    exit_qemu(QemuExitCode::Failed);
}

/// Asserts equality with better error messages for tests.
#[macro_export]
macro_rules! test_assert_eq {
    ($left:expr, $right:expr) => {
        if $left != $right {
            panic!(
                "assertion failed: `(left == right)`\n  left: `{:?}`\n right: `{:?}`",
                $left, $right
            );
        }
    };
    ($left:expr, $right:expr, $($arg:tt)+) => {
        if $left != $right {
            panic!(
                "assertion failed: `(left == right)`\n  left: `{:?}`\n right: `{:?}`\n note: {}",
                $left, $right, format_args!($($arg)+)
            );
        }
    };
}

/// Asserts a condition is true.
#[macro_export]
macro_rules! test_assert {
    ($cond:expr) => {
        if !$cond {
            panic!("assertion failed: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            panic!("assertion failed: {}\n note: {}", stringify!($cond), format_args!($($arg)+));
        }
    };
}
