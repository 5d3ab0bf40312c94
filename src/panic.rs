//! Panic handler for the kernel binary.
//!
//! Integration-test kernels install their own handler (routing into
//! `testing::test_panic_handler`); this one serves the production image.

use core::panic::PanicInfo;

use crate::logging;

/// Prints full diagnostic context to serial, then halts the CPU forever.
///
/// Single CPU, no isolation: a kernel panic stops the whole machine.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    logging::logln("panic", format_args!("!!! KERNEL PANIC !!!"));

    if let Some(location) = info.location() {
        logging::logln(
            "panic",
            format_args!("at {}:{}", location.file(), location.line()),
        );
    }

    logging::logln("panic", format_args!("{}", info.message()));

    loop {
        // SAFETY:
        // - Terminal halt sequence for an unrecoverable kernel state.
        unsafe {
            core::arch::asm!("cli");
            core::arch::asm!("hlt");
        }
    }
}
