//! QEMU debug-exit device.
//!
//! Lets test kernels signal success or failure to the host. QEMU must be
//! started with: `-device isa-debug-exit,iobase=0xf4,iosize=0x04`.
//!
//! The value written to port 0xF4 is transformed by QEMU into
//! `(value << 1) | 1`, so `0x10` yields host exit code 33 (success) and
//! `0x11` yields 35 (failure).

use crate::arch::port::PortByte;

const QEMU_EXIT_PORT: u16 = 0xF4;

/// Exit codes understood by the host-side test runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QemuExitCode {
    /// QEMU exits with host code 33.
    Success = 0x10,
    /// QEMU exits with host code 35.
    Failed = 0x11,
}

/// Exits QEMU with the specified exit code.
///
/// On real hardware the port write has no defined effect; the halt loop
/// below keeps the CPU parked in that case.
pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    // SAFETY:
    // - Writing the debug-exit port terminates the emulator; no kernel state
    //   is touched afterwards.
    unsafe {
        let port = PortByte::new(QEMU_EXIT_PORT);
        port.write(exit_code as u8);
    }

    loop {
        // SAFETY:
        // - `hlt` parks the CPU until the next interrupt; the loop re-halts.
        unsafe {
            core::arch::asm!("hlt");
        }
    }
}
