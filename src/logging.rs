//! Kernel logging over the COM1 serial port.
//!
//! All diagnostics go to serial: when running under QEMU, use
//! `-serial file:debug.log` (or `-serial stdio`) to see them on the host.
//! Subsystems log through [`logln`] with a short target tag so fault traces
//! can be filtered by origin.

use core::cell::UnsafeCell;
use core::fmt::{self, Write as _};
use core::sync::atomic::{AtomicBool, Ordering};

use uart_16550::SerialPort;

/// Standard COM1 base port address.
const COM1_PORT: u16 = 0x3F8;

struct DebugSerial {
    port: UnsafeCell<Option<SerialPort>>,
    initialized: AtomicBool,
}

// SAFETY:
// - The kernel is single-core; serial writes are short and the port is
//   written from interrupt and panic paths where blocking on a lock could
//   deadlock, so access is deliberately unlocked.
unsafe impl Sync for DebugSerial {}

static SERIAL: DebugSerial = DebugSerial {
    port: UnsafeCell::new(None),
    initialized: AtomicBool::new(false),
};

/// Initializes COM1 for debug output (115200 8N1).
///
/// Call early in kernel initialization; logging before this is a no-op.
pub fn init() {
    // SAFETY:
    // - COM1 lives at the standard 0x3F8 I/O base.
    // - Called once during early boot before concurrent logging exists.
    let mut port = unsafe { SerialPort::new(COM1_PORT) };
    port.init();

    // SAFETY:
    // - Single write during boot; readers check `initialized` afterwards.
    unsafe {
        *SERIAL.port.get() = Some(port);
    }
    SERIAL.initialized.store(true, Ordering::Release);
}

/// Writes formatted output to the serial port.  Used by the `debug!` macros.
#[doc(hidden)]
pub fn _debug_print(args: fmt::Arguments) {
    if !SERIAL.initialized.load(Ordering::Acquire) {
        return;
    }

    // SAFETY:
    // - `initialized` was observed true, so the port is populated.
    // - Single-core kernel: no concurrent mutable access (see `DebugSerial`).
    unsafe {
        if let Some(port) = (*SERIAL.port.get()).as_mut() {
            let _ = port.write_fmt(args);
        }
    }
}

/// Emits one target-tagged log line.
pub fn logln(target: &str, args: fmt::Arguments<'_>) {
    _debug_print(format_args!("[{}] {}\n", target, args));
}

/// Debug output macro — like `print!`, but to the serial port.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::logging::_debug_print(format_args!($($arg)*))
    };
}

/// Debug output macro with newline — like `println!`, but to the serial port.
#[macro_export]
macro_rules! debugln {
    () => {
        $crate::debug!("\n")
    };
    ($($arg:tt)*) => {
        $crate::debug!("{}\n", format_args!($($arg)*))
    };
}
