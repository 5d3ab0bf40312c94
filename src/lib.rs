//! HELIX Kernel Library
//!
//! This library crate exposes kernel functionality for use by integration
//! tests.  Test kernels import it to reach the subsystem modules and the
//! test framework infrastructure.

#![no_std]
#![no_main]

extern crate alloc;

pub mod arch;
pub mod logging;
pub mod memory;
pub mod process;
pub mod scheduler;
pub mod sync;
pub mod testing;
