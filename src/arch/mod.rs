//! Architecture-specific code for x86_64.

pub mod fpu;
pub mod gdt;
pub mod port;
pub mod qemu;
pub mod traps;

/// Logical id of the executing CPU.
///
/// Single-core kernel: always 0.  Real per-CPU state (APIC id lookup) is
/// required before this can return anything else; spinlock owner tracking
/// is written against this id so the locking code stays shaped for that.
#[inline]
pub fn cpu_id() -> i32 {
    0
}
