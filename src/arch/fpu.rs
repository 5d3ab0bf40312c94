//! FPU/SSE state management for lazy context switching.
//!
//! Rust's LLVM backend emits SSE2 instructions for general operations such as
//! `memcpy`, struct copies, and string formatting — even in code without
//! explicit floating-point arithmetic.  Without FPU state preservation across
//! context switches, XMM registers are silently corrupted whenever two tasks
//! run concurrently.
//!
//! This module implements **lazy FPU switching** via the hardware `CR0.TS`
//! mechanism:
//!
//! 1. On every context switch the scheduler sets `CR0.TS`.
//! 2. The first FPU/SSE instruction executed by the new task raises `#NM`
//!    (Device Not Available, vector 7).
//! 3. The `#NM` handler (registered by the scheduler in the trap dispatch
//!    table) clears `CR0.TS`, saves the previous owner's state via
//!    `FXSAVE64`, restores the incoming task's state via `FXRSTOR64`, and
//!    returns.  The faulting instruction re-executes successfully.
//! 4. Tasks that never touch FPU/SSE never trap — zero overhead for pure
//!    integer workloads.
//!
//! `FXSAVE64`/`FXRSTOR64` are used instead of `XSAVE`/`XRSTOR` because they
//! cover everything Rust/LLVM emits (x87 + MMX + XMM0–XMM15) with a fixed
//! 512-byte layout, eliminating the need for CPUID feature detection.

use core::arch::asm;
use core::cell::UnsafeCell;

extern crate alloc;
use alloc::alloc as heap_alloc;
use core::alloc::Layout;

/// 512-byte buffer for `FXSAVE64` / `FXRSTOR64`.
///
/// The hardware mandates 16-byte alignment. `#[repr(C, align(16))]` makes the
/// global allocator satisfy this when the buffer is heap-allocated via
/// [`FpuState::allocate_default`].
#[repr(C, align(16))]
pub struct FpuState(pub [u8; 512]);

/// Wraps the global template so it can live in a `static` without
/// `static mut` (which would permit aliased mutable references).
struct FpuStateTemplate(UnsafeCell<FpuState>);

// SAFETY:
// - The template is written exactly once inside `init()`, before any task is
//   spawned and before interrupts are enabled.
// - After `init()` it is read-only from `allocate_default()`.
// - Single-core kernel: no concurrent mutation.
unsafe impl Sync for FpuStateTemplate {}

/// Template FXSAVE image captured by [`init`] after `FNINIT`:
/// - FCW   = 0x037F (all x87 exceptions masked, round-to-nearest)
/// - MXCSR = 0x1F80 (all SSE exceptions masked, round-to-nearest)
static DEFAULT_FPU_STATE: FpuStateTemplate =
    FpuStateTemplate(UnsafeCell::new(FpuState([0u8; 512])));

impl FpuState {
    /// Allocates a heap buffer pre-filled with the default FPU state.
    ///
    /// Must only be called after [`init`] has populated the template.
    /// Returns null on allocation failure.
    pub fn allocate_default() -> *mut Self {
        // SAFETY:
        // - 512 bytes at 16-byte alignment is a valid, non-zero layout.
        let layout = unsafe { Layout::from_size_align_unchecked(512, 16) };

        // SAFETY:
        // - `layout` has non-zero size and power-of-two alignment.
        let ptr = unsafe { heap_alloc::alloc(layout) } as *mut FpuState;
        if ptr.is_null() {
            return core::ptr::null_mut();
        }

        // SAFETY:
        // - The template is initialized by `init()` before any task spawns.
        // - `ptr` is a valid 512-byte, 16-byte-aligned allocation.
        // - Source (static) and destination (fresh heap block) do not overlap.
        unsafe {
            let src = DEFAULT_FPU_STATE.0.get() as *const u8;
            core::ptr::copy_nonoverlapping(src, ptr as *mut u8, 512);
        }

        ptr
    }

    /// Frees a buffer previously returned by [`allocate_default`].
    ///
    /// # Safety
    ///
    /// - `ptr` must have been returned by `allocate_default`.
    /// - Must not be called twice for the same pointer, and `ptr` must not be
    ///   dereferenced afterwards.
    pub unsafe fn deallocate(ptr: *mut Self) {
        if ptr.is_null() {
            return;
        }

        // SAFETY:
        // - Constants match the layout used by `allocate_default`.
        let layout = Layout::from_size_align_unchecked(512, 16);
        heap_alloc::dealloc(ptr as *mut u8, layout);
    }

    /// Saves the current CPU FPU/SSE state into this buffer via `FXSAVE64`.
    ///
    /// # Safety
    ///
    /// - `CR0.EM` must be 0; otherwise `#UD` is raised.
    /// - `FXSAVE64` does **not** check `CR0.TS`, so this is safe to call even
    ///   while `CR0.TS = 1`.
    #[inline]
    pub unsafe fn save(&mut self) {
        // SAFETY:
        // - `self.0.as_mut_ptr()` is a valid 16-byte-aligned pointer to a
        //   512-byte buffer, satisfying FXSAVE64's memory operand contract.
        asm!(
            "fxsave64 [{ptr}]",
            ptr = in(reg) self.0.as_mut_ptr(),
            options(nostack),
        );
    }

    /// Restores CPU FPU/SSE state from this buffer via `FXRSTOR64`.
    ///
    /// # Safety
    ///
    /// - `CR0.TS` must be 0 before calling; `FXRSTOR64` raises `#NM` when
    ///   `CR0.TS = 1`.  Call [`clear_ts`] first if necessary.
    /// - The buffer must contain a valid `FXSAVE64` image (a prior [`save`]
    ///   or the [`allocate_default`] template).
    #[inline]
    pub unsafe fn restore(&self) {
        // SAFETY:
        // - `self.0.as_ptr()` is a valid 16-byte-aligned pointer to a
        //   512-byte buffer holding a well-formed FXSAVE64 image.
        asm!(
            "fxrstor64 [{ptr}]",
            ptr = in(reg) self.0.as_ptr(),
            options(nostack),
        );
    }
}

/// Initialises the FPU and captures the default state template.
///
/// Must be called exactly once, after GDT init and before tasks spawn.
/// The call order is architecturally required:
///
/// 1. Clear `CR0.EM` — prevents `#UD` on FPU/SSE instructions.
/// 2. Set `CR0.MP`   — `WAIT`/`FWAIT` honour `CR0.TS`.
/// 3. Set `CR4.OSFXSR`     — enables `FXSAVE`/`FXRSTOR`.
/// 4. Set `CR4.OSXMMEXCPT` — allows `#XM` to be signalled.
/// 5. `FNINIT`    — resets the x87 FPU to its default state.
/// 6. `LDMXCSR`   — sets MXCSR to 0x1F80.
/// 7. `FXSAVE64`  — snapshots the reset state into the template.
pub fn init() {
    // SAFETY:
    // - Privileged control-register access; called exactly once at boot
    //   before interrupts and tasks are active.
    unsafe {
        let mut cr0: u64;
        asm!("mov {r}, cr0", r = out(reg) cr0, options(nomem, nostack, preserves_flags));
        cr0 &= !(1u64 << 2); // clear EM (bit 2)
        cr0 |= 1u64 << 1; // set MP (bit 1)
        asm!("mov cr0, {r}", r = in(reg) cr0, options(nomem, nostack, preserves_flags));

        let mut cr4: u64;
        asm!("mov {r}, cr4", r = out(reg) cr4, options(nomem, nostack, preserves_flags));
        cr4 |= (1u64 << 9) | (1u64 << 10); // OSFXSR + OSXMMEXCPT
        asm!("mov cr4, {r}", r = in(reg) cr4, options(nomem, nostack, preserves_flags));

        asm!("fninit", options(nomem, nostack));

        let mxcsr: u32 = 0x1F80;
        asm!("ldmxcsr [{ptr}]", ptr = in(reg) &mxcsr, options(nostack));

        let template = &mut *DEFAULT_FPU_STATE.0.get();
        template.save();
    }
}

/// Sets `CR0.TS` (Task Switched bit).
///
/// The next FPU/SSE instruction executed afterwards raises `#NM`.
///
/// # Safety
///
/// Must be called from ring 0.
#[inline]
pub unsafe fn set_ts() {
    // SAFETY:
    // - Privileged control-register modification, valid only in ring 0.
    asm!(
        "mov {r}, cr0",
        "or {r}, {bit}",
        "mov cr0, {r}",
        r = lateout(reg) _,
        bit = const 1u64 << 3,
        options(nomem, nostack, preserves_flags),
    );
}

/// Clears `CR0.TS` using the `CLTS` instruction.
///
/// # Safety
///
/// Must be called from ring 0.
#[inline]
pub unsafe fn clear_ts() {
    // SAFETY:
    // - `CLTS` is a privileged instruction that atomically clears CR0.TS.
    asm!("clts", options(nomem, nostack, preserves_flags));
}
