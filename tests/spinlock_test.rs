//! Spinlock integration tests.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(helix_kernel::testing::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;
use helix_kernel::arch::traps;
use helix_kernel::sync::spinlock::{RawSpinLock, SpinLock};

/// Entry point for the spinlock integration test kernel.
#[no_mangle]
#[link_section = ".text.boot"]
pub extern "C" fn KernelMain(_kernel_size: u64) -> ! {
    helix_kernel::logging::init();
    traps::init();

    test_main();

    loop {
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    helix_kernel::testing::test_panic_handler(info)
}

/// Contract: spinlock guard protects shared mutation.
#[test_case]
fn test_spinlock_basic_mutation() {
    static LOCK: SpinLock<usize> = SpinLock::new("test-basic", 0);

    {
        let mut guard = LOCK.lock();
        *guard += 1;
    }

    let guard = LOCK.lock();
    assert!(*guard == 1, "spinlock should protect shared state");
}

/// Contract: lock/release round trip leaves the lock reusable and tracks
/// the holder correctly in between.
#[test_case]
fn test_raw_spinlock_holding_tracks_owner() {
    static LOCK: RawSpinLock = RawSpinLock::new("test-holding");

    assert!(!LOCK.holding(), "fresh lock must not report a holder");

    LOCK.acquire();
    assert!(LOCK.holding(), "acquire must record the calling CPU as owner");
    LOCK.release();

    assert!(!LOCK.holding(), "release must clear the owner");

    LOCK.acquire();
    LOCK.release();
}

/// Contract: try_acquire succeeds on a free lock, fails on self-recursion
/// instead of panicking, and restores the interrupt state on failure.
#[test_case]
fn test_try_acquire_contention_and_recursion() {
    static LOCK: RawSpinLock = RawSpinLock::new("test-try");

    assert!(LOCK.try_acquire(), "try_acquire on a free lock must succeed");

    traps::enable();
    assert!(
        !LOCK.try_acquire(),
        "try_acquire while already holding must fail, not panic"
    );
    assert!(
        traps::are_enabled(),
        "failed try_acquire must restore enabled interrupts"
    );
    traps::disable();

    LOCK.release();
}

/// Contract: spinlock preserves a disabled interrupt state across the
/// critical section.
#[test_case]
fn test_spinlock_preserves_interrupt_state_when_disabled() {
    static LOCK: SpinLock<usize> = SpinLock::new("test-irq-off", 0);

    traps::disable();
    assert!(
        !traps::are_enabled(),
        "interrupts should be disabled for this test"
    );

    {
        let mut guard = LOCK.lock();
        *guard += 1;
    }

    assert!(
        !traps::are_enabled(),
        "spinlock should not enable interrupts when they were disabled"
    );
}

/// Contract: spinlock restores an enabled interrupt state after release.
#[test_case]
fn test_spinlock_preserves_interrupt_state_when_enabled() {
    static LOCK: SpinLock<usize> = SpinLock::new("test-irq-on", 0);

    traps::enable();
    assert!(
        traps::are_enabled(),
        "interrupts should be enabled for this test"
    );

    {
        let mut guard = LOCK.lock();
        *guard += 1;
    }

    assert!(
        traps::are_enabled(),
        "spinlock should restore enabled interrupts state"
    );

    traps::disable();
}

/// Contract: irqsave/irqrestore variants hand interrupt-state ownership to
/// the caller.
#[test_case]
fn test_acquire_irqsave_round_trip() {
    static LOCK: RawSpinLock = RawSpinLock::new("test-irqsave");

    traps::enable();
    let saved = LOCK.acquire_irqsave();
    assert!(saved, "irqsave must report the pre-acquire interrupt state");
    assert!(
        !traps::are_enabled(),
        "interrupts must be disabled inside the critical section"
    );

    LOCK.release_irqrestore(saved);
    assert!(
        traps::are_enabled(),
        "irqrestore must re-enable interrupts when they were enabled before"
    );
    traps::disable();
}

/// Contract: two *different* locks nest fine; only same-lock recursion is
/// a bug.
#[test_case]
fn test_nesting_distinct_locks_is_allowed() {
    static OUTER: RawSpinLock = RawSpinLock::new("test-outer");
    static INNER: RawSpinLock = RawSpinLock::new("test-inner");

    OUTER.acquire();
    INNER.acquire();
    assert!(OUTER.holding() && INNER.holding());
    INNER.release();
    OUTER.release();
}
