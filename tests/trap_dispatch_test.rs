//! Trap-dispatch integration tests: handler registration, IRQ routing, and
//! the page-fault forwarding contract between the trap layer and the VMM.
//!
//! Traps are injected synthetically through `dispatch_trap` and
//! `page_fault_entry`, so no real exceptions or interrupts are raised.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(helix_kernel::testing::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use helix_kernel::arch::traps::{self, PanicCode, SavedRegisters};
use helix_kernel::memory::vmm::{self, PageFlags};
use helix_kernel::memory::pmm;

#[no_mangle]
#[link_section = ".text.boot"]
pub extern "C" fn KernelMain(_kernel_size: u64) -> ! {
    helix_kernel::logging::init();

    pmm::init(false);
    traps::init();
    vmm::init(false);

    test_main();

    loop {
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    helix_kernel::testing::test_panic_handler(info)
}

static SEEN_VECTOR: AtomicU64 = AtomicU64::new(u64::MAX);
static CALL_COUNT: AtomicUsize = AtomicUsize::new(0);
static FAULT_ADDRESS: AtomicU64 = AtomicU64::new(0);
static FAULT_CODE: AtomicU64 = AtomicU64::new(u64::MAX);

fn recording_handler(vector: u8, frame: &mut SavedRegisters) -> *mut SavedRegisters {
    SEEN_VECTOR.store(vector as u64, Ordering::Release);
    CALL_COUNT.fetch_add(1, Ordering::AcqRel);
    frame as *mut SavedRegisters
}

fn other_handler(_vector: u8, frame: &mut SavedRegisters) -> *mut SavedRegisters {
    SEEN_VECTOR.store(0xDEAD, Ordering::Release);
    frame as *mut SavedRegisters
}

fn recording_fault_handler(address: u64, code: u64) -> bool {
    FAULT_ADDRESS.store(address, Ordering::Release);
    FAULT_CODE.store(code, Ordering::Release);
    true
}

/// Contract: a registered IRQ handler receives its vector and the dispatch
/// resumes with the frame the handler returned.
#[test_case]
fn test_registered_irq_handler_is_invoked() {
    const VECTOR: u8 = traps::IRQ_BASE + 5;

    SEEN_VECTOR.store(u64::MAX, Ordering::Release);
    CALL_COUNT.store(0, Ordering::Release);
    traps::register_handler(VECTOR, recording_handler);

    let mut frame = SavedRegisters::default();
    let resumed = traps::dispatch_trap(VECTOR, 0, &mut frame);

    assert!(
        SEEN_VECTOR.load(Ordering::Acquire) == VECTOR as u64,
        "the handler must receive the dispatched vector"
    );
    assert!(CALL_COUNT.load(Ordering::Acquire) == 1, "exactly one call");
    assert!(
        resumed == &mut frame as *mut SavedRegisters,
        "dispatch must resume with the handler's returned frame"
    );

    traps::unregister_handler(VECTOR);
}

/// Contract: an unhandled hardware IRQ is acknowledged and dropped, never
/// escalated.
#[test_case]
fn test_unhandled_irq_is_dropped_silently() {
    const VECTOR: u8 = traps::IRQ_BASE + 11;

    let mut frame = SavedRegisters::default();
    let resumed = traps::dispatch_trap(VECTOR, 0, &mut frame);

    assert!(
        resumed == &mut frame as *mut SavedRegisters,
        "an unhandled IRQ must resume the interrupted frame unchanged"
    );
}

/// Contract: handler slots are last-writer-wins and unregister clears them.
#[test_case]
fn test_registration_is_last_writer_wins() {
    const VECTOR: u8 = traps::IRQ_BASE + 6;

    traps::register_handler(VECTOR, recording_handler);
    traps::register_handler(VECTOR, other_handler);

    let mut frame = SavedRegisters::default();
    let _ = traps::dispatch_trap(VECTOR, 0, &mut frame);
    assert!(
        SEEN_VECTOR.load(Ordering::Acquire) == 0xDEAD,
        "the most recently registered handler must win"
    );

    traps::unregister_handler(VECTOR);
    SEEN_VECTOR.store(u64::MAX, Ordering::Release);
    let _ = traps::dispatch_trap(VECTOR, 0, &mut frame);
    assert!(
        SEEN_VECTOR.load(Ordering::Acquire) == u64::MAX,
        "an unregistered vector must not reach the old handler"
    );
}

/// Contract: a registered exception handler pre-empts the fatal panic path.
#[test_case]
fn test_registered_exception_handler_suppresses_panic() {
    const VECTOR: u8 = 3; // breakpoint

    SEEN_VECTOR.store(u64::MAX, Ordering::Release);
    traps::register_handler(VECTOR, recording_handler);

    let mut frame = SavedRegisters::default();
    let resumed = traps::dispatch_trap(VECTOR, 0, &mut frame);

    assert!(SEEN_VECTOR.load(Ordering::Acquire) == VECTOR as u64);
    assert!(resumed == &mut frame as *mut SavedRegisters);

    traps::unregister_handler(VECTOR);
}

/// Contract (end-to-end): a synthetic page fault on an established mapping
/// reaches the registered VMM fault handler with the exact (address, error
/// code) pair, and a fixed fault resumes without a panic.
#[test_case]
fn test_page_fault_forwards_exact_fault_pair() {
    const TEST_VA: u64 = 0x0000_0051_0000_0000;

    let space = vmm::kernel_space();
    let phys = pmm::with_pmm(|mgr| mgr.alloc_frame())
        .expect("test frame allocation should succeed")
        .physical_address();
    vmm::map_page(&space, TEST_VA, phys, PageFlags::WRITABLE).expect("map should succeed");

    FAULT_ADDRESS.store(0, Ordering::Release);
    FAULT_CODE.store(u64::MAX, Ordering::Release);
    vmm::set_page_fault_handler(recording_fault_handler);

    // A write protection fault inside the mapping (P=1, W=1).
    let fault_va = TEST_VA + 0x7A4;
    let error_code = 0x3;

    let mut frame = SavedRegisters::default();
    let resumed = traps::page_fault_entry(fault_va, error_code, &mut frame);

    assert!(
        FAULT_ADDRESS.load(Ordering::Acquire) == fault_va,
        "the fault handler must receive the exact faulting address"
    );
    assert!(
        FAULT_CODE.load(Ordering::Acquire) == error_code,
        "the fault handler must receive the raw CPU error code"
    );
    assert!(
        resumed == &mut frame as *mut SavedRegisters,
        "a fixed fault must resume the faulting context"
    );

    vmm::set_page_fault_handler(vmm::demand_pager);
    vmm::unmap_page(&space, TEST_VA).expect("unmap should succeed");
}

/// Contract: vector classification and the static name table match the
/// architectural layout.
#[test_case]
fn test_exception_classification_tables() {
    assert!(PanicCode::classify(0) == PanicCode::DivideByZero);
    assert!(PanicCode::classify(6) == PanicCode::InvalidOpcode);
    assert!(PanicCode::classify(8) == PanicCode::DoubleFault);
    assert!(PanicCode::classify(12) == PanicCode::StackOverflow);
    assert!(PanicCode::classify(13) == PanicCode::GeneralProtectionFault);
    assert!(PanicCode::classify(14) == PanicCode::PageFault);
    assert!(PanicCode::classify(18) == PanicCode::MachineCheck);
    assert!(PanicCode::classify(4) == PanicCode::Generic);

    assert!(traps::exception_name(0) == "Divide-by-Zero Error");
    assert!(traps::exception_name(14) == "Page Fault");
    assert!(traps::exception_name(200) == "Unknown");

    // Vectors that push a CPU error code, per the architectural table.
    for vector in [8u8, 10, 11, 12, 13, 14, 17, 21, 29, 30] {
        assert!(traps::exception_has_error_code(vector));
    }
    for vector in [0u8, 3, 6, 7, 16, 18, 19] {
        assert!(!traps::exception_has_error_code(vector));
    }
}

/// Contract: PIT divisor computation clamps to the programmable range.
#[test_case]
fn test_pit_divisor_clamping() {
    assert!(traps::pit_divisor_for_hz(0) == 0, "zero Hz is rejected");
    assert!(
        traps::pit_divisor_for_hz(2_000_000) == 1,
        "above the input clock the divisor floors at 1"
    );
    assert!(
        traps::pit_divisor_for_hz(1) == u16::MAX,
        "very low frequencies saturate the 16-bit divisor"
    );
    assert!(traps::pit_divisor_for_hz(100) == 11_931);
}
