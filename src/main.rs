//! HELIX Kernel - Main Entry Point
//!
//! The boot loader sets up long mode, maps the low physical window both
//! identity and at the higher half, and jumps here with the kernel size in
//! RDI.  Bring-up order matters: serial first (early diagnostics), then
//! GDT/TSS and FPU, the physical allocator, the trap layer, the VMM (which
//! replaces the loader's page tables and installs the demand pager), the
//! heap, and finally the scheduler.

#![no_std]
#![no_main]

extern crate alloc;

mod arch;
mod logging;
mod memory;
mod panic;
mod process;
mod scheduler;
mod sync;

use core::cell::UnsafeCell;

use arch::{fpu, gdt, traps};
use memory::{heap, pmm, vmm};
use scheduler::Priority;
use sync::mutex::Mutex;

/// Scheduler tick frequency.
const TIMER_HZ: u32 = 250;

/// Shared counter bumped by the demo worker tasks.
///
/// Plain data guarded by [`DEMO_COUNTER_LOCK`]; the mutex discipline is the
/// point of the demo.
struct SharedCounter(UnsafeCell<u64>);

// SAFETY:
// - All access happens while `DEMO_COUNTER_LOCK` is held.
unsafe impl Sync for SharedCounter {}

static DEMO_COUNTER: SharedCounter = SharedCounter(UnsafeCell::new(0));
static DEMO_COUNTER_LOCK: Mutex = Mutex::sleeping("demo-counter");

/// Kernel entry point - called from the boot loader.
///
/// # Safety
/// Called from assembly with the kernel size in RDI.
#[no_mangle]
#[link_section = ".text.boot"]
pub extern "C" fn KernelMain(kernel_size: u64) -> ! {
    // Serial output first so every later step can report.
    logging::init();
    debugln!("HELIX kernel starting...");
    debugln!("Kernel size: {} bytes", kernel_size);

    // GDT/TSS before anything that can take a ring transition.
    gdt::init();
    debugln!("GDT/TSS initialized");

    // FPU control registers + default state template, before tasks exist.
    fpu::init();
    debugln!("FPU initialized");

    pmm::init(true);
    debugln!("Physical memory manager initialized");

    // IDT/PIC before the CR3 switch so exception handlers are in place.
    traps::init();
    debugln!("Trap dispatch initialized");

    vmm::init(false);
    debugln!("Virtual memory manager initialized");

    // The heap arena is demand-paged; the VMM fault handler must already be
    // registered when the allocator writes its first free-list node.
    heap::init(true);
    debugln!("Kernel heap initialized");

    // Scheduler setup: arms the PIT at TIMER_HZ and installs the tick and
    // #NM handlers.  Interrupts stay disabled until everything is wired so
    // the first tick sees consistent state.
    scheduler::init(TIMER_HZ);
    scheduler::set_kernel_address_space_root(vmm::kernel_root());

    scheduler::spawn_kernel_task("worker-a", demo_worker_a, Priority::Normal)
        .expect("failed to spawn worker A");
    scheduler::spawn_kernel_task("worker-b", demo_worker_b, Priority::Normal)
        .expect("failed to spawn worker B");
    scheduler::spawn_kernel_task("heartbeat", heartbeat_task, Priority::High)
        .expect("failed to spawn heartbeat task");

    scheduler::start();
    debugln!("Scheduler started with {} Hz tick", TIMER_HZ);

    // The first timer tick preempts into a task.
    traps::enable();

    idle_loop()
}

/// Low-power idle loop entered after the scheduler is started.
///
/// The scheduler falls back to this context whenever every task is blocked
/// or sleeping; the CPU halts until the next timer interrupt.
fn idle_loop() -> ! {
    loop {
        // SAFETY:
        // - `hlt` parks the CPU until the next interrupt.
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
        }
    }
}

/// Adds `amount` to the shared demo counter under the mutex.
fn bump_counter(amount: u64) -> u64 {
    DEMO_COUNTER_LOCK.lock();
    // SAFETY:
    // - The mutex is held; no other task can touch the cell.
    let value = unsafe {
        let cell = DEMO_COUNTER.0.get();
        *cell += amount;
        *cell
    };
    DEMO_COUNTER_LOCK.unlock();
    value
}

extern "C" fn demo_worker_a() -> ! {
    loop {
        let value = bump_counter(1);
        if value % 1000 == 0 {
            debugln!("worker-a: counter reached {}", value);
        }
        scheduler::yield_now();
    }
}

extern "C" fn demo_worker_b() -> ! {
    loop {
        let value = bump_counter(1);
        if value % 1000 == 500 {
            debugln!("worker-b: counter reached {}", value);
        }
        scheduler::yield_now();
    }
}

/// High-priority task waking once per second to report scheduler counters.
extern "C" fn heartbeat_task() -> ! {
    loop {
        scheduler::sleep_current(1000);
        let stats = scheduler::stats();
        debugln!(
            "heartbeat: ticks={} switches={} ready={} blocked={} sleeping={}",
            stats.ticks,
            stats.context_switches,
            stats.ready,
            stats.blocked,
            stats.sleeping
        );
    }
}
