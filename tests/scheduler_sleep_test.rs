//! Timed-wait tests: sleep transitions, tick-based wake deadlines, and the
//! millisecond-to-tick conversion at different timer frequencies.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(helix_kernel::testing::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;
use helix_kernel::arch::fpu;
use helix_kernel::arch::traps::{self, SavedRegisters};
use helix_kernel::memory::{heap, pmm, vmm};
use helix_kernel::scheduler::{self as sched, Priority, TaskState, TIME_SLICE_TICKS};

#[no_mangle]
#[link_section = ".text.boot"]
pub extern "C" fn KernelMain(_kernel_size: u64) -> ! {
    helix_kernel::logging::init();

    fpu::init();
    pmm::init(false);
    traps::init();
    vmm::init(false);
    heap::init(false);

    test_main();

    loop {
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    helix_kernel::testing::test_panic_handler(info)
}

extern "C" fn dummy_task() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

/// Contract: at 1000 Hz one millisecond is one tick; a sleeping task is
/// skipped by selection and woken exactly at its deadline.
#[test_case]
fn test_sleep_wakes_at_absolute_deadline() {
    sched::init(1000);

    let sleeper = sched::spawn_kernel_task("sleep-a", dummy_task, Priority::Normal)
        .expect("sleeper should spawn");
    let worker = sched::spawn_kernel_task("sleep-b", dummy_task, Priority::Normal)
        .expect("worker should spawn");

    let frame_sleeper = sched::task_frame_ptr(sleeper).expect("sleeper frame should exist");
    let frame_worker = sched::task_frame_ptr(worker).expect("worker frame should exist");

    sched::start();

    let mut bootstrap = SavedRegisters::default();
    let mut current = sched::on_timer_tick(&mut bootstrap as *mut SavedRegisters);
    assert!(current == frame_sleeper, "sleeper selected first");

    // Sleep for 3 ms at tick 1 => wake deadline is tick 4.
    sched::sleep_task(sleeper, 3);
    assert!(sched::task_state(sleeper) == Some(TaskState::Sleeping));

    // Tick 2: the sleeper has left the CPU; the worker takes over.
    current = sched::on_timer_tick(current);
    assert!(current == frame_worker, "worker runs while sleeper sleeps");
    assert!(sched::task_state(sleeper) == Some(TaskState::Sleeping));

    // Tick 3: still before the deadline.
    current = sched::on_timer_tick(current);
    assert!(sched::task_state(sleeper) == Some(TaskState::Sleeping));

    // Tick 4: the deadline is reached; the sleeper becomes Ready.
    current = sched::on_timer_tick(current);
    assert!(
        sched::task_state(sleeper) == Some(TaskState::Ready),
        "deadline tick must wake the sleeper"
    );

    // Same priority: the woken task runs once the worker's slice expires.
    let mut saw_sleeper = false;
    for _ in 0..=TIME_SLICE_TICKS {
        current = sched::on_timer_tick(current);
        if current == frame_sleeper {
            saw_sleeper = true;
            break;
        }
    }
    assert!(saw_sleeper, "woken sleeper must be scheduled again");
    assert!(sched::task_state(sleeper) == Some(TaskState::Running));
}

/// Contract: the wake deadline rounds milliseconds *up* to whole ticks
/// (25 ms at 100 Hz = 2.5 ticks => 3 ticks).
#[test_case]
fn test_sleep_deadline_rounds_up_to_whole_ticks() {
    sched::init(100);
    assert!(sched::timer_hz() == 100);

    let sleeper = sched::spawn_kernel_task("round-a", dummy_task, Priority::Normal)
        .expect("sleeper should spawn");
    let _worker = sched::spawn_kernel_task("round-b", dummy_task, Priority::Normal)
        .expect("worker should spawn");

    sched::start();

    let mut bootstrap = SavedRegisters::default();
    let mut current = sched::on_timer_tick(&mut bootstrap as *mut SavedRegisters);

    // Sleep at tick 1; ceil(25ms * 100Hz / 1000) = 3 ticks => wake at 4.
    sched::sleep_task(sleeper, 25);

    for expected_sleeping in [true, true] {
        current = sched::on_timer_tick(current);
        let state = sched::task_state(sleeper);
        if expected_sleeping {
            assert!(state == Some(TaskState::Sleeping), "deadline not reached yet");
        }
    }

    let _ = sched::on_timer_tick(current);
    assert!(
        sched::task_state(sleeper) == Some(TaskState::Ready),
        "rounded-up deadline must wake on the third tick after sleeping"
    );
}

/// Contract: a zero-millisecond sleep still parks the task for at least one
/// full tick (no same-tick wake).
#[test_case]
fn test_zero_ms_sleep_lasts_one_tick() {
    sched::init(100);

    let sleeper = sched::spawn_kernel_task("zero-a", dummy_task, Priority::Normal)
        .expect("sleeper should spawn");
    let _worker = sched::spawn_kernel_task("zero-b", dummy_task, Priority::Normal)
        .expect("worker should spawn");

    sched::start();

    let mut bootstrap = SavedRegisters::default();
    let current = sched::on_timer_tick(&mut bootstrap as *mut SavedRegisters);

    sched::sleep_task(sleeper, 0);
    assert!(sched::task_state(sleeper) == Some(TaskState::Sleeping));

    let _ = sched::on_timer_tick(current);
    assert!(
        sched::task_state(sleeper) == Some(TaskState::Ready),
        "zero-ms sleep must wake on the next tick"
    );
}

/// Contract: uptime counts processed ticks.
#[test_case]
fn test_uptime_tick_counter() {
    sched::init(100);

    let _task = sched::spawn_kernel_task("uptime-a", dummy_task, Priority::Normal)
        .expect("task should spawn");
    sched::start();

    assert!(sched::uptime_ticks() == 0, "no ticks processed before start");

    let mut bootstrap = SavedRegisters::default();
    let mut current = &mut bootstrap as *mut SavedRegisters;
    for _ in 0..4 {
        current = sched::on_timer_tick(current);
    }

    assert!(sched::uptime_ticks() == 4, "four ticks must be recorded");
}
