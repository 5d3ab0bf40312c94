//! Round-robin scheduler integration tests (single priority level).
//!
//! Ticks are driven synthetically through `on_timer_tick`; no hardware
//! timer interrupts are enabled, so every sequence is deterministic.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(helix_kernel::testing::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;
use helix_kernel::arch::traps::{self, InterruptStackFrame, SavedRegisters};
use helix_kernel::arch::fpu;
use helix_kernel::memory::{heap, pmm, vmm};
use helix_kernel::scheduler::{
    self as sched, Priority, SpawnError, TaskState, MAX_TASKS, TIME_SLICE_TICKS,
};

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

extern "C" fn dummy_task_a() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

extern "C" fn dummy_task_b() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

extern "C" fn dummy_task_c() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

/// Runs one full time slice worth of ticks, asserting the same task stays
/// selected, then returns the frame produced by the slice-expiry tick.
fn run_out_slice(mut current: *mut SavedRegisters) -> *mut SavedRegisters {
    for _ in 0..TIME_SLICE_TICKS - 1 {
        let next = sched::on_timer_tick(current);
        assert!(
            next == current,
            "task must keep running until its slice expires"
        );
        current = next;
    }
    sched::on_timer_tick(current)
}

#[test_case]
fn test_start_without_tasks_does_not_enter_running_state() {
    sched::init(100);
    sched::start();
    assert!(
        !sched::is_running(),
        "scheduler must stay stopped when start is called without tasks"
    );
}

#[test_case]
fn test_round_robin_rotates_after_each_time_slice() {
    sched::init(100);

    let task_a = sched::spawn_kernel_task("rr-a", dummy_task_a, Priority::Normal)
        .expect("task A should spawn");
    let task_b = sched::spawn_kernel_task("rr-b", dummy_task_b, Priority::Normal)
        .expect("task B should spawn");
    let task_c = sched::spawn_kernel_task("rr-c", dummy_task_c, Priority::Normal)
        .expect("task C should spawn");

    let frame_a = sched::task_frame_ptr(task_a).expect("task A frame should exist");
    let frame_b = sched::task_frame_ptr(task_b).expect("task B frame should exist");
    let frame_c = sched::task_frame_ptr(task_c).expect("task C frame should exist");

    sched::start();

    let mut bootstrap = SavedRegisters::default();
    let mut current = &mut bootstrap as *mut SavedRegisters;

    current = sched::on_timer_tick(current);
    assert!(current == frame_a, "first tick should enter task A");

    current = run_out_slice(current);
    assert!(current == frame_b, "slice expiry should rotate to task B");

    current = run_out_slice(current);
    assert!(current == frame_c, "slice expiry should rotate to task C");

    current = run_out_slice(current);
    assert!(current == frame_a, "rotation should wrap back to task A");
}

#[test_case]
fn test_yield_hint_switches_before_slice_expiry() {
    sched::init(100);

    let task_a = sched::spawn_kernel_task("yield-a", dummy_task_a, Priority::Normal)
        .expect("task A should spawn");
    let task_b = sched::spawn_kernel_task("yield-b", dummy_task_b, Priority::Normal)
        .expect("task B should spawn");

    let frame_a = sched::task_frame_ptr(task_a).expect("task A frame should exist");
    let frame_b = sched::task_frame_ptr(task_b).expect("task B frame should exist");

    sched::start();

    let mut bootstrap = SavedRegisters::default();
    let mut current = &mut bootstrap as *mut SavedRegisters;

    current = sched::on_timer_tick(current);
    assert!(current == frame_a, "first tick should enter task A");

    // One tick consumed; without a yield the task would keep its slice.
    current = sched::on_timer_tick(current);
    assert!(current == frame_a, "slice not exhausted, task A keeps running");

    // A voluntary yield forfeits the remaining slice on the next dispatch.
    sched::request_yield();
    current = sched::on_timer_tick(current);
    assert!(
        current == frame_b,
        "yield hint must force a switch to the next ready task"
    );
}

#[test_case]
fn test_spawn_capacity_limit() {
    sched::init(100);

    for _ in 0..MAX_TASKS {
        sched::spawn_kernel_task("cap-filler", dummy_task_a, Priority::Normal)
            .expect("spawn within pool capacity should succeed");
    }

    let err = sched::spawn_kernel_task("cap-overflow", dummy_task_b, Priority::Normal)
        .expect_err("spawn beyond capacity must fail");
    assert!(
        matches!(err, SpawnError::CapacityExceeded),
        "expected CapacityExceeded when the task pool is full"
    );
}

#[test_case]
fn test_spawn_allocates_distinct_task_frames() {
    sched::init(100);

    let task_a = sched::spawn_kernel_task("frames-a", dummy_task_a, Priority::Normal)
        .expect("task A should spawn");
    let task_b = sched::spawn_kernel_task("frames-b", dummy_task_b, Priority::Normal)
        .expect("task B should spawn");
    let task_c = sched::spawn_kernel_task("frames-c", dummy_task_c, Priority::Normal)
        .expect("task C should spawn");

    let frame_a = sched::task_frame_ptr(task_a).expect("task A frame should exist") as usize;
    let frame_b = sched::task_frame_ptr(task_b).expect("task B frame should exist") as usize;
    let frame_c = sched::task_frame_ptr(task_c).expect("task C frame should exist") as usize;

    assert!(frame_a != frame_b, "task A and B frames must differ");
    assert!(frame_b != frame_c, "task B and C frames must differ");
    assert!(frame_a != frame_c, "task A and C frames must differ");
}

#[test_case]
fn test_task_frame_iret_defaults_are_kernel_mode() {
    sched::init(100);
    let task = sched::spawn_kernel_task("iret-check", dummy_task_a, Priority::Normal)
        .expect("task should spawn");

    let iret: InterruptStackFrame = sched::task_iret_frame(task).expect("iret frame must exist");

    assert!(iret.cs == 0x08, "initial task frame must use kernel CS");
    assert!(
        (iret.rflags & 0x2) != 0,
        "initial task frame must keep reserved RFLAGS bit 1 set"
    );
    assert!(
        (iret.rflags & 0x200) != 0,
        "initial task frame must enable interrupts for preemption"
    );
}

#[test_case]
fn test_foreign_frame_does_not_clobber_saved_task_context() {
    sched::init(100);

    let task_a = sched::spawn_kernel_task("foreign-a", dummy_task_a, Priority::Normal)
        .expect("task A should spawn");
    let _task_b = sched::spawn_kernel_task("foreign-b", dummy_task_b, Priority::Normal)
        .expect("task B should spawn");

    sched::start();

    let mut bootstrap = SavedRegisters::default();
    let bootstrap_ptr = &mut bootstrap as *mut SavedRegisters;

    let current = sched::on_timer_tick(bootstrap_ptr);
    let saved_a_before = sched::task_frame_ptr(task_a).expect("task A frame should exist");
    assert!(current == saved_a_before, "task A should be selected first");

    // Feed a non-task frame: the scheduler must keep the running task and
    // must not overwrite A's saved context with the bootstrap pointer.
    let next = sched::on_timer_tick(bootstrap_ptr);
    assert!(
        next == saved_a_before,
        "foreign frame must resume the known-good running task"
    );
    let saved_a_after = sched::task_frame_ptr(task_a).expect("task A frame should exist");
    assert!(
        saved_a_after == saved_a_before,
        "foreign frame must not overwrite saved task context"
    );
}

#[test_case]
fn test_block_unblock_round_trip() {
    sched::init(100);

    let task_a = sched::spawn_kernel_task("block-a", dummy_task_a, Priority::Normal)
        .expect("task A should spawn");
    let task_b = sched::spawn_kernel_task("block-b", dummy_task_b, Priority::Normal)
        .expect("task B should spawn");

    let frame_b = sched::task_frame_ptr(task_b).expect("task B frame should exist");

    sched::block_task(task_a);
    assert!(sched::task_state(task_a) == Some(TaskState::Blocked));

    sched::start();

    let mut bootstrap = SavedRegisters::default();
    let mut current = &mut bootstrap as *mut SavedRegisters;

    current = sched::on_timer_tick(current);
    assert!(
        current == frame_b,
        "blocked task must be skipped by selection"
    );

    assert!(sched::unblock_task(task_a), "first unblock must take effect");
    assert!(
        !sched::unblock_task(task_a),
        "second unblock must be a guarded no-op"
    );
    assert!(sched::task_state(task_a) == Some(TaskState::Ready));

    // A runs once B's slice is consumed.
    let frame_a = sched::task_frame_ptr(task_a).expect("task A frame should exist");
    let mut saw_a = false;
    for _ in 0..=TIME_SLICE_TICKS {
        current = sched::on_timer_tick(current);
        if current == frame_a {
            saw_a = true;
            break;
        }
    }
    assert!(saw_a, "unblocked task must eventually be selected");
}

#[test_case]
fn test_destroyed_task_is_reaped_and_slot_reused() {
    sched::init(100);

    let task_a = sched::spawn_kernel_task("reap-a", dummy_task_a, Priority::Normal)
        .expect("task A should spawn");
    let task_b = sched::spawn_kernel_task("reap-b", dummy_task_b, Priority::Normal)
        .expect("task B should spawn");

    sched::start();

    let mut bootstrap = SavedRegisters::default();
    let mut current = &mut bootstrap as *mut SavedRegisters;
    current = sched::on_timer_tick(current);

    sched::destroy_task(task_b);
    assert!(
        sched::task_state(task_b) == Some(TaskState::Terminated),
        "destroyed task must be Terminated until reaped"
    );

    // The next tick reaps the slot; the id then resolves to nothing.
    let _ = sched::on_timer_tick(current);
    assert!(
        sched::task_state(task_b).is_none(),
        "reaped task id must no longer resolve"
    );

    // A fresh spawn may reuse the slot but never the id.
    let task_c = sched::spawn_kernel_task("reap-c", dummy_task_c, Priority::Normal)
        .expect("task C should spawn after reap");
    assert!(task_c != task_b, "task ids must never be reused");
    assert!(sched::task_state(task_a) == Some(TaskState::Running));
}

#[cfg(debug_assertions)]
#[test_case]
fn test_request_stop_returns_to_bootstrap_frame_and_stops_scheduler() {
    sched::init(100);

    let task_a = sched::spawn_kernel_task("stop-a", dummy_task_a, Priority::Normal)
        .expect("task A should spawn");
    let frame_a = sched::task_frame_ptr(task_a).expect("task A frame should exist");
    sched::start();

    let mut bootstrap = SavedRegisters::default();
    let bootstrap_ptr = &mut bootstrap as *mut SavedRegisters;

    let running = sched::on_timer_tick(bootstrap_ptr);
    assert!(running == frame_a, "first tick should enter task A");
    assert!(sched::is_running(), "scheduler should report running");

    sched::request_stop();
    let after_stop = sched::on_timer_tick(running);
    assert!(
        after_stop == bootstrap_ptr,
        "stop request must switch back to the original bootstrap frame"
    );
    assert!(
        !sched::is_running(),
        "scheduler must report stopped after the stop request"
    );

    let new_task = sched::spawn_kernel_task("stop-b", dummy_task_b, Priority::Normal)
        .expect("spawn should work again after stop");
    let new_frame = sched::task_frame_ptr(new_task).expect("new task frame should exist");
    sched::start();
    let resumed = sched::on_timer_tick(bootstrap_ptr);
    assert!(
        resumed == new_frame,
        "scheduler should start again after a stop cycle"
    );
}

#[test_case]
fn test_wait_for_task_exit_polls_until_gone() {
    let mut alive_polls = 0;
    let mut yields = 0;

    sched::wait_for_task_exit_with(
        42,
        |_tid| {
            alive_polls += 1;
            alive_polls <= 3
        },
        || yields += 1,
    );

    assert!(alive_polls == 4, "liveness must be polled until false");
    assert!(yields == 3, "every positive poll must be followed by a yield");
}
