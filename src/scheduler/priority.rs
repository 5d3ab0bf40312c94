//! Strict-priority round-robin scheduler core.
//!
//! Five static priority levels, one FIFO ready queue per level.  Selection
//! always takes the head of the highest non-empty level; equal-priority
//! tasks round-robin on time-slice expiry.  A ready task at a strictly
//! higher level than the running task preempts it at the next tick boundary
//! — this is a preemptive strict-priority policy, not a fair-share one.
//!
//! The periodic PIT tick (IRQ0) is the only involuntary preemption trigger;
//! `yield_now` raises the same vector in software, so voluntary and
//! involuntary switches share one code path.  Task stacks are heap-allocated
//! at spawn time and freed when slots are reaped, keeping the static
//! footprint minimal.
//!
//! All mutable scheduler state lives in one [`SchedulerMetadata`] object
//! behind a spinlock; architecture coupling (CR3 reads/switches, TSS.RSP0)
//! goes through a replaceable callback set so the core stays testable with
//! mock state.

use core::arch::asm;
use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

extern crate alloc;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::fpu::{self, FpuState};
use crate::arch::gdt;
use crate::arch::traps::{self, InterruptStackFrame, SavedRegisters};
use crate::memory::vmm;
use crate::process::Process;
use crate::sync::spinlock::SpinLock;

use super::task::{
    allocate_task_stack, build_initial_kernel_task_frame, build_initial_user_task_frame,
    free_task_stack, ForkedTaskImage, KernelTaskFn, Priority, SpawnError, TaskEntry, TaskId,
    TaskInfo, TaskState, TASK_STACK_SIZE,
};

/// Fixed task-pool capacity.  Exhaustion is an ordinary recoverable
/// condition surfaced as [`SpawnError::CapacityExceeded`].
pub const MAX_TASKS: usize = 32;

/// Tick budget a selected task receives before involuntary round-robin
/// preemption at its own priority level.
pub const TIME_SLICE_TICKS: u32 = 5;

/// Stack/FPU resources of a dead task awaiting deallocation.
///
/// Freed one tick after the task is removed so the tick path can still
/// recognize stale frame pointers from that stack (see
/// [`frame_within_any_task_stack`]).
struct PendingFree {
    stack_base: *mut u8,
    stack_size: usize,
    fpu_state: *mut FpuState,
}

/// Aggregate scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerStats {
    pub ready: usize,
    pub running: usize,
    pub blocked: usize,
    pub sleeping: usize,
    pub terminated: usize,
    pub context_switches: u64,
    pub ticks: u64,
}

/// Runtime metadata of the scheduler.
struct SchedulerMetadata {
    /// Global initialization latch set by [`init`].
    initialized: bool,

    /// Whether timer ticks perform scheduling decisions.  Set by [`start`].
    started: bool,

    /// Configured tick frequency, used for sleep-deadline conversion.
    timer_hz: u32,

    /// Next task id to hand out.  Monotonic, never reused.
    next_tid: TaskId,

    /// Last non-task interrupt frame (bootstrap/idle context); the fallback
    /// resume target when no task is runnable.
    bootstrap_frame: *mut SavedRegisters,

    /// Slot index of the currently selected task, `None` in bootstrap/idle
    /// context.
    running_slot: Option<usize>,

    /// Per-slot task table.  Grows on demand up to [`MAX_TASKS`]; slots are
    /// marked unused rather than removed, so indices stay stable.
    slots: Vec<TaskEntry>,

    /// One FIFO ready queue of slot indices per priority level.
    /// Only slots in [`TaskState::Ready`] appear here.
    ready: [VecDeque<usize>; Priority::LEVELS],

    /// Total ticks processed while started.
    tick_count: u64,

    /// Total switches to a different task.
    context_switches: u64,

    /// Resources from reaped tasks awaiting deallocation outside the lock.
    pending_free: Vec<PendingFree>,
}

impl SchedulerMetadata {
    /// Returns empty scheduler metadata.
    ///
    /// `Vec::new`/`VecDeque::new` do not allocate, so this is a `const fn`
    /// usable for the global `static SCHED`.
    const fn new() -> Self {
        Self {
            initialized: false,
            started: false,
            timer_hz: 0,
            next_tid: 1,
            bootstrap_frame: ptr::null_mut(),
            running_slot: None,
            slots: Vec::new(),
            ready: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
            tick_count: 0,
            context_switches: 0,
            pending_free: Vec::new(),
        }
    }
}

// SAFETY:
// - `SchedulerMetadata` is only accessed behind `SpinLock<SchedulerMetadata>`.
// - Raw pointers inside the metadata always reference scheduler-owned task
//   stacks and FPU buffers; no unsynchronized mutable aliasing is created by
//   transferring the container.
unsafe impl Send for SchedulerMetadata {}

static SCHED: SpinLock<SchedulerMetadata> = SpinLock::new("sched", SchedulerMetadata::new());

/// Architecture-specific callbacks used by the scheduler core.
///
/// Isolates MMU/TSS details from the selection logic and makes the behavior
/// replaceable in tests without touching scheduler internals.
#[derive(Clone, Copy)]
pub struct SchedulerArchCallbacks {
    /// Returns the kernel address-space root (CR3).
    pub read_kernel_cr3: fn() -> u64,
    /// Programs TSS.RSP0 before resuming a user-mode task.
    pub set_kernel_rsp0: fn(u64),
    /// Switches the CPU address space to `cr3`.
    pub switch_cr3: unsafe fn(u64),
}

fn default_read_kernel_cr3() -> u64 {
    vmm::kernel_root()
}

fn default_set_kernel_rsp0(rsp0: u64) {
    gdt::set_kernel_rsp0(rsp0);
}

unsafe fn default_switch_cr3(cr3: u64) {
    // SAFETY:
    // - Forwarded caller contract: `cr3` is a valid address-space root.
    unsafe {
        vmm::switch_root(cr3);
    }
}

impl SchedulerArchCallbacks {
    const fn default_callbacks() -> Self {
        Self {
            read_kernel_cr3: default_read_kernel_cr3,
            set_kernel_rsp0: default_set_kernel_rsp0,
            switch_cr3: default_switch_cr3,
        }
    }
}

/// Runtime-selected architecture backend.
static SCHED_ARCH_CALLBACKS: SpinLock<SchedulerArchCallbacks> =
    SpinLock::new("sched-arch", SchedulerArchCallbacks::default_callbacks());

/// Kernel CR3 configured for kernel-task selections.
static SCHED_KERNEL_CR3: AtomicU64 = AtomicU64::new(0);

/// Last CR3 switched by the scheduler path (redundant-switch elimination).
static SCHED_ACTIVE_CR3: AtomicU64 = AtomicU64::new(0);

/// Set by [`yield_now`] so the tick path can distinguish a voluntary switch
/// from slice accounting.
static YIELD_REQUESTED: AtomicBool = AtomicBool::new(false);

/// FXSAVE buffer whose contents currently live in the CPU's FPU registers.
///
/// Lock-free on purpose: the `#NM` handler must never take the scheduler
/// spinlock, because the trap can fire while the tick path already holds it.
static FPU_LOADED: AtomicPtr<FpuState> = AtomicPtr::new(ptr::null_mut());

/// FXSAVE buffer of the currently selected task (null in bootstrap context).
static FPU_CURRENT: AtomicPtr<FpuState> = AtomicPtr::new(ptr::null_mut());

/// Test-only cooperative stop hook.
///
/// The production scheduler carries no stop/restart control state; debug
/// builds keep this external hook so scheduler test kernels can terminate
/// cleanly.
#[cfg(debug_assertions)]
static TEST_STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Executes `f` while holding the scheduler spinlock.
fn with_sched<R>(f: impl FnOnce(&mut SchedulerMetadata) -> R) -> R {
    let mut sched = SCHED.lock();
    f(&mut sched)
}

fn arch_callbacks() -> SchedulerArchCallbacks {
    *SCHED_ARCH_CALLBACKS.lock()
}

fn kernel_cr3_value() -> u64 {
    SCHED_KERNEL_CR3.load(Ordering::Acquire)
}

fn active_cr3_value() -> u64 {
    SCHED_ACTIVE_CR3.load(Ordering::Acquire)
}

fn set_kernel_and_active_cr3(cr3: u64) {
    SCHED_KERNEL_CR3.store(cr3, Ordering::Release);
    SCHED_ACTIVE_CR3.store(cr3, Ordering::Release);
}

fn set_active_cr3(cr3: u64) {
    SCHED_ACTIVE_CR3.store(cr3, Ordering::Release);
}

/// Converts a millisecond duration to a tick count at `hz`, rounding up and
/// never below one full tick.
const fn ms_to_ticks(ms: u64, hz: u32) -> u64 {
    if ms == 0 {
        return 1;
    }
    let ticks = (ms * hz as u64).div_ceil(1000);
    if ticks == 0 {
        1
    } else {
        ticks
    }
}

/// Resolves a tid to its slot index.
fn find_slot_by_tid(meta: &SchedulerMetadata, tid: TaskId) -> Option<usize> {
    meta.slots
        .iter()
        .position(|slot| slot.used && slot.tid == tid)
}

/// Resolves a trap frame pointer back to its owning task slot.
fn find_slot_by_frame(
    meta: &SchedulerMetadata,
    frame_ptr: *const SavedRegisters,
) -> Option<usize> {
    if frame_ptr.is_null() {
        return None;
    }

    meta.slots
        .iter()
        .position(|slot| slot.used && slot.is_frame_within_stack(frame_ptr))
}

/// Returns `true` when `frame_ptr` lies within any scheduler-owned task
/// stack, including stacks pending deallocation.
fn frame_within_any_task_stack(
    meta: &SchedulerMetadata,
    frame_ptr: *const SavedRegisters,
) -> bool {
    if frame_ptr.is_null() {
        return false;
    }

    if find_slot_by_frame(meta, frame_ptr).is_some() {
        return true;
    }

    let frame_start = frame_ptr as usize;
    let frame_end = frame_start + size_of::<SavedRegisters>() + size_of::<InterruptStackFrame>();
    for pending in meta.pending_free.iter() {
        if !pending.stack_base.is_null() {
            let stack_start = pending.stack_base as usize;
            let stack_end = stack_start + pending.stack_size;
            if frame_start >= stack_start && frame_end <= stack_end {
                return true;
            }
        }
    }

    false
}

/// Removes `slot` from its priority's ready queue if queued.
fn remove_from_ready(meta: &mut SchedulerMetadata, slot: usize) {
    let level = meta.slots[slot].priority.index();
    if let Some(pos) = meta.ready[level].iter().position(|&s| s == slot) {
        meta.ready[level].remove(pos);
    }
}

/// Highest priority with a queued ready task, if any.
fn highest_ready_priority(meta: &SchedulerMetadata) -> Option<usize> {
    (0..Priority::LEVELS)
        .rev()
        .find(|&level| !meta.ready[level].is_empty())
}

/// Moves all due sleepers back to their ready queues.
fn wake_due_sleepers(meta: &mut SchedulerMetadata) {
    let now = meta.tick_count;
    for slot in 0..meta.slots.len() {
        if meta.slots[slot].used
            && meta.slots[slot].state == TaskState::Sleeping
            && meta.slots[slot].wake_tick <= now
        {
            meta.slots[slot].state = TaskState::Ready;
            meta.slots[slot].wake_tick = 0;
            let level = meta.slots[slot].priority.index();
            meta.ready[level].push_back(slot); // capacity reserved in init()
        }
    }
}

/// Reclaims every [`Terminated`](TaskState::Terminated) slot.
///
/// Called at the start of the tick — execution is guaranteed off the dead
/// task's kernel stack by then, so clearing the slot is safe.  Stacks and
/// FPU buffers go to the pending-free list and are deallocated after the
/// scheduler lock is released.  Dropping the process reference here releases
/// the process address space once the last thread is gone.
fn reap_terminated(meta: &mut SchedulerMetadata) {
    for slot in 0..meta.slots.len() {
        if !meta.slots[slot].used || meta.slots[slot].state != TaskState::Terminated {
            continue;
        }

        let fpu_state = meta.slots[slot].fpu_state;
        if !fpu_state.is_null() {
            // Detach the dead buffer from the lock-free FPU bookkeeping
            // before it is queued for deallocation.
            let _ = FPU_LOADED.compare_exchange(
                fpu_state,
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            let _ = FPU_CURRENT.compare_exchange(
                fpu_state,
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }

        if !meta.slots[slot].stack_base.is_null() && meta.pending_free.try_reserve(1).is_ok() {
            meta.pending_free.push(PendingFree {
                stack_base: meta.slots[slot].stack_base,
                stack_size: meta.slots[slot].stack_size,
                fpu_state,
            });
        }

        if meta.running_slot == Some(slot) {
            meta.running_slot = None;
        }

        // Drops the process Arc; the last thread of a process releases its
        // address space here.
        meta.slots[slot] = TaskEntry::empty();
    }
}

/// Returns `bootstrap_frame` if set, otherwise `current_frame`.
#[inline]
fn bootstrap_or_current(
    meta: &SchedulerMetadata,
    current_frame: *mut SavedRegisters,
) -> *mut SavedRegisters {
    if !meta.bootstrap_frame.is_null() {
        meta.bootstrap_frame
    } else {
        current_frame
    }
}

/// Frees deferred stacks and FPU buffers outside the scheduler lock.
fn free_pending(pending: &[PendingFree]) {
    for entry in pending {
        // SAFETY:
        // - Pointers were produced by `allocate_task_stack` /
        //   `FpuState::allocate_default` and detached from all scheduler
        //   state one tick ago.
        unsafe {
            free_task_stack(entry.stack_base);
            FpuState::deallocate(entry.fpu_state);
        }
    }
}

/// Clears all volatile scheduling state after a full teardown.
///
/// `initialized` and the address-space configuration survive so the
/// scheduler can be restarted without re-registration.
#[cfg_attr(not(debug_assertions), allow(dead_code))]
fn reset_volatile_state(meta: &mut SchedulerMetadata) {
    meta.started = false;
    meta.bootstrap_frame = ptr::null_mut();
    meta.running_slot = None;
    meta.tick_count = 0;
    meta.context_switches = 0;
    meta.slots.clear();
    for level in 0..Priority::LEVELS {
        meta.ready[level].clear();
    }
    meta.pending_free.clear();
}

/// Switches CR3 for the selected slot when needed.
fn apply_selected_address_space(meta: &SchedulerMetadata, slot: usize) {
    let target_cr3 = if meta.slots[slot].is_user {
        meta.slots[slot]
            .process
            .as_ref()
            .map(|p| p.address_space_root())
            .unwrap_or(0)
    } else {
        kernel_cr3_value()
    };

    if target_cr3 == 0 || active_cr3_value() == target_cr3 {
        return;
    }

    // SAFETY:
    // - `target_cr3` originates from scheduler-controlled task metadata.
    // - The backend callback defines the platform switch operation.
    unsafe {
        (arch_callbacks().switch_cr3)(target_cr3);
    }

    set_active_cr3(target_cr3);
}

/// Selects the next runnable task and returns its frame.
///
/// Scans the ready queues from `Realtime` down to `Idle` and pops the FIFO
/// head of the first non-empty level.  Falls back to the bootstrap frame
/// when every task is blocked or sleeping so the CPU can sit in the idle
/// `hlt` loop instead of spinning.
fn select_next_task(
    meta: &mut SchedulerMetadata,
    current_frame: *mut SavedRegisters,
    prev_running: Option<usize>,
) -> *mut SavedRegisters {
    for level in (0..Priority::LEVELS).rev() {
        while let Some(slot) = meta.ready[level].pop_front() {
            // Stale queue entries cannot normally exist (state transitions
            // dequeue eagerly); drop them defensively if they do.
            if !meta.slots[slot].used || meta.slots[slot].state != TaskState::Ready {
                continue;
            }

            let frame = meta.slots[slot].frame_ptr;
            if !meta.slots[slot].is_frame_within_stack(frame) {
                crate::logging::logln(
                    "sched",
                    format_args!(
                        "dropping task {} with corrupted frame pointer",
                        meta.slots[slot].tid
                    ),
                );
                meta.slots[slot].state = TaskState::Terminated;
                continue;
            }

            meta.slots[slot].state = TaskState::Running;
            meta.slots[slot].slice_remaining = TIME_SLICE_TICKS;
            meta.running_slot = Some(slot);

            if meta.slots[slot].is_user {
                (arch_callbacks().set_kernel_rsp0)(meta.slots[slot].kernel_rsp_top);
            }

            apply_selected_address_space(meta, slot);

            let next_fpu = meta.slots[slot].fpu_state;
            FPU_CURRENT.store(next_fpu, Ordering::Release);

            if prev_running != Some(slot) {
                meta.context_switches += 1;

                if FPU_LOADED.load(Ordering::Acquire) != next_fpu {
                    // Arm the lazy FPU switch: the first FPU/SSE use by the
                    // new task traps into `fpu_trap_handler`.
                    // SAFETY:
                    // - Ring 0; pairs with the #NM handler registered in init().
                    unsafe {
                        fpu::set_ts();
                    }
                }
            }

            return frame;
        }
    }

    meta.running_slot = None;
    FPU_CURRENT.store(ptr::null_mut(), Ordering::Release);
    bootstrap_or_current(meta, current_frame)
}

/// IRQ adapter that routes PIT ticks into the scheduler core.
fn timer_irq_handler(_vector: u8, frame: &mut SavedRegisters) -> *mut SavedRegisters {
    on_timer_tick(frame as *mut SavedRegisters)
}

/// `#NM` (Device Not Available) handler performing the deferred FPU switch.
///
/// Deliberately lock-free: the trap can fire while the tick path holds the
/// scheduler spinlock (the kernel's own SSE use after `CR0.TS` was armed),
/// so only the two atomic buffer pointers are consulted.
fn fpu_trap_handler(_vector: u8, frame: &mut SavedRegisters) -> *mut SavedRegisters {
    // Clear TS first: everything below may itself use SSE.
    // SAFETY:
    // - Ring 0; re-enables FPU/SSE execution for the switch below.
    unsafe {
        fpu::clear_ts();
    }

    let loaded = FPU_LOADED.load(Ordering::Acquire);
    let current = FPU_CURRENT.load(Ordering::Acquire);

    if loaded == current {
        // The CPU already holds the right state (spurious arm).
        return frame as *mut SavedRegisters;
    }

    if !loaded.is_null() {
        // SAFETY:
        // - `loaded` points to a live 512-byte FXSAVE buffer owned by a task
        //   slot (reap detaches buffers before queueing them for free).
        unsafe {
            (*loaded).save();
        }
    }

    if !current.is_null() {
        // SAFETY:
        // - `current` points to the selected task's live FXSAVE buffer and
        //   TS was cleared above.
        unsafe {
            (*current).restore();
        }
    }

    FPU_LOADED.store(current, Ordering::Release);
    frame as *mut SavedRegisters
}

/// Resets and initializes the scheduler.
///
/// Frees any stacks from a previous life, arms the periodic timer at
/// `timer_hz`, and installs the tick and `#NM` handlers in the trap
/// dispatch table.  The tick becomes the scheduler's only involuntary
/// preemption trigger.
pub fn init(timer_hz: u32) {
    let mut stacks_to_free: Vec<PendingFree> = Vec::new();

    with_sched(|meta| {
        // Start with pending-free entries (`mem::take` does not allocate);
        // collect active slot stacks with try_reserve so an OOM inside the
        // spinlock (interrupts disabled) leaks a stack instead of panicking.
        stacks_to_free = core::mem::take(&mut meta.pending_free);

        for slot in meta.slots.iter_mut() {
            if slot.used && !slot.stack_base.is_null() && stacks_to_free.try_reserve(1).is_ok() {
                stacks_to_free.push(PendingFree {
                    stack_base: slot.stack_base,
                    stack_size: slot.stack_size,
                    fpu_state: slot.fpu_state,
                });
                slot.stack_base = ptr::null_mut();
                slot.fpu_state = ptr::null_mut();
            }
        }

        *meta = SchedulerMetadata::new();
        meta.initialized = true;
        meta.timer_hz = timer_hz;

        // Pre-reserve the ready queues so tick-time requeueing never
        // allocates (and therefore never fails) inside the lock.
        for level in 0..Priority::LEVELS {
            let _ = meta.ready[level].try_reserve(MAX_TASKS);
        }
    });

    let backend = arch_callbacks();
    set_kernel_and_active_cr3((backend.read_kernel_cr3)());

    YIELD_REQUESTED.store(false, Ordering::Release);
    FPU_LOADED.store(ptr::null_mut(), Ordering::Release);
    FPU_CURRENT.store(ptr::null_mut(), Ordering::Release);

    #[cfg(debug_assertions)]
    {
        TEST_STOP_REQUESTED.store(false, Ordering::Release);
    }

    free_pending(&stacks_to_free);

    traps::register_handler(traps::IRQ0_TIMER_VECTOR, timer_irq_handler);
    traps::register_handler(traps::EXCEPTION_DEVICE_NOT_AVAILABLE, fpu_trap_handler);
    traps::init_periodic_timer(timer_hz);
}

/// Starts scheduling if initialized and at least one task exists.
pub fn start() {
    with_sched(|meta| {
        let have_tasks = meta.slots.iter().any(|slot| slot.used);
        if meta.initialized && have_tasks {
            meta.started = true;
            meta.bootstrap_frame = ptr::null_mut();
            meta.running_slot = None;
        }
    });

    #[cfg(debug_assertions)]
    {
        TEST_STOP_REQUESTED.store(false, Ordering::Release);
    }
}

/// Internal task-construction descriptor for the shared spawn path.
enum SpawnKind {
    /// Kernel-mode task entered via function pointer.
    Kernel { entry: KernelTaskFn },
    /// Ring-3 task entered via synthetic IRET frame in its process's
    /// address space.
    User {
        entry_rip: u64,
        user_rsp: u64,
        process: Arc<Process>,
    },
}

/// Creates a kernel task and queues it at `priority`.
pub fn spawn_kernel_task(
    name: &'static str,
    entry: KernelTaskFn,
    priority: Priority,
) -> Result<TaskId, SpawnError> {
    spawn_internal(name, priority, SpawnKind::Kernel { entry })
}

/// Creates a user task in a fresh process address space.
///
/// `entry_rip` is a user-space virtual address; the initial user stack
/// pointer is placed at the top of the standard user stack window (the
/// stack pages themselves are demand-mapped on first touch).
pub fn spawn_user_task(
    name: &'static str,
    entry_rip: u64,
    priority: Priority,
) -> Result<TaskId, SpawnError> {
    let process = Process::create().map_err(|_| SpawnError::OutOfMemory)?;
    let user_rsp = vmm::USER_STACK_TOP - 16;
    spawn_internal(
        name,
        priority,
        SpawnKind::User {
            entry_rip,
            user_rsp,
            process,
        },
    )
}

/// Registers an already-constructed task image (the fork path).
///
/// Register state inside `image.frame_ptr` is taken as-is; only a fresh
/// FPU buffer is attached.  The caller must have cloned parent state
/// correctly.
pub fn add_forked_task(image: ForkedTaskImage) -> Result<TaskId, SpawnError> {
    let fpu_state = FpuState::allocate_default();
    if fpu_state.is_null() {
        return Err(SpawnError::StackAllocationFailed);
    }

    let result = with_sched(|meta| {
        if !meta.initialized {
            return Err(SpawnError::NotInitialized);
        }

        let slot_idx = claim_slot(meta)?;
        let tid = meta.next_tid;
        meta.next_tid += 1;

        let is_user = image.process.is_some();
        let entry = TaskEntry {
            used: true,
            tid,
            name: image.name,
            state: TaskState::Ready,
            priority: image.priority,
            frame_ptr: image.frame_ptr,
            kernel_rsp_top: image.kernel_rsp_top,
            is_user,
            process: image.process,
            stack_base: image.stack_base,
            stack_size: image.stack_size,
            slice_remaining: 0,
            wake_tick: 0,
            fpu_state,
        };

        install_slot(meta, slot_idx, entry);
        Ok(tid)
    });

    if result.is_err() {
        // SAFETY:
        // - The buffer was just allocated and never published.
        unsafe {
            FpuState::deallocate(fpu_state);
        }
    }

    result
}

/// Finds a reusable slot or appends a new one, enforcing [`MAX_TASKS`].
fn claim_slot(meta: &mut SchedulerMetadata) -> Result<usize, SpawnError> {
    match meta.slots.iter().position(|slot| !slot.used) {
        Some(idx) => Ok(idx),
        None => {
            if meta.slots.len() >= MAX_TASKS {
                return Err(SpawnError::CapacityExceeded);
            }
            meta.slots
                .try_reserve(1)
                .map_err(|_| SpawnError::StackAllocationFailed)?;
            meta.slots.push(TaskEntry::empty());
            Ok(meta.slots.len() - 1)
        }
    }
}

/// Writes `entry` into `slot_idx` and queues it as ready.
fn install_slot(meta: &mut SchedulerMetadata, slot_idx: usize, entry: TaskEntry) {
    let level = entry.priority.index();
    meta.slots[slot_idx] = entry;
    meta.ready[level].push_back(slot_idx); // capacity reserved in init()
}

/// Shared task creation path used by both spawn wrappers.
///
/// The stack and FPU buffer are allocated *before* the scheduler lock is
/// taken to avoid nesting the scheduler spinlock with the heap spinlock.
fn spawn_internal(
    name: &'static str,
    priority: Priority,
    kind: SpawnKind,
) -> Result<TaskId, SpawnError> {
    let pre_check = with_sched(|meta| {
        if !meta.initialized {
            return Err(SpawnError::NotInitialized);
        }
        Ok(())
    });
    pre_check?;

    let stack_ptr = allocate_task_stack();
    if stack_ptr.is_null() {
        return Err(SpawnError::StackAllocationFailed);
    }

    let fpu_state = FpuState::allocate_default();
    if fpu_state.is_null() {
        // SAFETY:
        // - `stack_ptr` came from `allocate_task_stack` and was never
        //   published.
        unsafe {
            free_task_stack(stack_ptr);
        }
        return Err(SpawnError::StackAllocationFailed);
    }

    let result = with_sched(|meta| {
        // Re-check under the lock; state may have changed since pre-check.
        if !meta.initialized {
            return Err(SpawnError::NotInitialized);
        }

        let slot_idx = claim_slot(meta)?;
        let tid = meta.next_tid;
        meta.next_tid += 1;

        let (frame_ptr, kernel_rsp_top, is_user, process) = match kind {
            SpawnKind::Kernel { entry } => {
                let (frame_ptr, top) =
                    build_initial_kernel_task_frame(stack_ptr, TASK_STACK_SIZE, entry);
                (frame_ptr, top, false, None)
            }
            SpawnKind::User {
                entry_rip,
                user_rsp,
                process,
            } => {
                let (frame_ptr, top) =
                    build_initial_user_task_frame(stack_ptr, TASK_STACK_SIZE, entry_rip, user_rsp);
                (frame_ptr, top, true, Some(process))
            }
        };

        let entry = TaskEntry {
            used: true,
            tid,
            name,
            state: TaskState::Ready,
            priority,
            frame_ptr,
            kernel_rsp_top,
            is_user,
            process,
            stack_base: stack_ptr,
            stack_size: TASK_STACK_SIZE,
            slice_remaining: 0,
            wake_tick: 0,
            fpu_state,
        };

        install_slot(meta, slot_idx, entry);
        Ok(tid)
    });

    if result.is_err() {
        // SAFETY:
        // - Both allocations failed to be published into any task slot.
        unsafe {
            free_task_stack(stack_ptr);
            FpuState::deallocate(fpu_state);
        }
    }

    result
}

/// Scheduler core executed on every timer tick (hardware or `yield_now`).
///
/// Saves the interrupted context when it can be mapped to a known task
/// stack, wakes due sleepers, reaps terminated slots, applies time-slice
/// accounting and strict-priority preemption, and returns the frame pointer
/// to resume.
pub fn on_timer_tick(current_frame: *mut SavedRegisters) -> *mut SavedRegisters {
    let stacks_to_free: Vec<PendingFree>;

    let result = {
        let mut sched = SCHED.lock();
        let meta = &mut *sched;

        if !meta.started {
            return current_frame;
        }

        meta.tick_count = meta.tick_count.wrapping_add(1);

        wake_due_sleepers(meta);

        // Execution is off any dead task's stack by now (it moved to a
        // different task or to bootstrap on the previous switch), so slots
        // can be reclaimed.
        reap_terminated(meta);

        let detected_slot = find_slot_by_frame(meta, current_frame);

        if detected_slot.is_none() && !frame_within_any_task_stack(meta, current_frame) {
            // Always track the latest non-task frame.  The boot stack layout
            // can shift between the first capture and later ticks, which
            // would leave a stale IRET frame with corrupted CS/SS values.
            meta.bootstrap_frame = current_frame;
        }

        stacks_to_free = core::mem::take(&mut meta.pending_free);

        #[cfg(debug_assertions)]
        if TEST_STOP_REQUESTED.swap(false, Ordering::AcqRel) {
            let mut final_free = stacks_to_free;
            for slot in meta.slots.iter_mut() {
                if slot.used && !slot.stack_base.is_null() && final_free.try_reserve(1).is_ok() {
                    final_free.push(PendingFree {
                        stack_base: slot.stack_base,
                        stack_size: slot.stack_size,
                        fpu_state: slot.fpu_state,
                    });
                    slot.stack_base = ptr::null_mut();
                    slot.fpu_state = ptr::null_mut();
                }
            }

            let return_frame = bootstrap_or_current(meta, current_frame);
            reset_volatile_state(meta);
            FPU_LOADED.store(ptr::null_mut(), Ordering::Release);
            FPU_CURRENT.store(ptr::null_mut(), Ordering::Release);
            drop(sched);
            free_pending(&final_free);

            return return_frame;
        }

        let yield_requested = YIELD_REQUESTED.swap(false, Ordering::AcqRel);

        if let Some(slot) = detected_slot {
            // Save context only when the interrupted frame maps to a known
            // task stack.
            meta.slots[slot].frame_ptr = current_frame;
        } else if let Some(running_slot) = meta.running_slot {
            // Foreign frame source: keep the running task and do not let an
            // unknown pointer corrupt saved state.
            let frame = meta.slots[running_slot].frame_ptr;
            drop(sched);
            free_pending(&stacks_to_free);

            return frame;
        }

        let prev_running = meta.running_slot;

        if let Some(cur) = meta.running_slot {
            if meta.slots[cur].used && meta.slots[cur].state == TaskState::Running {
                meta.slots[cur].slice_remaining =
                    meta.slots[cur].slice_remaining.saturating_sub(1);

                let cur_level = meta.slots[cur].priority.index();
                let higher_ready =
                    highest_ready_priority(meta).is_some_and(|level| level > cur_level);

                if !yield_requested
                    && meta.slots[cur].slice_remaining > 0
                    && !higher_ready
                {
                    // Slice not exhausted and nothing more urgent: keep
                    // running without a switch.
                    let frame = meta.slots[cur].frame_ptr;
                    drop(sched);
                    free_pending(&stacks_to_free);

                    return frame;
                }

                // Preempt: back to the end of its level's queue.
                meta.slots[cur].state = TaskState::Ready;
                meta.ready[cur_level].push_back(cur); // capacity reserved in init()
            }
            // A running slot that blocked, slept or terminated itself has
            // already left the Running state; just clear the marker.
            meta.running_slot = None;
        }

        select_next_task(meta, current_frame, prev_running)
    };

    free_pending(&stacks_to_free);
    result
}

/// Marks `tid` as [`TaskState::Blocked`] and removes it from the ready
/// queue.
///
/// The scheduler does not record *why*: the caller (a mutex, a driver) owns
/// the wait structure and must call [`unblock_task`] later, or the task is
/// lost permanently.
///
/// # Panics
///
/// Panics when the scheduler is uninitialized or `tid` is unknown —
/// blocking a nonexistent task is a programming error.
pub fn block_task(tid: TaskId) {
    with_sched(|meta| {
        if !meta.initialized {
            panic!("scheduler not initialized");
        }

        let Some(slot) = find_slot_by_tid(meta, tid) else {
            panic!("scheduler: block of unknown task {}", tid);
        };

        match meta.slots[slot].state {
            TaskState::Blocked | TaskState::Terminated => {}
            state => {
                if state == TaskState::Ready {
                    remove_from_ready(meta, slot);
                }
                meta.slots[slot].state = TaskState::Blocked;
            }
        }
    });
}

/// Makes a blocked task ready again.
///
/// Idempotent and tolerant by contract: unblocking a task that is not
/// blocked — or no longer exists, e.g. a stale id left in a mutex wait
/// queue by a terminated task — is a guarded no-op.  Returns whether a
/// blocked task actually became ready.
pub fn unblock_task(tid: TaskId) -> bool {
    with_sched(|meta| {
        if !meta.initialized {
            return false;
        }

        let Some(slot) = find_slot_by_tid(meta, tid) else {
            return false;
        };

        if meta.slots[slot].state != TaskState::Blocked {
            return false;
        }

        meta.slots[slot].state = TaskState::Ready;
        let level = meta.slots[slot].priority.index();
        meta.ready[level].push_back(slot); // capacity reserved in init()
        true
    })
}

/// Puts `tid` into a timed wait of at least `ms` milliseconds.
///
/// The absolute wake tick is computed from the configured timer frequency;
/// every subsequent tick compares against it and requeues the task once the
/// deadline is reached.
///
/// # Panics
///
/// Panics when the scheduler is uninitialized or `tid` is unknown.
pub fn sleep_task(tid: TaskId, ms: u64) {
    with_sched(|meta| {
        if !meta.initialized {
            panic!("scheduler not initialized");
        }

        let Some(slot) = find_slot_by_tid(meta, tid) else {
            panic!("scheduler: sleep of unknown task {}", tid);
        };

        if meta.slots[slot].state == TaskState::Ready {
            remove_from_ready(meta, slot);
        }

        meta.slots[slot].state = TaskState::Sleeping;
        meta.slots[slot].wake_tick = meta.tick_count + ms_to_ticks(ms, meta.timer_hz);
    });
}

/// Sleeps the calling task and immediately yields the CPU.
pub fn sleep_current(ms: u64) {
    let Some(tid) = current_task_id() else {
        panic!("scheduler: sleep outside task context");
    };
    sleep_task(tid, ms);
    yield_now();
}

/// Removes `tid` from the scheduler.
///
/// The slot transitions to [`TaskState::Terminated`] and stays reserved
/// until the next tick reaps it (stack and control block are released
/// then; the process address space goes with the last thread).  Any stale
/// wait-queue entries for the task become harmless: its id is never reused
/// and `unblock_task` ignores dead ids.
///
/// # Panics
///
/// Panics when the scheduler is uninitialized or `tid` is unknown.
pub fn destroy_task(tid: TaskId) {
    with_sched(|meta| {
        if !meta.initialized {
            panic!("scheduler not initialized");
        }

        let Some(slot) = find_slot_by_tid(meta, tid) else {
            panic!("scheduler: destroy of unknown task {}", tid);
        };

        if meta.slots[slot].state == TaskState::Terminated {
            return;
        }

        if meta.slots[slot].state == TaskState::Ready {
            remove_from_ready(meta, slot);
        }

        meta.slots[slot].state = TaskState::Terminated;
    });
}

/// Terminates the calling task and forces an immediate reschedule.
///
/// The slot stays reserved until the next tick's reap, so the stack this
/// code is still executing on cannot be handed to a fresh `spawn_*` in the
/// window between marking and switching.  Never returns.
pub fn exit_current_task() -> ! {
    let tid = current_task_id().expect("exit_current_task outside scheduled task");
    destroy_task(tid);
    yield_now();
    loop {
        core::hint::spin_loop();
    }
}

/// Marks the voluntary-yield hint consumed by the next tick.
///
/// The next `on_timer_tick` switches regardless of the running task's
/// remaining slice.  Used by [`yield_now`] and by tests that drive ticks
/// synthetically.
pub fn request_yield() {
    YIELD_REQUESTED.store(true, Ordering::Release);
}

/// Voluntary CPU relinquishment.
///
/// Raises the timer vector in software so the switch runs through the same
/// dispatch path as an involuntary tick; the yield hint exempts the task
/// from slice accounting for this pass.
pub fn yield_now() {
    request_yield();

    // SAFETY:
    // - Software interrupt to the timer vector enters the scheduler path;
    //   valid in ring 0.
    unsafe {
        asm!(
            "int {vector}",
            vector = const traps::IRQ0_TIMER_VECTOR,
            options(nomem)
        );
    }
}

/// Returns the id of the currently running task, if any.
pub fn current_task_id() -> Option<TaskId> {
    with_sched(|meta| meta.running_slot.map(|slot| meta.slots[slot].tid))
}

/// Returns the lifecycle state of `tid`, or `None` for unknown/reaped ids.
pub fn task_state(tid: TaskId) -> Option<TaskState> {
    with_sched(|meta| find_slot_by_tid(meta, tid).map(|slot| meta.slots[slot].state))
}

/// Returns the priority of `tid`.
pub fn task_priority(tid: TaskId) -> Option<Priority> {
    with_sched(|meta| find_slot_by_tid(meta, tid).map(|slot| meta.slots[slot].priority))
}

/// Returns an information snapshot for `tid`.
pub fn task_by_tid(tid: TaskId) -> Option<TaskInfo> {
    with_sched(|meta| {
        find_slot_by_tid(meta, tid).map(|slot| TaskInfo {
            tid: meta.slots[slot].tid,
            name: meta.slots[slot].name,
            state: meta.slots[slot].state,
            priority: meta.slots[slot].priority,
        })
    })
}

/// Changes the priority of `tid`.
///
/// A ready task moves to the tail of its new level immediately; the
/// running task's eligibility is re-evaluated at the next tick boundary,
/// where a strictly-higher-priority ready task preempts it.
///
/// # Panics
///
/// Panics when the scheduler is uninitialized or `tid` is unknown.
pub fn set_priority(tid: TaskId, priority: Priority) {
    with_sched(|meta| {
        if !meta.initialized {
            panic!("scheduler not initialized");
        }

        let Some(slot) = find_slot_by_tid(meta, tid) else {
            panic!("scheduler: set_priority of unknown task {}", tid);
        };

        if meta.slots[slot].priority == priority {
            return;
        }

        let was_ready = meta.slots[slot].state == TaskState::Ready;
        if was_ready {
            remove_from_ready(meta, slot);
        }

        meta.slots[slot].priority = priority;

        if was_ready {
            meta.ready[priority.index()].push_back(slot); // capacity reserved in init()
        }
    });
}

/// Returns aggregate scheduler counters.
pub fn stats() -> SchedulerStats {
    with_sched(|meta| {
        let mut stats = SchedulerStats {
            context_switches: meta.context_switches,
            ticks: meta.tick_count,
            ..SchedulerStats::default()
        };

        for slot in meta.slots.iter().filter(|slot| slot.used) {
            match slot.state {
                TaskState::Ready => stats.ready += 1,
                TaskState::Running => stats.running += 1,
                TaskState::Blocked => stats.blocked += 1,
                TaskState::Sleeping => stats.sleeping += 1,
                TaskState::Terminated => stats.terminated += 1,
            }
        }

        stats
    })
}

/// Total ticks processed since [`start`].
pub fn uptime_ticks() -> u64 {
    with_sched(|meta| meta.tick_count)
}

/// Configured timer frequency.
pub fn timer_hz() -> u32 {
    with_sched(|meta| meta.timer_hz)
}

/// Returns the saved frame pointer for `tid` if the task is live.
///
/// Primarily intended for integration tests and diagnostics.
pub fn task_frame_ptr(tid: TaskId) -> Option<*mut SavedRegisters> {
    with_sched(|meta| find_slot_by_tid(meta, tid).map(|slot| meta.slots[slot].frame_ptr))
}

/// Returns a copy of the interrupt return frame for `tid`.
///
/// Intended for tests that validate bootstrap frame construction.
#[cfg_attr(not(test), allow(dead_code))]
pub fn task_iret_frame(tid: TaskId) -> Option<InterruptStackFrame> {
    with_sched(|meta| {
        let slot = find_slot_by_tid(meta, tid)?;
        let frame_ptr = meta.slots[slot].frame_ptr as usize;
        let iret_ptr = frame_ptr + size_of::<SavedRegisters>();
        // SAFETY:
        // - `frame_ptr` belongs to the scheduler-owned stack for this task.
        // - The bootstrap frame builders write `InterruptStackFrame` directly
        //   behind `SavedRegisters`.
        Some(unsafe { *(iret_ptr as *const InterruptStackFrame) })
    })
}

/// Returns whether the scheduler is currently active.
#[cfg_attr(not(test), allow(dead_code))]
pub fn is_running() -> bool {
    with_sched(|meta| meta.started)
}

/// Requests a cooperative scheduler stop on the next tick (test hook).
#[cfg_attr(not(test), allow(dead_code))]
pub fn request_stop() {
    #[cfg(debug_assertions)]
    {
        TEST_STOP_REQUESTED.store(true, Ordering::Release);
    }
}

/// Replaces the architecture callback set used by the scheduler core.
#[cfg_attr(not(test), allow(dead_code))]
pub fn set_arch_callbacks(callbacks: SchedulerArchCallbacks) {
    *SCHED_ARCH_CALLBACKS.lock() = callbacks;
}

/// Restores the default x86_64 backend (`vmm` + `gdt` integration).
#[cfg_attr(not(test), allow(dead_code))]
pub fn reset_arch_callbacks_to_default() {
    *SCHED_ARCH_CALLBACKS.lock() = SchedulerArchCallbacks::default_callbacks();
}

/// Sets the kernel address-space root used for kernel-task selections.
pub fn set_kernel_address_space_root(kernel_cr3: u64) {
    debug_assert!(kernel_cr3 != 0, "kernel_cr3 must be non-zero");
    set_kernel_and_active_cr3(kernel_cr3);
}

/// Waits cooperatively until `tid` is no longer present in the scheduler.
///
/// Intended for foreground flows that block the caller until a spawned task
/// has terminated and been reaped.
pub fn wait_for_task_exit(tid: TaskId) {
    wait_for_task_exit_with(tid, |id| task_state(id).is_some(), yield_now);
}

/// Generic wait helper behind [`wait_for_task_exit`].
///
/// `is_task_alive` reports whether `tid` is still present; `yield_once`
/// provides one cooperative scheduling opportunity.  Exposed so the wait
/// loop contract is testable without real interrupt-driven switches.
pub fn wait_for_task_exit_with<FAlive, FYield>(
    tid: TaskId,
    mut is_task_alive: FAlive,
    mut yield_once: FYield,
) where
    FAlive: FnMut(TaskId) -> bool,
    FYield: FnMut(),
{
    while is_task_alive(tid) {
        yield_once();
    }
}
