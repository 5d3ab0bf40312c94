//! Task types: ids, states, priorities, control blocks and the bootstrap
//! frames that make a fresh task resumable by the context-switch path.

use core::alloc::Layout;
use core::mem::size_of;
use core::ptr;

extern crate alloc;
use alloc::alloc as heap_alloc;
use alloc::sync::Arc;

use crate::arch::fpu::FpuState;
use crate::arch::gdt;
use crate::arch::traps::{InterruptStackFrame, SavedRegisters};
use crate::process::Process;

/// Task identifier.
///
/// Monotonically increasing and never reused — slot indices are internal
/// only, so a stale id (for example one left in a mutex wait queue by a
/// terminated task) can always be detected instead of aliasing a new task.
/// Ids start at 1; 0 is never a valid task.
pub type TaskId = u64;

/// Entry point type for schedulable kernel tasks.
///
/// Tasks are entered via a synthetic interrupt-return frame and are expected
/// to never return; an accidental return traps into scheduler-controlled
/// termination.
pub type KernelTaskFn = extern "C" fn() -> !;

pub(super) const TASK_STACK_SIZE: usize = 64 * 1024;
const STACK_ALIGNMENT: usize = 16;
const PAGE_SIZE: usize = 4096;
const KERNEL_CODE_SELECTOR: u64 = gdt::KERNEL_CODE_SELECTOR as u64;
const KERNEL_DATA_SELECTOR: u64 = gdt::KERNEL_DATA_SELECTOR as u64;
const USER_CODE_SELECTOR: u64 = gdt::USER_CODE_SELECTOR as u64;
const USER_DATA_SELECTOR: u64 = gdt::USER_DATA_SELECTOR as u64;

/// RFLAGS bit 9: Interrupt Enable Flag.
const RFLAGS_IF: u64 = 1 << 9;

/// RFLAGS bit 1: reserved, architecturally always 1.
const RFLAGS_RESERVED: u64 = 1 << 1;

/// Default RFLAGS for new tasks: IF=1 so timer preemption stays active,
/// reserved bit set, IOPL=0.
const DEFAULT_RFLAGS: u64 = RFLAGS_IF | RFLAGS_RESERVED;

/// Static priority levels, strictly ordered.
///
/// A ready task at a strictly higher level always preempts a running task
/// at a lower level at the next tick boundary; ties round-robin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    Idle = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Realtime = 4,
}

impl Priority {
    /// Number of distinct levels.
    pub const LEVELS: usize = 5;

    /// Index into per-level structures.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Lifecycle state of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Eligible for selection, queued at its priority level.
    Ready,

    /// The task currently executing on the CPU (exactly one at a time).
    Running,

    /// Parked on an external wait structure (mutex queue, driver).  The
    /// scheduler does not know why; whoever blocked the task must unblock
    /// it later or the task is lost.
    Blocked,

    /// Timed wait; woken when the absolute wake tick is reached.
    Sleeping,

    /// Absorbing final state.  The slot and stack stay reserved until the
    /// next tick reaps them, when execution is guaranteed to have moved off
    /// the dead task's kernel stack.
    ///
    /// This two-phase cleanup avoids a use-after-free race: freeing the
    /// slot inside `exit_current_task` would let a timer IRQ between the
    /// free and the final yield hand the stack to a fresh `spawn_*` while
    /// the exiting code is still running on it.
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// Scheduler has not been initialized via `init`.
    NotInitialized,

    /// The fixed task pool is exhausted.  Recoverable by design: task
    /// creation failing is an ordinary resource-limit condition.
    CapacityExceeded,

    /// Heap allocation for the task stack or scheduler metadata failed.
    StackAllocationFailed,

    /// Creating the task's address space ran out of physical frames.
    OutOfMemory,
}

/// One slot in the task table.
pub(super) struct TaskEntry {
    /// Slot allocation flag: `true` while owned by a live task.
    pub used: bool,

    /// Stable task id; never reused across the kernel lifetime.
    pub tid: TaskId,

    /// Diagnostics name.
    pub name: &'static str,

    pub state: TaskState,

    pub priority: Priority,

    /// Pointer to the saved register frame, the resume target handed back
    /// to the trap trampoline.  Always points into this task's own stack.
    pub frame_ptr: *mut SavedRegisters,

    /// Top of the task's kernel stack, programmed into `TSS.RSP0` before a
    /// ring-3 task is resumed.
    pub kernel_rsp_top: u64,

    /// Whether this slot holds a ring-3 task context.
    pub is_user: bool,

    /// Owning process (shared by all threads of the process; the last drop
    /// releases the process address space).  `None` for kernel tasks.
    pub process: Option<Arc<Process>>,

    /// Base of the heap-allocated kernel stack (exclusively owned).
    pub stack_base: *mut u8,

    pub stack_size: usize,

    /// Remaining tick budget before involuntary preemption.
    pub slice_remaining: u32,

    /// Absolute wake tick while [`TaskState::Sleeping`].
    pub wake_tick: u64,

    /// 512-byte aligned FXSAVE image for lazy FPU switching; null until the
    /// buffer is needed.  Freed when the slot is reaped.
    pub fpu_state: *mut FpuState,
}

impl TaskEntry {
    /// Returns an unused slot marker.
    pub(super) fn empty() -> Self {
        Self {
            used: false,
            tid: 0,
            name: "",
            state: TaskState::Ready,
            priority: Priority::Normal,
            frame_ptr: ptr::null_mut(),
            kernel_rsp_top: 0,
            is_user: false,
            process: None,
            stack_base: ptr::null_mut(),
            stack_size: 0,
            slice_remaining: 0,
            wake_tick: 0,
            fpu_state: ptr::null_mut(),
        }
    }

    /// Checks whether `frame_ptr` lies within this task's stack memory.
    pub(super) fn is_frame_within_stack(&self, frame_ptr: *const SavedRegisters) -> bool {
        if frame_ptr.is_null() || self.stack_base.is_null() {
            return false;
        }
        let frame_start = frame_ptr as usize;
        let frame_end =
            frame_start + size_of::<SavedRegisters>() + size_of::<InterruptStackFrame>();

        let stack_start = self.stack_base as usize;
        let stack_end = stack_start + self.stack_size;
        frame_start >= stack_start && frame_end <= stack_end
    }
}

/// Pre-constructed task image registered via `add_forked_task`.
///
/// The caller (the fork path) is responsible for having cloned the parent's
/// register state into `frame_ptr` correctly; the scheduler registers the
/// task without re-initializing anything.
pub struct ForkedTaskImage {
    pub name: &'static str,
    pub priority: Priority,
    /// Saved-register frame inside `stack_base..stack_base+stack_size`.
    pub frame_ptr: *mut SavedRegisters,
    /// Kernel stack ownership transfers to the scheduler.
    pub stack_base: *mut u8,
    pub stack_size: usize,
    pub kernel_rsp_top: u64,
    /// Process backing the task's address space; `None` for kernel tasks.
    pub process: Option<Arc<Process>>,
}

/// Read-only task information snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub tid: TaskId,
    pub name: &'static str,
    pub state: TaskState,
    pub priority: Priority,
}

/// Aligns `value` down to the given power-of-two `align`.
#[inline]
pub(super) const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Allocates a kernel stack from the heap and touches every page.
///
/// Returns null on failure.  The memory is 16-byte aligned; each page is
/// written once so demand paging happens at spawn time rather than inside
/// IRQ context.
pub(super) fn allocate_task_stack() -> *mut u8 {
    // SAFETY:
    // - Size is non-zero and alignment is a power of two.
    let layout = unsafe { Layout::from_size_align_unchecked(TASK_STACK_SIZE, STACK_ALIGNMENT) };
    // SAFETY:
    // - Layout has non-zero size.
    let ptr = unsafe { heap_alloc::alloc(layout) };
    if ptr.is_null() {
        return ptr::null_mut();
    }

    // SAFETY:
    // - `ptr` points to a valid allocation of `TASK_STACK_SIZE` bytes and
    //   every touched offset stays in bounds.
    unsafe {
        for page_off in (0..TASK_STACK_SIZE).step_by(PAGE_SIZE) {
            ptr::write_volatile(ptr.add(page_off), 0);
        }
    }

    ptr
}

/// Frees a stack returned by [`allocate_task_stack`].
///
/// # Safety
///
/// `ptr` must have come from `allocate_task_stack` and must not be used
/// after this call.
pub(super) unsafe fn free_task_stack(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    // SAFETY:
    // - Constants match the allocation layout; non-zero size, power-of-two
    //   alignment.
    let layout = Layout::from_size_align_unchecked(TASK_STACK_SIZE, STACK_ALIGNMENT);
    heap_alloc::dealloc(ptr, layout);
}

extern "C" fn task_return_trap() -> ! {
    super::priority::exit_current_task()
}

/// Builds the initial kernel-task context on a freshly allocated stack.
///
/// Returns the saved-register frame pointer used as the scheduler resume
/// target, and the stack top (for `kernel_rsp_top`).
pub(super) fn build_initial_kernel_task_frame(
    stack_base: *mut u8,
    stack_size: usize,
    entry: KernelTaskFn,
) -> (*mut SavedRegisters, u64) {
    // SAFETY:
    // - `stack_base` points to a valid heap allocation of `stack_size` bytes
    //   to which the caller holds exclusive access.
    unsafe {
        let stack_top = stack_base as usize + stack_size;

        // SysV-friendly entry alignment, with one return-address slot below
        // RSP pointing at a synthetic trap target: an accidental `ret` from
        // the task body lands in scheduler-controlled termination.
        let entry_rsp = align_down(stack_top, 16) - 8;
        let iret_addr = entry_rsp - size_of::<InterruptStackFrame>();
        let frame_addr = iret_addr - size_of::<SavedRegisters>();

        let frame_ptr = frame_addr as *mut SavedRegisters;
        let iret_ptr = iret_addr as *mut InterruptStackFrame;

        ptr::write(
            entry_rsp as *mut u64,
            task_return_trap as *const () as usize as u64,
        );

        ptr::write(frame_ptr, SavedRegisters::default());
        ptr::write(
            iret_ptr,
            InterruptStackFrame {
                rip: entry as usize as u64,
                cs: KERNEL_CODE_SELECTOR,
                rflags: DEFAULT_RFLAGS,
                rsp: entry_rsp as u64,
                ss: KERNEL_DATA_SELECTOR,
            },
        );

        (frame_ptr, stack_top as u64)
    }
}

/// Builds an initial ring-3 task context on a freshly allocated kernel stack.
///
/// The saved interrupt frame is shaped so the next scheduler-selected
/// `iretq` transitions to ring 3 at `entry_rip` with user stack `user_rsp`.
pub(super) fn build_initial_user_task_frame(
    stack_base: *mut u8,
    stack_size: usize,
    entry_rip: u64,
    user_rsp: u64,
) -> (*mut SavedRegisters, u64) {
    // SAFETY:
    // - `stack_base` points to a valid heap allocation of `stack_size` bytes
    //   to which the caller holds exclusive access.
    unsafe {
        let stack_top = stack_base as usize + stack_size;

        let frame_addr = align_down(stack_top, 16)
            - size_of::<SavedRegisters>()
            - size_of::<InterruptStackFrame>();
        let frame_ptr = frame_addr as *mut SavedRegisters;
        let iret_ptr = (frame_addr + size_of::<SavedRegisters>()) as *mut InterruptStackFrame;

        ptr::write(frame_ptr, SavedRegisters::default());
        ptr::write(
            iret_ptr,
            InterruptStackFrame {
                rip: entry_rip,
                cs: USER_CODE_SELECTOR,
                rflags: DEFAULT_RFLAGS, // IF=1 so timer preemption stays active in ring 3.
                rsp: user_rsp,
                ss: USER_DATA_SELECTOR,
            },
        );

        (frame_ptr, stack_top as u64)
    }
}
