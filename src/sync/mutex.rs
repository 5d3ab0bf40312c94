//! Sleeping mutex built on the raw spinlock and the scheduler.
//!
//! Unlike a spinlock, a contended [`Mutex`] parks the calling task: the task
//! enqueues itself on the mutex's FIFO wait queue, transitions to `Blocked`
//! through the scheduler, and yields the CPU.  `unlock` hands the FIFO head
//! back to the scheduler's unblock path.  A woken task does **not** receive
//! the lock directly — it re-races through the acquisition loop, so wake-up
//! order is FIFO but acquisition order under fresh contention is only a
//! liveness guarantee.
//!
//! A mutex must never be acquired from interrupt context: blocking there is
//! meaningless.  Spin-kind mutexes degrade to busy-waiting and are the only
//! kind usable before the scheduler owns a current task.
//!
//! Every misuse — recursive lock of a non-recursive mutex, unlock by a
//! non-owner, destroying a held mutex or one with queued waiters — is a
//! fatal kernel panic: fail fast, never silently corrupt lock state.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::scheduler::{self, TaskId};
use crate::sync::spinlock::RawSpinLock;
use crate::sync::waitfifo::WaitFifo;

/// Owner value of an unheld mutex (task ids start at 1).
const NO_OWNER: u64 = 0;

/// Pseudo-owner for spin-kind acquisition outside any task context
/// (early boot).
const BOOT_CONTEXT: u64 = u64::MAX;

/// Wait-queue capacity.  Matches the scheduler task pool, so a well-formed
/// kernel can never overflow it.
const MAX_WAITERS: usize = scheduler::MAX_TASKS;

/// Contention behavior of a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexKind {
    /// Contended acquirers block through the scheduler.
    Sleep,

    /// Contended acquirers busy-wait; usable without a task context.
    Spin,
}

pub struct Mutex {
    /// Diagnostics name reported by misuse panics.
    name: &'static str,

    kind: MutexKind,

    /// Whether same-owner re-locking bumps the recursion count instead of
    /// being a fatal error.
    recursive: bool,

    /// Protects `waiters` and serializes owner/recursion transitions.
    lock: RawSpinLock,

    /// Owning task id, [`NO_OWNER`] when free.
    /// Invariant: `owner != NO_OWNER` iff `recursion >= 1`.
    owner: AtomicU64,

    recursion: AtomicU32,

    destroyed: AtomicBool,

    /// FIFO of blocked task ids; insertion order is blocking order.
    /// Guarded by `lock`.
    waiters: UnsafeCell<WaitFifo<MAX_WAITERS>>,
}

// SAFETY:
// - `waiters` is only touched while `lock` is held; all other fields are
//   atomic.  Sharing across contexts is the purpose of the type.
unsafe impl Sync for Mutex {}
unsafe impl Send for Mutex {}

impl Mutex {
    pub const fn new(name: &'static str, kind: MutexKind, recursive: bool) -> Self {
        Self {
            name,
            kind,
            recursive,
            lock: RawSpinLock::new(name),
            owner: AtomicU64::new(NO_OWNER),
            recursion: AtomicU32::new(0),
            destroyed: AtomicBool::new(false),
            waiters: UnsafeCell::new(WaitFifo::new()),
        }
    }

    /// Non-recursive sleeping mutex.
    pub const fn sleeping(name: &'static str) -> Self {
        Self::new(name, MutexKind::Sleep, false)
    }

    /// Recursive sleeping mutex.
    pub const fn sleeping_recursive(name: &'static str) -> Self {
        Self::new(name, MutexKind::Sleep, true)
    }

    /// Spin-kind mutex (busy-waits, never blocks).
    pub const fn spinning(name: &'static str) -> Self {
        Self::new(name, MutexKind::Spin, false)
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Acquires the mutex for the current task, blocking while contended.
    pub fn lock(&self) {
        self.lock_from(scheduler::current_task_id(), scheduler::yield_now);
    }

    /// Attempts to acquire for the current task without blocking.
    pub fn try_lock(&self) -> bool {
        self.try_lock_from(scheduler::current_task_id())
    }

    /// Releases the mutex held by the current task.
    pub fn unlock(&self) {
        self.unlock_from(scheduler::current_task_id());
    }

    /// Resolves the effective lock owner identity for `ctx`.
    ///
    /// Outside task context only spin-kind locking is legal: a sleep lock
    /// would have to block, which is meaningless there.
    fn context_id(&self, ctx: Option<TaskId>) -> u64 {
        match ctx {
            Some(tid) => tid,
            None => match self.kind {
                MutexKind::Spin => BOOT_CONTEXT,
                MutexKind::Sleep => panic!(
                    "mutex '{}': sleep lock taken outside task context",
                    self.name
                ),
            },
        }
    }

    fn check_not_destroyed(&self) {
        if self.destroyed.load(Ordering::Acquire) {
            panic!("mutex '{}': use after destroy", self.name);
        }
    }

    /// Core acquisition protocol with an injectable yield step.
    ///
    /// `yield_once` runs after the task has been enqueued and blocked and
    /// the internal spinlock has been dropped; production callers pass
    /// [`scheduler::yield_now`], tests pass a closure that drives the
    /// scheduler deterministically.
    pub fn lock_from(&self, ctx: Option<TaskId>, mut yield_once: impl FnMut()) {
        self.check_not_destroyed();
        let me = self.context_id(ctx);

        self.lock.acquire();

        if self.owner.load(Ordering::Acquire) == me {
            if self.recursive {
                self.recursion.fetch_add(1, Ordering::AcqRel);
                self.lock.release();
                return;
            }
            self.lock.release();
            panic!("mutex '{}': recursive lock of non-recursive mutex", self.name);
        }

        loop {
            if self.owner.load(Ordering::Acquire) == NO_OWNER {
                break;
            }

            match (self.kind, ctx) {
                (MutexKind::Sleep, Some(tid)) => {
                    // Enqueue-then-block under the internal spinlock so the
                    // owner's unlock cannot wake us before we are blocked
                    // (the lost-wakeup race).  A spurious wakeup may bring
                    // us back here while still queued — don't double-enqueue.
                    let waiters = self.waiters_mut();
                    if !waiters.contains(tid) && !waiters.push_back(tid) {
                        self.lock.release();
                        panic!("mutex '{}': wait queue overflow", self.name);
                    }
                    scheduler::block_task(tid);
                    self.lock.release();
                    yield_once();
                    self.lock.acquire();
                }
                _ => {
                    // Spin kind (or spin degradation in boot context):
                    // busy-wait with the lock dropped so the owner can make
                    // progress.
                    self.lock.release();
                    core::hint::spin_loop();
                    self.lock.acquire();
                }
            }
            // Re-check after waking: another contender may have won the
            // re-acquisition race between our wake-up and this point.
        }

        self.owner.store(me, Ordering::Release);
        self.recursion.store(1, Ordering::Release);
        self.lock.release();
    }

    /// Non-blocking acquisition core.
    ///
    /// Returns `false` on contention — and, unlike [`lock_from`], also on a
    /// same-owner re-lock of a non-recursive mutex (mirroring the raw
    /// spinlock's `try_acquire` contract).
    pub fn try_lock_from(&self, ctx: Option<TaskId>) -> bool {
        self.check_not_destroyed();
        let me = self.context_id(ctx);

        self.lock.acquire();

        let owner = self.owner.load(Ordering::Acquire);
        let acquired = if owner == me {
            if self.recursive {
                self.recursion.fetch_add(1, Ordering::AcqRel);
                true
            } else {
                false
            }
        } else if owner == NO_OWNER {
            self.owner.store(me, Ordering::Release);
            self.recursion.store(1, Ordering::Release);
            true
        } else {
            false
        };

        self.lock.release();
        acquired
    }

    /// Release core.
    ///
    /// Decrements the recursion count; on the final unlock the FIFO head is
    /// handed to the scheduler's unblock path.  Entries whose task has since
    /// terminated are skipped until a live waiter is woken or the queue
    /// drains.
    pub fn unlock_from(&self, ctx: Option<TaskId>) {
        self.check_not_destroyed();
        let me = self.context_id(ctx);

        self.lock.acquire();

        if self.owner.load(Ordering::Acquire) != me {
            self.lock.release();
            panic!("mutex '{}': unlock by non-owner", self.name);
        }

        if self.recursion.load(Ordering::Acquire) > 1 {
            self.recursion.fetch_sub(1, Ordering::AcqRel);
            self.lock.release();
            return;
        }

        self.owner.store(NO_OWNER, Ordering::Release);
        self.recursion.store(0, Ordering::Release);

        let waiters = self.waiters_mut();
        while let Some(tid) = waiters.pop_front() {
            if scheduler::unblock_task(tid) {
                break;
            }
            // Stale entry: the task terminated (or was woken elsewhere)
            // while queued.  Keep draining.
        }

        self.lock.release();
    }

    /// Registers `tid` as a blocked waiter exactly as the contended lock
    /// path would (enqueue, then block through the scheduler).
    ///
    /// Exposed so multi-waiter wake ordering is directly testable without
    /// real interrupt-driven context switches; production code uses
    /// [`lock`](Self::lock), which parks the calling task itself.
    pub fn park_waiter(&self, tid: TaskId) {
        self.check_not_destroyed();
        self.lock.acquire();

        let waiters = self.waiters_mut();
        if !waiters.contains(tid) && !waiters.push_back(tid) {
            self.lock.release();
            panic!("mutex '{}': wait queue overflow", self.name);
        }
        scheduler::block_task(tid);

        self.lock.release();
    }

    /// Validates and retires the mutex.
    ///
    /// # Panics
    ///
    /// Panics while the mutex is owned or has queued waiters — destroying
    /// either would orphan a task, so it is a fatal invariant violation.
    pub fn destroy(&self) {
        self.check_not_destroyed();
        self.lock.acquire();

        if self.owner.load(Ordering::Acquire) != NO_OWNER {
            self.lock.release();
            panic!("mutex '{}': destroy while locked", self.name);
        }

        if !self.waiters_mut().is_empty() {
            self.lock.release();
            panic!("mutex '{}': destroy with queued waiters", self.name);
        }

        self.destroyed.store(true, Ordering::Release);
        self.lock.release();
    }

    /// Returns whether the current context owns the mutex.
    ///
    /// Advisory lock-free read; exact only from the owner's own context.
    pub fn owned(&self) -> bool {
        let ctx = scheduler::current_task_id()
            .unwrap_or(BOOT_CONTEXT);
        self.owner.load(Ordering::Acquire) == ctx
    }

    /// Returns whether the mutex is currently held by anyone.
    ///
    /// Advisory lock-free read.
    pub fn locked(&self) -> bool {
        self.owner.load(Ordering::Acquire) != NO_OWNER
    }

    /// Returns the owning task id, if a task holds the mutex.
    ///
    /// Advisory lock-free read.
    pub fn owner(&self) -> Option<TaskId> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER | BOOT_CONTEXT => None,
            tid => Some(tid),
        }
    }

    /// Current recursion depth (0 when free).
    pub fn recursion_depth(&self) -> u32 {
        self.recursion.load(Ordering::Acquire)
    }

    /// Number of queued waiters.  Advisory: taken under the internal lock
    /// but stale the moment it returns.
    pub fn waiter_count(&self) -> usize {
        self.lock.acquire();
        let len = self.waiters_mut().len();
        self.lock.release();
        len
    }

    /// Access to the wait queue; caller must hold `self.lock`.
    #[allow(clippy::mut_from_ref)]
    fn waiters_mut(&self) -> &mut WaitFifo<MAX_WAITERS> {
        // SAFETY:
        // - Callers hold the internal spinlock, giving exclusive access.
        unsafe { &mut *self.waiters.get() }
    }
}
