//! Spinlocks with interrupt masking and owner tracking.
//!
//! [`RawSpinLock`] is the lowest-level mutual-exclusion primitive in the
//! kernel and the only one that is safe inside interrupt handlers.  It
//! disables interrupts for the whole critical section: on a uniprocessor
//! kernel this is a correctness requirement, not an optimization — a task
//! interrupted while holding a spinlock, whose interrupt handler then tried
//! to take the same lock, would spin forever.
//!
//! The lock records its owning CPU id, which makes same-owner re-acquisition
//! (always a bug) detectable before the spin starts.
//!
//! [`SpinLock<T>`] wraps a value with a `RawSpinLock` and hands out RAII
//! guards; this is the form the scheduler and VMM state use.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::arch::{self, traps};

/// Owner value of an unheld lock.
const NO_OWNER: i32 = -1;

/// Busy-wait lock with interrupt masking, owner tracking and recursion
/// detection.
pub struct RawSpinLock {
    /// Lock word: `true` while held.
    locked: AtomicBool,

    /// Logical CPU id of the holder, [`NO_OWNER`] when free.
    /// Invariant: `owner_cpu != NO_OWNER` iff `locked`.
    owner_cpu: AtomicI32,

    /// Interrupt-enable state captured by `acquire` and restored by
    /// `release`.  Meaningful only while the lock is held.
    saved_interrupts: AtomicBool,

    /// Diagnostics name reported by misuse panics.
    name: &'static str,
}

impl RawSpinLock {
    /// Creates an unlocked spinlock.  No failure mode.
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner_cpu: AtomicI32::new(NO_OWNER),
            saved_interrupts: AtomicBool::new(false),
            name,
        }
    }

    /// Returns the diagnostics name.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Acquires the lock, spinning until it is free.
    ///
    /// Interrupts are disabled before the spin and stay disabled until
    /// [`release`](Self::release); the prior interrupt-enable state is
    /// saved in the lock.
    ///
    /// # Panics
    ///
    /// Panics when the calling CPU already holds this lock — recursive
    /// spinlock acquisition is always a bug.
    pub fn acquire(&self) {
        let were_enabled = traps::are_enabled();
        traps::disable();

        let cpu = arch::cpu_id();
        if self.owner_cpu.load(Ordering::Acquire) == cpu {
            panic!("spinlock '{}': recursive acquisition on CPU {}", self.name, cpu);
        }

        // Test-and-test-and-set: retry the atomic exchange only after a plain
        // load has observed the word free, keeping contended cache traffic low.
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        self.owner_cpu.store(cpu, Ordering::Release);
        self.saved_interrupts.store(were_enabled, Ordering::Relaxed);
    }

    /// Releases the lock and restores the saved interrupt state.
    ///
    /// # Panics
    ///
    /// Panics when the calling CPU does not hold the lock.
    pub fn release(&self) {
        if !self.holding() {
            panic!("spinlock '{}': release without holding", self.name);
        }

        let restore_interrupts = self.saved_interrupts.load(Ordering::Relaxed);
        self.owner_cpu.store(NO_OWNER, Ordering::Release);
        self.locked.store(false, Ordering::Release);

        if restore_interrupts {
            traps::enable();
        }
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// Returns `false` on contention or self-recursion instead of
    /// panicking; the interrupt state is restored on failure.
    pub fn try_acquire(&self) -> bool {
        let were_enabled = traps::are_enabled();
        traps::disable();

        let cpu = arch::cpu_id();
        if self.owner_cpu.load(Ordering::Acquire) == cpu {
            if were_enabled {
                traps::enable();
            }
            return false;
        }

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if were_enabled {
                traps::enable();
            }
            return false;
        }

        self.owner_cpu.store(cpu, Ordering::Release);
        self.saved_interrupts.store(were_enabled, Ordering::Relaxed);
        true
    }

    /// Returns whether the calling CPU holds the lock.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Acquire)
            && self.owner_cpu.load(Ordering::Acquire) == arch::cpu_id()
    }

    /// Acquire variant for call sites that manage interrupt state manually.
    ///
    /// Returns the interrupt-enable state observed before disabling, to be
    /// passed back into [`release_irqrestore`](Self::release_irqrestore).
    pub fn acquire_irqsave(&self) -> bool {
        let were_enabled = traps::are_enabled();
        self.acquire();
        // `acquire` saved the (already-disabled) state it observed; the
        // caller owns restoration, so neutralize the lock's own copy.
        self.saved_interrupts.store(false, Ordering::Relaxed);
        were_enabled
    }

    /// Release variant matching [`acquire_irqsave`](Self::acquire_irqsave).
    pub fn release_irqrestore(&self, were_enabled: bool) {
        self.release();
        if were_enabled {
            traps::enable();
        }
    }
}

// SAFETY:
// - All state is atomic; mutual exclusion is the whole point of the type.
unsafe impl Sync for RawSpinLock {}
unsafe impl Send for RawSpinLock {}

/// Guard-based spinlock protecting a value of type `T`.
pub struct SpinLock<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            raw: RawSpinLock::new(name),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock and returns a guard; the lock is released (and the
    /// interrupt state restored) when the guard drops.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.acquire();
        SpinLockGuard { lock: self }
    }

    /// Non-blocking variant of [`lock`](Self::lock).
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_acquire() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY:
        // - The spinlock guarantees exclusive access while the guard lives.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY:
        // - The spinlock guarantees exclusive access while the guard lives.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

// SAFETY:
// - Access to `data` is synchronized via the raw spinlock.
// - `T: Send` ensures the protected value may move between contexts.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}
