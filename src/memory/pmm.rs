//! Physical memory manager.
//!
//! Bitmap allocator over one contiguous window of physical memory starting
//! above the kernel image.  The VMM consumes this as an opaque service with
//! a two-call contract: [`FrameAllocator::alloc_frame`] hands out **zeroed**
//! 4 KiB frames, [`FrameAllocator::release_pfn`] returns them.
//!
//! One bit per frame: `1` = used, `0` = free.  The bitmap lives in kernel
//! `.bss`, so no boot-time carving of metadata regions is needed.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::logging;
use crate::sync::spinlock::SpinLock;

/// Size of one physical page frame.
pub const PAGE_SIZE: u64 = 4096;

/// First managed physical address (2 MiB, clear of the kernel image and
/// legacy BIOS areas below it).
pub const MANAGED_BASE: u64 = 0x0020_0000;

/// End (exclusive) of the managed physical window (64 MiB).
pub const MANAGED_LIMIT: u64 = 0x0400_0000;

const FRAME_COUNT: usize = ((MANAGED_LIMIT - MANAGED_BASE) / PAGE_SIZE) as usize;
const BITMAP_WORDS: usize = FRAME_COUNT.div_ceil(64);

/// Virtual base of the higher-half window through which physical frames are
/// reachable for zero-fill (the boot loader maps the managed window there;
/// the VMM re-establishes the same mapping with its own tables).
const HIGHER_HALF_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Handle to one allocated physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysFrame {
    /// Page frame number (physical address / 4096).
    pub pfn: u64,
}

impl PhysFrame {
    /// Returns the physical byte address of this frame.
    #[inline]
    pub const fn physical_address(self) -> u64 {
        self.pfn * PAGE_SIZE
    }
}

/// Bitmap state of the managed window.
pub struct FrameAllocator {
    bitmap: [u64; BITMAP_WORDS],
    frames_free: u64,
    /// Rotating search start so repeated alloc/free cycles do not always
    /// rescan the low bitmap words.
    next_hint: usize,
}

impl FrameAllocator {
    const fn new() -> Self {
        Self {
            bitmap: [0; BITMAP_WORDS],
            frames_free: 0,
            next_hint: 0,
        }
    }

    #[inline]
    fn base_pfn() -> u64 {
        MANAGED_BASE / PAGE_SIZE
    }

    /// Returns whether `pfn` falls into the managed window.
    pub fn is_managed(&self, pfn: u64) -> bool {
        let base = Self::base_pfn();
        pfn >= base && pfn < base + FRAME_COUNT as u64
    }

    /// Number of currently free frames.
    pub fn free_frames(&self) -> u64 {
        self.frames_free
    }

    /// Allocates one zeroed frame, or `None` when the window is exhausted.
    pub fn alloc_frame(&mut self) -> Option<PhysFrame> {
        if self.frames_free == 0 {
            return None;
        }

        for step in 0..BITMAP_WORDS {
            let word_idx = (self.next_hint + step) % BITMAP_WORDS;
            let word = self.bitmap[word_idx];
            if word == u64::MAX {
                continue;
            }

            let bit = (!word).trailing_zeros() as usize;
            let frame_idx = word_idx * 64 + bit;
            if frame_idx >= FRAME_COUNT {
                continue;
            }

            self.bitmap[word_idx] = word | (1u64 << bit);
            self.frames_free -= 1;
            self.next_hint = word_idx;

            let frame = PhysFrame {
                pfn: Self::base_pfn() + frame_idx as u64,
            };
            zero_frame(frame);
            return Some(frame);
        }

        None
    }

    /// Returns a frame to the allocator.
    ///
    /// Returns `false` when `pfn` is outside the managed window or was not
    /// allocated — routine for callers that unmap loader- or MMIO-backed
    /// pages, so this is a status, not an error.
    pub fn release_pfn(&mut self, pfn: u64) -> bool {
        if !self.is_managed(pfn) {
            return false;
        }

        let frame_idx = (pfn - Self::base_pfn()) as usize;
        let word_idx = frame_idx / 64;
        let mask = 1u64 << (frame_idx % 64);

        if self.bitmap[word_idx] & mask == 0 {
            // Double free: report it, keep the bitmap consistent.
            logging::logln(
                "pmm",
                format_args!("release of already-free PFN {:#x} ignored", pfn),
            );
            return false;
        }

        self.bitmap[word_idx] &= !mask;
        self.frames_free += 1;
        true
    }

    fn reset(&mut self) {
        self.bitmap = [0; BITMAP_WORDS];
        self.frames_free = FRAME_COUNT as u64;
        self.next_hint = 0;
    }
}

struct GlobalPmm {
    inner: SpinLock<FrameAllocator>,
    initialized: AtomicBool,
}

static PMM: GlobalPmm = GlobalPmm {
    inner: SpinLock::new("pmm", FrameAllocator::new()),
    initialized: AtomicBool::new(false),
};

/// Zero-fills a frame through the higher-half physical window.
#[inline]
fn zero_frame(frame: PhysFrame) {
    let virt = HIGHER_HALF_BASE + frame.physical_address();
    // SAFETY:
    // - The managed window is mapped at `HIGHER_HALF_BASE + phys` for the
    //   whole kernel lifetime (boot loader first, VMM tables afterwards).
    // - Exactly one page is written and the frame is exclusively owned by
    //   the allocating caller.
    unsafe {
        core::ptr::write_bytes(virt as *mut u8, 0, PAGE_SIZE as usize);
    }
}

/// Initializes the physical memory manager over the managed window.
pub fn init(debug_output: bool) {
    let mut mgr = PMM.inner.lock();
    mgr.reset();
    PMM.initialized.store(true, Ordering::Release);

    if debug_output {
        logging::logln(
            "pmm",
            format_args!(
                "managing {:#x}..{:#x} ({} frames)",
                MANAGED_BASE,
                MANAGED_LIMIT,
                mgr.free_frames()
            ),
        );
    }
}

/// Executes `f` with exclusive access to the frame allocator.
pub fn with_pmm<R>(f: impl FnOnce(&mut FrameAllocator) -> R) -> R {
    debug_assert!(
        PMM.initialized.load(Ordering::Acquire),
        "PMM not initialized"
    );
    let mut mgr = PMM.inner.lock();
    f(&mut mgr)
}

/// Returns whether [`init`] has completed.
#[cfg_attr(not(test), allow(dead_code))]
pub fn is_initialized() -> bool {
    PMM.initialized.load(Ordering::Acquire)
}
