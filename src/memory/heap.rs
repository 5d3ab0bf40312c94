//! Kernel heap.
//!
//! A `linked_list_allocator` arena over the fixed higher-half range
//! `[vmm::HEAP_BASE, vmm::HEAP_BASE + vmm::HEAP_MAX_SIZE)`.  Physical frames
//! are not reserved up front: touching an unmapped arena page faults, and
//! the VMM's demand pager maps a zeroed frame on the spot.  The VMM (and its
//! fault handler) must therefore be initialized before [`init`] runs — the
//! allocator writes its free-list head into the arena immediately.

use core::sync::atomic::{AtomicBool, Ordering};

use linked_list_allocator::LockedHeap;

use crate::logging;
use crate::memory::vmm;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initializes the kernel heap over the demand-paged arena.
pub fn init(debug_output: bool) {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        // Re-init would corrupt the allocator's free list.
        return;
    }

    // SAFETY:
    // - The arena range is exclusively reserved for the heap in the kernel
    //   virtual layout and backed by the demand pager.
    // - `init` is called exactly once (guarded above).
    unsafe {
        ALLOCATOR
            .lock()
            .init(vmm::HEAP_BASE as *mut u8, vmm::HEAP_MAX_SIZE as usize);
    }

    if debug_output {
        logging::logln(
            "heap",
            format_args!(
                "arena {:#x}..{:#x} ({} KiB max)",
                vmm::HEAP_BASE,
                vmm::HEAP_BASE + vmm::HEAP_MAX_SIZE,
                vmm::HEAP_MAX_SIZE / 1024
            ),
        );
    }
}

/// Returns whether [`init`] has completed.
#[cfg_attr(not(test), allow(dead_code))]
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}
