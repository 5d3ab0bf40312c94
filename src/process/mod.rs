//! Process control blocks.
//!
//! A [`Process`] owns exactly one address space.  Tasks (threads) hold the
//! process behind `Arc`, so several threads of one process share one set of
//! page tables; when the scheduler reaps the last thread, the final `Arc`
//! drop releases the address space.

use core::sync::atomic::{AtomicU64, Ordering};

extern crate alloc;
use alloc::sync::Arc;

use crate::memory::vmm::{self, AddressSpace, MapError};

/// Next process id to hand out.  Pid 0 is reserved for "the kernel".
static NEXT_PID: AtomicU64 = AtomicU64::new(1);

pub struct Process {
    pid: u64,

    /// Owned address space; `Option` so `Drop` can take it out by value.
    /// `None` only transiently during teardown.
    address_space: Option<AddressSpace>,
}

impl Process {
    /// Allocates a process with a fresh address space.
    ///
    /// The new space's kernel half mirrors the kernel root (copied by
    /// value); the user half starts empty and is populated by demand paging
    /// and explicit mappings.
    pub fn create() -> Result<Arc<Self>, MapError> {
        let address_space = vmm::create_address_space()?;
        let pid = NEXT_PID.fetch_add(1, Ordering::AcqRel);

        Ok(Arc::new(Self {
            pid,
            address_space: Some(address_space),
        }))
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    /// Physical root of the process address space, for CR3 loads.
    pub fn address_space_root(&self) -> u64 {
        self.address_space
            .as_ref()
            .map(|space| space.root_physical())
            .unwrap_or(0)
    }

    /// Borrow of the owned address space for mapping operations.
    pub fn address_space(&self) -> Option<&AddressSpace> {
        self.address_space.as_ref()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if let Some(space) = self.address_space.take() {
            // The VMM refuses to tear down the active root without first
            // switching to the kernel space, so dropping the last thread of
            // the currently running process is safe.
            vmm::destroy_address_space(space);
        }
    }
}
