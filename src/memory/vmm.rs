//! Virtual memory manager: x86_64 4-level paging with explicit address spaces.
//!
//! Every [`AddressSpace`] is an owning handle to one PML4 root frame.  The
//! walker reaches page-table pages through the higher-half physical window
//! (`virt = KERNEL_BASE + phys`), so mappings can be edited in any space, not
//! just the active one.
//!
//! Kernel virtual layout:
//!
//! ```text
//! 0xFFFF_8000_0000_0000  +----------------------------------+  PML4 slot 256
//!                        |  physical window (64 MiB)        |
//!                        |  2 MiB huge pages, global        |
//! 0xFFFF_8000_0400_0000  +----------------------------------+
//!                        |            (unmapped)            |
//! 0xFFFF_8000_1000_0000  +----------------------------------+
//!                        |  kernel heap arena (demand-      |
//!                        |  paged, up to 16 MiB)            |
//! 0xFFFF_8000_1100_0000  +----------------------------------+
//! ```
//!
//! User virtual layout (per process):
//!
//! ```text
//! 0x0000_7FFF_F000_0000  --- user stack top (exclusive) ---
//!     [stack: 1 MiB, demand-paged, writable]
//! 0x0000_7FFF_EFF0_0000  --- stack base ---
//!     [guard page: must stay unmapped]
//! 0x0000_7000_0000_0000  --- user code base ---
//!     [code: 2 MiB window, read-only after zero-fill]
//! ```
//!
//! The kernel half of every address space (PML4 slots 256–511) is copied by
//! value from the kernel root at creation time, so all processes share the
//! same kernel subtrees; teardown therefore only ever walks slots 0–255.

use bitflags::bitflags;
use core::arch::asm;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::logging;
use crate::memory::pmm;
use crate::sync::spinlock::SpinLock;

const PT_ENTRIES: usize = 512;
const SMALL_PAGE_SIZE: u64 = 4096;
const PAGE_MASK: u64 = !(SMALL_PAGE_SIZE - 1);
const HUGE_2M_SIZE: u64 = 0x20_0000;
const HUGE_1G_SIZE: u64 = 0x4000_0000;

/// First PML4 slot of the shared kernel half.
pub const KERNEL_HALF_FIRST_SLOT: usize = 256;

/// Base of the higher-half window that mirrors physical memory.
pub const KERNEL_HIGHER_HALF_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Kernel heap arena start (demand-paged; see `memory::heap`).
pub const HEAP_BASE: u64 = 0xFFFF_8000_1000_0000;

/// Hard upper bound for the kernel heap arena.
pub const HEAP_MAX_SIZE: u64 = 0x0100_0000; // 16 MiB

/// User executable base virtual address.
pub const USER_CODE_BASE: u64 = 0x0000_7000_0000_0000;

/// User executable window size (2 MiB).
pub const USER_CODE_SIZE: u64 = 0x0020_0000;

/// User executable end address (exclusive).
pub const USER_CODE_END: u64 = USER_CODE_BASE + USER_CODE_SIZE;

/// User stack top (exclusive upper boundary).
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_F000_0000;

/// User stack size (1 MiB).
pub const USER_STACK_SIZE: u64 = 0x0010_0000;

/// User stack start (inclusive).
pub const USER_STACK_BASE: u64 = USER_STACK_TOP - USER_STACK_SIZE;

/// Guard page below the user stack (must stay unmapped).
pub const USER_STACK_GUARD_BASE: u64 = USER_STACK_BASE - SMALL_PAGE_SIZE;

/// Guard page end (exclusive).
pub const USER_STACK_GUARD_END: u64 = USER_STACK_BASE;

bitflags! {
    /// Architectural page-table entry flag bits.
    ///
    /// The values are the exact x86_64 paging-structure bits — a hard
    /// compatibility constraint, not a style choice.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT   = 1 << 0;
        const WRITABLE  = 1 << 1;
        const USER      = 1 << 2;
        const ACCESSED  = 1 << 5;
        const DIRTY     = 1 << 6;
        const HUGE      = 1 << 7;
        const GLOBAL    = 1 << 8;
    }
}

bitflags! {
    /// CPU page-fault error-code bits as pushed on vector 14 entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCode: u64 {
        /// Set when the fault was a protection violation on a present page;
        /// clear when the translation was simply not present.
        const PROTECTION        = 1 << 0;
        const WRITE             = 1 << 1;
        const USER_MODE         = 1 << 2;
        const RESERVED_BIT      = 1 << 3;
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// Error returned by checked mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No physical frame was available for a page-table level or the leaf.
    /// Recoverable: callers translate this into a resource-limit error.
    OutOfMemory,

    /// Virtual address is already mapped to a different physical frame.
    AlreadyMapped {
        virtual_address: u64,
        current_pfn: u64,
        requested_pfn: u64,
    },

    /// The walk ran into a huge-page leaf where an intermediate table was
    /// expected; remapping inside a huge mapping is refused.
    HugePageConflict { virtual_address: u64 },
}

/// Error returned by [`unmap_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    /// The page was never mapped — a deliberate signal to the caller, not a
    /// silent no-op.
    NotMapped { virtual_address: u64 },
}

/// Classified user virtual-address region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRegion {
    /// Executable/text region for the user program image.
    Code,

    /// User stack region.
    Stack,

    /// Guard page below the stack (must stay unmapped).
    Guard,
}

#[derive(Clone, Copy)]
#[repr(transparent)]
struct PageTableEntry(u64);

impl PageTableEntry {
    const FRAME_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    #[inline]
    fn present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    #[inline]
    fn huge(self) -> bool {
        self.flags().contains(PageFlags::HUGE)
    }

    #[inline]
    fn user(self) -> bool {
        self.flags().contains(PageFlags::USER)
    }

    #[inline]
    #[cfg_attr(not(test), allow(dead_code))]
    fn writable(self) -> bool {
        self.flags().contains(PageFlags::WRITABLE)
    }

    /// Returns the architectural flag bits of this entry.
    #[inline]
    fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    /// Returns the mapped page-frame number.
    #[inline]
    fn frame(self) -> u64 {
        (self.0 & Self::FRAME_MASK) >> 12
    }

    /// Writes frame plus flag bits in one store.
    #[inline]
    fn set(&mut self, pfn: u64, flags: PageFlags) {
        self.0 = ((pfn << 12) & Self::FRAME_MASK) | flags.bits();
    }

    /// Rewrites only the flag bits, preserving the frame field.
    #[inline]
    fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & Self::FRAME_MASK) | flags.bits();
    }

    /// Widens intermediate-entry permissions for a user mapping request.
    ///
    /// x86 evaluates user/writable permissions as the AND across all levels,
    /// so intermediates must be at least as permissive as the leaf.
    #[inline]
    fn widen_for_user(&mut self) {
        self.0 |= (PageFlags::USER | PageFlags::WRITABLE).bits();
    }

    /// Clears the entry to the unmapped state.
    #[inline]
    fn clear(&mut self) {
        self.0 = 0;
    }
}

#[repr(C, align(4096))]
struct PageTable {
    entries: [PageTableEntry; PT_ENTRIES],
}

impl PageTable {
    /// Returns whether no entry in this table is present.
    #[inline]
    fn is_empty(&self) -> bool {
        self.entries.iter().all(|entry| !entry.present())
    }
}

/// Owning handle to one address space: the root page-table frame plus its
/// physical address for CR3 loads.
///
/// The handle is deliberately not `Clone`: exactly one owner (the kernel
/// state or a `Process`) is responsible for eventually passing it to
/// [`destroy_address_space`].
#[derive(Debug, PartialEq, Eq)]
pub struct AddressSpace {
    pml4_phys: u64,
}

impl AddressSpace {
    /// Physical address of the root table, suitable for a CR3 load.
    #[inline]
    pub fn root_physical(&self) -> u64 {
        self.pml4_phys
    }
}

/// Global fault-callback contract: `(faulting address, raw error code)` in,
/// "fault fixed" out.
pub type PageFaultHandler = fn(u64, u64) -> bool;

struct VmmState {
    kernel_pml4: u64,
    active_pml4: u64,
    fault_handler: Option<PageFaultHandler>,
    debug_enabled: bool,
}

struct GlobalVmm {
    inner: SpinLock<VmmState>,
    initialized: AtomicBool,
}

static VMM: GlobalVmm = GlobalVmm {
    inner: SpinLock::new(
        "vmm",
        VmmState {
            kernel_pml4: 0,
            active_pml4: 0,
            fault_handler: None,
            debug_enabled: false,
        },
    ),
    initialized: AtomicBool::new(false),
};

/// Executes a closure with access to the global VMM state.
///
/// The critical sections are kept narrow (plain field reads/writes); page
/// tables themselves are never touched while the lock is held, so the fault
/// path can never deadlock against a mapping operation.
#[inline]
fn with_vmm<R>(f: impl FnOnce(&mut VmmState) -> R) -> R {
    debug_assert!(
        VMM.initialized.load(Ordering::Acquire),
        "VMM not initialized"
    );
    let mut guard = VMM.inner.lock();
    f(&mut guard)
}

/// Returns the PML4 index for a canonical virtual address (bits 47:39).
#[inline]
fn pml4_index(va: u64) -> usize {
    ((va >> 39) & 0x1FF) as usize
}

/// Returns the PDP index for a canonical virtual address (bits 38:30).
#[inline]
fn pdp_index(va: u64) -> usize {
    ((va >> 30) & 0x1FF) as usize
}

/// Returns the PD index for a canonical virtual address (bits 29:21).
#[inline]
fn pd_index(va: u64) -> usize {
    ((va >> 21) & 0x1FF) as usize
}

/// Returns the PT index for a canonical virtual address (bits 20:12).
#[inline]
fn pt_index(va: u64) -> usize {
    ((va >> 12) & 0x1FF) as usize
}

/// Aligns an address down to a 4 KiB page boundary.
#[inline]
fn page_align_down(addr: u64) -> u64 {
    addr & PAGE_MASK
}

/// Converts a physical byte address to a page-frame number.
#[inline]
fn phys_to_pfn(addr: u64) -> u64 {
    addr / SMALL_PAGE_SIZE
}

/// Maps a physical address into the higher-half window.
#[inline]
fn phys_to_virt(phys: u64) -> u64 {
    debug_assert!(
        phys < pmm::MANAGED_LIMIT,
        "physical address {:#x} outside the mapped window",
        phys
    );
    KERNEL_HIGHER_HALF_BASE + phys
}

/// Interprets a physical page-table frame as a mutable table.
///
/// Caller contract: `phys` must be a page-table frame owned by the walker's
/// current operation; the single-core kernel serializes all table edits.
#[inline]
fn table_at(phys: u64) -> &'static mut PageTable {
    // SAFETY:
    // - `phys` lies inside the managed window, which is permanently mapped
    //   at `KERNEL_HIGHER_HALF_BASE + phys`.
    // - Page-table ownership conventions guarantee exclusive access for the
    //   duration of the edit (single core, interrupts do not edit tables).
    unsafe { &mut *(phys_to_virt(phys) as *mut PageTable) }
}

/// Allocates one zeroed physical frame for a page-table level.
#[inline]
fn alloc_table_frame() -> Option<u64> {
    pmm::with_pmm(|mgr| mgr.alloc_frame()).map(|frame| frame.physical_address())
}

/// Reads the current CR3 value.
fn read_cr3() -> u64 {
    let val: u64;
    // SAFETY:
    // - Reading CR3 is privileged and valid in ring 0; no memory is touched.
    unsafe {
        asm!("mov {}, cr3", out(reg) val, options(nomem, nostack, preserves_flags));
    }
    val
}

/// Writes a new CR3 value.
///
/// Caller contract: `val` must point to a valid PML4 frame.
fn write_cr3(val: u64) {
    // SAFETY:
    // - Caller guarantees `val` is a valid root; executed in ring 0.
    unsafe {
        asm!("mov cr3, {}", in(reg) val, options(nostack, preserves_flags));
    }
}

/// Invalidates one TLB entry for the given virtual address.
fn invlpg(addr: u64) {
    // SAFETY:
    // - `invlpg` is privileged and valid in ring 0; the operand is only an
    //   address tag for TLB invalidation.
    unsafe {
        asm!("invlpg [{}]", in(reg) addr, options(nostack, preserves_flags));
    }
}

/// Enables global pages by setting CR4.PGE.
///
/// Entries with the G-bit set then survive CR3 writes, so kernel mappings
/// are not flushed on every context switch.
///
/// # Safety
/// Must run in ring 0, after the G-bits on kernel mappings are configured.
unsafe fn enable_global_pages() {
    const CR4_PGE: u64 = 1 << 7;

    let mut cr4: u64;
    unsafe {
        asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
        cr4 |= CR4_PGE;
        asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));
    }
}

#[inline]
fn vmm_logln(args: core::fmt::Arguments<'_>) {
    logging::logln("vmm", args);
}

fn debug_enabled() -> bool {
    with_vmm(|state| state.debug_enabled)
}

/// Returns the configured user region for the given page-aligned address.
#[inline]
pub fn classify_user_region(virtual_address: u64) -> Option<UserRegion> {
    if (USER_CODE_BASE..USER_CODE_END).contains(&virtual_address) {
        return Some(UserRegion::Code);
    }

    if (USER_STACK_BASE..USER_STACK_TOP).contains(&virtual_address) {
        return Some(UserRegion::Stack);
    }

    if (USER_STACK_GUARD_BASE..USER_STACK_GUARD_END).contains(&virtual_address) {
        return Some(UserRegion::Guard);
    }

    None
}

/// Initializes the VMM: builds the kernel address space and activates it.
///
/// The kernel root maps the managed physical window twice with 2 MiB huge
/// pages — identity (slot 0, needed only until boot code has fully moved to
/// the higher half) and at [`KERNEL_HIGHER_HALF_BASE`] (slot 256, global).
/// The default demand pager is installed as the page-fault callback.
pub fn init(debug_output: bool) {
    let pml4 = alloc_table_frame().expect("VMM: out of memory building kernel root");
    let pdp_identity = alloc_table_frame().expect("VMM: out of memory building identity PDP");
    let pd_identity = alloc_table_frame().expect("VMM: out of memory building identity PD");
    let pdp_higher = alloc_table_frame().expect("VMM: out of memory building higher-half PDP");
    let pd_higher = alloc_table_frame().expect("VMM: out of memory building higher-half PD");

    let huge_count = (pmm::MANAGED_LIMIT / HUGE_2M_SIZE) as usize;
    let table_flags = PageFlags::PRESENT | PageFlags::WRITABLE;
    let huge_flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::HUGE;

    // Identity subtree (slot 0).
    let pd_identity_tbl = table_at(pd_identity);
    for i in 0..huge_count {
        pd_identity_tbl.entries[i].set(phys_to_pfn(i as u64 * HUGE_2M_SIZE), huge_flags);
    }
    table_at(pdp_identity).entries[0].set(phys_to_pfn(pd_identity), table_flags);

    // Higher-half subtree (slot 256), marked global so kernel translations
    // survive CR3 switches once CR4.PGE is on.
    let pd_higher_tbl = table_at(pd_higher);
    for i in 0..huge_count {
        pd_higher_tbl.entries[i].set(
            phys_to_pfn(i as u64 * HUGE_2M_SIZE),
            huge_flags | PageFlags::GLOBAL,
        );
    }
    table_at(pdp_higher).entries[0].set(phys_to_pfn(pd_higher), table_flags);

    let pml4_tbl = table_at(pml4);
    pml4_tbl.entries[0].set(phys_to_pfn(pdp_identity), table_flags);
    pml4_tbl.entries[KERNEL_HALF_FIRST_SLOT].set(phys_to_pfn(pdp_higher), table_flags);

    {
        let mut state = VMM.inner.lock();
        state.kernel_pml4 = pml4;
        state.active_pml4 = pml4;
        state.fault_handler = Some(demand_pager);
        state.debug_enabled = debug_output;
    }
    VMM.initialized.store(true, Ordering::Release);

    write_cr3(pml4);

    // SAFETY:
    // - All kernel G-bits are configured above; ring 0.
    unsafe {
        enable_global_pages();
    }

    if debug_output {
        vmm_logln(format_args!(
            "kernel root at {:#x}, physical window {:#x}..{:#x}",
            pml4,
            0,
            pmm::MANAGED_LIMIT
        ));
    }
}

/// Returns the physical root address of the kernel address space.
pub fn kernel_root() -> u64 {
    with_vmm(|state| state.kernel_pml4)
}

/// Returns the physical root address of the currently active address space.
pub fn active_root() -> u64 {
    with_vmm(|state| state.active_pml4)
}

/// Enables or disables VMM debug output; returns the previous setting.
#[cfg_attr(not(test), allow(dead_code))]
pub fn set_debug_output(enabled: bool) -> bool {
    with_vmm(|state| {
        let old = state.debug_enabled;
        state.debug_enabled = enabled;
        old
    })
}

/// Switches CPU translation to `pml4_phys` and records it as active.
///
/// Single-CPU assumption: there is exactly one "current address space"
/// pointer for the whole kernel.  This is not SMP-safe without per-CPU
/// tracking.
///
/// # Safety
/// `pml4_phys` must point to a valid, fully initialized PML4 whose kernel
/// half matches the kernel root.
pub unsafe fn switch_root(pml4_phys: u64) {
    write_cr3(pml4_phys);
    with_vmm(|state| {
        state.active_pml4 = pml4_phys;
    });
}

/// Switches to the given address space.
///
/// # Safety
/// Same contract as [`switch_root`]; additionally the space must outlive its
/// time as the active root.
pub unsafe fn switch_address_space(space: &AddressSpace) {
    // SAFETY:
    // - Forwarded caller contract.
    unsafe {
        switch_root(space.pml4_phys);
    }
}

/// Creates a fresh address space whose kernel half mirrors the kernel root.
///
/// PML4 slots 256–511 are copied by value, so the new space shares every
/// kernel subtree without re-walking anything.  Slots 0–255 start empty.
pub fn create_address_space() -> Result<AddressSpace, MapError> {
    let pml4 = alloc_table_frame().ok_or(MapError::OutOfMemory)?;
    let kernel_pml4 = kernel_root();

    let new_tbl = table_at(pml4);
    let kernel_tbl = table_at(kernel_pml4);
    for slot in KERNEL_HALF_FIRST_SLOT..PT_ENTRIES {
        new_tbl.entries[slot] = kernel_tbl.entries[slot];
    }

    if debug_enabled() {
        vmm_logln(format_args!("created address space root {:#x}", pml4));
    }

    Ok(AddressSpace { pml4_phys: pml4 })
}

/// Destroys an address space, freeing every owned paging structure.
///
/// Walks only the lower half (slots 0–255): the upper half is shared with
/// the kernel and never owned by a single space.  Huge-page leaves map
/// physical memory directly and are skipped — they are not sub-tables.
/// Present 4 KiB leaf frames are returned to the PMM when it manages them.
///
/// Panics when asked to destroy the kernel address space (programming
/// error).  If the space is currently active, the CPU is switched to the
/// kernel root first so the hardware never walks freed tables.
pub fn destroy_address_space(space: AddressSpace) {
    let pml4_phys = space.pml4_phys;
    let kernel_pml4 = kernel_root();

    if pml4_phys == kernel_pml4 {
        panic!("VMM: attempt to destroy the kernel address space");
    }

    if active_root() == pml4_phys {
        // SAFETY:
        // - The kernel root is always valid; switching away prevents the CPU
        //   from translating through tables freed below.
        unsafe {
            switch_root(kernel_pml4);
        }
    }

    let pml4_tbl = table_at(pml4_phys);
    for pml4_slot in 0..KERNEL_HALF_FIRST_SLOT {
        let pml4e = pml4_tbl.entries[pml4_slot];
        if !pml4e.present() {
            continue;
        }

        let pdp_phys = pml4e.frame() * SMALL_PAGE_SIZE;
        let pdp_tbl = table_at(pdp_phys);
        for pdp_slot in 0..PT_ENTRIES {
            let pdpe = pdp_tbl.entries[pdp_slot];
            if !pdpe.present() || pdpe.huge() {
                continue;
            }

            let pd_phys = pdpe.frame() * SMALL_PAGE_SIZE;
            let pd_tbl = table_at(pd_phys);
            for pd_slot in 0..PT_ENTRIES {
                let pde = pd_tbl.entries[pd_slot];
                if !pde.present() || pde.huge() {
                    continue;
                }

                let pt_phys = pde.frame() * SMALL_PAGE_SIZE;
                let pt_tbl = table_at(pt_phys);
                for pt_slot in 0..PT_ENTRIES {
                    let pte = pt_tbl.entries[pt_slot];
                    if pte.present() {
                        let _ = pmm::with_pmm(|mgr| mgr.release_pfn(pte.frame()));
                    }
                }
                let _ = pmm::with_pmm(|mgr| mgr.release_pfn(phys_to_pfn(pt_phys)));
            }
            let _ = pmm::with_pmm(|mgr| mgr.release_pfn(phys_to_pfn(pd_phys)));
        }
        let _ = pmm::with_pmm(|mgr| mgr.release_pfn(phys_to_pfn(pdp_phys)));
    }

    let released = pmm::with_pmm(|mgr| mgr.release_pfn(phys_to_pfn(pml4_phys)));
    if !released {
        vmm_logln(format_args!(
            "warning: could not release address-space root PFN {:#x}",
            phys_to_pfn(pml4_phys)
        ));
    }
}

/// Flushes the translation for `virt` when the edit is visible to the CPU:
/// either the edited space is active, or the address lies in the shared
/// kernel half.
#[inline]
fn invalidate_if_visible(root: u64, virt: u64) {
    if root == active_root() || pml4_index(virt) >= KERNEL_HALF_FIRST_SLOT {
        invlpg(virt);
    }
}

/// Walks (creating missing levels) down to the PT covering `virt` in the
/// space rooted at `root`.  Returns the PT's physical address.
fn walk_create(root: u64, virt: u64, user: bool) -> Result<u64, MapError> {
    let table_flags = PageFlags::PRESENT | PageFlags::WRITABLE;

    let mut table_phys = root;
    for (level_index, entry_index) in [
        pml4_index(virt),
        pdp_index(virt),
        pd_index(virt),
    ]
    .into_iter()
    .enumerate()
    {
        let table = table_at(table_phys);
        let entry = &mut table.entries[entry_index];

        if !entry.present() {
            let new_table = alloc_table_frame().ok_or(MapError::OutOfMemory)?;
            let mut flags = table_flags;
            if user {
                flags |= PageFlags::USER;
            }
            entry.set(phys_to_pfn(new_table), flags);

            if debug_enabled() {
                vmm_logln(format_args!(
                    "allocated level-{} table {:#x} for VA {:#x}",
                    level_index + 2,
                    new_table,
                    virt
                ));
            }
        } else if entry.huge() {
            return Err(MapError::HugePageConflict {
                virtual_address: virt,
            });
        } else if user && !entry.user() {
            entry.widen_for_user();
        }

        table_phys = entry.frame() * SMALL_PAGE_SIZE;
    }

    Ok(table_phys)
}

/// Walks (without creating) down to the PT covering `virt`, or `None` when
/// any level is absent or a huge-page leaf ends the walk early.
fn walk_existing(root: u64, virt: u64) -> Option<u64> {
    let mut table_phys = root;
    for entry_index in [pml4_index(virt), pdp_index(virt), pd_index(virt)] {
        let entry = table_at(table_phys).entries[entry_index];
        if !entry.present() || entry.huge() {
            return None;
        }
        table_phys = entry.frame() * SMALL_PAGE_SIZE;
    }
    Some(table_phys)
}

/// Maps one 4 KiB page in `space`.
///
/// Missing intermediate levels are created on demand from zeroed PMM frames;
/// allocation failure propagates as [`MapError::OutOfMemory`] — callers must
/// check, this is an ordinary recoverable condition.  Mapping the same frame
/// twice is idempotent (flags are refreshed); mapping a different frame over
/// an existing translation is refused.
pub fn map_page(
    space: &AddressSpace,
    virtual_address: u64,
    physical_address: u64,
    flags: PageFlags,
) -> Result<(), MapError> {
    let virt = page_align_down(virtual_address);
    let phys = page_align_down(physical_address);
    let requested_pfn = phys_to_pfn(phys);
    let user = flags.contains(PageFlags::USER);

    let pt_phys = walk_create(space.pml4_phys, virt, user)?;
    let pt = table_at(pt_phys);
    let entry = &mut pt.entries[pt_index(virt)];

    if entry.present() {
        let current_pfn = entry.frame();
        if current_pfn != requested_pfn {
            return Err(MapError::AlreadyMapped {
                virtual_address: virt,
                current_pfn,
                requested_pfn,
            });
        }

        // Same frame: refresh permissions.  The stale TLB entry must go —
        // the CPU would otherwise keep honouring the old writable bit.
        entry.set_flags(flags | PageFlags::PRESENT);
        invalidate_if_visible(space.pml4_phys, virt);
        return Ok(());
    }

    entry.set(requested_pfn, flags | PageFlags::PRESENT);
    invalidate_if_visible(space.pml4_phys, virt);

    if debug_enabled() {
        vmm_logln(format_args!(
            "mapped VA {:#x} -> PFN {:#x} in root {:#x}",
            virt, requested_pfn, space.pml4_phys
        ));
    }

    Ok(())
}

/// Unmaps one 4 KiB page in `space`.
///
/// An absent translation (missing level or non-present leaf) returns
/// [`UnmapError::NotMapped`] so callers learn there was nothing to unmap.
/// The leaf frame is returned to the PMM when managed, and page-table pages
/// that become empty are pruned and freed bottom-up.
pub fn unmap_page(space: &AddressSpace, virtual_address: u64) -> Result<(), UnmapError> {
    let virt = page_align_down(virtual_address);
    let root = space.pml4_phys;

    let Some(pt_phys) = walk_existing(root, virt) else {
        return Err(UnmapError::NotMapped {
            virtual_address: virt,
        });
    };

    let pt = table_at(pt_phys);
    let entry = &mut pt.entries[pt_index(virt)];
    if !entry.present() {
        return Err(UnmapError::NotMapped {
            virtual_address: virt,
        });
    }

    let leaf_pfn = entry.frame();
    entry.clear();
    invalidate_if_visible(root, virt);
    let _ = pmm::with_pmm(|mgr| mgr.release_pfn(leaf_pfn));

    prune_empty_tables(root, virt);
    Ok(())
}

/// Frees page-table pages left empty after a leaf was cleared, bottom-up.
///
/// A parent entry is removed only when its child table holds no present
/// entries, so shared siblings are never dropped.
fn prune_empty_tables(root: u64, virt: u64) {
    let pml4 = table_at(root);
    let pml4e = &mut pml4.entries[pml4_index(virt)];
    if !pml4e.present() || pml4e.huge() {
        return;
    }

    let pdp_phys = pml4e.frame() * SMALL_PAGE_SIZE;
    let pdp = table_at(pdp_phys);
    let pdpe = &mut pdp.entries[pdp_index(virt)];
    if !pdpe.present() || pdpe.huge() {
        return;
    }

    let pd_phys = pdpe.frame() * SMALL_PAGE_SIZE;
    let pd = table_at(pd_phys);
    let pde = &mut pd.entries[pd_index(virt)];
    if !pde.present() || pde.huge() {
        return;
    }

    let pt_phys = pde.frame() * SMALL_PAGE_SIZE;
    if !table_at(pt_phys).is_empty() {
        return;
    }
    pde.clear();
    let _ = pmm::with_pmm(|mgr| mgr.release_pfn(phys_to_pfn(pt_phys)));

    if !pd.is_empty() {
        return;
    }
    pdpe.clear();
    let _ = pmm::with_pmm(|mgr| mgr.release_pfn(phys_to_pfn(pd_phys)));

    if !pdp.is_empty() {
        return;
    }
    pml4e.clear();
    let _ = pmm::with_pmm(|mgr| mgr.release_pfn(phys_to_pfn(pdp_phys)));
}

/// Resolves `virt` to its physical address in `space`.
///
/// Returns `None` when any level along the path is absent; on success the
/// original page-offset bits are preserved (`phys | (virt & 0xFFF)`, with
/// the wider offset for huge-page leaves).
pub fn translate(space: &AddressSpace, virtual_address: u64) -> Option<u64> {
    let mut table_phys = space.pml4_phys;

    let pml4e = table_at(table_phys).entries[pml4_index(virtual_address)];
    if !pml4e.present() {
        return None;
    }
    table_phys = pml4e.frame() * SMALL_PAGE_SIZE;

    let pdpe = table_at(table_phys).entries[pdp_index(virtual_address)];
    if !pdpe.present() {
        return None;
    }
    if pdpe.huge() {
        let base = pdpe.frame() * SMALL_PAGE_SIZE;
        return Some(base | (virtual_address & (HUGE_1G_SIZE - 1)));
    }
    table_phys = pdpe.frame() * SMALL_PAGE_SIZE;

    let pde = table_at(table_phys).entries[pd_index(virtual_address)];
    if !pde.present() {
        return None;
    }
    if pde.huge() {
        let base = pde.frame() * SMALL_PAGE_SIZE;
        return Some(base | (virtual_address & (HUGE_2M_SIZE - 1)));
    }
    table_phys = pde.frame() * SMALL_PAGE_SIZE;

    let pte = table_at(table_phys).entries[pt_index(virtual_address)];
    if !pte.present() {
        return None;
    }

    Some((pte.frame() * SMALL_PAGE_SIZE) | (virtual_address & (SMALL_PAGE_SIZE - 1)))
}

/// Returns whether `virt` has a translation in `space`.
pub fn is_mapped(space: &AddressSpace, virtual_address: u64) -> bool {
    translate(space, virtual_address).is_some()
}

/// Installs the global page-fault callback.  Last writer wins.
pub fn set_page_fault_handler(handler: PageFaultHandler) {
    with_vmm(|state| {
        state.fault_handler = Some(handler);
    });
}

/// Removes the global page-fault callback.
#[cfg_attr(not(test), allow(dead_code))]
pub fn clear_page_fault_handler() {
    with_vmm(|state| {
        state.fault_handler = None;
    });
}

/// Forwards a page fault to the registered callback.
///
/// Returns whether the fault was fixed.  With no callback registered nothing
/// happens and the trap layer proceeds to its panic path.
pub fn handle_page_fault(faulting_address: u64, error_code: u64) -> bool {
    let handler = with_vmm(|state| state.fault_handler);
    match handler {
        Some(handler) => handler(faulting_address, error_code),
        None => false,
    }
}

/// Default demand pager installed by [`init`].
///
/// Fixes non-present faults inside known demand-paged regions by mapping a
/// fresh zeroed frame:
/// - kernel heap arena — kernel-only, writable, global;
/// - user stack — user, writable;
/// - user code window — user, read-only (the frame is zero-filled by the
///   PMM before the read-only mapping is installed).
///
/// Protection faults (`P=1`) and the stack guard page are never fixed:
/// hiding those would turn real access violations into silent corruption.
pub fn demand_pager(faulting_address: u64, error_code: u64) -> bool {
    let fault = FaultCode::from_bits_truncate(error_code);
    let page = page_align_down(faulting_address);

    if debug_enabled() {
        vmm_logln(format_args!(
            "page fault raw={:#x} aligned={:#x} err={:#x} cr3={:#x}",
            faulting_address,
            page,
            error_code,
            read_cr3()
        ));
        vmm_logln(format_args!(
            "fault bits p={} w={} u={} rsv={} ifetch={}",
            fault.contains(FaultCode::PROTECTION),
            fault.contains(FaultCode::WRITE),
            fault.contains(FaultCode::USER_MODE),
            fault.contains(FaultCode::RESERVED_BIT),
            fault.contains(FaultCode::INSTRUCTION_FETCH),
        ));
    }

    if fault.contains(FaultCode::PROTECTION) {
        vmm_logln(format_args!(
            "protection fault at {:#x} err={:#x} (demand mapping refused)",
            faulting_address, error_code
        ));
        return false;
    }

    let (root, flags) = if (HEAP_BASE..HEAP_BASE + HEAP_MAX_SIZE).contains(&page) {
        (kernel_root(), PageFlags::WRITABLE | PageFlags::GLOBAL)
    } else {
        match classify_user_region(page) {
            Some(UserRegion::Stack) => (active_root(), PageFlags::USER | PageFlags::WRITABLE),
            Some(UserRegion::Code) => (active_root(), PageFlags::USER),
            Some(UserRegion::Guard) => {
                vmm_logln(format_args!(
                    "stack-guard fault at {:#x} (refused)",
                    faulting_address
                ));
                return false;
            }
            None => return false,
        }
    };

    let Some(frame) = pmm::with_pmm(|mgr| mgr.alloc_frame()) else {
        // Out of physical memory inside a fault is unrecoverable for the
        // faulting context; refusing routes it to the trap panic path.
        vmm_logln(format_args!(
            "out of physical memory demand-mapping {:#x}",
            page
        ));
        return false;
    };

    let space = AddressSpace { pml4_phys: root };
    match map_page(&space, page, frame.physical_address(), flags) {
        Ok(()) => true,
        Err(err) => {
            let _ = pmm::with_pmm(|mgr| mgr.release_pfn(frame.pfn));
            vmm_logln(format_args!(
                "demand mapping of {:#x} failed: {:?}",
                page, err
            ));
            false
        }
    }
}

/// Borrows an [`AddressSpace`] view of the kernel root for mapping calls.
///
/// The returned handle must not be passed to [`destroy_address_space`]
/// (which panics on the kernel root).
pub fn kernel_space() -> AddressSpace {
    AddressSpace {
        pml4_phys: kernel_root(),
    }
}
