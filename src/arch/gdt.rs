//! Global Descriptor Table (GDT) and Task-State Segment (TSS) setup.
//!
//! Installs a minimal long-mode GDT with kernel/user code and data segments
//! plus one 64-bit TSS. The scheduler consumes exactly two things from this
//! layer: the segment selectors placed into bootstrap task frames, and
//! [`set_kernel_rsp0`] to point `TSS.RSP0` at the selected task's kernel
//! stack before resuming a ring-3 context.

use core::arch::{asm, global_asm};
use core::cell::UnsafeCell;
use core::mem::size_of;
use core::sync::atomic::{AtomicBool, Ordering};

// Layout of the GDT array:
//   [0] null
//   [1] kernel code
//   [2] kernel data
//   [3] user code
//   [4] user data
//   [5] TSS descriptor (low 8 bytes)
//   [6] TSS descriptor (high 8 bytes)
const GDT_ENTRY_COUNT: usize = 7;
const KERNEL_CODE_INDEX: u16 = 1;
const KERNEL_DATA_INDEX: u16 = 2;
const USER_CODE_INDEX: u16 = 3;
const USER_DATA_INDEX: u16 = 4;
const TSS_INDEX: u16 = 5;

/// Requested Privilege Level (RPL) for ring 3.
const RPL_RING3: u16 = 0x3;

/// Kernel code segment selector (ring 0).
pub const KERNEL_CODE_SELECTOR: u16 = KERNEL_CODE_INDEX << 3;

/// Kernel data segment selector (ring 0).
pub const KERNEL_DATA_SELECTOR: u16 = KERNEL_DATA_INDEX << 3;

/// User code segment selector (ring 3).
pub const USER_CODE_SELECTOR: u16 = (USER_CODE_INDEX << 3) | RPL_RING3;

/// User data segment selector (ring 3).
pub const USER_DATA_SELECTOR: u16 = (USER_DATA_INDEX << 3) | RPL_RING3;

/// TSS selector.
pub const TSS_SELECTOR: u16 = TSS_INDEX << 3;

// x86 descriptor access-byte bits.
const ACCESS_PRESENT: u8 = 1 << 7;
const ACCESS_SEGMENT: u8 = 1 << 4; // 1 = code/data segment, 0 = system segment
const ACCESS_EXECUTABLE: u8 = 1 << 3; // code=1, data=0
const ACCESS_RW: u8 = 1 << 1; // readable code / writable data
const ACCESS_RING3: u8 = 0b11 << 5; // DPL=3
const ACCESS_TSS_AVAILABLE: u8 = 0x9; // 64-bit available TSS system type

// Granularity-byte upper nibble bits (G, DB, L, AVL).
// Long-mode code segments set L=1 and keep the rest 0.
const FLAGS_LONG_MODE: u8 = 1 << 5;
const IST_STACK_SIZE: usize = 16 * 1024;

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u64,
}

/// 64-bit long-mode Task State Segment.
///
/// Used here only for privilege transitions: the CPU loads `rsp0` when
/// entering ring 0 from ring 3, and IST1 provides a dedicated emergency
/// stack for double faults.
#[repr(C, packed)]
struct TaskStateSegment {
    _reserved0: u32,
    rsp0: u64,
    _rsp1: u64,
    _rsp2: u64,
    _reserved1: u64,
    _ist1: u64,
    _ist2: u64,
    _ist3: u64,
    _ist4: u64,
    _ist5: u64,
    _ist6: u64,
    _ist7: u64,
    _reserved2: u64,
    _reserved3: u16,
    io_map_base: u16,
}

impl TaskStateSegment {
    const fn new() -> Self {
        Self {
            _reserved0: 0,
            rsp0: 0,
            _rsp1: 0,
            _rsp2: 0,
            _reserved1: 0,
            _ist1: 0,
            _ist2: 0,
            _ist3: 0,
            _ist4: 0,
            _ist5: 0,
            _ist6: 0,
            _ist7: 0,
            _reserved2: 0,
            _reserved3: 0,
            io_map_base: 0,
        }
    }
}

struct GdtState {
    gdt: UnsafeCell<[u64; GDT_ENTRY_COUNT]>,
    tss: UnsafeCell<TaskStateSegment>,
}

impl GdtState {
    const fn new() -> Self {
        Self {
            gdt: UnsafeCell::new([0; GDT_ENTRY_COUNT]),
            tss: UnsafeCell::new(TaskStateSegment::new()),
        }
    }
}

// SAFETY:
// - `GdtState` is a singleton mutated only during boot sequencing and via
//   `set_kernel_rsp0` (a single aligned 64-bit store on a single-core CPU).
unsafe impl Sync for GdtState {}

static STATE: GdtState = GdtState::new();
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// 16-byte aligned backing storage for the double-fault IST stack.
#[repr(align(16))]
struct IstStack([u8; IST_STACK_SIZE]);

// SAFETY:
// - Single-core kernel: written only through the IST mechanism; the base
//   address is taken once during init.
static mut DOUBLE_FAULT_IST_STACK: IstStack = IstStack([0; IST_STACK_SIZE]);

extern "C" {
    // Assembly helper that loads GDTR, refreshes data segments, then loads TR.
    // SysV x86_64 ABI: rdi = gdt_ptr, rsi = data_selector, rdx = code_selector
    // (unused in the helper), rcx = tss_selector.
    fn gdt_flush_and_reload(
        gdt_ptr: *const DescriptorTablePointer,
        data_selector: u16,
        _code_selector: u16,
        tss_selector: u16,
    );
}

global_asm!(
    r#"
    .section .text
    .global gdt_flush_and_reload
    .type gdt_flush_and_reload, @function
gdt_flush_and_reload:
    # Load GDTR with the kernel-owned descriptor table pointer.
    lgdt [rdi]

    # Reload data-segment registers so they resolve against the new GDT.
    # Long mode ignores most segment bases, but the selectors must still
    # reference valid descriptors for privilege checks and stack semantics.
    mov ax, si
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    mov ss, ax

    # CS is not reloaded here; the long-mode code selector from boot remains
    # valid. Load TR so the CPU uses TSS.RSP0 for ring3->ring0 transitions.
    mov ax, cx
    ltr ax
    ret
"#,
);

#[inline]
const fn build_code_or_data_descriptor(access: u8, flags: u8) -> u64 {
    // Flat long-mode segments keep base=0 and limit=0:
    // - access byte      -> bits 47:40
    // - granularity byte -> bits 55:48 (upper nibble holds G/DB/L/AVL)
    ((access as u64) << 40) | (((flags as u64) & 0xF0) << 48)
}

#[inline]
const fn build_tss_descriptor(base: u64, limit: u32) -> (u64, u64) {
    // 64-bit TSS descriptor spans two GDT slots:
    // - low qword: limit, base[31:0], type/present, high limit bits
    // - high qword: base[63:32]
    let mut low = 0u64;
    low |= (limit as u64) & 0xFFFF;
    low |= (base & 0xFFFF) << 16;
    low |= ((base >> 16) & 0xFF) << 32;
    low |= ((ACCESS_PRESENT | ACCESS_TSS_AVAILABLE) as u64) << 40;
    low |= (((limit >> 16) as u8 & 0x0F) as u64) << 48;
    low |= ((base >> 24) & 0xFF) << 56;

    let mut high = 0u64;
    high |= (base >> 32) & 0xFFFF_FFFF;

    (low, high)
}

#[inline]
fn read_rsp() -> u64 {
    let rsp: u64;
    // SAFETY:
    // - Reading `rsp` into a general-purpose register is side-effect free.
    unsafe {
        asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack, preserves_flags));
    }
    rsp
}

/// Initializes and loads the kernel GDT/TSS.
///
/// Idempotent: can be called again to rebuild the same table.
pub fn init() {
    let current_rsp = read_rsp();

    // SAFETY:
    // - `STATE` is a process-wide singleton used during boot sequencing.
    // - A complete, valid descriptor table is built before it is loaded.
    // - `gdt_flush_and_reload` executes privileged instructions in ring 0.
    // - `DOUBLE_FAULT_IST_STACK` is static storage dedicated to IST1.
    unsafe {
        let gdt = &mut *STATE.gdt.get();
        let tss = &mut *STATE.tss.get();

        *gdt = [0; GDT_ENTRY_COUNT];
        *tss = TaskStateSegment::new();

        // Seed RSP0 with the currently executing kernel stack; the scheduler
        // overwrites this per selected user task.
        tss.rsp0 = current_rsp;

        // Route IST1 to the dedicated double-fault stack (top address).
        let ist1_base = core::ptr::addr_of!(DOUBLE_FAULT_IST_STACK.0) as u64;
        tss._ist1 = ist1_base + IST_STACK_SIZE as u64;

        // Disable the I/O permission bitmap by pointing past the TSS.
        tss.io_map_base = size_of::<TaskStateSegment>() as u16;

        gdt[KERNEL_CODE_INDEX as usize] = build_code_or_data_descriptor(
            ACCESS_PRESENT | ACCESS_SEGMENT | ACCESS_EXECUTABLE | ACCESS_RW,
            FLAGS_LONG_MODE,
        );
        gdt[KERNEL_DATA_INDEX as usize] =
            build_code_or_data_descriptor(ACCESS_PRESENT | ACCESS_SEGMENT | ACCESS_RW, 0);
        gdt[USER_CODE_INDEX as usize] = build_code_or_data_descriptor(
            ACCESS_PRESENT | ACCESS_RING3 | ACCESS_SEGMENT | ACCESS_EXECUTABLE | ACCESS_RW,
            FLAGS_LONG_MODE,
        );
        gdt[USER_DATA_INDEX as usize] = build_code_or_data_descriptor(
            ACCESS_PRESENT | ACCESS_RING3 | ACCESS_SEGMENT | ACCESS_RW,
            0,
        );

        let tss_base = tss as *const TaskStateSegment as u64;
        let tss_limit = (size_of::<TaskStateSegment>() - 1) as u32;
        let (tss_low, tss_high) = build_tss_descriptor(tss_base, tss_limit);
        gdt[TSS_INDEX as usize] = tss_low;
        gdt[TSS_INDEX as usize + 1] = tss_high;

        let ptr = DescriptorTablePointer {
            limit: (size_of::<u64>() * GDT_ENTRY_COUNT - 1) as u16,
            base: gdt.as_ptr() as u64,
        };

        gdt_flush_and_reload(
            &ptr,
            KERNEL_DATA_SELECTOR,
            KERNEL_CODE_SELECTOR,
            TSS_SELECTOR,
        );
    }

    INITIALIZED.store(true, Ordering::Release);
}

/// Returns whether GDT/TSS initialization has completed.
#[cfg_attr(not(test), allow(dead_code))]
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Updates `RSP0` in the loaded TSS for future ring-3 to ring-0 transitions.
pub fn set_kernel_rsp0(rsp0: u64) {
    // SAFETY:
    // - `STATE.tss` is the singleton active TSS for this CPU.
    // - A 64-bit aligned store is atomic on x86_64, which is sufficient here.
    unsafe {
        (*STATE.tss.get()).rsp0 = rsp0;
    }
}

/// Returns the current `RSP0` value stored in the TSS.
#[cfg_attr(not(test), allow(dead_code))]
pub fn kernel_rsp0() -> u64 {
    // SAFETY:
    // - Reading from the singleton TSS returns a plain value copy.
    unsafe { (*STATE.tss.get()).rsp0 }
}
