//! Trap and interrupt dispatch.
//!
//! One demultiplexer turns every raw vector number into either a registered
//! handler call or a fatal kernel panic:
//!
//! - vectors 0–31 are CPU exceptions.  Unhandled ones are fatal and carry a
//!   static exception name, a classified [`PanicCode`] and the full saved
//!   register snapshot.  The page-fault vector is special-cased: before the
//!   panic path runs, `(CR2, error code)` is forwarded to the VMM's fault
//!   handler, and a successful fix-up (demand mapping) suppresses the panic
//!   and resumes the faulting context.
//! - vectors 32–47 are hardware IRQs remapped from the PIC.  After the
//!   registered handler runs (or immediately if none is installed), an
//!   end-of-interrupt is sent — slave PIC first when the IRQ originated
//!   there, then always the master, as the 8259 cascade protocol requires.
//!
//! Handler registration is a plain array-slot set/clear: last writer wins,
//! no stacking.  The PIT programming lives here too since the timer tick is
//! just another registered IRQ handler from this layer's point of view.

use core::arch::asm;
use core::cell::UnsafeCell;
use core::mem::size_of;

use crate::arch::port::PortByte;
use crate::logging;

const IDT_ENTRIES: usize = 256;
const EXCEPTION_VECTOR_COUNT: usize = 32;
const IRQ_COUNT: usize = 16;

/// First vector the PIC master is remapped to.
pub const IRQ_BASE: u8 = 32;
/// PIT channel-0 tick, the scheduler's preemption trigger.
pub const IRQ0_TIMER_VECTOR: u8 = IRQ_BASE;

pub const EXCEPTION_DIVIDE_ERROR: u8 = 0;
pub const EXCEPTION_INVALID_OPCODE: u8 = 6;
pub const EXCEPTION_DEVICE_NOT_AVAILABLE: u8 = 7;
pub const EXCEPTION_DOUBLE_FAULT: u8 = 8;
pub const EXCEPTION_STACK_SEGMENT: u8 = 12;
pub const EXCEPTION_GENERAL_PROTECTION: u8 = 13;
pub const EXCEPTION_PAGE_FAULT: u8 = 14;
pub const EXCEPTION_MACHINE_CHECK: u8 = 18;

const IDT_PRESENT: u8 = 0x80;
const IDT_INTERRUPT_GATE: u8 = 0x0E;

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;
const PIC_EOI: u8 = 0x20;

const PIC_ICW1_INIT: u8 = 0x10;
const PIC_ICW1_ICW4: u8 = 0x01;
const PIC_ICW4_8086: u8 = 0x01;

const PIT_COMMAND: u16 = 0x43;
const PIT_CHANNEL0: u16 = 0x40;
const PIT_MODE_RATE_GENERATOR: u8 = 0x36;
const PIT_INPUT_HZ: u32 = 1_193_182;

/// Static human-readable names for CPU exception vectors 0–31.
const EXCEPTION_NAMES: [&str; EXCEPTION_VECTOR_COUNT] = [
    "Divide-by-Zero Error",
    "Debug",
    "Non-Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "Bound Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack-Segment Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "x87 Floating-Point Exception",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating-Point Exception",
    "Virtualization Exception",
    "Control Protection Exception",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Hypervisor Injection Exception",
    "VMM Communication Exception",
    "Security Exception",
    "Reserved",
];

/// Classified fatal-exception categories carried by the panic path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicCode {
    DivideByZero,
    InvalidOpcode,
    DoubleFault,
    StackOverflow,
    GeneralProtectionFault,
    PageFault,
    MachineCheck,
    Generic,
}

impl PanicCode {
    /// Classifies an exception vector into its panic category.
    pub const fn classify(vector: u8) -> Self {
        match vector {
            EXCEPTION_DIVIDE_ERROR => Self::DivideByZero,
            EXCEPTION_INVALID_OPCODE => Self::InvalidOpcode,
            EXCEPTION_DOUBLE_FAULT => Self::DoubleFault,
            EXCEPTION_STACK_SEGMENT => Self::StackOverflow,
            EXCEPTION_GENERAL_PROTECTION => Self::GeneralProtectionFault,
            EXCEPTION_PAGE_FAULT => Self::PageFault,
            EXCEPTION_MACHINE_CHECK => Self::MachineCheck,
            _ => Self::Generic,
        }
    }

    /// Stable identifier used in panic messages (and matched by death tests).
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DivideByZero => "PANIC_DIVIDE_BY_ZERO",
            Self::InvalidOpcode => "PANIC_INVALID_OPCODE",
            Self::DoubleFault => "PANIC_DOUBLE_FAULT",
            Self::StackOverflow => "PANIC_STACK_OVERFLOW",
            Self::GeneralProtectionFault => "PANIC_GENERAL_PROTECTION_FAULT",
            Self::PageFault => "PANIC_PAGE_FAULT",
            Self::MachineCheck => "PANIC_MACHINE_CHECK",
            Self::Generic => "PANIC_GENERIC",
        }
    }
}

/// Returns the static name for an exception vector.
pub const fn exception_name(vector: u8) -> &'static str {
    if (vector as usize) < EXCEPTION_VECTOR_COUNT {
        EXCEPTION_NAMES[vector as usize]
    } else {
        "Unknown"
    }
}

/// Saved general-purpose register state as pushed by the trap trampolines.
///
/// Layout contract:
/// - Must match the push/pop order in every stub in `trap_stubs.rs`.
/// - Any change requires synchronized updates in assembly and tests.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SavedRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}

/// Hardware interrupt return frame for `iretq` in 64-bit long mode.
///
/// Layout contract:
/// - In IA-32e mode `iretq` **unconditionally** pops all five values
///   (RIP, CS, RFLAGS, RSP, SS), regardless of privilege-level change.
/// - Must match the push order used by the CPU on interrupt entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InterruptStackFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

#[path = "trap_stubs.rs"]
mod trap_stubs;

extern "C" {
    fn exc_stub_0();
    fn exc_stub_1();
    fn exc_stub_2();
    fn exc_stub_3();
    fn exc_stub_4();
    fn exc_stub_5();
    fn exc_stub_6();
    fn exc_stub_7();
    fn exc_stub_8();
    fn exc_stub_9();
    fn exc_stub_10();
    fn exc_stub_11();
    fn exc_stub_12();
    fn exc_stub_13();
    fn exc_stub_14();
    fn exc_stub_15();
    fn exc_stub_16();
    fn exc_stub_17();
    fn exc_stub_18();
    fn exc_stub_19();
    fn exc_stub_20();
    fn exc_stub_21();
    fn exc_stub_22();
    fn exc_stub_23();
    fn exc_stub_24();
    fn exc_stub_25();
    fn exc_stub_26();
    fn exc_stub_27();
    fn exc_stub_28();
    fn exc_stub_29();
    fn exc_stub_30();
    fn exc_stub_31();
    fn irq_stub_0();
    fn irq_stub_1();
    fn irq_stub_2();
    fn irq_stub_3();
    fn irq_stub_4();
    fn irq_stub_5();
    fn irq_stub_6();
    fn irq_stub_7();
    fn irq_stub_8();
    fn irq_stub_9();
    fn irq_stub_10();
    fn irq_stub_11();
    fn irq_stub_12();
    fn irq_stub_13();
    fn irq_stub_14();
    fn irq_stub_15();
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    zero: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0,
            offset_mid: 0,
            offset_high: 0,
            zero: 0,
        }
    }

    fn set_handler(&mut self, handler: usize) {
        self.offset_low = handler as u16;
        self.selector = crate::arch::gdt::KERNEL_CODE_SELECTOR;
        self.ist = 0;
        self.type_attr = IDT_PRESENT | IDT_INTERRUPT_GATE;
        self.offset_mid = (handler >> 16) as u16;
        self.offset_high = (handler >> 32) as u32;
        self.zero = 0;
    }
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u64,
}

/// Contract every registered trap handler implements.
///
/// The handler receives the vector and the interrupted register frame and
/// returns the frame to resume — usually the same one, but the scheduler's
/// tick handler returns the frame of the task selected to run next.
pub type TrapHandler = fn(u8, &mut SavedRegisters) -> *mut SavedRegisters;

/// Holds the IDT and handler table behind `UnsafeCell` to avoid `static mut`
/// (which permits aliased `&mut` references and is unsound).
struct TrapState {
    idt: UnsafeCell<[IdtEntry; IDT_ENTRIES]>,
    handlers: UnsafeCell<[Option<TrapHandler>; IDT_ENTRIES]>,
}

impl TrapState {
    const fn new() -> Self {
        Self {
            idt: UnsafeCell::new([IdtEntry::missing(); IDT_ENTRIES]),
            handlers: UnsafeCell::new([None; IDT_ENTRIES]),
        }
    }
}

// SAFETY:
// - The kernel is single-core.  The IDT is written only during init() before
//   interrupts are enabled.  Handler slots are written with interrupts
//   disabled and read from dispatch in interrupt context; no concurrent
//   mutation is possible.
unsafe impl Sync for TrapState {}

static STATE: TrapState = TrapState::new();

/// Initializes the IDT and remaps/masks the PIC.
pub fn init() {
    disable();
    init_idt();
    remap_pic(IRQ_BASE, IRQ_BASE + 8);
    mask_pic();
    clear_handlers();
}

/// Enables interrupts globally.
pub fn enable() {
    // SAFETY:
    // - `sti` only toggles the IF flag; valid in ring 0.
    unsafe {
        asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// Disables interrupts globally.
pub fn disable() {
    // SAFETY:
    // - `cli` only toggles the IF flag; valid in ring 0.
    unsafe {
        asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Returns whether interrupts are currently enabled (IF flag set).
#[inline]
pub fn are_enabled() -> bool {
    let rflags: u64;
    // SAFETY:
    // - Reading RFLAGS via pushfq/pop does not modify machine state.
    unsafe {
        asm!(
            "pushfq",
            "pop {}",
            out(reg) rflags,
            options(nomem, preserves_flags)
        );
    }
    (rflags & (1 << 9)) != 0
}

/// Reads the faulting virtual address latched by the CPU on a page fault.
#[inline]
pub fn read_cr2() -> u64 {
    let val: u64;
    // SAFETY:
    // - Reading CR2 is privileged and valid in ring 0; no memory is touched.
    unsafe {
        asm!("mov {}, cr2", out(reg) val, options(nomem, nostack, preserves_flags));
    }
    val
}

fn init_idt() {
    let exception_stubs: [usize; EXCEPTION_VECTOR_COUNT] = [
        exc_stub_0 as *const () as usize,
        exc_stub_1 as *const () as usize,
        exc_stub_2 as *const () as usize,
        exc_stub_3 as *const () as usize,
        exc_stub_4 as *const () as usize,
        exc_stub_5 as *const () as usize,
        exc_stub_6 as *const () as usize,
        exc_stub_7 as *const () as usize,
        exc_stub_8 as *const () as usize,
        exc_stub_9 as *const () as usize,
        exc_stub_10 as *const () as usize,
        exc_stub_11 as *const () as usize,
        exc_stub_12 as *const () as usize,
        exc_stub_13 as *const () as usize,
        exc_stub_14 as *const () as usize,
        exc_stub_15 as *const () as usize,
        exc_stub_16 as *const () as usize,
        exc_stub_17 as *const () as usize,
        exc_stub_18 as *const () as usize,
        exc_stub_19 as *const () as usize,
        exc_stub_20 as *const () as usize,
        exc_stub_21 as *const () as usize,
        exc_stub_22 as *const () as usize,
        exc_stub_23 as *const () as usize,
        exc_stub_24 as *const () as usize,
        exc_stub_25 as *const () as usize,
        exc_stub_26 as *const () as usize,
        exc_stub_27 as *const () as usize,
        exc_stub_28 as *const () as usize,
        exc_stub_29 as *const () as usize,
        exc_stub_30 as *const () as usize,
        exc_stub_31 as *const () as usize,
    ];
    let irq_stubs: [usize; IRQ_COUNT] = [
        irq_stub_0 as *const () as usize,
        irq_stub_1 as *const () as usize,
        irq_stub_2 as *const () as usize,
        irq_stub_3 as *const () as usize,
        irq_stub_4 as *const () as usize,
        irq_stub_5 as *const () as usize,
        irq_stub_6 as *const () as usize,
        irq_stub_7 as *const () as usize,
        irq_stub_8 as *const () as usize,
        irq_stub_9 as *const () as usize,
        irq_stub_10 as *const () as usize,
        irq_stub_11 as *const () as usize,
        irq_stub_12 as *const () as usize,
        irq_stub_13 as *const () as usize,
        irq_stub_14 as *const () as usize,
        irq_stub_15 as *const () as usize,
    ];

    // SAFETY:
    // - Runs during init() with interrupts disabled; no dispatch can race.
    // - Every gate is pointed at a valid stub before `lidt` publishes the table.
    unsafe {
        let idt = &mut *STATE.idt.get();

        for (vector, stub) in exception_stubs.iter().enumerate() {
            idt[vector].set_handler(*stub);
        }
        for (irq, stub) in irq_stubs.iter().enumerate() {
            idt[IRQ_BASE as usize + irq].set_handler(*stub);
        }

        let idt_ptr = IdtPointer {
            limit: (size_of::<IdtEntry>() * IDT_ENTRIES - 1) as u16,
            base: STATE.idt.get() as u64,
        };

        asm!(
            "lidt [{}]",
            in(reg) &idt_ptr,
            options(readonly, nostack, preserves_flags)
        );
    }
}

/// Registers a callback for the given vector.  Last writer wins.
pub fn register_handler(vector: u8, handler: TrapHandler) {
    let were_enabled = are_enabled();
    disable();
    // SAFETY:
    // - Single-core kernel with interrupts disabled for the slot write; no
    //   dispatch can observe a torn update.
    unsafe {
        let handlers = &mut *STATE.handlers.get();
        handlers[vector as usize] = Some(handler);
    }
    if were_enabled {
        enable();
    }
}

/// Clears the handler slot for the given vector.
pub fn unregister_handler(vector: u8) {
    let were_enabled = are_enabled();
    disable();
    // SAFETY:
    // - Same serialization argument as `register_handler`.
    unsafe {
        let handlers = &mut *STATE.handlers.get();
        handlers[vector as usize] = None;
    }
    if were_enabled {
        enable();
    }
}

fn clear_handlers() {
    // SAFETY:
    // - Called from init() with interrupts disabled.
    unsafe {
        let handlers = &mut *STATE.handlers.get();
        for slot in handlers.iter_mut() {
            *slot = None;
        }
    }
}

#[inline]
fn registered_handler(vector: u8) -> Option<TrapHandler> {
    // SAFETY:
    // - Reading one `Option<fn>` slot; writers serialize via interrupt masking.
    unsafe {
        let handlers = &*STATE.handlers.get();
        handlers[vector as usize]
    }
}

/// Returns whether a CPU exception vector pushes an error code on entry.
pub const fn exception_has_error_code(vector: u8) -> bool {
    matches!(vector, 8 | 10 | 11 | 12 | 13 | 14 | 17 | 21 | 29 | 30)
}

/// Central trap demultiplexer.
///
/// Routes `vector` to its registered handler if one exists; otherwise CPU
/// exceptions escalate to a fatal panic (after giving the VMM first right of
/// refusal on page faults) and hardware IRQs are acknowledged and dropped.
///
/// Directly callable with a synthetic frame, which is how the dispatch
/// contracts are exercised in integration tests.
pub fn dispatch_trap(
    vector: u8,
    error_code: u64,
    frame: &mut SavedRegisters,
) -> *mut SavedRegisters {
    if let Some(handler) = registered_handler(vector) {
        let next_frame = handler(vector, frame);
        if (IRQ_BASE..IRQ_BASE + IRQ_COUNT as u8).contains(&vector) {
            end_of_interrupt(vector - IRQ_BASE);
        }
        return next_frame;
    }

    if vector < EXCEPTION_VECTOR_COUNT as u8 {
        if vector == EXCEPTION_PAGE_FAULT {
            return page_fault_entry(read_cr2(), error_code, frame);
        }
        fatal_exception(vector, error_code, frame);
    }

    // Unhandled hardware IRQ: acknowledge and drop silently.
    if (IRQ_BASE..IRQ_BASE + IRQ_COUNT as u8).contains(&vector) {
        end_of_interrupt(vector - IRQ_BASE);
    }
    frame as *mut SavedRegisters
}

/// Page-fault entry point (vector 14).
///
/// A handler registered for vector 14 takes full precedence.  Otherwise the
/// `(faulting address, raw error code)` pair is forwarded to the VMM fault
/// handler; if the VMM reports the fault fixed (e.g. a demand mapping was
/// established), the faulting context is resumed and the panic path is
/// suppressed.  Unfixable faults are fatal.
pub fn page_fault_entry(
    faulting_address: u64,
    error_code: u64,
    frame: &mut SavedRegisters,
) -> *mut SavedRegisters {
    if let Some(handler) = registered_handler(EXCEPTION_PAGE_FAULT) {
        return handler(EXCEPTION_PAGE_FAULT, frame);
    }

    if crate::memory::vmm::handle_page_fault(faulting_address, error_code) {
        return frame as *mut SavedRegisters;
    }

    logging::logln(
        "traps",
        format_args!(
            "unrecoverable page fault at {:#018x} err={:#x}",
            faulting_address, error_code
        ),
    );
    fatal_exception(EXCEPTION_PAGE_FAULT, error_code, frame);
}

/// Fatal sink for unhandled CPU exceptions.
///
/// Dumps the classified panic code, the static exception name and the full
/// register snapshot to serial, then panics.  The panic message carries the
/// code and name so death-test kernels can match the contract.
fn fatal_exception(vector: u8, error_code: u64, frame: &SavedRegisters) -> ! {
    let code = PanicCode::classify(vector);
    let name = exception_name(vector);

    logging::logln(
        "traps",
        format_args!(
            "FATAL EXCEPTION vec={} ({}) err={:#018x} code={}",
            vector,
            name,
            error_code,
            code.as_str()
        ),
    );
    logging::logln(
        "traps",
        format_args!(
            "rax={:#018x} rbx={:#018x} rcx={:#018x} rdx={:#018x}",
            frame.rax, frame.rbx, frame.rcx, frame.rdx
        ),
    );
    logging::logln(
        "traps",
        format_args!(
            "rsi={:#018x} rdi={:#018x} rbp={:#018x} r8 ={:#018x}",
            frame.rsi, frame.rdi, frame.rbp, frame.r8
        ),
    );
    logging::logln(
        "traps",
        format_args!(
            "r9 ={:#018x} r10={:#018x} r11={:#018x} r12={:#018x}",
            frame.r9, frame.r10, frame.r11, frame.r12
        ),
    );
    logging::logln(
        "traps",
        format_args!(
            "r13={:#018x} r14={:#018x} r15={:#018x}",
            frame.r13, frame.r14, frame.r15
        ),
    );

    panic!(
        "{}: unhandled exception vector {} ({}) err={:#x}",
        code.as_str(),
        vector,
        name,
        error_code
    );
}

/// Dispatch entry point called from the exception assembly trampolines.
///
/// # Safety
/// - Must be called with interrupts disabled (the stubs `cli` on entry).
/// - `frame` must point at the register save area on the active kernel stack
///   and remain valid until the stub restores registers and `iretq`s.
#[no_mangle]
pub unsafe extern "C" fn trap_rust_dispatch(
    vector: u8,
    error_code: u64,
    frame: *mut SavedRegisters,
) -> *mut SavedRegisters {
    let frame = unsafe {
        // SAFETY:
        // - The stubs pass a pointer into the live register-save area; it is
        //   exclusively owned by this dispatch until `iretq`.
        &mut *frame
    };

    dispatch_trap(vector, error_code, frame)
}

/// Dispatch entry point for the page-fault trampoline.
///
/// The stub passes CR2 explicitly because a nested fault between entry and
/// dispatch would clobber the register.
///
/// # Safety
/// - Must be entered only from `exc_stub_14`'s page-fault trampoline.
/// - `frame` must point to the saved-register frame on the active kernel stack.
#[no_mangle]
pub unsafe extern "C" fn page_fault_rust_dispatch(
    faulting_address: u64,
    error_code: u64,
    frame: *mut SavedRegisters,
) -> *mut SavedRegisters {
    let frame = unsafe {
        // SAFETY:
        // - Same contract as `trap_rust_dispatch`.
        &mut *frame
    };

    page_fault_entry(faulting_address, error_code, frame)
}

fn remap_pic(offset1: u8, offset2: u8) {
    // SAFETY:
    // - Standard 8259 initialization sequence; each write targets a PIC
    //   command/data port with settle delays in between.
    unsafe {
        let cmd1 = PortByte::new(PIC1_COMMAND);
        let cmd2 = PortByte::new(PIC2_COMMAND);
        let data1 = PortByte::new(PIC1_DATA);
        let data2 = PortByte::new(PIC2_DATA);

        let icw1 = PIC_ICW1_INIT | PIC_ICW1_ICW4;
        cmd1.write(icw1);
        io_wait();
        cmd2.write(icw1);
        io_wait();

        data1.write(offset1);
        io_wait();
        data2.write(offset2);
        io_wait();

        data1.write(0x04);
        io_wait();
        data2.write(0x02);
        io_wait();

        data1.write(PIC_ICW4_8086);
        io_wait();
        data2.write(PIC_ICW4_8086);
        io_wait();
    }
}

/// Small I/O delay via the POST diagnostic port (0x80).  Gives the PIC ~1 us
/// to settle between commands; necessary on real hardware, harmless in QEMU.
#[inline]
fn io_wait() {
    // SAFETY:
    // - Port 0x80 is the conventional scratch port for I/O delays.
    unsafe {
        PortByte::new(0x80).write(0);
    }
}

fn mask_pic() {
    // SAFETY:
    // - Writing the PIC data ports sets the interrupt mask registers.
    unsafe {
        let data1 = PortByte::new(PIC1_DATA);
        let data2 = PortByte::new(PIC2_DATA);

        data1.write(0xFE); // Unmask IRQ0 (timer) only.
        data2.write(0xFF); // Mask all slave IRQs.
    }
}

/// Sends the 8259 end-of-interrupt acknowledgment for `irq`.
///
/// Cascade ordering: the slave PIC is acknowledged first when the IRQ
/// originated there (`irq >= 8`), then the master is always acknowledged.
fn end_of_interrupt(irq: u8) {
    // SAFETY:
    // - EOI writes to the PIC command ports; ordering follows the 8259
    //   cascade protocol.
    unsafe {
        if irq >= 8 {
            PortByte::new(PIC2_COMMAND).write(PIC_EOI);
        }
        PortByte::new(PIC1_COMMAND).write(PIC_EOI);
    }
}

/// Computes the PIT divisor for the requested interrupt frequency.
///
/// Returns 0 for `hz == 0` so callers can decide how to handle invalid input.
pub const fn pit_divisor_for_hz(hz: u32) -> u16 {
    if hz == 0 {
        return 0;
    }

    let divisor = PIT_INPUT_HZ / hz;
    if divisor == 0 {
        1
    } else if divisor > u16::MAX as u32 {
        u16::MAX
    } else {
        divisor as u16
    }
}

/// Programs PIT channel 0 as a periodic timer with the given frequency.
pub fn init_periodic_timer(hz: u32) {
    let divisor = pit_divisor_for_hz(hz);
    if divisor == 0 {
        return;
    }

    // SAFETY:
    // - PIT command/data port writes program channel 0; callers control when
    //   the timer is (re)armed.
    unsafe {
        let cmd = PortByte::new(PIT_COMMAND);
        let data = PortByte::new(PIT_CHANNEL0);
        cmd.write(PIT_MODE_RATE_GENERATOR);
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }
}

const _: () = {
    assert!(size_of::<SavedRegisters>() == 15 * 8);
};

const _: () = {
    assert!(size_of::<InterruptStackFrame>() == 5 * 8);
};
