//! Assembly entry trampolines for all trap vectors.
//!
//! Every stub saves the 15 general-purpose registers in the order matching
//! `SavedRegisters`, hands the frame to the Rust dispatcher, switches to the
//! frame the dispatcher returns, restores registers from it and `iretq`s.
//! Stubs for vectors that push a CPU error code drop it from the stack after
//! the register restore, right before `iretq`.
//!
//! The page-fault stub reads CR2 before calling out: a nested fault between
//! entry and dispatch would overwrite the register.

use core::arch::global_asm;

/// Number of general-purpose registers saved by every stub.
const STUB_SAVED_GPR_COUNT: usize = 15;

/// Stack byte offset from `rsp` to the CPU-pushed exception error code after
/// all general-purpose registers were pushed by the stub.
const STUB_ERROR_CODE_STACK_OFFSET: usize = STUB_SAVED_GPR_COUNT * core::mem::size_of::<u64>();

macro_rules! exception_stub_asm {
    ($name:ident, $vector:expr) => {
        global_asm!(
            concat!(
                ".section .text\n",
                ".global ",
                stringify!($name),
                "\n",
                ".type ",
                stringify!($name),
                ", @function\n",
                stringify!($name),
                ":\n",
                "    cli\n",
                "    push rax\n",
                "    push rcx\n",
                "    push rdx\n",
                "    push rbx\n",
                "    push rbp\n",
                "    push rsi\n",
                "    push rdi\n",
                "    push r8\n",
                "    push r9\n",
                "    push r10\n",
                "    push r11\n",
                "    push r12\n",
                "    push r13\n",
                "    push r14\n",
                "    push r15\n",
                "    mov edi, {vector}\n",
                "    xor esi, esi\n",
                "    mov rdx, rsp\n",
                "    and rsp, -16\n",
                "    call trap_rust_dispatch\n",
                "    mov rsp, rax\n",
                "    pop r15\n",
                "    pop r14\n",
                "    pop r13\n",
                "    pop r12\n",
                "    pop r11\n",
                "    pop r10\n",
                "    pop r9\n",
                "    pop r8\n",
                "    pop rdi\n",
                "    pop rsi\n",
                "    pop rbp\n",
                "    pop rbx\n",
                "    pop rdx\n",
                "    pop rcx\n",
                "    pop rax\n",
                "    iretq\n",
            ),
            vector = const $vector,
        );
    };
}

macro_rules! exception_stub_with_error_code_asm {
    ($name:ident, $vector:expr) => {
        global_asm!(
            concat!(
                ".section .text\n",
                ".global ",
                stringify!($name),
                "\n",
                ".type ",
                stringify!($name),
                ", @function\n",
                stringify!($name),
                ":\n",
                "    cli\n",
                "    push rax\n",
                "    push rcx\n",
                "    push rdx\n",
                "    push rbx\n",
                "    push rbp\n",
                "    push rsi\n",
                "    push rdi\n",
                "    push r8\n",
                "    push r9\n",
                "    push r10\n",
                "    push r11\n",
                "    push r12\n",
                "    push r13\n",
                "    push r14\n",
                "    push r15\n",
                "    mov edi, {vector}\n",
                "    mov rsi, [rsp + {error_code_stack_offset}]\n",
                "    mov rdx, rsp\n",
                "    and rsp, -16\n",
                "    call trap_rust_dispatch\n",
                "    mov rsp, rax\n",
                "    pop r15\n",
                "    pop r14\n",
                "    pop r13\n",
                "    pop r12\n",
                "    pop r11\n",
                "    pop r10\n",
                "    pop r9\n",
                "    pop r8\n",
                "    pop rdi\n",
                "    pop rsi\n",
                "    pop rbp\n",
                "    pop rbx\n",
                "    pop rdx\n",
                "    pop rcx\n",
                "    pop rax\n",
                "    add rsp, 8\n",
                "    iretq\n",
            ),
            vector = const $vector,
            error_code_stack_offset = const STUB_ERROR_CODE_STACK_OFFSET,
        );
    };
}

macro_rules! irq_stub_asm {
    ($name:ident, $vector:expr) => {
        global_asm!(
            concat!(
                ".section .text\n",
                ".global ",
                stringify!($name),
                "\n",
                ".type ",
                stringify!($name),
                ", @function\n",
                stringify!($name),
                ":\n",
                "    cli\n",
                "    push rax\n",
                "    push rcx\n",
                "    push rdx\n",
                "    push rbx\n",
                "    push rbp\n",
                "    push rsi\n",
                "    push rdi\n",
                "    push r8\n",
                "    push r9\n",
                "    push r10\n",
                "    push r11\n",
                "    push r12\n",
                "    push r13\n",
                "    push r14\n",
                "    push r15\n",
                "    mov edi, {vector}\n",
                "    xor esi, esi\n",
                "    mov rdx, rsp\n",
                "    and rsp, -16\n",
                "    call trap_rust_dispatch\n",
                "    mov rsp, rax\n",
                "    pop r15\n",
                "    pop r14\n",
                "    pop r13\n",
                "    pop r12\n",
                "    pop r11\n",
                "    pop r10\n",
                "    pop r9\n",
                "    pop r8\n",
                "    pop rdi\n",
                "    pop rsi\n",
                "    pop rbp\n",
                "    pop rbx\n",
                "    pop rdx\n",
                "    pop rcx\n",
                "    pop rax\n",
                "    iretq\n",
            ),
            vector = const $vector,
        );
    };
}

// CPU exceptions without an error code.
exception_stub_asm!(exc_stub_0, 0);
exception_stub_asm!(exc_stub_1, 1);
exception_stub_asm!(exc_stub_2, 2);
exception_stub_asm!(exc_stub_3, 3);
exception_stub_asm!(exc_stub_4, 4);
exception_stub_asm!(exc_stub_5, 5);
exception_stub_asm!(exc_stub_6, 6);
exception_stub_asm!(exc_stub_7, 7);
exception_stub_asm!(exc_stub_9, 9);
exception_stub_asm!(exc_stub_15, 15);
exception_stub_asm!(exc_stub_16, 16);
exception_stub_asm!(exc_stub_18, 18);
exception_stub_asm!(exc_stub_19, 19);
exception_stub_asm!(exc_stub_20, 20);
exception_stub_asm!(exc_stub_22, 22);
exception_stub_asm!(exc_stub_23, 23);
exception_stub_asm!(exc_stub_24, 24);
exception_stub_asm!(exc_stub_25, 25);
exception_stub_asm!(exc_stub_26, 26);
exception_stub_asm!(exc_stub_27, 27);
exception_stub_asm!(exc_stub_28, 28);
exception_stub_asm!(exc_stub_31, 31);

// CPU exceptions that push an error code.
exception_stub_with_error_code_asm!(exc_stub_8, 8);
exception_stub_with_error_code_asm!(exc_stub_10, 10);
exception_stub_with_error_code_asm!(exc_stub_11, 11);
exception_stub_with_error_code_asm!(exc_stub_12, 12);
exception_stub_with_error_code_asm!(exc_stub_13, 13);
exception_stub_with_error_code_asm!(exc_stub_17, 17);
exception_stub_with_error_code_asm!(exc_stub_21, 21);
exception_stub_with_error_code_asm!(exc_stub_29, 29);
exception_stub_with_error_code_asm!(exc_stub_30, 30);

// Page fault (vector 14): carries an error code and additionally latches the
// faulting address in CR2.  CR2 is read here, before any Rust code runs,
// because a nested fault would overwrite it.
global_asm!(
    r#"
    .section .text
    .global exc_stub_14
    .type exc_stub_14, @function
exc_stub_14:
    cli
    push rax
    push rcx
    push rdx
    push rbx
    push rbp
    push rsi
    push rdi
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15

    mov rdi, cr2
    mov rsi, [rsp + {error_code_stack_offset}]
    mov rdx, rsp
    and rsp, -16
    call page_fault_rust_dispatch
    mov rsp, rax

    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rbp
    pop rbx
    pop rdx
    pop rcx
    pop rax
    add rsp, 8
    iretq
"#,
    error_code_stack_offset = const STUB_ERROR_CODE_STACK_OFFSET,
);

// Hardware IRQ lines 0-15 remapped to vectors 32-47.
irq_stub_asm!(irq_stub_0, 32);
irq_stub_asm!(irq_stub_1, 33);
irq_stub_asm!(irq_stub_2, 34);
irq_stub_asm!(irq_stub_3, 35);
irq_stub_asm!(irq_stub_4, 36);
irq_stub_asm!(irq_stub_5, 37);
irq_stub_asm!(irq_stub_6, 38);
irq_stub_asm!(irq_stub_7, 39);
irq_stub_asm!(irq_stub_8, 40);
irq_stub_asm!(irq_stub_9, 41);
irq_stub_asm!(irq_stub_10, 42);
irq_stub_asm!(irq_stub_11, 43);
irq_stub_asm!(irq_stub_12, 44);
irq_stub_asm!(irq_stub_13, 45);
irq_stub_asm!(irq_stub_14, 46);
irq_stub_asm!(irq_stub_15, 47);
