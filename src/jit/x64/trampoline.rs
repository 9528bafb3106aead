//! x86-64 trampoline
//!
//! Entered as `extern "C" fn(*mut TrampolineBlock)`. Saves the System V
//! callee-saved registers, pins the context registers from the block, calls
//! the entrypoint, then writes the exit pair back. Generated blocks leave
//! `r11` alone, so the block pointer survives the call in it.

use std::mem::offset_of;

use dynasm::dynasm;
use dynasmrt::x64::X64Relocation;
use dynasmrt::{DynasmApi, VecAssembler};

use crate::jit::{CodeBuffer, TrampolineBlock};

pub(super) fn generate_trampoline(code_buffer: &CodeBuffer) -> *const u8 {
    let mut asm = VecAssembler::<X64Relocation>::new(0);

    let register_state = offset_of!(TrampolineBlock, register_state) as i32;
    let memory_base = offset_of!(TrampolineBlock, memory_base) as i32;
    let permissions_base = offset_of!(TrampolineBlock, permissions_base) as i32;
    let block_base = offset_of!(TrampolineBlock, block_base) as i32;
    let code_base = offset_of!(TrampolineBlock, code_base) as i32;
    let entrypoint = offset_of!(TrampolineBlock, entrypoint) as i32;
    let exit_reason = offset_of!(TrampolineBlock, exit_reason) as i32;
    let exit_pc = offset_of!(TrampolineBlock, exit_pc) as i32;

    dynasm!(asm
        ; .arch x64
        ; push rbx
        ; push rbp
        ; push r12
        ; push r13
        ; push r14
        ; push r15

        ; mov r11, rdi
        ; mov rsi, [r11 + register_state]
        ; mov rdi, [r11 + memory_base]
        ; mov r8, [r11 + permissions_base]
        ; mov r9, [r11 + code_base]
        ; mov r10, [r11 + block_base]

        // Two slots keep the stack 16-byte aligned across the call.
        ; push r11
        ; push r11
        ; call QWORD [r11 + entrypoint]
        ; pop r11
        ; pop r11

        ; mov [r11 + exit_reason], rax
        ; mov [r11 + exit_pc], rbx

        ; pop r15
        ; pop r14
        ; pop r13
        ; pop r12
        ; pop rbp
        ; pop rbx
        ; ret
    );

    let code = asm.finalize().expect("assembling x86-64 trampoline failed");
    code_buffer.insert_standalone(&code)
}
