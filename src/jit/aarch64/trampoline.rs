//! AArch64 trampoline
//!
//! Entered as `extern "C" fn(*mut TrampolineBlock)`. Saves the callee-saved
//! register pairs, keeps the block pointer in x28 across the entrypoint
//! call (no generated code touches x28), pins the context registers and
//! stores the exit pair back afterwards.

use std::mem::offset_of;

use dynasm::dynasm;
use dynasmrt::aarch64::Aarch64Relocation;
use dynasmrt::{DynasmApi, VecAssembler};

use crate::jit::{CodeBuffer, TrampolineBlock};

use super::regs::*;

pub(super) fn generate_trampoline(code_buffer: &CodeBuffer) -> *const u8 {
    let mut asm = VecAssembler::<Aarch64Relocation>::new(0);

    let register_state = offset_of!(TrampolineBlock, register_state) as u32;
    let memory_base = offset_of!(TrampolineBlock, memory_base) as u32;
    let permissions_base = offset_of!(TrampolineBlock, permissions_base) as u32;
    let memory_size = offset_of!(TrampolineBlock, memory_size) as u32;
    let block_base = offset_of!(TrampolineBlock, block_base) as u32;
    let max_executable_pc = offset_of!(TrampolineBlock, max_executable_pc) as u32;
    let code_base = offset_of!(TrampolineBlock, code_base) as u32;
    let entrypoint = offset_of!(TrampolineBlock, entrypoint) as u32;
    let exit_reason = offset_of!(TrampolineBlock, exit_reason) as u32;
    let exit_pc = offset_of!(TrampolineBlock, exit_pc) as u32;

    dynasm!(asm
        ; .arch aarch64
        ; stp x29, x30, [sp, -16]!
        ; stp x19, x20, [sp, -16]!
        ; stp x21, x22, [sp, -16]!
        ; stp x23, x24, [sp, -16]!
        ; stp x25, x26, [sp, -16]!
        ; stp x27, x28, [sp, -16]!

        ; mov X(TRAMPOLINE_BLOCK), x0

        ; ldr X(REGISTER_STATE), [X(TRAMPOLINE_BLOCK), register_state]
        ; ldr X(MEMORY_BASE), [X(TRAMPOLINE_BLOCK), memory_base]
        ; ldr X(PERMISSIONS_BASE), [X(TRAMPOLINE_BLOCK), permissions_base]
        ; ldr X(MEMORY_SIZE), [X(TRAMPOLINE_BLOCK), memory_size]
        ; ldr X(BLOCK_BASE), [X(TRAMPOLINE_BLOCK), block_base]
        ; ldr X(MAX_EXECUTABLE_PC), [X(TRAMPOLINE_BLOCK), max_executable_pc]
        ; ldr X(CODE_BASE), [X(TRAMPOLINE_BLOCK), code_base]

        ; ldr x8, [X(TRAMPOLINE_BLOCK), entrypoint]
        ; blr x8

        ; str X(EXIT_REASON), [X(TRAMPOLINE_BLOCK), exit_reason]
        ; str X(EXIT_PC), [X(TRAMPOLINE_BLOCK), exit_pc]

        ; ldp x27, x28, [sp], 16
        ; ldp x25, x26, [sp], 16
        ; ldp x23, x24, [sp], 16
        ; ldp x21, x22, [sp], 16
        ; ldp x19, x20, [sp], 16
        ; ldp x29, x30, [sp], 16
        ; ret
    );

    let code = asm.finalize().expect("assembling aarch64 trampoline failed");
    code_buffer.insert_standalone(&code)
}
