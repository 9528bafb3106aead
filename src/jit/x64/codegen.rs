//! x86-64 block compiler
//!
//! Emits System V x86-64 code for one guest basic block. Guest registers
//! are addressed directly in the in-memory register file through
//! `[register_state + 8 * reg]` operands; `rax`/`rbx`/`rcx` are scratch and
//! `rdx` is reserved for division. Exits that are unlikely at runtime are
//! routed to pending-exit pads after the block body so the straight-line
//! path stays dense.

use dynasm::dynasm;
use dynasmrt::x64::X64Relocation;
use dynasmrt::{DynamicLabel, DynasmApi, DynasmLabelApi, VecAssembler};

use crate::cpu::decode::{Inst, InstKind};
use crate::cpu::Register;
use crate::jit::{memory_access_size_log2, ArchExitReason, CodeBuffer, CodeBufferFlags};
use crate::memory::{Memory, MemoryFlags};

type Asm = VecAssembler<X64Relocation>;

// Pinned context registers (loaded by the trampoline):
//   rsi = register state, rdi = memory base, r8 = permissions base,
//   r9 = code base, r10 = block translation table.
// memory_size and max_block_count are baked in as immediates.

/// PC reported by a pending exit: a constant, or the dynamic branch target
/// left in `rax`.
#[derive(Debug, Clone, Copy)]
enum ExitPc {
    Value(u64),
    Rax,
}

struct PendingExit {
    label: DynamicLabel,
    reason: ArchExitReason,
    pc: ExitPc,
}

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RSI: u8 = 6;

struct BlockCompiler<'a> {
    asm: Asm,
    memory: &'a Memory,
    code_buffer: &'a CodeBuffer,
    single_step: bool,
    pending_exits: Vec<PendingExit>,
    current_pc: u64,
}

#[inline]
fn reg_offset(reg: Register) -> i32 {
    (reg.index() * 8) as i32
}

#[inline]
fn fits_i32(value: i64) -> bool {
    value >= i32::MIN as i64 && value <= i32::MAX as i64
}

impl BlockCompiler<'_> {
    fn skip_permission_checks(&self) -> bool {
        self.code_buffer
            .flags()
            .contains(CodeBufferFlags::SKIP_PERMISSION_CHECKS)
    }

    /// target <- guest reg + offset; the zero register reads as 0.
    fn load_register(&mut self, target: u8, reg: Register, offset: i64) {
        let asm = &mut self.asm;
        debug_assert!(fits_i32(offset));
        let offset = offset as i32;

        if reg == Register::Zero {
            dynasm!(asm ; .arch x64 ; mov Rq(target), offset);
            return;
        }

        let slot = reg_offset(reg);
        dynasm!(asm ; .arch x64 ; mov Rq(target), [Rq(RSI) + slot]);
        if offset != 0 {
            dynasm!(asm ; .arch x64 ; add Rq(target), offset);
        }
    }

    /// Guest reg slot <- src, optionally sign-extending a 32-bit result.
    fn store_register(&mut self, reg: Register, src: u8, sign_extend32: bool) {
        if reg == Register::Zero {
            return;
        }

        let asm = &mut self.asm;
        if sign_extend32 {
            dynasm!(asm ; .arch x64 ; movsxd Rq(src), Rd(src));
        }
        let slot = reg_offset(reg);
        dynasm!(asm ; .arch x64 ; mov [Rq(RSI) + slot], Rq(src));
    }

    fn store_imm_to_register(&mut self, reg: Register, scratch: u8, imm: i64) {
        if reg == Register::Zero {
            return;
        }

        let asm = &mut self.asm;
        let slot = reg_offset(reg);
        if fits_i32(imm) {
            let imm = imm as i32;
            dynasm!(asm ; .arch x64 ; mov QWORD [Rq(RSI) + slot], imm);
        } else {
            dynasm!(asm
                ; .arch x64
                ; mov Rq(scratch), QWORD imm
                ; mov [Rq(RSI) + slot], Rq(scratch)
            );
        }
    }

    fn store_uimm_to_register(&mut self, reg: Register, scratch: u8, imm: u64) {
        self.store_imm_to_register(reg, scratch, imm as i64);
    }

    /// Exit on the hot path: exit_pc in rbx, exit_reason in rax, return to
    /// the trampoline. The PC goes first since it may currently be in rax.
    fn generate_exit(&mut self, reason: ArchExitReason, pc: ExitPc) {
        let reason_imm = reason as u64 as i32;
        let asm = &mut self.asm;
        match pc {
            ExitPc::Value(value) => {
                let value = value as i64;
                dynasm!(asm ; .arch x64 ; mov rbx, QWORD value);
            }
            ExitPc::Rax => dynasm!(asm ; .arch x64 ; mov rbx, rax),
        }
        dynasm!(asm
            ; .arch x64
            ; mov eax, reason_imm
            ; ret
        );
    }

    fn add_pending_exit(&mut self, label: DynamicLabel, reason: ArchExitReason, pc: ExitPc) {
        self.pending_exits.push(PendingExit { label, reason, pc });
    }

    fn generate_pending_exits(&mut self) {
        for exit in std::mem::take(&mut self.pending_exits) {
            let asm = &mut self.asm;
            dynasm!(asm ; .arch x64 ; =>exit.label);
            self.generate_exit(exit.reason, exit.pc);
        }
    }

    /// Alignment, bounds and permission checks for an access whose address
    /// is in rax. Clobbers rbx and rcx. Check failures branch to a pending
    /// exit pad carrying the current PC.
    fn generate_validate_memory_access(&mut self, access_size_log2: u32, write: bool) {
        let skip_permission_checks = self.skip_permission_checks();
        let fault = self.asm.new_dynamic_label();
        let asm = &mut self.asm;

        // An unaligned access could straddle the end of memory, so the
        // bounds check below is only exact for aligned addresses.
        if access_size_log2 > 0 {
            let alignment_mask = (1i32 << access_size_log2) - 1;
            dynasm!(asm
                ; .arch x64
                ; test rax, alignment_mask
                ; jnz =>fault
            );
        }

        let memory_size = self.memory.size();
        if memory_size <= i32::MAX as u64 {
            let memory_size = memory_size as i32;
            dynasm!(asm ; .arch x64 ; cmp rax, memory_size);
        } else {
            let memory_size = memory_size as i64;
            dynasm!(asm
                ; .arch x64
                ; mov rcx, QWORD memory_size
                ; cmp rax, rcx
            );
        }
        dynasm!(asm ; .arch x64 ; jae =>fault);

        if !skip_permission_checks {
            match access_size_log2 {
                0 => dynasm!(asm ; .arch x64 ; movzx ebx, BYTE [r8 + rax]),
                1 => dynasm!(asm ; .arch x64 ; movzx ebx, WORD [r8 + rax]),
                2 => dynasm!(asm ; .arch x64 ; mov ebx, DWORD [r8 + rax]),
                3 => dynasm!(asm ; .arch x64 ; mov rbx, QWORD [r8 + rax]),
                _ => unreachable!(),
            }

            let flag = if write {
                MemoryFlags::WRITE
            } else {
                MemoryFlags::READ
            }
            .bits() as u64;

            let mut mask = 0u64;
            for i in 0..(1 << access_size_log2) {
                mask |= flag << (i * 8);
            }

            if access_size_log2 == 3 {
                let mask = mask as i64;
                dynasm!(asm
                    ; .arch x64
                    ; mov rcx, QWORD mask
                    ; and rbx, rcx
                    ; cmp rbx, rcx
                );
            } else {
                let mask = mask as i32;
                dynasm!(asm
                    ; .arch x64
                    ; and ebx, mask
                    ; cmp ebx, mask
                );
            }
            dynasm!(asm ; .arch x64 ; jne =>fault);
        }

        let reason = if write {
            ArchExitReason::MemoryWriteFault
        } else {
            ArchExitReason::MemoryReadFault
        };
        self.add_pending_exit(fault, reason, ExitPc::Value(self.current_pc));
    }

    /// Inline translation-table lookup with the block index in `index`, and
    /// a tail-call into the target block on hit. Returns the miss label.
    /// x86's strong load ordering makes the plain load an acquire, so the
    /// multithreaded configuration emits the same code.
    fn generate_validated_branch(&mut self, index: u8) -> DynamicLabel {
        let miss = self.asm.new_dynamic_label();
        let asm = &mut self.asm;

        dynasm!(asm
            ; .arch x64
            ; mov Rd(index), [r10 + Rq(index) * 4]
            ; test Rd(index), Rd(index)
            ; jz =>miss
            ; add Rq(index), r9
            ; jmp Rq(index)
        );

        miss
    }

    fn generate_static_branch(&mut self, target_pc: u64) {
        let block = target_pc / 4;

        // Some error conditions are known at compile time.
        if target_pc & 3 != 0 {
            return self.generate_exit(ArchExitReason::UnalignedPc, ExitPc::Value(target_pc));
        }
        if block >= self.code_buffer.max_block_count() as u64 {
            return self.generate_exit(ArchExitReason::OutOfBoundsPc, ExitPc::Value(target_pc));
        }

        if self.single_step {
            // Exit so that a branch and its target never run as one step.
            return self.generate_exit(ArchExitReason::SingleStep, ExitPc::Value(target_pc));
        }

        {
            let block = block as i64;
            let asm = &mut self.asm;
            dynasm!(asm ; .arch x64 ; mov rax, QWORD block);
        }
        let miss = self.generate_validated_branch(RAX);
        self.add_pending_exit(miss, ArchExitReason::BlockNotGenerated, ExitPc::Value(target_pc));
    }

    /// Dynamic branch with the raw target in rax. Masks bit 0, validates
    /// alignment and the executable bound, then performs the inline lookup.
    /// rax still holds the masked target at every pending pad.
    fn generate_dynamic_branch(&mut self) {
        let unaligned = self.asm.new_dynamic_label();
        let oob = self.asm.new_dynamic_label();

        {
            let asm = &mut self.asm;
            dynasm!(asm
                ; .arch x64
                ; and rax, -2
                ; test rax, 3
                ; jnz =>unaligned
                ; mov rbx, rax
                ; shr rbx, 2
            );

            let max_blocks = self.code_buffer.max_block_count() as u64;
            if max_blocks <= i32::MAX as u64 {
                let max_blocks = max_blocks as i32;
                dynasm!(asm ; .arch x64 ; cmp rbx, max_blocks);
            } else {
                let max_blocks = max_blocks as i64;
                dynasm!(asm
                    ; .arch x64
                    ; mov rcx, QWORD max_blocks
                    ; cmp rbx, rcx
                );
            }
            dynasm!(asm ; .arch x64 ; jae =>oob);
        }

        if self.single_step {
            self.generate_exit(ArchExitReason::SingleStep, ExitPc::Rax);
        } else {
            let miss = self.generate_validated_branch(RBX);
            self.add_pending_exit(miss, ArchExitReason::BlockNotGenerated, ExitPc::Rax);
        }

        self.add_pending_exit(unaligned, ArchExitReason::UnalignedPc, ExitPc::Rax);
        self.add_pending_exit(oob, ArchExitReason::OutOfBoundsPc, ExitPc::Rax);
    }

    fn generate_alu_imm(&mut self, inst: &Inst) {
        use InstKind as K;

        let imm = inst.imm;
        let shamt = inst.shamt as i8;
        let is_32bit = matches!(inst.kind, K::Addiw | K::Slliw | K::Srliw | K::Sraiw);

        // Pseudo-instruction fast paths.
        if inst.kind == K::Addi && inst.rs1 == Register::Zero {
            return self.store_imm_to_register(inst.rd, RAX, imm); // li
        }
        if inst.kind == K::Addi && imm == 0 {
            self.load_register(RAX, inst.rs1, 0); // mv
            return self.store_register(inst.rd, RAX, false);
        }
        if inst.kind == K::Addiw && imm == 0 {
            // sext.w
            let src = inst.rs1;
            let asm = &mut self.asm;
            if src == Register::Zero {
                dynasm!(asm ; .arch x64 ; xor eax, eax);
            } else {
                let slot = reg_offset(src);
                dynasm!(asm ; .arch x64 ; movsxd rax, DWORD [Rq(RSI) + slot]);
            }
            return self.store_register(inst.rd, RAX, false);
        }

        let imm32 = imm as i32;

        // 64-bit ops with rd == rs1 can work on the register slot in place.
        if !is_32bit && inst.rd == inst.rs1 && inst.rd != Register::Zero {
            let off = reg_offset(inst.rd);
            let asm = &mut self.asm;
            match inst.kind {
                K::Addi => dynasm!(asm ; .arch x64 ; add QWORD [Rq(RSI) + off], imm32),
                K::Xori => dynasm!(asm ; .arch x64 ; xor QWORD [Rq(RSI) + off], imm32),
                K::Ori => dynasm!(asm ; .arch x64 ; or QWORD [Rq(RSI) + off], imm32),
                K::Andi => dynasm!(asm ; .arch x64 ; and QWORD [Rq(RSI) + off], imm32),
                K::Slli => dynasm!(asm ; .arch x64 ; shl QWORD [Rq(RSI) + off], shamt),
                K::Srli => dynasm!(asm ; .arch x64 ; shr QWORD [Rq(RSI) + off], shamt),
                K::Srai => dynasm!(asm ; .arch x64 ; sar QWORD [Rq(RSI) + off], shamt),
                _ => unreachable!(),
            }
            return;
        }

        self.load_register(RAX, inst.rs1, 0);
        {
            let asm = &mut self.asm;
            match inst.kind {
                K::Addi | K::Addiw => dynasm!(asm ; .arch x64 ; add rax, imm32),
                K::Xori => dynasm!(asm ; .arch x64 ; xor rax, imm32),
                K::Ori => dynasm!(asm ; .arch x64 ; or rax, imm32),
                K::Andi => dynasm!(asm ; .arch x64 ; and rax, imm32),
                K::Slli => dynasm!(asm ; .arch x64 ; shl rax, shamt),
                K::Srli => dynasm!(asm ; .arch x64 ; shr rax, shamt),
                K::Srai => dynasm!(asm ; .arch x64 ; sar rax, shamt),
                K::Slliw => dynasm!(asm ; .arch x64 ; shl eax, shamt),
                K::Srliw => dynasm!(asm ; .arch x64 ; shr eax, shamt),
                K::Sraiw => dynasm!(asm ; .arch x64 ; sar eax, shamt),
                _ => unreachable!(),
            }
        }
        self.store_register(inst.rd, RAX, is_32bit);
    }

    fn generate_alu_reg(&mut self, inst: &Inst) {
        use InstKind as K;

        let is_32bit = matches!(inst.kind, K::Addw | K::Subw | K::Sllw | K::Srlw | K::Sraw);
        let is_shift = matches!(
            inst.kind,
            K::Sll | K::Srl | K::Sra | K::Sllw | K::Srlw | K::Sraw
        );

        self.load_register(RAX, inst.rs1, 0);
        if is_shift {
            self.load_register(RCX, inst.rs2, 0);
            let asm = &mut self.asm;
            // The hardware masks cl by the operand width, which is exactly
            // the RISC-V shift-amount rule.
            match inst.kind {
                K::Sll => dynasm!(asm ; .arch x64 ; shl rax, cl),
                K::Srl => dynasm!(asm ; .arch x64 ; shr rax, cl),
                K::Sra => dynasm!(asm ; .arch x64 ; sar rax, cl),
                K::Sllw => dynasm!(asm ; .arch x64 ; shl eax, cl),
                K::Srlw => dynasm!(asm ; .arch x64 ; shr eax, cl),
                K::Sraw => dynasm!(asm ; .arch x64 ; sar eax, cl),
                _ => unreachable!(),
            }
        } else if inst.rs2 == Register::Zero {
            let asm = &mut self.asm;
            match inst.kind {
                K::Add | K::Addw => dynasm!(asm ; .arch x64 ; add rax, 0),
                K::Sub | K::Subw => dynasm!(asm ; .arch x64 ; sub rax, 0),
                K::Xor => dynasm!(asm ; .arch x64 ; xor rax, 0),
                K::Or => dynasm!(asm ; .arch x64 ; or rax, 0),
                K::And => dynasm!(asm ; .arch x64 ; and rax, 0),
                _ => unreachable!(),
            }
        } else {
            let off = reg_offset(inst.rs2);
            let asm = &mut self.asm;
            match inst.kind {
                K::Add => dynasm!(asm ; .arch x64 ; add rax, [Rq(RSI) + off]),
                K::Sub => dynasm!(asm ; .arch x64 ; sub rax, [Rq(RSI) + off]),
                K::Xor => dynasm!(asm ; .arch x64 ; xor rax, [Rq(RSI) + off]),
                K::Or => dynasm!(asm ; .arch x64 ; or rax, [Rq(RSI) + off]),
                K::And => dynasm!(asm ; .arch x64 ; and rax, [Rq(RSI) + off]),
                K::Addw => dynasm!(asm ; .arch x64 ; add eax, [Rq(RSI) + off]),
                K::Subw => dynasm!(asm ; .arch x64 ; sub eax, [Rq(RSI) + off]),
                _ => unreachable!(),
            }
        }
        self.store_register(inst.rd, RAX, is_32bit);
    }

    fn generate_set_less_than(&mut self, inst: &Inst) {
        use InstKind as K;

        let has_imm = matches!(inst.kind, K::Slti | K::Sltiu);
        let is_unsigned = matches!(inst.kind, K::Sltu | K::Sltiu);

        if has_imm && inst.rs1 == Register::Zero {
            // Constant-foldable: 0 compared against the immediate.
            let result = if is_unsigned {
                0u64 < inst.imm as u64
            } else {
                0i64 < inst.imm
            };
            return self.store_uimm_to_register(inst.rd, RAX, result as u64);
        }

        {
            let asm = &mut self.asm;
            dynasm!(asm ; .arch x64 ; xor eax, eax);
        }

        if has_imm {
            let off = reg_offset(inst.rs1);
            let imm = inst.imm as i32;
            let asm = &mut self.asm;
            dynasm!(asm ; .arch x64 ; cmp QWORD [Rq(RSI) + off], imm);
        } else {
            self.load_register(RBX, inst.rs1, 0);
            let asm = &mut self.asm;
            if inst.rs2 == Register::Zero {
                dynasm!(asm ; .arch x64 ; cmp rbx, 0);
            } else {
                let off = reg_offset(inst.rs2);
                dynasm!(asm ; .arch x64 ; cmp rbx, [Rq(RSI) + off]);
            }
        }

        {
            let asm = &mut self.asm;
            if is_unsigned {
                dynasm!(asm ; .arch x64 ; setb al);
            } else {
                dynasm!(asm ; .arch x64 ; setl al);
            }
        }
        self.store_register(inst.rd, RAX, false);
    }

    fn generate_division(&mut self, inst: &Inst) {
        use InstKind as K;

        let is_32bit = matches!(inst.kind, K::Divw | K::Divuw | K::Remw | K::Remuw);
        let is_unsigned = matches!(inst.kind, K::Divu | K::Divuw | K::Remu | K::Remuw);
        let is_remainder = matches!(inst.kind, K::Rem | K::Remu | K::Remw | K::Remuw);

        self.load_register(RAX, inst.rs1, 0);
        self.load_register(RBX, inst.rs2, 0);

        let done = self.asm.new_dynamic_label();
        let do_div = self.asm.new_dynamic_label();
        let div_zero = self.asm.new_dynamic_label();

        let asm = &mut self.asm;

        if is_32bit {
            dynasm!(asm ; .arch x64 ; test ebx, ebx ; jz =>div_zero);
        } else {
            dynasm!(asm ; .arch x64 ; test rbx, rbx ; jz =>div_zero);
        }

        if !is_unsigned {
            // INT_MIN / -1 overflows the host idiv; the architectural
            // result is quotient INT_MIN, remainder 0.
            if is_32bit {
                let int_min = i32::MIN;
                dynasm!(asm
                    ; .arch x64
                    ; cmp ebx, -1
                    ; jne =>do_div
                    ; cmp eax, int_min
                    ; jne =>do_div
                );
            } else {
                let int_min = i64::MIN;
                dynasm!(asm
                    ; .arch x64
                    ; cmp rbx, -1
                    ; jne =>do_div
                    ; mov rcx, QWORD int_min
                    ; cmp rax, rcx
                    ; jne =>do_div
                );
            }
            dynasm!(asm ; .arch x64 ; xor edx, edx ; jmp =>done);
        }

        dynasm!(asm ; .arch x64 ; =>do_div);
        match (is_32bit, is_unsigned) {
            (false, false) => dynasm!(asm ; .arch x64 ; cqo ; idiv rbx),
            (false, true) => dynasm!(asm ; .arch x64 ; xor edx, edx ; div rbx),
            (true, false) => dynasm!(asm ; .arch x64 ; cdq ; idiv ebx),
            (true, true) => dynasm!(asm ; .arch x64 ; xor edx, edx ; div ebx),
        }
        dynasm!(asm ; .arch x64 ; jmp =>done);

        // Division by zero: all-ones quotient, dividend as remainder.
        dynasm!(asm
            ; .arch x64
            ; =>div_zero
            ; mov rdx, rax
            ; mov rax, -1
            ; =>done
        );

        let result = if is_remainder { RDX } else { RAX };
        self.store_register(inst.rd, result, is_32bit);
    }

    /// Emit one instruction; false terminates the block.
    fn generate_instruction(&mut self, inst: &Inst) -> bool {
        use InstKind as K;

        match inst.kind {
            K::Lui => {
                self.store_imm_to_register(inst.rd, RAX, inst.imm);
            }

            K::Auipc => {
                let value = self.current_pc.wrapping_add(inst.imm as u64);
                self.store_uimm_to_register(inst.rd, RAX, value);
            }

            K::Jal => {
                let link = self.current_pc.wrapping_add(4);
                self.store_uimm_to_register(inst.rd, RAX, link);

                let target = self.current_pc.wrapping_add(inst.imm as u64);
                self.generate_static_branch(target);

                return false;
            }

            K::Jalr => {
                // Resolve the target before the link write so rd == rs1
                // still reads the old value.
                self.load_register(RAX, inst.rs1, inst.imm);
                let link = self.current_pc.wrapping_add(4);
                self.store_uimm_to_register(inst.rd, RBX, link);

                self.generate_dynamic_branch();

                return false;
            }

            K::Beq | K::Bne | K::Blt | K::Bge | K::Bltu | K::Bgeu => {
                self.load_register(RAX, inst.rs1, 0);

                let fallthrough = self.asm.new_dynamic_label();
                {
                    let asm = &mut self.asm;
                    if inst.rs2 == Register::Zero {
                        dynasm!(asm ; .arch x64 ; cmp rax, 0);
                    } else {
                        let off = reg_offset(inst.rs2);
                        dynasm!(asm ; .arch x64 ; cmp rax, [Rq(RSI) + off]);
                    }

                    // Inverted condition skips over the taken path.
                    match inst.kind {
                        K::Beq => dynasm!(asm ; .arch x64 ; jne =>fallthrough),
                        K::Bne => dynasm!(asm ; .arch x64 ; je =>fallthrough),
                        K::Blt => dynasm!(asm ; .arch x64 ; jge =>fallthrough),
                        K::Bge => dynasm!(asm ; .arch x64 ; jl =>fallthrough),
                        K::Bltu => dynasm!(asm ; .arch x64 ; jae =>fallthrough),
                        K::Bgeu => dynasm!(asm ; .arch x64 ; jb =>fallthrough),
                        _ => unreachable!(),
                    }
                }

                let target = self.current_pc.wrapping_add(inst.imm as u64);
                self.generate_static_branch(target);

                let asm = &mut self.asm;
                dynasm!(asm ; .arch x64 ; =>fallthrough);
            }

            K::Lb | K::Lh | K::Lw | K::Ld | K::Lbu | K::Lhu | K::Lwu => {
                // A load to x0 still faults like any other load; only the
                // register write-back is elided.
                self.load_register(RAX, inst.rs1, inst.imm);
                self.generate_validate_memory_access(memory_access_size_log2(inst.kind), false);

                if inst.rd != Register::Zero {
                    {
                        let asm = &mut self.asm;
                        match inst.kind {
                            K::Lb => dynasm!(asm ; .arch x64 ; movsx rbx, BYTE [rdi + rax]),
                            K::Lh => dynasm!(asm ; .arch x64 ; movsx rbx, WORD [rdi + rax]),
                            K::Lw => dynasm!(asm ; .arch x64 ; movsxd rbx, DWORD [rdi + rax]),
                            K::Ld => dynasm!(asm ; .arch x64 ; mov rbx, QWORD [rdi + rax]),
                            K::Lbu => dynasm!(asm ; .arch x64 ; movzx ebx, BYTE [rdi + rax]),
                            K::Lhu => dynasm!(asm ; .arch x64 ; movzx ebx, WORD [rdi + rax]),
                            K::Lwu => dynasm!(asm ; .arch x64 ; mov ebx, DWORD [rdi + rax]),
                            _ => unreachable!(),
                        }
                    }

                    self.store_register(inst.rd, RBX, false);
                }
            }

            K::Sb | K::Sh | K::Sw | K::Sd => {
                self.load_register(RAX, inst.rs1, inst.imm);
                self.generate_validate_memory_access(memory_access_size_log2(inst.kind), true);

                self.load_register(RBX, inst.rs2, 0);

                let asm = &mut self.asm;
                match inst.kind {
                    K::Sb => dynasm!(asm ; .arch x64 ; mov [rdi + rax], bl),
                    K::Sh => dynasm!(asm ; .arch x64 ; mov [rdi + rax], bx),
                    K::Sw => dynasm!(asm ; .arch x64 ; mov [rdi + rax], ebx),
                    K::Sd => dynasm!(asm ; .arch x64 ; mov [rdi + rax], rbx),
                    _ => unreachable!(),
                }
            }

            K::Addi
            | K::Xori
            | K::Ori
            | K::Andi
            | K::Addiw
            | K::Slli
            | K::Srli
            | K::Srai
            | K::Slliw
            | K::Srliw
            | K::Sraiw => {
                if inst.rd != Register::Zero {
                    self.generate_alu_imm(inst);
                }
            }

            K::Slt | K::Sltu | K::Slti | K::Sltiu => {
                if inst.rd != Register::Zero {
                    self.generate_set_less_than(inst);
                }
            }

            K::Add
            | K::Sub
            | K::Xor
            | K::Or
            | K::And
            | K::Sll
            | K::Srl
            | K::Sra
            | K::Addw
            | K::Subw
            | K::Sllw
            | K::Srlw
            | K::Sraw => {
                if inst.rd != Register::Zero {
                    self.generate_alu_reg(inst);
                }
            }

            K::Mul | K::Mulw => {
                if inst.rd != Register::Zero {
                    let is_32bit = inst.kind == K::Mulw;
                    self.load_register(RAX, inst.rs1, 0);
                    self.load_register(RBX, inst.rs2, 0);
                    {
                        let asm = &mut self.asm;
                        if is_32bit {
                            dynasm!(asm ; .arch x64 ; imul eax, ebx);
                        } else {
                            dynasm!(asm ; .arch x64 ; imul rax, rbx);
                        }
                    }
                    self.store_register(inst.rd, RAX, is_32bit);
                }
            }

            K::Div | K::Divw | K::Divu | K::Divuw | K::Rem | K::Remu | K::Remw | K::Remuw => {
                if inst.rd != Register::Zero {
                    self.generate_division(inst);
                }
            }

            K::Mulh | K::Mulhu | K::Mulhsu => {
                self.generate_exit(
                    ArchExitReason::UnsupportedInstruction,
                    ExitPc::Value(self.current_pc),
                );
                return false;
            }

            K::Fence => {}

            K::Ecall => {
                self.generate_exit(ArchExitReason::Ecall, ExitPc::Value(self.current_pc));
                return false;
            }
            K::Ebreak => {
                self.generate_exit(ArchExitReason::Ebreak, ExitPc::Value(self.current_pc));
                return false;
            }
            K::Undefined => {
                self.generate_exit(
                    ArchExitReason::UndefinedInstruction,
                    ExitPc::Value(self.current_pc),
                );
                return false;
            }
        }

        true
    }

    fn generate_block(&mut self) {
        loop {
            let encoded = match self
                .memory
                .read_u32(self.current_pc, MemoryFlags::EXECUTE)
            {
                Ok(encoded) => encoded,
                Err(_) => {
                    self.generate_exit(
                        ArchExitReason::InstructionFetchFault,
                        ExitPc::Value(self.current_pc),
                    );
                    break;
                }
            };

            let inst = Inst::decode(encoded);
            if !self.generate_instruction(&inst) {
                break;
            }

            self.current_pc += 4;

            if self.single_step {
                self.generate_exit(ArchExitReason::SingleStep, ExitPc::Value(self.current_pc));
                break;
            }
        }

        self.generate_pending_exits();
    }
}

/// Compile the basic block starting at `pc` and return its code bytes.
pub(super) fn generate_block_code(
    code_buffer: &CodeBuffer,
    memory: &Memory,
    single_step: bool,
    pc: u64,
) -> Vec<u8> {
    let mut compiler = BlockCompiler {
        asm: Asm::new(0),
        memory,
        code_buffer,
        single_step,
        pending_exits: Vec::new(),
        current_pc: pc,
    };

    compiler.generate_block();

    compiler
        .asm
        .finalize()
        .expect("assembling x86-64 block failed")
}
