//! AArch64 block compiler
//!
//! Emits AArch64 code for one guest basic block. Guest registers live in
//! the register cache across the block; the context registers
//! x0..x7 are pinned by the trampoline, except x7 which each block's
//! prologue loads with its own base PC for PC-relative immediates. Cold
//! exits go through pending pads after the block body, each flushing the
//! dirty cache state captured at its fault site.

use dynasm::dynasm;
use dynasmrt::aarch64::Aarch64Relocation;
use dynasmrt::{DynamicLabel, DynasmApi, DynasmLabelApi, VecAssembler};

use crate::cpu::decode::{Inst, InstKind};
use crate::cpu::Register;
use crate::jit::{memory_access_size_log2, ArchExitReason, CodeBuffer, CodeBufferFlags};
use crate::memory::{Memory, MemoryFlags};

use super::reg_cache::{RegisterCache, StateSnapshot};
use super::regs::*;

type Asm = VecAssembler<Aarch64Relocation>;

#[derive(Debug, Clone, Copy)]
enum ExitPc {
    Value(u64),
    Reg(u32),
}

struct PendingExit {
    label: DynamicLabel,
    reason: ArchExitReason,
    pc: ExitPc,
    snapshot: Option<StateSnapshot>,
}

/// movz/movk (or movn/movk) sequence for an arbitrary 64-bit immediate.
fn emit_mov_imm(asm: &mut Asm, target: u32, value: u64) {
    let halfwords: [u32; 4] = std::array::from_fn(|i| ((value >> (i * 16)) & 0xFFFF) as u32);
    let ones = halfwords.iter().filter(|&&h| h == 0xFFFF).count();
    let zeros = halfwords.iter().filter(|&&h| h == 0).count();

    let emit_movz = |asm: &mut Asm, imm: u32, index: usize| match index {
        0 => dynasm!(asm ; .arch aarch64 ; movz X(target), imm),
        1 => dynasm!(asm ; .arch aarch64 ; movz X(target), imm, lsl 16),
        2 => dynasm!(asm ; .arch aarch64 ; movz X(target), imm, lsl 32),
        _ => dynasm!(asm ; .arch aarch64 ; movz X(target), imm, lsl 48),
    };
    let emit_movn = |asm: &mut Asm, imm: u32, index: usize| match index {
        0 => dynasm!(asm ; .arch aarch64 ; movn X(target), imm),
        1 => dynasm!(asm ; .arch aarch64 ; movn X(target), imm, lsl 16),
        2 => dynasm!(asm ; .arch aarch64 ; movn X(target), imm, lsl 32),
        _ => dynasm!(asm ; .arch aarch64 ; movn X(target), imm, lsl 48),
    };
    let emit_movk = |asm: &mut Asm, imm: u32, index: usize| match index {
        0 => dynasm!(asm ; .arch aarch64 ; movk X(target), imm),
        1 => dynasm!(asm ; .arch aarch64 ; movk X(target), imm, lsl 16),
        2 => dynasm!(asm ; .arch aarch64 ; movk X(target), imm, lsl 32),
        _ => dynasm!(asm ; .arch aarch64 ; movk X(target), imm, lsl 48),
    };

    if ones > zeros {
        match halfwords.iter().position(|&h| h != 0xFFFF) {
            None => emit_movn(asm, 0, 0),
            Some(first) => {
                emit_movn(asm, !halfwords[first] & 0xFFFF, first);
                for i in first + 1..4 {
                    if halfwords[i] != 0xFFFF {
                        emit_movk(asm, halfwords[i], i);
                    }
                }
            }
        }
    } else {
        match halfwords.iter().position(|&h| h != 0) {
            None => emit_movz(asm, 0, 0),
            Some(first) => {
                emit_movz(asm, halfwords[first], first);
                for i in first + 1..4 {
                    if halfwords[i] != 0 {
                        emit_movk(asm, halfwords[i], i);
                    }
                }
            }
        }
    }
}

struct BlockCompiler<'a> {
    asm: Asm,
    memory: &'a Memory,
    code_buffer: &'a CodeBuffer,
    single_step: bool,
    pending_exits: Vec<PendingExit>,
    register_cache: RegisterCache,
    base_pc: u64,
    current_pc: u64,
}

impl BlockCompiler<'_> {
    fn skip_permission_checks(&self) -> bool {
        self.code_buffer
            .flags()
            .contains(CodeBufferFlags::SKIP_PERMISSION_CHECKS)
    }

    fn multithreaded(&self) -> bool {
        self.code_buffer
            .flags()
            .contains(CodeBufferFlags::MULTITHREADED)
    }

    /// target <- imm, through a PC-relative add off the pinned base PC when
    /// the immediate is close to this block.
    fn load_immediate(&mut self, target: u32, imm: i64) {
        let offset = imm.wrapping_sub(self.base_pc as i64);
        let asm = &mut self.asm;

        if (0..=4095).contains(&offset) {
            dynasm!(asm ; .arch aarch64 ; add X(target), X(BASE_PC), offset as u32);
            return;
        }
        if (-4095..0).contains(&offset) {
            dynasm!(asm ; .arch aarch64 ; sub X(target), X(BASE_PC), (-offset) as u32);
            return;
        }

        emit_mov_imm(asm, target, imm as u64);
    }

    fn load_immediate_u(&mut self, target: u32, imm: u64) {
        self.load_immediate(target, imm as i64);
    }

    fn load_immediate_or_zero(&mut self, target: u32, imm: i64) -> u32 {
        if imm == 0 {
            return XZR;
        }
        self.load_immediate(target, imm);
        target
    }

    /// value + offset, into `scratch` unless it is free to reuse `value`.
    fn add_offset_to_register(&mut self, value: u32, scratch: u32, offset: i64) -> u32 {
        if value == XZR {
            self.load_immediate(scratch, offset);
            return scratch;
        }
        if offset == 0 {
            return value;
        }

        if (0..=4095).contains(&offset) {
            let asm = &mut self.asm;
            dynasm!(asm ; .arch aarch64 ; add X(scratch), X(value), offset as u32);
            return scratch;
        }
        if (-4095..0).contains(&offset) {
            let asm = &mut self.asm;
            dynasm!(asm ; .arch aarch64 ; sub X(scratch), X(value), (-offset) as u32);
            return scratch;
        }

        self.load_immediate(scratch, offset);
        let asm = &mut self.asm;
        dynasm!(asm ; .arch aarch64 ; add X(scratch), X(value), X(scratch));
        scratch
    }

    /// Inline exit: flush the dirty cache, materialize the exit pair in
    /// x0/x1 and return to the trampoline.
    fn generate_exit(&mut self, reason: ArchExitReason, pc: ExitPc) {
        self.register_cache.flush_current_registers(&mut self.asm);
        self.generate_exit_no_flush(reason, pc);
    }

    fn generate_exit_no_flush(&mut self, reason: ArchExitReason, pc: ExitPc) {
        emit_mov_imm(&mut self.asm, EXIT_REASON, reason as u64);
        match pc {
            ExitPc::Value(value) => {
                // EXIT_PC aliases a context register, but nothing after this
                // point reads the context, so the plain immediate load (no
                // base-PC trick: x7 is still valid) is fine.
                self.load_immediate_u(EXIT_PC, value);
            }
            ExitPc::Reg(reg) => {
                let asm = &mut self.asm;
                dynasm!(asm ; .arch aarch64 ; mov X(EXIT_PC), X(reg));
            }
        }
        let asm = &mut self.asm;
        dynasm!(asm ; .arch aarch64 ; ret);
    }

    fn add_pending_exit(
        &mut self,
        label: DynamicLabel,
        reason: ArchExitReason,
        pc: ExitPc,
        flush_registers: bool,
    ) {
        let snapshot = flush_registers.then(|| self.register_cache.take_state_snapshot());
        self.pending_exits.push(PendingExit {
            label,
            reason,
            pc,
            snapshot,
        });
    }

    fn generate_pending_exits(&mut self) {
        for exit in std::mem::take(&mut self.pending_exits) {
            {
                let asm = &mut self.asm;
                dynasm!(asm ; .arch aarch64 ; =>exit.label);
            }
            if let Some(snapshot) = &exit.snapshot {
                RegisterCache::flush_registers(&mut self.asm, snapshot);
            }
            self.generate_exit_no_flush(exit.reason, exit.pc);
        }
    }

    /// Alignment, bounds and permission checks for the access address in
    /// `address_reg`. Clobbers the b/c scratch registers. Failures branch to
    /// a pad that flushes the dirty registers captured here, so an
    /// interpreter retry at this PC observes a correct register file.
    fn generate_validate_memory_access(&mut self, address_reg: u32, access_size_log2: u32, write: bool) {
        let fault = self.asm.new_dynamic_label();

        {
            let asm = &mut self.asm;

            // An unaligned access could straddle the end of memory, so the
            // bounds check below is only exact for aligned addresses.
            match access_size_log2 {
                0 => {}
                1 => dynasm!(asm ; .arch aarch64 ; tst X(address_reg), 1 ; b.ne =>fault),
                2 => dynasm!(asm ; .arch aarch64 ; tst X(address_reg), 3 ; b.ne =>fault),
                3 => dynasm!(asm ; .arch aarch64 ; tst X(address_reg), 7 ; b.ne =>fault),
                _ => unreachable!(),
            }

            dynasm!(asm
                ; .arch aarch64
                ; cmp X(address_reg), X(MEMORY_SIZE)
                ; b.hs =>fault
            );
        }

        if !self.skip_permission_checks() {
            {
                let asm = &mut self.asm;
                match access_size_log2 {
                    0 => dynasm!(asm ; .arch aarch64 ; ldrb W(B_SCRATCH), [X(PERMISSIONS_BASE), X(address_reg)]),
                    1 => dynasm!(asm ; .arch aarch64 ; ldrh W(B_SCRATCH), [X(PERMISSIONS_BASE), X(address_reg)]),
                    2 => dynasm!(asm ; .arch aarch64 ; ldr W(B_SCRATCH), [X(PERMISSIONS_BASE), X(address_reg)]),
                    3 => dynasm!(asm ; .arch aarch64 ; ldr X(B_SCRATCH), [X(PERMISSIONS_BASE), X(address_reg)]),
                    _ => unreachable!(),
                }
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
            emit_mov_imm(&mut self.asm, C_SCRATCH, mask);

            let asm = &mut self.asm;
            if access_size_log2 == 2 {
                dynasm!(asm
                    ; .arch aarch64
                    ; and W(B_SCRATCH), W(B_SCRATCH), W(C_SCRATCH)
                    ; cmp W(B_SCRATCH), W(C_SCRATCH)
                    ; b.ne =>fault
                );
            } else {
                dynasm!(asm
                    ; .arch aarch64
                    ; and X(B_SCRATCH), X(B_SCRATCH), X(C_SCRATCH)
                    ; cmp X(B_SCRATCH), X(C_SCRATCH)
                    ; b.ne =>fault
                );
            }
        }

        let reason = if write {
            ArchExitReason::MemoryWriteFault
        } else {
            ArchExitReason::MemoryReadFault
        };
        self.add_pending_exit(fault, reason, ExitPc::Value(self.current_pc), true);
    }

    /// Inline translation-table lookup with the table byte offset in
    /// `offset_reg` (equal to the target PC, since a 4-byte block maps to a
    /// 4-byte slot), and a tail-call on hit. Returns the miss label.
    fn generate_validated_branch(&mut self, offset_reg: u32) -> DynamicLabel {
        let multithreaded = self.multithreaded();
        let miss = self.asm.new_dynamic_label();
        let asm = &mut self.asm;

        if multithreaded {
            dynasm!(asm
                ; .arch aarch64
                ; add X(offset_reg), X(BLOCK_BASE), X(offset_reg)
                ; ldar W(offset_reg), [X(offset_reg)]
            );
        } else {
            dynasm!(asm
                ; .arch aarch64
                ; ldr W(offset_reg), [X(BLOCK_BASE), X(offset_reg)]
            );
        }

        dynasm!(asm
            ; .arch aarch64
            ; cbz X(offset_reg), =>miss
            ; add X(offset_reg), X(CODE_BASE), X(offset_reg)
            ; br X(offset_reg)
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

        // The table byte offset for an aligned PC is the PC itself.
        self.load_immediate_u(A_SCRATCH, block * 4);
        self.register_cache.flush_current_registers(&mut self.asm);

        let miss = self.generate_validated_branch(A_SCRATCH);
        self.add_pending_exit(
            miss,
            ArchExitReason::BlockNotGenerated,
            ExitPc::Value(target_pc),
            false,
        );
    }

    /// Dynamic branch with the raw target in `target_reg` (never xzr). The
    /// masked target stays in the b scratch register through every pad.
    fn generate_dynamic_branch(&mut self, target_reg: u32) {
        debug_assert!(target_reg != XZR && target_reg != B_SCRATCH && target_reg != C_SCRATCH);

        let unaligned = self.asm.new_dynamic_label();
        let oob = self.asm.new_dynamic_label();

        {
            let asm = &mut self.asm;
            // Bit 0 of a jalr target is discarded by the architecture.
            dynasm!(asm ; .arch aarch64 ; and X(B_SCRATCH), X(target_reg), 0xFFFF_FFFF_FFFF_FFFEu64);
        }

        self.register_cache.flush_current_registers(&mut self.asm);

        {
            let asm = &mut self.asm;
            dynasm!(asm
                ; .arch aarch64
                ; tst X(B_SCRATCH), 0b11u64
                ; b.ne =>unaligned
                ; cmp X(B_SCRATCH), X(MAX_EXECUTABLE_PC)
                ; b.hs =>oob
            );
        }

        if self.single_step {
            self.generate_exit_no_flush(ArchExitReason::SingleStep, ExitPc::Reg(B_SCRATCH));
        } else {
            {
                let asm = &mut self.asm;
                dynasm!(asm ; .arch aarch64 ; mov X(C_SCRATCH), X(B_SCRATCH));
            }
            let miss = self.generate_validated_branch(C_SCRATCH);
            self.add_pending_exit(
                miss,
                ArchExitReason::BlockNotGenerated,
                ExitPc::Reg(B_SCRATCH),
                false,
            );
        }

        self.add_pending_exit(unaligned, ArchExitReason::UnalignedPc, ExitPc::Reg(B_SCRATCH), false);
        self.add_pending_exit(oob, ArchExitReason::OutOfBoundsPc, ExitPc::Reg(B_SCRATCH), false);
    }

    fn generate_alu_imm(&mut self, inst: &Inst) {
        use InstKind as K;

        let [a, dest] = self
            .register_cache
            .lock_registers(&mut self.asm, [inst.rs1, inst.rd]);
        let imm = inst.imm;
        let shamt = inst.shamt;

        match inst.kind {
            K::Addi | K::Addiw => {
                if a == XZR {
                    self.load_immediate(dest, imm);
                } else if imm == 0 {
                    let asm = &mut self.asm;
                    dynasm!(asm ; .arch aarch64 ; mov X(dest), X(a));
                } else if (0..=4095).contains(&imm) {
                    let asm = &mut self.asm;
                    dynasm!(asm ; .arch aarch64 ; add X(dest), X(a), imm as u32);
                } else if (-4095..0).contains(&imm) {
                    let asm = &mut self.asm;
                    dynasm!(asm ; .arch aarch64 ; sub X(dest), X(a), (-imm) as u32);
                } else {
                    self.load_immediate(A_SCRATCH, imm);
                    let asm = &mut self.asm;
                    dynasm!(asm ; .arch aarch64 ; add X(dest), X(a), X(A_SCRATCH));
                }

                if inst.kind == K::Addiw {
                    let asm = &mut self.asm;
                    dynasm!(asm ; .arch aarch64 ; sxtw X(dest), W(dest));
                }
            }

            K::Xori | K::Ori | K::Andi => {
                let b = self.load_immediate_or_zero(A_SCRATCH, imm);
                let asm = &mut self.asm;
                match inst.kind {
                    K::Xori => dynasm!(asm ; .arch aarch64 ; eor X(dest), X(a), X(b)),
                    K::Ori => dynasm!(asm ; .arch aarch64 ; orr X(dest), X(a), X(b)),
                    K::Andi => dynasm!(asm ; .arch aarch64 ; and X(dest), X(a), X(b)),
                    _ => unreachable!(),
                }
            }

            K::Slli | K::Srli | K::Srai => {
                let asm = &mut self.asm;
                match inst.kind {
                    K::Slli => dynasm!(asm ; .arch aarch64 ; lsl X(dest), X(a), shamt),
                    K::Srli => dynasm!(asm ; .arch aarch64 ; lsr X(dest), X(a), shamt),
                    K::Srai => dynasm!(asm ; .arch aarch64 ; asr X(dest), X(a), shamt),
                    _ => unreachable!(),
                }
            }

            K::Slliw | K::Srliw | K::Sraiw => {
                let asm = &mut self.asm;
                match inst.kind {
                    K::Slliw => dynasm!(asm ; .arch aarch64 ; lsl W(dest), W(a), shamt),
                    K::Srliw => dynasm!(asm ; .arch aarch64 ; lsr W(dest), W(a), shamt),
                    K::Sraiw => dynasm!(asm ; .arch aarch64 ; asr W(dest), W(a), shamt),
                    _ => unreachable!(),
                }
                dynasm!(asm ; .arch aarch64 ; sxtw X(dest), W(dest));
            }

            _ => unreachable!(),
        }

        self.register_cache.unlock_register(a, false);
        self.register_cache.unlock_register_dirty(dest);
    }

    fn generate_alu_reg(&mut self, inst: &Inst) {
        use InstKind as K;

        let [a, b, dest] = self
            .register_cache
            .lock_registers(&mut self.asm, [inst.rs1, inst.rs2, inst.rd]);

        {
            let asm = &mut self.asm;
            match inst.kind {
                K::Add => dynasm!(asm ; .arch aarch64 ; add X(dest), X(a), X(b)),
                K::Sub => dynasm!(asm ; .arch aarch64 ; sub X(dest), X(a), X(b)),
                K::Xor => dynasm!(asm ; .arch aarch64 ; eor X(dest), X(a), X(b)),
                K::Or => dynasm!(asm ; .arch aarch64 ; orr X(dest), X(a), X(b)),
                K::And => dynasm!(asm ; .arch aarch64 ; and X(dest), X(a), X(b)),
                K::Sll => dynasm!(asm ; .arch aarch64 ; lsl X(dest), X(a), X(b)),
                K::Srl => dynasm!(asm ; .arch aarch64 ; lsr X(dest), X(a), X(b)),
                K::Sra => dynasm!(asm ; .arch aarch64 ; asr X(dest), X(a), X(b)),
                K::Addw => dynasm!(asm ; .arch aarch64 ; add W(dest), W(a), W(b) ; sxtw X(dest), W(dest)),
                K::Subw => dynasm!(asm ; .arch aarch64 ; sub W(dest), W(a), W(b) ; sxtw X(dest), W(dest)),
                K::Sllw => dynasm!(asm ; .arch aarch64 ; lsl W(dest), W(a), W(b) ; sxtw X(dest), W(dest)),
                K::Srlw => dynasm!(asm ; .arch aarch64 ; lsr W(dest), W(a), W(b) ; sxtw X(dest), W(dest)),
                K::Sraw => dynasm!(asm ; .arch aarch64 ; asr W(dest), W(a), W(b) ; sxtw X(dest), W(dest)),
                _ => unreachable!(),
            }
        }

        self.register_cache.unlock_register(a, false);
        self.register_cache.unlock_register(b, false);
        self.register_cache.unlock_register_dirty(dest);
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
            let dest = self.register_cache.lock_register(&mut self.asm, inst.rd);
            self.load_immediate_u(dest, result as u64);
            self.register_cache.unlock_register_dirty(dest);
            return;
        }

        if has_imm {
            let [a, dest] = self
                .register_cache
                .lock_registers(&mut self.asm, [inst.rs1, inst.rd]);
            let imm = inst.imm;

            if (0..=4095).contains(&imm) {
                let asm = &mut self.asm;
                dynasm!(asm ; .arch aarch64 ; cmp X(a), imm as u32);
            } else if (-4095..0).contains(&imm) {
                let asm = &mut self.asm;
                dynasm!(asm ; .arch aarch64 ; cmn X(a), (-imm) as u32);
            } else {
                let b = self.load_immediate_or_zero(A_SCRATCH, imm);
                let asm = &mut self.asm;
                dynasm!(asm ; .arch aarch64 ; cmp X(a), X(b));
            }

            let asm = &mut self.asm;
            if is_unsigned {
                dynasm!(asm ; .arch aarch64 ; cset X(dest), lo);
            } else {
                dynasm!(asm ; .arch aarch64 ; cset X(dest), lt);
            }

            self.register_cache.unlock_register(a, false);
            self.register_cache.unlock_register_dirty(dest);
        } else {
            let [a, b, dest] = self
                .register_cache
                .lock_registers(&mut self.asm, [inst.rs1, inst.rs2, inst.rd]);

            let asm = &mut self.asm;
            dynasm!(asm ; .arch aarch64 ; cmp X(a), X(b));
            if is_unsigned {
                dynasm!(asm ; .arch aarch64 ; cset X(dest), lo);
            } else {
                dynasm!(asm ; .arch aarch64 ; cset X(dest), lt);
            }

            self.register_cache.unlock_register(a, false);
            self.register_cache.unlock_register(b, false);
            self.register_cache.unlock_register_dirty(dest);
        }
    }

    fn generate_multiply_divide(&mut self, inst: &Inst) {
        use InstKind as K;

        let [a, b, dest] = self
            .register_cache
            .lock_registers(&mut self.asm, [inst.rs1, inst.rs2, inst.rd]);
        let tmp = A_SCRATCH;

        let asm = &mut self.asm;
        match inst.kind {
            K::Mul => dynasm!(asm ; .arch aarch64 ; mul X(dest), X(a), X(b)),
            K::Mulw => dynasm!(asm ; .arch aarch64 ; mul W(dest), W(a), W(b) ; sxtw X(dest), W(dest)),

            // The hardware quotient for division by zero is 0; RISC-V wants
            // all ones, hence the csinv fixup. INT_MIN / -1 already wraps to
            // the architectural result.
            K::Div => dynasm!(asm
                ; .arch aarch64
                ; sdiv X(tmp), X(a), X(b)
                ; cmp X(b), xzr
                ; csinv X(dest), X(tmp), xzr, ne
            ),
            K::Divu => dynasm!(asm
                ; .arch aarch64
                ; udiv X(tmp), X(a), X(b)
                ; cmp X(b), xzr
                ; csinv X(dest), X(tmp), xzr, ne
            ),
            K::Divw => dynasm!(asm
                ; .arch aarch64
                ; sdiv W(tmp), W(a), W(b)
                ; cmp W(b), wzr
                ; csinv W(dest), W(tmp), wzr, ne
                ; sxtw X(dest), W(dest)
            ),
            K::Divuw => dynasm!(asm
                ; .arch aarch64
                ; udiv W(tmp), W(a), W(b)
                ; cmp W(b), wzr
                ; csinv W(dest), W(tmp), wzr, ne
                ; sxtw X(dest), W(dest)
            ),

            // msub reconstructs the remainder from the raw quotient; with a
            // zero divisor that quotient is 0 and the remainder comes out as
            // the dividend, exactly the architectural result.
            K::Rem => dynasm!(asm
                ; .arch aarch64
                ; sdiv X(tmp), X(a), X(b)
                ; msub X(dest), X(tmp), X(b), X(a)
            ),
            K::Remu => dynasm!(asm
                ; .arch aarch64
                ; udiv X(tmp), X(a), X(b)
                ; msub X(dest), X(tmp), X(b), X(a)
            ),
            K::Remw => dynasm!(asm
                ; .arch aarch64
                ; sdiv W(tmp), W(a), W(b)
                ; msub W(dest), W(tmp), W(b), W(a)
                ; sxtw X(dest), W(dest)
            ),
            K::Remuw => dynasm!(asm
                ; .arch aarch64
                ; udiv W(tmp), W(a), W(b)
                ; msub W(dest), W(tmp), W(b), W(a)
                ; sxtw X(dest), W(dest)
            ),

            _ => unreachable!(),
        }

        self.register_cache.unlock_register(a, false);
        self.register_cache.unlock_register(b, false);
        self.register_cache.unlock_register_dirty(dest);
    }

    /// Emit one instruction; false terminates the block.
    fn generate_instruction(&mut self, inst: &Inst) -> bool {
        use InstKind as K;

        match inst.kind {
            K::Lui => {
                if inst.rd != Register::Zero {
                    let dest = self.register_cache.lock_register(&mut self.asm, inst.rd);
                    self.load_immediate(dest, inst.imm);
                    self.register_cache.unlock_register_dirty(dest);
                }
            }

            K::Auipc => {
                if inst.rd != Register::Zero {
                    let dest = self.register_cache.lock_register(&mut self.asm, inst.rd);
                    self.load_immediate_u(dest, self.current_pc.wrapping_add(inst.imm as u64));
                    self.register_cache.unlock_register_dirty(dest);
                }
            }

            K::Jal => {
                if inst.rd != Register::Zero {
                    let dest = self.register_cache.lock_register(&mut self.asm, inst.rd);
                    self.load_immediate_u(dest, self.current_pc.wrapping_add(4));
                    self.register_cache.unlock_register_dirty(dest);
                }

                let target = self.current_pc.wrapping_add(inst.imm as u64);
                self.generate_static_branch(target);

                return false;
            }

            K::Jalr => {
                let target = self.register_cache.lock_register(&mut self.asm, inst.rs1);
                let mut resolved = self.add_offset_to_register(target, A_SCRATCH, inst.imm);

                if inst.rd != Register::Zero {
                    let dest = self.register_cache.lock_register(&mut self.asm, inst.rd);

                    // rd == rs1: preserve the branch target before the link
                    // value overwrites the shared cache slot.
                    if dest == resolved {
                        let asm = &mut self.asm;
                        dynasm!(asm ; .arch aarch64 ; mov X(A_SCRATCH), X(resolved));
                        resolved = A_SCRATCH;
                    }

                    self.load_immediate_u(dest, self.current_pc.wrapping_add(4));
                    self.register_cache.unlock_register_dirty(dest);
                }

                self.generate_dynamic_branch(resolved);
                self.register_cache.unlock_register(target, false);

                return false;
            }

            K::Beq | K::Bne | K::Blt | K::Bge | K::Bltu | K::Bgeu => {
                let [a, b] = self
                    .register_cache
                    .lock_registers(&mut self.asm, [inst.rs1, inst.rs2]);

                let skip = self.asm.new_dynamic_label();
                {
                    let asm = &mut self.asm;
                    dynasm!(asm ; .arch aarch64 ; cmp X(a), X(b));

                    // Inverted condition skips over the taken path.
                    match inst.kind {
                        K::Beq => dynasm!(asm ; .arch aarch64 ; b.ne =>skip),
                        K::Bne => dynasm!(asm ; .arch aarch64 ; b.eq =>skip),
                        K::Blt => dynasm!(asm ; .arch aarch64 ; b.ge =>skip),
                        K::Bge => dynasm!(asm ; .arch aarch64 ; b.lt =>skip),
                        K::Bltu => dynasm!(asm ; .arch aarch64 ; b.hs =>skip),
                        K::Bgeu => dynasm!(asm ; .arch aarch64 ; b.lo =>skip),
                        _ => unreachable!(),
                    }
                }

                self.generate_static_branch(self.current_pc.wrapping_add(inst.imm as u64));

                {
                    let asm = &mut self.asm;
                    dynasm!(asm ; .arch aarch64 ; =>skip);
                }

                self.register_cache.unlock_register(a, false);
                self.register_cache.unlock_register(b, false);
            }

            K::Lb | K::Lh | K::Lw | K::Ld | K::Lbu | K::Lhu | K::Lwu => {
                // A load to x0 still faults like any other load; only the
                // register write-back is elided (rd == x0 locks as xzr).
                let [base, dest] = self
                    .register_cache
                    .lock_registers(&mut self.asm, [inst.rs1, inst.rd]);
                let address = self.add_offset_to_register(base, A_SCRATCH, inst.imm);

                self.generate_validate_memory_access(
                    address,
                    memory_access_size_log2(inst.kind),
                    false,
                );

                if inst.rd != Register::Zero {
                    let asm = &mut self.asm;
                    match inst.kind {
                        K::Lb => dynasm!(asm ; .arch aarch64 ; ldrsb X(dest), [X(MEMORY_BASE), X(address)]),
                        K::Lh => dynasm!(asm ; .arch aarch64 ; ldrsh X(dest), [X(MEMORY_BASE), X(address)]),
                        K::Lw => dynasm!(asm ; .arch aarch64 ; ldrsw X(dest), [X(MEMORY_BASE), X(address)]),
                        K::Ld => dynasm!(asm ; .arch aarch64 ; ldr X(dest), [X(MEMORY_BASE), X(address)]),
                        K::Lbu => dynasm!(asm ; .arch aarch64 ; ldrb W(dest), [X(MEMORY_BASE), X(address)]),
                        K::Lhu => dynasm!(asm ; .arch aarch64 ; ldrh W(dest), [X(MEMORY_BASE), X(address)]),
                        K::Lwu => dynasm!(asm ; .arch aarch64 ; ldr W(dest), [X(MEMORY_BASE), X(address)]),
                        _ => unreachable!(),
                    }
                }

                self.register_cache.unlock_register(base, false);
                self.register_cache.unlock_register_dirty(dest);
            }

            K::Sb | K::Sh | K::Sw | K::Sd => {
                let [base, value] = self
                    .register_cache
                    .lock_registers(&mut self.asm, [inst.rs1, inst.rs2]);
                let address = self.add_offset_to_register(base, A_SCRATCH, inst.imm);

                self.generate_validate_memory_access(
                    address,
                    memory_access_size_log2(inst.kind),
                    true,
                );

                {
                    let asm = &mut self.asm;
                    match inst.kind {
                        K::Sb => dynasm!(asm ; .arch aarch64 ; strb W(value), [X(MEMORY_BASE), X(address)]),
                        K::Sh => dynasm!(asm ; .arch aarch64 ; strh W(value), [X(MEMORY_BASE), X(address)]),
                        K::Sw => dynasm!(asm ; .arch aarch64 ; str W(value), [X(MEMORY_BASE), X(address)]),
                        K::Sd => dynasm!(asm ; .arch aarch64 ; str X(value), [X(MEMORY_BASE), X(address)]),
                        _ => unreachable!(),
                    }
                }

                self.register_cache.unlock_register(base, false);
                self.register_cache.unlock_register(value, false);
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

            K::Mul
            | K::Mulw
            | K::Div
            | K::Divw
            | K::Divu
            | K::Divuw
            | K::Rem
            | K::Remu
            | K::Remw
            | K::Remuw => {
                if inst.rd != Register::Zero {
                    self.generate_multiply_divide(inst);
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
        // Block prologue: pin this block's base PC for the PC-relative
        // immediate loads.
        emit_mov_imm(&mut self.asm, BASE_PC, self.base_pc);

        loop {
            let encoded = match self.memory.read_u32(self.current_pc, MemoryFlags::EXECUTE) {
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
            let continue_block = self.generate_instruction(&inst);

            self.register_cache.finish_instruction();

            if !continue_block {
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
        register_cache: RegisterCache::new(),
        base_pc: pc,
        current_pc: pc,
    };

    compiler.generate_block();

    compiler
        .asm
        .finalize()
        .expect("assembling aarch64 block failed")
}
