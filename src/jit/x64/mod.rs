//! x86-64 JIT executor

mod codegen;
mod trampoline;

use std::sync::Arc;

use crate::cpu::{Cpu, Register};
use crate::exec_log;
use crate::jit::{self, ArchExitReason, CodeBuffer, CodeDump, ExitReason, TrampolineBlock};
use crate::memory::Memory;

pub struct Executor {
    code_buffer: Arc<CodeBuffer>,
    code_dump: Option<CodeDump>,
    single_step: bool,
    trampoline: *const u8,
}

impl Executor {
    pub fn new(
        code_buffer: Arc<CodeBuffer>,
        code_dump: Option<CodeDump>,
        single_step: bool,
    ) -> Self {
        let trampoline = trampoline::generate_trampoline(&code_buffer);
        Executor {
            code_buffer,
            code_dump,
            single_step,
            trampoline,
        }
    }

    fn generate_code(&mut self, memory: &Memory, pc: u64) -> *const u8 {
        let code = codegen::generate_block_code(&self.code_buffer, memory, self.single_step, pc);

        if let Some(dump) = &mut self.code_dump {
            dump.write(pc, &code).expect("writing jit code dump failed");
        }

        log::debug!("generated code for {pc:#x}: {} bytes", code.len());

        self.code_buffer.insert(pc, &code)
    }
}

impl jit::Executor for Executor {
    fn run(&mut self, memory: &mut Memory, cpu: &mut Cpu) -> ExitReason {
        loop {
            let pc = cpu.pc();

            // Bad entry PCs have no translation-table slot; report them the
            // way a generated branch would have.
            if pc & 3 != 0 {
                return ExitReason::UnalignedPc;
            }
            if pc / 4 >= self.code_buffer.max_block_count() as u64 {
                return ExitReason::OutOfBoundsPc;
            }

            let code = match self.code_buffer.get(pc) {
                Some(code) => code,
                None => self.generate_code(memory, pc),
            };

            let mut block = TrampolineBlock {
                register_state: cpu.register_state_mut().as_mut_ptr() as u64,
                memory_base: memory.contents_ptr() as u64,
                permissions_base: memory.permissions_ptr() as u64,
                memory_size: memory.size(),
                block_base: self.code_buffer.block_translation_table() as u64,
                max_executable_pc: self.code_buffer.max_block_count() as u64 * 4,
                code_base: self.code_buffer.code_buffer_base() as u64,
                entrypoint: code as u64,
                ..TrampolineBlock::default()
            };

            let previous = self.single_step.then(|| *cpu.register_state());

            unsafe {
                let trampoline: extern "C" fn(*mut TrampolineBlock) =
                    std::mem::transmute(self.trampoline);
                trampoline(&mut block);
            }

            cpu.set_reg(Register::Pc, block.exit_pc);

            if let Some(previous) = previous {
                exec_log::print_execution_step(&previous, cpu.register_state());
            }

            match ArchExitReason::from_u64(block.exit_reason) {
                ArchExitReason::BlockNotGenerated | ArchExitReason::SingleStep => continue,
                other => return other.to_public(),
            }
        }
    }
}
