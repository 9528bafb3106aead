//! Emulation driver
//!
//! `Vm` owns the guest memory and the optional JIT executor and runs the
//! outer loop: JIT-backed when a backend exists for the host, otherwise the
//! interpreter. JIT exits that need precise fault information (or an
//! instruction the JIT refuses) fall back to interpreting one step.

use std::sync::Arc;

use crate::cpu::interp::Interpreter;
use crate::cpu::{Cpu, Register};
use crate::exec_log;
use crate::jit::{self, CodeBuffer, CodeDump};
use crate::memory::Memory;

/// Terminal cause of an emulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitReason {
    #[default]
    None,
    UnalignedPc,
    OutOfBoundsPc,
    InstructionFetchFault,
    UndefinedInstruction,
    MemoryReadFault,
    MemoryWriteFault,
    Ecall,
    Ebreak,
}

/// Exit record handed back to the caller. `faulty_address` and
/// `target_register` are populated for memory faults only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Exit {
    pub reason: ExitReason,
    pub faulty_address: u64,
    pub target_register: Register,
}

impl Exit {
    pub fn new(reason: ExitReason) -> Self {
        Exit {
            reason,
            ..Exit::default()
        }
    }
}

pub struct Vm {
    memory: Memory,
    jit_executor: Option<Box<dyn jit::Executor>>,
}

impl Vm {
    pub fn new(memory_size: usize) -> Self {
        Vm {
            memory: Memory::new(memory_size),
            jit_executor: None,
        }
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    /// Attach a JIT executor backed by `code_buffer`. Returns false when no
    /// backend exists for the host architecture; `run` then uses the
    /// interpreter.
    pub fn use_jit(
        &mut self,
        code_buffer: Arc<CodeBuffer>,
        code_dump: Option<CodeDump>,
        single_step: bool,
    ) -> bool {
        match jit::create_executor(code_buffer, code_dump, single_step) {
            Some(executor) => {
                self.jit_executor = Some(executor);
                true
            }
            None => {
                log::warn!("couldn't create JIT executor for current platform");
                false
            }
        }
    }

    /// Run until a terminal exit.
    pub fn run(&mut self, cpu: &mut Cpu) -> Exit {
        let Some(mut executor) = self.jit_executor.take() else {
            return self.run_interpreter(cpu);
        };

        let exit = loop {
            let jit_exit = executor.run(&mut self.memory, cpu);

            use jit::ExitReason as JE;
            match jit_exit {
                JE::UnalignedPc => break Exit::new(ExitReason::UnalignedPc),
                JE::OutOfBoundsPc => break Exit::new(ExitReason::OutOfBoundsPc),
                JE::InstructionFetchFault => break Exit::new(ExitReason::InstructionFetchFault),
                JE::UndefinedInstruction => break Exit::new(ExitReason::UndefinedInstruction),
                JE::Ecall => break Exit::new(ExitReason::Ecall),
                JE::Ebreak => break Exit::new(ExitReason::Ebreak),

                // The emitted code reports these without the precise fault
                // fields (or refuses the instruction entirely); one
                // interpreter step at the same PC re-derives them.
                JE::UnsupportedInstruction | JE::MemoryReadFault | JE::MemoryWriteFault => {
                    if let Err(exit) = Interpreter::step(&mut self.memory, cpu) {
                        break exit;
                    }
                }
            }
        };

        self.jit_executor = Some(executor);
        exit
    }

    /// Run to the first terminal exit using the interpreter only.
    pub fn run_interpreter(&mut self, cpu: &mut Cpu) -> Exit {
        let trace = log::log_enabled!(log::Level::Trace);

        let exit = loop {
            let previous = trace.then(|| *cpu.register_state());

            match Interpreter::step(&mut self.memory, cpu) {
                Ok(()) => {
                    if let Some(previous) = previous {
                        exec_log::print_execution_step(&previous, cpu.register_state());
                    }
                }
                Err(exit) => break exit,
            }
        };

        assert!(
            exit.reason != ExitReason::None,
            "interpreter didn't fill the exit record properly"
        );

        exit
    }
}
