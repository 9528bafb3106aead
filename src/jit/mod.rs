//! Basic-block JIT
//!
//! Translates guest code one basic block at a time into host machine code,
//! cached by guest PC in the `CodeBuffer`. One backend exists per host ISA;
//! both share the control-flow templates (inline translation-table lookups,
//! pending-exit pads, permission-checked memory accesses) and differ only in
//! the emitter.

mod code_buffer;
mod code_dump;
mod exec_buffer;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "x86_64")]
mod x64;

pub use code_buffer::{CodeBuffer, CodeBufferFlags};
pub use code_dump::{Architecture, CodeDump};
pub use exec_buffer::ExecutableBuffer;

use std::sync::Arc;

#[cfg(any(target_arch = "aarch64", target_arch = "x86_64"))]
use crate::cpu::decode::InstKind;
use crate::cpu::Cpu;
use crate::memory::Memory;

/// Exit reasons the JIT reports to the `Vm` loop. A strict superset of the
/// interpreter's reasons: `UnsupportedInstruction` marks kinds the JIT
/// refuses to compile (the mulh family).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    UnalignedPc,
    OutOfBoundsPc,
    InstructionFetchFault,
    UndefinedInstruction,
    UnsupportedInstruction,
    MemoryReadFault,
    MemoryWriteFault,
    Ecall,
    Ebreak,
}

/// Exit reasons generated code materializes in the trampoline block.
/// `BlockNotGenerated` and `SingleStep` are internal to the executor loop
/// and never escape it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub(crate) enum ArchExitReason {
    UnalignedPc = 0,
    OutOfBoundsPc,
    InstructionFetchFault,
    UndefinedInstruction,
    UnsupportedInstruction,
    MemoryReadFault,
    MemoryWriteFault,
    BlockNotGenerated,
    SingleStep,
    Ecall,
    Ebreak,
}

#[cfg(any(target_arch = "aarch64", target_arch = "x86_64"))]
impl ArchExitReason {
    pub(crate) fn from_u64(value: u64) -> ArchExitReason {
        use ArchExitReason as A;
        match value {
            0 => A::UnalignedPc,
            1 => A::OutOfBoundsPc,
            2 => A::InstructionFetchFault,
            3 => A::UndefinedInstruction,
            4 => A::UnsupportedInstruction,
            5 => A::MemoryReadFault,
            6 => A::MemoryWriteFault,
            7 => A::BlockNotGenerated,
            8 => A::SingleStep,
            9 => A::Ecall,
            10 => A::Ebreak,
            _ => panic!("generated code returned invalid exit reason {value}"),
        }
    }

    /// Map to the reason reported to the `Vm` loop; internal reasons have no
    /// mapping and must be consumed by the executor loop.
    pub(crate) fn to_public(self) -> ExitReason {
        use ArchExitReason as A;
        use ExitReason as E;
        match self {
            A::UnalignedPc => E::UnalignedPc,
            A::OutOfBoundsPc => E::OutOfBoundsPc,
            A::InstructionFetchFault => E::InstructionFetchFault,
            A::UndefinedInstruction => E::UndefinedInstruction,
            A::UnsupportedInstruction => E::UnsupportedInstruction,
            A::MemoryReadFault => E::MemoryReadFault,
            A::MemoryWriteFault => E::MemoryWriteFault,
            A::Ecall => E::Ecall,
            A::Ebreak => E::Ebreak,
            A::BlockNotGenerated | A::SingleStep => {
                unreachable!("internal exit reason escaped the executor loop")
            }
        }
    }
}

/// Context block the trampoline exchanges with generated code. Field order
/// is ABI: the trampolines address fields by offset.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TrampolineBlock {
    pub register_state: u64,
    pub memory_base: u64,
    pub permissions_base: u64,
    pub memory_size: u64,
    pub block_base: u64,
    pub max_executable_pc: u64,
    pub code_base: u64,
    pub entrypoint: u64,

    pub exit_reason: u64,
    pub exit_pc: u64,
}

/// An arch-specific executor: compiles on miss and runs generated code until
/// a non-internal exit reason surfaces.
pub trait Executor {
    fn run(&mut self, memory: &mut Memory, cpu: &mut Cpu) -> ExitReason;
}

/// Pick the backend for the host architecture, if one exists.
pub fn create_executor(
    code_buffer: Arc<CodeBuffer>,
    code_dump: Option<CodeDump>,
    single_step: bool,
) -> Option<Box<dyn Executor>> {
    #[cfg(target_arch = "aarch64")]
    return Some(Box::new(aarch64::Executor::new(
        code_buffer,
        code_dump,
        single_step,
    )));

    #[cfg(target_arch = "x86_64")]
    return Some(Box::new(x64::Executor::new(
        code_buffer,
        code_dump,
        single_step,
    )));

    #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
    {
        let _ = (code_buffer, code_dump, single_step);
        None
    }
}

/// log2 of the access width of a load/store kind.
#[cfg(any(target_arch = "aarch64", target_arch = "x86_64"))]
pub(crate) fn memory_access_size_log2(kind: InstKind) -> u32 {
    use InstKind as K;
    match kind {
        K::Sb | K::Lb | K::Lbu => 0,
        K::Sh | K::Lh | K::Lhu => 1,
        K::Sw | K::Lw | K::Lwu => 2,
        K::Sd | K::Ld => 3,
        _ => unreachable!("not a memory access: {kind:?}"),
    }
}
