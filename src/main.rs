use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use log::info;

use rvjit::cpu::Cpu;
use rvjit::elf;
use rvjit::jit::{Architecture, CodeBuffer, CodeBufferFlags, CodeDump};
use rvjit::memory::MemoryFlags;
use rvjit::vm::{ExitReason, Vm};
use rvjit::Register;

const GUEST_MEMORY_SIZE: usize = 32 * 1024 * 1024;
const CODE_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// User-mode RV64IM emulator with a basic-block JIT.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// RISC-V ELF executable to run
    elf: PathBuf,

    /// Run on the interpreter only
    #[arg(long)]
    no_jit: bool,

    /// Dump generated host code to this file
    #[arg(long, value_name = "PATH")]
    dump_code: Option<PathBuf>,

    /// Log every executed instruction's register changes (at trace level)
    #[arg(long)]
    trace: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut vm = Vm::new(GUEST_MEMORY_SIZE);

    let binary = std::fs::read(&args.elf)
        .with_context(|| format!("reading {} failed", args.elf.display()))?;

    info!("loading {}...", args.elf.display());
    let image = elf::load(&binary, vm.memory_mut())
        .with_context(|| format!("loading {} failed", args.elf.display()))?;
    info!("loaded elf at {:#x} with size {:#x}", image.base, image.size);

    // A low page for early stack/data accesses, and the image itself.
    vm.memory_mut()
        .set_permissions(
            0x10,
            (image.base - 0x10) as usize,
            MemoryFlags::READ | MemoryFlags::WRITE,
        )
        .expect("granting low memory permissions failed");
    vm.memory_mut()
        .set_permissions(image.base, image.size as usize, MemoryFlags::all())
        .expect("granting image permissions failed");

    if !args.no_jit {
        let code_buffer = Arc::new(CodeBuffer::new(
            CodeBufferFlags::empty(),
            CODE_BUFFER_SIZE,
            image.base + image.size,
        ));

        let code_dump = match (&args.dump_code, Architecture::host()) {
            (Some(path), Some(architecture)) => Some(
                CodeDump::create(path, architecture)
                    .with_context(|| format!("creating {} failed", path.display()))?,
            ),
            _ => None,
        };

        vm.use_jit(code_buffer, code_dump, args.trace);
    }

    let mut cpu = Cpu::new();
    cpu.set_reg(Register::Sp, image.base - 8);
    cpu.set_reg(Register::Pc, image.entrypoint);

    let start = Instant::now();
    let exit = vm.run(&mut cpu);
    let execution_time = start.elapsed();

    info!(
        "exited the VM in {:?} with reason: {:?}",
        execution_time, exit.reason
    );
    info!("pc: {:#x}", cpu.pc());

    if matches!(
        exit.reason,
        ExitReason::MemoryReadFault | ExitReason::MemoryWriteFault
    ) {
        info!("faulty address: {:#x}", exit.faulty_address);
        if exit.reason == ExitReason::MemoryWriteFault {
            info!("written value: {}", cpu.reg(exit.target_register));
        }
    }

    Ok(())
}
