//! End-to-end scenarios under the reference interpreter.

mod common;

use common::*;
use rvjit::{ExitReason, MemoryFlags, Register};

#[test]
fn test_hello_world_return() {
    let program = [addi(A0, ZERO, 42), ecall()];
    let (cpu, exit) = run_interpreter(&program);

    assert_eq!(cpu.reg(reg(A0)), 42);
    assert_eq!(exit.reason, ExitReason::Ecall);
    assert_eq!(cpu.pc(), PROGRAM_BASE + 4);
}

#[test]
fn test_loop_sum() {
    let program = [
        addi(T0, ZERO, 0),
        addi(T1, ZERO, 10),
        add(T0, T0, T1),
        addi(T1, T1, -1),
        bne(T1, ZERO, -8),
        ebreak(),
    ];
    let (cpu, exit) = run_interpreter(&program);

    assert_eq!(cpu.reg(reg(T0)), 55);
    assert_eq!(cpu.reg(reg(T1)), 0);
    assert_eq!(exit.reason, ExitReason::Ebreak);
}

#[test]
fn test_32bit_wraparound() {
    // li t0, 0x7FFFFFFF ; addiw t1, t0, 1
    let program = [
        lui(T0, 0x80000),
        addiw(T0, T0, -1),
        addiw(T1, T0, 1),
        ebreak(),
    ];
    let (cpu, exit) = run_interpreter(&program);

    assert_eq!(cpu.reg(reg(T0)), 0x7FFF_FFFF);
    assert_eq!(cpu.reg(reg(T1)), 0xFFFF_FFFF_8000_0000);
    assert_eq!(exit.reason, ExitReason::Ebreak);
}

#[test]
fn test_division_by_zero() {
    let program = [
        addi(T0, ZERO, 5),
        addi(T1, ZERO, 0),
        div(T2, T0, T1),
        divu(T3, T0, T1),
        rem(T4, T0, T1),
        ebreak(),
    ];
    let (cpu, exit) = run_interpreter(&program);

    assert_eq!(cpu.reg(reg(T2)), u64::MAX);
    assert_eq!(cpu.reg(reg(T3)), u64::MAX);
    assert_eq!(cpu.reg(reg(T4)), 5);
    assert_eq!(exit.reason, ExitReason::Ebreak);
}

#[test]
fn test_load_store_round_trip() {
    let mut program = li64(T0, 0xDEAD_BEEF_CAFE_BABE);
    program.extend([
        addi(T1, ZERO, 0x100),
        sd(T0, T1, 0),
        ld(T2, T1, 0),
        ebreak(),
    ]);
    let (cpu, exit) = run_interpreter(&program);

    assert_eq!(cpu.reg(reg(T2)), 0xDEAD_BEEF_CAFE_BABE);
    assert_eq!(exit.reason, ExitReason::Ebreak);
}

#[test]
fn test_permission_fault() {
    let program = [
        addi(T1, ZERO, 0x100),
        addi(T0, ZERO, 42),
        sw(T0, T1, 0),
        ebreak(),
    ];

    let mut vm = build_vm(&program);
    // The low page is readable only.
    vm.memory_mut()
        .set_permissions(0, 0x1000, MemoryFlags::READ)
        .unwrap();

    let mut cpu = fresh_cpu();
    let exit = vm.run(&mut cpu);

    assert_eq!(exit.reason, ExitReason::MemoryWriteFault);
    assert_eq!(exit.faulty_address, 0x100);
    assert_eq!(exit.target_register, Register::T0);
    assert_eq!(cpu.pc(), PROGRAM_BASE + 8);
}

#[test]
fn test_load_widths() {
    let mut program = li64(T0, 0x8180_8382_8584_8786);
    program.extend([
        addi(T1, ZERO, 0x100),
        sd(T0, T1, 0),
        lb(T2, T1, 0),
        lbu(T3, T1, 0),
        lh(T4, T1, 0),
        ebreak(),
    ]);
    let (cpu, exit) = run_interpreter(&program);

    assert_eq!(exit.reason, ExitReason::Ebreak);
    assert_eq!(cpu.reg(reg(T2)), 0xFFFF_FFFF_FFFF_FF86);
    assert_eq!(cpu.reg(reg(T3)), 0x86);
    assert_eq!(cpu.reg(reg(T4)), 0xFFFF_FFFF_FFFF_8786);
}

#[test]
fn test_call_and_return() {
    let program = [
        jal(RA, 12),          // call 0x1000C
        addi(A0, A0, 1),      // return lands here
        ebreak(),             // done, a0 == 6
        addi(A0, ZERO, 5),    // 0x1000C: a0 = 5
        jalr(ZERO, RA, 0),    // return
    ];
    let (cpu, exit) = run_interpreter(&program);

    assert_eq!(exit.reason, ExitReason::Ebreak);
    assert_eq!(cpu.reg(reg(A0)), 6);
    assert_eq!(cpu.reg(reg(RA)), PROGRAM_BASE + 4);
}

#[test]
fn test_undefined_instruction() {
    let program = [addi(A0, ZERO, 1), 0u32];
    let (cpu, exit) = run_interpreter(&program);

    assert_eq!(exit.reason, ExitReason::UndefinedInstruction);
    assert_eq!(cpu.pc(), PROGRAM_BASE + 4);
    assert_eq!(cpu.reg(reg(A0)), 1);
}

#[test]
fn test_unaligned_jalr_target() {
    let program = [
        addi(T0, ZERO, 0x102), // not 4-byte aligned (bit 0 would be masked)
        jalr(ZERO, T0, 0),
    ];
    let (cpu, exit) = run_interpreter(&program);

    assert_eq!(exit.reason, ExitReason::UnalignedPc);
    assert_eq!(cpu.pc(), 0x102);
}

#[test]
fn test_exit_record_defaults() {
    // Non-memory exits leave the fault fields zeroed.
    let (_, exit) = run_interpreter(&[ecall()]);
    assert_eq!(exit.faulty_address, 0);
    assert_eq!(exit.target_register, Register::Zero);
}
