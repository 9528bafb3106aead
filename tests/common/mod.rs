//! Shared helpers for the integration suites: RV64 instruction encoders and
//! program runners for both execution engines.

#![allow(dead_code)]

use std::sync::Arc;

use rvjit::jit::{CodeBuffer, CodeBufferFlags};
use rvjit::{Cpu, Exit, Memory, MemoryFlags, Register, Vm};

pub const PROGRAM_BASE: u64 = 0x10000;
pub const PROGRAM_REGION: usize = 0x1000;
pub const MEMORY_SIZE: usize = 32 * 1024 * 1024;

// Register indices, ABI names.
pub const ZERO: u32 = 0;
pub const RA: u32 = 1;
pub const SP: u32 = 2;
pub const T0: u32 = 5;
pub const T1: u32 = 6;
pub const T2: u32 = 7;
pub const A0: u32 = 10;
pub const A1: u32 = 11;
pub const T3: u32 = 28;
pub const T4: u32 = 29;

fn i_type(opcode: u32, funct3: u32, rd: u32, rs1: u32, imm: i32) -> u32 {
    assert!((-2048..=2047).contains(&imm));
    ((imm as u32 & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn r_type(opcode: u32, funct3: u32, funct7: u32, rd: u32, rs1: u32, rs2: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn s_type(funct3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    assert!((-2048..=2047).contains(&imm));
    let imm = imm as u32 & 0xFFF;
    ((imm >> 5) << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | ((imm & 0x1F) << 7) | 0x23
}

fn b_type(funct3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    assert!(imm % 2 == 0 && (-4096..=4094).contains(&imm));
    let imm = imm as u32 & 0x1FFF;
    (((imm >> 12) & 1) << 31)
        | (((imm >> 5) & 0x3F) << 25)
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | (((imm >> 1) & 0xF) << 8)
        | (((imm >> 11) & 1) << 7)
        | 0x63
}

fn j_type(rd: u32, imm: i32) -> u32 {
    assert!(imm % 2 == 0);
    let imm = imm as u32 & 0x1F_FFFF;
    (((imm >> 20) & 1) << 31)
        | (((imm >> 1) & 0x3FF) << 21)
        | (((imm >> 11) & 1) << 20)
        | (((imm >> 12) & 0xFF) << 12)
        | (rd << 7)
        | 0x6F
}

pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(0x13, 0b000, rd, rs1, imm)
}

pub fn addiw(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(0x1B, 0b000, rd, rs1, imm)
}

pub fn ori(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(0x13, 0b110, rd, rs1, imm)
}

pub fn slli(rd: u32, rs1: u32, shamt: u32) -> u32 {
    i_type(0x13, 0b001, rd, rs1, shamt as i32)
}

pub fn lui(rd: u32, imm20: u32) -> u32 {
    (imm20 << 12) | (rd << 7) | 0x37
}

pub fn auipc(rd: u32, imm20: u32) -> u32 {
    (imm20 << 12) | (rd << 7) | 0x17
}

pub fn add(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(0x33, 0b000, 0, rd, rs1, rs2)
}

pub fn sub(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(0x33, 0b000, 0b010_0000, rd, rs1, rs2)
}

pub fn sll(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(0x33, 0b001, 0, rd, rs1, rs2)
}

pub fn mul(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(0x33, 0b000, 1, rd, rs1, rs2)
}

pub fn mulh(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(0x33, 0b001, 1, rd, rs1, rs2)
}

pub fn div(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(0x33, 0b100, 1, rd, rs1, rs2)
}

pub fn divu(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(0x33, 0b101, 1, rd, rs1, rs2)
}

pub fn rem(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(0x33, 0b110, 1, rd, rs1, rs2)
}

pub fn lb(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(0x03, 0b000, rd, rs1, imm)
}

pub fn lh(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(0x03, 0b001, rd, rs1, imm)
}

pub fn lw(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(0x03, 0b010, rd, rs1, imm)
}

pub fn ld(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(0x03, 0b011, rd, rs1, imm)
}

pub fn lbu(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(0x03, 0b100, rd, rs1, imm)
}

pub fn lhu(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(0x03, 0b101, rd, rs1, imm)
}

pub fn lwu(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(0x03, 0b110, rd, rs1, imm)
}

pub fn sb(rs2: u32, rs1: u32, imm: i32) -> u32 {
    s_type(0b000, rs1, rs2, imm)
}

pub fn sh(rs2: u32, rs1: u32, imm: i32) -> u32 {
    s_type(0b001, rs1, rs2, imm)
}

pub fn sw(rs2: u32, rs1: u32, imm: i32) -> u32 {
    s_type(0b010, rs1, rs2, imm)
}

pub fn sd(rs2: u32, rs1: u32, imm: i32) -> u32 {
    s_type(0b011, rs1, rs2, imm)
}

pub fn beq(rs1: u32, rs2: u32, imm: i32) -> u32 {
    b_type(0b000, rs1, rs2, imm)
}

pub fn bne(rs1: u32, rs2: u32, imm: i32) -> u32 {
    b_type(0b001, rs1, rs2, imm)
}

pub fn blt(rs1: u32, rs2: u32, imm: i32) -> u32 {
    b_type(0b100, rs1, rs2, imm)
}

pub fn jal(rd: u32, imm: i32) -> u32 {
    j_type(rd, imm)
}

pub fn jalr(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(0x67, 0b000, rd, rs1, imm)
}

pub fn ecall() -> u32 {
    0x0000_0073
}

pub fn ebreak() -> u32 {
    0x0010_0073
}

/// Load an arbitrary 64-bit constant, one byte at a time.
pub fn li64(rd: u32, value: u64) -> Vec<u32> {
    let mut words = vec![addi(rd, ZERO, ((value >> 56) & 0xFF) as i32)];
    for shift in (0..56).step_by(8).rev() {
        words.push(slli(rd, rd, 8));
        words.push(ori(rd, rd, ((value >> shift) & 0xFF) as i32));
    }
    words
}

pub fn reg(index: u32) -> Register {
    Register::from_index(index)
}

fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Guest memory with the program installed at `PROGRAM_BASE` (RWX) and a
/// low R+W page at `[0, 0x1000)`.
pub fn build_vm(words: &[u32]) -> Vm {
    let mut vm = Vm::new(MEMORY_SIZE);
    install_program(vm.memory_mut(), words);
    vm
}

pub fn install_program(memory: &mut Memory, words: &[u32]) {
    memory
        .write(PROGRAM_BASE, &words_to_bytes(words))
        .expect("program does not fit");
    memory
        .set_permissions(0, 0x1000, MemoryFlags::READ | MemoryFlags::WRITE)
        .unwrap();
    memory
        .set_permissions(PROGRAM_BASE, PROGRAM_REGION, MemoryFlags::all())
        .unwrap();
}

pub fn fresh_cpu() -> Cpu {
    let mut cpu = Cpu::new();
    cpu.set_reg(Register::Sp, PROGRAM_BASE - 8);
    cpu.set_reg(Register::Pc, PROGRAM_BASE);
    cpu
}

pub fn test_code_buffer() -> Arc<CodeBuffer> {
    Arc::new(CodeBuffer::new(
        CodeBufferFlags::empty(),
        0x10_0000,
        PROGRAM_BASE + PROGRAM_REGION as u64,
    ))
}

pub fn run_interpreter(words: &[u32]) -> (Cpu, Exit) {
    let mut vm = build_vm(words);
    let mut cpu = fresh_cpu();
    let exit = vm.run(&mut cpu);
    (cpu, exit)
}

pub fn run_jit(words: &[u32]) -> (Cpu, Exit) {
    run_jit_with_code_buffer(words, test_code_buffer())
}

pub fn run_jit_with_code_buffer(words: &[u32], code_buffer: Arc<CodeBuffer>) -> (Cpu, Exit) {
    let mut vm = build_vm(words);
    assert!(
        vm.use_jit(code_buffer, None, false),
        "no JIT backend for this host"
    );
    let mut cpu = fresh_cpu();
    let exit = vm.run(&mut cpu);
    (cpu, exit)
}
