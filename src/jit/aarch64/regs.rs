//! AArch64 register allocation
//!
//! Fixed assignment shared by the trampoline and the block compiler. The
//! context lives in x0..x7, scratch in x8..x10, the register cache in the
//! callee-saved-heavy x11..x27 range, and x28 carries the trampoline block
//! pointer across the entrypoint call. x18 (platform), x29 and x30 are
//! never touched by generated code except for the final `ret` through x30.

pub const REGISTER_STATE: u32 = 0;
pub const MEMORY_BASE: u32 = 1;
pub const PERMISSIONS_BASE: u32 = 2;
pub const MEMORY_SIZE: u32 = 3;
pub const BLOCK_BASE: u32 = 4;
pub const MAX_EXECUTABLE_PC: u32 = 5;
pub const CODE_BASE: u32 = 6;
pub const BASE_PC: u32 = 7;

pub const A_SCRATCH: u32 = 8;
pub const B_SCRATCH: u32 = 9;
pub const C_SCRATCH: u32 = 10;

pub const TRAMPOLINE_BLOCK: u32 = 28;

// Exits reuse the first two context registers on the way out.
pub const EXIT_REASON: u32 = 0;
pub const EXIT_PC: u32 = 1;

pub const XZR: u32 = 31;

// x18 is skipped (platform register), x28 carries the trampoline block.
pub const CACHE_REGISTERS: [u32; 16] = [
    11, 12, 13, 14, 15, 16, 17, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];
