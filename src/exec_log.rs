//! Execution trace log
//!
//! Per-step register diffs at `trace` level, used by `--trace`. Under the
//! JIT this relies on single-step mode so every instruction boundary is
//! observable.

use crate::cpu::{Register, RegisterState};

/// Log the registers that changed between two steps.
pub fn print_execution_step(previous: &RegisterState, current: &RegisterState) {
    for index in 0..33 {
        let reg = if index == 32 {
            Register::Pc
        } else {
            Register::from_index(index)
        };

        let old = previous.get(reg);
        let new = current.get(reg);
        if old != new {
            log::trace!("{}: {:#x} -> {:#x}", reg, old, new);
        }
    }
}
