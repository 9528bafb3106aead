//! Register cache
//!
//! Pins guest GPRs into host callee-saved registers for the duration of one
//! block so sequential instructions avoid the in-memory register file.
//! Slots are evicted least-recently-used; dirty evictees are stored back.
//! The zero register is never cached, it maps to `xzr` directly.

use dynasm::dynasm;
use dynasmrt::aarch64::Aarch64Relocation;
use dynasmrt::{DynasmApi, VecAssembler};

use crate::cpu::Register;

use super::regs::{CACHE_REGISTERS, REGISTER_STATE, XZR};

type Asm = VecAssembler<Aarch64Relocation>;

pub(super) const CACHE_SIZE: usize = CACHE_REGISTERS.len();

const INVALID_SLOT: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    reg: Register,
    locked: bool,
    dirty: bool,
    last_use: u32,
}

/// Which slots held dirty guest registers at a point in the block; 0 (the
/// zero register) marks an empty entry.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct StateSnapshot {
    registers: [u8; CACHE_SIZE],
}

pub(super) struct RegisterCache {
    slots: [Slot; CACHE_SIZE],
    register_to_slot: [u16; 33],
    host_to_slot: [u16; 32],
    free_slots: Vec<u16>,
    clock: u32,
}

fn register_offset(reg: Register) -> u32 {
    (reg.index() * 8) as u32
}

impl RegisterCache {
    pub fn new() -> Self {
        let mut host_to_slot = [INVALID_SLOT; 32];
        for (slot, &host) in CACHE_REGISTERS.iter().enumerate() {
            host_to_slot[host as usize] = slot as u16;
        }

        RegisterCache {
            slots: [Slot::default(); CACHE_SIZE],
            register_to_slot: [INVALID_SLOT; 33],
            host_to_slot,
            free_slots: (0..CACHE_SIZE as u16).collect(),
            clock: 0,
        }
    }

    fn emit_register_load(asm: &mut Asm, host: u32, reg: Register) {
        dynasm!(asm ; .arch aarch64 ; ldr X(host), [X(REGISTER_STATE), register_offset(reg)]);
    }

    fn emit_register_store(asm: &mut Asm, reg: Register, host: u32) {
        dynasm!(asm ; .arch aarch64 ; str X(host), [X(REGISTER_STATE), register_offset(reg)]);
    }

    fn acquire_cache_slot(&mut self) -> u16 {
        self.free_slots
            .pop()
            .expect("cannot acquire slot: register cache is full")
    }

    /// Evict `count` least-recently-used unlocked slots.
    fn free_cache_slots(&mut self, asm: &mut Asm, count: usize) {
        let mut available: Vec<u16> = (0..CACHE_SIZE as u16)
            .filter(|&i| !self.slots[i as usize].locked && self.slots[i as usize].reg != Register::Zero)
            .collect();

        assert!(
            available.len() >= count,
            "not enough register cache slots to evict {count} registers"
        );

        available.sort_by_key(|&i| self.slots[i as usize].last_use);

        for &slot_id in available.iter().take(count) {
            let slot = self.slots[slot_id as usize];

            if slot.dirty {
                Self::emit_register_store(asm, slot.reg, CACHE_REGISTERS[slot_id as usize]);
            }

            self.register_to_slot[slot.reg.index()] = INVALID_SLOT;
            self.slots[slot_id as usize] = Slot::default();
            self.free_slots.push(slot_id);
        }
    }

    /// Make room for every register in `regs` before any of them is loaded,
    /// so eviction cannot displace a register that is itself an input.
    fn reserve_registers(&mut self, asm: &mut Asm, regs: &[Register]) {
        let mut missing = 0u64;

        for &reg in regs {
            if reg == Register::Zero {
                continue;
            }

            let slot_id = self.register_to_slot[reg.index()];
            if slot_id != INVALID_SLOT {
                self.slots[slot_id as usize].locked = true;
            } else {
                missing |= 1 << reg.index();
            }
        }

        let missing_count = missing.count_ones() as usize;
        if missing_count > self.free_slots.len() {
            let needed = missing_count - self.free_slots.len();
            self.free_cache_slots(asm, needed);
        }
    }

    fn lock_reserved_register(&mut self, asm: &mut Asm, reg: Register) -> u32 {
        if reg == Register::Zero {
            return XZR;
        }

        let slot_id = self.register_to_slot[reg.index()];
        if slot_id != INVALID_SLOT {
            let slot = &mut self.slots[slot_id as usize];
            slot.locked = true;
            slot.last_use = self.clock;
            return CACHE_REGISTERS[slot_id as usize];
        }

        let slot_id = self.acquire_cache_slot();
        self.slots[slot_id as usize] = Slot {
            reg,
            locked: true,
            dirty: false,
            last_use: self.clock,
        };
        self.register_to_slot[reg.index()] = slot_id;

        let host = CACHE_REGISTERS[slot_id as usize];
        Self::emit_register_load(asm, host, reg);
        host
    }

    /// Pin one guest register, loading it if it is not already cached.
    pub fn lock_register(&mut self, asm: &mut Asm, reg: Register) -> u32 {
        self.reserve_registers(asm, &[reg]);
        self.lock_reserved_register(asm, reg)
    }

    /// Pin several guest registers at once.
    pub fn lock_registers<const N: usize>(
        &mut self,
        asm: &mut Asm,
        regs: [Register; N],
    ) -> [u32; N] {
        self.reserve_registers(asm, &regs);
        regs.map(|reg| self.lock_reserved_register(asm, reg))
    }

    pub fn unlock_register(&mut self, host: u32, make_dirty: bool) {
        if host == XZR {
            return;
        }

        let slot_id = self.host_to_slot[host as usize];
        assert!(
            slot_id != INVALID_SLOT,
            "cannot unlock host register x{host} that is not part of the register cache"
        );

        let slot = &mut self.slots[slot_id as usize];
        slot.locked = false;
        slot.dirty |= make_dirty;
    }

    pub fn unlock_register_dirty(&mut self, host: u32) {
        self.unlock_register(host, true);
    }

    /// Capture which slots currently hold dirty registers, for a pending
    /// exit pad emitted later.
    pub fn take_state_snapshot(&self) -> StateSnapshot {
        let mut snapshot = StateSnapshot::default();

        for (i, slot) in self.slots.iter().enumerate() {
            if slot.reg != Register::Zero && slot.dirty {
                snapshot.registers[i] = slot.reg.index() as u8;
            }
        }

        snapshot
    }

    /// Emit stores for every dirty slot in the snapshot. Compile-time cache
    /// state is untouched: the stores only happen on the path that reaches
    /// the pad.
    pub fn flush_registers(asm: &mut Asm, snapshot: &StateSnapshot) {
        for (i, &reg_index) in snapshot.registers.iter().enumerate() {
            if reg_index != 0 {
                let reg = Register::from_index(reg_index as u32);
                Self::emit_register_store(asm, reg, CACHE_REGISTERS[i]);
            }
        }
    }

    /// Emit stores for everything dirty right now (block terminators).
    pub fn flush_current_registers(&self, asm: &mut Asm) {
        let snapshot = self.take_state_snapshot();
        Self::flush_registers(asm, &snapshot);
    }

    /// End-of-instruction bookkeeping: every slot must be unlocked again.
    pub fn finish_instruction(&mut self) {
        for slot in &self.slots {
            assert!(
                !slot.locked,
                "register {} is locked when finishing the instruction",
                slot.reg
            );
        }
        self.clock += 1;
    }
}
