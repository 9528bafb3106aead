//! Translation cache
//!
//! Maps 4-byte-aligned guest PCs to offsets into one executable buffer.
//! Slot value 0 means "not yet translated"; the bump cursor starts at 16 so
//! no legitimate installation ever lands at offset 0. Published entries are
//! immutable for the lifetime of the buffer and there is no eviction.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use bitflags::bitflags;

use super::exec_buffer::ExecutableBuffer;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CodeBufferFlags: u32 {
        /// Publication and lookup use release/acquire ordering so one
        /// emulator can populate the buffer while another reads it.
        const MULTITHREADED = 1 << 0;
        /// Emitted memory accesses omit the permission mask check (bounds
        /// are still checked).
        const SKIP_PERMISSION_CHECKS = 1 << 1;
    }
}

const BLOCK_SIZE: u64 = 4;
const CODE_ALIGNMENT: usize = 16;

pub struct CodeBuffer {
    flags: CodeBufferFlags,
    block_to_offset: Box<[AtomicU32]>,
    executable_buffer: ExecutableBuffer,
    next_free_offset: Mutex<usize>,
}

impl CodeBuffer {
    /// `total_size` bytes of executable memory for blocks translated from
    /// guest PCs below `max_executable_guest_address`.
    pub fn new(
        flags: CodeBufferFlags,
        total_size: usize,
        max_executable_guest_address: u64,
    ) -> Self {
        let max_blocks = (max_executable_guest_address + BLOCK_SIZE - 1) / BLOCK_SIZE;
        let block_to_offset = (0..max_blocks).map(|_| AtomicU32::new(0)).collect();

        CodeBuffer {
            flags,
            block_to_offset,
            executable_buffer: ExecutableBuffer::new(total_size),
            next_free_offset: Mutex::new(CODE_ALIGNMENT),
        }
    }

    pub fn flags(&self) -> CodeBufferFlags {
        self.flags
    }

    pub fn max_block_count(&self) -> usize {
        self.block_to_offset.len()
    }

    fn load_ordering(&self) -> Ordering {
        if self.flags.contains(CodeBufferFlags::MULTITHREADED) {
            Ordering::Acquire
        } else {
            Ordering::Relaxed
        }
    }

    /// Host code for `guest_address`, if already installed. Misaligned
    /// addresses have no slot and return `None`.
    pub fn get(&self, guest_address: u64) -> Option<*const u8> {
        if guest_address & (BLOCK_SIZE - 1) != 0 {
            return None;
        }

        let block = (guest_address / BLOCK_SIZE) as usize;
        let slot = self.block_to_offset.get(block)?;

        match slot.load(self.load_ordering()) {
            0 => None,
            offset => Some(self.executable_buffer.address(offset as usize)),
        }
    }

    /// Bump-allocate 16-byte-aligned space and copy `code` in. Caller holds
    /// the insertion lock.
    fn allocate_executable_memory(&self, cursor: &mut usize, code: &[u8]) -> usize {
        let start = (*cursor + CODE_ALIGNMENT - 1) & !(CODE_ALIGNMENT - 1);
        let end = start + code.len();

        assert!(
            end <= self.executable_buffer.size(),
            "out of executable memory in the jit code buffer"
        );

        self.executable_buffer.write(start, code);
        *cursor = end;

        start
    }

    /// Install the block for `guest_address`. If a concurrent insertion won
    /// the race, the winner's pointer is returned and `code` is discarded.
    pub fn insert(&self, guest_address: u64, code: &[u8]) -> *const u8 {
        assert!(
            guest_address & (BLOCK_SIZE - 1) == 0,
            "guest address {guest_address:#x} is misaligned"
        );

        let mut cursor = self.next_free_offset.lock().unwrap();

        if let Some(existing) = self.get(guest_address) {
            return existing;
        }

        let offset = self.allocate_executable_memory(&mut cursor, code);

        let block = (guest_address / BLOCK_SIZE) as usize;
        let ordering = if self.flags.contains(CodeBufferFlags::MULTITHREADED) {
            Ordering::Release
        } else {
            Ordering::Relaxed
        };
        self.block_to_offset[block].store(offset as u32, ordering);

        self.executable_buffer.address(offset)
    }

    /// Allocate code without publishing it in the translation table, for
    /// the trampoline and other out-of-line helpers.
    pub fn insert_standalone(&self, code: &[u8]) -> *const u8 {
        let mut cursor = self.next_free_offset.lock().unwrap();
        let offset = self.allocate_executable_memory(&mut cursor, code);
        self.executable_buffer.address(offset)
    }

    /// Base of the translation table, for inline lookups in emitted code.
    pub fn block_translation_table(&self) -> *const u32 {
        self.block_to_offset.as_ptr() as *const u32
    }

    /// Base of the executable region, for inline lookups in emitted code.
    pub fn code_buffer_base(&self) -> *const u8 {
        self.executable_buffer.address(0)
    }

    /// Number of published blocks; used by cache-warmness tests.
    pub fn installed_block_count(&self) -> usize {
        self.block_to_offset
            .iter()
            .filter(|slot| slot.load(Ordering::Relaxed) != 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_misses() {
        let buffer = CodeBuffer::new(CodeBufferFlags::empty(), 0x1000, 0x1000);
        assert!(buffer.get(0x100).is_none());
        // Misaligned PCs have no slot at all.
        assert!(buffer.get(0x102).is_none());
        // Beyond the executable range.
        assert!(buffer.get(0x2000).is_none());
    }

    #[test]
    fn test_insert_and_get() {
        let buffer = CodeBuffer::new(CodeBufferFlags::empty(), 0x1000, 0x1000);

        let code = [0xC3u8]; // any bytes; never executed here
        let installed = buffer.insert(0x100, &code);
        assert_eq!(buffer.get(0x100), Some(installed));
        assert_eq!(buffer.installed_block_count(), 1);

        // Losing insertions return the already-installed pointer.
        let again = buffer.insert(0x100, &[0x90u8; 4]);
        assert_eq!(again, installed);
        assert_eq!(buffer.installed_block_count(), 1);
    }

    #[test]
    fn test_offset_zero_is_reserved() {
        let buffer = CodeBuffer::new(CodeBufferFlags::empty(), 0x1000, 0x1000);
        let first = buffer.insert(0, &[0x90u8; 4]);
        // The first insertion starts at the alignment boundary, not 0, so a
        // published offset of 0 can always mean "absent".
        assert_eq!(first as usize - buffer.code_buffer_base() as usize, 16);
        assert!(buffer.get(0).is_some());
    }

    #[test]
    fn test_standalone_is_not_published() {
        let buffer = CodeBuffer::new(CodeBufferFlags::empty(), 0x1000, 0x1000);
        buffer.insert_standalone(&[0x90u8; 16]);
        assert_eq!(buffer.installed_block_count(), 0);
    }

    #[test]
    fn test_insertions_are_aligned() {
        let buffer = CodeBuffer::new(CodeBufferFlags::empty(), 0x1000, 0x1000);
        let a = buffer.insert(0x0, &[0x90u8; 3]);
        let b = buffer.insert(0x4, &[0x90u8; 5]);
        assert_eq!(a as usize % 16, 0);
        assert_eq!(b as usize % 16, 0);
        assert_eq!(b as usize - a as usize, 16);
    }

    #[test]
    #[should_panic(expected = "misaligned")]
    fn test_misaligned_insert_panics() {
        let buffer = CodeBuffer::new(CodeBufferFlags::empty(), 0x1000, 0x1000);
        buffer.insert(0x102, &[0x90u8]);
    }
}
