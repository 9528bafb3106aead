//! RISC-V ELF64 loader
//!
//! Parses a 64-bit little-endian executable ELF and copies its PT_LOAD
//! segments into guest memory. Only the fields needed for loading are
//! touched; there is no paging, so segment flags are ignored and the driver
//! grants permissions over the whole image afterwards.

use thiserror::Error;

use crate::memory::Memory;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const PT_LOAD: u32 = 1;

const ELF64_HEADER_SIZE: usize = 0x40;
const ELF64_PHDR_SIZE: usize = 0x38;

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("file too small for an ELF64 header ({0} bytes)")]
    TooSmall(usize),

    #[error("invalid ELF magic")]
    InvalidMagic,

    #[error("image is not a 64-bit little-endian executable")]
    UnsupportedFormat,

    #[error("unexpected program header entry size {0:#x}")]
    BadProgramHeaderSize(u16),

    #[error("program header {0} is out of bounds")]
    ProgramHeaderOutOfBounds(usize),

    #[error("segment at {address:#x} has data outside the file")]
    SegmentOutOfBounds { address: u64 },

    #[error("image has no entrypoint")]
    NoEntrypoint,

    #[error("image base address {0:#x} is missing or not 4 KiB aligned")]
    BadBaseAddress(u64),

    #[error("writing segment at {address:#x} ({len:#x} bytes) into guest memory failed")]
    SegmentWrite { address: u64, len: usize },
}

/// Where the image landed in guest memory.
#[derive(Debug, Clone, Copy)]
pub struct Image {
    /// First loaded virtual address, 4 KiB aligned.
    pub base: u64,
    /// Span from `base` to the end of the highest segment, rounded up to
    /// 4 KiB.
    pub size: u64,
    pub entrypoint: u64,
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap())
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap())
}

/// Load an ELF64 executable into guest memory and report the image bounds.
pub fn load(binary: &[u8], memory: &mut Memory) -> Result<Image, ElfError> {
    if binary.len() < ELF64_HEADER_SIZE {
        return Err(ElfError::TooSmall(binary.len()));
    }

    if binary[0..4] != ELF_MAGIC {
        return Err(ElfError::InvalidMagic);
    }
    if binary[4] != ELFCLASS64 || binary[5] != ELFDATA2LSB || read_u16(binary, 0x10) != ET_EXEC {
        return Err(ElfError::UnsupportedFormat);
    }

    let entrypoint = read_u64(binary, 0x18);
    let ph_offset = read_u64(binary, 0x20);
    let phe_size = read_u16(binary, 0x36);
    let phe_count = read_u16(binary, 0x38);

    if phe_size as usize != ELF64_PHDR_SIZE {
        return Err(ElfError::BadProgramHeaderSize(phe_size));
    }
    if entrypoint == 0 {
        return Err(ElfError::NoEntrypoint);
    }

    let mut base_address = 0u64;
    let mut end_address = 0u64;

    for i in 0..phe_count as usize {
        let offset = ph_offset as usize + i * ELF64_PHDR_SIZE;
        if offset + ELF64_PHDR_SIZE > binary.len() {
            return Err(ElfError::ProgramHeaderOutOfBounds(i));
        }
        let ph = &binary[offset..offset + ELF64_PHDR_SIZE];

        if read_u32(ph, 0x00) != PT_LOAD {
            continue;
        }

        let file_offset = read_u64(ph, 0x08);
        let memory_address = read_u64(ph, 0x10);
        let file_size = read_u64(ph, 0x20);
        let memory_size = read_u64(ph, 0x28);

        if base_address == 0 {
            base_address = memory_address;
            if base_address == 0 || base_address & 0xFFF != 0 {
                return Err(ElfError::BadBaseAddress(base_address));
            }
        }

        end_address = end_address.max(memory_address.wrapping_add(memory_size));

        let data_size = file_size.min(memory_size) as usize;
        if data_size == 0 {
            continue;
        }

        let file_end = file_offset as usize + data_size;
        if file_end > binary.len() {
            return Err(ElfError::SegmentOutOfBounds {
                address: memory_address,
            });
        }

        memory
            .write(memory_address, &binary[file_offset as usize..file_end])
            .map_err(|_| ElfError::SegmentWrite {
                address: memory_address,
                len: data_size,
            })?;
    }

    if base_address == 0 {
        return Err(ElfError::BadBaseAddress(0));
    }

    let size = end_address - base_address;
    let aligned_size = (size + 0xFFF) & !0xFFF;

    Ok(Image {
        base: base_address,
        size: aligned_size,
        entrypoint,
    })
}

/// Build a minimal ELF64 RISC-V executable around `code`, for tests and
/// examples: one PT_LOAD segment at `load_addr`, entry at `entry`.
pub fn build_test_elf(code: &[u8], entry: u64, load_addr: u64) -> Vec<u8> {
    const EM_RISCV: u16 = 243;

    let code_offset = ELF64_HEADER_SIZE + ELF64_PHDR_SIZE;
    let mut elf = Vec::with_capacity(code_offset + code.len());

    // ELF header
    elf.extend_from_slice(&ELF_MAGIC);
    elf.push(ELFCLASS64);
    elf.push(ELFDATA2LSB);
    elf.push(1); // e_ident version
    elf.push(0); // OS/ABI
    elf.extend_from_slice(&[0u8; 8]); // padding
    elf.extend_from_slice(&ET_EXEC.to_le_bytes());
    elf.extend_from_slice(&EM_RISCV.to_le_bytes());
    elf.extend_from_slice(&1u32.to_le_bytes()); // e_version
    elf.extend_from_slice(&entry.to_le_bytes());
    elf.extend_from_slice(&(ELF64_HEADER_SIZE as u64).to_le_bytes()); // e_phoff
    elf.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    elf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    elf.extend_from_slice(&(ELF64_HEADER_SIZE as u16).to_le_bytes());
    elf.extend_from_slice(&(ELF64_PHDR_SIZE as u16).to_le_bytes());
    elf.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    elf.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    elf.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    elf.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

    // Program header: PT_LOAD
    elf.extend_from_slice(&PT_LOAD.to_le_bytes());
    elf.extend_from_slice(&0x5u32.to_le_bytes()); // p_flags: R+X
    elf.extend_from_slice(&(code_offset as u64).to_le_bytes()); // p_offset
    elf.extend_from_slice(&load_addr.to_le_bytes()); // p_vaddr
    elf.extend_from_slice(&load_addr.to_le_bytes()); // p_paddr
    elf.extend_from_slice(&(code.len() as u64).to_le_bytes()); // p_filesz
    elf.extend_from_slice(&(code.len() as u64).to_le_bytes()); // p_memsz
    elf.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align

    elf.extend_from_slice(code);
    elf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryFlags;

    #[test]
    fn test_build_and_load_round_trip() {
        let code = [
            0x93u8, 0x00, 0xA0, 0x02, // addi x1, x0, 42
            0x73, 0x00, 0x00, 0x00, // ecall
        ];

        let elf = build_test_elf(&code, 0x10000, 0x10000);
        let mut memory = Memory::new(0x100000);
        let image = load(&elf, &mut memory).unwrap();

        assert_eq!(image.base, 0x10000);
        assert_eq!(image.size, 0x1000);
        assert_eq!(image.entrypoint, 0x10000);
        assert_eq!(
            memory.read_u32(0x10000, MemoryFlags::empty()).unwrap(),
            0x02A0_0093
        );
    }

    #[test]
    fn test_invalid_magic_rejected() {
        let mut elf = build_test_elf(&[0; 8], 0x10000, 0x10000);
        elf[0] = 0xDE;
        let mut memory = Memory::new(0x100000);
        assert!(matches!(
            load(&elf, &mut memory),
            Err(ElfError::InvalidMagic)
        ));
    }

    #[test]
    fn test_32bit_image_rejected() {
        let mut elf = build_test_elf(&[0; 8], 0x10000, 0x10000);
        elf[4] = 1; // ELFCLASS32
        let mut memory = Memory::new(0x100000);
        assert!(matches!(
            load(&elf, &mut memory),
            Err(ElfError::UnsupportedFormat)
        ));
    }

    #[test]
    fn test_unaligned_base_rejected() {
        let elf = build_test_elf(&[0; 8], 0x10100, 0x10100);
        let mut memory = Memory::new(0x100000);
        assert!(matches!(
            load(&elf, &mut memory),
            Err(ElfError::BadBaseAddress(0x10100))
        ));
    }

    #[test]
    fn test_size_is_rounded_to_4k() {
        let code = vec![0u8; 0x1234];
        let elf = build_test_elf(&code, 0x10000, 0x10000);
        let mut memory = Memory::new(0x100000);
        let image = load(&elf, &mut memory).unwrap();
        assert_eq!(image.size, 0x2000);
    }
}
