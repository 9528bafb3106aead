//! JIT code dump
//!
//! Optional telemetry stream of every generated block, for offline
//! disassembly. Header: magic and host architecture, both u32 LE; then one
//! `{ guest_pc, size, code bytes }` record per block, flushed as written.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

const DUMP_MAGIC: u32 = 0xAB77_3ACF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Architecture {
    AArch64 = 1,
    X64 = 2,
}

impl Architecture {
    /// The host architecture, when a JIT backend exists for it.
    pub fn host() -> Option<Architecture> {
        if cfg!(target_arch = "aarch64") {
            Some(Architecture::AArch64)
        } else if cfg!(target_arch = "x86_64") {
            Some(Architecture::X64)
        } else {
            None
        }
    }
}

pub struct CodeDump {
    file: File,
}

impl CodeDump {
    pub fn create(path: &Path, architecture: Architecture) -> io::Result<Self> {
        let mut file = File::create(path)?;
        file.write_all(&DUMP_MAGIC.to_le_bytes())?;
        file.write_all(&(architecture as u32).to_le_bytes())?;
        Ok(CodeDump { file })
    }

    pub fn write(&mut self, pc: u64, code: &[u8]) -> io::Result<()> {
        self.file.write_all(&pc.to_le_bytes())?;
        self.file.write_all(&(code.len() as u64).to_le_bytes())?;
        self.file.write_all(code)?;
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_format() {
        let dir = std::env::temp_dir().join("rvjit-code-dump-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dump.bin");

        let mut dump = CodeDump::create(&path, Architecture::X64).unwrap();
        dump.write(0x10000, &[0xAA, 0xBB]).unwrap();
        drop(dump);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], &DUMP_MAGIC.to_le_bytes());
        assert_eq!(&bytes[4..8], &2u32.to_le_bytes());
        assert_eq!(&bytes[8..16], &0x10000u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &2u64.to_le_bytes());
        assert_eq!(&bytes[24..], &[0xAA, 0xBB]);

        std::fs::remove_file(&path).ok();
    }
}
