//! Guest memory
//!
//! A flat byte array with a parallel per-byte permission bitmap. The
//! permission array is the shared contract between the interpreter and the
//! JIT: emitted code checks the same bytes the interpreter checks.

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Per-byte permission flags. An access of width `w` requires the bit on
    /// every one of the `w` permission bytes it touches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    #[error("access of {len} bytes at {address:#x} is out of bounds")]
    OutOfBounds { address: u64, len: usize },

    #[error("permission check failed for access at {address:#x}")]
    AccessDenied { address: u64 },
}

/// Flat guest memory of a fixed size, all permissions initially clear.
pub struct Memory {
    contents: Vec<u8>,
    permissions: Vec<u8>,
}

impl Memory {
    pub fn new(size: usize) -> Self {
        Memory {
            contents: vec![0u8; size],
            permissions: vec![0u8; size],
        }
    }

    pub fn size(&self) -> u64 {
        self.contents.len() as u64
    }

    /// Base pointer of the contents array, for the JIT context block.
    pub fn contents_ptr(&mut self) -> *mut u8 {
        self.contents.as_mut_ptr()
    }

    /// Base pointer of the permission array, for the JIT context block.
    pub fn permissions_ptr(&self) -> *const u8 {
        self.permissions.as_ptr()
    }

    /// Bounds check for `[address, address + len)`, overflow-safe.
    fn check_range(&self, address: u64, len: usize) -> Result<usize, MemoryError> {
        let end = address
            .checked_add(len as u64)
            .ok_or(MemoryError::OutOfBounds { address, len })?;
        if end > self.size() {
            return Err(MemoryError::OutOfBounds { address, len });
        }
        Ok(address as usize)
    }

    pub fn read(&self, address: u64, data: &mut [u8]) -> Result<(), MemoryError> {
        let start = self.check_range(address, data.len())?;
        data.copy_from_slice(&self.contents[start..start + data.len()]);
        Ok(())
    }

    pub fn write(&mut self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        let start = self.check_range(address, data.len())?;
        self.contents[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read_checked(
        &self,
        address: u64,
        data: &mut [u8],
        flags: MemoryFlags,
    ) -> Result<(), MemoryError> {
        let start = self.check_range(address, data.len())?;
        if !self.permissions_hold(start, data.len(), flags) {
            return Err(MemoryError::AccessDenied { address });
        }
        data.copy_from_slice(&self.contents[start..start + data.len()]);
        Ok(())
    }

    pub fn write_checked(
        &mut self,
        address: u64,
        data: &[u8],
        flags: MemoryFlags,
    ) -> Result<(), MemoryError> {
        let start = self.check_range(address, data.len())?;
        if !self.permissions_hold(start, data.len(), flags) {
            return Err(MemoryError::AccessDenied { address });
        }
        self.contents[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn verify_permissions(&self, address: u64, len: usize, flags: MemoryFlags) -> bool {
        match self.check_range(address, len) {
            Ok(start) => self.permissions_hold(start, len, flags),
            Err(_) => false,
        }
    }

    /// Overwrite the permission byte for every address in range with exactly
    /// `flags`.
    pub fn set_permissions(
        &mut self,
        address: u64,
        len: usize,
        flags: MemoryFlags,
    ) -> Result<(), MemoryError> {
        let start = self.check_range(address, len)?;
        self.permissions[start..start + len].fill(flags.bits());
        Ok(())
    }

    fn permissions_hold(&self, start: usize, len: usize, flags: MemoryFlags) -> bool {
        let required = flags.bits();
        self.permissions[start..start + len]
            .iter()
            .all(|p| p & required == required)
    }
}

macro_rules! int_accessors {
    ($read:ident, $write:ident, $ty:ty) => {
        impl Memory {
            /// Little-endian typed access; empty `flags` skips the
            /// permission check (bounds are always checked).
            pub fn $read(&self, address: u64, flags: MemoryFlags) -> Result<$ty, MemoryError> {
                let mut bytes = [0u8; std::mem::size_of::<$ty>()];
                if flags.is_empty() {
                    self.read(address, &mut bytes)?;
                } else {
                    self.read_checked(address, &mut bytes, flags)?;
                }
                Ok(<$ty>::from_le_bytes(bytes))
            }

            pub fn $write(
                &mut self,
                address: u64,
                value: $ty,
                flags: MemoryFlags,
            ) -> Result<(), MemoryError> {
                let bytes = value.to_le_bytes();
                if flags.is_empty() {
                    self.write(address, &bytes)
                } else {
                    self.write_checked(address, &bytes, flags)
                }
            }
        }
    };
}

int_accessors!(read_u8, write_u8, u8);
int_accessors!(read_u16, write_u16, u16);
int_accessors!(read_u32, write_u32, u32);
int_accessors!(read_u64, write_u64, u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_round_trip() {
        let mut mem = Memory::new(0x1000);

        mem.write_u32(0x100, 0xDEADBEEF, MemoryFlags::empty()).unwrap();
        assert_eq!(mem.read_u32(0x100, MemoryFlags::empty()).unwrap(), 0xDEADBEEF);

        mem.write_u8(0x104, 0x42, MemoryFlags::empty()).unwrap();
        assert_eq!(mem.read_u8(0x104, MemoryFlags::empty()).unwrap(), 0x42);
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let mut mem = Memory::new(0x1000);

        assert!(mem.write_u32(0xFFE, 1, MemoryFlags::empty()).is_err());
        assert!(mem.read_u8(0x1000, MemoryFlags::empty()).is_err());

        // Overflowing address + len must not wrap around.
        assert!(mem.read_u32(u64::MAX - 1, MemoryFlags::empty()).is_err());

        // The failed write leaves memory unchanged.
        assert_eq!(mem.read_u8(0xFFE, MemoryFlags::empty()).unwrap(), 0);
        assert_eq!(mem.read_u8(0xFFF, MemoryFlags::empty()).unwrap(), 0);
    }

    #[test]
    fn test_permissions_cover_every_byte() {
        let mut mem = Memory::new(0x1000);
        mem.set_permissions(0x100, 0x10, MemoryFlags::READ | MemoryFlags::WRITE)
            .unwrap();

        assert!(mem.write_u64(0x100, 1, MemoryFlags::WRITE).is_ok());
        assert!(mem.read_u64(0x100, MemoryFlags::READ).is_ok());

        // The last byte of the access falls outside the granted range.
        assert_eq!(
            mem.read_u64(0x109, MemoryFlags::READ),
            Err(MemoryError::AccessDenied { address: 0x109 })
        );

        // No execute bit was granted.
        assert!(mem.read_u32(0x100, MemoryFlags::EXECUTE).is_err());
    }

    #[test]
    fn test_set_permissions_overwrites() {
        let mut mem = Memory::new(0x1000);
        mem.set_permissions(0, 0x1000, MemoryFlags::all()).unwrap();
        mem.set_permissions(0x10, 0x10, MemoryFlags::READ).unwrap();

        assert!(mem.verify_permissions(0x10, 0x10, MemoryFlags::READ));
        assert!(!mem.verify_permissions(0x10, 1, MemoryFlags::WRITE));
        assert!(mem.verify_permissions(0x20, 8, MemoryFlags::all()));
    }

    #[test]
    fn test_unaligned_access_allowed() {
        let mut mem = Memory::new(0x1000);
        mem.write_u64(0x101, 0x0102030405060708, MemoryFlags::empty()).unwrap();
        assert_eq!(
            mem.read_u64(0x101, MemoryFlags::empty()).unwrap(),
            0x0102030405060708
        );
        assert_eq!(mem.read_u8(0x101, MemoryFlags::empty()).unwrap(), 0x08);
    }
}
