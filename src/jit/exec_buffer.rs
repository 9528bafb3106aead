//! Executable memory
//!
//! One region of host-executable memory, mapped at construction and never
//! resized. Writes go through `write` so the W^X transition (Apple Silicon)
//! and the instruction-cache flush always happen.

use std::ptr;

#[cfg(target_os = "macos")]
mod platform {
    use std::ffi::c_void;

    pub unsafe fn allocate_executable_memory(size: usize) -> *mut u8 {
        let p = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_EXEC | libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_JIT,
            -1,
            0,
        );
        if p == libc::MAP_FAILED {
            std::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    pub unsafe fn free_executable_memory(p: *mut u8, size: usize) {
        libc::munmap(p as *mut c_void, size);
    }

    pub unsafe fn unprotect_executable_memory() {
        #[cfg(target_arch = "aarch64")]
        libc::pthread_jit_write_protect_np(0);
    }

    pub unsafe fn protect_executable_memory() {
        #[cfg(target_arch = "aarch64")]
        libc::pthread_jit_write_protect_np(1);
    }

    extern "C" {
        fn sys_icache_invalidate(start: *mut c_void, len: usize);
    }

    pub unsafe fn flush_instruction_cache(memory: *mut u8, size: usize) {
        sys_icache_invalidate(memory as *mut c_void, size);
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use std::ffi::c_void;

    pub unsafe fn allocate_executable_memory(size: usize) -> *mut u8 {
        let p = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_EXEC | libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if p == libc::MAP_FAILED {
            std::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    pub unsafe fn free_executable_memory(p: *mut u8, size: usize) {
        libc::munmap(p as *mut c_void, size);
    }

    pub unsafe fn unprotect_executable_memory() {}

    pub unsafe fn protect_executable_memory() {}

    #[cfg(target_arch = "aarch64")]
    pub unsafe fn flush_instruction_cache(memory: *mut u8, size: usize) {
        use std::arch::asm;

        // Conservative 64-byte stride: clean the data cache to the point of
        // unification, then invalidate the instruction cache over the range.
        const LINE: usize = 64;

        let start = memory as usize & !(LINE - 1);
        let end = memory as usize + size;

        let mut line = start;
        while line < end {
            asm!("dc cvau, {0}", in(reg) line);
            line += LINE;
        }
        asm!("dsb ish");

        let mut line = start;
        while line < end {
            asm!("ic ivau, {0}", in(reg) line);
            line += LINE;
        }
        asm!("dsb ish", "isb");
    }

    #[cfg(not(target_arch = "aarch64"))]
    pub unsafe fn flush_instruction_cache(_memory: *mut u8, _size: usize) {
        // x86 keeps instruction and data caches coherent.
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
compile_error!("no executable memory support for this platform");

/// A fixed-size region of executable host memory with a safe write API.
pub struct ExecutableBuffer {
    memory: *mut u8,
    size: usize,
}

// The region never moves and all mutation goes through `write`, which the
// code buffer serializes under its insertion lock.
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

impl ExecutableBuffer {
    pub fn new(size: usize) -> Self {
        let memory = unsafe { platform::allocate_executable_memory(size) };
        assert!(
            !memory.is_null(),
            "failed to allocate {size} bytes of executable memory"
        );

        ExecutableBuffer { memory, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy `data` into the region and flush the instruction cache over the
    /// modified range.
    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(
            offset + data.len() <= self.size,
            "writing out of bounds data to executable buffer"
        );

        unsafe {
            platform::unprotect_executable_memory();
            ptr::copy_nonoverlapping(data.as_ptr(), self.memory.add(offset), data.len());
            platform::flush_instruction_cache(self.memory.add(offset), data.len());
            platform::protect_executable_memory();
        }
    }

    pub fn address(&self, offset: usize) -> *const u8 {
        debug_assert!(offset <= self.size);
        unsafe { self.memory.add(offset) }
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        unsafe { platform::free_executable_memory(self.memory, self.size) };
    }
}
