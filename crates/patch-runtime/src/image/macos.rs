//! macOS-specific code mapping using MAP_JIT
//!
//! A single mapping with all three protections; `pthread_jit_write_protect_np`
//! toggles the W^X mode around each write.

use std::ptr::NonNull;

use libc::{
    MAP_ANONYMOUS, MAP_FAILED, MAP_JIT, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE, c_int,
    c_void, size_t,
};

use crate::error::{PatchError, PatchResult};

extern "C" {
    fn pthread_jit_write_protect_np(enabled: c_int);
    fn sys_icache_invalidate(start: *mut c_void, len: size_t);
}

/// An executable code region with W^X toggling
pub struct Mapping {
    /// Single mapping; writable and executable views share the address
    code: NonNull<u8>,
    /// Region size
    capacity: usize,
}

// Safety: Mapping owns its memory. Writes are serialized by the coordinator
// lock; reads and execution go through the same address read-only.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Allocate a MAP_JIT region of at least `capacity` bytes
    pub fn allocate(capacity: usize) -> PatchResult<Self> {
        let code = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                PROT_READ | PROT_WRITE | PROT_EXEC,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_JIT,
                -1,
                0,
            )
        };
        if code == MAP_FAILED {
            return Err(PatchError::Alloc {
                reason: format!("mmap failed: {}", std::io::Error::last_os_error()),
            });
        }

        // Safety: MAP_FAILED checked above; mmap never returns null
        let code = unsafe { NonNull::new_unchecked(code as *mut u8) };
        Ok(Self { code, capacity })
    }

    /// Base address of the executable view
    pub fn rx_base(&self) -> usize {
        self.code.as_ptr() as usize
    }

    /// Region size
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Overwrite bytes, toggling write protection around the store
    ///
    /// # Safety
    ///
    /// `offset + bytes.len()` must be within the region, and the caller must
    /// serialize writes against each other.
    pub unsafe fn write(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.capacity);
        pthread_jit_write_protect_np(0);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.code.as_ptr().add(offset), bytes.len());
        pthread_jit_write_protect_np(1);
    }

    /// Make written code visible to subsequent instruction fetches
    pub fn sync_code(&self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.capacity);
        unsafe {
            sys_icache_invalidate(self.code.as_ptr().add(offset) as *mut c_void, len);
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.code.as_ptr() as *mut c_void, self.capacity);
        }
    }
}
