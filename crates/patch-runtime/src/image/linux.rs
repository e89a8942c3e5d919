//! Linux-specific code mapping using memfd + dual mmap
//!
//! The region is mapped twice from the same backing memory: an RW alias the
//! patch engine writes through, and an RX alias everything else reads and
//! executes. Code never becomes writable through the address executors see.

use std::{ffi::CString, os::unix::io::RawFd, ptr::NonNull};

use libc::{
    MAP_FAILED, MAP_SHARED, PROT_EXEC, PROT_READ, PROT_WRITE, c_char, c_uint, c_void, off_t,
};

use crate::error::{PatchError, PatchResult};

extern "C" {
    fn memfd_create(name: *const c_char, flags: c_uint) -> RawFd;
    #[cfg(target_arch = "aarch64")]
    fn __clear_cache(start: *mut c_void, end: *mut c_void);
}

/// memfd_create flags
const MFD_CLOEXEC: c_uint = 0x0001;

/// A dual-mapped executable code region
pub struct Mapping {
    /// Writable alias, used only by the patch engine
    code_rw: NonNull<u8>,
    /// Executable alias (same backing memory)
    code_rx: NonNull<u8>,
    /// File descriptor for the code region
    code_fd: RawFd,
    /// Region size
    capacity: usize,
}

// Safety: Mapping owns its memory. Writes go through the RW alias only from
// the patch engine, which the coordinator serializes behind its lock; the RX
// alias is read-only.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Allocate a dual-mapped region of at least `capacity` bytes
    pub fn allocate(capacity: usize) -> PatchResult<Self> {
        let alloc_err = |what: &str| PatchError::Alloc {
            reason: format!("{what} failed: {}", std::io::Error::last_os_error()),
        };

        let name = CString::new("patch-image").expect("static name");
        let code_fd = unsafe { memfd_create(name.as_ptr(), MFD_CLOEXEC) };
        if code_fd < 0 {
            return Err(alloc_err("memfd_create"));
        }

        if unsafe { libc::ftruncate(code_fd, capacity as off_t) } < 0 {
            let err = alloc_err("ftruncate");
            unsafe { libc::close(code_fd) };
            return Err(err);
        }

        // RW alias for patching
        let code_rw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                code_fd,
                0,
            )
        };
        if code_rw == MAP_FAILED {
            let err = alloc_err("mmap RW");
            unsafe { libc::close(code_fd) };
            return Err(err);
        }

        // RX alias for execution - same backing memory
        let code_rx = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                PROT_READ | PROT_EXEC,
                MAP_SHARED,
                code_fd,
                0,
            )
        };
        if code_rx == MAP_FAILED {
            let err = alloc_err("mmap RX");
            unsafe {
                libc::munmap(code_rw, capacity);
                libc::close(code_fd);
            }
            return Err(err);
        }

        // Safety: mmap returns MAP_FAILED on error, never null; both checked.
        let code_rw = unsafe { NonNull::new_unchecked(code_rw as *mut u8) };
        let code_rx = unsafe { NonNull::new_unchecked(code_rx as *mut u8) };

        Ok(Self {
            code_rw,
            code_rx,
            code_fd,
            capacity,
        })
    }

    /// Base address of the executable alias
    pub fn rx_base(&self) -> usize {
        self.code_rx.as_ptr() as usize
    }

    /// Region size
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Overwrite bytes through the writable alias
    ///
    /// # Safety
    ///
    /// `offset + bytes.len()` must be within the region, and the caller must
    /// serialize writes against each other.
    pub unsafe fn write(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.capacity);
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            self.code_rw.as_ptr().add(offset),
            bytes.len(),
        );
    }

    /// Make written code visible to subsequent instruction fetches
    #[cfg(target_arch = "aarch64")]
    pub fn sync_code(&self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.capacity);
        unsafe {
            __clear_cache(
                self.code_rx.as_ptr().add(offset) as *mut c_void,
                self.code_rx.as_ptr().add(offset + len) as *mut c_void,
            );
        }
    }

    /// Make written code visible to subsequent instruction fetches
    ///
    /// x86 keeps instruction caches coherent with data writes; a full fence
    /// orders the write before the logical-state publish that follows.
    #[cfg(not(target_arch = "aarch64"))]
    pub fn sync_code(&self, _offset: usize, _len: usize) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.code_rw.as_ptr() as *mut c_void, self.capacity);
            libc::munmap(self.code_rx.as_ptr() as *mut c_void, self.capacity);
            libc::close(self.code_fd);
        }
    }
}
