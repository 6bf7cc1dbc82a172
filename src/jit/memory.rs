//! Executable memory management using mmap.
//!
//! Code is written while the mapping is read-write, then the mapping is
//! flipped to read-execute. It is never writable and executable at once.

use std::ptr::NonNull;

/// Error type for memory operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    AllocationFailed,
    ProtectionFailed,
    InvalidSize,
    Unsupported,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "memory allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemoryError::InvalidSize => write!(f, "invalid memory size"),
            MemoryError::Unsupported => write!(f, "executable memory is not supported on this platform"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// A block of memory allocated via mmap that holds one compiled routine.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Map a writable block large enough for `size` bytes, rounded up to
    /// whole pages.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        let page_size = Self::page_size();
        let aligned_size = (size + page_size - 1) & !(page_size - 1);
        let ptr = Self::mmap_alloc(aligned_size)?;

        Ok(Self { ptr, size: aligned_size, executable: false })
    }

    /// Copy `code` into a fresh mapping and make it executable.
    pub fn from_code(code: &[u8]) -> Result<Self, MemoryError> {
        let mut mem = Self::new(code.len())?;
        mem.write(0, code)?;
        mem.make_executable()?;
        Ok(mem)
    }

    #[cfg(unix)]
    fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }

    #[cfg(not(unix))]
    fn page_size() -> usize {
        4096
    }

    #[cfg(unix)]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn mmap_alloc(_size: usize) -> Result<NonNull<u8>, MemoryError> {
        Err(MemoryError::Unsupported)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Write bytes at `offset`. Fails once the memory is executable or if
    /// the write would overflow.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed);
        }
        if offset.checked_add(data.len()).is_none_or(|end| end > self.size) {
            return Err(MemoryError::InvalidSize);
        }

        // SAFETY: bounds checked above and the mapping is writable.
        unsafe {
            let dest = self.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len());
        }
        Ok(())
    }

    /// Flip the mapping to read-execute and synchronize the instruction
    /// cache where the architecture requires it.
    #[cfg(unix)]
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }

        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }

        flush_icache(self.ptr.as_ptr(), self.size);
        self.executable = true;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        Err(MemoryError::Unsupported)
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
fn flush_icache(start: *mut u8, len: usize) {
    unsafe extern "C" {
        fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
    }
    // SAFETY: the range is exactly the mapping owned by the caller.
    unsafe { __clear_cache(start.cast(), start.add(len).cast()) }
}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
fn flush_icache(start: *mut u8, len: usize) {
    unsafe extern "C" {
        fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
    }
    // SAFETY: the range is exactly the mapping owned by the caller.
    unsafe { sys_icache_invalidate(start.cast(), len) }
}

// x86-64 keeps instruction and data caches coherent.
#[cfg(all(unix, not(all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos")))))]
fn flush_icache(_start: *mut u8, _len: usize) {}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_rounds_to_pages() {
        let mem = ExecutableMemory::new(10).unwrap();
        assert!(mem.size() >= 10);
        assert_eq!(mem.size() % ExecutableMemory::page_size(), 0);
        assert!(!mem.is_executable());
    }

    #[test]
    fn test_zero_size_rejected() {
        assert_eq!(ExecutableMemory::new(0).err(), Some(MemoryError::InvalidSize));
    }

    #[test]
    fn test_write_bounds() {
        let mut mem = ExecutableMemory::new(16).unwrap();
        let size = mem.size();
        assert!(mem.write(0, &[0x90; 4]).is_ok());
        assert_eq!(mem.write(size - 1, &[0, 0]), Err(MemoryError::InvalidSize));
    }

    #[test]
    fn test_cannot_write_after_executable() {
        let mut mem = ExecutableMemory::from_code(&[0xC3]).unwrap();
        assert!(mem.is_executable());
        assert_eq!(mem.write(0, &[0x90]), Err(MemoryError::ProtectionFailed));
    }
}
