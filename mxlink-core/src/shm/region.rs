//! SharedMemoryRegion - the mapping both processors address.
//!
//! Wraps `mmap` for either an anonymous shared mapping (host and simulated
//! co-processor in one process) or a named POSIX shared memory object (peer
//! in another process). All raw mapping calls are encapsulated here.

use std::ffi::CString;
use std::ptr::NonNull;

use crate::error::RegionError;

/// Represents a mapped shared memory region.
///
/// This struct owns the mapping and will unmap it on drop. The region
/// allocator carves ring buffers and cursor words out of it.
pub struct SharedMemoryRegion {
    /// Name of the shared memory object, empty for anonymous mappings.
    name: String,
    /// Pointer to the mapped memory.
    ptr: NonNull<u8>,
    /// Size of the mapped region in bytes.
    size: usize,
    /// File descriptor for named objects.
    fd: Option<i32>,
    /// Whether this instance created the named object (and should unlink on drop).
    is_owner: bool,
}

// SAFETY: SharedMemoryRegion owns its mapping; the pointer is valid on any thread.
unsafe impl Send for SharedMemoryRegion {}

// SAFETY: Concurrent access to the bytes is coordinated by the ring cursors,
// which are atomics living inside the region.
unsafe impl Sync for SharedMemoryRegion {}

impl SharedMemoryRegion {
    /// Minimum size for a shared memory region.
    pub const MIN_SIZE: usize = 4096;

    /// Maximum size for a shared memory region (256 MB).
    pub const MAX_SIZE: usize = 256 * 1024 * 1024;

    fn check_size(name: &str, size: usize) -> Result<(), RegionError> {
        if size < Self::MIN_SIZE {
            return Err(RegionError::CreateFailed {
                name: name.to_string(),
                reason: format!("Size {} is below minimum {}", size, Self::MIN_SIZE),
            });
        }
        if size > Self::MAX_SIZE {
            return Err(RegionError::CreateFailed {
                name: name.to_string(),
                reason: format!("Size {} exceeds maximum {}", size, Self::MAX_SIZE),
            });
        }
        Ok(())
    }

    /// Map an anonymous shared region of `size` bytes, zero-initialised.
    pub fn anonymous(size: usize) -> Result<Self, RegionError> {
        Self::check_size("<anonymous>", size)?;

        // SAFETY: anonymous mapping, no fd, size validated
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(RegionError::MapFailed {
                reason: format!("mmap failed: {}", std::io::Error::last_os_error()),
            });
        }

        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| RegionError::MapFailed {
            reason: "mmap returned null".to_string(),
        })?;

        tracing::debug!(size = size, "Mapped anonymous shared region");

        Ok(Self {
            name: String::new(),
            ptr,
            size,
            fd: None,
            is_owner: false,
        })
    }

    /// Create a new named shared memory region.
    ///
    /// # Errors
    /// Returns RegionError if the object already exists, or creation or
    /// mapping fails.
    pub fn create(name: &str, size: usize) -> Result<Self, RegionError> {
        Self::check_size(name, size)?;

        if name.is_empty() {
            return Err(RegionError::CreateFailed {
                name: name.to_string(),
                reason: "Name cannot be empty".to_string(),
            });
        }

        let c_name = Self::c_name(name)?;

        // SAFETY: c_name is a valid CString, flags are valid POSIX flags
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };

        if fd < 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::EEXIST) {
                return Err(RegionError::CreateFailed {
                    name: name.to_string(),
                    reason: "Shared memory already exists".to_string(),
                });
            }
            return Err(RegionError::CreateFailed {
                name: name.to_string(),
                reason: format!("shm_open failed: {}", errno),
            });
        }

        // SAFETY: fd is a valid file descriptor
        let result = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if result < 0 {
            let errno = std::io::Error::last_os_error();
            // SAFETY: fd is ours and c_name names the object we just created
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(RegionError::CreateFailed {
                name: name.to_string(),
                reason: format!("ftruncate failed: {}", errno),
            });
        }

        let ptr = match Self::map_fd(fd, size) {
            Ok(ptr) => ptr,
            Err(e) => {
                // SAFETY: fd is ours and c_name names the object we just created
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(c_name.as_ptr());
                }
                return Err(e);
            }
        };

        // SAFETY: ptr is valid for size bytes
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0, size);
        }

        tracing::debug!(name = %name, size = size, "Created shared memory region");

        Ok(Self {
            name: name.to_string(),
            ptr,
            size,
            fd: Some(fd),
            is_owner: true,
        })
    }

    /// Open an existing named shared memory region.
    pub fn open(name: &str, size: usize) -> Result<Self, RegionError> {
        Self::check_size(name, size)?;

        let c_name = Self::c_name(name)?;

        // SAFETY: c_name is a valid CString
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };

        if fd < 0 {
            return Err(RegionError::CreateFailed {
                name: name.to_string(),
                reason: format!("shm_open failed: {}", std::io::Error::last_os_error()),
            });
        }

        let ptr = Self::map_fd(fd, size).inspect_err(|_| {
            // SAFETY: fd was opened above
            unsafe { libc::close(fd) };
        })?;

        tracing::debug!(name = %name, size = size, "Opened shared memory region");

        Ok(Self {
            name: name.to_string(),
            ptr,
            size,
            fd: Some(fd),
            is_owner: false,
        })
    }

    fn c_name(name: &str) -> Result<CString, RegionError> {
        CString::new(format!("/{}", name)).map_err(|e| RegionError::CreateFailed {
            name: name.to_string(),
            reason: format!("Invalid name: {}", e),
        })
    }

    fn map_fd(fd: i32, size: usize) -> Result<NonNull<u8>, RegionError> {
        // SAFETY: fd is valid, size is validated, offset 0 is valid
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(RegionError::MapFailed {
                reason: format!("mmap failed: {}", std::io::Error::last_os_error()),
            });
        }

        NonNull::new(ptr as *mut u8).ok_or_else(|| RegionError::MapFailed {
            reason: "mmap returned null".to_string(),
        })
    }

    /// Get the name of this shared memory region (empty when anonymous).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the size of this shared memory region.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get a raw pointer to the shared memory.
    ///
    /// Callers must coordinate access through the ring cursors.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Check whether `ptr` points inside the mapping.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self.ptr.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.size
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        // SAFETY: ptr and size were set during creation
        let result = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size) };
        if result < 0 {
            tracing::error!(
                name = %self.name,
                error = %std::io::Error::last_os_error(),
                "Failed to unmap shared memory"
            );
        }

        if let Some(fd) = self.fd {
            // SAFETY: fd was opened during creation
            unsafe { libc::close(fd) };
        }

        if self.is_owner {
            if let Ok(c_name) = Self::c_name(&self.name) {
                // SAFETY: c_name is a valid CString
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                tracing::debug!(name = %self.name, "Unlinked shared memory region");
            }
        }
    }
}
