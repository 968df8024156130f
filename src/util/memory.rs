//! Mapping and raw access to the PM region.
//!
//! The medium is assumed to be a persistent, byte-addressable,
//! cache-coherent region that the embedder maps into the address space
//! (a DAX mapping, typically). For tests and experiments this module can
//! also stand up an anonymous volatile mapping of the same shape.

use crate::util::constants::BYTES_IN_BLOCK;
use crate::util::{Address, FsError, Result};

/// Set a range of memory to 0.
pub fn zero(start: Address, len: usize) {
    set(start, 0, len);
}

/// Set a range of memory to the given value. Similar to memset.
pub fn set(start: Address, val: u8, len: usize) {
    unsafe {
        std::ptr::write_bytes(start.to_mut_ptr::<u8>(), val, len);
    }
}

/// Copy a block-sized payload between two mapped addresses.
pub fn copy(dst: Address, src: Address, len: usize) {
    unsafe {
        std::ptr::copy_nonoverlapping(src.to_ptr::<u8>(), dst.to_mut_ptr::<u8>(), len);
    }
}

/// A contiguous mapped PM region. Owns the mapping if it created one.
pub struct PmRegion {
    base: Address,
    size: usize,
    owned: bool,
}

impl PmRegion {
    /// Wrap a region the embedder has already mapped. The region must stay
    /// mapped for the lifetime of this value.
    ///
    /// # Safety
    /// `base..base+size` must be a valid, writable mapping.
    pub unsafe fn from_raw(base: Address, size: usize) -> Result<Self> {
        if base.is_zero() || !base.is_aligned_to(BYTES_IN_BLOCK) || size < BYTES_IN_BLOCK {
            return Err(FsError::Invalid);
        }
        Ok(PmRegion {
            base,
            size,
            owned: false,
        })
    }

    /// Map an anonymous volatile region. Used by tests and demos where no
    /// real PM is present.
    pub fn map_anonymous(size: usize) -> Result<Self> {
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
            error!("failed to mmap an anonymous region of {} bytes", size);
            return Err(FsError::NoSpace);
        }
        Ok(PmRegion {
            base: Address::from_ptr(ptr as *const u8),
            size,
            owned: true,
        })
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for PmRegion {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                libc::munmap(self.base.to_mut_ptr(), self.size);
            }
        }
    }
}

// The region is plain memory; all synchronization lives in the managers
// layered above it.
unsafe impl Send for PmRegion {}
unsafe impl Sync for PmRegion {}
