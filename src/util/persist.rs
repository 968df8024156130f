//! Persistence barriers.
//!
//! Writes that cross a commit boundary must reach the persistence domain
//! in order: the checkpoint body (and its inlined journal and orphan
//! blocks) before the superblock pointer swing. On x86-64 this is a
//! cache-line writeback of the touched range followed by an sfence; on
//! other targets we fall back to a compiler/CPU ordering fence, which is
//! sufficient for the volatile test media.

use crate::util::constants::BYTES_IN_CACHELINE;
use crate::util::Address;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Write the cache lines covering `[addr, addr + len)` back to the
        /// persistence domain and order them before later stores.
        pub fn persist_range(addr: Address, len: usize) {
            let start = addr.as_usize() & !(BYTES_IN_CACHELINE - 1);
            let end = addr.as_usize() + len;
            let mut line = start;
            while line < end {
                unsafe { std::arch::x86_64::_mm_clflush(line as *const u8) };
                line += BYTES_IN_CACHELINE;
            }
            unsafe { std::arch::x86_64::_mm_sfence() };
        }

        /// Order all previous stores before any later store.
        pub fn fence() {
            unsafe { std::arch::x86_64::_mm_sfence() };
        }
    } else {
        pub fn persist_range(_addr: Address, _len: usize) {
            std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        }

        pub fn fence() {
            std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        }
    }
}

/// Persist one 8-byte pointer cell.
pub fn persist_u64(addr: Address) {
    persist_range(addr, 8);
}
