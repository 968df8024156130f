//! The on-media superblock.
//!
//! The superblock is double-buffered in the first two blocks of the
//! region. The two copies are written in order: primary first, shadow
//! after the primary's checksum verifies. Mount prefers the primary and
//! falls back to the shadow, healing whichever copy is behind.

use bytemuck::{Pod, Zeroable};
use std::mem::size_of;
use std::sync::atomic::AtomicU64;

use crate::util::checksum::crc32;
use crate::util::constants::*;
use crate::util::{Address, BlockAddr};

/// Fixed-width little-endian superblock. All `u64` addresses are logical
/// block addresses (offsets from the region base).
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct RawSuperblock {
    pub magic: u32,
    pub checksum: u32,
    /// The head checkpoint. Updated with a single 8-byte atomic store
    /// during the commit pointer swing.
    pub cp_page_addr: u64,
    pub user_block_count: u64,
    pub ssa_base: u64,
    pub sit_base: u64,
    pub main_base: u64,
    pub main_segments: u32,
    pub segments_per_section: u32,
    pub block_size_bits: u8,
    pub blocks_per_seg_bits: u8,
    pub nat_height: u8,
    _pad: [u8; 5],
}

static_assertions::assert_eq_size!(RawSuperblock, [u8; 64]);
// The pointer swing stores this field atomically; it must be 8-byte aligned.
const _: () = assert!(std::mem::offset_of!(RawSuperblock, cp_page_addr) % 8 == 0);

impl RawSuperblock {
    pub fn compute_checksum(&self) -> u32 {
        let mut copy = *self;
        copy.checksum = 0;
        crc32(bytemuck::bytes_of(&copy))
    }

    pub fn is_valid(&self) -> bool {
        self.magic == SUPER_MAGIC.to_le() && u32::from_le(self.checksum) == self.compute_checksum()
    }

    pub fn seal(&mut self) {
        self.checksum = 0;
        self.checksum = self.compute_checksum().to_le();
    }

    pub fn cp_addr(&self) -> BlockAddr {
        BlockAddr::from_raw(u64::from_le(self.cp_page_addr))
    }

    /// The atomic cell backing `cp_page_addr`, for the commit pointer swing.
    ///
    /// # Safety
    /// The caller must hold `cp_mutex`; only the checkpoint writer and
    /// mount-time recovery may store through this cell.
    pub unsafe fn cp_addr_cell(&self) -> &AtomicU64 {
        &*(&self.cp_page_addr as *const u64 as *const AtomicU64)
    }
}

/// Media offsets of the two superblock copies.
pub const PRIMARY_SUPER_OFFSET: usize = 0;
pub const SHADOW_SUPER_OFFSET: usize = BYTES_IN_BLOCK;

/// Reference the primary (0) or shadow (1) superblock of a mapped region.
///
/// # Safety
/// `base` must be the base of a mapped region at least two blocks long.
pub unsafe fn raw_super(base: Address, which: usize) -> &'static RawSuperblock {
    debug_assert!(which < 2);
    (base + which * BYTES_IN_BLOCK).as_ref::<RawSuperblock>()
}
