//! On-media layout of the PM region:
//!
//! ```text
//! [ primary superblock | shadow superblock |
//!   SSA (one summary per main-area block)  |
//!   SIT (one entry per segment)            |
//!   main area (segments 0..N)              ]
//! ```
//!
//! The NAT tree has no static area: its blocks are copy-on-write
//! allocations in the main area and the head checkpoint records the root.

pub mod superblock;

use std::mem::size_of;

use crate::segment::sit::RawSitEntry;
use crate::segment::ssa::RawSummary;
use crate::util::constants::*;
use crate::util::conversions;
use crate::util::memory::PmRegion;
use crate::util::{Address, BlockAddr, FsError, Result};

use superblock::RawSuperblock;

/// The resolved carve-up of a region. Everything downstream does its
/// address math through this type.
pub struct RegionLayout {
    base: Address,
    region_size: usize,
    ssa_base: u64,
    sit_base: u64,
    main_base: u64,
    main_segments: u32,
    nat_height: u8,
}

impl RegionLayout {
    /// Compute a fresh carve-up for `region_size` bytes. Chooses the
    /// largest main area such that the metadata that describes it fits in
    /// front of it.
    pub fn carve(region: &PmRegion, nat_height: u8) -> Result<RegionLayout> {
        let region_size = region.size();
        let meta_floor = 2 * BYTES_IN_BLOCK;
        if region_size <= meta_floor + BYTES_IN_SEGMENT {
            return Err(FsError::Invalid);
        }
        let mut main_segments = (region_size - meta_floor) / BYTES_IN_SEGMENT;
        loop {
            if main_segments < 2 {
                return Err(FsError::Invalid);
            }
            let main_blocks = conversions::segments_to_blocks(main_segments);
            let ssa_bytes =
                conversions::raw_align_up(main_blocks * size_of::<RawSummary>(), BYTES_IN_BLOCK);
            let sit_bytes =
                conversions::raw_align_up(main_segments * size_of::<RawSitEntry>(), BYTES_IN_BLOCK);
            let main_base = meta_floor + ssa_bytes + sit_bytes;
            if main_base + main_segments * BYTES_IN_SEGMENT <= region_size {
                return Ok(RegionLayout {
                    base: region.base(),
                    region_size,
                    ssa_base: meta_floor as u64,
                    sit_base: (meta_floor + ssa_bytes) as u64,
                    main_base: main_base as u64,
                    main_segments: main_segments as u32,
                    nat_height,
                });
            }
            main_segments -= 1;
        }
    }

    /// Rebuild the layout recorded by a (validated) superblock.
    pub fn from_super(region: &PmRegion, sb: &RawSuperblock) -> Result<RegionLayout> {
        if sb.block_size_bits as usize != LOG_BYTES_IN_BLOCK
            || sb.blocks_per_seg_bits as usize != LOG_BLOCKS_IN_SEGMENT
            || sb.nat_height == 0
            || sb.nat_height > MAX_NAT_HEIGHT
        {
            return Err(FsError::Invalid);
        }
        let layout = RegionLayout {
            base: region.base(),
            region_size: region.size(),
            ssa_base: u64::from_le(sb.ssa_base),
            sit_base: u64::from_le(sb.sit_base),
            main_base: u64::from_le(sb.main_base),
            main_segments: u32::from_le(sb.main_segments),
            nat_height: sb.nat_height,
        };
        let main_end =
            layout.main_base + ((layout.main_segments as u64) << LOG_BYTES_IN_SEGMENT);
        if main_end > layout.region_size as u64 {
            return Err(FsError::Invalid);
        }
        Ok(layout)
    }

    /// Fill the layout fields of a superblock being formatted.
    pub fn fill_super(&self, sb: &mut RawSuperblock) {
        sb.magic = SUPER_MAGIC.to_le();
        sb.ssa_base = self.ssa_base.to_le();
        sb.sit_base = self.sit_base.to_le();
        sb.main_base = self.main_base.to_le();
        sb.main_segments = self.main_segments.to_le();
        sb.segments_per_section = 1u32.to_le();
        sb.user_block_count = (self.main_blocks() as u64).to_le();
        sb.block_size_bits = LOG_BYTES_IN_BLOCK as u8;
        sb.blocks_per_seg_bits = LOG_BLOCKS_IN_SEGMENT as u8;
        sb.nat_height = self.nat_height;
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn main_segments(&self) -> u32 {
        self.main_segments
    }

    pub fn main_blocks(&self) -> usize {
        conversions::segments_to_blocks(self.main_segments as usize)
    }

    pub fn nat_height(&self) -> u8 {
        self.nat_height
    }

    pub fn main_base(&self) -> u64 {
        self.main_base
    }

    pub fn ssa_base(&self) -> Address {
        self.base + self.ssa_base as usize
    }

    pub fn sit_base(&self) -> Address {
        self.base + self.sit_base as usize
    }

    /// Translate a logical block address to a virtual address.
    pub fn addr(&self, l: BlockAddr) -> Address {
        debug_assert!((l.as_raw() as usize) < self.region_size);
        self.base + l.as_raw() as usize
    }

    /// Translate a virtual address inside the region back to its logical
    /// block address.
    pub fn l_addr(&self, a: Address) -> BlockAddr {
        debug_assert!(a >= self.base && a - self.base < self.region_size);
        BlockAddr::from_raw((a - self.base) as u64)
    }

    /// Is this logical address a block in the main area?
    pub fn is_main_addr(&self, l: BlockAddr) -> bool {
        let raw = l.as_raw();
        raw >= self.main_base
            && raw < self.main_base + (self.main_blocks() << LOG_BYTES_IN_BLOCK) as u64
            && conversions::raw_is_aligned(raw as usize, BYTES_IN_BLOCK)
    }

    pub fn seg_coord(&self, l: BlockAddr) -> conversions::SegCoord {
        conversions::seg_coord(l, self.main_base)
    }

    pub fn seg_addr(&self, segno: u32, blkoff: u16) -> BlockAddr {
        conversions::seg_addr(segno, blkoff, self.main_base)
    }

    pub fn block_index(&self, l: BlockAddr) -> usize {
        conversions::block_index(l, self.main_base)
    }
}
