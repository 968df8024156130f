//! The segment manager: space allocation from the two current segments,
//! per-segment accounting (SIT), the per-block summary area (SSA) and the
//! free/prefree maps.

pub mod curseg;
pub mod segmap;
pub mod sit;
pub mod ssa;

use enum_map::{enum_map, EnumMap};
use atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::global_state::GlobalState;
use crate::layout::RegionLayout;
use crate::util::constants::*;
use crate::util::{BlockAddr, Result};

use curseg::{CursegInfo, CursegType};
use segmap::FreeSegmapInfo;
use sit::SitInfo;
use ssa::{Ssa, SumType, Summary};

pub struct SegmentManager {
    layout: Arc<RegionLayout>,
    state: Arc<GlobalState>,
    pub sit: SitInfo,
    pub ssa: Ssa,
    pub free: FreeSegmapInfo,
    curseg: EnumMap<CursegType, Mutex<CursegInfo>>,
    ovp_segments: u32,
    limit_invalid_blocks: u64,
    limit_free_blocks: u64,
    severe_free_blocks: u64,
}

impl SegmentManager {
    pub fn new(layout: Arc<RegionLayout>, state: Arc<GlobalState>, elapsed_time: u64) -> Self {
        let segments = layout.main_segments() as usize;
        let user_blocks = layout.main_blocks() as u64;
        let ovp_segments = (segments / 20).max(2) as u32;
        SegmentManager {
            sit: SitInfo::new(segments, elapsed_time),
            ssa: Ssa::new(layout.ssa_base(), layout.main_blocks()),
            free: FreeSegmapInfo::new(segments),
            curseg: enum_map! { _ => Mutex::new(CursegInfo::unset()) },
            ovp_segments,
            limit_invalid_blocks: user_blocks * LIMIT_INVALID_BLOCKS as u64 / 100,
            limit_free_blocks: user_blocks * LIMIT_FREE_BLOCKS as u64 / 100,
            severe_free_blocks: user_blocks * SEVERE_FREE_BLOCKS as u64 / 100,
            layout,
            state,
        }
    }

    /// Point a stream at a (already in-use) segment position and reserve
    /// its preallocated successor. Used at format and mount. A full
    /// region leaves the reservation empty; allocation retries it.
    pub fn init_curseg(&self, ty: CursegType, segno: u32, next_blkoff: u16) {
        let next_segno = self.free.get_new_segment(segno).unwrap_or(NULL_SEGNO);
        *self.curseg[ty].lock().unwrap() = CursegInfo::new(segno, next_blkoff, next_segno);
    }

    /// The first block offset in `segno` at or after `from` with no valid
    /// block at or after it. Mount uses this to keep the bump pointer
    /// clear of blocks a crashed GC pass had already relocated past the
    /// recorded stream position.
    pub fn first_free_blkoff(&self, segno: u32, from: u16) -> u16 {
        let base = (segno as usize) << LOG_BLOCKS_IN_SEGMENT;
        let mut off = from;
        for blk in (from as usize)..BLOCKS_IN_SEGMENT {
            if self.ssa.is_valid(base + blk) {
                off = blk as u16 + 1;
            }
        }
        off
    }

    /// Re-derive both streams' bump pointers from the summary bits.
    pub fn fixup_curseg_positions(&self) {
        for stream in self.curseg.values() {
            let mut curseg = stream.lock().unwrap();
            if curseg.segno != NULL_SEGNO {
                curseg.next_blkoff = self.first_free_blkoff(curseg.segno, curseg.next_blkoff);
            }
        }
    }

    pub fn curseg_info(&self, ty: CursegType) -> CursegInfo {
        *self.curseg[ty].lock().unwrap()
    }

    pub fn is_current_segment(&self, segno: u32) -> bool {
        self.curseg
            .values()
            .any(|stream| stream.lock().unwrap().segno == segno)
    }

    pub fn mtime_now(&self) -> u32 {
        self.sit.get_mtime() as u32
    }

    /// Allocate one block from a stream and write its summary (valid bit
    /// clear). The block belongs exclusively to the caller until the
    /// publishing checkpoint commits.
    pub fn allocate_block(
        &self,
        ty: CursegType,
        nid: u32,
        ofs_in_node: u16,
        sum_type: SumType,
        version: u32,
    ) -> Result<BlockAddr> {
        debug_assert_eq!(sum_type.is_data_stream(), ty == CursegType::Data);
        let (addr, segno) = {
            let mut curseg = self.curseg[ty].lock().unwrap();
            if curseg.next_blkoff as usize == BLOCKS_IN_SEGMENT {
                // Promote the preallocated segment and reserve a new one.
                if curseg.next_segno == NULL_SEGNO {
                    curseg.next_segno = self.free.get_new_segment(curseg.segno)?;
                }
                curseg.segno = curseg.next_segno;
                curseg.next_blkoff = 0;
                curseg.next_segno = match self.free.get_new_segment(curseg.segno) {
                    Ok(segno) => segno,
                    Err(_) => NULL_SEGNO,
                };
            }
            let addr = self.layout.seg_addr(curseg.segno, curseg.next_blkoff);
            curseg.next_blkoff += 1;
            (addr, curseg.segno)
        };
        self.ssa
            .make_entry(self.layout.block_index(addr), nid, version, ofs_in_node, sum_type);
        self.sit
            .update_sit_entry(segno, 1, Some(self.mtime_now()));
        self.state.alloc_block_count.fetch_add(1, Ordering::Relaxed);
        if sum_type.is_user() {
            self.state.valid_block_count.fetch_add(1, Ordering::Relaxed);
        }
        trace!("allocated {} ({:?}) for nid {} ofs {}", addr, sum_type, nid, ofs_in_node);
        Ok(addr)
    }

    /// Invalidate a block: clear its summary valid bit, decrement the
    /// segment's valid count, and mark the segment prefree when the count
    /// reaches zero.
    pub fn invalidate_block(&self, addr: BlockAddr) -> Result<()> {
        let index = self.layout.block_index(addr);
        let sum = self.ssa.read(index)?;
        self.ssa.clear_valid(index);
        let coord = self.layout.seg_coord(addr);
        let remaining = self
            .sit
            .update_sit_entry(coord.segno, -1, Some(self.mtime_now()));
        if sum.ty.is_user() {
            self.state.valid_block_count.fetch_sub(1, Ordering::Relaxed);
        }
        if remaining == 0 && !self.is_current_segment(coord.segno) {
            self.free.mark_prefree(coord.segno);
            trace!("segment {} is now prefree", coord.segno);
        }
        Ok(())
    }

    pub fn summary_of(&self, addr: BlockAddr) -> Result<Summary> {
        self.ssa.read(self.layout.block_index(addr))
    }

    pub fn set_summary_valid(&self, addr: BlockAddr) {
        self.ssa.set_valid(self.layout.block_index(addr));
    }

    // Pressure predicates driving GC.

    pub fn free_segments(&self) -> u32 {
        self.free.free_segments()
    }

    pub fn free_user_blocks(&self) -> u64 {
        let free = self.free_segments() as u64;
        let ovp = self.ovp_segments as u64;
        free.saturating_sub(ovp) << LOG_BLOCKS_IN_SEGMENT
    }

    /// Is there enough garbage for a background GC pass to be worthwhile?
    pub fn has_enough_invalid_blocks(&self) -> bool {
        self.state.invalid_user_blocks() > self.limit_invalid_blocks
            && self.free_user_blocks() < self.limit_free_blocks
    }

    pub fn has_not_enough_free_segs(&self) -> bool {
        self.free_user_blocks() < self.limit_free_blocks
    }

    pub fn need_deep_scan(&self) -> bool {
        self.free_user_blocks() < self.severe_free_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::small_region;

    fn manager() -> (
        crate::util::memory::PmRegion,
        Arc<RegionLayout>,
        Arc<GlobalState>,
        SegmentManager,
    ) {
        let region = small_region();
        let layout = Arc::new(RegionLayout::carve(&region, DEFAULT_NAT_HEIGHT).unwrap());
        let state = Arc::new(GlobalState::new(layout.main_blocks() as u64, false));
        let sm = SegmentManager::new(layout.clone(), state.clone(), 0);
        (region, layout, state, sm)
    }

    #[test]
    fn bump_allocation_is_dense_within_a_segment() {
        let (_region, layout, _state, sm) = manager();
        let segno = sm.free.get_new_segment(NULL_SEGNO).unwrap();
        sm.init_curseg(CursegType::Data, segno, 0);
        let a = sm
            .allocate_block(CursegType::Data, 1, 0, SumType::Data, 1)
            .unwrap();
        let b = sm
            .allocate_block(CursegType::Data, 1, 1, SumType::Data, 1)
            .unwrap();
        assert_eq!(layout.seg_coord(a).blkoff + 1, layout.seg_coord(b).blkoff);
        assert_eq!(sm.sit.get_valid_blocks(segno), 2);
    }

    #[test]
    fn stream_rolls_into_preallocated_segment() {
        let (_region, layout, _state, sm) = manager();
        let segno = sm.free.get_new_segment(NULL_SEGNO).unwrap();
        sm.init_curseg(CursegType::Node, segno, 0);
        for i in 0..=BLOCKS_IN_SEGMENT {
            sm.allocate_block(CursegType::Node, i as u32, 0, SumType::Inode, 1)
                .unwrap();
        }
        let cur = sm.curseg_info(CursegType::Node);
        assert_ne!(cur.segno, segno);
        assert_eq!(cur.next_blkoff, 1);
        assert_ne!(cur.next_segno, NULL_SEGNO);
        let _ = layout;
    }

    #[test]
    fn invalidating_last_block_makes_segment_prefree() {
        let (_region, _layout, state, sm) = manager();
        let segno = sm.free.get_new_segment(NULL_SEGNO).unwrap();
        sm.init_curseg(CursegType::Data, segno, 0);
        let addr = sm
            .allocate_block(CursegType::Data, 1, 0, SumType::Data, 1)
            .unwrap();
        // Move the stream away so the segment is no longer current.
        let far = sm.free.get_new_segment(segno).unwrap();
        sm.init_curseg(CursegType::Data, far, 0);
        sm.invalidate_block(addr).unwrap();
        assert!(sm.free.is_prefree(segno));
        assert_eq!(state.valid_block_count.load(Ordering::Relaxed), 0);
    }
}
