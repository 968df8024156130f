//! Free and prefree segment maps.
//!
//! `free_segmap` has a set bit for every in-use segment (current, dirty
//! and prefree segments included); `prefree_segmap` marks the subset that
//! lost its last valid block since the last checkpoint and becomes free
//! when the next checkpoint commits.

use std::sync::RwLock;

use crate::util::bitmap::Bitmap;
use crate::util::constants::NULL_SEGNO;
use crate::util::{FsError, Result};

struct FreeSegmap {
    /// 1 = in use.
    free_segmap: Bitmap,
    prefree_segmap: Bitmap,
    free_segments: u32,
}

pub struct FreeSegmapInfo {
    inner: RwLock<FreeSegmap>,
}

impl FreeSegmapInfo {
    pub fn new(segments: usize) -> Self {
        FreeSegmapInfo {
            inner: RwLock::new(FreeSegmap {
                free_segmap: Bitmap::new(segments),
                prefree_segmap: Bitmap::new(segments),
                free_segments: segments as u32,
            }),
        }
    }

    pub fn free_segments(&self) -> u32 {
        self.inner.read().unwrap().free_segments
    }

    pub fn prefree_segments(&self) -> u32 {
        self.inner.read().unwrap().prefree_segmap.count_set() as u32
    }

    pub fn is_inuse(&self, segno: u32) -> bool {
        self.inner.read().unwrap().free_segmap.get(segno as usize)
    }

    pub fn is_prefree(&self, segno: u32) -> bool {
        self.inner.read().unwrap().prefree_segmap.get(segno as usize)
    }

    /// Find the next in-use segment at or after `start`.
    pub fn find_next_inuse(&self, start: u32) -> Option<u32> {
        self.inner
            .read()
            .unwrap()
            .free_segmap
            .next_set(start as usize)
            .map(|bit| bit as u32)
    }

    /// Mark a segment in use without going through allocation, for format
    /// and mount-time rebuilds.
    pub fn set_inuse(&self, segno: u32) {
        let mut inner = self.inner.write().unwrap();
        if !inner.free_segmap.set(segno as usize) {
            inner.free_segments -= 1;
        }
    }

    /// Claim a free segment near (but preferably not adjacent to) `hint`
    /// and mark it in use. Wraps around once; fails with `NoSpace` when no
    /// bit is free.
    pub fn get_new_segment(&self, hint: u32) -> Result<u32> {
        let mut inner = self.inner.write().unwrap();
        let total = inner.free_segmap.len();
        let start = if hint == NULL_SEGNO { 0 } else { (hint as usize + 1) % total };
        let first = match inner.free_segmap.next_clear(start) {
            Some(bit) => Some(bit),
            None => inner.free_segmap.next_clear(0),
        };
        let mut chosen = first.ok_or(FsError::NoSpace)?;
        // Leaving the segment right after the current one free improves
        // the locality of later GC passes. Take it only as a last resort.
        if hint != NULL_SEGNO && chosen == (hint as usize + 1) % total {
            let alternative = match inner.free_segmap.next_clear(chosen + 1) {
                Some(bit) => Some(bit),
                None => {
                    let wrapped = inner.free_segmap.next_clear(0);
                    wrapped.filter(|&bit| bit != chosen)
                }
            };
            if let Some(alternative) = alternative {
                chosen = alternative;
            }
        }
        inner.free_segmap.set(chosen);
        inner.free_segments -= 1;
        Ok(chosen as u32)
    }

    /// Mark a fully-invalidated segment prefree. It stays in use until the
    /// next checkpoint reclaims it.
    pub fn mark_prefree(&self, segno: u32) {
        let mut inner = self.inner.write().unwrap();
        debug_assert!(inner.free_segmap.get(segno as usize));
        inner.prefree_segmap.set(segno as usize);
    }

    /// Replace the maps wholesale from an in-use set. Used by mount after
    /// recovery settles the SIT.
    pub fn rebuild(&self, inuse: impl Iterator<Item = u32>) {
        let mut inner = self.inner.write().unwrap();
        let total = inner.free_segmap.len();
        inner.free_segmap.clear_all();
        inner.prefree_segmap.clear_all();
        let mut used = 0;
        for segno in inuse {
            if !inner.free_segmap.set(segno as usize) {
                used += 1;
            }
        }
        inner.free_segments = (total - used) as u32;
    }

    /// Reclaim every prefree segment. Called once per checkpoint commit.
    /// Returns the number of segments freed.
    pub fn reclaim_prefree(&self) -> u32 {
        let mut inner = self.inner.write().unwrap();
        let prefree: Vec<usize> = inner.prefree_segmap.iter_set().collect();
        for segno in &prefree {
            inner.prefree_segmap.clear(*segno);
            inner.free_segmap.clear(*segno);
            inner.free_segments += 1;
        }
        prefree.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_avoids_the_adjacent_segment() {
        let free = FreeSegmapInfo::new(8);
        let a = free.get_new_segment(NULL_SEGNO).unwrap();
        assert_eq!(a, 0);
        // Hinting with segment 0 should skip segment 1 while 2 is free.
        let b = free.get_new_segment(0).unwrap();
        assert_eq!(b, 2);
        assert_eq!(free.free_segments(), 6);
    }

    #[test]
    fn allocation_wraps_and_exhausts() {
        let free = FreeSegmapInfo::new(3);
        for _ in 0..3 {
            free.get_new_segment(1).unwrap();
        }
        assert_eq!(free.get_new_segment(1), Err(FsError::NoSpace));
    }

    #[test]
    fn prefree_lifecycle() {
        let free = FreeSegmapInfo::new(4);
        let segno = free.get_new_segment(NULL_SEGNO).unwrap();
        free.mark_prefree(segno);
        assert!(free.is_inuse(segno));
        assert_eq!(free.free_segments(), 3);
        assert_eq!(free.reclaim_prefree(), 1);
        assert!(!free.is_inuse(segno));
        assert_eq!(free.free_segments(), 4);
    }
}
