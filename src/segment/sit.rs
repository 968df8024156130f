//! Segment Info Table: per-segment valid-block counts and modification
//! times, plus the dirty set the next checkpoint must flush.

use bytemuck::{Pod, Zeroable};
use std::mem::size_of;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::layout::RegionLayout;
use crate::util::bitmap::Bitmap;
use crate::util::constants::*;
use crate::util::persist;

/// The persisted per-segment entry.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct RawSitEntry {
    pub vblocks: u16,
    _pad: u16,
    pub mtime: u32,
}

static_assertions::assert_eq_size!(RawSitEntry, [u8; 8]);

impl RawSitEntry {
    pub fn new(vblocks: u16, mtime: u32) -> Self {
        RawSitEntry {
            vblocks: vblocks.to_le(),
            _pad: 0,
            mtime: mtime.to_le(),
        }
    }
}

/// The volatile per-segment entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegEntry {
    pub valid_blocks: u16,
    pub mtime: u32,
}

struct SitInner {
    sentries: Vec<SegEntry>,
    dirty: Bitmap,
    dirty_count: u32,
    min_mtime: u32,
    max_mtime: u32,
}

/// The in-memory SIT. A single lock serializes writers; readers of single
/// counts go through the same lock but hold it only for the lookup.
pub struct SitInfo {
    inner: Mutex<SitInner>,
    /// Seconds the filesystem had been mounted before this mount.
    elapsed_time: u64,
    /// Wall-clock seconds at mount.
    mounted_time: u64,
}

fn wall_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl SitInfo {
    pub fn new(segments: usize, elapsed_time: u64) -> Self {
        SitInfo {
            inner: Mutex::new(SitInner {
                sentries: vec![SegEntry::default(); segments],
                dirty: Bitmap::new(segments),
                dirty_count: 0,
                min_mtime: u32::MAX,
                max_mtime: 0,
            }),
            elapsed_time,
            mounted_time: wall_seconds(),
        }
    }

    /// Seconds since the filesystem was formatted.
    pub fn get_mtime(&self) -> u64 {
        self.elapsed_time + wall_seconds().saturating_sub(self.mounted_time)
    }

    pub fn get_valid_blocks(&self, segno: u32) -> u16 {
        self.inner.lock().unwrap().sentries[segno as usize].valid_blocks
    }

    pub fn get_entry(&self, segno: u32) -> SegEntry {
        self.inner.lock().unwrap().sentries[segno as usize]
    }

    pub fn mtime_bounds(&self) -> (u32, u32) {
        let inner = self.inner.lock().unwrap();
        (inner.min_mtime, inner.max_mtime)
    }

    /// Apply a delta to a segment's valid count, mark it dirty, and record
    /// the modification time if given. Returns the new count.
    pub fn update_sit_entry(&self, segno: u32, delta: i32, mtime: Option<u32>) -> u16 {
        let mut inner = self.inner.lock().unwrap();
        let entry = &mut inner.sentries[segno as usize];
        let new = entry.valid_blocks as i32 + delta;
        debug_assert!(
            (0..=BLOCKS_IN_SEGMENT as i32).contains(&new),
            "impossible SIT delta on segment {}: {} {:+}",
            segno,
            entry.valid_blocks,
            delta
        );
        entry.valid_blocks = new.clamp(0, BLOCKS_IN_SEGMENT as i32) as u16;
        if let Some(mtime) = mtime {
            entry.mtime = mtime;
        }
        let mtime = entry.mtime;
        let count = entry.valid_blocks;
        inner.min_mtime = inner.min_mtime.min(mtime);
        inner.max_mtime = inner.max_mtime.max(mtime);
        if !inner.dirty.set(segno as usize) {
            inner.dirty_count += 1;
        }
        count
    }

    /// Install an entry without marking it dirty, for mount-time loads and
    /// journal replay.
    pub fn install_entry(&self, segno: u32, entry: SegEntry) {
        let mut inner = self.inner.lock().unwrap();
        inner.sentries[segno as usize] = entry;
        if entry.valid_blocks > 0 {
            inner.min_mtime = inner.min_mtime.min(entry.mtime);
            inner.max_mtime = inner.max_mtime.max(entry.mtime);
        }
    }

    pub fn dirty_count(&self) -> u32 {
        self.inner.lock().unwrap().dirty_count
    }

    /// Drain the dirty set: return `(segno, entry)` for every dirty
    /// segment and clear all dirty flags.
    pub fn drain_dirty(&self) -> Vec<(u32, SegEntry)> {
        let mut inner = self.inner.lock().unwrap();
        let dirty: Vec<u32> = inner.dirty.iter_set().map(|bit| bit as u32).collect();
        let out = dirty
            .into_iter()
            .map(|segno| (segno, inner.sentries[segno as usize]))
            .collect();
        inner.dirty.clear_all();
        inner.dirty_count = 0;
        out
    }

    /// Load the whole table from the persisted SIT area.
    pub fn load_from_media(&self, layout: &RegionLayout) {
        let base = layout.sit_base();
        for segno in 0..layout.main_segments() {
            let raw: RawSitEntry =
                unsafe { (base + segno as usize * size_of::<RawSitEntry>()).load() };
            self.install_entry(
                segno,
                SegEntry {
                    valid_blocks: u16::from_le(raw.vblocks),
                    mtime: u32::from_le(raw.mtime),
                },
            );
        }
    }

    /// Write one entry to the persisted SIT area.
    pub fn persist_entry(layout: &RegionLayout, segno: u32, entry: SegEntry) {
        let addr = layout.sit_base() + segno as usize * size_of::<RawSitEntry>();
        unsafe { addr.store(RawSitEntry::new(entry.valid_blocks, entry.mtime)) };
        persist::persist_range(addr, size_of::<RawSitEntry>());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_tracks_dirtiness_and_bounds() {
        let sit = SitInfo::new(8, 0);
        assert_eq!(sit.dirty_count(), 0);
        sit.update_sit_entry(3, 1, Some(100));
        sit.update_sit_entry(3, 1, Some(120));
        sit.update_sit_entry(5, 1, Some(90));
        assert_eq!(sit.get_valid_blocks(3), 2);
        assert_eq!(sit.dirty_count(), 2);
        assert_eq!(sit.mtime_bounds(), (90, 120));

        let drained = sit.drain_dirty();
        assert_eq!(drained.len(), 2);
        assert_eq!(sit.dirty_count(), 0);
    }

    #[test]
    fn install_does_not_dirty() {
        let sit = SitInfo::new(4, 0);
        sit.install_entry(
            1,
            SegEntry {
                valid_blocks: 7,
                mtime: 3,
            },
        );
        assert_eq!(sit.get_valid_blocks(1), 7);
        assert_eq!(sit.dirty_count(), 0);
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn negative_count_panics_in_debug() {
        let sit = SitInfo::new(2, 0);
        sit.update_sit_entry(0, -1, None);
    }
}
