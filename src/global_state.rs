//! Counters shared by the segment manager, the checkpoint manager and the
//! garbage collector. A checkpoint commit snapshots these into the new
//! record; mount restores them from the head record.

use atomic::Ordering;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};

pub struct GlobalState {
    /// Live user blocks (inode, indirect, data, xdata).
    pub valid_block_count: AtomicU64,
    /// Blocks ever allocated, metadata included. Monotone.
    pub alloc_block_count: AtomicU64,
    pub valid_inode_count: AtomicU32,
    pub valid_node_count: AtomicU32,
    /// Size of the main area in blocks. Fixed at mount.
    pub user_block_count: u64,
    /// Set on a snapshot mount or after a steady-state corruption.
    pub read_only: AtomicBool,
}

impl GlobalState {
    pub fn new(user_block_count: u64, read_only: bool) -> Self {
        GlobalState {
            valid_block_count: AtomicU64::new(0),
            alloc_block_count: AtomicU64::new(0),
            valid_inode_count: AtomicU32::new(0),
            valid_node_count: AtomicU32::new(0),
            user_block_count,
            read_only: AtomicBool::new(read_only),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    pub fn set_read_only(&self) {
        self.read_only.store(true, Ordering::Relaxed);
    }

    /// The invalid block population GC can harvest.
    pub fn invalid_user_blocks(&self) -> u64 {
        let alloc = self.alloc_block_count.load(Ordering::Relaxed);
        let valid = self.valid_block_count.load(Ordering::Relaxed);
        alloc.saturating_sub(valid)
    }
}
