//! Orphan inode tracking.
//!
//! An inode that loses its last link while still open joins the orphan
//! set; recovery consumes the set to actually free it. The set is kept
//! sorted by inode number and serialized at commit into orphan blocks:
//! 8 bytes of back-pointer to the owning checkpoint, then packed `u32`
//! inode numbers.

use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::layout::RegionLayout;
use crate::util::constants::*;
use crate::util::{BlockAddr, FsError, Result};

/// How many inode numbers fit in one orphan block after the back-pointer.
pub const ORPHANS_PER_BLOCK: usize = (BYTES_IN_BLOCK - 8) / 4;
/// The capacity of the orphan set.
pub const MAX_ORPHANS: usize = NUM_ORPHAN_BLOCKS * ORPHANS_PER_BLOCK;

pub struct OrphanManager {
    // `orphan_inode_mutex` of the lock order.
    set: Mutex<BTreeSet<u32>>,
}

impl OrphanManager {
    pub fn new() -> Self {
        OrphanManager {
            set: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn add(&self, ino: u32) {
        self.set.lock().unwrap().insert(ino);
    }

    pub fn remove(&self, ino: u32) {
        self.set.lock().unwrap().remove(&ino);
    }

    pub fn len(&self) -> usize {
        self.set.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.lock().unwrap().is_empty()
    }

    /// Room for one more orphan?
    pub fn check_space(&self) -> Result<()> {
        let n = self.len();
        debug_assert!(n <= MAX_ORPHANS);
        if n >= MAX_ORPHANS {
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    /// The current set, sorted, for serialization at commit.
    pub fn snapshot(&self) -> Vec<u32> {
        self.set.lock().unwrap().iter().copied().collect()
    }

    pub fn clear(&self) {
        self.set.lock().unwrap().clear();
    }
}

impl Default for OrphanManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Fill one orphan block: back-pointer slot (patched once the checkpoint
/// block exists) followed by the packed inode numbers.
pub fn fill_orphan_block(layout: &RegionLayout, block: BlockAddr, inos: &[u32]) {
    debug_assert!(inos.len() <= ORPHANS_PER_BLOCK);
    let base = layout.addr(block);
    crate::util::memory::zero(base, BYTES_IN_BLOCK);
    for (i, ino) in inos.iter().enumerate() {
        unsafe { (base + 8 + i * 4).store(ino.to_le()) };
    }
    crate::util::persist::persist_range(base, BYTES_IN_BLOCK);
}

/// Patch the back-pointer of an orphan block to its checkpoint.
pub fn set_orphan_backptr(layout: &RegionLayout, block: BlockAddr, cp: BlockAddr) {
    let base = layout.addr(block);
    unsafe { base.store(cp.as_raw().to_le()) };
    crate::util::persist::persist_u64(base);
}

/// Decode the inode numbers of an orphan block. A zero entry terminates:
/// inode 0 is never orphaned.
pub fn read_orphan_block(layout: &RegionLayout, block: BlockAddr) -> Vec<u32> {
    let base = layout.addr(block);
    let mut out = Vec::new();
    for i in 0..ORPHANS_PER_BLOCK {
        let ino = u32::from_le(unsafe { (base + 8 + i * 4).load() });
        if ino == 0 {
            break;
        }
        out.push(ino);
    }
    out
}
