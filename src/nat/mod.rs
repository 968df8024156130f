//! The node address table: a copy-on-write radix tree from node id to the
//! current block address of that node.
//!
//! Interior blocks (`NatNode`) and leaf blocks (`NatData`) are arrays of
//! `SLOTS_IN_BLOCK` logical addresses allocated from the node stream in
//! the main area. Mutations are buffered in a dirty map and written out
//! copy-on-write at checkpoint commit, producing a new root; every
//! checkpoint therefore owns an immutable tree, and trees of adjacent
//! versions share all unchanged subtrees.

use itertools::Itertools;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::layout::RegionLayout;
use crate::segment::curseg::CursegType;
use crate::segment::ssa::{nat_nid, SumType};
use crate::segment::SegmentManager;
use crate::util::constants::*;
use crate::util::persist;
use crate::util::{BlockAddr, FsError, Result};

/// Read pointer slot `index` of a block.
pub(crate) fn read_slot(layout: &RegionLayout, block: BlockAddr, index: usize) -> BlockAddr {
    debug_assert!(index < SLOTS_IN_BLOCK);
    let raw: u64 = unsafe { (layout.addr(block) + index * 8).load() };
    BlockAddr::from_raw(u64::from_le(raw))
}

/// Write pointer slot `index` of a block and persist the cell. The store
/// is 8-byte aligned and individually atomic.
pub(crate) fn write_slot(layout: &RegionLayout, block: BlockAddr, index: usize, val: BlockAddr) {
    debug_assert!(index < SLOTS_IN_BLOCK);
    let addr = layout.addr(block) + index * 8;
    unsafe {
        addr.atomic_store::<std::sync::atomic::AtomicU64>(
            val.as_raw().to_le(),
            std::sync::atomic::Ordering::Release,
        )
    };
    persist::persist_u64(addr);
}

struct NatCache {
    /// Root of the last flushed tree (the head checkpoint's, right after
    /// mount or commit).
    root: BlockAddr,
    /// Buffered mutations: nid -> new node address, `NULL` for removal.
    dirty: HashMap<u32, BlockAddr>,
    next_scan_nid: u32,
}

pub struct NatManager {
    height: u8,
    inner: RwLock<NatCache>,
}

impl NatManager {
    pub fn new(height: u8, root: BlockAddr, next_scan_nid: u32) -> Self {
        debug_assert!(height >= 1 && height <= MAX_NAT_HEIGHT);
        NatManager {
            height,
            inner: RwLock::new(NatCache {
                root,
                dirty: HashMap::new(),
                next_scan_nid,
            }),
        }
    }

    pub fn height(&self) -> u8 {
        self.height
    }

    /// The largest nid this tree shape can map, plus one.
    pub fn capacity(&self) -> u64 {
        1u64 << (LOG_SLOTS_IN_BLOCK as u64 * self.height as u64)
    }

    pub fn root(&self) -> BlockAddr {
        self.inner.read().unwrap().root
    }

    pub fn next_scan_nid(&self) -> u32 {
        self.inner.read().unwrap().next_scan_nid
    }

    /// Reserve a fresh nid. The counter is monotone and persisted through
    /// the checkpoint record; wrap-around is out of scope.
    pub fn alloc_nid(&self) -> Result<u32> {
        let mut inner = self.inner.write().unwrap();
        if inner.next_scan_nid as u64 >= self.capacity() {
            return Err(FsError::NoSpace);
        }
        let nid = inner.next_scan_nid;
        inner.next_scan_nid += 1;
        Ok(nid)
    }

    /// Resolve a nid against an arbitrary (published) tree root.
    pub fn lookup_in(&self, layout: &RegionLayout, root: BlockAddr, nid: u32) -> BlockAddr {
        if nid as u64 >= self.capacity() {
            return BlockAddr::NULL;
        }
        let mut cur = root;
        for level in (0..self.height).rev() {
            if cur.is_null() {
                return BlockAddr::NULL;
            }
            let slot = (nid as usize >> (LOG_SLOTS_IN_BLOCK * level as usize)) & (SLOTS_IN_BLOCK - 1);
            cur = read_slot(layout, cur, slot);
        }
        cur
    }

    /// The tree block at `(level, index)` on a published tree, or `NULL`
    /// if the path is absent. `index` is the subtree index at that level.
    pub(crate) fn block_at(
        &self,
        layout: &RegionLayout,
        root: BlockAddr,
        level: u8,
        index: u32,
    ) -> BlockAddr {
        debug_assert!(level < self.height);
        let steps = (self.height - 1 - level) as usize;
        let mut cur = root;
        for j in 1..=steps {
            if cur.is_null() {
                return BlockAddr::NULL;
            }
            let slot = (index as usize >> (LOG_SLOTS_IN_BLOCK * (steps - j))) & (SLOTS_IN_BLOCK - 1);
            cur = read_slot(layout, cur, slot);
        }
        cur
    }

    /// Resolve a nid against the working tree: buffered mutations first,
    /// then the last flushed root.
    pub fn lookup_current(&self, layout: &RegionLayout, nid: u32) -> BlockAddr {
        let inner = self.inner.read().unwrap();
        if let Some(addr) = inner.dirty.get(&nid) {
            return *addr;
        }
        let root = inner.root;
        drop(inner);
        self.lookup_in(layout, root, nid)
    }

    /// Buffer a mapping update.
    pub fn set(&self, nid: u32, addr: BlockAddr) {
        self.inner.write().unwrap().dirty.insert(nid, addr);
    }

    /// Buffer a removal.
    pub fn remove(&self, nid: u32) {
        self.inner.write().unwrap().dirty.insert(nid, BlockAddr::NULL);
    }

    /// After GC moved a node block, repoint the working cache if it still
    /// refers to the old location.
    pub fn fix_moved_node(&self, nid: u32, src: BlockAddr, dst: BlockAddr) {
        let mut inner = self.inner.write().unwrap();
        if let Some(slot) = inner.dirty.get_mut(&nid) {
            if *slot == src {
                *slot = dst;
            }
        }
    }

    /// After GC moved a NAT block, repoint the cached root if needed.
    pub fn fix_moved_root(&self, src: BlockAddr, dst: BlockAddr) {
        let mut inner = self.inner.write().unwrap();
        if inner.root == src {
            inner.root = dst;
        }
    }

    /// Write out all buffered mutations copy-on-write, producing the new
    /// root the checkpoint will record. Blocks replaced on the copied
    /// paths stay valid if an earlier checkpoint published them; path
    /// blocks born in the current interval are invalidated.
    pub fn flush(
        &self,
        layout: &RegionLayout,
        sm: &SegmentManager,
        version: u32,
    ) -> Result<BlockAddr> {
        let mut inner = self.inner.write().unwrap();
        if inner.dirty.is_empty() {
            return Ok(inner.root);
        }
        let mut changes: Vec<(u32, BlockAddr)> = inner.dirty.drain().collect();
        changes.sort_unstable_by_key(|(nid, _)| *nid);
        match flush_level(
            layout,
            sm,
            inner.root,
            self.height - 1,
            0,
            0,
            &changes,
            version,
        ) {
            Ok(new_root) => {
                inner.root = new_root;
                Ok(new_root)
            }
            Err(e) => {
                // Keep the buffered mutations; the commit failed before
                // the tree was replaced.
                inner.dirty.extend(changes);
                Err(e)
            }
        }
    }

    /// Restore the cache to a published root, dropping buffered mutations.
    /// Used by mount and recovery.
    pub fn reset_to(&self, root: BlockAddr, next_scan_nid: u32) {
        let mut inner = self.inner.write().unwrap();
        inner.root = root;
        inner.dirty.clear();
        inner.next_scan_nid = next_scan_nid;
    }
}

/// Copy-on-write one tree level. `index` is the subtree index of the
/// block at `level`; `ofs_in_parent` its slot in the parent block.
#[allow(clippy::too_many_arguments)]
fn flush_level(
    layout: &RegionLayout,
    sm: &SegmentManager,
    old: BlockAddr,
    level: u8,
    index: u32,
    ofs_in_parent: u16,
    changes: &[(u32, BlockAddr)],
    version: u32,
) -> Result<BlockAddr> {
    debug_assert!(!changes.is_empty());
    let ty = if level == 0 { SumType::NatData } else { SumType::NatNode };
    let new = sm.allocate_block(
        CursegType::Node,
        nat_nid(level, index),
        ofs_in_parent,
        ty,
        version,
    )?;
    let new_va = layout.addr(new);
    if old.is_null() {
        crate::util::memory::zero(new_va, BYTES_IN_BLOCK);
    } else {
        crate::util::memory::copy(new_va, layout.addr(old), BYTES_IN_BLOCK);
    }

    if level == 0 {
        for (nid, addr) in changes {
            write_slot(layout, new, *nid as usize & (SLOTS_IN_BLOCK - 1), *addr);
        }
    } else {
        let shift = LOG_SLOTS_IN_BLOCK * level as usize;
        for (slot, group) in &changes
            .iter()
            .chunk_by(|(nid, _)| (*nid as usize >> shift) & (SLOTS_IN_BLOCK - 1))
        {
            let group: Vec<(u32, BlockAddr)> = group.copied().collect();
            let child_old = read_slot(layout, new, slot);
            let child_new = flush_level(
                layout,
                sm,
                child_old,
                level - 1,
                (index << LOG_SLOTS_IN_BLOCK) | slot as u32,
                slot as u16,
                &group,
                version,
            )?;
            write_slot(layout, new, slot, child_new);
        }
    }
    persist::persist_range(new_va, BYTES_IN_BLOCK);

    if !old.is_null() {
        // A path block created since the last commit was never published;
        // reclaim it now. Published path blocks belong to older
        // checkpoints and stay valid.
        let sum = sm.summary_of(old)?;
        if sum.start_version == version {
            sm.invalidate_block(old)?;
        }
    }
    Ok(new)
}

/// Publish pass at commit (and redo): set the summary valid bit of every
/// block the new tree introduced, pruning subtrees that predate the
/// version being published.
pub fn mark_new_blocks_valid(
    layout: &RegionLayout,
    sm: &SegmentManager,
    root: BlockAddr,
    height: u8,
    version: u32,
) -> Result<()> {
    mark_nat_rec(layout, sm, root, height.wrapping_sub(1), version)
}

fn mark_nat_rec(
    layout: &RegionLayout,
    sm: &SegmentManager,
    block: BlockAddr,
    level: u8,
    version: u32,
) -> Result<()> {
    if block.is_null() {
        return Ok(());
    }
    let sum = sm.summary_of(block)?;
    if sum.start_version != version {
        return Ok(());
    }
    sm.set_summary_valid(block);
    for slot in 0..SLOTS_IN_BLOCK {
        let child = read_slot(layout, block, slot);
        if child.is_null() {
            continue;
        }
        if level > 0 {
            mark_nat_rec(layout, sm, child, level - 1, version)?;
        } else {
            mark_node_block(layout, sm, child, version)?;
        }
    }
    Ok(())
}

fn mark_node_block(
    layout: &RegionLayout,
    sm: &SegmentManager,
    node: BlockAddr,
    version: u32,
) -> Result<()> {
    let sum = sm.summary_of(node)?;
    if sum.start_version != version {
        return Ok(());
    }
    sm.set_summary_valid(node);
    for slot in 0..SLOTS_IN_BLOCK {
        let data = read_slot(layout, node, slot);
        if data.is_null() {
            continue;
        }
        let data_sum = sm.summary_of(data)?;
        if data_sum.start_version == version && !data_sum.valid {
            sm.set_summary_valid(data);
        }
    }
    Ok(())
}

/// Reclaim every block referenced by the victim tree and by neither
/// neighbour tree. Reference ranges are contiguous in version order, so
/// comparing against the two ring neighbours is exact. Returns the number
/// of blocks freed.
pub fn retire_version_tree(
    layout: &RegionLayout,
    sm: &SegmentManager,
    victim_root: BlockAddr,
    prev_root: BlockAddr,
    next_root: BlockAddr,
    height: u8,
) -> Result<u64> {
    let mut freed = 0;
    diff_nat_rec(
        layout,
        sm,
        victim_root,
        prev_root,
        next_root,
        height.wrapping_sub(1),
        &mut freed,
    )?;
    Ok(freed)
}

fn neighbour_slot(layout: &RegionLayout, block: BlockAddr, slot: usize) -> BlockAddr {
    if block.is_null() {
        BlockAddr::NULL
    } else {
        read_slot(layout, block, slot)
    }
}

#[allow(clippy::too_many_arguments)]
fn diff_nat_rec(
    layout: &RegionLayout,
    sm: &SegmentManager,
    victim: BlockAddr,
    prev: BlockAddr,
    next: BlockAddr,
    level: u8,
    freed: &mut u64,
) -> Result<()> {
    if victim.is_null() || victim == prev || victim == next {
        return Ok(());
    }
    for slot in 0..SLOTS_IN_BLOCK {
        let v = read_slot(layout, victim, slot);
        let p = neighbour_slot(layout, prev, slot);
        let n = neighbour_slot(layout, next, slot);
        if level > 0 {
            diff_nat_rec(layout, sm, v, p, n, level - 1, freed)?;
        } else {
            diff_node_block(layout, sm, v, p, n, freed)?;
        }
    }
    retire_one(sm, victim, freed)
}

/// Invalidate a block unless something else (an orphan replay, an earlier
/// deletion) already did.
fn retire_one(sm: &SegmentManager, addr: BlockAddr, freed: &mut u64) -> Result<()> {
    if sm.summary_of(addr)?.valid {
        sm.invalidate_block(addr)?;
        *freed += 1;
    }
    Ok(())
}

fn diff_node_block(
    layout: &RegionLayout,
    sm: &SegmentManager,
    victim: BlockAddr,
    prev: BlockAddr,
    next: BlockAddr,
    freed: &mut u64,
) -> Result<()> {
    if victim.is_null() || victim == prev || victim == next {
        return Ok(());
    }
    for slot in 0..SLOTS_IN_BLOCK {
        let v = read_slot(layout, victim, slot);
        if v.is_null() {
            continue;
        }
        let p = neighbour_slot(layout, prev, slot);
        let n = neighbour_slot(layout, next, slot);
        if v != p && v != n {
            retire_one(sm, v, freed)?;
        }
    }
    retire_one(sm, victim, freed)
}
