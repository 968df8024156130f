//! The checkpoint manager: building, linking, indexing and deleting the
//! immutable checkpoint records that anchor every version of the
//! filesystem, and the commit protocol that advances the superblock.
//!
//! The PM ring is the single source of truth. The in-memory index is a
//! memoized projection, ordered by version, built by walking the ring on
//! demand.

pub mod orphan;
pub mod record;
pub mod recovery;

use std::collections::BTreeMap;
use std::mem::size_of;
use std::sync::Mutex;

use atomic::Ordering;

use crate::layout::superblock::RawSuperblock;
use crate::layout::RegionLayout;
use crate::nat;
use crate::pmlfs::Pmlfs;
use crate::segment::curseg::CursegType;
use crate::segment::sit::{SegEntry, SitInfo};
use crate::segment::ssa::SumType;
use crate::util::constants::*;
use crate::util::persist;
use crate::util::{BlockAddr, FsError, Result};

use orphan::{fill_orphan_block, set_orphan_backptr, OrphanManager, ORPHANS_PER_BLOCK};
use record::{
    raw_cp, set_fs_state, store_ring_pointer, CpType, FsState, RawCheckpoint, RawSitJournalEntry,
};

/// One entry of the memoized version index.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointInfo {
    pub version: u32,
    pub nat_root: BlockAddr,
    pub cp_addr: BlockAddr,
}

struct CpIndex {
    /// version -> info, materialized lazily by walking the ring.
    map: BTreeMap<u32, CheckpointInfo>,
    /// Version of the committed head.
    last_version: u32,
    /// Version reserved for the next commit; no record exists for it yet.
    new_version: u32,
}

pub struct CheckpointManager {
    /// Outermost lock: checkpoint commit, deletion and GC.
    pub cp_mutex: Mutex<()>,
    pub orphans: OrphanManager,
    index: spin::Mutex<CpIndex>,
}

impl CheckpointManager {
    pub fn new() -> Self {
        CheckpointManager {
            cp_mutex: Mutex::new(()),
            orphans: OrphanManager::new(),
            index: spin::Mutex::new(CpIndex {
                map: BTreeMap::new(),
                last_version: 0,
                new_version: 1,
            }),
        }
    }

    pub fn new_version(&self) -> u32 {
        self.index.lock().new_version
    }

    pub fn last_version(&self) -> u32 {
        self.index.lock().last_version
    }

    pub fn head_info(&self) -> CheckpointInfo {
        let index = self.index.lock();
        index.map[&index.last_version]
    }

    /// Reset the index to a single (mount) checkpoint.
    pub(crate) fn seed(&self, info: CheckpointInfo) {
        let mut index = self.index.lock();
        index.map.clear();
        index.map.insert(info.version, info);
        index.last_version = info.version;
        index.new_version = info.version + 1;
    }

    /// Advance to a freshly committed head.
    pub(crate) fn advance(&self, info: CheckpointInfo) {
        let mut index = self.index.lock();
        debug_assert_eq!(info.version, index.new_version);
        index.map.insert(info.version, info);
        index.last_version = info.version;
        index.new_version = info.version + 1;
    }

    pub(crate) fn forget(&self, version: u32) {
        self.index.lock().map.remove(&version);
    }

    /// GC moved a NAT root: repoint index entries.
    pub(crate) fn fix_moved_root(&self, src: BlockAddr, dst: BlockAddr) {
        for info in self.index.lock().map.values_mut() {
            if info.nat_root == src {
                info.nat_root = dst;
            }
        }
    }

    /// GC moved a checkpoint record: repoint its index entry.
    pub(crate) fn fix_moved_cp(&self, src: BlockAddr, dst: BlockAddr) {
        for info in self.index.lock().map.values_mut() {
            if info.cp_addr == src {
                info.cp_addr = dst;
            }
        }
    }

    /// Look a version up, walking the ring forward from the closest known
    /// record on a miss. With `no_fail`, an absent version resolves to the
    /// smallest version greater than the target.
    pub fn get_checkpoint_info(
        &self,
        layout: &RegionLayout,
        version: u32,
        no_fail: bool,
    ) -> Option<CheckpointInfo> {
        let mut index = self.index.lock();
        if version > index.last_version {
            return None;
        }
        if let Some(info) = index.map.get(&version) {
            return Some(*info);
        }
        let start = index
            .map
            .range(..=version)
            .next_back()
            .map(|(_, info)| *info)
            .unwrap_or_else(|| index.map[&index.last_version]);
        let start_addr = start.cp_addr;
        let mut cur = start;
        loop {
            let raw = unsafe { raw_cp(layout, cur.cp_addr) };
            let next_addr = raw.next_addr();
            if next_addr == start_addr || !layout.is_main_addr(next_addr) {
                return None;
            }
            let next_raw = unsafe { raw_cp(layout, next_addr) };
            let info = CheckpointInfo {
                version: next_raw.version(),
                nat_root: next_raw.nat_root(),
                cp_addr: next_addr,
            };
            index.map.insert(info.version, info);
            if info.version == version {
                return Some(info);
            }
            if info.version > version && info.version > cur.version {
                // Walked past the target without wrapping: no exact match.
                return if no_fail { Some(info) } else { None };
            }
            cur = info;
        }
    }
}

impl Default for CheckpointManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk the ring looking for an exact version. Used by snapshot mounts
/// and deletion. A ring that does not close within the block population
/// is corrupt and reads as a miss.
pub(crate) fn find_checkpoint_on_ring(
    layout: &RegionLayout,
    head: BlockAddr,
    version: u32,
) -> Option<BlockAddr> {
    let mut cur = head;
    for _ in 0..layout.main_blocks() {
        if !layout.is_main_addr(cur) {
            warn!("checkpoint ring pointer {} is out of range", cur);
            return None;
        }
        let raw = unsafe { raw_cp(layout, cur) };
        if raw.version() == version {
            return Some(cur);
        }
        cur = raw.next_addr();
        if cur == head {
            return None;
        }
    }
    warn!("checkpoint ring never closes");
    None
}

/// Visit every record on the ring, head first.
pub(crate) fn for_each_checkpoint(
    layout: &RegionLayout,
    head: BlockAddr,
    mut f: impl FnMut(BlockAddr, &RawCheckpoint),
) {
    let mut cur = head;
    for _ in 0..layout.main_blocks() {
        if !layout.is_main_addr(cur) {
            warn!("checkpoint ring pointer {} is out of range", cur);
            return;
        }
        let raw = unsafe { raw_cp(layout, cur) };
        f(cur, raw);
        cur = raw.next_addr();
        if cur == head {
            return;
        }
    }
    warn!("checkpoint ring never closes");
}

impl Pmlfs {
    /// Commit a checkpoint. `gc_cp` records a GC relocation batch and
    /// reuses the head's NAT root instead of flushing deltas.
    pub fn write_checkpoint(&self, gc_cp: bool) -> Result<u32> {
        if self.state.is_read_only() {
            return Err(FsError::ReadOnly);
        }
        let _cp = self.cm.cp_mutex.lock().unwrap();
        // Quiesce: every mutating operation holds the gate shared.
        let _quiesce = self.op_lock.write().unwrap();
        self.do_checkpoint(gc_cp)
    }

    /// The commit protocol. Caller holds `cp_mutex` and the writer gate.
    pub(crate) fn do_checkpoint(&self, gc_cp: bool) -> Result<u32> {
        let prev = self.cm.head_info();
        let version = self.cm.new_version();

        // Flush the NAT deltas and the orphan list. GC checkpoints reuse
        // the head's tree: relocation never changes the logical mapping.
        let nat_root = if gc_cp {
            prev.nat_root
        } else {
            self.nat.flush(&self.layout, &self.sm, version)?
        };
        let orphan_addrs = if gc_cp {
            [BlockAddr::NULL; NUM_ORPHAN_BLOCKS]
        } else {
            self.flush_orphan_inodes(version)?
        };

        let cp_addr = self.prepare_cp_block(&prev, version, nat_root, &orphan_addrs, gc_cp)?;
        self.flush_sit_entries(cp_addr, nat_root, gc_cp);
        self.publish_new_blocks(cp_addr, nat_root, version, &orphan_addrs)?;
        self.connect_to_super(prev.cp_addr, cp_addr);
        set_fs_state(&self.layout, prev.cp_addr, FsState::None);
        self.finish_checkpoint(cp_addr, version, nat_root);
        Ok(version)
    }

    /// The first checkpoint of a fresh region: a self-linked ring of one.
    pub(crate) fn write_initial_checkpoint(&self) -> Result<()> {
        let version = self.cm.new_version();
        debug_assert_eq!(version, 1);
        let nat_root = self.nat.flush(&self.layout, &self.sm, version)?;
        let cp_addr =
            self.sm
                .allocate_block(CursegType::Node, 0, 0, SumType::Checkpoint, version)?;
        self.fill_cp_body(cp_addr, cp_addr, cp_addr, version, nat_root, &[], false);
        self.flush_sit_entries(cp_addr, nat_root, false);
        self.publish_new_blocks(cp_addr, nat_root, version, &[])?;

        // Seed the superblocks.
        let sb_addr = self.layout.base();
        let sb = unsafe { &mut *sb_addr.to_mut_ptr::<RawSuperblock>() };
        *sb = bytemuck::Zeroable::zeroed();
        self.layout.fill_super(sb);
        sb.cp_page_addr = cp_addr.as_raw().to_le();
        sb.seal();
        persist::persist_range(sb_addr, size_of::<RawSuperblock>());
        self.copy_super_to_shadow();

        self.finish_checkpoint(cp_addr, version, nat_root);
        Ok(())
    }

    /// Serialize the orphan set into blocks allocated ahead of the
    /// checkpoint block, so a GC pass that walks blocks in address order
    /// cannot move the checkpoint ahead of its orphans.
    pub(crate) fn flush_orphan_inodes(
        &self,
        version: u32,
    ) -> Result<[BlockAddr; NUM_ORPHAN_BLOCKS]> {
        let mut addrs = [BlockAddr::NULL; NUM_ORPHAN_BLOCKS];
        let inos = self.cm.orphans.snapshot();
        for (i, chunk) in inos.chunks(ORPHANS_PER_BLOCK).enumerate() {
            debug_assert!(i < NUM_ORPHAN_BLOCKS);
            let block =
                self.sm
                    .allocate_block(CursegType::Node, 0, i as u16, SumType::Orphan, version)?;
            fill_orphan_block(&self.layout, block, chunk);
            addrs[i] = block;
        }
        Ok(addrs)
    }

    /// Allocate the record, announce the commit on the old head, and
    /// write the sealed body.
    pub(crate) fn prepare_cp_block(
        &self,
        prev: &CheckpointInfo,
        version: u32,
        nat_root: BlockAddr,
        orphan_addrs: &[BlockAddr],
        gc_cp: bool,
    ) -> Result<BlockAddr> {
        let cp_addr =
            self.sm
                .allocate_block(CursegType::Node, 0, 0, SumType::Checkpoint, version)?;
        if !gc_cp {
            set_fs_state(&self.layout, prev.cp_addr, FsState::AddCp { new_cp: cp_addr });
        }
        let prev_raw = unsafe { raw_cp(&self.layout, prev.cp_addr) };
        let ring_next = prev_raw.next_addr();
        self.fill_cp_body(cp_addr, prev.cp_addr, ring_next, version, nat_root, orphan_addrs, gc_cp);
        Ok(cp_addr)
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_cp_body(
        &self,
        cp_addr: BlockAddr,
        ring_prev: BlockAddr,
        ring_next: BlockAddr,
        version: u32,
        nat_root: BlockAddr,
        orphan_addrs: &[BlockAddr],
        gc_cp: bool,
    ) {
        let node = self.sm.curseg_info(CursegType::Node);
        let data = self.sm.curseg_info(CursegType::Data);
        let mut cp: RawCheckpoint = bytemuck::Zeroable::zeroed();
        cp.prev_cp_addr = ring_prev.as_raw().to_le();
        cp.next_cp_addr = ring_next.as_raw().to_le();
        cp.checkpoint_ver = version.to_le();
        cp.nat_addr = nat_root.as_raw().to_le();
        cp.valid_block_count = self.state.valid_block_count.load(Ordering::Relaxed).to_le();
        cp.alloc_block_count = self.state.alloc_block_count.load(Ordering::Relaxed).to_le();
        cp.elapsed_time = self.sm.sit.get_mtime().to_le();
        cp.valid_inode_count = self.state.valid_inode_count.load(Ordering::Relaxed).to_le();
        cp.valid_node_count = self.state.valid_node_count.load(Ordering::Relaxed).to_le();
        cp.free_segment_count = self.sm.free_segments().to_le();
        cp.cur_node_segno = node.segno.to_le();
        cp.cur_node_blkoff = node.next_blkoff.to_le();
        cp.cur_data_segno = data.segno.to_le();
        cp.cur_data_blkoff = data.next_blkoff.to_le();
        cp.next_scan_nid = self.nat.next_scan_nid().to_le();
        cp.cp_type = if gc_cp { CpType::Gc } else { CpType::Normal } as u8;
        for (i, addr) in orphan_addrs.iter().enumerate() {
            cp.orphan_addrs[i] = addr.as_raw().to_le();
        }
        cp.seal();

        let dst = self.layout.addr(cp_addr);
        crate::util::memory::zero(dst, BYTES_IN_BLOCK);
        unsafe { dst.store(cp) };
        persist::persist_range(dst, BYTES_IN_BLOCK);

        for addr in orphan_addrs.iter().filter(|a| !a.is_null()) {
            set_orphan_backptr(&self.layout, *addr, cp_addr);
        }
    }

    /// Write every dirty SIT entry into the record's inlined journal,
    /// spilling any overflow straight into the SIT area, then clear the
    /// dirty flags.
    pub(crate) fn flush_sit_entries(&self, cp_addr: BlockAddr, _nat_root: BlockAddr, gc_cp: bool) {
        let entries = self.sm.sit.drain_dirty();
        let journal_len = entries.len().min(record::SIT_JOURNAL_CAPACITY);
        for (i, (segno, entry)) in entries[..journal_len].iter().enumerate() {
            record::write_sit_journal_entry(
                &self.layout,
                cp_addr,
                i,
                RawSitJournalEntry::new(*segno, entry.valid_blocks, entry.mtime),
            );
        }
        for (segno, entry) in &entries[journal_len..] {
            SitInfo::persist_entry(&self.layout, *segno, *entry);
        }
        let len_addr =
            self.layout.addr(cp_addr) + std::mem::offset_of!(RawCheckpoint, sit_journal_len);
        unsafe { len_addr.store((journal_len as u16).to_le()) };
        persist::persist_range(len_addr, 2);
        trace!(
            "flushed {} SIT entries ({} journaled) for {}checkpoint",
            entries.len(),
            journal_len,
            if gc_cp { "GC " } else { "" }
        );
    }

    /// Replay the inlined SIT journal of a record into the in-memory
    /// table and, on writable mounts, the SIT area.
    pub(crate) fn recovery_sit_entries(&self, cp_addr: BlockAddr, from_interrupted_cp: bool) {
        let journal = record::read_sit_journal(&self.layout, cp_addr);
        let n = journal.len();
        for (segno, vblocks, mtime) in journal {
            if segno >= self.layout.main_segments() {
                warn!("SIT journal names segment {} outside the main area", segno);
                continue;
            }
            let entry = SegEntry {
                valid_blocks: vblocks,
                mtime,
            };
            self.sm.sit.install_entry(segno, entry);
            if !self.state.is_read_only() {
                SitInfo::persist_entry(&self.layout, segno, entry);
            }
        }
        if from_interrupted_cp {
            debug!("replayed {} SIT journal entries from an interrupted record", n);
        }
    }

    /// Set the valid bits of everything this commit publishes: the new
    /// subtrees of the NAT, the orphan blocks and the record itself.
    pub(crate) fn publish_new_blocks(
        &self,
        cp_addr: BlockAddr,
        nat_root: BlockAddr,
        version: u32,
        orphan_addrs: &[BlockAddr],
    ) -> Result<()> {
        nat::mark_new_blocks_valid(&self.layout, &self.sm, nat_root, self.nat.height(), version)?;
        for addr in orphan_addrs.iter().filter(|a| !a.is_null()) {
            self.sm.set_summary_valid(*addr);
        }
        self.sm.set_summary_valid(cp_addr);
        Ok(())
    }

    /// The atomic pointer swing: three ordered 8-byte stores, then the
    /// superblock checksum and its shadow copy. Any persisted subset is
    /// recoverable.
    pub(crate) fn connect_to_super(&self, prev_addr: BlockAddr, new_addr: BlockAddr) {
        let new_raw = unsafe { raw_cp(&self.layout, new_addr) };
        let ring_next = new_raw.next_addr();
        if prev_addr != new_addr {
            store_ring_pointer(&self.layout, prev_addr, true, new_addr);
            store_ring_pointer(&self.layout, ring_next, false, new_addr);
        }
        let sb = unsafe { crate::layout::superblock::raw_super(self.layout.base(), 0) };
        unsafe { sb.cp_addr_cell() }.store(new_addr.as_raw().to_le(), std::sync::atomic::Ordering::Release);
        persist::persist_u64(
            self.layout.base() + std::mem::offset_of!(RawSuperblock, cp_page_addr),
        );
        self.reseal_superblock();
        self.copy_super_to_shadow();
    }

    pub(crate) fn reseal_superblock(&self) {
        let sb = unsafe { &mut *self.layout.base().to_mut_ptr::<RawSuperblock>() };
        sb.seal();
        persist::persist_range(self.layout.base(), size_of::<RawSuperblock>());
    }

    pub(crate) fn copy_super_to_shadow(&self) {
        let dst = self.layout.base() + BYTES_IN_BLOCK;
        crate::util::memory::copy(dst, self.layout.base(), size_of::<RawSuperblock>());
        persist::persist_range(dst, size_of::<RawSuperblock>());
    }

    /// Advance the in-memory head and reclaim prefree segments.
    fn finish_checkpoint(&self, cp_addr: BlockAddr, version: u32, nat_root: BlockAddr) {
        self.cm.advance(CheckpointInfo {
            version,
            nat_root,
            cp_addr,
        });
        let reclaimed = self.sm.free.reclaim_prefree();
        info!(
            "checkpoint {} committed at {} ({} prefree segments reclaimed)",
            version, cp_addr, reclaimed
        );
    }

    /// Delete a historical checkpoint: reclaim the blocks only it
    /// references, splice it out of the ring, and invalidate its record.
    /// The record content itself is never mutated. Deleting the head is
    /// not allowed.
    pub fn delete_checkpoint(&self, version: u32) -> Result<()> {
        if self.state.is_read_only() {
            return Err(FsError::ReadOnly);
        }
        let _cp = self.cm.cp_mutex.lock().unwrap();
        let _quiesce = self.op_lock.write().unwrap();

        let head = self.cm.head_info();
        if version == head.version {
            return Err(FsError::Permission);
        }
        let victim_addr = find_checkpoint_on_ring(&self.layout, head.cp_addr, version)
            .ok_or(FsError::NoData)?;
        let victim = unsafe { raw_cp(&self.layout, victim_addr) };
        let prev_addr = victim.prev_addr();
        let next_addr = victim.next_addr();
        if !self.layout.is_main_addr(prev_addr) || !self.layout.is_main_addr(next_addr) {
            return Err(FsError::Invalid);
        }
        let prev_root = unsafe { raw_cp(&self.layout, prev_addr) }.nat_root();
        let next_root = unsafe { raw_cp(&self.layout, next_addr) }.nat_root();

        let freed = nat::retire_version_tree(
            &self.layout,
            &self.sm,
            victim.nat_root(),
            prev_root,
            next_root,
            self.nat.height(),
        )?;
        for i in 0..NUM_ORPHAN_BLOCKS {
            let addr = victim.orphan_addr(i);
            if !addr.is_null() && self.sm.summary_of(addr)?.valid {
                self.sm.invalidate_block(addr)?;
            }
        }

        store_ring_pointer(&self.layout, prev_addr, true, next_addr);
        store_ring_pointer(&self.layout, next_addr, false, prev_addr);
        self.sm.invalidate_block(victim_addr)?;
        self.cm.forget(version);
        info!("deleted checkpoint {} ({} blocks reclaimed)", version, freed + 1);
        Ok(())
    }

    /// Rebuild every volatile table from a (validated) record. Used at
    /// mount and after recovery advances the head.
    pub(crate) fn load_from_checkpoint(&self, cp_addr: BlockAddr) -> Result<()> {
        let raw = unsafe { raw_cp(&self.layout, cp_addr) };
        if !raw.is_sealed() {
            return Err(FsError::Invalid);
        }
        let version = raw.version();
        let read_only = self.state.is_read_only();

        self.state
            .valid_block_count
            .store(u64::from_le(raw.valid_block_count), Ordering::Relaxed);
        self.state
            .alloc_block_count
            .store(u64::from_le(raw.alloc_block_count), Ordering::Relaxed);
        self.state
            .valid_inode_count
            .store(u32::from_le(raw.valid_inode_count), Ordering::Relaxed);
        self.state
            .valid_node_count
            .store(u32::from_le(raw.valid_node_count), Ordering::Relaxed);

        self.cm.seed(CheckpointInfo {
            version,
            nat_root: raw.nat_root(),
            cp_addr,
        });
        self.nat
            .reset_to(raw.nat_root(), u32::from_le(raw.next_scan_nid));

        self.sm.sit.load_from_media(&self.layout);
        self.recovery_sit_entries(cp_addr, false);
        if !read_only {
            self.recount_sit_from_ssa();
            // The free map must exist before the streams reserve their
            // preallocated segments.
            self.rebuild_free_map_without_streams();
            let node_segno = u32::from_le(raw.cur_node_segno);
            let data_segno = u32::from_le(raw.cur_data_segno);
            self.sm.free.set_inuse(node_segno);
            self.sm.free.set_inuse(data_segno);
            self.sm
                .init_curseg(CursegType::Node, node_segno, u16::from_le(raw.cur_node_blkoff));
            self.sm
                .init_curseg(CursegType::Data, data_segno, u16::from_le(raw.cur_data_blkoff));
            // A crashed GC pass may have parked relocated blocks past the
            // recorded positions; never allocate over a set valid bit.
            self.sm.fixup_curseg_positions();
        }
        Ok(())
    }

    fn rebuild_free_map_without_streams(&self) {
        let inuse: Vec<u32> = (0..self.layout.main_segments())
            .filter(|segno| self.sm.sit.get_valid_blocks(*segno) > 0)
            .collect();
        self.sm.free.rebuild(inuse.into_iter());
    }

    /// The SSA is the authority on liveness after a crash: recount every
    /// segment's valid blocks from the summary bits.
    pub(crate) fn recount_sit_from_ssa(&self) {
        for segno in 0..self.layout.main_segments() {
            self.recount_segment(segno);
        }
    }

    pub(crate) fn recount_segment(&self, segno: u32) {
        let base_index = (segno as usize) << LOG_BLOCKS_IN_SEGMENT;
        let count = (0..BLOCKS_IN_SEGMENT)
            .filter(|off| self.sm.ssa.is_valid(base_index + off))
            .count() as u16;
        let entry = self.sm.sit.get_entry(segno);
        if entry.valid_blocks != count {
            debug!(
                "segment {}: SIT said {} valid blocks, SSA says {}",
                segno, entry.valid_blocks, count
            );
            self.sm.sit.install_entry(
                segno,
                SegEntry {
                    valid_blocks: count,
                    mtime: entry.mtime,
                },
            );
            // Make the next commit journal the healed entry.
            self.sm.sit.update_sit_entry(segno, 0, None);
        }
    }
}
