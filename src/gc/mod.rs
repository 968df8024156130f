//! The garbage collector: victim selection over the SIT, live-block
//! relocation guided by the SSA, and the background worker that keeps
//! free-segment pressure down.
//!
//! Relocation runs under `cp_mutex` with writers quiesced. Every block
//! move is bracketed by a recovery state on the head checkpoint, so a
//! crash at any point is driven to completion (or cleanly abandoned) at
//! the next mount.

use std::collections::BTreeSet;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};

use crate::checkpoint::record::{raw_cp, set_fs_state, store_ring_pointer, FsState, RawCheckpoint};
use crate::checkpoint::{for_each_checkpoint, orphan};
use crate::layout::superblock::{raw_super, RawSuperblock};
use crate::nat;
use crate::pmlfs::Pmlfs;
use crate::segment::curseg::CursegType;
use crate::segment::ssa::{nat_nid_height, nat_nid_index, SumType, Summary};
use crate::util::constants::*;
use crate::util::memory;
use crate::util::persist;
use crate::util::{BlockAddr, FsError, Result};

/// Victim selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    /// Fewest valid blocks first: cheapest relocation, used in the
    /// foreground under space pressure.
    Greedy,
    /// Cost-benefit: prefer cold, mostly-empty segments. Used by the
    /// background worker.
    CostBenefit,
}

struct GcWorker {
    handle: thread::JoinHandle<()>,
    shutdown: Sender<()>,
}

/// Per-instance GC state: the background worker handle and the
/// monotonically advancing victim-scan pointer.
pub struct GcContext {
    worker: Mutex<Option<GcWorker>>,
    scan_offset: AtomicU32,
}

impl GcContext {
    pub fn new() -> Self {
        GcContext {
            worker: Mutex::new(None),
            scan_offset: AtomicU32::new(0),
        }
    }
}

impl Default for GcContext {
    fn default() -> Self {
        Self::new()
    }
}

/// How a live block's owners reference it: pointer slots inside node or
/// NAT blocks, `nat_addr` fields of checkpoint records, or orphan-table
/// entries of checkpoint records.
enum OwnerSet {
    Slots(Vec<(BlockAddr, usize)>),
    Roots(Vec<BlockAddr>),
    OrphanRefs(Vec<(BlockAddr, usize)>),
}

impl OwnerSet {
    fn is_empty(&self) -> bool {
        match self {
            OwnerSet::Slots(v) => v.is_empty(),
            OwnerSet::Roots(v) => v.is_empty(),
            OwnerSet::OrphanRefs(v) => v.is_empty(),
        }
    }
}

impl Pmlfs {
    /// Run one garbage collection pass. Foreground passes use the greedy
    /// policy and keep collecting until the pressure eases; background
    /// passes take one cost-benefit victim. Returns the number of victim
    /// segments processed.
    pub fn garbage_collect(&self, foreground: bool) -> Result<u32> {
        if self.state.is_read_only() {
            return Err(FsError::ReadOnly);
        }
        let _cp = self.cm.cp_mutex.lock().unwrap();
        let _quiesce = self.op_lock.write().unwrap();
        let mode = if foreground { GcMode::Greedy } else { GcMode::CostBenefit };

        let mut victims = 0u32;
        let mut moved_total = 0u32;
        loop {
            let Some(segno) = self.select_victim(mode) else {
                break;
            };
            debug!("GC victim: segment {} ({:?})", segno, mode);
            moved_total += self.do_garbage_collect(segno)?;
            victims += 1;
            if !foreground || !self.sm.has_not_enough_free_segs() {
                break;
            }
            if victims as usize >= MAX_SEG_SEARCH {
                break;
            }
        }
        if victims > 0 {
            // Make the relocation durable and let the victims turn free.
            self.do_checkpoint(true)?;
            info!(
                "GC reclaimed {} segments ({} blocks moved)",
                victims, moved_total
            );
        }
        Ok(victims)
    }

    /// Scan up to `MAX_SEG_SEARCH` candidates (more under severe
    /// pressure) from the advancing offset and pick the cheapest victim.
    pub(crate) fn select_victim(&self, mode: GcMode) -> Option<u32> {
        let total = self.layout.main_segments();
        let (min_mtime, max_mtime) = self.sm.sit.mtime_bounds();
        let max_search = if self.sm.need_deep_scan() {
            NR_MAX_FG_SEGS
        } else {
            MAX_SEG_SEARCH
        }
        .min(total as usize);

        let mut offset = self.gc.scan_offset.load(Ordering::Relaxed) % total;
        let mut best: Option<(u32, f64)> = None;
        let mut scanned = 0;
        let mut wrapped = false;
        while scanned < max_search {
            let segno = match self.sm.free.find_next_inuse(offset) {
                Some(segno) => segno,
                None if !wrapped => {
                    wrapped = true;
                    offset = 0;
                    continue;
                }
                None => break,
            };
            offset = if segno + 1 >= total { 0 } else { segno + 1 };
            if offset == 0 && segno + 1 >= total {
                wrapped = true;
            }
            scanned += 1;

            if self.sm.is_current_segment(segno) || self.sm.free.is_prefree(segno) {
                continue;
            }
            let entry = self.sm.sit.get_entry(segno);
            if entry.valid_blocks == 0 || entry.valid_blocks as usize >= BLOCKS_IN_SEGMENT {
                continue;
            }
            let cost = match mode {
                GcMode::Greedy => entry.valid_blocks as f64,
                GcMode::CostBenefit => {
                    let u = entry.valid_blocks as f64 / BLOCKS_IN_SEGMENT as f64;
                    let age = if max_mtime > min_mtime {
                        (max_mtime - entry.mtime) as f64 / (max_mtime - min_mtime) as f64
                    } else {
                        0.0
                    };
                    u * (1.0 + age) / (1.0 - u)
                }
            };
            if best.map(|(_, c)| cost < c).unwrap_or(true) {
                best = Some((segno, cost));
            }
        }
        self.gc.scan_offset.store(offset, Ordering::Relaxed);
        best.map(|(segno, _)| segno)
    }

    /// Relocate every live block of the victim segment. On return the
    /// segment has no valid blocks and is marked prefree.
    pub(crate) fn do_garbage_collect(&self, segno: u32) -> Result<u32> {
        let mut moved = 0;
        for blkoff in 0..BLOCKS_IN_SEGMENT as u16 {
            let addr = self.layout.seg_addr(segno, blkoff);
            let sum = self.sm.summary_of(addr)?;
            if !sum.valid {
                continue;
            }
            if self.relocate_block(addr, sum)? {
                moved += 1;
            }
        }
        debug_assert_eq!(self.sm.sit.get_valid_blocks(segno), 0);
        Ok(moved)
    }

    fn relocate_block(&self, src: BlockAddr, sum: Summary) -> Result<bool> {
        match sum.ty {
            SumType::Checkpoint => self.move_cp_block(src, sum),
            _ => self.move_owned_block(src, sum),
        }
    }

    /// Move a block whose owners hold pointers to it: data, node, NAT and
    /// orphan blocks. The state field bracketing the pointer rewrites
    /// makes a crash recoverable.
    fn move_owned_block(&self, src: BlockAddr, sum: Summary) -> Result<bool> {
        let owners = self.collect_owners(src, &sum)?;
        if owners.is_empty() && !self.working_tree_references(src, &sum) {
            // No published tree points here: the summary is stale.
            self.sm.invalidate_block(src)?;
            return Ok(false);
        }
        let stream = if sum.ty.is_data_stream() {
            CursegType::Data
        } else {
            CursegType::Node
        };
        let dst = self
            .sm
            .allocate_block(stream, sum.nid, sum.ofs_in_node, sum.ty, sum.start_version)?;
        memory::copy(self.layout.addr(dst), self.layout.addr(src), BYTES_IN_BLOCK);
        persist::persist_range(self.layout.addr(dst), BYTES_IN_BLOCK);

        let head = self.cm.head_info();
        let state = if sum.ty.is_data_stream() {
            FsState::GcData { src, dst }
        } else {
            FsState::GcNode { src, dst }
        };
        set_fs_state(&self.layout, head.cp_addr, state);
        self.apply_owners(&owners, &sum, src, dst);
        self.sm.invalidate_block(src)?;
        set_fs_state(&self.layout, head.cp_addr, FsState::None);
        trace!("GC moved {} -> {} ({:?})", src, dst, sum.ty);
        Ok(true)
    }

    /// Everything that points at `src`, across every checkpoint on the
    /// ring and the working tree.
    fn collect_owners(&self, src: BlockAddr, sum: &Summary) -> Result<OwnerSet> {
        let head = self.cm.head_info();
        let layout = &self.layout;
        match sum.ty {
            SumType::Data | SumType::XData => {
                let mut slots = BTreeSet::new();
                for_each_checkpoint(layout, head.cp_addr, |_, raw| {
                    let node = self.nat.lookup_in(layout, raw.nat_root(), sum.nid);
                    if !node.is_null()
                        && nat::read_slot(layout, node, sum.ofs_in_node as usize) == src
                    {
                        slots.insert(node);
                    }
                });
                let node = self.nat.lookup_current(layout, sum.nid);
                if !node.is_null() && nat::read_slot(layout, node, sum.ofs_in_node as usize) == src
                {
                    slots.insert(node);
                }
                Ok(OwnerSet::Slots(
                    slots
                        .into_iter()
                        .map(|node| (node, sum.ofs_in_node as usize))
                        .collect(),
                ))
            }
            SumType::Inode | SumType::Indirect => {
                let mut slots = BTreeSet::new();
                let leaf_index = sum.nid >> LOG_SLOTS_IN_BLOCK;
                let slot = sum.nid as usize & (SLOTS_IN_BLOCK - 1);
                for_each_checkpoint(layout, head.cp_addr, |_, raw| {
                    let leaf = self.nat.block_at(layout, raw.nat_root(), 0, leaf_index);
                    if !leaf.is_null() && nat::read_slot(layout, leaf, slot) == src {
                        slots.insert(leaf);
                    }
                });
                Ok(OwnerSet::Slots(
                    slots.into_iter().map(|leaf| (leaf, slot)).collect(),
                ))
            }
            SumType::NatNode | SumType::NatData => {
                let level = nat_nid_height(sum.nid);
                let index = nat_nid_index(sum.nid);
                if level + 1 == self.nat.height() {
                    let mut roots = Vec::new();
                    for_each_checkpoint(layout, head.cp_addr, |cp_addr, raw| {
                        if raw.nat_root() == src {
                            roots.push(cp_addr);
                        }
                    });
                    Ok(OwnerSet::Roots(roots))
                } else {
                    let mut slots = BTreeSet::new();
                    let parent_index = index >> LOG_SLOTS_IN_BLOCK;
                    let slot = index as usize & (SLOTS_IN_BLOCK - 1);
                    for_each_checkpoint(layout, head.cp_addr, |_, raw| {
                        let parent =
                            self.nat
                                .block_at(layout, raw.nat_root(), level + 1, parent_index);
                        if !parent.is_null() && nat::read_slot(layout, parent, slot) == src {
                            slots.insert(parent);
                        }
                    });
                    Ok(OwnerSet::Slots(
                        slots.into_iter().map(|parent| (parent, slot)).collect(),
                    ))
                }
            }
            SumType::Orphan => {
                let mut refs = Vec::new();
                for_each_checkpoint(layout, head.cp_addr, |cp_addr, raw| {
                    for i in 0..NUM_ORPHAN_BLOCKS {
                        if raw.orphan_addr(i) == src {
                            refs.push((cp_addr, i));
                        }
                    }
                });
                Ok(OwnerSet::OrphanRefs(refs))
            }
            SumType::Checkpoint => unreachable!("checkpoint records take the CpGc path"),
        }
    }

    /// A reference that lives only in the buffered NAT mutations, with no
    /// published pointer slot behind it.
    fn working_tree_references(&self, src: BlockAddr, sum: &Summary) -> bool {
        match sum.ty {
            SumType::Inode | SumType::Indirect => {
                self.nat.lookup_current(&self.layout, sum.nid) == src
            }
            SumType::NatNode | SumType::NatData => self.nat.root() == src,
            _ => false,
        }
    }

    /// Publish `dst` and redirect every owner from `src` to it.
    fn apply_owners(&self, owners: &OwnerSet, sum: &Summary, src: BlockAddr, dst: BlockAddr) {
        self.sm.set_summary_valid(dst);
        match owners {
            OwnerSet::Slots(slots) => {
                for (block, slot) in slots {
                    nat::write_slot(&self.layout, *block, *slot, dst);
                }
            }
            OwnerSet::Roots(roots) => {
                for cp_addr in roots {
                    self.patch_cp_nat_root(*cp_addr, dst);
                }
                self.cm.fix_moved_root(src, dst);
            }
            OwnerSet::OrphanRefs(refs) => {
                for (cp_addr, i) in refs {
                    self.patch_cp_orphan_addr(*cp_addr, *i, dst);
                    orphan::set_orphan_backptr(&self.layout, dst, *cp_addr);
                }
            }
        }
        match sum.ty {
            SumType::Inode | SumType::Indirect => self.nat.fix_moved_node(sum.nid, src, dst),
            SumType::NatNode | SumType::NatData => self.nat.fix_moved_root(src, dst),
            _ => {}
        }
    }

    /// Rewrite a record's `nat_addr` and reseal it. Sanctioned mutation:
    /// GC owns the pointer fields it relocates.
    fn patch_cp_nat_root(&self, cp_addr: BlockAddr, dst: BlockAddr) {
        let raw = unsafe { &mut *self.layout.addr(cp_addr).to_mut_ptr::<RawCheckpoint>() };
        raw.nat_addr = dst.as_raw().to_le();
        raw.seal();
        persist::persist_range(self.layout.addr(cp_addr), size_of::<RawCheckpoint>());
    }

    fn patch_cp_orphan_addr(&self, cp_addr: BlockAddr, i: usize, dst: BlockAddr) {
        let raw = unsafe { &mut *self.layout.addr(cp_addr).to_mut_ptr::<RawCheckpoint>() };
        raw.orphan_addrs[i] = dst.as_raw().to_le();
        raw.seal();
        persist::persist_range(self.layout.addr(cp_addr), size_of::<RawCheckpoint>());
    }

    /// Relocate a checkpoint record: splice the ring onto the copy and,
    /// for the head, swing the superblock.
    fn move_cp_block(&self, src: BlockAddr, sum: Summary) -> Result<bool> {
        let head = self.cm.head_info();
        let dst = self
            .sm
            .allocate_block(CursegType::Node, 0, 0, SumType::Checkpoint, sum.start_version)?;
        memory::copy(self.layout.addr(dst), self.layout.addr(src), BYTES_IN_BLOCK);
        persist::persist_range(self.layout.addr(dst), BYTES_IN_BLOCK);

        set_fs_state(&self.layout, head.cp_addr, FsState::CpGc { src, dst });
        self.sm.set_summary_valid(dst);

        let dst_raw = unsafe { raw_cp(&self.layout, dst) };
        if dst_raw.next_addr() == src {
            // A ring of one links to itself.
            store_ring_pointer(&self.layout, dst, true, dst);
            store_ring_pointer(&self.layout, dst, false, dst);
        } else {
            store_ring_pointer(&self.layout, dst_raw.prev_addr(), true, dst);
            store_ring_pointer(&self.layout, dst_raw.next_addr(), false, dst);
        }
        for i in 0..NUM_ORPHAN_BLOCKS {
            let block = dst_raw.orphan_addr(i);
            if !block.is_null() {
                orphan::set_orphan_backptr(&self.layout, block, dst);
            }
        }

        let head_moved = head.cp_addr == src;
        if head_moved {
            let sb = unsafe { raw_super(self.layout.base(), 0) };
            unsafe { sb.cp_addr_cell() }
                .store(dst.as_raw().to_le(), std::sync::atomic::Ordering::Release);
            persist::persist_u64(
                self.layout.base() + std::mem::offset_of!(RawSuperblock, cp_page_addr),
            );
            self.reseal_superblock();
            self.copy_super_to_shadow();
        }
        self.sm.invalidate_block(src)?;
        self.cm.fix_moved_cp(src, dst);
        let head_now = if head_moved { dst } else { head.cp_addr };
        set_fs_state(&self.layout, head_now, FsState::None);
        trace!("GC moved checkpoint record {} -> {}", src, dst);
        Ok(true)
    }

    /// Finish (or abandon) a block relocation interrupted by a crash.
    /// Idempotent: the owner pointers tell how far the move got.
    pub(crate) fn recover_gc_crash(&self, src: BlockAddr, dst: BlockAddr) -> Result<()> {
        let head = self.cm.head_info();
        let settle = |heal_dst: bool| -> Result<()> {
            set_fs_state(&self.layout, head.cp_addr, FsState::None);
            if self.layout.is_main_addr(src) {
                self.recount_segment(self.layout.seg_coord(src).segno);
            }
            if heal_dst && self.layout.is_main_addr(dst) {
                self.recount_segment(self.layout.seg_coord(dst).segno);
            }
            // The redo may have published a block past a stream's
            // recorded position.
            self.sm.fixup_curseg_positions();
            Ok(())
        };

        if !self.layout.is_main_addr(src) || !self.layout.is_main_addr(dst) {
            warn!("GC recovery arguments out of range: {} -> {}", src, dst);
            return settle(false);
        }
        let src_sum = self.sm.summary_of(src)?;
        let dst_sum = self.sm.summary_of(dst)?;
        if src_sum.ty == SumType::Checkpoint {
            // Record moves carry the CpGc state, never GcData/GcNode.
            warn!("GC block-move state names a checkpoint record at {}", src);
            return settle(true);
        }
        let mirrors = dst_sum.nid == src_sum.nid
            && dst_sum.ofs_in_node == src_sum.ofs_in_node
            && dst_sum.ty == src_sum.ty
            && dst_sum.start_version == src_sum.start_version;
        if !mirrors {
            // The copy never finished; the destination is dead garbage.
            info!("abandoning interrupted GC move {} -> {}", src, dst);
            return settle(true);
        }
        if !src_sum.valid {
            // The move completed up to (at least) the source
            // invalidation; make sure the copy is published.
            self.sm.set_summary_valid(dst);
            return settle(true);
        }

        info!("redoing interrupted GC move {} -> {}", src, dst);
        // The source is still live, so its payload was never reclaimed.
        memory::copy(self.layout.addr(dst), self.layout.addr(src), BYTES_IN_BLOCK);
        persist::persist_range(self.layout.addr(dst), BYTES_IN_BLOCK);
        let owners = self.collect_owners(src, &src_sum)?;
        self.apply_owners(&owners, &src_sum, src, dst);
        self.sm.invalidate_block(src)?;
        settle(true)
    }
}

// ---------------------------------------------------------------------
// The background worker.
// ---------------------------------------------------------------------

fn increase_sleep(wait: Duration, min: Duration, max: Duration) -> Duration {
    (wait + min).min(max)
}

fn decrease_sleep(wait: Duration, min: Duration) -> Duration {
    wait.saturating_sub(min).max(min)
}

/// Start the background GC thread. It observes the shutdown channel
/// between passes and never cancels mid-relocation.
pub(crate) fn spawn_gc_worker(fs: &Arc<Pmlfs>) {
    let (shutdown, rx) = bounded::<()>(1);
    let worker_fs = Arc::clone(fs);
    let min = Duration::from_millis(*fs.options().gc_min_sleep_ms);
    let max = Duration::from_millis(*fs.options().gc_max_sleep_ms);
    let nogc = Duration::from_millis(*fs.options().gc_nogc_sleep_ms);
    let handle = thread::Builder::new()
        .name("pmlfs-gc".into())
        .spawn(move || {
            debug!("background GC worker started");
            let mut wait = max;
            loop {
                match rx.recv_timeout(wait) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                if !worker_fs.sm.has_enough_invalid_blocks() {
                    wait = nogc;
                    continue;
                }
                match worker_fs.garbage_collect(false) {
                    Ok(victims) if victims > 0 => wait = decrease_sleep(wait, min),
                    Ok(_) => wait = increase_sleep(wait, min, max),
                    Err(e) => {
                        warn!("background GC failed: {}", e);
                        wait = nogc;
                    }
                }
            }
            debug!("background GC worker exiting");
        })
        .expect("failed to spawn the GC worker");
    *fs.gc.worker.lock().unwrap() = Some(GcWorker { handle, shutdown });
}

/// Signal the worker and wait for it to finish its current pass.
pub(crate) fn stop_gc_worker(fs: &Pmlfs) {
    let worker = fs.gc.worker.lock().unwrap().take();
    if let Some(worker) = worker {
        let _ = worker.shutdown.send(());
        let _ = worker.handle.join();
    }
}
