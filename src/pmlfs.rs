//! The filesystem instance: owns the mapped region and the three core
//! managers, and carries the write path that everything else feeds.

use std::sync::{Arc, RwLock};

use atomic::Ordering;

use crate::checkpoint::CheckpointManager;
use crate::gc::GcContext;
use crate::global_state::GlobalState;
use crate::layout::superblock::{raw_super, RawSuperblock};
use crate::layout::RegionLayout;
use crate::nat::{self, NatManager};
use crate::segment::curseg::CursegType;
use crate::segment::ssa::SumType;
use crate::segment::SegmentManager;
use crate::util::constants::*;
use crate::util::memory::{self, PmRegion};
use crate::util::options::Options;
use crate::util::persist;
use crate::util::{BlockAddr, FsError, Result};

/// Install the built-in `env_logger` backend, defaulting to info level
/// with `RUST_LOG` overriding. A no-op if the embedder already
/// registered a `log` backend, or when the "builtin_env_logger" feature
/// is disabled.
#[cfg(feature = "builtin_env_logger")]
fn try_init_logger() {
    let env = env_logger::Env::default().default_filter_or("info");
    if env_logger::Builder::from_env(env).try_init().is_err() {
        // The embedder brought its own logger; keep it.
        debug!("logging already initialized");
    }
}

#[cfg(not(feature = "builtin_env_logger"))]
fn try_init_logger() {}

/// An instance of the filesystem core, bound to one mapped PM region.
///
/// All mutating operations go through the writer gate (`op_lock` shared);
/// checkpoint commit and GC relocation quiesce writers by taking it
/// exclusively.
pub struct Pmlfs {
    pub(crate) region: PmRegion,
    pub(crate) layout: Arc<RegionLayout>,
    pub(crate) state: Arc<GlobalState>,
    pub(crate) sm: SegmentManager,
    pub(crate) cm: CheckpointManager,
    pub(crate) nat: NatManager,
    pub(crate) op_lock: RwLock<()>,
    pub(crate) gc: GcContext,
    pub(crate) options: Options,
}

// The raw region pointers are guarded by the managers' locks.
unsafe impl Send for Pmlfs {}
unsafe impl Sync for Pmlfs {}

/// A snapshot of the accounting counters.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub valid_block_count: u64,
    pub alloc_block_count: u64,
    pub valid_inode_count: u32,
    pub valid_node_count: u32,
    pub user_block_count: u64,
    pub free_segments: u32,
    pub prefree_segments: u32,
    pub dirty_segments: u32,
    pub head_version: u32,
}

impl Pmlfs {
    /// Format a region and leave it mounted. The initial checkpoint
    /// (version 1) is written before this returns.
    pub fn format(region: PmRegion, options: Options) -> Result<Arc<Pmlfs>> {
        try_init_logger();
        let layout = Arc::new(RegionLayout::carve(&region, DEFAULT_NAT_HEIGHT)?);
        info!(
            "formatting region: {} main segments of {} blocks",
            layout.main_segments(),
            BLOCKS_IN_SEGMENT
        );
        // Zero the metadata areas before anything references them.
        let meta_len = layout.main_base() as usize;
        memory::zero(region.base(), meta_len);
        persist::persist_range(region.base(), meta_len);

        let state = Arc::new(GlobalState::new(layout.main_blocks() as u64, false));
        let sm = SegmentManager::new(layout.clone(), state.clone(), 0);
        let node_seg = sm.free.get_new_segment(NULL_SEGNO)?;
        sm.init_curseg(CursegType::Node, node_seg, 0);
        let data_seg = sm.free.get_new_segment(node_seg)?;
        sm.init_curseg(CursegType::Data, data_seg, 0);

        let fs = Pmlfs {
            layout: layout.clone(),
            state,
            sm,
            cm: CheckpointManager::new(),
            // nid 0 is reserved: the orphan block format uses it as a
            // terminator.
            nat: NatManager::new(layout.nat_height(), BlockAddr::NULL, 1),
            op_lock: RwLock::new(()),
            gc: GcContext::new(),
            options,
            region,
        };
        fs.write_initial_checkpoint()?;
        let fs = Arc::new(fs);
        if *fs.options.bg_gc {
            crate::gc::spawn_gc_worker(&fs);
        }
        Ok(fs)
    }

    /// Mount a formatted region: heal the superblocks, pick the mount
    /// checkpoint, replay recovery state and rebuild the volatile tables.
    pub fn mount(region: PmRegion, options: Options) -> Result<Arc<Pmlfs>> {
        try_init_logger();
        heal_superblocks(&region)?;
        let sb = unsafe { raw_super(region.base(), 0) };
        let layout = Arc::new(RegionLayout::from_super(&region, sb)?);

        let head_addr = sb.cp_addr();
        if !layout.is_main_addr(head_addr) {
            error!("superblock head pointer {} is out of range", head_addr);
            return Err(FsError::Invalid);
        }
        let head = unsafe { crate::checkpoint::record::raw_cp(&layout, head_addr) };
        if !head.is_sealed() {
            error!("head checkpoint at {} fails its checksum", head_addr);
            return Err(FsError::Invalid);
        }

        let mnt_version = *options.mnt_cp_version;
        let read_only = *options.read_only || mnt_version != 0;
        let mount_addr = if mnt_version != 0 && head.version() != mnt_version {
            crate::checkpoint::find_checkpoint_on_ring(&layout, head_addr, mnt_version)
                .ok_or(FsError::Invalid)?
        } else {
            head_addr
        };

        let mount_raw = unsafe { crate::checkpoint::record::raw_cp(&layout, mount_addr) };
        let state = Arc::new(GlobalState::new(layout.main_blocks() as u64, read_only));
        let sm = SegmentManager::new(
            layout.clone(),
            state.clone(),
            u64::from_le(mount_raw.elapsed_time),
        );
        let fs = Pmlfs {
            layout: layout.clone(),
            state,
            sm,
            cm: CheckpointManager::new(),
            nat: NatManager::new(layout.nat_height(), BlockAddr::NULL, 1),
            op_lock: RwLock::new(()),
            gc: GcContext::new(),
            options,
            region,
        };
        fs.load_from_checkpoint(mount_addr)?;
        if !read_only {
            fs.check_checkpoint_state()?;
            fs.recover_orphan_inodes()?;
            fs.rebuild_free_map();
        }
        info!(
            "mounted at version {} ({})",
            fs.cm.last_version(),
            if read_only { "read-only" } else { "read-write" }
        );
        let fs = Arc::new(fs);
        if !read_only && *fs.options.bg_gc {
            crate::gc::spawn_gc_worker(&fs);
        }
        Ok(fs)
    }

    /// Stop the background worker and, on a writable mount, commit a
    /// final checkpoint.
    pub fn unmount(&self) -> Result<()> {
        crate::gc::stop_gc_worker(self);
        if !self.state.is_read_only() {
            self.write_checkpoint(false)?;
        }
        info!("unmounted at version {}", self.cm.last_version());
        Ok(())
    }

    pub fn is_read_only(&self) -> bool {
        self.state.is_read_only()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The mapped region this instance is bound to.
    pub fn region(&self) -> &PmRegion {
        &self.region
    }

    pub fn stats(&self) -> Stats {
        let free = self.sm.free.free_segments();
        let prefree = self.sm.free.prefree_segments();
        let total = self.layout.main_segments();
        let current = 2u32.min(total - free.min(total));
        let dirty = total
            .saturating_sub(free)
            .saturating_sub(prefree)
            .saturating_sub(current);
        Stats {
            valid_block_count: self.state.valid_block_count.load(Ordering::Relaxed),
            alloc_block_count: self.state.alloc_block_count.load(Ordering::Relaxed),
            valid_inode_count: self.state.valid_inode_count.load(Ordering::Relaxed),
            valid_node_count: self.state.valid_node_count.load(Ordering::Relaxed),
            user_block_count: self.state.user_block_count,
            free_segments: free,
            prefree_segments: prefree,
            dirty_segments: dirty,
            head_version: self.cm.last_version(),
        }
    }

    // ------------------------------------------------------------------
    // Node and data operations. Directory trees and the VFS adapter live
    // outside the core; these are the operations they drive.
    // ------------------------------------------------------------------

    fn check_writable(&self) -> Result<()> {
        if self.state.is_read_only() {
            return Err(FsError::ReadOnly);
        }
        Ok(())
    }

    /// Allocate a fresh inode backed by one node block of data pointers.
    pub fn create_inode(&self) -> Result<u32> {
        self.check_writable()?;
        let _op = self.op_lock.read().unwrap();
        let version = self.cm.new_version();
        let nid = self.nat.alloc_nid()?;
        let addr = self
            .sm
            .allocate_block(CursegType::Node, nid, 0, SumType::Inode, version)?;
        memory::zero(self.layout.addr(addr), BYTES_IN_BLOCK);
        persist::persist_range(self.layout.addr(addr), BYTES_IN_BLOCK);
        self.nat.set(nid, addr);
        self.state.valid_inode_count.fetch_add(1, Ordering::Relaxed);
        self.state.valid_node_count.fetch_add(1, Ordering::Relaxed);
        debug!("created inode {}", nid);
        Ok(nid)
    }

    /// Write one block of a file. Copy-on-write: a fresh block is
    /// allocated, the owner's pointer slot is redirected, and the old
    /// block is reclaimed unless an earlier checkpoint still publishes it.
    pub fn write_data_block(&self, ino: u32, index: u16, payload: &[u8]) -> Result<()> {
        if payload.len() > BYTES_IN_BLOCK || index as usize >= SLOTS_IN_BLOCK {
            return Err(FsError::Invalid);
        }
        self.check_writable()?;
        self.balance_fs()?;
        let _op = self.op_lock.read().unwrap();
        let version = self.cm.new_version();
        let node_addr = self.get_node_for_write(ino, version)?;
        let old = nat::read_slot(&self.layout, node_addr, index as usize);
        let new = self
            .sm
            .allocate_block(CursegType::Data, ino, index, SumType::Data, version)?;
        let dst = self.layout.addr(new);
        memory::zero(dst, BYTES_IN_BLOCK);
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), dst.to_mut_ptr::<u8>(), payload.len());
        }
        persist::persist_range(dst, BYTES_IN_BLOCK);
        nat::write_slot(&self.layout, node_addr, index as usize, new);
        self.retire_block(old)?;
        Ok(())
    }

    /// Read one block of a file as of the mounted head (or the working
    /// state on a writable mount).
    pub fn read_data_block(&self, ino: u32, index: u16, out: &mut [u8]) -> Result<()> {
        if out.len() > BYTES_IN_BLOCK || index as usize >= SLOTS_IN_BLOCK {
            return Err(FsError::Invalid);
        }
        let node = self.nat.lookup_current(&self.layout, ino);
        if node.is_null() {
            return Err(FsError::NoData);
        }
        let data = nat::read_slot(&self.layout, node, index as usize);
        if data.is_null() {
            return Err(FsError::NoData);
        }
        let src = self.layout.addr(data);
        unsafe {
            std::ptr::copy_nonoverlapping(src.to_ptr::<u8>(), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    /// Read one block of a file as of a historical checkpoint.
    pub fn read_data_block_at(
        &self,
        version: u32,
        ino: u32,
        index: u16,
        out: &mut [u8],
    ) -> Result<()> {
        if out.len() > BYTES_IN_BLOCK || index as usize >= SLOTS_IN_BLOCK {
            return Err(FsError::Invalid);
        }
        let info = self
            .cm
            .get_checkpoint_info(&self.layout, version, false)
            .ok_or(FsError::NoData)?;
        let node = self.nat.lookup_in(&self.layout, info.nat_root, ino);
        if node.is_null() {
            return Err(FsError::NoData);
        }
        let data = nat::read_slot(&self.layout, node, index as usize);
        if data.is_null() {
            return Err(FsError::NoData);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.layout.addr(data).to_ptr::<u8>(),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(())
    }

    /// Free an inode and all blocks it owns. Called when the last link and
    /// the last open handle are both gone, and by orphan replay.
    pub fn free_inode(&self, ino: u32) -> Result<()> {
        self.check_writable()?;
        let _op = self.op_lock.read().unwrap();
        self.free_inode_locked(ino)
    }

    pub(crate) fn free_inode_locked(&self, ino: u32) -> Result<()> {
        self.free_inode_blocks(ino, false)
    }

    /// `valid_only` is the recovery flavour: replay may run twice if a
    /// second crash lands before the next commit, and the already-cleared
    /// blocks were excluded from the recounted SIT.
    pub(crate) fn free_inode_blocks(&self, ino: u32, valid_only: bool) -> Result<()> {
        let node = self.nat.lookup_current(&self.layout, ino);
        if node.is_null() {
            return Err(FsError::NoData);
        }
        let reclaim = |addr: BlockAddr| -> Result<()> {
            if !valid_only || self.sm.summary_of(addr)?.valid {
                self.sm.invalidate_block(addr)?;
            }
            Ok(())
        };
        for slot in 0..SLOTS_IN_BLOCK {
            let data = nat::read_slot(&self.layout, node, slot);
            if !data.is_null() {
                reclaim(data)?;
            }
        }
        reclaim(node)?;
        self.nat.remove(ino);
        self.state.valid_inode_count.fetch_sub(1, Ordering::Relaxed);
        self.state.valid_node_count.fetch_sub(1, Ordering::Relaxed);
        debug!("freed inode {}", ino);
        Ok(())
    }

    /// Record that an open inode lost its last link.
    pub fn add_orphan_inode(&self, ino: u32) -> Result<()> {
        self.check_writable()?;
        self.cm.orphans.check_space()?;
        self.cm.orphans.add(ino);
        Ok(())
    }

    /// The inode was truly freed (or relinked); forget the orphan.
    pub fn remove_orphan_inode(&self, ino: u32) {
        self.cm.orphans.remove(ino);
    }

    // ------------------------------------------------------------------
    // Internals shared by the write path, the checkpoint manager and GC.
    // ------------------------------------------------------------------

    /// The owner node block of `ino`, copy-on-write'd into the current
    /// interval if an earlier checkpoint published it.
    pub(crate) fn get_node_for_write(&self, ino: u32, version: u32) -> Result<BlockAddr> {
        let cur = self.nat.lookup_current(&self.layout, ino);
        if cur.is_null() {
            return Err(FsError::NoData);
        }
        let sum = self.sm.summary_of(cur)?;
        if sum.start_version == version {
            return Ok(cur);
        }
        let new = self
            .sm
            .allocate_block(CursegType::Node, ino, 0, sum.ty, version)?;
        memory::copy(self.layout.addr(new), self.layout.addr(cur), BYTES_IN_BLOCK);
        persist::persist_range(self.layout.addr(new), BYTES_IN_BLOCK);
        self.nat.set(ino, new);
        self.retire_block(cur)?;
        Ok(new)
    }

    /// Drop a replaced block: reclaim it if it was never published,
    /// otherwise leave it to the checkpoint that still references it.
    pub(crate) fn retire_block(&self, addr: BlockAddr) -> Result<()> {
        if addr.is_null() {
            return Ok(());
        }
        let sum = self.sm.summary_of(addr)?;
        if sum.start_version == self.cm.new_version() {
            self.sm.invalidate_block(addr)?;
        }
        Ok(())
    }

    /// Run foreground GC when free space is under pressure. Called on the
    /// write path before taking the operation lock.
    pub(crate) fn balance_fs(&self) -> Result<()> {
        if self.sm.has_not_enough_free_segs() {
            self.garbage_collect(true)?;
        }
        Ok(())
    }

    /// Rebuild the free map from the SIT: a segment is in use iff it has
    /// valid blocks or hosts a stream.
    pub(crate) fn rebuild_free_map(&self) {
        let current: Vec<u32> = [CursegType::Node, CursegType::Data]
            .iter()
            .map(|ty| self.sm.curseg_info(*ty))
            .flat_map(|info| [info.segno, info.next_segno])
            .filter(|segno| *segno != NULL_SEGNO)
            .collect();
        let inuse: Vec<u32> = (0..self.layout.main_segments())
            .filter(|segno| self.sm.sit.get_valid_blocks(*segno) > 0 || current.contains(segno))
            .collect();
        self.sm.free.rebuild(inuse.into_iter());
    }
}

impl Drop for Pmlfs {
    fn drop(&mut self) {
        crate::gc::stop_gc_worker(self);
    }
}

/// Check the double-buffered superblocks and heal whichever copy is
/// behind. The primary is the authority when both verify.
pub(crate) fn heal_superblocks(region: &PmRegion) -> Result<()> {
    if region.size() < 2 * BYTES_IN_BLOCK {
        return Err(FsError::Invalid);
    }
    let primary = unsafe { raw_super(region.base(), 0) };
    let shadow = unsafe { raw_super(region.base(), 1) };
    match (primary.is_valid(), shadow.is_valid()) {
        (true, true) => {
            let pb = bytemuck::bytes_of(primary);
            let sb = bytemuck::bytes_of(shadow);
            if pb != sb {
                // Shadow lags a completed primary update.
                warn!("shadow superblock is behind; rewriting it");
                copy_superblock(region, 0, 1);
            }
            Ok(())
        }
        (true, false) => {
            warn!("shadow superblock is corrupt; rewriting it");
            copy_superblock(region, 0, 1);
            Ok(())
        }
        (false, true) => {
            warn!("primary superblock is corrupt; restoring from shadow");
            copy_superblock(region, 1, 0);
            Ok(())
        }
        (false, false) => {
            error!("both superblocks fail validation");
            Err(FsError::Invalid)
        }
    }
}

fn copy_superblock(region: &PmRegion, from: usize, to: usize) {
    let src = region.base() + from * BYTES_IN_BLOCK;
    let dst = region.base() + to * BYTES_IN_BLOCK;
    memory::copy(dst, src, std::mem::size_of::<RawSuperblock>());
    persist::persist_range(dst, std::mem::size_of::<RawSuperblock>());
}
