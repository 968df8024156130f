//! Mount-time recovery: diagnose the head checkpoint's state field and
//! drive the interrupted operation to a consistent end.

use crate::checkpoint::orphan;
use crate::checkpoint::record::{raw_cp, set_fs_state, store_ring_pointer, FsState};
use crate::layout::superblock::{raw_super, RawSuperblock};
use crate::pmlfs::Pmlfs;
use crate::util::constants::*;
use crate::util::persist;
use crate::util::{BlockAddr, Result};

impl Pmlfs {
    /// Dispatch on the head record's recovery state. Runs once per
    /// writable mount, before the first operation.
    pub(crate) fn check_checkpoint_state(&self) -> Result<()> {
        let head = self.cm.head_info();
        let state = unsafe { raw_cp(&self.layout, head.cp_addr) }.fs_state()?;
        match state {
            FsState::None => Ok(()),
            FsState::GcData { src, dst } | FsState::GcNode { src, dst } => {
                self.recover_gc_crash(src, dst)
            }
            FsState::CpGc { src, dst } => self.recovery_cp_gc(head.cp_addr, src, dst),
            FsState::AddCp { new_cp } => self.redo_checkpoint(head.cp_addr, new_cp),
        }
    }

    /// A commit was interrupted. If the new record is fully formed,
    /// complete the pointer swings (idempotent) and advance; otherwise
    /// the old head stays and the half-written record is garbage.
    pub(crate) fn redo_checkpoint(&self, prev_addr: BlockAddr, new_cp: BlockAddr) -> Result<()> {
        let prev_raw = unsafe { raw_cp(&self.layout, prev_addr) };
        let abandon = {
            if !self.layout.is_main_addr(new_cp) {
                true
            } else {
                let new_raw = unsafe { raw_cp(&self.layout, new_cp) };
                !new_raw.is_sealed()
                    || new_raw.version() != prev_raw.version() + 1
                    || new_raw.prev_addr() != prev_addr
            }
        };
        if abandon {
            warn!(
                "interrupted commit at {} never completed its record; keeping version {}",
                new_cp,
                prev_raw.version()
            );
            set_fs_state(&self.layout, prev_addr, FsState::None);
            // The stale allocations are invisible to the head's tables
            // and will be overwritten by the reopened streams.
            self.recount_sit_from_ssa();
            return Ok(());
        }

        let new_raw = unsafe { raw_cp(&self.layout, new_cp) };
        let version = new_raw.version();
        info!("completing interrupted commit of version {}", version);

        self.recovery_sit_entries(new_cp, true);
        let orphan_addrs: Vec<BlockAddr> = (0..NUM_ORPHAN_BLOCKS)
            .map(|i| new_raw.orphan_addr(i))
            .collect();
        self.publish_new_blocks(new_cp, new_raw.nat_root(), version, &orphan_addrs)?;
        self.connect_to_super(prev_addr, new_cp);
        set_fs_state(&self.layout, prev_addr, FsState::None);
        // Rebuild everything from the completed head.
        self.load_from_checkpoint(new_cp)
    }

    /// GC was relocating a checkpoint record. The destination either
    /// holds a complete copy (finish the splice) or the move never got
    /// far enough to matter (forget it).
    pub(crate) fn recovery_cp_gc(
        &self,
        head_addr: BlockAddr,
        src: BlockAddr,
        dst: BlockAddr,
    ) -> Result<()> {
        let complete = self.layout.is_main_addr(dst) && self.layout.is_main_addr(src) && {
            let src_raw = unsafe { raw_cp(&self.layout, src) };
            let dst_raw = unsafe { raw_cp(&self.layout, dst) };
            dst_raw.is_sealed() && dst_raw.version() == src_raw.version()
        };
        if !complete {
            warn!("abandoning interrupted relocation of checkpoint record {}", src);
            set_fs_state(&self.layout, head_addr, FsState::None);
            self.recount_sit_from_ssa();
            return Ok(());
        }

        let dst_raw = unsafe { raw_cp(&self.layout, dst) };
        info!(
            "completing interrupted relocation of checkpoint record {} -> {}",
            src, dst
        );
        self.sm.set_summary_valid(dst);
        store_ring_pointer(&self.layout, dst_raw.prev_addr(), true, dst);
        store_ring_pointer(&self.layout, dst_raw.next_addr(), false, dst);
        for i in 0..NUM_ORPHAN_BLOCKS {
            let block = dst_raw.orphan_addr(i);
            if !block.is_null() {
                orphan::set_orphan_backptr(&self.layout, block, dst);
            }
        }

        let sb = unsafe { raw_super(self.layout.base(), 0) };
        let head_moved = sb.cp_addr() == src;
        if head_moved {
            unsafe { sb.cp_addr_cell() }
                .store(dst.as_raw().to_le(), std::sync::atomic::Ordering::Release);
            persist::persist_u64(
                self.layout.base() + std::mem::offset_of!(RawSuperblock, cp_page_addr),
            );
            self.reseal_superblock();
            self.copy_super_to_shadow();
        }
        if self.sm.summary_of(src)?.valid {
            self.sm.invalidate_block(src)?;
        }
        // Clear the state on whichever record is the head now.
        let head_now = if head_moved { dst } else { head_addr };
        set_fs_state(&self.layout, head_now, FsState::None);
        self.load_from_checkpoint(head_now)?;
        self.recount_sit_from_ssa();
        Ok(())
    }

    /// Consume the head's orphan blocks: every listed inode lost its last
    /// link before the crash and is now truly freed.
    pub(crate) fn recover_orphan_inodes(&self) -> Result<()> {
        let head = self.cm.head_info();
        let raw = unsafe { raw_cp(&self.layout, head.cp_addr) };
        let mut recovered = 0u32;
        for i in 0..NUM_ORPHAN_BLOCKS {
            let block = raw.orphan_addr(i);
            if block.is_null() {
                break;
            }
            for ino in orphan::read_orphan_block(&self.layout, block) {
                // Replay may repeat if we crash again before the next
                // commit; only valid blocks are reclaimed.
                match self.free_inode_blocks(ino, true) {
                    Ok(()) => recovered += 1,
                    // Already gone; nothing left to do for it.
                    Err(crate::util::FsError::NoData) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        self.cm.orphans.clear();
        if recovered > 0 {
            info!("recovered {} orphan inodes", recovered);
        }
        Ok(())
    }
}
